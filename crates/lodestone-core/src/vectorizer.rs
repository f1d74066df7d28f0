//! Vectorization worker: turns pending catalog files into stored embeddings.
//!
//! Each poll pulls a bounded batch of not-yet-embedded files through the
//! driver socket, runs the embedding service on their archived content, and
//! stores the resulting chunk vectors. Service calls sit behind a circuit
//! breaker; repeated empty polls back off to a longer idle delay so a quiet
//! catalog is not busy-polled.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, with_backoff};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::driver::DriverClient;
use crate::error::Result;
use crate::storage::PendingFile;

// =====
// Embedding service surface
// =====

/// Failures from the embedding service.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of an embedding backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    pub name: String,
    pub dimension: usize,
}

/// An embedding service: chunks a document and returns one vector per chunk.
///
/// Implementations may block; the worker always calls them off the async
/// runtime.
pub trait Embedder: Send + Sync {
    fn info(&self) -> EmbedderInfo;
    fn embed_chunks(&self, text: &str) -> std::result::Result<Vec<Vec<f32>>, EmbedError>;
}

// =====
// FNV-1a feature-hashing embedder
// =====

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Deterministic local embedder using FNV-1a n-gram feature hashing.
/// No model download, no network; the default backend when nothing
/// better is configured.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    ngram_range: (usize, usize),
    chunk_chars: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "dimension must be > 0");
        Self {
            dimension,
            ngram_range: (3, 4),
            chunk_chars: 2048,
        }
    }

    #[must_use]
    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        assert!(chunk_chars > 0, "chunk_chars must be > 0");
        self.chunk_chars = chunk_chars;
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        if chars.is_empty() {
            return vector;
        }
        for n in self.ngram_range.0..=self.ngram_range.1 {
            if n > chars.len() {
                continue;
            }
            for window in chars.windows(n) {
                let ngram: String = window.iter().collect();
                let h = fnv1a(ngram.as_bytes());
                let bucket = (h as usize) % self.dimension;
                let sign = if (h >> 32) & 1 == 0 { 1.0f32 } else { -1.0f32 };
                vector[bucket] += sign;
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

impl Embedder for HashEmbedder {
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: format!("fnv1a-hash-{}", self.dimension),
            dimension: self.dimension,
        }
    }

    fn embed_chunks(&self, text: &str) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        Ok(chunk_lines(text, self.chunk_chars)
            .iter()
            .map(|chunk| self.embed_one(chunk))
            .collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Split text into chunks of roughly `max_chars`, breaking on line
/// boundaries. A single line longer than `max_chars` becomes its own chunk.
/// Empty or whitespace-only text yields no chunks.
fn chunk_lines(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

// =====
// Configuration
// =====

/// Vectorization settings, deserialized from the `[vectorization]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizationConfig {
    /// Whether `serve` starts this worker.
    pub enabled: bool,
    /// Files pulled per poll.
    pub batch_size: usize,
    /// Pause between polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close the circuit.
    pub success_threshold: u32,
    /// Cooldown before an open circuit admits a probe, in milliseconds.
    pub recovery_timeout_ms: u64,
    /// First retry delay for a failed service call, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Multiplier applied to each subsequent retry delay.
    pub backoff_multiplier: f64,
    /// Retry delay ceiling, in milliseconds.
    pub max_backoff_ms: u64,
    /// Attempts per service call before giving up on a file.
    pub max_attempts: u32,
    /// Empty polls before the idle delay stops growing.
    pub max_empty_iterations: u32,
    /// Idle delay ceiling once the catalog stays quiet, in milliseconds.
    pub empty_delay_ms: u64,
}

impl Default for VectorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 16,
            poll_interval_ms: 5_000,
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 30_000,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            max_attempts: 3,
            max_empty_iterations: 10,
            empty_delay_ms: 60_000,
        }
    }
}

impl VectorizationConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_millis(self.recovery_timeout_ms),
        )
    }

    fn embed_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
            0.1,
            Some(self.max_attempts.max(1)),
        )
    }

    /// Idle delay after `empty_iterations` consecutive empty polls: grows
    /// linearly from the poll interval, capped at `empty_delay_ms` once the
    /// counter reaches `max_empty_iterations`.
    #[must_use]
    pub fn idle_delay(&self, empty_iterations: u32) -> Duration {
        if empty_iterations == 0 {
            return self.poll_interval();
        }
        let cap = Duration::from_millis(self.empty_delay_ms);
        if empty_iterations >= self.max_empty_iterations {
            return cap.max(self.poll_interval());
        }
        self.poll_interval()
            .saturating_mul(empty_iterations)
            .min(cap)
            .max(self.poll_interval())
    }
}

// =====
// Worker
// =====

/// Outcome of one vectorization poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub chunks_stored: u64,
    pub empty: bool,
    pub circuit_open: bool,
    pub interrupted: bool,
}

/// The vectorization worker. Owns a driver client, an embedding backend,
/// and the circuit breaker guarding it.
pub struct VectorizationWorker {
    config: VectorizationConfig,
    client: DriverClient,
    embedder: Arc<dyn Embedder>,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for VectorizationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorizationWorker")
            .field("model", &self.embedder.info().name)
            .finish_non_exhaustive()
    }
}

impl VectorizationWorker {
    #[must_use]
    pub fn new(
        config: VectorizationConfig,
        client: DriverClient,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let breaker = CircuitBreaker::with_name("embedding", config.breaker_config());
        Self {
            config,
            client,
            embedder,
            breaker,
        }
    }

    /// Current circuit breaker status, for status output and logs.
    #[must_use]
    pub fn breaker_status(&self) -> CircuitBreakerStatus {
        self.breaker.status()
    }

    /// Poll repeatedly until `shutdown` flips. A failed poll is logged and
    /// retried on the next interval.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(
            model = %self.embedder.info().name,
            batch_size = self.config.batch_size,
            "Vectorization worker started"
        );
        let mut empty_iterations: u32 = 0;
        while !shutdown.load(Ordering::SeqCst) {
            let delay = match self.poll_once(&shutdown).await {
                Ok(report) if report.circuit_open => {
                    debug!("Embedding circuit open; skipping poll");
                    self.config.poll_interval()
                }
                Ok(report) if report.empty => {
                    empty_iterations = empty_iterations.saturating_add(1);
                    self.config.idle_delay(empty_iterations)
                }
                Ok(report) => {
                    empty_iterations = 0;
                    info!(
                        processed = report.files_processed,
                        failed = report.files_failed,
                        chunks = report.chunks_stored,
                        "Vectorization batch finished"
                    );
                    self.config.poll_interval()
                }
                Err(err) => {
                    warn!(error = %err, "Vectorization poll failed");
                    self.config.poll_interval()
                }
            };
            idle(&shutdown, delay).await;
        }
        info!("Vectorization worker stopped");
    }

    /// Pull one batch of pending files and embed them.
    ///
    /// Fails only when the catalog is unreachable; per-file embedding and
    /// store problems are counted in the report. The circuit breaker records
    /// one outcome per file, after internal retries are exhausted.
    pub async fn poll_once(&mut self, shutdown: &Arc<AtomicBool>) -> Result<PollReport> {
        let mut report = PollReport::default();

        if !self.breaker.allow() {
            report.circuit_open = true;
            return Ok(report);
        }

        let pending = self.client.pending_embeddings(self.config.batch_size).await?;
        if pending.is_empty() {
            report.empty = true;
            return Ok(report);
        }

        let model = self.embedder.info();
        for file in pending {
            if shutdown.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            if !self.breaker.allow() {
                report.files_skipped += 1;
                continue;
            }
            match self.embed_file(&file).await {
                Ok(chunks) => {
                    self.breaker.record_success();
                    let stored = chunks.len() as u64;
                    match self
                        .client
                        .store_embedding(file.file_id, &model.name, model.dimension, chunks)
                        .await
                    {
                        Ok(()) => {
                            report.files_processed += 1;
                            report.chunks_stored += stored;
                        }
                        Err(err) => {
                            report.files_failed += 1;
                            warn!(path = %file.path, error = %err, "Failed to store embedding");
                        }
                    }
                }
                Err(err) => {
                    self.breaker.record_failure();
                    report.files_failed += 1;
                    warn!(path = %file.path, error = %err, "Embedding failed");
                }
            }
        }
        Ok(report)
    }

    /// Read the file's archived content and embed it, retrying the service
    /// call with exponential backoff.
    async fn embed_file(
        &self,
        file: &PendingFile,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        let text = {
            let live = file.path.clone();
            let version = file.version_path.clone();
            tokio::task::spawn_blocking(move || read_content(&live, version.as_deref()))
                .await
                .map_err(|err| EmbedError::InferenceFailed(format!("read task failed: {err}")))??
        };

        let policy = self.config.embed_backoff();
        let embedder = Arc::clone(&self.embedder);
        let chunks = with_backoff(&policy, "embed_chunks", move || {
            let embedder = Arc::clone(&embedder);
            let text = text.clone();
            async move {
                tokio::task::spawn_blocking(move || embedder.embed_chunks(&text))
                    .await
                    .map_err(|err| EmbedError::InferenceFailed(format!("embed task failed: {err}")))?
            }
        })
        .await?;

        let expected = self.embedder.info().dimension;
        for chunk in &chunks {
            if chunk.len() != expected {
                return Err(EmbedError::DimensionMismatch {
                    expected,
                    actual: chunk.len(),
                });
            }
        }
        Ok(chunks)
    }
}

/// The version archive holds the exact bytes the catalog hash refers to;
/// prefer it over the live path, which may have moved on since ingest.
fn read_content(live_path: &str, version_path: Option<&str>) -> std::io::Result<String> {
    if let Some(version) = version_path {
        if Path::new(version).exists() {
            return Ok(String::from_utf8_lossy(&fs::read(version)?).into_owned());
        }
    }
    Ok(String::from_utf8_lossy(&fs::read(live_path)?).into_owned())
}

async fn idle(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
}
