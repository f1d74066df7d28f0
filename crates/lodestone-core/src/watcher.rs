//! Periodic filesystem scanner that keeps the file catalog current.
//!
//! On each pass the watcher walks the configured roots, discovers logical
//! projects by marker files, and reconciles what it finds on disk against
//! the catalog through the driver socket. File content is copied into the
//! version archive at ingest time, so a soft delete only records the
//! archive path it already knows and never has to touch vanished bytes.
//!
//! Delete detection runs only after a walk that covered the whole project;
//! a walk cut short by the scan deadline or a shutdown request must not
//! mistake unvisited files for removed ones.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fs2::FileExt;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::driver::DriverClient;
use crate::error::{Error, Result};
use crate::storage::{FileRecord, FileUpsert};

/// Pause between scan passes when the config does not say otherwise.
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 10_000;
/// Upper bound on a single scan pass.
pub const DEFAULT_MAX_SCAN_DURATION_MS: u64 = 30_000;
/// Files above this size stay out of the catalog.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024;

const CATALOG_PAGE: usize = 500;

// =====
// Configuration
// =====

/// File watcher settings, deserialized from the `[watcher]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether `serve` starts this worker.
    pub enabled: bool,
    /// Root directories to scan for projects.
    pub roots: Vec<PathBuf>,
    /// Pause between scan passes, in milliseconds.
    pub scan_interval_ms: u64,
    /// File or directory names whose presence marks a project root.
    pub marker_files: Vec<String>,
    /// Ignore patterns. A bare name matches any path segment; a pattern
    /// containing a separator matches the path relative to the project root.
    pub ignore: Vec<String>,
    /// Archive directory for ingested file content. Derived when unset.
    pub version_dir: Option<PathBuf>,
    /// Shared directory holding per-project scan locks. Derived when unset.
    pub lock_dir: Option<PathBuf>,
    /// Upper bound on one scan pass, in milliseconds.
    pub max_scan_duration_ms: u64,
    /// Files larger than this are skipped.
    pub max_file_size_bytes: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            roots: Vec::new(),
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            marker_files: default_marker_files(),
            ignore: default_ignore(),
            version_dir: None,
            lock_dir: None,
            max_scan_duration_ms: DEFAULT_MAX_SCAN_DURATION_MS,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
        }
    }
}

impl WatcherConfig {
    /// Effective version archive directory.
    #[must_use]
    pub fn version_dir(&self) -> PathBuf {
        self.version_dir.clone().unwrap_or_else(default_version_dir)
    }

    /// Effective scan lock directory.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(default_lock_dir)
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    #[must_use]
    pub fn max_scan_duration(&self) -> Duration {
        Duration::from_millis(self.max_scan_duration_ms)
    }
}

fn default_marker_files() -> Vec<String> {
    [".git", "Cargo.toml", "package.json", "pyproject.toml", "go.mod"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_ignore() -> Vec<String> {
    [
        ".git",
        "target",
        "node_modules",
        "__pycache__",
        ".venv",
        "dist",
        "*.pyc",
        "*.swp",
        "*.tmp",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_version_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lodestone")
        .join("versions")
}

fn default_lock_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lodestone")
        .join("locks")
}

// =====
// Ignore patterns
// =====

#[derive(Debug, Default)]
struct IgnoreSet {
    names: Vec<Pattern>,
    paths: Vec<Pattern>,
}

impl IgnoreSet {
    fn compile(patterns: &[String]) -> Self {
        let mut set = Self::default();
        for raw in patterns {
            match Pattern::new(raw) {
                Ok(pattern) if raw.contains('/') => set.paths.push(pattern),
                Ok(pattern) => set.names.push(pattern),
                Err(err) => {
                    warn!(pattern = %raw, error = %err, "Skipping invalid ignore pattern");
                }
            }
        }
        set
    }

    fn matches(&self, rel: &Path, name: &str) -> bool {
        self.names.iter().any(|p| p.matches(name))
            || self.paths.iter().any(|p| p.matches_path(rel))
    }
}

// =====
// Project discovery
// =====

/// One logical project found under a watch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProject {
    pub name: String,
    pub root: PathBuf,
}

fn has_marker(dir: &Path, markers: &[String]) -> bool {
    markers.iter().any(|marker| dir.join(marker).exists())
}

/// Find project roots under `root`. A marked directory becomes a project
/// and is not searched for nested projects, so discovered roots are
/// disjoint subtrees.
fn discover_project_roots(
    root: &Path,
    markers: &[String],
    ignore: &IgnoreSet,
    deadline: Instant,
) -> (Vec<PathBuf>, bool) {
    if !root.is_dir() {
        warn!(root = %root.display(), "Watch root is not a directory");
        return (Vec::new(), false);
    }
    if has_marker(root, markers) {
        return (vec![root.to_path_buf()], false);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        if Instant::now() >= deadline {
            return (found, true);
        }
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "Unreadable directory during discovery");
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if ignore.matches(&rel, &name) {
                continue;
            }
            if has_marker(&path, markers) {
                found.push(path);
            } else {
                queue.push_back(path);
            }
        }
    }
    (found, false)
}

/// Name projects after their directory; when two discovered roots share a
/// directory name, both get a short path-hash suffix so catalog rows stay
/// attributable.
fn assign_project_names(mut roots: Vec<PathBuf>) -> Vec<DiscoveredProject> {
    roots.sort();
    roots.dedup();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for root in &roots {
        *counts.entry(dir_name(root)).or_default() += 1;
    }

    roots
        .into_iter()
        .map(|root| {
            let base = dir_name(&root);
            let name = if counts[&base] > 1 {
                format!("{base}-{}", short_path_hash(&root))
            } else {
                base
            };
            DiscoveredProject { name, root }
        })
        .collect()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
}

fn short_path_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(digest)[..8].to_string()
}

// =====
// Per-project scan lock
// =====

/// Exclusive scan lock for one project, shared across watcher processes
/// through the lock directory. Released when dropped.
struct ScanLock {
    _file: File,
}

impl ScanLock {
    /// Returns `Ok(None)` when another scanner already holds the lock.
    fn try_acquire(lock_dir: &Path, project: &DiscoveredProject) -> Result<Option<Self>> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(lock_file_name(project));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(project = %project.name, lock = %path.display(), "Acquired scan lock");
                Ok(Some(Self { _file: file }))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// Lock names derive from the project root path alone, so every scanner
/// maps the same directory to the same lock file.
fn lock_file_name(project: &DiscoveredProject) -> String {
    format!(
        "{}-{}.lock",
        sanitize_stem(&dir_name(&project.root)),
        short_path_hash(&project.root)
    )
}

fn sanitize_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if stem.is_empty() {
        "project".to_string()
    } else {
        stem
    }
}

// =====
// Disk walk and content archival
// =====

#[derive(Debug)]
struct DiskFile {
    abs: PathBuf,
    size_bytes: u64,
    mtime_ms: i64,
}

#[derive(Debug, Default)]
struct WalkOutcome {
    files: Vec<DiskFile>,
    truncated: bool,
    errors: u64,
}

fn walk_project(
    root: &Path,
    ignore: &IgnoreSet,
    deadline: Instant,
    cancel: &AtomicBool,
) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        if Instant::now() >= deadline || cancel.load(Ordering::SeqCst) {
            outcome.truncated = true;
            return outcome;
        }
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                outcome.errors += 1;
                debug!(dir = %dir.display(), error = %err, "Unreadable directory during walk");
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else {
                outcome.errors += 1;
                continue;
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if ignore.matches(&rel, &name) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                outcome.errors += 1;
                continue;
            };
            if file_type.is_dir() {
                queue.push_back(path);
                continue;
            }
            if !file_type.is_file() {
                // symlinks, sockets, fifos
                continue;
            }
            match entry.metadata() {
                Ok(metadata) => outcome.files.push(DiskFile {
                    abs: path,
                    size_bytes: metadata.len(),
                    mtime_ms: mtime_ms(&metadata),
                }),
                Err(err) => {
                    outcome.errors += 1;
                    debug!(path = %path.display(), error = %err, "Failed to stat file");
                }
            }
        }
    }
    outcome
}

fn mtime_ms(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

#[derive(Debug)]
struct HashedFile {
    abs: PathBuf,
    size_bytes: u64,
    mtime_ms: i64,
    content_hash: String,
    version_path: PathBuf,
}

#[derive(Debug, Default)]
struct HashOutcome {
    files: Vec<HashedFile>,
    skipped: u64,
    errors: u64,
}

/// Hash each candidate and copy its content into the version archive.
/// The archive is content-addressed, so re-ingesting identical bytes
/// costs one existence check.
fn hash_and_archive(batch: Vec<DiskFile>, version_dir: &Path, max_bytes: u64) -> HashOutcome {
    let mut outcome = HashOutcome::default();
    for file in batch {
        if file.size_bytes > max_bytes {
            outcome.skipped += 1;
            debug!(
                path = %file.abs.display(),
                size_bytes = file.size_bytes,
                "Skipping oversized file"
            );
            continue;
        }
        let bytes = match fs::read(&file.abs) {
            Ok(bytes) => bytes,
            Err(err) => {
                outcome.errors += 1;
                debug!(path = %file.abs.display(), error = %err, "Failed to read file");
                continue;
            }
        };
        let content_hash = hex::encode(Sha256::digest(&bytes));
        let version_path = match archive_content(version_dir, &content_hash, &bytes) {
            Ok(path) => path,
            Err(err) => {
                outcome.errors += 1;
                warn!(path = %file.abs.display(), error = %err, "Failed to archive file content");
                continue;
            }
        };
        outcome.files.push(HashedFile {
            abs: file.abs,
            size_bytes: bytes.len() as u64,
            mtime_ms: file.mtime_ms,
            content_hash,
            version_path,
        });
    }
    outcome
}

fn archive_content(version_dir: &Path, content_hash: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let shard = version_dir.join(&content_hash[..2]);
    let dest = shard.join(content_hash);
    if dest.exists() {
        return Ok(dest);
    }
    fs::create_dir_all(&shard)?;
    let tmp = shard.join(format!(".{}.{}.tmp", &content_hash[..12], std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &dest)?;
    Ok(dest)
}

// =====
// Scan reports
// =====

/// Aggregate result of one scan pass across every root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub projects_found: usize,
    pub projects_scanned: usize,
    pub projects_skipped: usize,
    pub files_seen: u64,
    pub files_upserted: u64,
    pub files_deleted: u64,
    pub files_skipped: u64,
    pub errors: u64,
    pub truncated: bool,
    pub interrupted: bool,
}

impl ScanReport {
    fn absorb(&mut self, scan: &ProjectScan) {
        self.files_seen += scan.files_seen;
        self.files_upserted += scan.files_upserted;
        self.files_deleted += scan.files_deleted;
        self.files_skipped += scan.files_skipped;
        self.errors += scan.errors;
        self.truncated |= scan.truncated;
    }
}

#[derive(Debug, Default)]
struct ProjectScan {
    files_seen: u64,
    files_upserted: u64,
    files_deleted: u64,
    files_skipped: u64,
    errors: u64,
    truncated: bool,
}

// =====
// Watcher
// =====

/// The file watcher worker. Owns a driver client and scans on an interval
/// until the shutdown flag flips.
#[derive(Debug)]
pub struct FileWatcher {
    config: WatcherConfig,
    client: DriverClient,
    ignore: Arc<IgnoreSet>,
}

impl FileWatcher {
    #[must_use]
    pub fn new(config: WatcherConfig, client: DriverClient) -> Self {
        let ignore = Arc::new(IgnoreSet::compile(&config.ignore));
        Self {
            config,
            client,
            ignore,
        }
    }

    /// Scan repeatedly until `shutdown` flips. A failed pass is logged and
    /// retried on the next interval; the loop itself never gives up.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(
            roots = self.config.roots.len(),
            interval_ms = self.config.scan_interval_ms,
            "File watcher started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.scan_once(&shutdown).await {
                Ok(report) => {
                    info!(
                        projects = report.projects_scanned,
                        seen = report.files_seen,
                        upserted = report.files_upserted,
                        deleted = report.files_deleted,
                        errors = report.errors,
                        truncated = report.truncated,
                        "Scan pass finished"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "Scan pass failed");
                }
            }
            idle(&shutdown, self.config.scan_interval()).await;
        }
        info!("File watcher stopped");
    }

    /// Run one scan pass over every configured root.
    ///
    /// Fails only when the catalog itself is unreachable; per-project and
    /// per-file problems are counted in the report instead.
    pub async fn scan_once(&mut self, shutdown: &Arc<AtomicBool>) -> Result<ScanReport> {
        let deadline = Instant::now() + self.config.max_scan_duration();
        let mut report = ScanReport::default();

        let (projects, discovery_truncated) = self.discover_all(deadline).await?;
        report.truncated |= discovery_truncated;
        report.projects_found = projects.len();

        let catalog = self.load_catalog().await?;
        let lock_dir = self.config.lock_dir();

        for project in &projects {
            if shutdown.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            if Instant::now() >= deadline {
                report.truncated = true;
                warn!(project = %project.name, "Scan deadline reached before project");
                break;
            }
            match ScanLock::try_acquire(&lock_dir, project) {
                Ok(Some(_lock)) => {
                    match self.scan_project(project, &catalog, deadline, shutdown).await {
                        Ok(scan) => {
                            report.absorb(&scan);
                            report.projects_scanned += 1;
                        }
                        Err(err) => {
                            report.errors += 1;
                            warn!(project = %project.name, error = %err, "Project scan failed");
                        }
                    }
                }
                Ok(None) => {
                    report.projects_skipped += 1;
                    debug!(project = %project.name, "Another scan holds the project lock");
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(project = %project.name, error = %err, "Failed to acquire scan lock");
                }
            }
        }
        report.interrupted |= shutdown.load(Ordering::SeqCst);
        Ok(report)
    }

    async fn discover_all(&self, deadline: Instant) -> Result<(Vec<DiscoveredProject>, bool)> {
        let roots = self.config.roots.clone();
        let markers = self.config.marker_files.clone();
        let ignore = Arc::clone(&self.ignore);
        let (found, truncated) = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let mut truncated = false;
            for root in &roots {
                let (mut project_roots, cut) =
                    discover_project_roots(root, &markers, &ignore, deadline);
                found.append(&mut project_roots);
                truncated |= cut;
            }
            (found, truncated)
        })
        .await
        .map_err(|err| Error::Runtime(format!("project discovery task failed: {err}")))?;
        Ok((assign_project_names(found), truncated))
    }

    /// Pull the whole catalog once per pass, soft-deleted rows included,
    /// keyed by path.
    async fn load_catalog(&mut self) -> Result<HashMap<String, FileRecord>> {
        let mut map = HashMap::new();
        let mut offset = 0;
        loop {
            let page = self
                .client
                .list_files(None, offset, CATALOG_PAGE, true)
                .await?;
            let fetched = page.len();
            for row in page {
                map.insert(row.path.clone(), row);
            }
            if fetched < CATALOG_PAGE {
                break;
            }
            offset += fetched;
        }
        Ok(map)
    }

    async fn scan_project(
        &mut self,
        project: &DiscoveredProject,
        catalog: &HashMap<String, FileRecord>,
        deadline: Instant,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<ProjectScan> {
        let root = project.root.clone();
        let ignore = Arc::clone(&self.ignore);
        let cancel = Arc::clone(shutdown);
        let walk =
            tokio::task::spawn_blocking(move || walk_project(&root, &ignore, deadline, &cancel))
                .await
                .map_err(|err| Error::Runtime(format!("walk task failed: {err}")))?;

        let mut scan = ProjectScan {
            files_seen: walk.files.len() as u64,
            errors: walk.errors,
            truncated: walk.truncated,
            ..ProjectScan::default()
        };

        // A file is rehashed when the catalog has never seen it, believes
        // it deleted, or disagrees about size or mtime.
        let mut on_disk = HashSet::new();
        let mut to_hash = Vec::new();
        for file in walk.files {
            let key = file.abs.to_string_lossy().into_owned();
            match catalog.get(&key) {
                Some(row)
                    if !row.deleted
                        && row.size_bytes == file.size_bytes
                        && row.mtime_ms == file.mtime_ms => {}
                _ => to_hash.push(file),
            }
            on_disk.insert(key);
        }

        let version_dir = self.config.version_dir();
        let max_bytes = self.config.max_file_size_bytes;
        let hashed =
            tokio::task::spawn_blocking(move || hash_and_archive(to_hash, &version_dir, max_bytes))
                .await
                .map_err(|err| Error::Runtime(format!("hash task failed: {err}")))?;
        scan.files_skipped += hashed.skipped;
        scan.errors += hashed.errors;

        for file in hashed.files {
            let key = file.abs.to_string_lossy().into_owned();
            if let Some(row) = catalog.get(&key) {
                // mtime drifted but the bytes did not
                if !row.deleted && row.content_hash == file.content_hash {
                    continue;
                }
            }
            let upsert = FileUpsert {
                project: project.name.clone(),
                path: key,
                size_bytes: file.size_bytes,
                mtime_ms: file.mtime_ms,
                content_hash: file.content_hash,
                version_path: Some(file.version_path.to_string_lossy().into_owned()),
            };
            let path = upsert.path.clone();
            match self.client.upsert_file(upsert).await {
                Ok(_) => scan.files_upserted += 1,
                Err(err) => {
                    scan.errors += 1;
                    warn!(path = %path, error = %err, "Upsert failed");
                }
            }
        }

        if scan.truncated || shutdown.load(Ordering::SeqCst) {
            debug!(project = %project.name, "Skipping delete detection on a partial walk");
            return Ok(scan);
        }

        let prefix = format!(
            "{}{}",
            project.root.to_string_lossy(),
            std::path::MAIN_SEPARATOR
        );
        for (path, row) in catalog {
            if row.deleted || !path.starts_with(&prefix) || on_disk.contains(path) {
                continue;
            }
            match self.client.mark_deleted(path, None).await {
                Ok(true) => scan.files_deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    scan.errors += 1;
                    warn!(path = %path, error = %err, "Soft delete failed");
                }
            }
        }
        Ok(scan)
    }
}

async fn idle(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::driver::DriverServer;
    use tempfile::TempDir;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(10),
            1.0,
            0.0,
            Some(2),
        )
    }

    fn no_shutdown() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn test_config(dir: &TempDir, root: &Path) -> WatcherConfig {
        WatcherConfig {
            roots: vec![root.to_path_buf()],
            version_dir: Some(dir.path().join("versions")),
            lock_dir: Some(dir.path().join("locks")),
            ..WatcherConfig::default()
        }
    }

    async fn start_driver(
        dir: &TempDir,
    ) -> (PathBuf, tokio::task::JoinHandle<Result<()>>) {
        let socket_path = dir.path().join("driver.sock");
        let db_path = dir.path().join("catalog.db");
        let server = tokio::spawn(DriverServer::new(db_path, socket_path.clone()).run());
        for _ in 0..200 {
            if socket_path.exists() {
                return (socket_path, server);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("driver socket never appeared");
    }

    fn client_for(socket: &Path) -> DriverClient {
        DriverClient::new(socket).with_connect_backoff(fast_backoff())
    }

    /// Fixture: one project under `<dir>/ws/app` with two source files.
    fn app_fixture(dir: &TempDir) -> PathBuf {
        let ws = dir.path().join("ws");
        write_file(&ws.join("app/Cargo.toml"), "[package]\nname = \"app\"\n");
        write_file(&ws.join("app/src/main.rs"), "fn main() {}\n");
        ws
    }

    // ---- Ignore patterns ----

    #[test]
    fn bare_names_match_segments_and_path_patterns_match_rel() {
        let set = IgnoreSet::compile(&[
            "target".to_string(),
            "*.swp".to_string(),
            "docs/**".to_string(),
        ]);
        assert!(set.matches(Path::new("target"), "target"));
        assert!(set.matches(Path::new("deep/target"), "target"));
        assert!(set.matches(Path::new("a/.file.swp"), ".file.swp"));
        assert!(set.matches(Path::new("docs/guide.md"), "guide.md"));
        assert!(!set.matches(Path::new("src/main.rs"), "main.rs"));
    }

    #[test]
    fn invalid_patterns_are_dropped() {
        let set = IgnoreSet::compile(&["[".to_string()]);
        assert!(!set.matches(Path::new("["), "["));
    }

    // ---- Project discovery ----

    #[test]
    fn marker_at_root_yields_single_project() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("Cargo.toml"), "[package]\n");
        write_file(&dir.path().join("nested/Cargo.toml"), "[package]\n");

        let ignore = IgnoreSet::compile(&default_ignore());
        let deadline = Instant::now() + Duration::from_secs(5);
        let (roots, truncated) =
            discover_project_roots(dir.path(), &default_marker_files(), &ignore, deadline);
        assert!(!truncated);
        assert_eq!(roots, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn nested_markers_become_separate_projects() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a/Cargo.toml"), "[package]\n");
        write_file(&dir.path().join("b/c/package.json"), "{}");
        write_file(&dir.path().join("plain/readme.md"), "n/a");

        let ignore = IgnoreSet::compile(&default_ignore());
        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut roots, truncated) =
            discover_project_roots(dir.path(), &default_marker_files(), &ignore, deadline);
        roots.sort();
        assert!(!truncated);
        assert_eq!(
            roots,
            vec![dir.path().join("a"), dir.path().join("b/c")]
        );
    }

    #[test]
    fn duplicate_project_names_get_path_hashes() {
        let projects = assign_project_names(vec![
            PathBuf::from("/w/x/app"),
            PathBuf::from("/w/y/app"),
            PathBuf::from("/w/solo"),
        ]);
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"solo"));
        assert_eq!(names.iter().filter(|n| n.starts_with("app-")).count(), 2);
        assert_ne!(projects[0].name, projects[1].name);
        for name in names {
            if let Some(suffix) = name.strip_prefix("app-") {
                assert_eq!(suffix.len(), 8);
            }
        }
    }

    #[test]
    fn missing_root_is_tolerated() {
        let ignore = IgnoreSet::compile(&[]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let (roots, truncated) = discover_project_roots(
            Path::new("/nonexistent/lodestone-test"),
            &default_marker_files(),
            &ignore,
            deadline,
        );
        assert!(roots.is_empty());
        assert!(!truncated);
    }

    // ---- Walking ----

    #[test]
    fn walk_skips_ignored_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("src/main.rs"), "fn main() {}\n");
        write_file(&dir.path().join("target/debug/out"), "bin");
        write_file(&dir.path().join("notes.swp"), "swap");

        let ignore = IgnoreSet::compile(&default_ignore());
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = walk_project(dir.path(), &ignore, deadline, &AtomicBool::new(false));
        assert!(!outcome.truncated);
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.files[0].abs.ends_with("src/main.rs"));
        assert!(outcome.files[0].size_bytes > 0);
        assert!(outcome.files[0].mtime_ms > 0);
    }

    #[test]
    fn walk_truncates_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), "a");

        let ignore = IgnoreSet::compile(&[]);
        let outcome = walk_project(dir.path(), &ignore, Instant::now(), &AtomicBool::new(false));
        assert!(outcome.truncated);
        assert!(outcome.files.is_empty());
    }

    #[test]
    fn walk_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), "a");

        let ignore = IgnoreSet::compile(&[]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = walk_project(dir.path(), &ignore, deadline, &AtomicBool::new(true));
        assert!(outcome.truncated);
    }

    // ---- Archival ----

    #[test]
    fn archive_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let versions = dir.path().join("versions");
        write_file(&dir.path().join("x.txt"), "same bytes");
        write_file(&dir.path().join("y.txt"), "same bytes");

        let batch = vec![
            DiskFile {
                abs: dir.path().join("x.txt"),
                size_bytes: 10,
                mtime_ms: 1,
            },
            DiskFile {
                abs: dir.path().join("y.txt"),
                size_bytes: 10,
                mtime_ms: 2,
            },
        ];
        let outcome = hash_and_archive(batch, &versions, u64::MAX);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.files[0].version_path, outcome.files[1].version_path);
        assert_eq!(outcome.files[0].content_hash, outcome.files[1].content_hash);

        let archived = fs::read_to_string(&outcome.files[0].version_path).unwrap();
        assert_eq!(archived, "same bytes");
        // shard layout: <first two hash chars>/<hash>
        let shard = outcome.files[0].version_path.parent().unwrap();
        assert_eq!(
            shard.file_name().unwrap().to_string_lossy(),
            outcome.files[0].content_hash[..2]
        );
    }

    #[test]
    fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("big.bin"), "hello world");

        let batch = vec![DiskFile {
            abs: dir.path().join("big.bin"),
            size_bytes: 11,
            mtime_ms: 1,
        }];
        let outcome = hash_and_archive(batch, &dir.path().join("versions"), 4);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.files.is_empty());
    }

    // ---- Scan locks ----

    #[test]
    fn scan_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let project = DiscoveredProject {
            name: "app".to_string(),
            root: dir.path().join("app"),
        };

        let first = ScanLock::try_acquire(dir.path(), &project).unwrap();
        assert!(first.is_some());
        assert!(ScanLock::try_acquire(dir.path(), &project).unwrap().is_none());

        drop(first);
        assert!(ScanLock::try_acquire(dir.path(), &project).unwrap().is_some());
    }

    #[test]
    fn lock_file_names_are_stable_and_sanitized() {
        let project = DiscoveredProject {
            name: "whatever".to_string(),
            root: PathBuf::from("/w/my app!"),
        };
        let name = lock_file_name(&project);
        assert_eq!(name, lock_file_name(&project));
        assert!(name.ends_with(".lock"));
        assert!(name.starts_with("my-app--"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }

    // ---- Config ----

    #[test]
    fn config_defaults_from_empty_toml() {
        let config: WatcherConfig = toml::from_str("").unwrap();
        assert!(config.roots.is_empty());
        assert_eq!(config.scan_interval_ms, DEFAULT_SCAN_INTERVAL_MS);
        assert_eq!(config.max_scan_duration_ms, DEFAULT_MAX_SCAN_DURATION_MS);
        assert_eq!(config.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE_BYTES);
        assert!(config.marker_files.contains(&".git".to_string()));
        assert!(config.ignore.contains(&"node_modules".to_string()));
    }

    #[test]
    fn config_partial_toml_overrides() {
        let config: WatcherConfig = toml::from_str(
            "roots = [\"/srv/code\"]\nscan_interval_ms = 500\nignore = [\"*.log\"]\n",
        )
        .unwrap();
        assert_eq!(config.roots, vec![PathBuf::from("/srv/code")]);
        assert_eq!(config.scan_interval_ms, 500);
        assert_eq!(config.ignore, vec!["*.log".to_string()]);
        assert_eq!(config.marker_files, default_marker_files());
    }

    // ---- Scan passes against a live driver ----

    #[tokio::test]
    async fn scan_pass_ingests_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        let report = watcher.scan_once(&no_shutdown()).await.unwrap();

        assert_eq!(report.projects_found, 1);
        assert_eq!(report.projects_scanned, 1);
        assert_eq!(report.files_seen, 2);
        assert_eq!(report.files_upserted, 2);
        assert_eq!(report.files_deleted, 0);
        assert!(!report.truncated);
        assert!(!report.interrupted);

        let mut verify = client_for(&socket);
        let counts = verify.counts().await.unwrap();
        assert_eq!(counts.total_files, 2);
        assert_eq!(counts.active_files, 2);

        let files = verify.list_files(Some("app"), 0, 10, false).await.unwrap();
        assert_eq!(files.len(), 2);
        for row in &files {
            let version = row.version_path.as_deref().unwrap();
            assert!(Path::new(version).exists());
        }

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn unchanged_files_are_not_reupserted() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        let first = watcher.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(first.files_upserted, 2);

        let mut verify = client_for(&socket);
        let before = verify.list_files(None, 0, 10, false).await.unwrap();

        let second = watcher.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(second.files_seen, 2);
        assert_eq!(second.files_upserted, 0);

        let after = verify.list_files(None, 0, 10, false).await.unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.updated_at_ms, b.updated_at_ms);
        }

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn deleted_file_is_soft_deleted_with_recoverable_content() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        watcher.scan_once(&no_shutdown()).await.unwrap();

        let main_rs = ws.join("app/src/main.rs");
        fs::remove_file(&main_rs).unwrap();

        let report = watcher.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.files_upserted, 0);

        let mut verify = client_for(&socket);
        let all = verify.list_files(None, 0, 10, true).await.unwrap();
        let row = all
            .iter()
            .find(|r| r.path.ends_with("main.rs"))
            .expect("catalog row for main.rs");
        assert!(row.deleted);
        assert!(row.deleted_at_ms.is_some());

        let version = row.version_path.as_deref().unwrap();
        assert_eq!(fs::read_to_string(version).unwrap(), "fn main() {}\n");

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn modified_file_requeues_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        watcher.scan_once(&no_shutdown()).await.unwrap();

        let mut verify = client_for(&socket);
        let pending = verify.pending_embeddings(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        for file in &pending {
            verify
                .store_embedding(file.file_id, "test-model", 2, vec![vec![0.1, 0.2]])
                .await
                .unwrap();
        }
        assert!(verify.pending_embeddings(10).await.unwrap().is_empty());

        let main_rs = ws.join("app/src/main.rs");
        write_file(&main_rs, "fn main() { println!(\"changed\"); }\n");

        let report = watcher.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(report.files_upserted, 1);

        let pending = verify.pending_embeddings(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].path.ends_with("main.rs"));

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn truncated_walk_never_marks_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        watcher.scan_once(&no_shutdown()).await.unwrap();

        fs::remove_file(ws.join("app/src/main.rs")).unwrap();

        // Deadline already reached: the walk truncates before visiting
        // anything, so the missing file must not be treated as deleted.
        let project = DiscoveredProject {
            name: "app".to_string(),
            root: ws.join("app"),
        };
        let catalog = watcher.load_catalog().await.unwrap();
        let scan = watcher
            .scan_project(&project, &catalog, Instant::now(), &no_shutdown())
            .await
            .unwrap();
        assert!(scan.truncated);
        assert_eq!(scan.files_deleted, 0);

        let mut verify = client_for(&socket);
        let counts = verify.counts().await.unwrap();
        assert_eq!(counts.deleted_files, 0);

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn locked_project_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let config = test_config(&dir, &ws);
        let project = DiscoveredProject {
            name: "app".to_string(),
            root: ws.join("app"),
        };
        let held = ScanLock::try_acquire(&config.lock_dir(), &project)
            .unwrap()
            .unwrap();

        let mut watcher = FileWatcher::new(config, client_for(&socket));
        let report = watcher.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(report.projects_found, 1);
        assert_eq!(report.projects_skipped, 1);
        assert_eq!(report.projects_scanned, 0);
        assert_eq!(report.files_upserted, 0);
        drop(held);

        let mut verify = client_for(&socket);
        assert_eq!(verify.counts().await.unwrap().total_files, 0);

        verify.shutdown().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn missing_driver_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let client = client_for(&dir.path().join("no-driver.sock"));

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client);
        let err = watcher.scan_once(&no_shutdown()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Driver(crate::error::DriverError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn shutdown_flag_interrupts_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let ws = app_fixture(&dir);
        let (socket, server) = start_driver(&dir).await;

        let mut watcher = FileWatcher::new(test_config(&dir, &ws), client_for(&socket));
        let flag = Arc::new(AtomicBool::new(true));
        let report = watcher.scan_once(&flag).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.projects_scanned, 0);

        let mut verify = client_for(&socket);
        verify.shutdown().await.unwrap();
        server.abort();
    }
}
