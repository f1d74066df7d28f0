//! Storage driver: supervised single-writer access to the catalog database.
//!
//! Exactly one server process owns the SQLite connection; everything else
//! goes through [`DriverClient`] over a per-database Unix socket. The
//! [`DriverProxy`] starts, stops, and monitors that server through the
//! worker registry, enforcing the one-server-per-database rule with a
//! liveness-checked pid file.

mod client;
mod protocol;
mod server;

pub use client::DriverClient;
pub use protocol::{DriverRequest, DriverResponse, decode_request, decode_response, encode};
pub use server::{DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_QUEUE_MAX, DriverServer};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{DriverError, Error, Result};
use crate::liveness;
use crate::pid_file;
use crate::process::{pid_alive, spawn_worker_process};
use crate::registry::{KIND_DATABASE_DRIVER, RestartSpec, WorkerHandle, WorkerRegistry};
use crate::shutdown::{self, KindStopSummary, StopReport};

/// How the driver proxy launches and reaches its server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverProxyConfig {
    /// Catalog database file.
    pub db_path: PathBuf,
    /// Socket path override; derived from `db_path` when unset.
    pub socket_path: Option<PathBuf>,
    /// Pid file override; derived from `db_path` when unset.
    pub pid_file: Option<PathBuf>,
    /// Storage backend label, reported in status output.
    pub driver_type: String,
    /// Commands queued before the server answers busy.
    pub queue_max: usize,
    /// Per-command execution deadline.
    pub command_timeout_ms: u64,
    /// Replacement command line for the server process; used by tests to
    /// stand in an inert child.
    #[serde(skip)]
    pub launch_override: Option<Vec<String>>,
}

impl Default for DriverProxyConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            socket_path: None,
            pid_file: None,
            driver_type: "sqlite".to_string(),
            queue_max: DEFAULT_QUEUE_MAX,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            launch_override: None,
        }
    }
}

impl DriverProxyConfig {
    #[must_use]
    pub fn for_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Effective socket path: the override, or one derived from the db path.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| derive_socket_path(&self.db_path))
    }

    /// Effective pid file path: the override, or one derived from the db path.
    #[must_use]
    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| derive_pid_file(&self.db_path))
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lodestone")
        .join("catalog.db")
}

fn runtime_base() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lodestone")
}

/// Short stable key for a database path, so sockets stay distinct per
/// database and identical across processes.
fn db_key(db_path: &Path) -> String {
    let digest = Sha256::digest(db_path.to_string_lossy().as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Per-database socket path under the user's runtime directory.
#[must_use]
pub fn derive_socket_path(db_path: &Path) -> PathBuf {
    runtime_base().join(format!("driver-{}.sock", db_key(db_path)))
}

/// Per-database pid file path next to the derived socket.
#[must_use]
pub fn derive_pid_file(db_path: &Path) -> PathBuf {
    runtime_base().join(format!("driver-{}.pid", db_key(db_path)))
}

/// Observed driver server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    NotRunning,
    /// Process is alive but its socket is not bound yet.
    Starting,
    Running,
    /// A pid was recorded but that process is gone without cleanup.
    Crashed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Point-in-time driver health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStatus {
    pub state: DriverState,
    pub running: bool,
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub socket_exists: bool,
    pub driver_type: String,
    pub db_path: PathBuf,
}

/// Result of a start request. Finding a live server is a normal answer
/// here, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    #[must_use]
    pub fn pid(&self) -> u32 {
        match self {
            Self::Started { pid } | Self::AlreadyRunning { pid } => *pid,
        }
    }
}

/// Supervision facade for the driver server process.
pub struct DriverProxy {
    registry: Arc<WorkerRegistry>,
    config: DriverProxyConfig,
}

impl std::fmt::Debug for DriverProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverProxy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DriverProxy {
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>, config: DriverProxyConfig) -> Self {
        Self { registry, config }
    }

    #[must_use]
    pub fn config(&self) -> &DriverProxyConfig {
        &self.config
    }

    /// Create a client wired to this proxy's socket and timeout settings.
    #[must_use]
    pub fn client(&self) -> DriverClient {
        DriverClient::new(self.config.socket_path())
            .with_timeout_ms(self.config.command_timeout_ms)
    }

    /// Start the server unless one is already alive for this database.
    ///
    /// Liveness is checked in the registry first, then through the pid
    /// file, so a server left behind by an earlier supervisor still counts.
    pub async fn start(&self) -> Result<StartOutcome> {
        if self.config.driver_type.trim().is_empty() {
            return Err(DriverError::MissingDriverType.into());
        }
        if let Some(pid) = self.live_pid() {
            info!(pid, db = %self.config.db_path.display(), "driver server already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let (handle, pid) = spawn_server_handle(&self.config)?;
        let handle = handle.with_restart(restart_spec(self.config.clone()));
        self.registry.register(handle);
        info!(
            pid,
            socket = %self.config.socket_path().display(),
            db = %self.config.db_path.display(),
            "driver server started"
        );
        Ok(StartOutcome::Started { pid })
    }

    /// Stop the server, falling back to the pid file when the registry has
    /// no record of it (fresh CLI process, or a supervisor that crashed).
    pub async fn stop(&self, timeout: Duration) -> Result<KindStopSummary> {
        let mut summary = shutdown::stop_kind(&self.registry, KIND_DATABASE_DRIVER, timeout).await;

        if summary.stopped == 0 && summary.failed == 0 {
            if let Some(pid) = pid_file::read_live_pid(&self.config.pid_file_path()) {
                info!(pid, "stopping driver server found via pid file");
                let handle = WorkerHandle::new(KIND_DATABASE_DRIVER, self.worker_name())
                    .with_pid(pid);
                let disposition = shutdown::stop_handle(&handle, timeout).await;
                let mut report = StopReport::default();
                report.record(&disposition);
                summary = KindStopSummary::from_report(KIND_DATABASE_DRIVER, report);
            }
        }

        pid_file::remove_pid_file(&self.config.pid_file_path())?;
        if summary.success {
            remove_socket_file(&self.config.socket_path());
        }
        Ok(summary)
    }

    /// Stop then start. A failed stop is logged and start proceeds; the
    /// new server refuses its socket if the old one is somehow still bound.
    pub async fn restart(&self, timeout: Duration) -> Result<StartOutcome> {
        let summary = self.stop(timeout).await?;
        if !summary.success {
            warn!(message = %summary.message, "driver stop failed before restart");
        }
        self.start().await
    }

    /// Derive the current state from the registry, pid file, and socket.
    #[must_use]
    pub fn status(&self) -> DriverStatus {
        let socket_path = self.config.socket_path();
        let socket_exists = socket_path.exists();

        let registry_pid = self
            .registry
            .snapshot_kind(KIND_DATABASE_DRIVER)
            .iter()
            .filter_map(WorkerHandle::pid)
            .next();
        let pid = registry_pid.or_else(|| pid_file::read_pid_file(&self.config.pid_file_path()));

        let alive = pid.is_some_and(pid_alive);
        let state = match (alive, socket_exists) {
            (true, true) => DriverState::Running,
            (true, false) => DriverState::Starting,
            (false, _) if pid.is_some() => DriverState::Crashed,
            (false, _) => DriverState::NotRunning,
        };

        DriverStatus {
            state,
            running: state == DriverState::Running,
            pid,
            socket_path,
            socket_exists,
            driver_type: self.config.driver_type.clone(),
            db_path: self.config.db_path.clone(),
        }
    }

    /// Poll until the server answers a ping or the deadline passes.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let single_attempt = crate::backoff::BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            1.0,
            0.0,
            Some(1),
        );
        let mut client = self.client().with_connect_backoff(single_attempt);
        loop {
            if client.ping().await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn worker_name(&self) -> String {
        format!("{}-driver", self.config.driver_type)
    }

    fn live_pid(&self) -> Option<u32> {
        for handle in self.registry.snapshot_kind(KIND_DATABASE_DRIVER) {
            if liveness::probe(&handle).alive {
                if let Some(pid) = handle.pid() {
                    return Some(pid);
                }
            }
        }
        pid_file::read_live_pid(&self.config.pid_file_path())
    }
}

/// Spawn the server process and write its pid file.
fn spawn_server_handle(config: &DriverProxyConfig) -> Result<(WorkerHandle, u32)> {
    let argv = match &config.launch_override {
        Some(argv) => argv.clone(),
        None => server_argv(config)?,
    };
    let process = spawn_worker_process(&argv)?;
    let pid = process.pid();
    pid_file::write_pid_file(&config.pid_file_path(), pid)?;

    let name = format!("{}-driver", config.driver_type);
    Ok((
        WorkerHandle::new(KIND_DATABASE_DRIVER, name).with_process(process),
        pid,
    ))
}

/// Restart recipe used by the health monitor: respawn and hand back a
/// handle that carries the same recipe for the next failure.
fn restart_spec(config: DriverProxyConfig) -> RestartSpec {
    RestartSpec::new(move || {
        let config = config.clone();
        async move {
            let (handle, pid) = spawn_server_handle(&config)?;
            info!(pid, db = %config.db_path.display(), "driver server respawned");
            Ok(Some(handle.with_restart(restart_spec(config.clone()))))
        }
    })
}

fn server_argv(config: &DriverProxyConfig) -> Result<Vec<String>> {
    let exe = std::env::current_exe().map_err(Error::Io)?;
    Ok(vec![
        exe.display().to_string(),
        "driver-serve".to_string(),
        "--db".to_string(),
        config.db_path.display().to_string(),
        "--socket".to_string(),
        config.socket_path().display().to_string(),
        "--pid-file".to_string(),
        config.pid_file_path().display().to_string(),
        "--queue-max".to_string(),
        config.queue_max.to_string(),
        "--timeout-ms".to_string(),
        config.command_timeout_ms.to_string(),
    ])
}

fn remove_socket_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove driver socket file");
        }
    }
}
