//! Tracing setup shared by the supervisor, the driver server, and the
//! worker processes.
//!
//! Each process calls [`init_logging`] once at startup. Events go to
//! stderr so stdout stays clean for command output; an optional
//! append-mode file receives a copy of the same stream for diagnostic
//! bundles. `RUST_LOG`, when set, replaces the configured level outright.
//!
//! Events use a shared field vocabulary so logs from different processes
//! correlate: `worker_kind`, `pid`, `project`, `file_id`, `command`.
//! Watched file contents are never logged, only paths, sizes, and hashes.

use std::fmt;
use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, registry};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Colored single-line output for a terminal.
    Pretty,
    /// One JSON object per line, event fields flattened to the top level.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}` (expected pretty or json)")),
        }
    }
}

/// The `[log]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A level name or a directive list, e.g. `info` or
    /// `lodestone_core=debug,lode=trace`.
    pub level: String,

    /// Rendering for stderr and the log file alike.
    pub format: LogFormat,

    /// Optional file that receives a copy of every event.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    File(#[from] io::Error),

    #[error(transparent)]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global tracing subscriber.
///
/// A second call in the same process returns
/// [`LogError::AlreadyInitialized`]; a level string `EnvFilter` cannot
/// parse is rejected before anything is installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => config_filter(&config.level)?,
    };
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let stderr = tracing_fmt::layer().with_writer(io::stderr);
            let file = file.map(|file| tracing_fmt::layer().with_writer(file).with_ansi(false));
            tracing::subscriber::set_global_default(
                registry().with(filter).with(stderr).with(file),
            )?;
        }
        LogFormat::Json => {
            let stderr = tracing_fmt::layer()
                .json()
                .flatten_event(true)
                .with_span_list(false)
                .with_writer(io::stderr);
            let file = file.map(|file| {
                tracing_fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(file)
            });
            tracing::subscriber::set_global_default(
                registry().with(filter).with(stderr).with(file),
            )?;
        }
    }

    let _ = INSTALLED.set(());
    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging ready"
    );
    Ok(())
}

fn config_filter(level: &str) -> Result<EnvFilter, LogError> {
    EnvFilter::try_new(level).map_err(|err| LogError::InvalidLevel(format!("{level} ({err})")))
}

/// Open the log file append-mode, creating parent directories as needed.
/// A newly created file is readable by the owning user only.
fn open_log_file(path: &Path) -> Result<File, LogError> {
    create_parent_dirs(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// Create the parent directory of `path` if it is missing. Directories
/// created here hold sockets, pid files, and logs, so new ones are 0o700.
pub(crate) fn create_parent_dirs(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let existed = parent.exists();
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
