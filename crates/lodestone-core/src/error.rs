//! Crate-wide error types and the guidance printed alongside them.

use thiserror::Error;

/// A labelled command suggested as part of error guidance.
#[derive(Debug, Clone)]
pub struct Suggestion {
    /// What the command is for
    pub label: String,
    /// Command line to run
    pub command: String,
}

/// Actionable guidance attached to an error.
#[derive(Debug, Clone)]
pub struct Remediation {
    /// One-line description of the fix
    pub summary: String,
    /// Commands worth running, in order
    pub commands: Vec<Suggestion>,
    /// What to try when the commands do not resolve it
    pub fallbacks: Vec<String>,
}

impl Remediation {
    /// Assemble guidance from a summary line, labelled commands, and fallback notes.
    #[must_use]
    pub fn steps(
        summary: impl Into<String>,
        commands: &[(&str, &str)],
        fallbacks: &[&str],
    ) -> Self {
        Self {
            summary: summary.into(),
            commands: commands
                .iter()
                .map(|&(label, command)| Suggestion {
                    label: label.to_string(),
                    command: command.to_string(),
                })
                .collect(),
            fallbacks: fallbacks.iter().map(|&note| note.to_string()).collect(),
        }
    }

    /// Render as indented plain text for terminal output.
    #[must_use]
    pub fn plain_text(&self) -> String {
        let mut lines = vec!["To fix:".to_string(), format!("  {}", self.summary)];
        if !self.commands.is_empty() {
            lines.push("  Try:".to_string());
            for suggestion in &self.commands {
                lines.push(format!("    - {}: {}", suggestion.label, suggestion.command));
            }
        }
        if !self.fallbacks.is_empty() {
            lines.push("  If that fails:".to_string());
            for note in &self.fallbacks {
                lines.push(format!("    - {note}"));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lodestone-core
#[derive(Error, Debug)]
pub enum Error {
    /// Process spawning and signalling errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Storage driver proxy errors
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Catalog storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, join failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Guidance for resolving this error, when any is known.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Process(err) => Some(err.remediation()),
            Self::Driver(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(Remediation::steps(
                "Check filesystem permissions and paths, then retry.",
                &[("Status", "lode status")],
                &["Verify the data directory exists and is writable."],
            )),
            Self::Json(_) => Some(Remediation::steps(
                "Validate the JSON input and retry.",
                &[("Validate JSON", "python -m json.tool < input.json")],
                &["Check for trailing commas or invalid UTF-8."],
            )),
            Self::Runtime(_) => Some(Remediation::steps(
                "Restart the supervisor or retry the command.",
                &[("Status", "lode status")],
                &["If the issue persists, restart lode serve."],
            )),
        }
    }
}

/// Process handle and signal errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Spawning a worker process failed
    #[error("Failed to spawn {command}: {message}")]
    SpawnFailed { command: String, message: String },

    /// The handle was created by another supervisor process and cannot be
    /// waited on from this one
    #[error("Process handle for pid {pid} belongs to supervisor pid {owner_pid}")]
    ForeignHandle { pid: u32, owner_pid: u32 },

    /// Sending a signal failed
    #[error("Failed to send {signal} to pid {pid}: {message}")]
    SignalFailed {
        pid: u32,
        signal: String,
        message: String,
    },

    /// Collecting a child's exit status failed
    #[error("Failed to wait on pid {pid}: {message}")]
    WaitFailed { pid: u32, message: String },

    /// Process management is not available on this platform
    #[error("Process management unsupported on this platform: {0}")]
    Unsupported(String),
}

impl ProcessError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::SpawnFailed { command, .. } => {
                let probe = format!("command -v {command}");
                Remediation::steps(
                    format!("Verify the worker command exists and is executable: {command}"),
                    &[("Check binary", probe.as_str())],
                    &["Check PATH and file permissions for the worker binary."],
                )
            }
            Self::ForeignHandle { pid, .. } => {
                let probe = format!("ps -p {pid}");
                Remediation::steps(
                    format!("Pid {pid} was started by another supervisor; use pid-level controls."),
                    &[("Check process", probe.as_str())],
                    &["Stop the other supervisor first, or kill the pid directly."],
                )
            }
            Self::SignalFailed { pid, .. } => {
                let probe = format!("ps -p {pid}");
                Remediation::steps(
                    format!("Signal delivery to pid {pid} failed."),
                    &[("Check process", probe.as_str())],
                    &["The process may have exited already, or is owned by another user."],
                )
            }
            Self::WaitFailed { pid, .. } => {
                let probe = format!("ps -p {pid}");
                Remediation::steps(
                    format!("Could not collect exit status for pid {pid}."),
                    &[("Check process", probe.as_str())],
                    &["Another supervisor may own this child; use pid-level controls."],
                )
            }
            Self::Unsupported(_) => Remediation::steps(
                "Worker process management requires a Unix platform.",
                &[("Status", "lode status")],
                &["Run the supervisor on Linux or macOS."],
            ),
        }
    }
}

/// Storage driver proxy errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver config is missing a driver type
    #[error("Driver config has no type; set driver.driver_type before starting")]
    MissingDriverType,

    /// The proxy server is not running (no live pid, or socket missing)
    #[error("Driver proxy is not running")]
    NotRunning,

    /// Connecting to the proxy socket failed
    #[error("Failed to connect to driver socket {path}: {message}")]
    ConnectFailed { path: String, message: String },

    /// Another live server already owns the socket path
    #[error("Driver socket {path} is already in use by another server")]
    SocketInUse { path: String },

    /// The proxy command queue is full
    #[error("Driver proxy is busy; command queue is full")]
    Busy,

    /// A command did not complete within the configured timeout
    #[error("Driver command timed out after {0} ms")]
    CommandTimeout(u64),

    /// Malformed data on the wire
    #[error("Driver protocol error: {0}")]
    Protocol(String),

    /// The server reported a command failure
    #[error("Driver command failed: {0}")]
    Remote(String),
}

impl DriverError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MissingDriverType => Remediation::steps(
                "Set driver.driver_type in the config file and retry.",
                &[("Check config", "lode status")],
                &["The default config uses driver_type = \"sqlite\"."],
            ),
            Self::NotRunning | Self::ConnectFailed { .. } => Remediation::steps(
                "Start the driver proxy and retry the command.",
                &[
                    ("Start driver", "lode driver start"),
                    ("Check driver", "lode driver status"),
                ],
                &["If a stale socket remains, restart: lode driver restart."],
            ),
            Self::SocketInUse { .. } => Remediation::steps(
                "Another driver server already owns this socket.",
                &[("Check driver", "lode driver status")],
                &["Use the running server, or stop it: lode driver stop."],
            ),
            Self::Busy => Remediation::steps(
                "The driver command queue is full; retry shortly.",
                &[("Check driver", "lode driver status")],
                &["Reduce concurrent writers or raise driver.queue_max."],
            ),
            Self::CommandTimeout(_) => Remediation::steps(
                "The driver did not answer in time; check its health.",
                &[("Check driver", "lode driver status")],
                &["Restart the proxy if it is wedged: lode driver restart."],
            ),
            Self::Protocol(_) => Remediation::steps(
                "Client and server disagree on the wire format.",
                &[("Check versions", "lode --version")],
                &["Restart the driver so both sides run the same build."],
            ),
            Self::Remote(_) => Remediation::steps(
                "The driver rejected the command; check logs.",
                &[("Check driver", "lode driver status")],
                &["Inspect the supervisor log for the server-side error."],
            ),
        }
    }
}

/// Catalog storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database failure: {0}")]
    Database(String),

    #[error("No such record: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::steps(
                "Database operation failed. Check data directory permissions and retry.",
                &[("Check driver", "lode driver status")],
                &["Ensure the catalog directory is writable."],
            ),
            Self::NotFound(_) => Remediation::steps(
                "The requested record was not found.",
                &[("Status", "lode status")],
                &["Verify the record exists before accessing it."],
            ),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config file at {0}")]
    FileNotFound(String),

    #[error("Could not read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Config parse failed: {0}")]
    ParseFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                let inspect = format!("ls -l \"{path}\"");
                Remediation::steps(
                    format!("Config file not found: {path}. Verify the path and retry."),
                    &[("Check path", inspect.as_str())],
                    &["Pass --config with the correct path."],
                )
            }
            Self::ReadFailed(path, _) => {
                let inspect = format!("ls -l \"{path}\"");
                Remediation::steps(
                    format!("Failed to read config file: {path}. Check permissions."),
                    &[("Check permissions", inspect.as_str())],
                    &["Ensure the file is readable by the current user."],
                )
            }
            Self::ParseFailed(_) => Remediation::steps(
                "Config parse failed. Fix the syntax and retry.",
                &[("Status", "lode status")],
                &["Validate the TOML file format."],
            ),
            Self::ValidationError(_) => Remediation::steps(
                "Config validation failed. Fix the invalid fields and retry.",
                &[("Status", "lode status")],
                &["Review validation errors and adjust lodestone.toml."],
            ),
        }
    }
}

/// Format an error for terminal display, appending guidance when available.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    match error.remediation() {
        Some(guidance) => format!("Error: {error}\n\n{}", guidance.plain_text()),
        None => format!("Error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_guidance(errors: Vec<Error>) {
        for error in errors {
            let guidance = error.remediation().expect("missing guidance");
            assert!(
                !guidance.summary.is_empty(),
                "empty summary for {error:?}"
            );
            assert!(
                !guidance.commands.is_empty(),
                "no commands for {error:?}"
            );
        }
    }

    // ---- guidance coverage ----

    #[test]
    fn process_errors_carry_guidance() {
        assert_guidance(vec![
            Error::Process(ProcessError::SpawnFailed {
                command: "lode".to_string(),
                message: "no such file".to_string(),
            }),
            Error::Process(ProcessError::ForeignHandle {
                pid: 42,
                owner_pid: 7,
            }),
            Error::Process(ProcessError::SignalFailed {
                pid: 42,
                signal: "SIGTERM".to_string(),
                message: "EPERM".to_string(),
            }),
            Error::Process(ProcessError::WaitFailed {
                pid: 42,
                message: "ECHILD".to_string(),
            }),
            Error::Process(ProcessError::Unsupported("windows".to_string())),
        ]);
    }

    #[test]
    fn driver_errors_carry_guidance() {
        assert_guidance(vec![
            Error::Driver(DriverError::MissingDriverType),
            Error::Driver(DriverError::NotRunning),
            Error::Driver(DriverError::ConnectFailed {
                path: "/tmp/driver.sock".to_string(),
                message: "refused".to_string(),
            }),
            Error::Driver(DriverError::SocketInUse {
                path: "/tmp/driver.sock".to_string(),
            }),
            Error::Driver(DriverError::Busy),
            Error::Driver(DriverError::CommandTimeout(5000)),
            Error::Driver(DriverError::Protocol("bad json".to_string())),
            Error::Driver(DriverError::Remote("constraint failed".to_string())),
        ]);
    }

    #[test]
    fn storage_and_config_errors_carry_guidance() {
        assert_guidance(vec![
            Error::Storage(StorageError::Database("locked".to_string())),
            Error::Storage(StorageError::NotFound("file 9".to_string())),
            Error::Config(ConfigError::FileNotFound("lodestone.toml".to_string())),
            Error::Config(ConfigError::ReadFailed(
                "lodestone.toml".to_string(),
                "permission denied".to_string(),
            )),
            Error::Config(ConfigError::ParseFailed("expected table".to_string())),
            Error::Config(ConfigError::ValidationError(
                "queue_max must be positive".to_string(),
            )),
        ]);
    }

    #[test]
    fn top_level_errors_carry_guidance() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        assert_guidance(vec![
            Error::Io(std::io::Error::other("read failed")),
            Error::Json(json_err),
            Error::Runtime("worker registry channel closed".to_string()),
        ]);
    }

    #[test]
    fn not_running_guidance_names_the_start_command() {
        let guidance = DriverError::NotRunning.remediation();
        assert!(
            guidance
                .commands
                .iter()
                .any(|s| s.command == "lode driver start")
        );
    }

    #[test]
    fn spawn_failure_guidance_names_the_binary() {
        let err = ProcessError::SpawnFailed {
            command: "embedder".to_string(),
            message: "ENOENT".to_string(),
        };
        let guidance = err.remediation();
        assert!(guidance.summary.contains("embedder"));
        assert!(guidance.commands.iter().any(|s| s.command.contains("embedder")));
    }

    // ---- rendering ----

    #[test]
    fn steps_collects_every_field() {
        let guidance = Remediation::steps(
            "Do the thing.",
            &[("First", "lode status"), ("Second", "lode driver status")],
            &["Wait and retry."],
        );
        assert_eq!(guidance.summary, "Do the thing.");
        assert_eq!(guidance.commands.len(), 2);
        assert_eq!(guidance.commands[1].label, "Second");
        assert_eq!(guidance.commands[1].command, "lode driver status");
        assert_eq!(guidance.fallbacks, vec!["Wait and retry."]);
    }

    #[test]
    fn plain_text_renders_all_sections() {
        let guidance = Remediation::steps(
            "Restart the proxy.",
            &[("Restart", "lode driver restart")],
            &["Check the log first."],
        );
        assert_eq!(
            guidance.plain_text(),
            "To fix:\n  Restart the proxy.\n  Try:\n    - Restart: lode driver restart\n  If that fails:\n    - Check the log first.\n"
        );
    }

    #[test]
    fn plain_text_skips_empty_sections() {
        let text = Remediation::steps("Just wait.", &[], &[]).plain_text();
        assert_eq!(text, "To fix:\n  Just wait.\n");
    }

    #[test]
    fn formatted_errors_append_guidance() {
        let err = Error::Driver(DriverError::NotRunning);
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error:"));
        assert!(text.contains("To fix:"));
        assert!(text.contains("lode driver start"));
    }

    // ---- display ----

    #[test]
    fn messages_carry_their_context() {
        let err = Error::Process(ProcessError::ForeignHandle {
            pid: 42,
            owner_pid: 7,
        });
        let msg = err.to_string();
        assert!(msg.contains("42") && msg.contains("7"));

        let err = Error::Driver(DriverError::CommandTimeout(5000));
        assert!(err.to_string().contains("5000"));

        let err = Error::Runtime("worker registry channel closed".to_string());
        assert!(err.to_string().contains("registry channel"));
    }

    #[test]
    fn driver_messages_describe_the_failure() {
        assert!(DriverError::NotRunning.to_string().contains("not running"));
        assert!(DriverError::Busy.to_string().contains("queue is full"));
        let err = DriverError::ConnectFailed {
            path: "/tmp/d.sock".to_string(),
            message: "refused".to_string(),
        };
        assert!(err.to_string().contains("/tmp/d.sock"));
    }

    #[test]
    fn storage_messages_keep_the_cause() {
        assert!(
            StorageError::Database("disk full".to_string())
                .to_string()
                .contains("disk full")
        );
        assert!(
            StorageError::NotFound("file 3".to_string())
                .to_string()
                .contains("file 3")
        );
    }

    // ---- conversions ----

    #[test]
    fn sub_errors_convert_via_from() {
        let err: Error = ProcessError::Unsupported("plan9".to_string()).into();
        assert!(matches!(err, Error::Process(ProcessError::Unsupported(_))));

        let err: Error = StorageError::Database("database is locked".to_string()).into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));

        let err: Error = std::io::Error::other("broken pipe").into();
        assert!(matches!(err, Error::Io(_)));

        let storage: StorageError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(storage, StorageError::Database(_)));
    }
}
