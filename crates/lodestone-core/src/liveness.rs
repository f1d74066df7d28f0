//! Tiered liveness probing for worker handles.
//!
//! A handle rarely carries every reference shape, and the ones it carries
//! are not equally trustworthy. Probing walks from the strongest evidence
//! to the weakest and reports which tier actually answered:
//!
//! 1. in-process task: ask the [`TaskRef`] directly
//! 2. child process: `try_wait` through the [`ProcessRef`]; a handle owned
//!    by another process cannot be waited on and falls through
//! 3. raw pid: signal 0 via the OS
//! 4. nothing usable: assume dead so the supervisor errs toward restart

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::process::pid_alive;
use crate::registry::WorkerHandle;

/// Which evidence tier produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTier {
    Task,
    Process,
    Pid,
    Assumed,
}

impl std::fmt::Display for ProbeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Process => "process",
            Self::Pid => "pid",
            Self::Assumed => "assumed",
        };
        f.write_str(s)
    }
}

/// Verdict of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub alive: bool,
    pub tier: ProbeTier,
}

impl Probe {
    fn new(alive: bool, tier: ProbeTier) -> Self {
        Self { alive, tier }
    }
}

/// Probe one handle, strongest reference first.
///
/// Never returns an error: a handle whose references are all unusable is
/// reported dead at [`ProbeTier::Assumed`] rather than left in limbo.
#[must_use]
pub fn probe(handle: &WorkerHandle) -> Probe {
    if let Some(task) = handle.task() {
        return Probe::new(task.is_running(), ProbeTier::Task);
    }

    if let Some(process) = handle.process() {
        match process.alive() {
            Ok(alive) => return Probe::new(alive, ProbeTier::Process),
            Err(err) => {
                debug!(
                    worker_kind = handle.kind(),
                    worker = handle.name(),
                    pid = handle.pid(),
                    error = %err,
                    "process handle unusable, falling back to pid probe"
                );
            }
        }
    }

    if let Some(pid) = handle.pid() {
        return Probe::new(pid_alive(pid), ProbeTier::Pid);
    }

    Probe::new(false, ProbeTier::Assumed)
}
