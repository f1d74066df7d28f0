//! Graceful-then-forced worker termination with stop accounting.
//!
//! One handle stops through whichever reference it carries, in order of
//! preference: task, child process, custom stopper, bare pid. The process
//! path escalates: graceful signal, wait up to the caller's timeout, forced
//! kill, brief wait, one last pid-level kill. A reference that turns
//! unusable mid-sequence (the supervisor restarted since the worker was
//! spawned) reroutes to the pid fallback instead of failing.
//!
//! Accounting is lenient on purpose: a worker we can no longer observe and
//! whose pid is gone counts as stopped, logged as `assumed_stopped` so a
//! confirmed clean exit stays distinguishable in the logs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::process::{
    pid_alive, send_kill, send_term, WaitStatus, EXIT_POLL_INTERVAL,
};
use crate::registry::{WorkerHandle, WorkerRegistry};

/// Wait window after a forced kill before declaring the worker stuck.
pub(crate) const FORCED_KILL_GRACE: Duration = Duration::from_millis(500);

/// How one worker's stop sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// In-process task finished within the timeout.
    TaskStopped,
    /// In-process task missed the timeout and was aborted.
    TaskAborted,
    /// Custom stop routine was invoked.
    StopperInvoked,
    /// Process was already gone before any signal was sent.
    AlreadyExited,
    /// Exited after the graceful signal.
    Exited,
    /// Exited only after the forced kill.
    Killed,
    /// Could not be observed; pid checks show nothing running.
    AssumedStopped,
    /// Still running after every escalation step.
    Failed,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskStopped => "task_stopped",
            Self::TaskAborted => "task_aborted",
            Self::StopperInvoked => "stopper_invoked",
            Self::AlreadyExited => "already_exited",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::AssumedStopped => "assumed_stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome plus the error detail when the outcome is [`StopOutcome::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopDisposition {
    pub outcome: StopOutcome,
    pub error: Option<String>,
}

impl StopDisposition {
    fn ok(outcome: StopOutcome) -> Self {
        Self {
            outcome,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            outcome: StopOutcome::Failed,
            error: Some(message),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.outcome != StopOutcome::Failed
    }
}

/// Running totals across a batch of stop attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopReport {
    pub stopped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl StopReport {
    pub fn record(&mut self, disposition: &StopDisposition) {
        if disposition.is_stopped() {
            self.stopped += 1;
        } else {
            self.failed += 1;
            if let Some(error) = &disposition.error {
                self.errors.push(error.clone());
            }
        }
    }

    pub fn merge(&mut self, other: StopReport) {
        self.stopped += other.stopped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Aggregate result of stopping one worker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindStopSummary {
    pub kind: String,
    pub success: bool,
    pub stopped: usize,
    pub failed: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl KindStopSummary {
    pub(crate) fn from_report(kind: &str, report: StopReport) -> Self {
        let total = report.stopped + report.failed;
        let message = if total == 0 {
            format!("no {kind} workers registered")
        } else if report.failed == 0 {
            format!("stopped {} of {total} {kind} workers", report.stopped)
        } else {
            format!(
                "stopped {} of {total} {kind} workers, {} failed",
                report.stopped, report.failed
            )
        };
        Self {
            kind: kind.to_string(),
            success: report.success(),
            stopped: report.stopped,
            failed: report.failed,
            message,
            errors: report.errors,
        }
    }
}

/// Stop every worker of a kind and clear its registry entry.
///
/// The entry is removed before any signal is sent, so even a partial
/// failure never leaves half-dead handles registered. Stopping a kind with
/// no workers succeeds with zero counts.
pub async fn stop_kind(
    registry: &WorkerRegistry,
    kind: &str,
    timeout: Duration,
) -> KindStopSummary {
    let handles = registry.take_kind(kind);
    info!(worker_kind = kind, count = handles.len(), "stopping worker kind");

    let mut report = StopReport::default();
    for handle in &handles {
        let disposition = stop_handle(handle, timeout).await;
        if disposition.is_stopped() {
            info!(
                worker_kind = kind,
                worker = handle.name(),
                pid = handle.pid(),
                outcome = %disposition.outcome,
                "worker stopped"
            );
        } else {
            warn!(
                worker_kind = kind,
                worker = handle.name(),
                pid = handle.pid(),
                error = disposition.error.as_deref().unwrap_or("unknown"),
                "worker failed to stop"
            );
        }
        report.record(&disposition);
    }
    KindStopSummary::from_report(kind, report)
}

/// Run the full escalation sequence for one handle.
pub async fn stop_handle(handle: &WorkerHandle, timeout: Duration) -> StopDisposition {
    if let Some(task) = handle.task() {
        return if task.stop(timeout).await {
            StopDisposition::ok(StopOutcome::TaskStopped)
        } else {
            warn!(
                worker_kind = handle.kind(),
                worker = handle.name(),
                "task missed the stop window and was aborted"
            );
            StopDisposition::ok(StopOutcome::TaskAborted)
        };
    }

    if let Some(process) = handle.process() {
        let pid = process.pid();
        match process.alive() {
            Err(err) => {
                debug!(
                    worker_kind = handle.kind(),
                    pid,
                    error = %err,
                    "process handle unusable, switching to pid fallback"
                );
                return pid_fallback(handle, timeout, true).await;
            }
            Ok(false) => return StopDisposition::ok(StopOutcome::AlreadyExited),
            Ok(true) => {}
        }

        if let Err(err) = send_term(pid) {
            warn!(pid, error = %err, "graceful signal failed");
        }
        match process.wait_exit(timeout).await {
            WaitStatus::Exited => return StopDisposition::ok(StopOutcome::Exited),
            WaitStatus::Unusable => return pid_fallback(handle, timeout, true).await,
            WaitStatus::TimedOut => {}
        }

        warn!(
            worker_kind = handle.kind(),
            worker = handle.name(),
            pid,
            timeout_ms = timeout.as_millis() as u64,
            "graceful window elapsed, forcing kill"
        );
        if let Err(err) = send_kill(pid) {
            warn!(pid, error = %err, "forced kill signal failed");
        }
        match process.wait_exit(FORCED_KILL_GRACE).await {
            WaitStatus::Exited => return StopDisposition::ok(StopOutcome::Killed),
            WaitStatus::Unusable => return pid_fallback(handle, timeout, true).await,
            WaitStatus::TimedOut => {
                // last resort: one more pid-level kill before giving up
                let _ = send_kill(pid);
                if wait_pid_gone(pid, FORCED_KILL_GRACE).await {
                    return StopDisposition::ok(StopOutcome::Killed);
                }
                return StopDisposition::failed(format!(
                    "worker {} (pid {pid}) survived forced kill",
                    handle.name()
                ));
            }
        }
    }

    if let Some(stopper) = handle.stopper() {
        stopper.stop();
        return StopDisposition::ok(StopOutcome::StopperInvoked);
    }

    pid_fallback(handle, timeout, false).await
}

/// Stop through the bare pid when no process reference is usable.
async fn pid_fallback(
    handle: &WorkerHandle,
    timeout: Duration,
    after_unusable: bool,
) -> StopDisposition {
    let Some(pid) = handle.pid() else {
        warn!(
            worker_kind = handle.kind(),
            worker = handle.name(),
            "no usable reference to stop through, assuming stopped"
        );
        return StopDisposition::ok(StopOutcome::AssumedStopped);
    };

    if !pid_alive(pid) {
        let outcome = if after_unusable {
            StopOutcome::AssumedStopped
        } else {
            StopOutcome::AlreadyExited
        };
        return StopDisposition::ok(outcome);
    }

    if let Err(err) = send_term(pid) {
        warn!(pid, error = %err, "graceful signal failed");
    }
    if wait_pid_gone(pid, timeout).await {
        return StopDisposition::ok(StopOutcome::Exited);
    }

    if let Err(err) = send_kill(pid) {
        warn!(pid, error = %err, "forced kill signal failed");
    }
    if wait_pid_gone(pid, FORCED_KILL_GRACE).await {
        return StopDisposition::ok(StopOutcome::Killed);
    }

    StopDisposition::failed(format!(
        "worker {} (pid {pid}) survived forced kill",
        handle.name()
    ))
}

/// Poll until the pid disappears from the system or the timeout elapses.
async fn wait_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}
