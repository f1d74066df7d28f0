//! Worker process handles and Unix signal plumbing.
//!
//! Three reference shapes are used by the registry:
//!
//! - [`ProcessRef`] wraps a spawned child process. Only the supervisor that
//!   spawned the child can wait on it; a reference that crosses a process
//!   boundary (recorded owner pid differs from the current pid) reports
//!   [`ProcessError::ForeignHandle`] and callers fall back to pid checks.
//! - [`TaskRef`] wraps an in-process Tokio task with a cooperative shutdown
//!   flag.
//! - [`Stoppable`] is the escape hatch for workers that expose their own
//!   synchronous stop routine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Poll interval while waiting for a child to exit.
pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

// =====
// Pid-level signal helpers
// =====

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 {
        return None;
    }
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

/// Check whether a pid refers to a live process.
///
/// Uses the null signal: delivery is never attempted, only the existence
/// check. `EPERM` means the process exists but belongs to another user, so
/// it still counts as alive.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix_pid, None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return Err(ProcessError::SignalFailed {
            pid,
            signal: signal.to_string(),
            message: "pid out of range".to_string(),
        });
    };
    match nix::sys::signal::kill(nix_pid, Some(signal)) {
        Ok(()) => Ok(()),
        // Already gone; the goal of any stop signal is reached.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProcessError::SignalFailed {
            pid,
            signal: signal.to_string(),
            message: errno.to_string(),
        }),
    }
}

/// Send SIGTERM, asking the process to exit gracefully.
#[cfg(unix)]
pub fn send_term(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL, forcing the process to exit.
#[cfg(unix)]
pub fn send_kill(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
pub fn send_term(_pid: u32) -> Result<(), ProcessError> {
    Err(ProcessError::Unsupported("signals".to_string()))
}

#[cfg(not(unix))]
pub fn send_kill(_pid: u32) -> Result<(), ProcessError> {
    Err(ProcessError::Unsupported("signals".to_string()))
}

// =====
// ProcessRef
// =====

/// Outcome of waiting for a process to leave the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The child exited and was reaped.
    Exited,
    /// The deadline passed with the child still running.
    TimedOut,
    /// The reference became unusable mid-wait (foreign or wait failure).
    Unusable,
}

/// Owner-scoped reference to a spawned worker process.
///
/// Cloning shares the underlying child, so any clone observing the exit
/// reaps it for all.
#[derive(Clone)]
pub struct ProcessRef {
    pid: u32,
    owner_pid: u32,
    child: Arc<Mutex<Option<Child>>>,
}

impl std::fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRef")
            .field("pid", &self.pid)
            .field("owner_pid", &self.owner_pid)
            .finish_non_exhaustive()
    }
}

impl ProcessRef {
    /// Wrap a freshly spawned child.
    pub fn from_child(child: Child) -> Result<Self, ProcessError> {
        let pid = child.id().ok_or_else(|| ProcessError::WaitFailed {
            pid: 0,
            message: "child exited before a pid could be recorded".to_string(),
        })?;
        Ok(Self {
            pid,
            owner_pid: std::process::id(),
            child: Arc::new(Mutex::new(Some(child))),
        })
    }

    /// Reconstruct a reference recorded by another supervisor process.
    ///
    /// The result carries no waitable child; liveness and stop paths treat
    /// it as unusable and fall back to pid-level checks.
    #[must_use]
    pub fn adopt(pid: u32, owner_pid: u32) -> Self {
        Self {
            pid,
            owner_pid,
            child: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// True when the reference was created by a different supervisor process.
    #[must_use]
    pub fn is_foreign(&self) -> bool {
        self.owner_pid != std::process::id()
    }

    fn guard(&self) -> MutexGuard<'_, Option<Child>> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether the child is still running.
    ///
    /// `Err` means the reference cannot answer (foreign owner, missing
    /// child, or a wait failure such as ECHILD); callers should fall back
    /// to [`pid_alive`].
    pub fn alive(&self) -> Result<bool, ProcessError> {
        if self.is_foreign() {
            return Err(ProcessError::ForeignHandle {
                pid: self.pid,
                owner_pid: self.owner_pid,
            });
        }
        let mut guard = self.guard();
        let Some(child) = guard.as_mut() else {
            return Err(ProcessError::ForeignHandle {
                pid: self.pid,
                owner_pid: self.owner_pid,
            });
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, exit = ?status.code(), "child exited");
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(err) => Err(ProcessError::WaitFailed {
                pid: self.pid,
                message: err.to_string(),
            }),
        }
    }

    /// Poll until the child exits or the timeout elapses.
    pub async fn wait_exit(&self, timeout: Duration) -> WaitStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.alive() {
                Ok(false) => return WaitStatus::Exited,
                Ok(true) => {}
                Err(_) => return WaitStatus::Unusable,
            }
            if tokio::time::Instant::now() >= deadline {
                return WaitStatus::TimedOut;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

/// Spawn a worker process from an argv vector.
///
/// stdin and stdout are detached; stderr is inherited so worker logs land
/// in the supervisor's stream. The child is not killed on drop, stops are
/// always explicit.
pub fn spawn_worker_process(argv: &[String]) -> Result<ProcessRef, ProcessError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::SpawnFailed {
            command: String::new(),
            message: "empty command line".to_string(),
        });
    };

    let child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(false)
        .spawn()
        .map_err(|err| ProcessError::SpawnFailed {
            command: program.clone(),
            message: err.to_string(),
        })?;

    let proc_ref = ProcessRef::from_child(child)?;
    debug!(pid = proc_ref.pid(), command = %program, "spawned worker process");
    Ok(proc_ref)
}

// =====
// TaskRef
// =====

/// Handle to a worker running as an in-process Tokio task.
#[derive(Clone)]
pub struct TaskRef {
    shutdown: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TaskRef {
    /// Spawn a worker future. The future receives the shared shutdown flag
    /// and is expected to exit promptly once it flips to true.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let fut = f(Arc::clone(&shutdown));
        let finished_flag = Arc::clone(&finished);
        let handle = tokio::spawn(async move {
            fut.await;
            finished_flag.store(true, Ordering::SeqCst);
        });
        Self {
            shutdown,
            finished,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// True while the task has not completed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    /// Ask the task to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Signal the task and wait up to `timeout` for it to finish.
    ///
    /// Returns true when the task ended within the timeout; an overdue task
    /// is aborted and false is returned.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.signal_stop();
        let handle = {
            let mut guard = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(handle) = handle else {
            // stop already ran; nothing left to join
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "worker task ended abnormally during stop");
                self.finished.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => {
                abort.abort();
                self.finished.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

/// Workers that expose their own synchronous stop routine.
pub trait Stoppable: Send + Sync {
    fn stop(&self);
}
