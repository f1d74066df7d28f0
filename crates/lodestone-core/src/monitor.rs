//! Background health monitor.
//!
//! A single dedicated task sweeps the registry on a fixed interval. Dead
//! workers are unregistered; those carrying a restart recipe are respawned
//! and re-registered under the same kind. Restart code runs in its own task
//! so a panic or error in one recipe never takes the monitor down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::liveness;
use crate::registry::WorkerRegistry;

/// Default sweep interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Counters from one registry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub dead: usize,
    pub restarted: usize,
}

/// Handle to the running monitor task.
///
/// Stopping is two-phase: flip the shutdown flag and wake the loop, then
/// join with a timeout. A loop that fails to wind down in time is aborted.
pub struct MonitorHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Wake the loop and tell it to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Stop the loop, waiting up to `timeout` for it to finish.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.signal_stop();
        let handle = {
            let mut guard = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(handle) = handle else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "monitor task ended abnormally");
                true
            }
            Err(_) => {
                abort.abort();
                warn!("monitor task missed the stop window and was aborted");
                false
            }
        }
    }
}

/// Start the monitor loop over a shared registry.
pub fn spawn_monitor(registry: Arc<WorkerRegistry>, interval: Duration) -> MonitorHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());

    let loop_shutdown = Arc::clone(&shutdown);
    let loop_notify = Arc::clone(&notify);
    let task = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = loop_notify.notified() => {}
            }
            if loop_shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stats = sweep(&registry).await;
            if stats.dead > 0 {
                info!(
                    dead = stats.dead,
                    restarted = stats.restarted,
                    "health sweep finished"
                );
            }
        }
        info!("health monitor stopped");
    });

    MonitorHandle {
        shutdown,
        notify,
        task: Mutex::new(Some(task)),
    }
}

/// One pass over the registry: unregister the dead, restart the restartable.
pub(crate) async fn sweep(registry: &Arc<WorkerRegistry>) -> SweepStats {
    let mut stats = SweepStats::default();

    for (kind, handles) in registry.snapshot() {
        for handle in handles {
            let verdict = liveness::probe(&handle);
            if verdict.alive {
                continue;
            }
            stats.dead += 1;
            warn!(
                worker_kind = %kind,
                worker = handle.name(),
                pid = handle.pid(),
                probe = %verdict.tier,
                "dead worker detected"
            );

            // stop_kind may have taken the handle between snapshot and now;
            // restarting it then would resurrect an intentionally stopped
            // worker
            if !registry.unregister_id(&kind, handle.id()) {
                debug!(
                    worker_kind = %kind,
                    worker = handle.name(),
                    "handle already removed, skipping restart"
                );
                continue;
            }

            let Some(spec) = handle.restart() else {
                continue;
            };

            match tokio::spawn(spec.invoke()).await {
                Ok(Ok(Some(replacement))) => {
                    info!(
                        worker_kind = %kind,
                        worker = replacement.name(),
                        pid = replacement.pid(),
                        "worker restarted"
                    );
                    registry.register(replacement);
                    stats.restarted += 1;
                }
                Ok(Ok(None)) => {
                    debug!(worker_kind = %kind, worker = handle.name(), "restart declined");
                }
                Ok(Err(err)) => {
                    error!(
                        worker_kind = %kind,
                        worker = handle.name(),
                        error = %err,
                        "worker restart failed"
                    );
                }
                Err(join_err) => {
                    error!(
                        worker_kind = %kind,
                        worker = handle.name(),
                        error = %join_err,
                        "worker restart recipe panicked"
                    );
                }
            }
        }
    }

    stats
}
