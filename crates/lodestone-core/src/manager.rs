//! Public supervision surface.
//!
//! [`WorkerManager`] owns the shared registry and the optional health
//! monitor, and exposes the operations the CLI and service loop use:
//! register, status, stop one kind, stop everything. Stop-all always stops
//! the monitor before touching workers so a restart recipe cannot race an
//! intentional shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::monitor::{spawn_monitor, MonitorHandle, DEFAULT_MONITOR_INTERVAL};
use crate::registry::{RegistryStatus, WorkerHandle, WorkerRegistry};
use crate::shutdown::{self, KindStopSummary};

/// Aggregate result of [`WorkerManager::stop_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAllSummary {
    pub success: bool,
    pub stopped: usize,
    pub failed: usize,
    pub monitor_stopped: bool,
    pub kinds: Vec<KindStopSummary>,
}

/// Supervisor façade over the registry and health monitor.
pub struct WorkerManager {
    registry: Arc<WorkerRegistry>,
    monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
    stopping: AtomicBool,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Arc::new(WorkerRegistry::new()))
    }

    /// Build around an existing registry (shared with other components).
    #[must_use]
    pub fn with_registry(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            monitor: tokio::sync::Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// True once [`Self::stop_all`] has begun.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn register(&self, handle: WorkerHandle) -> u64 {
        self.registry.register(handle)
    }

    pub fn unregister(&self, kind: &str, pid: Option<u32>) -> usize {
        self.registry.unregister(kind, pid)
    }

    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Start the health monitor. Returns false when one is already running.
    pub async fn start_monitoring(&self, interval: Duration) -> bool {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().is_some_and(MonitorHandle::is_running) {
            debug!("health monitor already running");
            return false;
        }
        *slot = Some(spawn_monitor(Arc::clone(&self.registry), interval));
        true
    }

    /// Start the health monitor with the default interval.
    pub async fn start_default_monitoring(&self) -> bool {
        self.start_monitoring(DEFAULT_MONITOR_INTERVAL).await
    }

    /// Stop the health monitor if one is running.
    ///
    /// Returns true when no monitor was running or it wound down in time.
    pub async fn stop_monitoring(&self, timeout: Duration) -> bool {
        let handle = {
            let mut slot = self.monitor.lock().await;
            slot.take()
        };
        match handle {
            None => true,
            Some(monitor) => monitor.stop(timeout).await,
        }
    }

    #[must_use]
    pub async fn is_monitoring(&self) -> bool {
        let slot = self.monitor.lock().await;
        slot.as_ref().is_some_and(MonitorHandle::is_running)
    }

    /// Stop every worker of one kind.
    pub async fn stop_kind(&self, kind: &str, timeout: Duration) -> KindStopSummary {
        shutdown::stop_kind(&self.registry, kind, timeout).await
    }

    /// Stop the monitor, then every registered kind.
    pub async fn stop_all(&self, timeout: Duration) -> StopAllSummary {
        self.stopping.store(true, Ordering::SeqCst);
        info!("stopping all workers");

        // monitor first: a sweep running past this point could resurrect
        // a worker we are about to stop
        let monitor_stopped = self.stop_monitoring(timeout).await;

        let mut kinds = Vec::new();
        let mut stopped = 0;
        let mut failed = 0;
        for kind in self.registry.kinds() {
            let summary = shutdown::stop_kind(&self.registry, &kind, timeout).await;
            stopped += summary.stopped;
            failed += summary.failed;
            kinds.push(summary);
        }

        let summary = StopAllSummary {
            success: failed == 0,
            stopped,
            failed,
            monitor_stopped,
            kinds,
        };
        info!(
            stopped = summary.stopped,
            failed = summary.failed,
            success = summary.success,
            "stop-all finished"
        );
        summary
    }
}
