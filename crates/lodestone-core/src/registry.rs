//! Central registry of live worker handles.
//!
//! The registry is the single source of truth for "which workers exist".
//! Handles are grouped by kind (one kind may hold several workers) and keep
//! whatever references were available at registration time: an OS pid, a
//! [`ProcessRef`], an in-process [`TaskRef`], a custom stopper, and an
//! optional restart recipe for the health monitor.
//!
//! Locking is deliberately coarse: one mutex around the whole map, held only
//! for bookkeeping. Anything that can block (signals, waits, probes against
//! the OS) runs on a snapshot taken under the lock, never inside it.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::liveness::{self, ProbeTier};
use crate::process::{ProcessRef, Stoppable, TaskRef};

/// Registry kind for the storage driver proxy (singleton).
pub const KIND_DATABASE_DRIVER: &str = "database_driver";
/// Registry kind for filesystem scan workers.
pub const KIND_FILE_WATCHER: &str = "file_watcher";
/// Registry kind for embedding workers.
pub const KIND_VECTORIZATION: &str = "vectorization";
/// Registry kind for catalog repair workers.
pub const KIND_REPAIR: &str = "repair";

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Boxed future returned by a restart recipe.
pub type RestartFuture =
    Pin<Box<dyn std::future::Future<Output = crate::error::Result<Option<WorkerHandle>>> + Send>>;

/// Recipe the health monitor runs to replace a dead worker.
///
/// Returning `Ok(None)` declines the restart (nothing is re-registered);
/// errors are logged and the worker stays unregistered until the owner
/// intervenes.
#[derive(Clone)]
pub struct RestartSpec {
    f: Arc<dyn Fn() -> RestartFuture + Send + Sync>,
}

impl RestartSpec {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::error::Result<Option<WorkerHandle>>>
            + Send
            + 'static,
    {
        Self {
            f: Arc::new(move || Box::pin(f())),
        }
    }

    /// Run the recipe, producing a fresh handle to register.
    pub fn invoke(&self) -> RestartFuture {
        (self.f)()
    }
}

impl std::fmt::Debug for RestartSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RestartSpec(..)")
    }
}

/// Everything the supervisor knows about one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: u64,
    kind: String,
    name: String,
    pid: Option<u32>,
    process: Option<ProcessRef>,
    task: Option<TaskRef>,
    stopper: Option<Arc<dyn Stoppable>>,
    restart: Option<RestartSpec>,
    registered_at_ms: Option<i64>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("has_process", &self.process.is_some())
            .field("has_task", &self.task.is_some())
            .field("has_stopper", &self.stopper.is_some())
            .field("has_restart", &self.restart.is_some())
            .field("registered_at_ms", &self.registered_at_ms)
            .finish()
    }
}

impl WorkerHandle {
    /// Create a bare handle; attach references with the `with_*` builders.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            kind: kind.into(),
            name: name.into(),
            pid: None,
            process: None,
            task: None,
            stopper: None,
            restart: None,
            registered_at_ms: None,
        }
    }

    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attach a spawned process reference; the pid is taken from it when
    /// not set explicitly.
    #[must_use]
    pub fn with_process(mut self, process: ProcessRef) -> Self {
        if self.pid.is_none() {
            self.pid = Some(process.pid());
        }
        self.process = Some(process);
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: TaskRef) -> Self {
        self.task = Some(task);
        self
    }

    #[must_use]
    pub fn with_stopper(mut self, stopper: Arc<dyn Stoppable>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: RestartSpec) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Registry-unique handle id (stable across clones).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn process(&self) -> Option<&ProcessRef> {
        self.process.as_ref()
    }

    #[must_use]
    pub fn task(&self) -> Option<&TaskRef> {
        self.task.as_ref()
    }

    #[must_use]
    pub fn stopper(&self) -> Option<&Arc<dyn Stoppable>> {
        self.stopper.as_ref()
    }

    #[must_use]
    pub fn restart(&self) -> Option<&RestartSpec> {
        self.restart.as_ref()
    }

    /// Registration timestamp, set by [`WorkerRegistry::register`].
    #[must_use]
    pub fn registered_at_ms(&self) -> Option<i64> {
        self.registered_at_ms
    }
}

/// Probe result for one worker, as reported by [`WorkerRegistry::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub probe: ProbeTier,
    pub registered_at_ms: Option<i64>,
}

/// Per-kind rollup of worker statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindStatus {
    pub total: usize,
    pub alive: usize,
    pub workers: Vec<WorkerStatus>,
}

/// Snapshot of the whole registry with liveness resolved per worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub kinds: BTreeMap<String, KindStatus>,
}

impl RegistryStatus {
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.kinds.values().map(|k| k.total).sum()
    }

    #[must_use]
    pub fn alive_workers(&self) -> usize {
        self.kinds.values().map(|k| k.alive).sum()
    }
}

/// Kind-keyed map of worker handles behind a single mutex.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<HashMap<String, Vec<WorkerHandle>>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, Vec<WorkerHandle>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handle under its kind, stamping the registration time.
    ///
    /// Handles append in arrival order; the same kind may hold any number
    /// of workers. Returns the handle id.
    pub fn register(&self, mut handle: WorkerHandle) -> u64 {
        handle.registered_at_ms = Some(chrono::Utc::now().timestamp_millis());
        let id = handle.id;
        info!(
            worker_kind = %handle.kind,
            worker = %handle.name,
            pid = handle.pid,
            "registering worker"
        );
        let mut map = self.guard();
        map.entry(handle.kind.clone()).or_default().push(handle);
        id
    }

    /// Remove handles of a kind.
    ///
    /// With a pid, only handles carrying that pid are removed; without one
    /// the kind's whole list is cleared. Returns the number removed.
    pub fn unregister(&self, kind: &str, pid: Option<u32>) -> usize {
        let mut map = self.guard();
        let removed = match map.get_mut(kind) {
            None => 0,
            Some(handles) => match pid {
                None => {
                    let n = handles.len();
                    handles.clear();
                    n
                }
                Some(pid) => {
                    let before = handles.len();
                    handles.retain(|h| h.pid != Some(pid));
                    before - handles.len()
                }
            },
        };
        if map.get(kind).is_some_and(Vec::is_empty) {
            map.remove(kind);
        }
        if removed > 0 {
            debug!(worker_kind = kind, pid, removed, "unregistered workers");
        }
        removed
    }

    /// Remove one handle by its registry id.
    pub(crate) fn unregister_id(&self, kind: &str, id: u64) -> bool {
        let mut map = self.guard();
        let removed = map.get_mut(kind).is_some_and(|handles| {
            let before = handles.len();
            handles.retain(|h| h.id != id);
            before != handles.len()
        });
        if map.get(kind).is_some_and(Vec::is_empty) {
            map.remove(kind);
        }
        removed
    }

    /// Clone the handle list for one kind.
    #[must_use]
    pub fn snapshot_kind(&self, kind: &str) -> Vec<WorkerHandle> {
        self.guard().get(kind).cloned().unwrap_or_default()
    }

    /// Clone all handles, sorted by kind for stable iteration.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Vec<WorkerHandle>)> {
        let map = self.guard();
        let mut entries: Vec<_> = map
            .iter()
            .map(|(kind, handles)| (kind.clone(), handles.clone()))
            .collect();
        drop(map);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.guard().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Remove and return all handles of a kind in one step.
    ///
    /// The registry entry is cleared unconditionally, so a failed stop
    /// never leaves half-dead handles behind.
    #[must_use]
    pub fn take_kind(&self, kind: &str) -> Vec<WorkerHandle> {
        self.guard().remove(kind).unwrap_or_default()
    }

    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.guard().get(kind).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.guard().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Probe every registered worker and report liveness per kind.
    ///
    /// Probing happens on a snapshot, outside the registry lock.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let snapshot = self.snapshot();
        let mut kinds = BTreeMap::new();
        for (kind, handles) in snapshot {
            let workers: Vec<WorkerStatus> = handles
                .iter()
                .map(|handle| {
                    let probe = liveness::probe(handle);
                    WorkerStatus {
                        name: handle.name.clone(),
                        pid: handle.pid,
                        alive: probe.alive,
                        probe: probe.tier,
                        registered_at_ms: handle.registered_at_ms,
                    }
                })
                .collect();
            let alive = workers.iter().filter(|w| w.alive).count();
            kinds.insert(
                kind,
                KindStatus {
                    total: workers.len(),
                    alive,
                    workers,
                },
            );
        }
        RegistryStatus { kinds }
    }
}
