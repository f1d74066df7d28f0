//! lodestone-core: the library behind `lode`.
//!
//! `lode` supervises the background workers that keep a local file catalog
//! searchable, and funnels every catalog write through a single-writer
//! storage driver.
//!
//! # Architecture
//!
//! ```text
//! CLI (lode) → WorkerManager → WorkerRegistry ← Health Monitor
//!                   ↓
//!     DriverProxy → Unix socket (NDJSON) → DriverServer → SQLite catalog
//!                   ↑
//!     Watcher / Vectorization / Repair workers (DriverClient)
//! ```
//!
//! # Modules
//!
//! - `registry`: Worker registry with pid and task tracking
//! - `liveness`: Tiered liveness probes (task, pid, socket)
//! - `shutdown`: Graceful shutdown sequencing (TERM, wait, KILL)
//! - `monitor`: Periodic health monitor with restart policies
//! - `manager`: Facade tying registry, monitor, and driver together
//! - `driver`: Single-writer storage driver (proxy, server, client, protocol)
//! - `storage`: SQLite file catalog and embedding store
//! - `watcher`: Filesystem scanner feeding the catalog
//! - `vectorizer`: Embedding worker behind a circuit breaker
//! - `repair`: Catalog/disk reconciliation worker
//! - `process`: Process and task spawning helpers
//! - `pid_file`: Pid file read/write helpers
//! - `backoff`: Retry with exponential backoff
//! - `circuit_breaker`: Failure-threshold circuit breaker
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! Unsafe code is forbidden crate-wide.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod driver;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod pid_file;
pub mod process;
pub mod registry;
pub mod repair;
pub mod shutdown;
pub mod storage;
pub mod vectorizer;
pub mod watcher;

pub use error::{Error, Result};

/// Crate version, from the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
