//! Argument types and command dispatch for the `lode` binary.
//!
//! `serve` runs the whole stack in the foreground: driver server, the
//! workers enabled in config, and the health monitor. `driver-serve` and
//! `worker` are the internal process entries the supervisor spawns; they
//! are hidden from help output but stable, since pid files may outlive
//! the supervisor that wrote them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use lodestone_core::config::{Config, resolve_config_path};
use lodestone_core::driver::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_QUEUE_MAX, DriverClient, DriverProxy, DriverServer,
    DriverStatus, StartOutcome, derive_socket_path,
};
use lodestone_core::logging::{LogConfig, LogFormat, init_logging};
use lodestone_core::manager::WorkerManager;
use lodestone_core::process::spawn_worker_process;
use lodestone_core::registry::{
    KIND_FILE_WATCHER, KIND_REPAIR, KIND_VECTORIZATION, RestartSpec, WorkerHandle, WorkerRegistry,
};
use lodestone_core::repair::RepairWorker;
use lodestone_core::vectorizer::{Embedder, HashEmbedder, VectorizationWorker};
use lodestone_core::watcher::FileWatcher;

/// Grace window for stopping workers and the driver.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long start paths wait for the driver socket to answer.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "lode", version, about = "Supervisor for file catalog workers")]
pub struct Cli {
    /// Config file path (default: $LODESTONE_CONFIG, then the per-user location)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor in the foreground: driver, workers, health monitor
    Serve,

    /// Show driver status and configured workers
    Status {
        /// Emit JSON instead of human-readable output
        #[arg(long)]
        json: bool,
    },

    /// Manage the storage driver server
    #[command(subcommand)]
    Driver(DriverCommands),

    /// Internal: run the driver server in the foreground
    #[command(hide = true)]
    DriverServe(DriverServeArgs),

    /// Internal: run one worker in the foreground
    #[command(hide = true)]
    Worker {
        /// Which worker to run
        kind: WorkerKind,
    },
}

#[derive(Subcommand, Debug)]
pub enum DriverCommands {
    /// Start the driver server unless one is already running
    Start,

    /// Stop the driver server
    Stop,

    /// Stop then start the driver server
    Restart,

    /// Show driver server status
    Status {
        /// Emit JSON instead of human-readable output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct DriverServeArgs {
    /// Catalog database file
    #[arg(long)]
    pub db: PathBuf,

    /// Socket path (derived from the database path when omitted)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Pid file to write while running
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Commands queued before the server answers busy
    #[arg(long, default_value_t = DEFAULT_QUEUE_MAX)]
    pub queue_max: usize,

    /// Per-command execution deadline in milliseconds
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    pub timeout_ms: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Watcher,
    Vectorization,
    Repair,
}

impl WorkerKind {
    /// The value name clap accepts for this kind, for respawn argv lines.
    const fn arg_name(self) -> &'static str {
        match self {
            Self::Watcher => "watcher",
            Self::Vectorization => "vectorization",
            Self::Repair => "repair",
        }
    }
}

/// Parse-time work is done; everything from here returns through anyhow so
/// `main` can render remediation for core errors.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    // driver-serve is spawned with everything on its command line; it must
    // not die on a config problem the supervisor already worked around
    if let Commands::DriverServe(args) = cli.command {
        setup_logging(
            LogConfig::default(),
            cli.log_level.as_deref(),
            cli.log_format,
        )?;
        return driver_serve(args).await;
    }

    let config = Config::load(cli.config.as_deref())?;
    setup_logging(config.log.clone(), cli.log_level.as_deref(), cli.log_format)?;

    match cli.command {
        Commands::Serve => {
            // worker children must read the same file this process did
            let config_path =
                resolve_config_path(cli.config.as_deref()).filter(|path| path.exists());
            serve(config, config_path).await
        }
        Commands::Status { json } => status(&config, json),
        Commands::Driver(command) => driver(config, command).await,
        Commands::Worker { kind } => worker(config, kind).await,
        Commands::DriverServe(_) => unreachable!("handled before config load"),
    }
}

fn setup_logging(
    mut config: LogConfig,
    level: Option<&str>,
    format: Option<LogFormat>,
) -> anyhow::Result<()> {
    if let Some(level) = level {
        config.level = level.to_string();
    }
    if let Some(format) = format {
        config.format = format;
    }
    init_logging(&config).context("failed to initialize logging")?;
    Ok(())
}

// ---- serve ----

/// Worker kinds `serve` hosts as child processes, with their config gates.
const SERVE_WORKERS: [(&str, &str, WorkerKind); 3] = [
    (KIND_FILE_WATCHER, "file-watcher", WorkerKind::Watcher),
    (KIND_VECTORIZATION, "vectorizer", WorkerKind::Vectorization),
    (KIND_REPAIR, "repair", WorkerKind::Repair),
];

async fn serve(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let manager = WorkerManager::new();
    let proxy = DriverProxy::new(Arc::clone(manager.registry()), config.driver.clone());

    proxy
        .start()
        .await
        .context("failed to start driver server")?;
    if !proxy.wait_ready(READY_TIMEOUT).await {
        warn!("driver socket not answering yet; workers will retry their connects");
    }

    for (kind, name, worker_kind) in SERVE_WORKERS {
        if !worker_enabled(&config, worker_kind) {
            continue;
        }
        let argv = worker_argv(worker_kind, config_path.as_deref())?;
        let handle = spawn_worker(kind, name, argv)
            .with_context(|| format!("failed to spawn {name} worker"))?;
        info!(worker_kind = kind, pid = handle.pid(), "worker started");
        manager.register(handle);
    }

    if config.monitor.enabled {
        manager.start_monitoring(config.monitor.interval()).await;
    }

    info!(
        workers = manager.status().total_workers(),
        monitoring = config.monitor.enabled,
        "supervisor running; send SIGTERM or press ctrl-c to stop"
    );
    wait_for_signal().await?;
    info!("shutdown signal received");

    let summary = manager.stop_all(STOP_TIMEOUT).await;
    for kind in &summary.kinds {
        info!(worker_kind = %kind.kind, message = %kind.message, "stopped");
    }
    anyhow::ensure!(
        summary.success,
        "{} workers failed to stop cleanly",
        summary.failed
    );
    Ok(())
}

const fn worker_enabled(config: &Config, kind: WorkerKind) -> bool {
    match kind {
        WorkerKind::Watcher => config.watcher.enabled,
        WorkerKind::Vectorization => config.vectorization.enabled,
        WorkerKind::Repair => config.repair.enabled,
    }
}

/// Command line for a worker child: this binary, re-entered through the
/// hidden `worker` subcommand, pinned to the same config file.
fn worker_argv(kind: WorkerKind, config_path: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut argv = vec![
        exe.display().to_string(),
        "worker".to_string(),
        kind.arg_name().to_string(),
    ];
    if let Some(path) = config_path {
        argv.push("--config".to_string());
        argv.push(path.display().to_string());
    }
    Ok(argv)
}

fn spawn_worker(
    kind: &'static str,
    name: &'static str,
    argv: Vec<String>,
) -> lodestone_core::Result<WorkerHandle> {
    let process = spawn_worker_process(&argv)?;
    Ok(WorkerHandle::new(kind, name)
        .with_process(process)
        .with_restart(worker_restart_spec(kind, name, argv)))
}

/// Restart recipe used by the health monitor: respawn the same command
/// line and hand back a handle carrying the recipe for the next failure.
fn worker_restart_spec(kind: &'static str, name: &'static str, argv: Vec<String>) -> RestartSpec {
    RestartSpec::new(move || {
        let argv = argv.clone();
        async move {
            let process = spawn_worker_process(&argv)?;
            info!(worker_kind = kind, pid = process.pid(), "worker respawned");
            Ok(Some(
                WorkerHandle::new(kind, name)
                    .with_process(process)
                    .with_restart(worker_restart_spec(kind, name, argv.clone())),
            ))
        }
    })
}

/// Resolve on ctrl-c or SIGTERM, whichever lands first.
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

// ---- status ----

#[derive(Debug, Serialize)]
struct StatusReport {
    driver: DriverStatus,
    workers: ConfiguredWorkers,
}

#[derive(Debug, Serialize)]
struct ConfiguredWorkers {
    watcher: bool,
    vectorization: bool,
    repair: bool,
}

fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let proxy = DriverProxy::new(Arc::new(WorkerRegistry::new()), config.driver.clone());
    let report = StatusReport {
        driver: proxy.status(),
        workers: ConfiguredWorkers {
            watcher: config.watcher.enabled,
            vectorization: config.vectorization.enabled,
            repair: config.repair.enabled,
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_driver_status(&report.driver);
    println!();
    println!("Configured workers:");
    println!("  watcher:       {}", enabled_label(report.workers.watcher));
    println!(
        "  vectorization: {}",
        enabled_label(report.workers.vectorization)
    );
    println!("  repair:        {}", enabled_label(report.workers.repair));
    Ok(())
}

fn print_driver_status(status: &DriverStatus) {
    println!("Driver: {}", status.state);
    if let Some(pid) = status.pid {
        println!("  pid:    {pid}");
    }
    println!("  db:     {}", status.db_path.display());
    println!(
        "  socket: {} ({})",
        status.socket_path.display(),
        if status.socket_exists { "bound" } else { "absent" }
    );
    println!("  type:   {}", status.driver_type);
}

const fn enabled_label(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

// ---- driver ----

async fn driver(config: Config, command: DriverCommands) -> anyhow::Result<()> {
    let proxy = DriverProxy::new(Arc::new(WorkerRegistry::new()), config.driver);
    match command {
        DriverCommands::Start => {
            let outcome = proxy.start().await?;
            if !proxy.wait_ready(READY_TIMEOUT).await {
                anyhow::bail!(
                    "driver server (pid {}) never answered on {}",
                    outcome.pid(),
                    proxy.config().socket_path().display()
                );
            }
            match outcome {
                StartOutcome::Started { pid } => println!("Driver server started (pid {pid})"),
                StartOutcome::AlreadyRunning { pid } => {
                    println!("Driver server already running (pid {pid})");
                }
            }
            Ok(())
        }
        DriverCommands::Stop => {
            let summary = proxy.stop(STOP_TIMEOUT).await?;
            if summary.stopped == 0 && summary.failed == 0 {
                println!("Driver server was not running");
            } else {
                println!("{}", summary.message);
            }
            anyhow::ensure!(summary.success, "driver stop failed");
            Ok(())
        }
        DriverCommands::Restart => {
            let outcome = proxy.restart(STOP_TIMEOUT).await?;
            if !proxy.wait_ready(READY_TIMEOUT).await {
                anyhow::bail!(
                    "driver server (pid {}) never answered on {}",
                    outcome.pid(),
                    proxy.config().socket_path().display()
                );
            }
            println!("Driver server running (pid {})", outcome.pid());
            Ok(())
        }
        DriverCommands::Status { json } => {
            let status = proxy.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_driver_status(&status);
            }
            Ok(())
        }
    }
}

// ---- internal process entries ----

async fn driver_serve(args: DriverServeArgs) -> anyhow::Result<()> {
    let socket = args
        .socket
        .unwrap_or_else(|| derive_socket_path(&args.db));
    let mut server = DriverServer::new(args.db, socket)
        .with_queue_max(args.queue_max)
        .with_command_timeout_ms(args.timeout_ms);
    if let Some(pid_file) = args.pid_file {
        server = server.with_pid_file(pid_file);
    }
    server.run().await.context("driver server exited with error")
}

async fn worker(config: Config, kind: WorkerKind) -> anyhow::Result<()> {
    let client = DriverClient::new(config.driver.socket_path())
        .with_timeout_ms(config.driver.command_timeout_ms);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if wait_for_signal().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    match kind {
        WorkerKind::Watcher => FileWatcher::new(config.watcher, client).run(shutdown).await,
        WorkerKind::Vectorization => {
            let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
            VectorizationWorker::new(config.vectorization, client, embedder)
                .run(shutdown)
                .await;
        }
        WorkerKind::Repair => RepairWorker::new(config.repair, client).run(shutdown).await,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    // ---- argument parsing ----

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_parses_with_global_flags() {
        let cli = Cli::parse_from([
            "lode",
            "--config",
            "/tmp/lodestone.toml",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "serve",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/lodestone.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn driver_serve_parses_the_spawn_argv() {
        let cli = Cli::parse_from([
            "lode",
            "driver-serve",
            "--db",
            "/data/catalog.db",
            "--socket",
            "/run/driver.sock",
            "--pid-file",
            "/run/driver.pid",
            "--queue-max",
            "8",
            "--timeout-ms",
            "250",
        ]);
        let Commands::DriverServe(args) = cli.command else {
            panic!("expected driver-serve");
        };
        assert_eq!(args.db, PathBuf::from("/data/catalog.db"));
        assert_eq!(args.socket, Some(PathBuf::from("/run/driver.sock")));
        assert_eq!(args.pid_file, Some(PathBuf::from("/run/driver.pid")));
        assert_eq!(args.queue_max, 8);
        assert_eq!(args.timeout_ms, 250);
    }

    #[test]
    fn driver_serve_defaults_match_the_server() {
        let cli = Cli::parse_from(["lode", "driver-serve", "--db", "/data/catalog.db"]);
        let Commands::DriverServe(args) = cli.command else {
            panic!("expected driver-serve");
        };
        assert_eq!(args.queue_max, DEFAULT_QUEUE_MAX);
        assert_eq!(args.timeout_ms, DEFAULT_COMMAND_TIMEOUT_MS);
        assert!(args.socket.is_none());
    }

    #[test]
    fn worker_kinds_parse_by_name() {
        for (name, expect) in [
            ("watcher", WorkerKind::Watcher),
            ("vectorization", WorkerKind::Vectorization),
            ("repair", WorkerKind::Repair),
        ] {
            let cli = Cli::parse_from(["lode", "worker", name]);
            let Commands::Worker { kind } = cli.command else {
                panic!("expected worker");
            };
            assert_eq!(kind, expect);
        }
    }

    #[test]
    fn worker_argv_round_trips_through_the_parser() {
        for kind in [
            WorkerKind::Watcher,
            WorkerKind::Vectorization,
            WorkerKind::Repair,
        ] {
            let argv = worker_argv(kind, Some(Path::new("/tmp/lodestone.toml"))).unwrap();
            let cli = Cli::parse_from(argv.iter().map(String::as_str));
            let Commands::Worker { kind: parsed } = cli.command else {
                panic!("expected worker");
            };
            assert_eq!(parsed, kind);
            assert_eq!(cli.config, Some(PathBuf::from("/tmp/lodestone.toml")));
        }
    }

    #[test]
    fn status_json_flag_parses() {
        let cli = Cli::parse_from(["lode", "status", "--json"]);
        assert!(matches!(cli.command, Commands::Status { json: true }));

        let cli = Cli::parse_from(["lode", "driver", "status", "--json"]);
        assert!(matches!(
            cli.command,
            Commands::Driver(DriverCommands::Status { json: true })
        ));
    }
}
