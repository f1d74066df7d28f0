//! Driver server: the single process allowed to write the catalog database.
//!
//! Listens on a Unix domain socket for newline-delimited JSON commands and
//! executes them one at a time on a dedicated thread that owns the SQLite
//! connection. Every other process (supervisor, workers, CLI) talks to the
//! catalog through this server, so write serialization is structural rather
//! than contended.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::UnixStream as StdUnixStream;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use super::protocol::{DriverRequest, DriverResponse, decode_request, encode};
use crate::error::{DriverError, Error, Result};
use crate::pid_file;
use crate::storage::CatalogStore;

const MAX_REQUEST_LINE_BYTES: usize = 8 * 1024 * 1024;

/// How often the executor thread wakes to check the shutdown flag when no
/// commands are queued.
const EXECUTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_QUEUE_MAX: usize = 64;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// One queued command plus the channel its response goes back on.
struct Job {
    request: DriverRequest,
    reply: oneshot::Sender<DriverResponse>,
}

/// Configured but not yet running driver server.
#[derive(Debug)]
pub struct DriverServer {
    db_path: PathBuf,
    socket_path: PathBuf,
    pid_file: Option<PathBuf>,
    queue_max: usize,
    command_timeout: Duration,
}

impl DriverServer {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            socket_path: socket_path.into(),
            pid_file: None,
            queue_max: DEFAULT_QUEUE_MAX,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
        }
    }

    /// Record this server's pid at the given path while it runs.
    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_queue_max(mut self, queue_max: usize) -> Self {
        self.queue_max = queue_max.max(1);
        self
    }

    #[must_use]
    pub fn with_command_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.command_timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Bind the socket and serve until a shutdown command or SIGTERM arrives.
    ///
    /// The socket and pid file are removed on the way out.
    pub async fn run(self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        maybe_cleanup_stale_socket(&self.socket_path)?;

        let listener = UnixListener::bind(&self.socket_path)?;
        let _socket_guard = SocketGuard {
            path: self.socket_path.clone(),
        };

        let store = CatalogStore::open(&self.db_path).map_err(Error::Storage)?;

        if let Some(path) = &self.pid_file {
            pid_file::write_pid_file(path, std::process::id())?;
        }

        let (job_tx, job_rx) = bounded::<Job>(self.queue_max);
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let executor_shutdown = Arc::clone(&shutdown);
        let executor = std::thread::Builder::new()
            .name("lode-driver-executor".to_string())
            .spawn(move || run_executor(store, &job_rx, &executor_shutdown))?;

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        info!(
            socket = %self.socket_path.display(),
            db = %self.db_path.display(),
            queue_max = self.queue_max,
            "driver server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let jobs = job_tx.clone();
                        let flag = Arc::clone(&shutdown);
                        let wake = Arc::clone(&notify);
                        let command_timeout = self.command_timeout;
                        tokio::spawn(async move {
                            if let Err(err) =
                                handle_connection(stream, jobs, flag, wake, command_timeout).await
                            {
                                debug!(error = %err, "driver connection closed with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, path = %self.socket_path.display(), "driver accept failed");
                    }
                },
                _ = sigterm.recv() => {
                    info!("driver server received SIGTERM");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                () = notify.notified() => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        drop(job_tx);
        let joined = tokio::task::spawn_blocking(move || executor.join()).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(_panic)) => warn!("driver executor thread panicked during shutdown"),
            Err(err) => warn!(error = %err, "failed to join driver executor thread"),
        }

        if let Some(path) = &self.pid_file {
            pid_file::remove_pid_file(path)?;
        }
        info!(socket = %self.socket_path.display(), "driver server stopped");
        Ok(())
    }
}

/// Removes the socket path when the server exits by any route.
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to remove driver socket on shutdown"
                );
            }
        }
    }
}

/// Remove a leftover socket file when nothing is listening on it.
///
/// A connectable socket means another server is live on this path, which is
/// a hard error: two writers behind one path would defeat the whole design.
fn maybe_cleanup_stale_socket(socket_path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(socket_path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::Io(err)),
    };

    #[cfg(unix)]
    let is_socket = metadata.file_type().is_socket();
    #[cfg(not(unix))]
    let is_socket = false;

    if !is_socket {
        return Err(Error::Driver(DriverError::SocketInUse {
            path: socket_path.display().to_string(),
        }));
    }

    #[cfg(unix)]
    match StdUnixStream::connect(socket_path) {
        Ok(_stream) => Err(Error::Driver(DriverError::SocketInUse {
            path: socket_path.display().to_string(),
        })),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
            ) =>
        {
            std::fs::remove_file(socket_path)?;
            debug!(
                path = %socket_path.display(),
                "removed stale driver socket before bind"
            );
            Ok(())
        }
        Err(err) => Err(Error::Io(err)),
    }

    #[cfg(not(unix))]
    Err(Error::Driver(DriverError::SocketInUse {
        path: socket_path.display().to_string(),
    }))
}

/// Blocking loop on the thread that owns the database connection.
///
/// Wakes at least every `EXECUTOR_POLL_INTERVAL` so a shutdown with idle
/// connections still terminates; queued commands are drained before exit.
fn run_executor(mut store: CatalogStore, jobs: &Receiver<Job>, shutdown: &AtomicBool) {
    loop {
        match jobs.recv_timeout(EXECUTOR_POLL_INTERVAL) {
            Ok(job) => {
                let response = execute(&mut store, job.request);
                let _ = job.reply.send(response);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("driver executor thread exiting");
}

fn execute(store: &mut CatalogStore, request: DriverRequest) -> DriverResponse {
    let result = match request {
        DriverRequest::Ping => Ok(DriverResponse::Pong),
        DriverRequest::Shutdown => Ok(DriverResponse::Ok),
        DriverRequest::UpsertFile(upsert) => store
            .upsert_file(&upsert)
            .map(|id| DriverResponse::FileId { id }),
        DriverRequest::MarkDeleted { path, version_path } => store
            .mark_deleted(&path, version_path.as_deref())
            .map(|changed| DriverResponse::Updated { changed }),
        DriverRequest::RestoreFile { path } => store
            .restore_file(&path)
            .map(|changed| DriverResponse::Updated { changed }),
        DriverRequest::PendingEmbeddings { limit } => store
            .pending_embeddings(limit)
            .map(|files| DriverResponse::Pending { files }),
        DriverRequest::StoreEmbedding {
            file_id,
            model,
            dim,
            vectors,
        } => store
            .store_embedding(file_id, &model, dim, &vectors)
            .map(|_chunks| DriverResponse::Ok),
        DriverRequest::ListFiles {
            project,
            offset,
            limit,
            include_deleted,
        } => store
            .list_files(project.as_deref(), offset, limit, include_deleted)
            .map(|files| DriverResponse::Files { files }),
        DriverRequest::Counts => store
            .counts()
            .map(|counts| DriverResponse::Counts { counts }),
    };

    result.unwrap_or_else(|err| DriverResponse::Error {
        message: err.to_string(),
    })
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    jobs: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    command_timeout: Duration,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > MAX_REQUEST_LINE_BYTES {
            warn!(len = line.len(), "driver request line too large; rejecting");
            let response = DriverResponse::Error {
                message: format!("request exceeds {MAX_REQUEST_LINE_BYTES} bytes"),
            };
            write_response(&mut write_half, &response).await?;
            continue;
        }

        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "failed to decode driver request");
                let response = DriverResponse::Error {
                    message: err.to_string(),
                };
                write_response(&mut write_half, &response).await?;
                continue;
            }
        };

        match request {
            DriverRequest::Ping => {
                write_response(&mut write_half, &DriverResponse::Pong).await?;
            }
            DriverRequest::Shutdown => {
                write_response(&mut write_half, &DriverResponse::Ok).await?;
                info!("driver server received shutdown command");
                shutdown.store(true, Ordering::SeqCst);
                notify.notify_one();
                break;
            }
            other => {
                let response = dispatch(&jobs, other, command_timeout).await;
                write_response(&mut write_half, &response).await?;
            }
        }
    }

    Ok(())
}

/// Queue one command for the executor and wait for its reply.
async fn dispatch(jobs: &Sender<Job>, request: DriverRequest, timeout: Duration) -> DriverResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    match jobs.try_send(Job {
        request,
        reply: reply_tx,
    }) {
        Err(TrySendError::Full(_)) => return DriverResponse::Busy,
        Err(TrySendError::Disconnected(_)) => {
            return DriverResponse::Error {
                message: "driver executor is not running".to_string(),
            };
        }
        Ok(()) => {}
    }

    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(response)) => response,
        Ok(Err(_dropped)) => DriverResponse::Error {
            message: "driver executor dropped the command".to_string(),
        },
        Err(_elapsed) => DriverResponse::Timeout,
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DriverResponse,
) -> std::io::Result<()> {
    let line = encode(response).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileUpsert;
    use tokio::net::UnixStream;

    fn sample_upsert(path: &str, hash: &str) -> FileUpsert {
        FileUpsert {
            project: "demo".to_string(),
            path: path.to_string(),
            size_bytes: 8,
            mtime_ms: 1_000,
            content_hash: hash.to_string(),
            version_path: None,
        }
    }

    // ---- execute ----

    #[test]
    fn execute_upsert_then_counts() {
        let mut store = CatalogStore::open_in_memory().unwrap();

        let response = execute(
            &mut store,
            DriverRequest::UpsertFile(sample_upsert("a.rs", "h1")),
        );
        let DriverResponse::FileId { id } = response else {
            panic!("expected file_id, got {response:?}");
        };
        assert!(id > 0);

        let response = execute(&mut store, DriverRequest::Counts);
        let DriverResponse::Counts { counts } = response else {
            panic!("expected counts, got {response:?}");
        };
        assert_eq!(counts.total_files, 1);
        assert_eq!(counts.pending_embeddings, 1);
    }

    #[test]
    fn execute_maps_storage_errors_to_error_responses() {
        let mut store = CatalogStore::open_in_memory().unwrap();
        let response = execute(
            &mut store,
            DriverRequest::StoreEmbedding {
                file_id: 999,
                model: "hash-v1".to_string(),
                dim: 2,
                vectors: vec![vec![0.0, 1.0]],
            },
        );
        let DriverResponse::Error { message } = response else {
            panic!("expected error, got {response:?}");
        };
        assert!(message.contains("999"), "unexpected message: {message}");
    }

    #[test]
    fn execute_answers_ping_and_shutdown_inline_arms() {
        let mut store = CatalogStore::open_in_memory().unwrap();
        assert_eq!(execute(&mut store, DriverRequest::Ping), DriverResponse::Pong);
        assert_eq!(
            execute(&mut store, DriverRequest::Shutdown),
            DriverResponse::Ok
        );
    }

    // ---- socket lifecycle ----

    use crate::driver::protocol::decode_response;

    type ResponseLines = tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>;
    type ServerTask = tokio::task::JoinHandle<Result<()>>;

    fn spawn_server(dir: &tempfile::TempDir) -> (PathBuf, ServerTask) {
        let socket_path = dir.path().join("driver.sock");
        let db_path = dir.path().join("catalog.db");
        let server = tokio::spawn(DriverServer::new(db_path, socket_path.clone()).run());
        (socket_path, server)
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("driver socket never appeared at {}", path.display());
    }

    async fn connect(path: &Path) -> (ResponseLines, OwnedWriteHalf) {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn roundtrip(
        lines: &mut ResponseLines,
        writer: &mut OwnedWriteHalf,
        request: &str,
    ) -> String {
        writer.write_all(request.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for driver response")
            .unwrap()
            .expect("driver closed the connection")
    }

    async fn shut_down(socket_path: &Path, server: ServerTask) {
        let (mut lines, mut writer) = connect(socket_path).await;
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"shutdown"}"#).await;
        assert_eq!(reply, r#"{"result":"ok"}"#);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ping_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;

        let (mut lines, mut writer) = connect(&socket_path).await;
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"ping"}"#).await;
        assert_eq!(reply, r#"{"result":"pong"}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn upsert_and_query_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;

        let upsert = encode(&DriverRequest::UpsertFile(sample_upsert("src/a.rs", "h1"))).unwrap();
        let reply = roundtrip(&mut lines, &mut writer, &upsert).await;
        let DriverResponse::FileId { id } = decode_response(&reply).unwrap() else {
            panic!("expected file_id, got {reply}");
        };
        assert!(id > 0);

        let reply =
            roundtrip(&mut lines, &mut writer, r#"{"cmd":"pending_embeddings","limit":10}"#).await;
        let DriverResponse::Pending { files } = decode_response(&reply).unwrap() else {
            panic!("expected pending, got {reply}");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/a.rs");

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn delete_and_restore_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;

        let upsert = encode(&DriverRequest::UpsertFile(sample_upsert("gone.rs", "h1"))).unwrap();
        roundtrip(&mut lines, &mut writer, &upsert).await;

        let reply =
            roundtrip(&mut lines, &mut writer, r#"{"cmd":"mark_deleted","path":"gone.rs"}"#).await;
        assert_eq!(reply, r#"{"result":"updated","changed":true}"#);

        let reply =
            roundtrip(&mut lines, &mut writer, r#"{"cmd":"restore_file","path":"gone.rs"}"#).await;
        assert_eq!(reply, r#"{"result":"updated","changed":true}"#);

        // a second restore is a no-op
        let reply =
            roundtrip(&mut lines, &mut writer, r#"{"cmd":"restore_file","path":"gone.rs"}"#).await;
        assert_eq!(reply, r#"{"result":"updated","changed":false}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn malformed_line_keeps_connection_usable() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;

        let reply = roundtrip(&mut lines, &mut writer, "this is not json").await;
        assert!(reply.contains(r#""result":"error""#), "got {reply}");

        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"explode"}"#).await;
        assert!(reply.contains(r#""result":"error""#), "got {reply}");

        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"ping"}"#).await;
        assert_eq!(reply, r#"{"result":"pong"}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;

        writer.write_all(b"\n  \n").await.unwrap();
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"ping"}"#).await;
        assert_eq!(reply, r#"{"result":"pong"}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced_on_bind() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("driver.sock");

        // Bind and drop without unlinking, leaving a dead socket file behind.
        let stale = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        drop(stale);
        assert!(socket_path.exists());

        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;

        let (mut lines, mut writer) = connect(&socket_path).await;
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"ping"}"#).await;
        assert_eq!(reply, r#"{"result":"pong"}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn second_server_on_live_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;

        let err = DriverServer::new(dir.path().join("other.db"), socket_path.clone())
            .run()
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Driver(DriverError::SocketInUse { .. })),
            "expected SocketInUse, got {err:?}"
        );

        // the first server is unaffected
        let (mut lines, mut writer) = connect(&socket_path).await;
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"ping"}"#).await;
        assert_eq!(reply, r#"{"result":"pong"}"#);

        shut_down(&socket_path, server).await;
    }

    #[tokio::test]
    async fn shutdown_removes_socket_and_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("driver.sock");
        let pid_path = dir.path().join("driver.pid");

        let server = tokio::spawn(
            DriverServer::new(dir.path().join("catalog.db"), socket_path.clone())
                .with_pid_file(pid_path.clone())
                .run(),
        );
        wait_for_socket(&socket_path).await;
        assert_eq!(
            pid_file::read_pid_file(&pid_path),
            Some(std::process::id())
        );

        shut_down(&socket_path, server).await;

        assert!(!socket_path.exists(), "socket file left behind");
        assert!(!pid_path.exists(), "pid file left behind");
    }

    #[tokio::test]
    async fn data_survives_server_restart() {
        let dir = tempfile::tempdir().unwrap();

        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;
        let upsert = encode(&DriverRequest::UpsertFile(sample_upsert("keep.rs", "h1"))).unwrap();
        roundtrip(&mut lines, &mut writer, &upsert).await;
        drop((lines, writer));
        shut_down(&socket_path, server).await;

        // same db path, fresh server
        let (socket_path, server) = spawn_server(&dir);
        wait_for_socket(&socket_path).await;
        let (mut lines, mut writer) = connect(&socket_path).await;
        let reply = roundtrip(&mut lines, &mut writer, r#"{"cmd":"counts"}"#).await;
        let DriverResponse::Counts { counts } = decode_response(&reply).unwrap() else {
            panic!("expected counts, got {reply}");
        };
        assert_eq!(counts.total_files, 1);
        shut_down(&socket_path, server).await;
    }
}
