//! Typed client for the driver socket.
//!
//! One call maps to one request line and one response line. The connection
//! is opened lazily, kept for reuse, and re-established once when a send
//! hits a dead socket (a restarted server invalidates old connections).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::protocol::{DriverRequest, DriverResponse, decode_response, encode};
use super::server::DEFAULT_COMMAND_TIMEOUT_MS;
use crate::backoff::{BackoffPolicy, with_backoff};
use crate::error::{DriverError, Error, Result};
use crate::storage::{CatalogCounts, FileRecord, FileUpsert, PendingFile};

#[derive(Debug)]
pub struct DriverClient {
    socket_path: PathBuf,
    timeout: Duration,
    connect_backoff: BackoffPolicy,
    stream: Option<BufReader<UnixStream>>,
}

impl DriverClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            connect_backoff: BackoffPolicy::for_connect(),
            stream: None,
        }
    }

    /// Set the per-command timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Duration::from_millis(ms);
        self
    }

    /// Replace the connection retry policy.
    #[must_use]
    pub fn with_connect_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.connect_backoff = policy;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    // ---- typed commands ----

    pub async fn ping(&mut self) -> Result<()> {
        match self.exchange(&DriverRequest::Ping).await? {
            DriverResponse::Pong => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Insert or refresh a file row, returning its catalog id.
    pub async fn upsert_file(&mut self, upsert: FileUpsert) -> Result<i64> {
        match self.exchange(&DriverRequest::UpsertFile(upsert)).await? {
            DriverResponse::FileId { id } => Ok(id),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Soft-delete a path. Returns false when no active row matched.
    pub async fn mark_deleted(&mut self, path: &str, version_path: Option<&str>) -> Result<bool> {
        let request = DriverRequest::MarkDeleted {
            path: path.to_string(),
            version_path: version_path.map(str::to_string),
        };
        match self.exchange(&request).await? {
            DriverResponse::Updated { changed } => Ok(changed),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Undo a soft delete. Returns false when no deleted row matched.
    pub async fn restore_file(&mut self, path: &str) -> Result<bool> {
        let request = DriverRequest::RestoreFile {
            path: path.to_string(),
        };
        match self.exchange(&request).await? {
            DriverResponse::Updated { changed } => Ok(changed),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn pending_embeddings(&mut self, limit: usize) -> Result<Vec<PendingFile>> {
        match self
            .exchange(&DriverRequest::PendingEmbeddings { limit })
            .await?
        {
            DriverResponse::Pending { files } => Ok(files),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn store_embedding(
        &mut self,
        file_id: i64,
        model: &str,
        dim: usize,
        vectors: Vec<Vec<f32>>,
    ) -> Result<()> {
        let request = DriverRequest::StoreEmbedding {
            file_id,
            model: model.to_string(),
            dim,
            vectors,
        };
        match self.exchange(&request).await? {
            DriverResponse::Ok => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn list_files(
        &mut self,
        project: Option<&str>,
        offset: usize,
        limit: usize,
        include_deleted: bool,
    ) -> Result<Vec<FileRecord>> {
        let request = DriverRequest::ListFiles {
            project: project.map(str::to_string),
            offset,
            limit,
            include_deleted,
        };
        match self.exchange(&request).await? {
            DriverResponse::Files { files } => Ok(files),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn counts(&mut self) -> Result<CatalogCounts> {
        match self.exchange(&DriverRequest::Counts).await? {
            DriverResponse::Counts { counts } => Ok(counts),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Ask the server to drain and exit, then drop the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        let response = self.exchange(&DriverRequest::Shutdown).await?;
        self.stream = None;
        match response {
            DriverResponse::Ok => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    // ---- wire plumbing ----

    /// Send one request line and read one response line, reconnecting once
    /// when the cached connection turns out to be dead.
    async fn exchange(&mut self, request: &DriverRequest) -> Result<DriverResponse> {
        let line = encode(request)?;
        let had_stream = self.stream.is_some();
        let mut outcome = self.try_exchange(&line).await;
        if had_stream {
            if let Err(Error::Io(err)) = &outcome {
                debug!(error = %err, "driver connection went stale; reconnecting");
                outcome = self.try_exchange(&line).await;
            }
        }
        self.map_common(outcome)
    }

    /// Map protocol-level saturation responses onto typed errors.
    fn map_common(&self, response: Result<DriverResponse>) -> Result<DriverResponse> {
        match response? {
            DriverResponse::Busy => Err(Error::Driver(DriverError::Busy)),
            DriverResponse::Timeout => Err(Error::Driver(DriverError::CommandTimeout(
                self.timeout_ms(),
            ))),
            DriverResponse::Error { message } => Err(Error::Driver(DriverError::Remote(message))),
            other => Ok(other),
        }
    }

    async fn try_exchange(&mut self, line: &str) -> Result<DriverResponse> {
        self.ensure_connected().await?;
        let outcome = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(Error::Driver(DriverError::NotRunning));
            };
            tokio::time::timeout(self.timeout, async {
                stream.get_mut().write_all(line.as_bytes()).await?;
                stream.get_mut().write_all(b"\n").await?;
                stream.get_mut().flush().await?;
                let mut reply = String::new();
                let read = stream.read_line(&mut reply).await?;
                Ok::<_, std::io::Error>((read, reply))
            })
            .await
        };

        match outcome {
            Err(_elapsed) => {
                // The response may still arrive later and would desync the
                // stream, so the connection cannot be reused.
                self.stream = None;
                Err(Error::Driver(DriverError::CommandTimeout(
                    self.timeout_ms(),
                )))
            }
            Ok(Err(err)) => {
                self.stream = None;
                Err(Error::Io(err))
            }
            Ok(Ok((0, _))) => {
                self.stream = None;
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "driver closed the connection",
                )))
            }
            Ok(Ok((_, reply))) => Ok(decode_response(reply.trim_end())?),
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let path = self.socket_path.clone();
        let connected = with_backoff(&self.connect_backoff, "driver_connect", || {
            let path = path.clone();
            async move { UnixStream::connect(&path).await }
        })
        .await;

        match connected {
            Ok(stream) => {
                debug!(path = %self.socket_path.display(), "connected to driver socket");
                self.stream = Some(BufReader::new(stream));
                Ok(())
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(Error::Driver(DriverError::NotRunning))
            }
            Err(err) => Err(Error::Driver(DriverError::ConnectFailed {
                path: self.socket_path.display().to_string(),
                message: err.to_string(),
            })),
        }
    }

    fn unexpected(&self, response: &DriverResponse) -> Error {
        Error::Driver(DriverError::Protocol(format!(
            "unexpected driver response: {response:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::server::DriverServer;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(10),
            1.0,
            0.0,
            Some(2),
        )
    }

    fn sample_upsert(path: &str, hash: &str) -> FileUpsert {
        FileUpsert {
            project: "demo".to_string(),
            path: path.to_string(),
            size_bytes: 16,
            mtime_ms: 2_000,
            content_hash: hash.to_string(),
            version_path: None,
        }
    }

    async fn start_server(dir: &tempfile::TempDir) -> (PathBuf, tokio::task::JoinHandle<Result<()>>) {
        let socket_path = dir.path().join("driver.sock");
        let db_path = dir.path().join("catalog.db");
        let server = tokio::spawn(DriverServer::new(db_path, socket_path.clone()).run());
        for _ in 0..200 {
            if socket_path.exists() {
                return (socket_path, server);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("driver socket never appeared");
    }

    #[tokio::test]
    async fn ping_connects_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = start_server(&dir).await;

        let mut client = DriverClient::new(&socket_path);
        assert!(!client.is_connected());
        client.ping().await.unwrap();
        assert!(client.is_connected());

        client.shutdown().await.unwrap();
        assert!(!client.is_connected());
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_socket_maps_to_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = DriverClient::new(dir.path().join("absent.sock"))
            .with_connect_backoff(fast_backoff());

        let err = client.ping().await.unwrap_err();
        assert!(
            matches!(err, Error::Driver(DriverError::NotRunning)),
            "expected NotRunning, got {err:?}"
        );
    }

    #[tokio::test]
    async fn embedding_flow_through_typed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = start_server(&dir).await;
        let mut client = DriverClient::new(&socket_path);

        let id = client.upsert_file(sample_upsert("src/a.rs", "h1")).await.unwrap();
        assert!(id > 0);

        let pending = client.pending_embeddings(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_id, id);

        client
            .store_embedding(id, "hash-v1", 2, vec![vec![0.5, 0.5]])
            .await
            .unwrap();

        assert!(client.pending_embeddings(10).await.unwrap().is_empty());
        let counts = client.counts().await.unwrap();
        assert_eq!(counts.embedded_files, 1);
        assert_eq!(counts.embedding_rows, 1);

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn delete_and_restore_through_typed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = start_server(&dir).await;
        let mut client = DriverClient::new(&socket_path);

        client.upsert_file(sample_upsert("gone.rs", "h1")).await.unwrap();
        assert!(client.mark_deleted("gone.rs", None).await.unwrap());
        assert!(!client.mark_deleted("gone.rs", None).await.unwrap());

        let listed = client.list_files(None, 0, 10, true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].deleted);

        assert!(client.restore_file("gone.rs").await.unwrap());
        let listed = client.list_files(None, 0, 10, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].deleted);

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_failures_surface_as_remote_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = start_server(&dir).await;
        let mut client = DriverClient::new(&socket_path);

        let err = client
            .store_embedding(404, "hash-v1", 2, vec![vec![0.0, 1.0]])
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Driver(DriverError::Remote(_))),
            "expected Remote, got {err:?}"
        );

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnects_to_a_replacement_server() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, server) = start_server(&dir).await;
        let mut client = DriverClient::new(&socket_path);

        client.upsert_file(sample_upsert("keep.rs", "h1")).await.unwrap();
        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();

        // same path, new server: the client reconnects on the next call
        let (_socket_path, server) = start_server(&dir).await;
        let counts = client.counts().await.unwrap();
        assert_eq!(counts.total_files, 1);

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
