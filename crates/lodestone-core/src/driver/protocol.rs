//! Wire protocol for the storage driver.
//!
//! Newline-delimited JSON over a local socket: one request object per line
//! in, one response object per line out, matched in order. Requests carry a
//! `cmd` tag, responses a `result` tag. `busy` and `timeout` are protocol
//! outcomes, not errors: they mean the driver is healthy but saturated.

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::storage::{CatalogCounts, FileRecord, FileUpsert, PendingFile};

/// Commands accepted by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DriverRequest {
    /// Liveness probe, answered without touching the database.
    Ping,
    /// Insert or refresh one file row.
    UpsertFile(FileUpsert),
    /// Soft-delete a path.
    MarkDeleted {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_path: Option<String>,
    },
    /// Undo a soft delete.
    RestoreFile { path: String },
    /// Fetch up to `limit` files waiting for embeddings.
    PendingEmbeddings { limit: usize },
    /// Replace one file's chunk vectors and mark it embedded.
    StoreEmbedding {
        file_id: i64,
        model: String,
        dim: usize,
        vectors: Vec<Vec<f32>>,
    },
    /// Page through catalog rows.
    ListFiles {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default)]
        offset: usize,
        limit: usize,
        #[serde(default)]
        include_deleted: bool,
    },
    /// Catalog-wide row counters.
    Counts,
    /// Drain queued work and exit.
    Shutdown,
}

/// Replies from the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DriverResponse {
    Ok,
    Pong,
    FileId { id: i64 },
    Updated { changed: bool },
    Pending { files: Vec<PendingFile> },
    Files { files: Vec<FileRecord> },
    Counts { counts: CatalogCounts },
    /// Inbound queue is full; retry later.
    Busy,
    /// The command missed the driver's execution deadline.
    Timeout,
    Error { message: String },
}

/// Serialize one message to its wire line (without the trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, DriverError> {
    serde_json::to_string(message).map_err(|err| DriverError::Protocol(err.to_string()))
}

pub fn decode_request(line: &str) -> Result<DriverRequest, DriverError> {
    serde_json::from_str(line).map_err(|err| DriverError::Protocol(err.to_string()))
}

pub fn decode_response(line: &str) -> Result<DriverResponse, DriverError> {
    serde_json::from_str(line).map_err(|err| DriverError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- request wire shapes ----

    #[test]
    fn ping_is_a_bare_tag() {
        assert_eq!(encode(&DriverRequest::Ping).unwrap(), r#"{"cmd":"ping"}"#);
        assert_eq!(
            decode_request(r#"{"cmd":"ping"}"#).unwrap(),
            DriverRequest::Ping
        );
    }

    #[test]
    fn upsert_inlines_payload_fields() {
        let request = DriverRequest::UpsertFile(FileUpsert {
            project: "demo".to_string(),
            path: "src/a.rs".to_string(),
            size_bytes: 10,
            mtime_ms: 5,
            content_hash: "h1".to_string(),
            version_path: None,
        });
        let line = encode(&request).unwrap();
        assert_eq!(
            line,
            r#"{"cmd":"upsert_file","project":"demo","path":"src/a.rs","size_bytes":10,"mtime_ms":5,"content_hash":"h1"}"#
        );
        assert_eq!(decode_request(&line).unwrap(), request);
    }

    #[test]
    fn mark_deleted_omits_absent_version_path() {
        let line = encode(&DriverRequest::MarkDeleted {
            path: "gone.rs".to_string(),
            version_path: None,
        })
        .unwrap();
        assert_eq!(line, r#"{"cmd":"mark_deleted","path":"gone.rs"}"#);
    }

    #[test]
    fn store_embedding_roundtrips_vectors() {
        let request = DriverRequest::StoreEmbedding {
            file_id: 7,
            model: "hash-v1".to_string(),
            dim: 2,
            vectors: vec![vec![0.5, -1.0], vec![1.5, 2.0]],
        };
        let line = encode(&request).unwrap();
        assert_eq!(decode_request(&line).unwrap(), request);
    }

    #[test]
    fn list_files_defaults_apply_on_decode() {
        let request = decode_request(r#"{"cmd":"list_files","limit":50}"#).unwrap();
        assert_eq!(
            request,
            DriverRequest::ListFiles {
                project: None,
                offset: 0,
                limit: 50,
                include_deleted: false,
            }
        );
    }

    // ---- response wire shapes ----

    #[test]
    fn scalar_responses_have_exact_shapes() {
        assert_eq!(encode(&DriverResponse::Ok).unwrap(), r#"{"result":"ok"}"#);
        assert_eq!(
            encode(&DriverResponse::Pong).unwrap(),
            r#"{"result":"pong"}"#
        );
        assert_eq!(
            encode(&DriverResponse::Busy).unwrap(),
            r#"{"result":"busy"}"#
        );
        assert_eq!(
            encode(&DriverResponse::Timeout).unwrap(),
            r#"{"result":"timeout"}"#
        );
        assert_eq!(
            encode(&DriverResponse::FileId { id: 12 }).unwrap(),
            r#"{"result":"file_id","id":12}"#
        );
        assert_eq!(
            encode(&DriverResponse::Updated { changed: true }).unwrap(),
            r#"{"result":"updated","changed":true}"#
        );
    }

    #[test]
    fn counts_response_nests_the_counters() {
        let response = DriverResponse::Counts {
            counts: CatalogCounts {
                total_files: 3,
                active_files: 2,
                deleted_files: 1,
                pending_embeddings: 1,
                embedded_files: 1,
                embedding_rows: 4,
            },
        };
        let line = encode(&response).unwrap();
        assert!(line.starts_with(r#"{"result":"counts","counts":{"#));
        assert_eq!(decode_response(&line).unwrap(), response);
    }

    #[test]
    fn pending_response_roundtrips() {
        let response = DriverResponse::Pending {
            files: vec![PendingFile {
                file_id: 1,
                project: "demo".to_string(),
                path: "a.rs".to_string(),
                content_hash: "h".to_string(),
                version_path: Some("versions/aa/h".to_string()),
            }],
        };
        let line = encode(&response).unwrap();
        assert_eq!(decode_response(&line).unwrap(), response);
    }

    // ---- malformed input ----

    #[test]
    fn unknown_command_is_a_protocol_error() {
        let err = decode_request(r#"{"cmd":"explode"}"#).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn garbage_line_is_a_protocol_error() {
        assert!(decode_request("not json at all").is_err());
        assert!(decode_response("{\"result\":").is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        // store_embedding without a file id
        let err =
            decode_request(r#"{"cmd":"store_embedding","model":"m","dim":1,"vectors":[]}"#)
                .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }
}
