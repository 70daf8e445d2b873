//! Chunked-upload handles and the parts a client reports on completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MultipartState {
    Open,
    Completed,
    Aborted,
}

/// A chunked upload in flight. `id` is the session handle given to the client.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    pub id: Uuid,
    pub owner_id: Uuid,

    /// The `uploading` file record this upload will finalize.
    pub file_id: Uuid,

    /// Optional folder-upload group.
    pub upload_session_id: Option<Uuid>,

    /// Upload id assigned by the object-storage backend.
    pub backend_upload_id: String,

    pub object_key: String,
    pub state: MultipartState,

    /// Highest part number a URL has been issued for.
    pub part_count: i64,

    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A part the client uploaded directly to the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based.
    pub part_number: u32,

    /// ETag returned by the backend for this part.
    pub etag: String,
}
