//! A group of files uploaded together, e.g. a dragged folder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UploadSessionStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub root_directory: Option<String>,
    pub total_files: i64,
    pub uploaded_files: i64,
    pub failed_files: i64,
    pub status: UploadSessionStatus,
    /// JSON snapshot of the folder tree as the client described it.
    pub directory_structure: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn progress_percent(&self) -> f64 {
        if self.total_files <= 0 {
            return 0.0;
        }
        (self.uploaded_files as f64 / self.total_files as f64 * 100.0).min(100.0)
    }
}
