//! The file registry row and the lifecycle state machine that governs it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// USD per GB-month while the object sits in the warm tier.
pub const WARM_RATE_PER_GB_MONTH: f64 = 0.023;
/// USD per GB-month once the object lives only in the archival tier.
pub const ARCHIVE_RATE_PER_GB_MONTH: f64 = 0.00099;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Lifecycle status of a file.
///
/// `uploading → uploaded → archiving → archived → restoring → restored`, with
/// `failed` reachable from every active transition. Soft deletion is tracked
/// separately on the record and is not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploading,
    Uploaded,
    Archiving,
    Archived,
    Restoring,
    Restored,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Archiving => "archiving",
            FileStatus::Archived => "archived",
            FileStatus::Restoring => "restoring",
            FileStatus::Restored => "restored",
            FileStatus::Failed => "failed",
        }
    }

    /// Archive starts from a warm copy. `restored` is treated like `uploaded`.
    pub fn can_archive(self) -> bool {
        matches!(self, FileStatus::Uploaded | FileStatus::Restored)
    }

    pub fn can_restore(self) -> bool {
        self == FileStatus::Archived
    }

    /// No content exists yet while uploading, so abort is the only way out.
    /// Files under job control wait for the job (or its timeout) to settle.
    pub fn can_soft_delete(self) -> bool {
        !matches!(
            self,
            FileStatus::Uploading | FileStatus::Archiving | FileStatus::Restoring
        )
    }

    /// A readable copy exists in the warm tier.
    pub fn is_warm(self) -> bool {
        matches!(self, FileStatus::Uploaded | FileStatus::Restored)
    }

    /// Waiting on an external backend to finish.
    pub fn is_in_transit(self) -> bool {
        matches!(self, FileStatus::Archiving | FileStatus::Restoring)
    }

    /// Statuses a given action may start from.
    pub fn sources_for(action: Transition) -> &'static [FileStatus] {
        match action {
            Transition::Finalize => &[FileStatus::Uploading],
            Transition::BeginArchive => &[FileStatus::Uploaded, FileStatus::Restored],
            Transition::FinishArchive => &[FileStatus::Archiving],
            Transition::BeginRestore => &[FileStatus::Archived],
            Transition::FinishRestore => &[FileStatus::Restoring],
            Transition::CancelRestore => &[FileStatus::Restoring],
            Transition::Recover => &[FileStatus::Failed],
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named edges of the state machine, used for compare-and-set updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Finalize,
    BeginArchive,
    FinishArchive,
    BeginRestore,
    FinishRestore,
    CancelRestore,
    Recover,
}

impl Transition {
    pub fn target(self) -> FileStatus {
        match self {
            Transition::Finalize => FileStatus::Uploaded,
            Transition::BeginArchive => FileStatus::Archiving,
            Transition::FinishArchive => FileStatus::Archived,
            Transition::BeginRestore => FileStatus::Restoring,
            Transition::FinishRestore => FileStatus::Restored,
            Transition::CancelRestore => FileStatus::Archived,
            Transition::Recover => FileStatus::Uploaded,
        }
    }

    pub fn allows(self, from: FileStatus) -> bool {
        FileStatus::sources_for(self).contains(&from)
    }
}

/// Metadata for one logical file. Content lives in the object store or the
/// archival tier, never here.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub display_name: String,
    /// Immutable once the record exists.
    pub size_bytes: i64,
    pub content_type: Option<String>,
    /// Warm-tier key. Cleared while the file only exists in the archive.
    pub object_key: Option<String>,
    pub status: FileStatus,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    /// Folder placement, `/`-separated, never containing `..`.
    pub relative_path: String,
    /// Set only while a copy exists in the archival tier.
    pub archive_ref: Option<String>,
    pub restore_eta: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Monthly cost snapshot in USD.
    pub storage_cost: f64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Full logical path including the display name.
    pub fn logical_path(&self) -> String {
        if self.relative_path.is_empty() {
            self.display_name.clone()
        } else {
            format!("{}/{}", self.relative_path, self.display_name)
        }
    }
}

/// Monthly cost of keeping `size_bytes` in the tier implied by `status`.
pub fn storage_cost(size_bytes: i64, status: FileStatus) -> f64 {
    let gb = size_bytes.max(0) as f64 / BYTES_PER_GB;
    let rate = match status {
        FileStatus::Archived | FileStatus::Restoring => ARCHIVE_RATE_PER_GB_MONTH,
        _ => WARM_RATE_PER_GB_MONTH,
    };
    gb * rate
}
