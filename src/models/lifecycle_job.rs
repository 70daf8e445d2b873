//! Archive and restore jobs, stored in one table and tagged by kind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Archive,
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Archive => f.write_str("archive"),
            JobKind::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Retrieval speed requested from the archival tier. Faster tiers cost more.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RestoreTier {
    #[serde(alias = "fast")]
    Expedited,
    #[default]
    Standard,
    Bulk,
}

impl RestoreTier {
    /// Estimated hours until the retrieval is readable.
    pub fn eta_hours(self) -> f64 {
        match self {
            RestoreTier::Expedited => 0.1,
            RestoreTier::Standard => 4.0,
            RestoreTier::Bulk => 8.0,
        }
    }

    pub fn eta(self) -> Duration {
        Duration::milliseconds((self.eta_hours() * 3_600_000.0) as i64)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestoreTier::Expedited => "expedited",
            RestoreTier::Standard => "standard",
            RestoreTier::Bulk => "bulk",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct LifecycleJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub owner_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0..=100, never decreases while in progress.
    pub progress: i64,
    pub retry_count: i64,
    /// Restore jobs only.
    pub restore_tier: Option<RestoreTier>,
    /// Retrieval handle for asynchronous restores.
    pub backend_job_ref: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
