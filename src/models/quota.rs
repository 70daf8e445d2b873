//! Plans, subscriptions and usage accounting rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub storage_limit_bytes: i64,
    /// Some plan tiers cap individual file size as well.
    pub max_file_size_bytes: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan_id: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|at| at > now)
    }
}

/// Usage counters for one user in one calendar month (`YYYY-MM`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct QuotaRecord {
    pub user_id: Uuid,
    pub period: String,
    pub uploaded_bytes: i64,
    pub downloaded_bytes: i64,
    pub deleted_bytes: i64,
    pub current_storage_bytes: i64,
    pub peak_storage_bytes: i64,
    pub upload_limit_bytes: i64,
    pub download_limit_bytes: i64,
    pub storage_limit_bytes: i64,
    pub abuse_score: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct LifetimeUsage {
    pub user_id: Uuid,
    pub total_uploaded_bytes: i64,
    pub total_downloaded_bytes: i64,
    pub total_deleted_bytes: i64,
    pub upload_count: i64,
    pub download_count: i64,
    pub delete_count: i64,
    pub abuse_score: f64,
    pub flagged: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Upload,
    Download,
    Delete,
    Archive,
    Restore,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Upload => "upload",
            ActivityKind::Download => "download",
            ActivityKind::Delete => "delete",
            ActivityKind::Archive => "archive",
            ActivityKind::Restore => "restore",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits that apply to a user right now.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub storage_limit_bytes: i64,
    pub max_file_size_bytes: Option<i64>,
    /// `None` on the free tier.
    pub plan_id: Option<String>,
}

/// Figures exposed to billing and display collaborators.
#[derive(Serialize, Clone, Debug)]
pub struct UsageReport {
    pub user_id: Uuid,
    pub used_bytes: i64,
    pub limit_bytes: i64,
    pub remaining_bytes: i64,
    pub percent_used: f64,
    pub max_file_size_bytes: Option<i64>,
    pub plan_id: Option<String>,
}
