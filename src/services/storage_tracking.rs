//! StorageTracker: activity accounting for quota reporting and abuse checks.
//!
//! Counters are additive. The only path that lowers a figure is `resync`,
//! which replaces the stored storage total with the live aggregate.

use crate::{
    config::EngineConfig,
    errors::{EngineError, EngineResult, QuotaDetails, QuotaKind},
    models::quota::{ActivityKind, LifetimeUsage, QuotaRecord},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const QUOTA_COLUMNS: &str = "user_id, period, uploaded_bytes, downloaded_bytes, deleted_bytes, \
    current_storage_bytes, peak_storage_bytes, upload_limit_bytes, download_limit_bytes, \
    storage_limit_bytes, abuse_score, updated_at";

const LIFETIME_COLUMNS: &str = "user_id, total_uploaded_bytes, total_downloaded_bytes, \
    total_deleted_bytes, upload_count, download_count, delete_count, abuse_score, flagged, \
    updated_at";

/// One tracked activity. Bulk operations report a single event covering
/// `file_count` files.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub user_id: Uuid,
    pub kind: ActivityKind,
    pub bytes: i64,
    pub file_count: i64,
    pub file_id: Option<Uuid>,
}

impl ActivityEvent {
    pub fn single(user_id: Uuid, kind: ActivityKind, file_id: Uuid, bytes: i64) -> Self {
        Self {
            user_id,
            kind,
            bytes,
            file_count: 1,
            file_id: Some(file_id),
        }
    }

    pub fn batch(user_id: Uuid, kind: ActivityKind, file_count: i64, bytes: i64) -> Self {
        Self {
            user_id,
            kind,
            bytes,
            file_count,
            file_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityReport {
    pub user_id: Uuid,
    pub period: Option<QuotaRecord>,
    pub lifetime: Option<LifetimeUsage>,
    pub abuse_flagged: bool,
}

/// Billing period label for `now`, e.g. `2025-03`.
pub fn period_for(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Download pressure and delete churn blended into 0..=1.
pub fn abuse_score(record: &QuotaRecord) -> f64 {
    let download_pressure = if record.download_limit_bytes > 0 {
        (record.downloaded_bytes as f64 / record.download_limit_bytes as f64).min(1.0)
    } else {
        0.0
    };
    let churn = if record.uploaded_bytes > 0 {
        (record.deleted_bytes as f64 / record.uploaded_bytes as f64).min(1.0)
    } else if record.deleted_bytes > 0 {
        1.0
    } else {
        0.0
    };
    0.6 * download_pressure + 0.4 * churn
}

#[derive(Clone)]
pub struct StorageTracker {
    db: Arc<SqlitePool>,
    config: Arc<EngineConfig>,
}

impl StorageTracker {
    pub fn new(db: Arc<SqlitePool>, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    /// Record an activity. Failures are logged and swallowed: accounting
    /// must never undo an operation that already committed.
    pub async fn track(&self, event: ActivityEvent) {
        if let Err(err) = self.try_track(&event).await {
            warn!(user_id = %event.user_id, kind = %event.kind, error = %err, "failed to track activity");
        }
    }

    pub async fn track_upload(&self, user_id: Uuid, file_id: Uuid, bytes: i64) {
        self.track(ActivityEvent::single(user_id, ActivityKind::Upload, file_id, bytes))
            .await;
    }

    pub async fn track_download(&self, user_id: Uuid, file_id: Uuid, bytes: i64) {
        self.track(ActivityEvent::single(user_id, ActivityKind::Download, file_id, bytes))
            .await;
    }

    /// One event for a whole delete batch.
    pub async fn track_delete(&self, user_id: Uuid, file_count: i64, bytes: i64) {
        self.track(ActivityEvent::batch(user_id, ActivityKind::Delete, file_count, bytes))
            .await;
    }

    pub async fn try_track(&self, event: &ActivityEvent) -> sqlx::Result<()> {
        let now = Utc::now();
        let period = period_for(now);
        let bytes = event.bytes.max(0);
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO user_activity (id, user_id, kind, file_id, bytes, file_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.kind.as_str())
        .bind(event.file_id)
        .bind(bytes)
        .bind(event.file_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (uploaded, downloaded, deleted) = match event.kind {
            ActivityKind::Upload => (bytes, 0, 0),
            ActivityKind::Download => (0, bytes, 0),
            ActivityKind::Delete => (0, 0, bytes),
            ActivityKind::Archive | ActivityKind::Restore => (0, 0, 0),
        };

        self.ensure_period(&mut tx, event.user_id, &period, now).await?;
        sqlx::query(
            "UPDATE quota_records SET
                uploaded_bytes = uploaded_bytes + ?,
                downloaded_bytes = downloaded_bytes + ?,
                deleted_bytes = deleted_bytes + ?,
                current_storage_bytes = current_storage_bytes + ?,
                peak_storage_bytes = MAX(peak_storage_bytes, current_storage_bytes + ?),
                updated_at = ?
             WHERE user_id = ? AND period = ?",
        )
        .bind(uploaded)
        .bind(downloaded)
        .bind(deleted)
        .bind(uploaded)
        .bind(uploaded)
        .bind(now)
        .bind(event.user_id)
        .bind(&period)
        .execute(&mut *tx)
        .await?;

        let record = fetch_period(&mut tx, event.user_id, &period).await?;
        let score = record.as_ref().map(abuse_score).unwrap_or(0.0);
        let flagged = score > self.config.abuse_threshold;
        sqlx::query("UPDATE quota_records SET abuse_score = ? WHERE user_id = ? AND period = ?")
            .bind(score)
            .bind(event.user_id)
            .bind(&period)
            .execute(&mut *tx)
            .await?;

        let (uploads, downloads, deletes) = match event.kind {
            ActivityKind::Upload => (event.file_count, 0, 0),
            ActivityKind::Download => (0, event.file_count, 0),
            ActivityKind::Delete => (0, 0, event.file_count),
            ActivityKind::Archive | ActivityKind::Restore => (0, 0, 0),
        };
        sqlx::query(
            "INSERT INTO lifetime_usage (
                user_id, total_uploaded_bytes, total_downloaded_bytes, total_deleted_bytes,
                upload_count, download_count, delete_count, abuse_score, flagged, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                total_uploaded_bytes = total_uploaded_bytes + excluded.total_uploaded_bytes,
                total_downloaded_bytes = total_downloaded_bytes + excluded.total_downloaded_bytes,
                total_deleted_bytes = total_deleted_bytes + excluded.total_deleted_bytes,
                upload_count = upload_count + excluded.upload_count,
                download_count = download_count + excluded.download_count,
                delete_count = delete_count + excluded.delete_count,
                abuse_score = excluded.abuse_score,
                flagged = excluded.flagged,
                updated_at = excluded.updated_at",
        )
        .bind(event.user_id)
        .bind(uploaded)
        .bind(downloaded)
        .bind(deleted)
        .bind(uploads)
        .bind(downloads)
        .bind(deletes)
        .bind(score)
        .bind(flagged)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if flagged {
            warn!(user_id = %event.user_id, score, "user flagged by abuse heuristics");
        }
        debug!(user_id = %event.user_id, kind = %event.kind, bytes, "tracked activity");
        Ok(())
    }

    async fn ensure_period(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        period: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO quota_records (
                user_id, period, upload_limit_bytes, download_limit_bytes, storage_limit_bytes,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, period) DO NOTHING",
        )
        .bind(user_id)
        .bind(period)
        .bind(self.config.monthly_upload_limit_bytes)
        .bind(self.config.monthly_download_limit_bytes)
        .bind(self.config.monthly_storage_limit_bytes)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Reject a download that would push this month's egress past its limit.
    /// Other activity kinds are governed by the storage quota instead.
    pub async fn check_monthly_allowance(
        &self,
        user_id: Uuid,
        kind: ActivityKind,
        bytes: i64,
    ) -> EngineResult<()> {
        if kind != ActivityKind::Download {
            return Ok(());
        }
        let (used, limit) = match self.current_period(user_id).await? {
            Some(r) => (r.downloaded_bytes, r.download_limit_bytes),
            None => (0, self.config.monthly_download_limit_bytes),
        };
        if used.saturating_add(bytes) > limit {
            return Err(EngineError::QuotaExceeded(QuotaDetails::new(
                QuotaKind::MonthlyDownload,
                used,
                limit,
                bytes,
            )));
        }
        Ok(())
    }

    /// Whether the user's current abuse score crosses the threshold.
    pub async fn check_abuse(&self, user_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .current_period(user_id)
            .await?
            .is_some_and(|r| abuse_score(&r) > self.config.abuse_threshold))
    }

    /// This month's counters alongside lifetime totals.
    pub async fn usage_report(&self, user_id: Uuid) -> EngineResult<ActivityReport> {
        let period = self.current_period(user_id).await?;
        let lifetime = self.lifetime(user_id).await?;
        let abuse_flagged = period
            .as_ref()
            .is_some_and(|r| abuse_score(r) > self.config.abuse_threshold)
            || lifetime.as_ref().is_some_and(|l| l.flagged);
        Ok(ActivityReport {
            user_id,
            period,
            lifetime,
            abuse_flagged,
        })
    }

    pub async fn current_period(&self, user_id: Uuid) -> sqlx::Result<Option<QuotaRecord>> {
        let mut conn = self.db.acquire().await?;
        fetch_period(&mut conn, user_id, &period_for(Utc::now())).await
    }

    pub async fn lifetime(&self, user_id: Uuid) -> sqlx::Result<Option<LifetimeUsage>> {
        let sql = format!("SELECT {LIFETIME_COLUMNS} FROM lifetime_usage WHERE user_id = ?");
        sqlx::query_as::<_, LifetimeUsage>(&sql)
            .bind(user_id)
            .fetch_optional(&*self.db)
            .await
    }

    /// Corrective resync: set this period's storage total to `live_bytes`.
    /// Returns the previous stored figure.
    pub async fn resync(&self, user_id: Uuid, live_bytes: i64) -> sqlx::Result<i64> {
        let now = Utc::now();
        let period = period_for(now);
        let mut tx = self.db.begin().await?;
        self.ensure_period(&mut tx, user_id, &period, now).await?;
        let previous = sqlx::query_scalar::<_, i64>(
            "SELECT current_storage_bytes FROM quota_records WHERE user_id = ? AND period = ?",
        )
        .bind(user_id)
        .bind(&period)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE quota_records SET
                current_storage_bytes = ?,
                peak_storage_bytes = MAX(peak_storage_bytes, ?),
                updated_at = ?
             WHERE user_id = ? AND period = ?",
        )
        .bind(live_bytes)
        .bind(live_bytes)
        .bind(now)
        .bind(user_id)
        .bind(&period)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(previous)
    }
}

async fn fetch_period(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    period: &str,
) -> sqlx::Result<Option<QuotaRecord>> {
    let sql = format!("SELECT {QUOTA_COLUMNS} FROM quota_records WHERE user_id = ? AND period = ?");
    sqlx::query_as::<_, QuotaRecord>(&sql)
        .bind(user_id)
        .bind(period)
        .fetch_optional(conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(uploaded: i64, downloaded: i64, deleted: i64) -> QuotaRecord {
        QuotaRecord {
            user_id: Uuid::new_v4(),
            period: "2025-01".into(),
            uploaded_bytes: uploaded,
            downloaded_bytes: downloaded,
            deleted_bytes: deleted,
            current_storage_bytes: 0,
            peak_storage_bytes: 0,
            upload_limit_bytes: 100,
            download_limit_bytes: 100,
            storage_limit_bytes: 100,
            abuse_score: 0.0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn periods_are_calendar_months() {
        let at = Utc.with_ymd_and_hms(2025, 11, 30, 23, 59, 59).unwrap();
        assert_eq!(period_for(at), "2025-11");
    }

    #[test]
    fn quiet_users_score_zero() {
        assert_eq!(abuse_score(&record(0, 0, 0)), 0.0);
        assert!(abuse_score(&record(50, 10, 0)) < 0.7);
    }

    #[test]
    fn heavy_download_and_churn_is_flagged() {
        let score = abuse_score(&record(100, 100, 100));
        assert!((score - 1.0).abs() < 1e-9);
        assert!(score > 0.7);
    }
}
