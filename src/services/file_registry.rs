//! FileRegistry: the metadata table for every file.
//!
//! The registry is the single source of truth for lifecycle state. Every
//! status change is a compare-and-set on the expected source status, so two
//! concurrent operations on the same file cannot both win: the loser sees
//! zero affected rows and reports a state conflict.

use crate::{
    errors::{EngineError, EngineResult},
    models::file_record::{FileRecord, FileStatus, Transition, storage_cost},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

pub const FILE_COLUMNS: &str = "id, owner_id, display_name, size_bytes, content_type, \
    object_key, status, is_deleted, deleted_at, checksum, relative_path, archive_ref, \
    restore_eta, last_error, storage_cost, last_accessed_at, archived_at, created_at, updated_at";

/// Fields supplied when an upload session opens.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub owner_id: Uuid,
    pub display_name: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub object_key: String,
    pub checksum: Option<String>,
    pub relative_path: String,
}

/// Result of soft-deleting a set of records.
#[derive(Debug, Default)]
pub struct SoftDeleteOutcome {
    pub deleted: Vec<Uuid>,
    /// Records whose status or archive reference moved on.
    pub conflicted: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

#[derive(Clone)]
pub struct FileRegistry {
    db: Arc<SqlitePool>,
}

impl FileRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a record in `uploading`. Runs on the caller's transaction.
    pub async fn insert_uploading(
        conn: &mut SqliteConnection,
        id: Uuid,
        new: &NewFileRecord,
        now: DateTime<Utc>,
    ) -> sqlx::Result<FileRecord> {
        let sql = format!(
            "INSERT INTO file_records (
                id, owner_id, display_name, size_bytes, content_type, object_key, status,
                is_deleted, checksum, relative_path, storage_cost, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'uploading', 0, ?, ?, 0, ?, ?)
            RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .bind(new.owner_id)
            .bind(&new.display_name)
            .bind(new.size_bytes)
            .bind(&new.content_type)
            .bind(&new.object_key)
            .bind(&new.checksum)
            .bind(&new.relative_path)
            .bind(now)
            .bind(now)
            .fetch_one(conn)
            .await
    }

    pub async fn get(&self, id: Uuid) -> sqlx::Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM file_records WHERE id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    /// A live record owned by `owner_id`. Anything else is reported as not
    /// found so callers cannot probe other users' ids.
    pub async fn get_owned(&self, owner_id: Uuid, id: Uuid) -> EngineResult<FileRecord> {
        match self.get(id).await? {
            Some(record) if record.owner_id == owner_id && !record.is_deleted => Ok(record),
            _ => Err(EngineError::NotFound(format!("file {id}"))),
        }
    }

    /// Live records owned by `owner_id` among `ids`. Missing, foreign and
    /// deleted ids are simply absent from the result.
    pub async fn load_owned_live(
        &self,
        owner_id: Uuid,
        ids: &[Uuid],
    ) -> sqlx::Result<Vec<FileRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM file_records WHERE owner_id = "
        ));
        builder.push_bind(owner_id);
        builder.push(" AND is_deleted = 0 AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        builder.build_query_as().fetch_all(&*self.db).await
    }

    /// Existing content with the same checksum at the same logical path.
    pub async fn find_duplicate(
        &self,
        owner_id: Uuid,
        checksum: &str,
        relative_path: &str,
    ) -> sqlx::Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM file_records
             WHERE owner_id = ? AND checksum = ? AND relative_path = ?
               AND is_deleted = 0 AND status NOT IN ('uploading', 'failed')
             ORDER BY created_at ASC LIMIT 1"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner_id)
            .bind(checksum)
            .bind(relative_path)
            .fetch_optional(&*self.db)
            .await
    }

    /// Compare-and-set a status change along `transition`. Returns false when
    /// the record was no longer in an allowed source status.
    pub async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE file_records SET status = ");
        builder.push_bind(transition.target());
        builder.push(", updated_at = ");
        builder.push_bind(now);
        if transition == Transition::Recover {
            builder.push(", last_error = NULL");
        }
        if transition == Transition::CancelRestore {
            builder.push(", restore_eta = NULL");
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND is_deleted = 0 AND status IN (");
        let mut separated = builder.separated(", ");
        for status in FileStatus::sources_for(transition) {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected() == 1)
    }

    /// `uploading → uploaded`, on the caller's transaction.
    pub async fn finalize_upload(
        conn: &mut SqliteConnection,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        // Cost scales with the size already stored on the row.
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'uploaded', storage_cost = size_bytes * ?, updated_at = ?
             WHERE id = ? AND status = 'uploading' AND is_deleted = 0",
        )
        .bind(storage_cost(1, FileStatus::Uploaded))
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `uploading → failed` when the assembled object was discarded. The
    /// record keeps no object key.
    pub async fn reject_upload(
        conn: &mut SqliteConnection,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'failed', object_key = NULL, last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'uploading' AND is_deleted = 0",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `archiving → archived`: the archive copy is the only copy now.
    pub async fn mark_archived(
        &self,
        record: &FileRecord,
        archive_ref: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'archived', archive_ref = ?, object_key = NULL, archived_at = ?,
                 storage_cost = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'archiving' AND is_deleted = 0",
        )
        .bind(archive_ref)
        .bind(now)
        .bind(storage_cost(record.size_bytes, FileStatus::Archived))
        .bind(now)
        .bind(record.id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_restore_eta(
        &self,
        id: Uuid,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE file_records SET restore_eta = ?, updated_at = ?
             WHERE id = ? AND status = 'restoring'",
        )
        .bind(eta)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// `restoring → restored` with a freshly written warm copy.
    pub async fn mark_restored(
        &self,
        record: &FileRecord,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'restored', object_key = ?, restore_eta = NULL,
                 storage_cost = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'restoring' AND is_deleted = 0",
        )
        .bind(object_key)
        .bind(storage_cost(record.size_bytes, FileStatus::Restored))
        .bind(now)
        .bind(record.id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Park a record in `failed` with the causing error. Only records in an
    /// active transition are moved.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'failed', last_error = ?, restore_eta = NULL, updated_at = ?
             WHERE id = ? AND is_deleted = 0
               AND status IN ('uploaded', 'archiving', 'restoring', 'restored', 'archived')",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 1 {
            warn!(file_id = %id, error, "file moved to failed");
        }
        Ok(result.rows_affected() == 1)
    }

    /// Keep the archive reference on a record, e.g. when a later step failed.
    /// Record the cold copy of a file that is still mid-archive.
    pub async fn set_archive_ref(&self, id: Uuid, archive_ref: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records SET archive_ref = ?
             WHERE id = ? AND status = 'archiving' AND is_deleted = 0",
        )
        .bind(archive_ref)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `failed → archived` when only the archive copy survived.
    pub async fn recover_to_archived(&self, id: Uuid, now: DateTime<Utc>) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records
             SET status = 'archived', object_key = NULL, last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'failed' AND is_deleted = 0 AND archive_ref IS NOT NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn touch_accessed(&self, id: Uuid, now: DateTime<Utc>) -> sqlx::Result<()> {
        sqlx::query("UPDATE file_records SET last_accessed_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Remove an `uploading` record for which no content exists.
    pub async fn delete_uploading(conn: &mut SqliteConnection, id: Uuid) -> sqlx::Result<bool> {
        let result =
            sqlx::query("DELETE FROM file_records WHERE id = ? AND status = 'uploading'")
                .bind(id)
                .execute(conn)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Soft-delete `records` in one transaction, falling back to one update
    /// per record if the bulk statement fails.
    ///
    /// Each row is only updated while its status and archive reference still
    /// match the given snapshot, so a record that moved on after the caller
    /// cleaned up its backend copies is reported as failed instead.
    pub async fn soft_delete_many(
        &self,
        records: &[&FileRecord],
        now: DateTime<Utc>,
    ) -> SoftDeleteOutcome {
        if records.is_empty() {
            return SoftDeleteOutcome::default();
        }
        match self.soft_delete_bulk(records, now).await {
            Ok(updated) => {
                let updated_set: HashSet<Uuid> = updated.iter().copied().collect();
                let conflicted = records
                    .iter()
                    .map(|record| record.id)
                    .filter(|id| !updated_set.contains(id))
                    .collect();
                SoftDeleteOutcome {
                    deleted: updated,
                    conflicted,
                    failed: Vec::new(),
                }
            }
            Err(err) => {
                warn!(count = records.len(), error = %err, "bulk soft delete failed, updating records one by one");
                let mut outcome = SoftDeleteOutcome::default();
                for record in records {
                    match self.soft_delete_one(record, now).await {
                        Ok(true) => outcome.deleted.push(record.id),
                        Ok(false) => outcome.conflicted.push(record.id),
                        Err(err) => outcome.failed.push((record.id, err.to_string())),
                    }
                }
                outcome
            }
        }
    }

    async fn soft_delete_bulk(
        &self,
        records: &[&FileRecord],
        now: DateTime<Utc>,
    ) -> sqlx::Result<Vec<Uuid>> {
        let mut tx = self.db.begin().await?;
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE file_records SET is_deleted = 1, deleted_at = ");
        builder.push_bind(now);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE is_deleted = 0 AND status != 'uploading' AND (");
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            builder.push("(id = ");
            builder.push_bind(record.id);
            builder.push(" AND status = ");
            builder.push_bind(record.status);
            builder.push(" AND archive_ref IS ");
            builder.push_bind(record.archive_ref.clone());
            builder.push(")");
        }
        builder.push(") RETURNING id");
        let updated: Vec<Uuid> = builder
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(count = updated.len(), "soft-deleted records");
        Ok(updated)
    }

    async fn soft_delete_one(&self, record: &FileRecord, now: DateTime<Utc>) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE file_records SET is_deleted = 1, deleted_at = ?, updated_at = ?
             WHERE id = ? AND is_deleted = 0 AND status != 'uploading'
               AND status = ? AND archive_ref IS ?",
        )
        .bind(now)
        .bind(now)
        .bind(record.id)
        .bind(record.status)
        .bind(record.archive_ref.as_deref())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Live aggregate of bytes held by a user. Soft-deleted rows never count.
    pub async fn live_usage_bytes(&self, owner_id: Uuid) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM file_records
             WHERE owner_id = ? AND is_deleted = 0",
        )
        .bind(owner_id)
        .fetch_one(&*self.db)
        .await
    }

    /// Owners with at least one live record.
    pub async fn active_owners(&self) -> sqlx::Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT owner_id FROM file_records WHERE is_deleted = 0",
        )
        .fetch_all(&*self.db)
        .await
    }

    /// Hard-delete soft-deleted rows whose deletion is older than `cutoff`.
    pub async fn purge_deleted_before(&self, cutoff: DateTime<Utc>) -> sqlx::Result<u64> {
        // Timestamps are compared in Rust; their text encoding does not sort reliably.
        let rows = sqlx::query_as::<_, (Uuid, Option<DateTime<Utc>>)>(
            "SELECT id, deleted_at FROM file_records WHERE is_deleted = 1",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut purged = 0;
        for (id, deleted_at) in rows {
            if deleted_at.is_some_and(|at| at < cutoff) {
                purged += sqlx::query("DELETE FROM file_records WHERE id = ? AND is_deleted = 1")
                    .bind(id)
                    .execute(&*self.db)
                    .await?
                    .rows_affected();
            }
        }
        Ok(purged)
    }
}
