//! LifecycleManager: archive and restore jobs.
//!
//! Archive runs to completion inside the request: copy to the archival tier,
//! drop the warm copy, stamp the archive reference. Restore only submits a
//! retrieval; the periodic sweep (or an explicit poll) finishes it once the
//! archival tier reports the bytes ready.

use crate::{
    config::EngineConfig,
    db::is_unique_violation,
    errors::{EngineError, EngineResult},
    models::{
        file_record::{FileRecord, FileStatus, Transition},
        lifecycle_job::{JobKind, JobStatus, LifecycleJob, RestoreTier},
        quota::ActivityKind,
    },
    services::{
        archival_tier::ArchivalTier,
        cache_version::CacheVersionStore,
        file_registry::FileRegistry,
        object_keys::build_object_key,
        object_storage::ObjectStorage,
        quota_gate::QuotaLedger,
        retry::RetryPolicy,
        storage_tracking::{ActivityEvent, StorageTracker},
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const JOB_COLUMNS: &str = "id, file_id, owner_id, kind, status, progress, retry_count, \
    restore_tier, backend_job_ref, estimated_completion, error_message, created_at, started_at, \
    completed_at, updated_at";

pub const TIMED_OUT: &str = "operation timed out";

#[derive(Clone)]
pub struct LifecycleManager {
    db: Arc<SqlitePool>,
    objects: Arc<dyn ObjectStorage>,
    archive: Arc<dyn ArchivalTier>,
    registry: FileRegistry,
    quota: QuotaLedger,
    tracker: StorageTracker,
    cache: CacheVersionStore,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SqlitePool>,
        objects: Arc<dyn ObjectStorage>,
        archive: Arc<dyn ArchivalTier>,
        registry: FileRegistry,
        quota: QuotaLedger,
        tracker: StorageTracker,
        cache: CacheVersionStore,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry_max_attempts, config.retry_backoff);
        Self {
            db,
            objects,
            archive,
            registry,
            quota,
            tracker,
            cache,
            config,
            retry,
        }
    }

    // ---------------------------------------------------------------------
    // Archive
    // ---------------------------------------------------------------------

    /// Move a warm file into the archival tier.
    ///
    /// Precondition failures (ownership, status, quota) are returned as
    /// errors and create no job. Once the job exists, backend failures are
    /// recorded on it and on the file, and the failed job is returned.
    pub async fn archive(&self, user_id: Uuid, file_id: Uuid) -> EngineResult<LifecycleJob> {
        let job = self.archive_deferred(user_id, file_id).await?;
        self.cache.bump_or_warn(user_id).await;
        Ok(job)
    }

    /// [`archive`](Self::archive) without the cache-version bump, for callers
    /// that bump once for a whole batch.
    pub async fn archive_deferred(&self, user_id: Uuid, file_id: Uuid) -> EngineResult<LifecycleJob> {
        let record = self.registry.get_owned(user_id, file_id).await?;
        if !record.status.can_archive() {
            return Err(EngineError::state_conflict(file_id, "archive", record.status));
        }
        self.quota.check_upload_allowed(user_id, 0).await?;
        let Some(object_key) = record.object_key.clone() else {
            return Err(EngineError::BackendPermanent(format!(
                "file {file_id} has no warm object to archive"
            )));
        };

        let now = Utc::now();
        let job = self
            .start_job(&record, JobKind::Archive, None, JobStatus::InProgress, now)
            .await?;
        if !self
            .registry
            .transition(file_id, Transition::BeginArchive, now)
            .await?
        {
            return Err(self.abandon_job(&job, "archive").await);
        }
        info!(%user_id, %file_id, job_id = %job.id, size = record.size_bytes, "archive started");

        // Content is immutable, so a cold copy kept from an earlier archive
        // (a restored file) is still valid.
        let (archive_ref, mut retries) = match record.archive_ref.clone() {
            Some(existing) => {
                debug!(%file_id, archive_ref = %existing, "reusing existing archive copy");
                (existing, 0)
            }
            None => {
                let (copied, retries) = {
                    let objects = &self.objects;
                    let archive = &self.archive;
                    let key = object_key.as_str();
                    self.retry
                        .run("submit_archive", || async move {
                            let stream = objects.get_object_stream(key).await?;
                            archive.submit_archive(stream).await
                        })
                        .await
                };
                let archive_ref = match copied {
                    Ok(archive_ref) => archive_ref,
                    Err(err) => {
                        return self.fail_operation(&job, &err.to_string(), retries).await;
                    }
                };
                if !self.registry.set_archive_ref(file_id, &archive_ref).await? {
                    self.discard_archive(file_id, &archive_ref).await;
                    return self
                        .fail_operation(&job, "file left archiving before the archive finished", retries)
                        .await;
                }
                (archive_ref, retries)
            }
        };
        self.set_progress(job.id, 50).await?;

        let (deleted, delete_retries) = {
            let objects = &self.objects;
            let key = object_key.as_str();
            self.retry
                .run("delete_object", || async move { objects.delete_object(key).await })
                .await
        };
        retries += delete_retries;
        if let Err(err) = deleted {
            return self.fail_operation(&job, &err.to_string(), retries).await;
        }

        if !self
            .registry
            .mark_archived(&record, &archive_ref, Utc::now())
            .await?
        {
            return self
                .fail_operation(&job, "file left archiving before the archive finished", retries)
                .await;
        }

        let job = self.complete_job(job.id, retries).await?;
        self.tracker
            .track(ActivityEvent::single(
                user_id,
                ActivityKind::Archive,
                file_id,
                record.size_bytes,
            ))
            .await;
        info!(%user_id, %file_id, job_id = %job.id, %archive_ref, retries, "file archived");
        Ok(job)
    }

    // ---------------------------------------------------------------------
    // Restore
    // ---------------------------------------------------------------------

    /// Request rehydration of an archived file. The file enters `restoring`
    /// with an ETA derived from `tier`.
    pub async fn restore(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        tier: RestoreTier,
    ) -> EngineResult<LifecycleJob> {
        let job = self.restore_deferred(user_id, file_id, tier).await?;
        self.cache.bump_or_warn(user_id).await;
        Ok(job)
    }

    pub async fn restore_deferred(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        tier: RestoreTier,
    ) -> EngineResult<LifecycleJob> {
        let record = self.registry.get_owned(user_id, file_id).await?;
        if !record.status.can_restore() {
            return Err(EngineError::state_conflict(file_id, "restore", record.status));
        }
        self.quota.check_upload_allowed(user_id, 0).await?;
        let Some(archive_ref) = record.archive_ref.clone() else {
            return Err(EngineError::BackendPermanent(format!(
                "file {file_id} has no archive reference"
            )));
        };

        let now = Utc::now();
        let job = self
            .start_job(&record, JobKind::Restore, Some(tier), JobStatus::Pending, now)
            .await?;
        if !self
            .registry
            .transition(file_id, Transition::BeginRestore, now)
            .await?
        {
            return Err(self.abandon_job(&job, "restore").await);
        }

        let (requested, retries) = {
            let archive = &self.archive;
            let archive_ref = archive_ref.as_str();
            self.retry
                .run("request_retrieval", || async move {
                    archive.request_retrieval(archive_ref, tier).await
                })
                .await
        };
        let backend_job_ref = match requested {
            Ok(job_ref) => job_ref,
            Err(err) => return self.fail_operation(&job, &err.to_string(), retries).await,
        };

        let eta = now + tier.eta();
        let sql = format!(
            "UPDATE lifecycle_jobs SET
                status = 'in_progress', backend_job_ref = ?, estimated_completion = ?,
                started_at = ?, progress = MAX(progress, 10), retry_count = retry_count + ?,
                updated_at = ?
             WHERE id = ?
             RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, LifecycleJob>(&sql)
            .bind(&backend_job_ref)
            .bind(eta)
            .bind(now)
            .bind(i64::from(retries))
            .bind(now)
            .bind(job.id)
            .fetch_one(&*self.db)
            .await?;
        self.registry.set_restore_eta(file_id, eta, now).await?;

        self.tracker
            .track(ActivityEvent::single(
                user_id,
                ActivityKind::Restore,
                file_id,
                record.size_bytes,
            ))
            .await;
        info!(%user_id, %file_id, job_id = %job.id, tier = tier.as_str(), %eta, "restore requested");
        Ok(job)
    }

    /// Poll the archival tier for a restore job, finishing it when the bytes
    /// are ready. Terminal jobs are returned unchanged.
    pub async fn poll_restore_status(&self, job_id: Uuid) -> EngineResult<LifecycleJob> {
        let job = self
            .job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        if job.kind != JobKind::Restore {
            return Err(EngineError::InvalidInput(format!("job {job_id} is not a restore")));
        }
        if job.status.is_terminal() {
            return Ok(job);
        }
        let Some(backend_job_ref) = job.backend_job_ref.clone() else {
            return Ok(job);
        };

        let (polled, retries) = {
            let archive = &self.archive;
            let job_ref = backend_job_ref.as_str();
            self.retry
                .run("poll_retrieval", || async move { archive.poll_retrieval(job_ref).await })
                .await
        };
        match polled {
            Err(err) if err.is_transient() => {
                warn!(%job_id, error = %err, "retrieval poll failed, will try again later");
                self.add_retries(job_id, retries + 1).await?;
                self.job_or_missing(job_id).await
            }
            Err(err) => self.fail_operation(&job, &err.to_string(), retries).await,
            Ok(status) if !status.done => {
                let progress = estimated_progress(&job, Utc::now());
                self.set_progress(job_id, progress).await?;
                debug!(%job_id, eta_hours = status.eta_hours, progress, "retrieval still running");
                self.job_or_missing(job_id).await
            }
            Ok(_) => self.finish_restore(job, &backend_job_ref, retries).await,
        }
    }

    /// Owner-scoped [`poll_restore_status`](Self::poll_restore_status).
    pub async fn poll_restore(&self, user_id: Uuid, job_id: Uuid) -> EngineResult<LifecycleJob> {
        self.get_job(user_id, job_id).await?;
        self.poll_restore_status(job_id).await
    }

    async fn finish_restore(
        &self,
        job: LifecycleJob,
        backend_job_ref: &str,
        mut retries: u32,
    ) -> EngineResult<LifecycleJob> {
        let record = match self.registry.get(job.file_id).await? {
            Some(record) if !record.is_deleted && record.status == FileStatus::Restoring => record,
            Some(record) if record.is_deleted => {
                return self.end_job(&job, JobStatus::Cancelled, "file was deleted").await;
            }
            _ => {
                return self
                    .end_job(&job, JobStatus::Failed, "file left restoring before the retrieval finished")
                    .await;
            }
        };

        let now = Utc::now();
        let object_key = build_object_key(
            record.owner_id,
            &record.relative_path,
            &record.display_name,
            now,
        );
        let (written, write_retries) = {
            let archive = &self.archive;
            let objects = &self.objects;
            let key = object_key.as_str();
            self.retry
                .run("rehydrate", || async move {
                    let stream = archive.retrieval_output(backend_job_ref).await?;
                    objects.put_object_stream(key, stream).await
                })
                .await
        };
        retries += write_retries;
        if let Err(err) = written {
            return self.fail_operation(&job, &err.to_string(), retries).await;
        }

        if !self.registry.mark_restored(&record, &object_key, now).await? {
            if let Err(err) = self.objects.delete_object(&object_key).await {
                warn!(key = %object_key, error = %err, "failed to remove orphaned restored copy");
            }
            return self
                .end_job(&job, JobStatus::Failed, "file left restoring before the retrieval finished")
                .await;
        }

        let job = self.complete_job(job.id, retries).await?;
        self.release_retrieval(backend_job_ref).await;
        self.cache.bump_or_warn(record.owner_id).await;
        info!(user_id = %record.owner_id, file_id = %record.id, job_id = %job.id, key = %object_key, "file restored");
        Ok(job)
    }

    // ---------------------------------------------------------------------
    // Cancel / recover / queries
    // ---------------------------------------------------------------------

    /// Cancel a pending job or an in-flight restore. A running archive has
    /// already touched both tiers and cannot be cancelled.
    pub async fn cancel(&self, user_id: Uuid, job_id: Uuid) -> EngineResult<LifecycleJob> {
        let job = self.get_job(user_id, job_id).await?;
        if job.status == JobStatus::Cancelled {
            return Ok(job);
        }
        if job.status.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "job {job_id} already {}",
                job.status
            )));
        }
        if job.kind == JobKind::Archive && job.status == JobStatus::InProgress {
            let status = self.file_status(job.file_id).await?;
            return Err(EngineError::state_conflict(job.file_id, "cancel archive of", status));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE lifecycle_jobs
             SET status = 'cancelled', error_message = 'cancelled by user', completed_at = ?,
                 updated_at = ?
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidInput(format!("job {job_id} already finished")));
        }

        if job.kind == JobKind::Restore {
            if let Some(job_ref) = job.backend_job_ref.as_deref() {
                self.release_retrieval(job_ref).await;
            }
            if self
                .registry
                .transition(job.file_id, Transition::CancelRestore, now)
                .await?
            {
                info!(%user_id, file_id = %job.file_id, %job_id, "restore cancelled, file back to archived");
            }
        }
        self.cache.bump_or_warn(user_id).await;
        self.job_or_missing(job_id).await
    }

    /// Bring a `failed` file back: to `uploaded` when the warm object is
    /// intact, otherwise to `archived` when an archive copy exists.
    pub async fn recover(&self, user_id: Uuid, file_id: Uuid) -> EngineResult<FileRecord> {
        let record = self.registry.get_owned(user_id, file_id).await?;
        if record.status != FileStatus::Failed {
            return Err(EngineError::state_conflict(file_id, "recover", record.status));
        }

        let warm_intact = match record.object_key.as_deref() {
            Some(key) => self.objects.head_object(key).await?.is_some(),
            None => false,
        };
        let now = Utc::now();
        let recovered = if warm_intact {
            self.registry
                .transition(file_id, Transition::Recover, now)
                .await?
        } else if record.archive_ref.is_some() {
            self.registry.recover_to_archived(file_id, now).await?
        } else {
            return Err(EngineError::BackendPermanent(format!(
                "file {file_id} has no intact copy to recover from"
            )));
        };
        if !recovered {
            let status = self.file_status(file_id).await?;
            return Err(EngineError::state_conflict(file_id, "recover", status));
        }

        self.quota.invalidate_usage(user_id).await;
        self.cache.bump_or_warn(user_id).await;
        let record = self.registry.get_owned(user_id, file_id).await?;
        info!(%user_id, %file_id, status = %record.status, "file recovered");
        Ok(record)
    }

    /// Every job ever run on a file, oldest first.
    pub async fn jobs_for_file(&self, user_id: Uuid, file_id: Uuid) -> EngineResult<Vec<LifecycleJob>> {
        match self.registry.get(file_id).await? {
            Some(record) if record.owner_id == user_id => {}
            _ => return Err(EngineError::NotFound(format!("file {file_id}"))),
        }
        let sql = format!("SELECT {JOB_COLUMNS} FROM lifecycle_jobs WHERE file_id = ?");
        let mut jobs = sqlx::query_as::<_, LifecycleJob>(&sql)
            .bind(file_id)
            .fetch_all(&*self.db)
            .await?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    pub async fn get_job(&self, user_id: Uuid, job_id: Uuid) -> EngineResult<LifecycleJob> {
        match self.job(job_id).await? {
            Some(job) if job.owner_id == user_id => Ok(job),
            _ => Err(EngineError::NotFound(format!("job {job_id}"))),
        }
    }

    pub async fn job(&self, job_id: Uuid) -> sqlx::Result<Option<LifecycleJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM lifecycle_jobs WHERE id = ?");
        sqlx::query_as::<_, LifecycleJob>(&sql)
            .bind(job_id)
            .fetch_optional(&*self.db)
            .await
    }

    async fn job_or_missing(&self, job_id: Uuid) -> EngineResult<LifecycleJob> {
        self.job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))
    }

    async fn active_jobs(&self) -> sqlx::Result<Vec<LifecycleJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM lifecycle_jobs WHERE status IN ('pending', 'in_progress')"
        );
        sqlx::query_as::<_, LifecycleJob>(&sql)
            .fetch_all(&*self.db)
            .await
    }

    /// In-progress restores whose ETA has passed.
    pub async fn due_restores(&self, now: DateTime<Utc>) -> EngineResult<Vec<LifecycleJob>> {
        // ETAs are compared in Rust; their text encoding does not sort reliably.
        Ok(self
            .active_jobs()
            .await?
            .into_iter()
            .filter(|job| {
                job.kind == JobKind::Restore
                    && job.status == JobStatus::InProgress
                    && job.estimated_completion.is_some_and(|eta| eta <= now)
            })
            .collect())
    }

    /// Fail every job that has outlived its timeout, along with its file.
    pub async fn fail_stuck_jobs(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut failed = 0;
        let mut owners = HashSet::new();
        for job in self.active_jobs().await? {
            if now <= self.deadline(&job) {
                continue;
            }
            let ended = self.end_job(&job, JobStatus::Failed, TIMED_OUT).await?;
            if ended.status == JobStatus::Failed && ended.error_message.as_deref() == Some(TIMED_OUT) {
                warn!(job_id = %job.id, file_id = %job.file_id, kind = %job.kind, "job timed out");
                if let Some(job_ref) = job.backend_job_ref.as_deref() {
                    self.release_retrieval(job_ref).await;
                }
                failed += 1;
                owners.insert(job.owner_id);
            }
        }
        for owner in owners {
            self.cache.bump_or_warn(owner).await;
        }
        Ok(failed)
    }

    fn deadline(&self, job: &LifecycleJob) -> DateTime<Utc> {
        match (job.kind, job.estimated_completion) {
            (JobKind::Restore, Some(eta)) => eta + self.config.restore_grace,
            _ => job.started_at.unwrap_or(job.created_at) + self.config.archive_job_timeout,
        }
    }

    // ---------------------------------------------------------------------
    // Job bookkeeping
    // ---------------------------------------------------------------------

    async fn start_job(
        &self,
        record: &FileRecord,
        kind: JobKind,
        tier: Option<RestoreTier>,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<LifecycleJob> {
        let started_at = (status == JobStatus::InProgress).then_some(now);
        let sql = format!(
            "INSERT INTO lifecycle_jobs (
                id, file_id, owner_id, kind, status, progress, retry_count, restore_tier,
                created_at, started_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?)
             RETURNING {JOB_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, LifecycleJob>(&sql)
            .bind(Uuid::new_v4())
            .bind(record.id)
            .bind(record.owner_id)
            .bind(kind)
            .bind(status)
            .bind(tier)
            .bind(now)
            .bind(started_at)
            .bind(now)
            .fetch_one(&*self.db)
            .await;
        match inserted {
            Ok(job) => Ok(job),
            Err(err) if is_unique_violation(&err) => {
                let action = match kind {
                    JobKind::Archive => "archive",
                    JobKind::Restore => "restore",
                };
                Err(EngineError::state_conflict(record.id, action, record.status))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The file moved between the status check and the transition: cancel the
    /// job and report the conflict against the file's current status.
    async fn abandon_job(&self, job: &LifecycleJob, action: &'static str) -> EngineError {
        if let Err(err) = self
            .end_job(job, JobStatus::Cancelled, "file changed state before the job started")
            .await
        {
            return err;
        }
        match self.file_status(job.file_id).await {
            Ok(status) => EngineError::state_conflict(job.file_id, action, status),
            Err(err) => err,
        }
    }

    async fn release_retrieval(&self, job_ref: &str) {
        if let Err(err) = self.archive.release_retrieval(job_ref).await {
            warn!(%job_ref, error = %err, "failed to release retrieval");
        }
    }

    /// Drop a cold copy that no record will ever point at.
    async fn discard_archive(&self, file_id: Uuid, archive_ref: &str) {
        let (result, _) = {
            let archive = &self.archive;
            self.retry
                .run("delete_archive", || async move { archive.delete_archive(archive_ref).await })
                .await
        };
        match result {
            Ok(()) => debug!(%file_id, %archive_ref, "discarded unreferenced archive copy"),
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(%file_id, %archive_ref, error = %err, "failed to discard unreferenced archive copy")
            }
        }
    }

    /// Fail the job and park its file in `failed`. The failed job is the
    /// operation's result.
    async fn fail_operation(
        &self,
        job: &LifecycleJob,
        reason: &str,
        retries: u32,
    ) -> EngineResult<LifecycleJob> {
        self.add_retries(job.id, retries).await?;
        let job = self.end_job(job, JobStatus::Failed, reason).await?;
        warn!(job_id = %job.id, file_id = %job.file_id, kind = %job.kind, retries, reason, "job failed");
        Ok(job)
    }

    /// Move a non-terminal job to `status`. Failing a job also fails its file.
    async fn end_job(
        &self,
        job: &LifecycleJob,
        status: JobStatus,
        reason: &str,
    ) -> EngineResult<LifecycleJob> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE lifecycle_jobs
             SET status = ?, error_message = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(status)
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(job.id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 1 && status == JobStatus::Failed {
            self.registry.mark_failed(job.file_id, reason, now).await?;
        }
        self.job_or_missing(job.id).await
    }

    async fn complete_job(&self, job_id: Uuid, retries: u32) -> EngineResult<LifecycleJob> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE lifecycle_jobs
             SET status = 'completed', progress = 100, retry_count = retry_count + ?,
                 completed_at = ?, updated_at = ?
             WHERE id = ?
             RETURNING {JOB_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, LifecycleJob>(&sql)
            .bind(i64::from(retries))
            .bind(now)
            .bind(now)
            .bind(job_id)
            .fetch_one(&*self.db)
            .await?)
    }

    /// Progress only moves forward while the job runs.
    async fn set_progress(&self, job_id: Uuid, progress: i64) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE lifecycle_jobs SET progress = MAX(progress, ?), updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now())
        .bind(job_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn add_retries(&self, job_id: Uuid, retries: u32) -> sqlx::Result<()> {
        if retries == 0 {
            return Ok(());
        }
        sqlx::query("UPDATE lifecycle_jobs SET retry_count = retry_count + ? WHERE id = ?")
            .bind(i64::from(retries))
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn file_status(&self, file_id: Uuid) -> EngineResult<FileStatus> {
        self.registry
            .get(file_id)
            .await?
            .map(|record| record.status)
            .ok_or_else(|| EngineError::NotFound(format!("file {file_id}")))
    }
}

/// Share of the tier's ETA that has elapsed, held between 10 and 95 until
/// the retrieval actually finishes.
fn estimated_progress(job: &LifecycleJob, now: DateTime<Utc>) -> i64 {
    let (Some(started), Some(eta)) = (job.started_at, job.estimated_completion) else {
        return job.progress;
    };
    let total = (eta - started).num_seconds();
    if total <= 0 {
        return 95;
    }
    let elapsed = (now - started).num_seconds().max(0);
    (10 + elapsed * 85 / total).clamp(10, 95)
}
