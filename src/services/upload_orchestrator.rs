//! Chunked uploads: open, hand out part URLs, complete or abort.
//!
//! A file record exists in `uploading` from the moment a session opens until
//! the client completes it (`uploaded`, or `failed` when the stored object
//! does not match the declared size) or aborts it (row removed). The
//! per-user files-in-flight counter lives in the shared key-value store and is
//! released by an explicit client signal, not by completion itself.

use crate::{
    config::EngineConfig,
    errors::{EngineError, EngineResult, QuotaDetails, QuotaKind},
    models::{
        file_record::FileRecord,
        multipart::{CompletedPart, MultipartState, MultipartUpload},
        upload_session::{UploadSession, UploadSessionStatus},
    },
    services::{
        cache_version::CacheVersionStore,
        file_registry::{FileRegistry, NewFileRecord},
        kv_store::{KvError, KvStore},
        object_keys::{build_object_key, clean_relative_path},
        object_storage::{MultipartHandle, ObjectStorage},
        quota_gate::QuotaLedger,
        retry::RetryPolicy,
        storage_tracking::StorageTracker,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MULTIPART_COLUMNS: &str = "id, owner_id, file_id, upload_session_id, backend_upload_id, \
    object_key, state, part_count, initiated_at, completed_at";

const SESSION_COLUMNS: &str = "id, owner_id, root_directory, total_files, uploaded_files, \
    failed_files, status, directory_structure, error_message, created_at, updated_at, completed_at";

pub fn inflight_key(user_id: Uuid) -> String {
    format!("user_{user_id}_files_inflight")
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSessionRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    #[serde(default)]
    pub relative_path: String,
    /// Enables duplicate suppression when present.
    pub checksum: Option<String>,
    pub upload_session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenedSession {
    pub session_handle: Uuid,
    pub object_key: String,
    pub file_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpenOutcome {
    Opened(OpenedSession),
    /// Identical content already exists at the same path; nothing was created.
    Duplicate(FileRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct PartUrl {
    pub part_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub session: UploadSession,
    pub progress_percent: f64,
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    db: Arc<SqlitePool>,
    kv: Arc<dyn KvStore>,
    objects: Arc<dyn ObjectStorage>,
    registry: FileRegistry,
    quota: QuotaLedger,
    tracker: StorageTracker,
    cache: CacheVersionStore,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl UploadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SqlitePool>,
        kv: Arc<dyn KvStore>,
        objects: Arc<dyn ObjectStorage>,
        registry: FileRegistry,
        quota: QuotaLedger,
        tracker: StorageTracker,
        cache: CacheVersionStore,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry_max_attempts, config.retry_backoff);
        Self {
            db,
            kv,
            objects,
            registry,
            quota,
            tracker,
            cache,
            config,
            retry,
        }
    }

    // ---------------------------------------------------------------------
    // Admission control
    // ---------------------------------------------------------------------

    /// Reserve `count` files-in-flight slots, or reject with backpressure.
    pub async fn admit(&self, user_id: Uuid, count: i64) -> EngineResult<()> {
        let limit = self.config.admission_ceiling();
        let key = inflight_key(user_id);
        let ttl = Some(self.config.in_flight_ttl);

        if self.kv.supports_atomic_incr() {
            match self.kv.incr_by(&key, count, ttl).await {
                Ok(total) if total > limit => {
                    if let Err(err) = self.kv.incr_by(&key, -count, ttl).await {
                        warn!(%user_id, error = %err, "failed to roll back rejected reservation");
                    }
                    info!(%user_id, current = total - count, requested = count, limit, "upload admission rejected");
                    return Err(EngineError::ConcurrencyLimitExceeded {
                        current: total - count,
                        requested: count,
                        limit,
                    });
                }
                Ok(total) => {
                    debug!(%user_id, in_flight = total, "upload slots reserved");
                    return Ok(());
                }
                Err(KvError::AtomicIncrUnsupported) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let current = self.kv.get(&key).await?.unwrap_or(0).max(0);
        if current.saturating_add(count) > limit {
            info!(%user_id, current, requested = count, limit, "upload admission rejected");
            return Err(EngineError::ConcurrencyLimitExceeded {
                current,
                requested: count,
                limit,
            });
        }
        self.kv.set(&key, current + count, ttl).await?;
        Ok(())
    }

    /// Give back `count` slots. Never drops below zero.
    pub async fn release(&self, user_id: Uuid, count: i64) -> i64 {
        let key = inflight_key(user_id);
        let ttl = Some(self.config.in_flight_ttl);
        let result = async {
            if self.kv.supports_atomic_incr() {
                match self.kv.incr_by(&key, -count, ttl).await {
                    Ok(left) if left < 0 => {
                        self.kv.set(&key, 0, ttl).await?;
                        return Ok(0);
                    }
                    Ok(left) => return Ok(left),
                    Err(KvError::AtomicIncrUnsupported) => {}
                    Err(err) => return Err(err),
                }
            }
            let left = (self.kv.get(&key).await?.unwrap_or(0) - count).max(0);
            self.kv.set(&key, left, ttl).await?;
            Ok(left)
        };
        match result.await {
            Ok(left) => left,
            Err(err) => {
                warn!(%user_id, count, error = %err, "failed to release upload slots");
                0
            }
        }
    }

    pub async fn in_flight(&self, user_id: Uuid) -> EngineResult<i64> {
        Ok(self.kv.get(&inflight_key(user_id)).await?.unwrap_or(0).max(0))
    }

    /// The client finished a batch of `completed_files` files.
    pub async fn complete_batch(&self, user_id: Uuid, completed_files: i64) -> EngineResult<i64> {
        if completed_files < 0 {
            return Err(EngineError::InvalidInput("completed file count cannot be negative".into()));
        }
        let left = self.release(user_id, completed_files).await;
        debug!(%user_id, completed_files, in_flight = left, "upload batch reported complete");
        Ok(left)
    }

    // ---------------------------------------------------------------------
    // Upload sessions (folder groups)
    // ---------------------------------------------------------------------

    pub async fn create_upload_session(
        &self,
        user_id: Uuid,
        root_directory: Option<String>,
        total_files: i64,
        directory_structure: Option<serde_json::Value>,
    ) -> EngineResult<UploadSession> {
        if total_files <= 0 {
            return Err(EngineError::InvalidInput("an upload session needs at least one file".into()));
        }
        let root_directory = root_directory
            .map(|root| clean_relative_path(&root))
            .transpose()?
            .filter(|root| !root.is_empty());
        let structure = directory_structure.map(|value| value.to_string());
        let now = Utc::now();

        let sql = format!(
            "INSERT INTO upload_sessions (
                id, owner_id, root_directory, total_files, status, directory_structure,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
             RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, UploadSession>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(&root_directory)
            .bind(total_files)
            .bind(&structure)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;

        info!(%user_id, session_id = %session.id, total_files, "upload session created");
        Ok(session)
    }

    pub async fn upload_session(&self, user_id: Uuid, session_id: Uuid) -> EngineResult<UploadSession> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ? AND owner_id = ?");
        sqlx::query_as::<_, UploadSession>(&sql)
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload session {session_id}")))
    }

    pub async fn upload_session_progress(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> EngineResult<UploadProgress> {
        let session = self.upload_session(user_id, session_id).await?;
        let progress_percent = session.progress_percent();
        Ok(UploadProgress {
            session,
            progress_percent,
        })
    }

    // ---------------------------------------------------------------------
    // Open
    // ---------------------------------------------------------------------

    pub async fn open_session(
        &self,
        user_id: Uuid,
        request: OpenSessionRequest,
    ) -> EngineResult<OpenOutcome> {
        self.open(user_id, request, false).await
    }

    /// Admit a whole batch at once, then open each file. Per-file failures are
    /// reported in place and give their slot back.
    pub async fn open_batch(
        &self,
        user_id: Uuid,
        requests: Vec<OpenSessionRequest>,
    ) -> EngineResult<Vec<EngineResult<OpenOutcome>>> {
        if requests.is_empty() {
            return Err(EngineError::InvalidInput("no files to upload".into()));
        }
        self.admit(user_id, requests.len() as i64).await?;

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.open(user_id, request, true).await);
        }
        Ok(outcomes)
    }

    async fn open(
        &self,
        user_id: Uuid,
        request: OpenSessionRequest,
        reserved: bool,
    ) -> EngineResult<OpenOutcome> {
        let result = self.open_inner(user_id, request, reserved).await;
        // Reservations taken by the batch are returned for files that did not open.
        if reserved && !matches!(result, Ok(OpenOutcome::Opened(_))) {
            self.release(user_id, 1).await;
        }
        result
    }

    async fn open_inner(
        &self,
        user_id: Uuid,
        request: OpenSessionRequest,
        reserved: bool,
    ) -> EngineResult<OpenOutcome> {
        let filename = request.filename.trim();
        if filename.is_empty() {
            return Err(EngineError::InvalidInput("filename is required".into()));
        }
        if request.size_bytes < 0 {
            return Err(EngineError::InvalidInput("file size cannot be negative".into()));
        }
        if request.size_bytes > self.config.max_file_size_bytes {
            return Err(EngineError::QuotaExceeded(QuotaDetails {
                kind: QuotaKind::FileSize,
                current_usage: 0,
                limit: self.config.max_file_size_bytes,
                requested: request.size_bytes,
                remaining: self.config.max_file_size_bytes,
            }));
        }
        let relative_path = clean_relative_path(&request.relative_path)?;

        if let Some(checksum) = request.checksum.as_deref() {
            if let Some(existing) = self
                .registry
                .find_duplicate(user_id, checksum, &relative_path)
                .await?
            {
                info!(%user_id, file_id = %existing.id, "duplicate upload short-circuited");
                return Ok(OpenOutcome::Duplicate(existing));
            }
        }

        if let Some(session_id) = request.upload_session_id {
            let session = self.upload_session(user_id, session_id).await?;
            if matches!(
                session.status,
                UploadSessionStatus::Completed | UploadSessionStatus::Failed
            ) {
                return Err(EngineError::InvalidInput(format!(
                    "upload session {session_id} is already closed"
                )));
            }
        }

        self.quota
            .check_upload_allowed(user_id, request.size_bytes)
            .await?;

        if !reserved {
            self.admit(user_id, 1).await?;
        }

        let now = Utc::now();
        let object_key = build_object_key(user_id, &relative_path, filename, now);
        let content_type = request.content_type.as_deref();
        let handle = {
            let objects = &self.objects;
            let key = &object_key;
            let (result, _) = self
                .retry
                .run("create_multipart_upload", || async move {
                    objects.create_multipart_upload(key, content_type).await
                })
                .await;
            match result {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(%user_id, key = %object_key, error = %err, "failed to open backend upload");
                    if !reserved {
                        self.release(user_id, 1).await;
                    }
                    return Err(err.into());
                }
            }
        };

        let new = NewFileRecord {
            owner_id: user_id,
            display_name: filename.to_string(),
            size_bytes: request.size_bytes,
            content_type: request.content_type.clone(),
            object_key: object_key.clone(),
            checksum: request.checksum.clone(),
            relative_path,
        };
        let session_handle = Uuid::new_v4();
        let file_id = Uuid::new_v4();

        let stored = self
            .store_opened(session_handle, file_id, &new, &handle, request.upload_session_id, now)
            .await;
        if let Err(err) = stored {
            warn!(%user_id, error = %err, "failed to record upload, aborting backend upload");
            if let Err(abort_err) = self.objects.abort_multipart_upload(&handle).await {
                warn!(%user_id, error = %abort_err, "failed to abort orphaned backend upload");
            }
            if !reserved {
                self.release(user_id, 1).await;
            }
            return Err(err.into());
        }

        self.quota.invalidate_usage(user_id).await;
        info!(%user_id, %file_id, %session_handle, key = %object_key, "upload session opened");
        Ok(OpenOutcome::Opened(OpenedSession {
            session_handle,
            object_key,
            file_id,
        }))
    }

    async fn store_opened(
        &self,
        session_handle: Uuid,
        file_id: Uuid,
        new: &NewFileRecord,
        handle: &MultipartHandle,
        upload_session_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        FileRegistry::insert_uploading(&mut tx, file_id, new, now).await?;
        sqlx::query(
            "INSERT INTO multipart_uploads (
                id, owner_id, file_id, upload_session_id, backend_upload_id, object_key,
                state, part_count, initiated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 'open', 0, ?)",
        )
        .bind(session_handle)
        .bind(new.owner_id)
        .bind(file_id)
        .bind(upload_session_id)
        .bind(&handle.upload_id)
        .bind(&handle.key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if let Some(session_id) = upload_session_id {
            sqlx::query(
                "UPDATE upload_sessions SET status = 'uploading', updated_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    // ---------------------------------------------------------------------
    // Parts
    // ---------------------------------------------------------------------

    pub async fn issue_part_urls(
        &self,
        user_id: Uuid,
        session_handle: Uuid,
        part_count: u32,
    ) -> EngineResult<Vec<PartUrl>> {
        if part_count == 0 || part_count > self.config.max_parts_per_upload {
            return Err(EngineError::InvalidInput(format!(
                "part count must be between 1 and {}",
                self.config.max_parts_per_upload
            )));
        }
        let upload = self.open_upload(user_id, session_handle).await?;
        let handle = backend_handle(&upload);

        let mut urls = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count {
            let url = self
                .objects
                .presign_part_upload(&handle, part_number, self.config.presign_ttl)
                .await?;
            urls.push(PartUrl { part_number, url });
        }

        sqlx::query("UPDATE multipart_uploads SET part_count = MAX(part_count, ?) WHERE id = ?")
            .bind(i64::from(part_count))
            .bind(session_handle)
            .execute(&*self.db)
            .await?;

        debug!(%user_id, %session_handle, part_count, "part urls issued");
        Ok(urls)
    }

    async fn open_upload(&self, user_id: Uuid, session_handle: Uuid) -> EngineResult<MultipartUpload> {
        let upload = self.multipart(user_id, session_handle).await?;
        match upload.state {
            MultipartState::Open => Ok(upload),
            MultipartState::Completed => Err(EngineError::InvalidInput(format!(
                "upload {session_handle} is already complete"
            ))),
            MultipartState::Aborted => Err(EngineError::NotFound(format!("upload {session_handle}"))),
        }
    }

    pub async fn multipart(&self, user_id: Uuid, session_handle: Uuid) -> EngineResult<MultipartUpload> {
        let sql = format!("SELECT {MULTIPART_COLUMNS} FROM multipart_uploads WHERE id = ? AND owner_id = ?");
        sqlx::query_as::<_, MultipartUpload>(&sql)
            .bind(session_handle)
            .bind(user_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload {session_handle}")))
    }

    // ---------------------------------------------------------------------
    // Complete / abort
    // ---------------------------------------------------------------------

    /// Assemble the parts and mark the file `uploaded`. Completing an upload
    /// that already completed returns the existing record.
    pub async fn complete(
        &self,
        user_id: Uuid,
        session_handle: Uuid,
        parts: Vec<CompletedPart>,
    ) -> EngineResult<FileRecord> {
        let upload = self.multipart(user_id, session_handle).await?;
        match upload.state {
            MultipartState::Completed => return self.completed_record(&upload).await,
            MultipartState::Aborted => {
                return Err(EngineError::NotFound(format!("upload {session_handle}")));
            }
            MultipartState::Open => {}
        }
        let parts = normalize_parts(parts)?;
        let handle = backend_handle(&upload);

        let (result, retries) = {
            let objects = &self.objects;
            let handle = &handle;
            let parts = &parts;
            self.retry
                .run("complete_multipart_upload", || async move {
                    objects.complete_multipart_upload(handle, parts).await
                })
                .await
        };
        let etag = match result {
            Ok(etag) => etag,
            Err(err) => {
                // A concurrent complete may have won the race and consumed the parts.
                let current = self.multipart(user_id, session_handle).await?;
                if current.state == MultipartState::Completed {
                    return self.completed_record(&current).await;
                }
                warn!(%user_id, %session_handle, retries, error = %err, "backend rejected upload completion");
                return Err(err.into());
            }
        };

        // The declared size was admitted against quota, so the stored object
        // must match it exactly.
        let declared = self
            .registry
            .get(upload.file_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {}", upload.file_id)))?
            .size_bytes;
        let (stored, _) = {
            let objects = &self.objects;
            let key = upload.object_key.as_str();
            self.retry
                .run("head_object", || async move { objects.head_object(key).await })
                .await
        };
        let stored = stored?;
        if stored != u64::try_from(declared).ok() {
            return Err(self
                .reject_size_mismatch(user_id, &upload, declared, stored)
                .await);
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let finalized = FileRegistry::finalize_upload(&mut tx, upload.file_id, now).await?;
        let marked = mark_multipart(&mut tx, session_handle, MultipartState::Completed, now).await?;
        if finalized && marked {
            if let Some(session_id) = upload.upload_session_id {
                count_session_file(&mut tx, session_id, true, now).await?;
            }
        }
        tx.commit().await?;

        let record = self
            .registry
            .get(upload.file_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {}", upload.file_id)))?;

        if finalized {
            self.tracker
                .track_upload(user_id, record.id, record.size_bytes)
                .await;
            self.quota.invalidate_usage(user_id).await;
            self.cache.bump_or_warn(user_id).await;
            info!(%user_id, file_id = %record.id, %etag, size = record.size_bytes, "upload completed");
        }
        Ok(record)
    }

    /// Drop an assembled object whose size differs from the declared one and
    /// park its record in `failed`. Returns the error for the caller.
    async fn reject_size_mismatch(
        &self,
        user_id: Uuid,
        upload: &MultipartUpload,
        declared: i64,
        stored: Option<u64>,
    ) -> EngineError {
        let stored_label = stored.map_or_else(|| "nothing".to_string(), |n| format!("{n} bytes"));
        let reason = format!("declared {declared} bytes but the backend stored {stored_label}");

        let (deleted, _) = {
            let objects = &self.objects;
            let key = upload.object_key.as_str();
            self.retry
                .run("delete_object", || async move { objects.delete_object(key).await })
                .await
        };
        if let Err(err) = deleted {
            warn!(session_handle = %upload.id, key = %upload.object_key, error = %err, "failed to discard mis-sized object");
        }

        let settled = async {
            let now = Utc::now();
            let mut tx = self.db.begin().await?;
            let marked = mark_multipart(&mut tx, upload.id, MultipartState::Aborted, now).await?;
            if marked {
                FileRegistry::reject_upload(&mut tx, upload.file_id, &reason, now).await?;
                if let Some(session_id) = upload.upload_session_id {
                    count_session_file(&mut tx, session_id, false, now).await?;
                }
            }
            tx.commit().await?;
            Ok::<_, EngineError>(marked)
        }
        .await;

        match settled {
            Ok(true) => {
                self.release(user_id, 1).await;
                self.quota.invalidate_usage(user_id).await;
                self.cache.bump_or_warn(user_id).await;
                warn!(%user_id, session_handle = %upload.id, file_id = %upload.file_id, declared, ?stored, "upload rejected on size mismatch");
            }
            Ok(false) => {}
            Err(err) => return err,
        }
        EngineError::InvalidInput(reason)
    }

    async fn completed_record(&self, upload: &MultipartUpload) -> EngineResult<FileRecord> {
        debug!(session_handle = %upload.id, "upload already complete");
        self.registry
            .get(upload.file_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {}", upload.file_id)))
    }

    /// Release the backend allocation and remove the `uploading` record.
    pub async fn abort(&self, user_id: Uuid, session_handle: Uuid) -> EngineResult<()> {
        let upload = self.multipart(user_id, session_handle).await?;
        match upload.state {
            MultipartState::Aborted => return Ok(()),
            MultipartState::Completed => {
                let status = self
                    .registry
                    .get(upload.file_id)
                    .await?
                    .map(|record| record.status)
                    .ok_or_else(|| EngineError::NotFound(format!("file {}", upload.file_id)))?;
                return Err(EngineError::state_conflict(upload.file_id, "abort", status));
            }
            MultipartState::Open => {}
        }

        if self.discard(&upload, Utc::now()).await? {
            self.release(user_id, 1).await;
            self.quota.invalidate_usage(user_id).await;
            info!(%user_id, %session_handle, file_id = %upload.file_id, "upload aborted");
        }
        Ok(())
    }

    /// Abort the backend upload and drop the record. Returns false when the
    /// upload had already left the open state.
    async fn discard(&self, upload: &MultipartUpload, now: DateTime<Utc>) -> EngineResult<bool> {
        let handle = backend_handle(upload);
        let (result, _) = {
            let objects = &self.objects;
            let handle = &handle;
            self.retry
                .run("abort_multipart_upload", || async move {
                    objects.abort_multipart_upload(handle).await
                })
                .await
        };
        if let Err(err) = result {
            warn!(session_handle = %upload.id, error = %err, "backend abort failed, dropping record anyway");
        }

        let mut tx = self.db.begin().await?;
        let marked = mark_multipart(&mut tx, upload.id, MultipartState::Aborted, now).await?;
        if marked {
            FileRegistry::delete_uploading(&mut tx, upload.file_id).await?;
            if let Some(session_id) = upload.upload_session_id {
                count_session_file(&mut tx, session_id, false, now).await?;
            }
        }
        tx.commit().await?;
        Ok(marked)
    }

    /// Reclaim uploads that were neither completed nor aborted in time.
    pub async fn reclaim_abandoned(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let cutoff = now - self.config.abandoned_upload_ttl;
        let sql = format!("SELECT {MULTIPART_COLUMNS} FROM multipart_uploads WHERE state = 'open'");
        let open = sqlx::query_as::<_, MultipartUpload>(&sql)
            .fetch_all(&*self.db)
            .await?;

        let mut reclaimed = 0;
        let mut owners = HashSet::new();
        for upload in open.into_iter().filter(|u| u.initiated_at < cutoff) {
            match self.discard(&upload, now).await {
                Ok(true) => {
                    reclaimed += 1;
                    owners.insert(upload.owner_id);
                    self.release(upload.owner_id, 1).await;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(session_handle = %upload.id, error = %err, "failed to reclaim abandoned upload");
                }
            }
        }
        for owner in owners {
            self.quota.invalidate_usage(owner).await;
        }
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed abandoned uploads");
        }
        Ok(reclaimed)
    }
}

fn backend_handle(upload: &MultipartUpload) -> MultipartHandle {
    MultipartHandle {
        upload_id: upload.backend_upload_id.clone(),
        key: upload.object_key.clone(),
    }
}

/// Sort parts by number, rejecting entries the backend could never assemble.
fn normalize_parts(mut parts: Vec<CompletedPart>) -> EngineResult<Vec<CompletedPart>> {
    if parts.is_empty() {
        return Err(EngineError::InvalidInput("at least one part is required".into()));
    }
    parts.sort_by_key(|p| p.part_number);
    if parts[0].part_number == 0 {
        return Err(EngineError::InvalidInput("part numbers start at 1".into()));
    }
    if parts.windows(2).any(|w| w[0].part_number == w[1].part_number) {
        return Err(EngineError::InvalidInput("duplicate part number".into()));
    }
    if parts.iter().any(|p| p.etag.trim().is_empty()) {
        return Err(EngineError::InvalidInput("every part needs an etag".into()));
    }
    Ok(parts)
}

async fn mark_multipart(
    conn: &mut SqliteConnection,
    id: Uuid,
    state: MultipartState,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE multipart_uploads SET state = ?, completed_at = ? WHERE id = ? AND state = 'open'",
    )
    .bind(state)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Count one finished file against its upload session and settle the
/// session's status once every file is accounted for.
async fn count_session_file(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    uploaded: bool,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    let (uploaded_inc, failed_inc) = if uploaded { (1, 0) } else { (0, 1) };
    sqlx::query(
        "UPDATE upload_sessions SET
            uploaded_files = uploaded_files + ?1,
            failed_files = failed_files + ?2,
            status = CASE
                WHEN uploaded_files + ?1 >= total_files THEN 'completed'
                WHEN uploaded_files + failed_files + ?1 + ?2 >= total_files THEN 'failed'
                ELSE 'uploading'
            END,
            completed_at = CASE
                WHEN uploaded_files + failed_files + ?1 + ?2 >= total_files THEN ?3
                ELSE completed_at
            END,
            updated_at = ?3
         WHERE id = ?4",
    )
    .bind(uploaded_inc)
    .bind(failed_inc)
    .bind(now)
    .bind(session_id)
    .execute(conn)
    .await?;
    Ok(())
}
