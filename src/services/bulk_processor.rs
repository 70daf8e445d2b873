//! Bulk delete, archive and restore over up to `max_bulk_batch` files.
//!
//! A batch never fails as a whole once its ids are accepted. Every file gets
//! its own outcome, and the owner's cache version is bumped exactly once
//! after the last step.

use crate::{
    config::EngineConfig,
    errors::{EngineError, EngineResult},
    models::{
        file_record::FileRecord,
        lifecycle_job::{JobStatus, LifecycleJob, RestoreTier},
    },
    services::{
        archival_tier::ArchivalTier,
        cache_version::CacheVersionStore,
        file_registry::FileRegistry,
        lifecycle_jobs::LifecycleManager,
        object_storage::{BackendError, ObjectStorage},
        quota_gate::QuotaLedger,
        retry::RetryPolicy,
        storage_tracking::StorageTracker,
    },
};
use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Delete,
    Archive,
    Restore,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub file_id: Uuid,
    pub reason: String,
    pub error_type: &'static str,
    pub retryable: bool,
}

impl ItemFailure {
    fn from_error(file_id: Uuid, err: &EngineError) -> Self {
        Self {
            file_id,
            reason: err.to_string(),
            error_type: err.error_type(),
            retryable: err.is_retryable(),
        }
    }

    fn from_backend(file_id: Uuid, err: BackendError) -> Self {
        Self::from_error(file_id, &EngineError::from(err))
    }

    fn failed_job(job: &LifecycleJob) -> Self {
        Self {
            file_id: job.file_id,
            reason: job
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} job failed", job.kind)),
            error_type: "job_failed",
            retryable: false,
        }
    }
}

/// Per-item outcome of a bulk request.
///
/// `skipped` holds ids that were missing, deleted, or owned by someone else;
/// they are never attempted. `succeeded.len() + failed.len() == attempted`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub operation: BulkOperation,
    pub requested: usize,
    pub attempted: usize,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<ItemFailure>,
    pub skipped: Vec<Uuid>,
    /// Fraction of attempted items that succeeded. Zero when nothing was attempted.
    pub success_rate: f64,
    /// The owner's cache version after the batch, if the bump went through.
    pub cache_version: Option<i64>,
}

impl BulkSummary {
    fn new(operation: BulkOperation, requested: usize, skipped: Vec<Uuid>) -> Self {
        Self {
            operation,
            requested,
            attempted: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped,
            success_rate: 0.0,
            cache_version: None,
        }
    }

    fn finish(mut self, cache_version: Option<i64>) -> Self {
        self.attempted = self.succeeded.len() + self.failed.len();
        self.success_rate = if self.attempted == 0 {
            0.0
        } else {
            self.succeeded.len() as f64 / self.attempted as f64
        };
        self.cache_version = cache_version;
        self
    }
}

#[derive(Clone)]
pub struct BulkProcessor {
    objects: Arc<dyn ObjectStorage>,
    archive: Arc<dyn ArchivalTier>,
    registry: FileRegistry,
    lifecycle: LifecycleManager,
    quota: QuotaLedger,
    tracker: StorageTracker,
    cache: CacheVersionStore,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl BulkProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        objects: Arc<dyn ObjectStorage>,
        archive: Arc<dyn ArchivalTier>,
        registry: FileRegistry,
        lifecycle: LifecycleManager,
        quota: QuotaLedger,
        tracker: StorageTracker,
        cache: CacheVersionStore,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry_max_attempts, config.retry_backoff);
        Self {
            objects,
            archive,
            registry,
            lifecycle,
            quota,
            tracker,
            cache,
            config,
            retry,
        }
    }

    /// Validate the id list and load the caller's live records among it.
    async fn prepare(
        &self,
        user_id: Uuid,
        file_ids: &[Uuid],
    ) -> EngineResult<(usize, Vec<FileRecord>, Vec<Uuid>)> {
        if file_ids.is_empty() {
            return Err(EngineError::InvalidInput("no file ids given".into()));
        }
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = file_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.len() > self.config.max_bulk_batch {
            return Err(EngineError::InvalidInput(format!(
                "at most {} files per bulk request, got {}",
                self.config.max_bulk_batch,
                unique.len()
            )));
        }

        let mut by_id: HashMap<Uuid, FileRecord> = self
            .registry
            .load_owned_live(user_id, &unique)
            .await?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        let mut records = Vec::with_capacity(by_id.len());
        let mut skipped = Vec::new();
        for id in &unique {
            match by_id.remove(id) {
                Some(record) => records.push(record),
                None => skipped.push(*id),
            }
        }
        if !skipped.is_empty() {
            debug!(%user_id, skipped = skipped.len(), "bulk ids not found for caller");
        }
        Ok((unique.len(), records, skipped))
    }

    // ---------------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------------

    pub async fn bulk_delete(&self, user_id: Uuid, file_ids: &[Uuid]) -> EngineResult<BulkSummary> {
        let (requested, records, skipped) = self.prepare(user_id, file_ids).await?;
        let mut summary = BulkSummary::new(BulkOperation::Delete, requested, skipped);

        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            if record.status.can_soft_delete() {
                candidates.push(record);
            } else {
                let err = EngineError::state_conflict(record.id, "delete", record.status);
                summary.failed.push(ItemFailure::from_error(record.id, &err));
            }
        }

        // Cold copies go first. A restored file whose archive survives keeps
        // its warm copy too, so the record still points at live content.
        let mut failed_ids = HashSet::new();
        for failure in self.delete_archives(&candidates).await {
            failed_ids.insert(failure.file_id);
            summary.failed.push(failure);
        }
        for failure in self.delete_warm_objects(&candidates, &failed_ids).await {
            failed_ids.insert(failure.file_id);
            summary.failed.push(failure);
        }

        let survivors: Vec<&FileRecord> = candidates
            .iter()
            .filter(|record| !failed_ids.contains(&record.id))
            .collect();
        let ids: Vec<Uuid> = survivors.iter().map(|record| record.id).collect();
        let outcome = self.registry.soft_delete_many(&survivors, Utc::now()).await;

        let deleted: HashSet<Uuid> = outcome.deleted.iter().copied().collect();
        let freed_bytes: i64 = survivors
            .iter()
            .filter(|record| deleted.contains(&record.id))
            .map(|record| record.size_bytes)
            .sum();
        // Keep the caller's order in the summary.
        summary
            .succeeded
            .extend(ids.iter().copied().filter(|id| deleted.contains(id)));
        for file_id in outcome.conflicted {
            summary.failed.push(ItemFailure {
                file_id,
                reason: "file changed state before it could be deleted".into(),
                error_type: "state_conflict",
                retryable: false,
            });
        }
        for (file_id, reason) in outcome.failed {
            summary.failed.push(ItemFailure {
                file_id,
                reason,
                error_type: "database",
                retryable: true,
            });
        }

        if !summary.succeeded.is_empty() {
            self.tracker
                .track_delete(user_id, summary.succeeded.len() as i64, freed_bytes)
                .await;
            self.quota.invalidate_usage(user_id).await;
        }

        let version = self.cache.bump_or_warn(user_id).await;
        let summary = summary.finish(version);
        info!(
            %user_id,
            requested = summary.requested,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "bulk delete finished"
        );
        Ok(summary)
    }

    /// One batched call for every warm key. If that call fails as a whole,
    /// each key is deleted on its own instead.
    async fn delete_warm_objects(
        &self,
        records: &[FileRecord],
        already_failed: &HashSet<Uuid>,
    ) -> Vec<ItemFailure> {
        let owners: HashMap<&str, Uuid> = records
            .iter()
            .filter(|record| !already_failed.contains(&record.id))
            .filter_map(|record| record.object_key.as_deref().map(|key| (key, record.id)))
            .collect();
        if owners.is_empty() {
            return Vec::new();
        }
        let keys: Vec<String> = owners.keys().map(|key| key.to_string()).collect();

        let (batched, _) = {
            let objects = &self.objects;
            let keys = keys.as_slice();
            self.retry
                .run("batch_delete_objects", || async move {
                    objects.batch_delete_objects(keys).await
                })
                .await
        };

        let mut failures = Vec::new();
        match batched {
            Ok(outcome) => {
                for failure in outcome.errors {
                    if failure.error.is_not_found() {
                        continue;
                    }
                    if let Some(file_id) = owners.get(failure.key.as_str()) {
                        warn!(%file_id, key = %failure.key, error = %failure.error, "object delete failed");
                        failures.push(ItemFailure::from_backend(*file_id, failure.error));
                    }
                }
            }
            Err(err) => {
                warn!(count = keys.len(), error = %err, "batch delete failed, deleting keys one by one");
                for key in &keys {
                    let (result, _) = {
                        let objects = &self.objects;
                        let key = key.as_str();
                        self.retry
                            .run("delete_object", || async move { objects.delete_object(key).await })
                            .await
                    };
                    match result {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            if let Some(file_id) = owners.get(key.as_str()) {
                                warn!(%file_id, %key, error = %err, "object delete failed");
                                failures.push(ItemFailure::from_backend(*file_id, err));
                            }
                        }
                    }
                }
            }
        }
        failures
    }

    /// The archival tier has no batch primitive.
    async fn delete_archives(&self, records: &[FileRecord]) -> Vec<ItemFailure> {
        let mut failures = Vec::new();
        for record in records {
            let Some(archive_ref) = record.archive_ref.as_deref() else {
                continue;
            };
            let (result, _) = {
                let archive = &self.archive;
                self.retry
                    .run("delete_archive", || async move {
                        archive.delete_archive(archive_ref).await
                    })
                    .await
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(file_id = %record.id, %archive_ref, error = %err, "archive delete failed");
                    failures.push(ItemFailure::from_backend(record.id, err));
                }
            }
        }
        failures
    }

    // ---------------------------------------------------------------------
    // Archive / restore
    // ---------------------------------------------------------------------

    pub async fn bulk_archive(&self, user_id: Uuid, file_ids: &[Uuid]) -> EngineResult<BulkSummary> {
        let (requested, records, skipped) = self.prepare(user_id, file_ids).await?;
        let summary = BulkSummary::new(BulkOperation::Archive, requested, skipped);

        let lifecycle = &self.lifecycle;
        let outcomes = stream::iter(records.iter().map(|record| record.id))
            .map(|file_id| async move {
                (file_id, lifecycle.archive_deferred(user_id, file_id).await)
            })
            .buffered(self.config.bulk_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        self.settle(user_id, summary, outcomes).await
    }

    pub async fn bulk_restore(
        &self,
        user_id: Uuid,
        file_ids: &[Uuid],
        tier: RestoreTier,
    ) -> EngineResult<BulkSummary> {
        let (requested, records, skipped) = self.prepare(user_id, file_ids).await?;
        let summary = BulkSummary::new(BulkOperation::Restore, requested, skipped);

        let lifecycle = &self.lifecycle;
        let outcomes = stream::iter(records.iter().map(|record| record.id))
            .map(|file_id| async move {
                (file_id, lifecycle.restore_deferred(user_id, file_id, tier).await)
            })
            .buffered(self.config.bulk_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        self.settle(user_id, summary, outcomes).await
    }

    async fn settle(
        &self,
        user_id: Uuid,
        mut summary: BulkSummary,
        outcomes: Vec<(Uuid, EngineResult<LifecycleJob>)>,
    ) -> EngineResult<BulkSummary> {
        for (file_id, outcome) in outcomes {
            match outcome {
                Ok(job) if job.status == JobStatus::Failed => {
                    summary.failed.push(ItemFailure::failed_job(&job));
                }
                Ok(_) => summary.succeeded.push(file_id),
                Err(err) => summary.failed.push(ItemFailure::from_error(file_id, &err)),
            }
        }

        let version = self.cache.bump_or_warn(user_id).await;
        let summary = summary.finish(version);
        info!(
            %user_id,
            operation = ?summary.operation,
            requested = summary.requested,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "bulk operation finished"
        );
        Ok(summary)
    }
}
