//! Engine: every service wired to the same collaborators.

use crate::{
    config::EngineConfig,
    errors::EngineResult,
    models::quota::{EffectiveLimits, UsageReport},
    services::{
        archival_tier::ArchivalTier, bulk_processor::BulkProcessor,
        cache_version::CacheVersionStore, file_access::FileAccess, file_registry::FileRegistry,
        kv_store::KvStore, lifecycle_jobs::LifecycleManager, object_storage::ObjectStorage,
        quota_gate::QuotaLedger, storage_tracking::StorageTracker,
        upload_orchestrator::UploadOrchestrator, sweeper::Sweeper,
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct Engine {
    pub db: Arc<SqlitePool>,
    pub kv: Arc<dyn KvStore>,
    pub objects: Arc<dyn ObjectStorage>,
    pub archive: Arc<dyn ArchivalTier>,
    pub config: Arc<EngineConfig>,
    pub registry: FileRegistry,
    pub cache: CacheVersionStore,
    pub quota: QuotaLedger,
    pub tracker: StorageTracker,
    pub uploads: UploadOrchestrator,
    pub lifecycle: LifecycleManager,
    pub bulk: BulkProcessor,
    pub access: FileAccess,
    pub sweeper: Sweeper,
}

impl Engine {
    pub fn new(
        db: Arc<SqlitePool>,
        kv: Arc<dyn KvStore>,
        objects: Arc<dyn ObjectStorage>,
        archive: Arc<dyn ArchivalTier>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let registry = FileRegistry::new(db.clone());
        let cache = CacheVersionStore::new(kv.clone());
        let quota = QuotaLedger::new(db.clone(), kv.clone(), registry.clone(), config.clone());
        let tracker = StorageTracker::new(db.clone(), config.clone());
        let uploads = UploadOrchestrator::new(
            db.clone(),
            kv.clone(),
            objects.clone(),
            registry.clone(),
            quota.clone(),
            tracker.clone(),
            cache.clone(),
            config.clone(),
        );
        let lifecycle = LifecycleManager::new(
            db.clone(),
            objects.clone(),
            archive.clone(),
            registry.clone(),
            quota.clone(),
            tracker.clone(),
            cache.clone(),
            config.clone(),
        );
        let bulk = BulkProcessor::new(
            objects.clone(),
            archive.clone(),
            registry.clone(),
            lifecycle.clone(),
            quota.clone(),
            tracker.clone(),
            cache.clone(),
            config.clone(),
        );
        let access = FileAccess::new(
            objects.clone(),
            registry.clone(),
            tracker.clone(),
            config.clone(),
        );
        let sweeper = Sweeper::new(
            lifecycle.clone(),
            uploads.clone(),
            registry.clone(),
            quota.clone(),
            tracker.clone(),
            config.clone(),
        );

        Self {
            db,
            kv,
            objects,
            archive,
            config,
            registry,
            cache,
            quota,
            tracker,
            uploads,
            lifecycle,
            bulk,
            access,
            sweeper,
        }
    }

    /// Billing hook. Cached reads derived from the old limits are invalidated.
    pub async fn on_plan_changed(
        &self,
        user_id: Uuid,
        plan_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<EffectiveLimits> {
        let limits = self.quota.on_plan_changed(user_id, plan_id, expires_at).await?;
        self.cache.bump_or_warn(user_id).await;
        Ok(limits)
    }

    pub async fn on_plan_expired(&self, user_id: Uuid) -> EngineResult<EffectiveLimits> {
        let limits = self.quota.on_plan_expired(user_id).await?;
        self.cache.bump_or_warn(user_id).await;
        Ok(limits)
    }

    pub async fn usage(&self, user_id: Uuid) -> EngineResult<UsageReport> {
        self.quota.usage(user_id).await
    }
}
