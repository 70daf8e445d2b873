//! QuotaLedger: tier enforcement before any bytes are committed.
//!
//! Usage is a live aggregate over non-deleted file records. A cached usage
//! counter in the shared store only ever short-circuits an *allow* when the
//! request is comfortably under the limit; every rejection is decided on the
//! live figure.

use crate::{
    config::EngineConfig,
    errors::{EngineError, EngineResult, QuotaDetails, QuotaKind},
    models::quota::{EffectiveLimits, Plan, Subscription, UsageReport},
    services::{file_registry::FileRegistry, kv_store::KvStore},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn usage_key(user_id: Uuid) -> String {
    format!("storage_used:{user_id}")
}

fn limit_key(user_id: Uuid) -> String {
    format!("quota_limit:{user_id}")
}

fn file_limit_key(user_id: Uuid) -> String {
    format!("quota_file_limit:{user_id}")
}

/// Stored in the file-limit cache when the plan has no per-file ceiling.
const NO_FILE_LIMIT: i64 = -1;

#[derive(Clone)]
pub struct QuotaLedger {
    db: Arc<SqlitePool>,
    kv: Arc<dyn KvStore>,
    registry: FileRegistry,
    config: Arc<EngineConfig>,
}

impl QuotaLedger {
    pub fn new(
        db: Arc<SqlitePool>,
        kv: Arc<dyn KvStore>,
        registry: FileRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db,
            kv,
            registry,
            config,
        }
    }

    /// Allow or reject committing `additional_bytes` more for `user_id`.
    pub async fn check_upload_allowed(
        &self,
        user_id: Uuid,
        additional_bytes: i64,
    ) -> EngineResult<()> {
        if additional_bytes < 0 {
            return Err(EngineError::InvalidInput(
                "byte count cannot be negative".into(),
            ));
        }
        let (limit, file_limit) = self.cached_limits(user_id).await?;

        if let Some(file_limit) = file_limit {
            if additional_bytes > file_limit {
                let used = self.registry.live_usage_bytes(user_id).await?;
                info!(%user_id, additional_bytes, file_limit, "file exceeds plan size ceiling");
                return Err(EngineError::QuotaExceeded(QuotaDetails {
                    kind: QuotaKind::FileSize,
                    current_usage: used,
                    limit: file_limit,
                    requested: additional_bytes,
                    remaining: file_limit,
                }));
            }
        }

        if let Ok(Some(cached)) = self.kv.get(&usage_key(user_id)).await {
            let headroom = (limit as f64 * (1.0 - self.config.quota_fast_path_margin)) as i64;
            if cached.saturating_add(additional_bytes) <= headroom {
                debug!(%user_id, cached, additional_bytes, "quota fast path");
                return Ok(());
            }
        }

        let used = self.registry.live_usage_bytes(user_id).await?;
        if let Err(err) = self
            .kv
            .set(&usage_key(user_id), used, Some(self.config.limit_cache_ttl))
            .await
        {
            warn!(%user_id, error = %err, "failed to cache storage usage");
        }

        if used.saturating_add(additional_bytes) > limit {
            info!(%user_id, used, limit, additional_bytes, "storage quota exceeded");
            return Err(EngineError::QuotaExceeded(QuotaDetails::new(
                QuotaKind::Storage,
                used,
                limit,
                additional_bytes,
            )));
        }
        Ok(())
    }

    /// Limits from the database, ignoring any cache.
    pub async fn effective_limits(&self, user_id: Uuid) -> EngineResult<EffectiveLimits> {
        let now = Utc::now();
        let subscription = self.subscription(user_id).await?;
        let plan = match subscription {
            Some(sub) if sub.is_current(now) => self.plan(&sub.plan_id).await?,
            _ => None,
        };

        Ok(match plan {
            Some(plan) => EffectiveLimits {
                storage_limit_bytes: plan.storage_limit_bytes,
                max_file_size_bytes: plan.max_file_size_bytes,
                plan_id: Some(plan.id),
            },
            None => EffectiveLimits {
                storage_limit_bytes: self.config.free_tier_limit_bytes,
                max_file_size_bytes: None,
                plan_id: None,
            },
        })
    }

    async fn cached_limits(&self, user_id: Uuid) -> EngineResult<(i64, Option<i64>)> {
        let cached = (
            self.kv.get(&limit_key(user_id)).await,
            self.kv.get(&file_limit_key(user_id)).await,
        );
        if let (Ok(Some(limit)), Ok(Some(file_limit))) = cached {
            let file_limit = (file_limit != NO_FILE_LIMIT).then_some(file_limit);
            return Ok((limit, file_limit));
        }

        let limits = self.effective_limits(user_id).await?;
        self.cache_limits(user_id, &limits).await;
        Ok((limits.storage_limit_bytes, limits.max_file_size_bytes))
    }

    async fn cache_limits(&self, user_id: Uuid, limits: &EffectiveLimits) {
        let ttl = Some(self.config.limit_cache_ttl);
        let file_limit = limits.max_file_size_bytes.unwrap_or(NO_FILE_LIMIT);
        let stored = async {
            self.kv
                .set(&limit_key(user_id), limits.storage_limit_bytes, ttl)
                .await?;
            self.kv.set(&file_limit_key(user_id), file_limit, ttl).await
        };
        if let Err(err) = stored.await {
            warn!(%user_id, error = %err, "failed to cache quota limits");
        }
    }

    /// Drop cached limits and usage so the next check reads the database.
    pub async fn invalidate(&self, user_id: Uuid) {
        for key in [usage_key(user_id), limit_key(user_id), file_limit_key(user_id)] {
            if let Err(err) = self.kv.delete(&key).await {
                warn!(%user_id, key = %key, error = %err, "failed to invalidate quota cache");
            }
        }
    }

    /// Drop only the cached usage figure, after bytes were added or freed.
    pub async fn invalidate_usage(&self, user_id: Uuid) {
        if let Err(err) = self.kv.delete(&usage_key(user_id)).await {
            warn!(%user_id, error = %err, "failed to invalidate cached usage");
        }
    }

    pub async fn usage(&self, user_id: Uuid) -> EngineResult<UsageReport> {
        let limits = self.effective_limits(user_id).await?;
        let used = self.registry.live_usage_bytes(user_id).await?;
        let limit = limits.storage_limit_bytes;
        let percent_used = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            100.0
        };
        Ok(UsageReport {
            user_id,
            used_bytes: used,
            limit_bytes: limit,
            remaining_bytes: (limit - used).max(0),
            percent_used,
            max_file_size_bytes: limits.max_file_size_bytes,
            plan_id: limits.plan_id,
        })
    }

    /// Billing hook: the user is now on `plan_id`.
    pub async fn on_plan_changed(
        &self,
        user_id: Uuid,
        plan_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<EffectiveLimits> {
        if self.plan(plan_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("plan {plan_id}")));
        }
        sqlx::query(
            "INSERT INTO subscriptions (user_id, plan_id, active, expires_at, updated_at)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                active = 1,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        info!(%user_id, plan_id, "plan changed, re-evaluating limits");
        self.reevaluate(user_id).await
    }

    /// Billing hook: the user's subscription lapsed.
    pub async fn on_plan_expired(&self, user_id: Uuid) -> EngineResult<EffectiveLimits> {
        sqlx::query("UPDATE subscriptions SET active = 0, updated_at = ? WHERE user_id = ?")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&*self.db)
            .await?;

        info!(%user_id, "plan expired, re-evaluating limits");
        self.reevaluate(user_id).await
    }

    async fn reevaluate(&self, user_id: Uuid) -> EngineResult<EffectiveLimits> {
        self.invalidate(user_id).await;
        let limits = self.effective_limits(user_id).await?;
        self.cache_limits(user_id, &limits).await;
        Ok(limits)
    }

    pub async fn upsert_plan(&self, plan: &Plan) -> EngineResult<()> {
        if plan.storage_limit_bytes < 0 || plan.max_file_size_bytes.is_some_and(|v| v <= 0) {
            return Err(EngineError::InvalidInput("plan limits must be positive".into()));
        }
        sqlx::query(
            "INSERT INTO plans (id, name, storage_limit_bytes, max_file_size_bytes)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                storage_limit_bytes = excluded.storage_limit_bytes,
                max_file_size_bytes = excluded.max_file_size_bytes",
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(plan.storage_limit_bytes)
        .bind(plan.max_file_size_bytes)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn plan(&self, plan_id: &str) -> sqlx::Result<Option<Plan>> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, name, storage_limit_bytes, max_file_size_bytes FROM plans WHERE id = ?",
        )
        .bind(plan_id)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn subscription(&self, user_id: Uuid) -> sqlx::Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT user_id, plan_id, active, expires_at, updated_at
             FROM subscriptions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Replace the cached usage counter with the live figure. Returns the
    /// drift that was corrected, if a cached value existed.
    pub async fn reconcile(&self, user_id: Uuid) -> EngineResult<(i64, Option<i64>)> {
        let live = self.registry.live_usage_bytes(user_id).await?;
        let cached = self.kv.get(&usage_key(user_id)).await?;
        if cached != Some(live) {
            self.kv
                .set(&usage_key(user_id), live, Some(self.config.limit_cache_ttl))
                .await?;
        }
        Ok((live, cached.map(|c| c - live)))
    }
}
