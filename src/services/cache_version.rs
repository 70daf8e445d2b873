//! Per-user cache version counters.
//!
//! Listing and search caches embed the owner's version in their keys. Bumping
//! the version invalidates every derived entry without enumerating keys.

use crate::services::kv_store::{KvError, KvResult, KvStore};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_TTL: Duration = Duration::from_secs(1);
const LOCK_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct CacheVersionStore {
    kv: Arc<dyn KvStore>,
}

pub fn version_key(user_id: Uuid) -> String {
    format!("user_cache_version_{user_id}")
}

impl CacheVersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Version readers embed in their cache keys. Zero until the first bump.
    pub async fn current_version(&self, user_id: Uuid) -> KvResult<i64> {
        Ok(self.kv.get(&version_key(user_id)).await?.unwrap_or(0))
    }

    /// Cache key for a read scoped to `user_id`.
    pub async fn cache_key(&self, user_id: Uuid, scope: &str) -> KvResult<String> {
        let version = self.current_version(user_id).await?;
        Ok(format!("{scope}:{user_id}:v{version}"))
    }

    /// Increment the user's version and return the new value.
    ///
    /// Uses the store's atomic increment when it has one. Otherwise takes a
    /// short-lived lock key, retrying a few times, and finally falls back to a
    /// plain read-modify-write. A lost race there can only cost an extra
    /// invalidation, never a missed one.
    pub async fn bump(&self, user_id: Uuid) -> KvResult<i64> {
        let key = version_key(user_id);

        if self.kv.supports_atomic_incr() {
            match self.kv.incr_by(&key, 1, None).await {
                Ok(version) => return Ok(version),
                Err(KvError::AtomicIncrUnsupported) => {}
                Err(err) => return Err(err),
            }
        }

        let lock_key = format!("{key}_lock");
        for attempt in 0..LOCK_ATTEMPTS {
            if self.kv.add(&lock_key, 1, Some(LOCK_TTL)).await? {
                let result = self.read_and_increment(&key).await;
                if let Err(err) = self.kv.delete(&lock_key).await {
                    warn!(%user_id, error = %err, "failed to release cache version lock");
                }
                return result;
            }
            tokio::time::sleep(LOCK_BACKOFF * (attempt + 1)).await;
        }

        debug!(%user_id, "cache version lock contended, using best-effort increment");
        self.read_and_increment(&key).await
    }

    /// Bump without failing the caller. The mutation it follows has already
    /// committed, so a failure is logged rather than propagated.
    pub async fn bump_or_warn(&self, user_id: Uuid) -> Option<i64> {
        match self.bump(user_id).await {
            Ok(version) => Some(version),
            Err(err) => {
                warn!(%user_id, error = %err, "failed to bump cache version");
                None
            }
        }
    }

    async fn read_and_increment(&self, key: &str) -> KvResult<i64> {
        let next = self.kv.get(key).await?.unwrap_or(0) + 1;
        self.kv.set(key, next, None).await?;
        Ok(next)
    }
}
