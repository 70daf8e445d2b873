//! Shared key-value counters.
//!
//! Admission counters, cache versions and quota caches must be visible to
//! every request handler across processes, so they live behind this trait
//! rather than in process memory. `SqliteKv` shares the metadata database;
//! `MemoryKv` serves single-process deployments and tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use sqlx::SqlitePool;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("atomic increment is not supported by this store")]
    AtomicIncrUnsupported,
    #[error("kv store error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<i64>>;

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<()>;

    /// Set only if absent. Returns whether the value was stored.
    async fn add(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<bool>;

    /// Atomically add `delta` and return the new value. A missing key counts
    /// as zero. `ttl`, when given, refreshes the expiry.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> KvResult<i64>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    fn supports_atomic_incr(&self) -> bool;

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms() + ttl.as_millis() as i64)
}

/// Counters stored in the `kv_entries` table.
#[derive(Clone)]
pub struct SqliteKv {
    db: Arc<SqlitePool>,
}

impl SqliteKv {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> KvResult<Option<i64>> {
        let row = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT value, expires_at_ms FROM kv_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some((_, Some(expires))) if expires <= now_ms() => {
                sqlx::query("DELETE FROM kv_entries WHERE key = ? AND expires_at_ms <= ?")
                    .bind(key)
                    .bind(now_ms())
                    .execute(&*self.db)
                    .await?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn add(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<bool> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ? AND expires_at_ms <= ?")
            .bind(key)
            .bind(now_ms())
            .execute(&*self.db)
            .await?;

        let result = sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> KvResult<i64> {
        // An expired row restarts from zero instead of resurrecting its value.
        let value = sqlx::query_scalar::<_, i64>(
            "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN kv_entries.expires_at_ms IS NOT NULL AND kv_entries.expires_at_ms <= ?4
                        THEN excluded.value
                    ELSE kv_entries.value + excluded.value
                END,
                expires_at_ms = CASE
                    WHEN excluded.expires_at_ms IS NOT NULL THEN excluded.expires_at_ms
                    WHEN kv_entries.expires_at_ms IS NOT NULL AND kv_entries.expires_at_ms <= ?4
                        THEN NULL
                    ELSE kv_entries.expires_at_ms
                END
             RETURNING value",
        )
        .bind(key)
        .bind(delta)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .fetch_one(&*self.db)
        .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    fn supports_atomic_incr(&self) -> bool {
        true
    }

    async fn ping(&self) -> KvResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kv_entries")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: i64, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process counters backed by a `DashMap`.
///
/// Built with `without_atomic_incr()` it behaves like a cache that only offers
/// get/set/add, which forces callers onto their compare-and-retry paths.
#[derive(Clone)]
pub struct MemoryKv {
    entries: Arc<DashMap<String, MemoryEntry>>,
    atomic_incr: bool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            atomic_incr: true,
        }
    }

    pub fn without_atomic_incr() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            atomic_incr: false,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<i64>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<()> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(())
    }

    async fn add(&self, key: &str, value: i64, ttl: Option<Duration>) -> KvResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> KvResult<i64> {
        if !self.atomic_incr {
            return Err(KvError::AtomicIncrUnsupported);
        }
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::new(0, ttl));
        if entry.is_expired() {
            *entry = MemoryEntry::new(0, None);
        }
        entry.value += delta;
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(entry.value)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn supports_atomic_incr(&self) -> bool {
        self.atomic_incr
    }
}
