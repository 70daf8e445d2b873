//! Engine fixtures over an in-memory database and mock backends.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

use super::mocks::{MockArchivalTier, MockObjectStorage};
use bytes::Bytes;
use chrono::Utc;
use coldvault::{
    config::EngineConfig,
    db,
    models::{file_record::FileRecord, multipart::CompletedPart},
    services::{
        engine::Engine,
        file_registry::{FileRegistry, NewFileRecord},
        kv_store::{KvStore, MemoryKv},
        object_keys::build_object_key,
        upload_orchestrator::{OpenOutcome, OpenSessionRequest, OpenedSession},
    },
};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

#[allow(dead_code)]
pub const GIB: i64 = 1024 * 1024 * 1024;

/// Single-connection pool so every query sees the same in-memory database.
pub async fn test_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(pool)
}

/// Defaults with retry backoff short enough for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub struct TestEnv {
    pub engine: Engine,
    pub objects: Arc<MockObjectStorage>,
    pub archive: Arc<MockArchivalTier>,
    pub kv: Arc<dyn KvStore>,
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::with_kv(config, Arc::new(MemoryKv::new())).await
    }

    pub async fn with_kv(config: EngineConfig, kv: Arc<dyn KvStore>) -> Self {
        let db = test_pool().await;
        let objects = Arc::new(MockObjectStorage::new());
        let archive = Arc::new(MockArchivalTier::new());
        let engine = Engine::new(db, kv.clone(), objects.clone(), archive.clone(), config);
        Self {
            engine,
            objects,
            archive,
            kv,
        }
    }

    /// Insert an `uploaded` record with a warm object behind it.
    pub async fn seed_file(&self, owner_id: Uuid, name: &str, size_bytes: i64) -> FileRecord {
        self.seed_file_at(owner_id, "", name, size_bytes).await
    }

    pub async fn seed_file_at(
        &self,
        owner_id: Uuid,
        relative_path: &str,
        name: &str,
        size_bytes: i64,
    ) -> FileRecord {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let new = NewFileRecord {
            owner_id,
            display_name: name.to_string(),
            size_bytes,
            content_type: Some("application/octet-stream".into()),
            object_key: build_object_key(owner_id, relative_path, name, now),
            checksum: None,
            relative_path: relative_path.to_string(),
        };
        let mut conn = self
            .engine
            .db
            .acquire()
            .await
            .expect("Failed to acquire connection");
        FileRegistry::insert_uploading(&mut *conn, id, &new, now)
            .await
            .expect("Failed to insert record");
        assert!(
            FileRegistry::finalize_upload(&mut *conn, id, now)
                .await
                .expect("Failed to finalize record")
        );
        drop(conn);

        self.objects.put(&new.object_key, b"warm bytes");
        self.record(id).await
    }

    /// Open, complete and report a single-part upload.
    pub async fn upload_file(&self, owner_id: Uuid, name: &str, size_bytes: i64) -> FileRecord {
        let outcome = self
            .engine
            .uploads
            .open_session(owner_id, open_request(name, size_bytes))
            .await
            .expect("Failed to open upload");
        let OpenOutcome::Opened(opened) = outcome else {
            panic!("expected a new upload, got a duplicate");
        };
        self.send_parts(&opened, size_bytes, 1);
        let record = self
            .engine
            .uploads
            .complete(owner_id, opened.session_handle, vec![part(1)])
            .await
            .expect("Failed to complete upload");
        self.engine
            .uploads
            .complete_batch(owner_id, 1)
            .await
            .expect("Failed to release slot");
        record
    }

    /// Act as the client: put `part_count` parts adding up to `size_bytes`.
    pub fn send_parts(&self, opened: &OpenedSession, size_bytes: i64, part_count: u32) {
        let size = usize::try_from(size_bytes).expect("negative size");
        let count = part_count as usize;
        let base = size / count;
        for n in 1..=part_count {
            let len = if n == part_count {
                size - base * (count - 1)
            } else {
                base
            };
            self.objects
                .receive_part(&opened.object_key, n, Bytes::from(vec![0u8; len]));
        }
    }

    pub async fn record(&self, file_id: Uuid) -> FileRecord {
        self.engine
            .registry
            .get(file_id)
            .await
            .expect("Failed to load record")
            .expect("record missing")
    }

    pub async fn version(&self, user_id: Uuid) -> i64 {
        self.engine
            .cache
            .current_version(user_id)
            .await
            .expect("Failed to read cache version")
    }
}

#[allow(dead_code)]
pub fn open_request(name: &str, size_bytes: i64) -> OpenSessionRequest {
    OpenSessionRequest {
        filename: name.to_string(),
        content_type: Some("application/octet-stream".into()),
        size_bytes,
        relative_path: String::new(),
        checksum: None,
        upload_session_id: None,
    }
}

#[allow(dead_code)]
pub fn part(part_number: u32) -> CompletedPart {
    CompletedPart {
        part_number,
        etag: format!("\"etag-{part_number}\""),
    }
}
