use anyhow::{Context, Result};
use coldvault::{
    config::{AppConfig, KvBackend},
    db,
    routes::routes::routes,
    services::{
        archival_tier::{ArchivalTier, LocalArchivalTier},
        engine::Engine,
        kv_store::{KvStore, MemoryKv, SqliteKv},
        local_object_storage::{LocalObjectStorage, UrlSigner},
        object_storage::ObjectStorage,
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        archive_dir = %cfg.archive_dir,
        kv_backend = ?cfg.kv_backend,
        "Starting coldvault"
    );

    // --- Ensure storage directories exist ---
    for dir in [&cfg.storage_dir, &cfg.archive_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir))?;
            tracing::info!("Created storage directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    db::run_migrations(&db).await?;

    // --- Collaborators ---
    let kv: Arc<dyn KvStore> = match cfg.kv_backend {
        KvBackend::Sqlite => Arc::new(SqliteKv::new(db.clone())),
        KvBackend::Memory => {
            tracing::warn!("Using in-process KV store; counters are not shared across instances");
            Arc::new(MemoryKv::new())
        }
    };
    let signer = UrlSigner::new(&cfg.presign_secret, cfg.public_url.clone());
    let local_objects = Arc::new(LocalObjectStorage::new(cfg.storage_dir.clone(), signer));
    let objects: Arc<dyn ObjectStorage> = local_objects.clone();
    let archive: Arc<dyn ArchivalTier> = Arc::new(LocalArchivalTier::new(
        cfg.archive_dir.clone(),
        cfg.simulate_retrieval_delay,
    ));

    // --- Engine + background sweep ---
    let engine = Engine::new(db, kv, objects, archive, cfg.engine.clone());
    engine.sweeper.clone().spawn_periodic(cfg.sweep_interval);

    let app = routes(engine, Some(local_objects));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
