use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};
use uuid::Uuid;

const GIB: i64 = 1024 * 1024 * 1024;

/// Which shared key-value store backs counters and cache versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackend {
    Sqlite,
    Memory,
}

impl FromStr for KvBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(KvBackend::Sqlite),
            "memory" => Ok(KvBackend::Memory),
            other => bail!("unknown kv backend `{}` (expected sqlite or memory)", other),
        }
    }
}

/// Limits and timings used by the lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upload workers the deployment runs.
    pub max_concurrent_uploads: i64,
    /// Files each worker may hold in flight. The per-user ceiling is the product.
    pub per_worker_fanout: i64,
    /// Safety expiry that reclaims abandoned in-flight reservations.
    pub in_flight_ttl: Duration,
    pub free_tier_limit_bytes: i64,
    pub max_file_size_bytes: i64,
    pub max_bulk_batch: usize,
    pub max_parts_per_upload: u32,
    pub presign_ttl: Duration,
    pub download_ttl: Duration,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    /// Archive jobs running longer than this are failed by the sweep.
    pub archive_job_timeout: chrono::Duration,
    /// Slack past a restore's ETA before the sweep gives up on it.
    pub restore_grace: chrono::Duration,
    /// Chunked uploads never completed or aborted are reclaimed after this.
    pub abandoned_upload_ttl: chrono::Duration,
    /// Hard-delete soft-deleted records older than this. Disabled when `None`.
    pub purge_deleted_after: Option<chrono::Duration>,
    /// Whether the sweep reconciles cached storage counters.
    pub reconcile_quota: bool,
    /// Cached usage only short-circuits the quota check when at least this
    /// fraction of the limit would remain.
    pub quota_fast_path_margin: f64,
    pub limit_cache_ttl: Duration,
    pub monthly_upload_limit_bytes: i64,
    pub monthly_download_limit_bytes: i64,
    pub monthly_storage_limit_bytes: i64,
    /// Abuse score above which a user is flagged.
    pub abuse_threshold: f64,
    /// Concurrent per-file operations inside a bulk archive or restore.
    pub bulk_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 100,
            per_worker_fanout: 1000,
            in_flight_ttl: Duration::from_secs(3600),
            free_tier_limit_bytes: 15 * GIB,
            max_file_size_bytes: 5 * GIB,
            max_bulk_batch: 1000,
            max_parts_per_upload: 10_000,
            presign_ttl: Duration::from_secs(2 * 3600),
            download_ttl: Duration::from_secs(3600),
            retry_max_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            archive_job_timeout: chrono::Duration::hours(1),
            restore_grace: chrono::Duration::hours(24),
            abandoned_upload_ttl: chrono::Duration::hours(24),
            purge_deleted_after: None,
            reconcile_quota: true,
            quota_fast_path_margin: 0.10,
            limit_cache_ttl: Duration::from_secs(300),
            monthly_upload_limit_bytes: 15 * GIB,
            monthly_download_limit_bytes: 50 * GIB,
            monthly_storage_limit_bytes: 15 * GIB,
            abuse_threshold: 0.7,
            bulk_concurrency: 4,
        }
    }
}

impl EngineConfig {
    /// Per-user ceiling on files in flight.
    pub fn admission_ceiling(&self) -> i64 {
        self.max_concurrent_uploads
            .saturating_mul(self.per_worker_fanout)
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub archive_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub presign_secret: String,
    pub kv_backend: KvBackend,
    pub sweep_interval: Duration,
    pub simulate_retrieval_delay: bool,
    pub engine: EngineConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Storage lifecycle and bulk operations engine")]
pub struct Args {
    /// Host to bind to (overrides COLDVAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides COLDVAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for warm-tier objects (overrides COLDVAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for the archive vault (overrides COLDVAULT_ARCHIVE_DIR)
    #[arg(long)]
    pub archive_dir: Option<String>,

    /// Database URL (overrides COLDVAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL used in presigned links (overrides COLDVAULT_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Key-value backend: sqlite or memory (overrides COLDVAULT_KV_BACKEND)
    #[arg(long)]
    pub kv_backend: Option<KvBackend>,

    /// Seconds between background sweeps (overrides COLDVAULT_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Hard-delete soft-deleted records after this many days
    #[arg(long)]
    pub purge_deleted_after_days: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("COLDVAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("COLDVAULT_PORT", 3000u16)?;
        let env_storage =
            env::var("COLDVAULT_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_archive = env::var("COLDVAULT_ARCHIVE_DIR").unwrap_or_else(|_| "./data/vault".into());
        let env_db = env::var("COLDVAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/coldvault.db".into());
        let env_public =
            env::var("COLDVAULT_PUBLIC_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".into());
        let presign_secret = env::var("COLDVAULT_PRESIGN_SECRET").unwrap_or_else(|_| {
            tracing::warn!("COLDVAULT_PRESIGN_SECRET not set, presigned URLs will not survive a restart");
            Uuid::new_v4().to_string()
        });
        let env_kv = env_parse("COLDVAULT_KV_BACKEND", KvBackend::Sqlite)?;
        let env_sweep = env_parse("COLDVAULT_SWEEP_INTERVAL_SECS", 300u64)?;
        let simulate_retrieval_delay = env_parse("COLDVAULT_SIMULATE_RETRIEVAL_DELAY", true)?;

        let mut engine = EngineConfig::default();
        engine.purge_deleted_after = args.purge_deleted_after_days.map(chrono::Duration::days);

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            archive_dir: args.archive_dir.unwrap_or(env_archive),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public),
            presign_secret,
            kv_backend: args.kv_backend.unwrap_or(env_kv),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep).max(1)),
            simulate_retrieval_delay,
            engine,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
