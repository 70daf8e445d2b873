//! Presigned download links for warm files.

use crate::{
    config::EngineConfig,
    errors::{EngineError, EngineResult},
    models::quota::ActivityKind,
    services::{
        file_registry::FileRegistry,
        object_storage::ObjectStorage,
        storage_tracking::StorageTracker,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct DownloadLink {
    pub file_id: Uuid,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FileAccess {
    objects: Arc<dyn ObjectStorage>,
    registry: FileRegistry,
    tracker: StorageTracker,
    config: Arc<EngineConfig>,
}

impl FileAccess {
    pub fn new(
        objects: Arc<dyn ObjectStorage>,
        registry: FileRegistry,
        tracker: StorageTracker,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            objects,
            registry,
            tracker,
            config,
        }
    }

    /// Only `uploaded` and `restored` files have a readable warm copy.
    /// Archived files must be restored first.
    pub async fn download_url(&self, user_id: Uuid, file_id: Uuid) -> EngineResult<DownloadLink> {
        let record = self.registry.get_owned(user_id, file_id).await?;
        if !record.status.is_warm() {
            return Err(EngineError::state_conflict(file_id, "download", record.status));
        }
        let Some(object_key) = record.object_key.as_deref() else {
            return Err(EngineError::BackendPermanent(format!(
                "file {file_id} has no warm object"
            )));
        };

        self.tracker
            .check_monthly_allowance(user_id, ActivityKind::Download, record.size_bytes)
            .await?;

        let ttl = self.config.download_ttl;
        let url = self.objects.presign_download(object_key, ttl).await?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|err| EngineError::InvalidInput(format!("download ttl: {err}")))?;

        self.tracker
            .track_download(user_id, file_id, record.size_bytes)
            .await;
        if let Err(err) = self.registry.touch_accessed(file_id, now).await {
            warn!(%file_id, error = %err, "failed to stamp last access");
        }

        debug!(%user_id, %file_id, %expires_at, "download link issued");
        Ok(DownloadLink {
            file_id,
            url,
            expires_at,
        })
    }
}
