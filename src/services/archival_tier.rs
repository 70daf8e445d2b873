//! Deep-archive collaborator.
//!
//! Archiving is a single upload; reading back requires an explicit retrieval
//! job that completes asynchronously after a tier-dependent delay.

use crate::{
    models::lifecycle_job::RestoreTier,
    services::object_storage::{BackendError, BackendResult, ByteStream},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStatus {
    pub done: bool,
    /// Hours until the retrieval is expected to finish. Zero once done.
    pub eta_hours: f64,
}

#[async_trait]
pub trait ArchivalTier: Send + Sync {
    /// Store the stream and return an archive reference.
    async fn submit_archive(&self, stream: ByteStream) -> BackendResult<String>;

    async fn request_retrieval(
        &self,
        archive_ref: &str,
        tier: RestoreTier,
    ) -> BackendResult<String>;

    async fn poll_retrieval(&self, job_ref: &str) -> BackendResult<RetrievalStatus>;

    /// Bytes of a finished retrieval.
    async fn retrieval_output(&self, job_ref: &str) -> BackendResult<ByteStream>;

    /// Forget a retrieval once its output has been consumed or abandoned.
    /// Releasing an unknown retrieval succeeds.
    async fn release_retrieval(&self, job_ref: &str) -> BackendResult<()>;

    /// Deleting a missing archive succeeds. Retrievals of the archive are
    /// released with it.
    async fn delete_archive(&self, archive_ref: &str) -> BackendResult<()>;

    async fn health_check(&self) -> BackendResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrievalDescriptor {
    archive_ref: String,
    tier: RestoreTier,
    requested_at: DateTime<Utc>,
    ready_at: DateTime<Utc>,
}

/// Vault directory on local disk.
///
/// With `simulate_delay` on, retrievals become ready only after the tier's
/// nominal delay has elapsed, mirroring a real deep-archive service.
#[derive(Clone)]
pub struct LocalArchivalTier {
    vault: PathBuf,
    simulate_delay: bool,
}

impl LocalArchivalTier {
    pub fn new(vault: impl Into<PathBuf>, simulate_delay: bool) -> Self {
        Self {
            vault: vault.into(),
            simulate_delay,
        }
    }

    fn archive_path(&self, archive_ref: &str) -> BackendResult<PathBuf> {
        check_ref(archive_ref)?;
        Ok(self.vault.join("archives").join(format!("{archive_ref}.bin")))
    }

    fn retrieval_path(&self, job_ref: &str) -> BackendResult<PathBuf> {
        check_ref(job_ref)?;
        Ok(self.vault.join("retrievals").join(format!("{job_ref}.json")))
    }

    async fn load_descriptor(&self, job_ref: &str) -> BackendResult<RetrievalDescriptor> {
        let raw = fs::read(self.retrieval_path(job_ref)?)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BackendError::NotFound(format!("retrieval {job_ref}")),
                _ => BackendError::Io(err),
            })?;
        serde_json::from_slice(&raw)
            .map_err(|err| BackendError::Permanent(format!("corrupt retrieval {job_ref}: {err}")))
    }
}

fn check_ref(reference: &str) -> BackendResult<()> {
    if reference.is_empty() || !reference.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(BackendError::Permanent(format!(
            "malformed archive reference `{reference}`"
        )));
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> BackendResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BackendError::Io(err)),
    }
}

#[async_trait]
impl ArchivalTier for LocalArchivalTier {
    async fn submit_archive(&self, mut stream: ByteStream) -> BackendResult<String> {
        let archive_ref = Uuid::new_v4().simple().to_string();
        let path = self.archive_path(&archive_ref)?;
        let dir = self.vault.join("archives");
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{archive_ref}"));

        let mut file = File::create(&tmp_path).await?;
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => file.write_all(&chunk).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(archive_ref)
    }

    async fn request_retrieval(
        &self,
        archive_ref: &str,
        tier: RestoreTier,
    ) -> BackendResult<String> {
        let archive = self.archive_path(archive_ref)?;
        if fs::metadata(&archive).await.is_err() {
            return Err(BackendError::NotFound(format!("archive {archive_ref}")));
        }

        let now = Utc::now();
        let ready_at = if self.simulate_delay {
            now + tier.eta()
        } else {
            now
        };
        let descriptor = RetrievalDescriptor {
            archive_ref: archive_ref.to_string(),
            tier,
            requested_at: now,
            ready_at,
        };
        let job_ref = Uuid::new_v4().simple().to_string();
        let body = serde_json::to_vec(&descriptor)
            .map_err(|err| BackendError::Permanent(err.to_string()))?;
        fs::create_dir_all(self.vault.join("retrievals")).await?;
        fs::write(self.retrieval_path(&job_ref)?, body).await?;
        Ok(job_ref)
    }

    async fn poll_retrieval(&self, job_ref: &str) -> BackendResult<RetrievalStatus> {
        let descriptor = self.load_descriptor(job_ref).await?;
        let remaining = descriptor.ready_at - Utc::now();
        if remaining.num_milliseconds() <= 0 {
            Ok(RetrievalStatus {
                done: true,
                eta_hours: 0.0,
            })
        } else {
            Ok(RetrievalStatus {
                done: false,
                eta_hours: remaining.num_milliseconds() as f64 / 3_600_000.0,
            })
        }
    }

    async fn retrieval_output(&self, job_ref: &str) -> BackendResult<ByteStream> {
        let descriptor = self.load_descriptor(job_ref).await?;
        if descriptor.ready_at > Utc::now() {
            return Err(BackendError::Transient(format!(
                "retrieval {job_ref} is not ready"
            )));
        }
        let file = File::open(self.archive_path(&descriptor.archive_ref)?)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    BackendError::NotFound(format!("archive {}", descriptor.archive_ref))
                }
                _ => BackendError::Io(err),
            })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn release_retrieval(&self, job_ref: &str) -> BackendResult<()> {
        remove_if_present(&self.retrieval_path(job_ref)?).await
    }

    async fn delete_archive(&self, archive_ref: &str) -> BackendResult<()> {
        remove_if_present(&self.archive_path(archive_ref)?).await?;

        let mut entries = match fs::read_dir(self.vault.join("retrievals")).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(BackendError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(job_ref) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            match self.load_descriptor(job_ref).await {
                Ok(descriptor) if descriptor.archive_ref == archive_ref => {
                    remove_if_present(&path).await?;
                }
                Ok(_) => {}
                // Released concurrently.
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> BackendResult<()> {
        fs::create_dir_all(self.vault.join("archives")).await?;
        fs::metadata(&self.vault).await?;
        Ok(())
    }
}
