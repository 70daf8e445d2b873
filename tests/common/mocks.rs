//! In-memory backends with failure injection.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

use async_trait::async_trait;
use bytes::Bytes;
use coldvault::{
    models::{lifecycle_job::RestoreTier, multipart::CompletedPart},
    services::{
        archival_tier::{ArchivalTier, RetrievalStatus},
        object_storage::{
            BackendError, BackendResult, BatchDeleteOutcome, ByteStream, DeleteFailure,
            MultipartHandle, ObjectStorage,
        },
    },
};
use dashmap::{DashMap, DashSet};
use futures::{StreamExt, stream};
use std::{
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use uuid::Uuid;

fn byte_stream(data: Bytes) -> ByteStream {
    Box::pin(stream::iter(vec![Ok(data)]))
}

async fn collect(mut stream: ByteStream) -> BackendResult<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(out))
}

/// Take one unit from `counter` if any remain.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Warm tier kept in memory.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockObjectStorage {
    pub objects: DashMap<String, Bytes>,
    /// upload id -> key
    pub uploads: DashMap<String, String>,
    pub aborted: DashSet<String>,
    /// Part bytes sent by clients, keyed by object key and part number.
    pub received_parts: DashMap<(String, u32), Bytes>,
    /// Make every batch delete fail as a whole.
    pub fail_batch_delete: AtomicBool,
    /// Keys whose deletion always fails permanently.
    pub failing_keys: DashSet<String>,
    /// Number of upcoming completes that fail transiently.
    pub transient_completes: AtomicU32,
    pub batch_delete_calls: AtomicUsize,
    pub single_delete_calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, data: &'static [u8]) {
        self.objects
            .insert(key.to_string(), Bytes::from_static(data));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// What a client PUT to a presigned part URL leaves behind.
    pub fn receive_part(&self, key: &str, part_number: u32, data: Bytes) {
        self.received_parts.insert((key.to_string(), part_number), data);
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn create_multipart_upload(
        &self,
        key: &str,
        _content_type: Option<&str>,
    ) -> BackendResult<MultipartHandle> {
        let upload_id = Uuid::new_v4().simple().to_string();
        self.uploads.insert(upload_id.clone(), key.to_string());
        Ok(MultipartHandle {
            upload_id,
            key: key.to_string(),
        })
    }

    async fn presign_part_upload(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        _ttl: Duration,
    ) -> BackendResult<String> {
        Ok(format!(
            "mock://{}?uploadId={}&partNumber={}",
            handle.key, handle.upload_id, part_number
        ))
    }

    async fn complete_multipart_upload(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> BackendResult<String> {
        if take(&self.transient_completes) {
            return Err(BackendError::Transient("complete timed out".into()));
        }
        if !self.uploads.contains_key(&handle.upload_id) {
            return Err(BackendError::NotFound(format!("upload {}", handle.upload_id)));
        }
        if let Some(part) = parts
            .iter()
            .find(|part| !self.received_parts.contains_key(&(handle.key.clone(), part.part_number)))
        {
            return Err(BackendError::Permanent(format!(
                "part {} was never uploaded",
                part.part_number
            )));
        }
        self.uploads.remove(&handle.upload_id);
        let mut body = Vec::new();
        for part in parts {
            if let Some((_, data)) = self
                .received_parts
                .remove(&(handle.key.clone(), part.part_number))
            {
                body.extend_from_slice(&data);
            }
        }
        self.objects.insert(handle.key.clone(), Bytes::from(body));
        Ok(format!("etag-{}", handle.upload_id))
    }

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> BackendResult<()> {
        self.uploads.remove(&handle.upload_id);
        self.aborted.insert(handle.upload_id.clone());
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.single_delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.contains(key) {
            return Err(BackendError::Permanent(format!("refused to delete `{key}`")));
        }
        self.objects.remove(key);
        Ok(())
    }

    async fn batch_delete_objects(&self, keys: &[String]) -> BackendResult<BatchDeleteOutcome> {
        self.batch_delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch_delete.load(Ordering::SeqCst) {
            return Err(BackendError::Permanent("batch delete unavailable".into()));
        }
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            if self.failing_keys.contains(key) {
                outcome.errors.push(DeleteFailure {
                    key: key.clone(),
                    error: BackendError::Permanent(format!("refused to delete `{key}`")),
                });
            } else {
                self.objects.remove(key);
                outcome.deleted.push(key.clone());
            }
        }
        Ok(outcome)
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendResult<()> {
        let data = self
            .objects
            .get(src_key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::NotFound(src_key.to_string()))?;
        self.objects.insert(dst_key.to_string(), data);
        Ok(())
    }

    async fn presign_download(&self, key: &str, _ttl: Duration) -> BackendResult<String> {
        Ok(format!("mock://{key}?download"))
    }

    async fn head_object(&self, key: &str) -> BackendResult<Option<u64>> {
        Ok(self.objects.get(key).map(|entry| entry.value().len() as u64))
    }

    async fn get_object_stream(&self, key: &str) -> BackendResult<ByteStream> {
        let data = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok(byte_stream(data))
    }

    async fn put_object_stream(&self, key: &str, stream: ByteStream) -> BackendResult<u64> {
        let data = collect(stream).await?;
        let len = data.len() as u64;
        self.objects.insert(key.to_string(), data);
        Ok(len)
    }

    async fn health_check(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Archival tier kept in memory. Retrievals finish when `ready` is set.
#[allow(dead_code)]
pub struct MockArchivalTier {
    pub archives: DashMap<String, Bytes>,
    /// retrieval job -> archive ref
    pub retrievals: DashMap<String, String>,
    pub ready: AtomicBool,
    pub fail_submit: AtomicBool,
    /// Number of upcoming submits that fail transiently.
    pub transient_submits: AtomicU32,
    /// Number of upcoming polls that fail transiently.
    pub transient_polls: AtomicU32,
    pub fail_delete: AtomicBool,
    /// Milliseconds a submit holds the read bytes before storing them.
    pub submit_delay_ms: AtomicU64,
}

impl Default for MockArchivalTier {
    fn default() -> Self {
        Self {
            archives: DashMap::new(),
            retrievals: DashMap::new(),
            ready: AtomicBool::new(true),
            fail_submit: AtomicBool::new(false),
            transient_submits: AtomicU32::new(0),
            transient_polls: AtomicU32::new(0),
            fail_delete: AtomicBool::new(false),
            submit_delay_ms: AtomicU64::new(0),
        }
    }
}

#[allow(dead_code)]
impl MockArchivalTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchivalTier for MockArchivalTier {
    async fn submit_archive(&self, stream: ByteStream) -> BackendResult<String> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(BackendError::Permanent("vault rejected the archive".into()));
        }
        if take(&self.transient_submits) {
            return Err(BackendError::Transient("vault throttled".into()));
        }
        let data = collect(stream).await?;
        let delay = self.submit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let archive_ref = Uuid::new_v4().simple().to_string();
        self.archives.insert(archive_ref.clone(), data);
        Ok(archive_ref)
    }

    async fn request_retrieval(
        &self,
        archive_ref: &str,
        _tier: RestoreTier,
    ) -> BackendResult<String> {
        if !self.archives.contains_key(archive_ref) {
            return Err(BackendError::NotFound(format!("archive {archive_ref}")));
        }
        let job_ref = Uuid::new_v4().simple().to_string();
        self.retrievals
            .insert(job_ref.clone(), archive_ref.to_string());
        Ok(job_ref)
    }

    async fn poll_retrieval(&self, job_ref: &str) -> BackendResult<RetrievalStatus> {
        if take(&self.transient_polls) {
            return Err(BackendError::Transient("vault unavailable".into()));
        }
        if !self.retrievals.contains_key(job_ref) {
            return Err(BackendError::NotFound(format!("retrieval {job_ref}")));
        }
        if self.ready.load(Ordering::SeqCst) {
            Ok(RetrievalStatus {
                done: true,
                eta_hours: 0.0,
            })
        } else {
            Ok(RetrievalStatus {
                done: false,
                eta_hours: 1.0,
            })
        }
    }

    async fn retrieval_output(&self, job_ref: &str) -> BackendResult<ByteStream> {
        let archive_ref = self
            .retrievals
            .get(job_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::NotFound(format!("retrieval {job_ref}")))?;
        let data = self
            .archives
            .get(&archive_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::NotFound(format!("archive {archive_ref}")))?;
        Ok(byte_stream(data))
    }

    async fn release_retrieval(&self, job_ref: &str) -> BackendResult<()> {
        self.retrievals.remove(job_ref);
        Ok(())
    }

    async fn delete_archive(&self, archive_ref: &str) -> BackendResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BackendError::Permanent("vault refused the delete".into()));
        }
        self.archives.remove(archive_ref);
        self.retrievals.retain(|_, target| target.as_str() != archive_ref);
        Ok(())
    }

    async fn health_check(&self) -> BackendResult<()> {
        Ok(())
    }
}
