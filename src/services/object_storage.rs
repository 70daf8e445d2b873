//! Warm-tier object storage collaborator.
//!
//! The engine never stores content itself. It drives an external backend
//! through this trait: multipart uploads the client completes directly,
//! single and batched deletes, copies and presigned downloads.

use crate::models::multipart::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin, time::Duration};
use thiserror::Error;

/// A boxed stream of bytes moved between backends.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend failure: {0}")]
    Permanent(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient(_) => true,
            BackendError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle for a multipart upload opened on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartHandle {
    pub upload_id: String,
    pub key: String,
}

#[derive(Debug)]
pub struct DeleteFailure {
    pub key: String,
    pub error: BackendError,
}

/// Per-key result of a batched delete.
#[derive(Debug, Default)]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteFailure>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<MultipartHandle>;

    /// URL the client uploads part `part_number` (1-based) to.
    async fn presign_part_upload(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        ttl: Duration,
    ) -> BackendResult<String>;

    /// Assemble the parts in order. Returns the object's ETag.
    async fn complete_multipart_upload(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> BackendResult<String>;

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> BackendResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// Delete many keys in one call. An `Err` means the call as a whole failed
    /// and no per-key outcome is known.
    async fn batch_delete_objects(&self, keys: &[String]) -> BackendResult<BatchDeleteOutcome>;

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendResult<()>;

    async fn presign_download(&self, key: &str, ttl: Duration) -> BackendResult<String>;

    /// Size of the object, or `None` when it does not exist.
    async fn head_object(&self, key: &str) -> BackendResult<Option<u64>>;

    async fn get_object_stream(&self, key: &str) -> BackendResult<ByteStream>;

    /// Write a whole object. Returns the number of bytes stored.
    async fn put_object_stream(&self, key: &str, stream: ByteStream) -> BackendResult<u64>;

    async fn health_check(&self) -> BackendResult<()>;
}
