//! LocalObjectStorage: disk-backed warm tier.
//!
//! Payloads live beneath `base_path/{shard}/{shard}/{key}` where the shards
//! are the first two bytes of MD5(key). Multipart parts are staged under
//! `base_path/.multipart/{upload_id}/` until completion concatenates them.
//! Presigned URLs point back at this service's `/objects/{*key}` routes and
//! carry an HMAC-SHA256 signature with an expiry.

use crate::{
    models::multipart::CompletedPart,
    services::{
        object_keys::ensure_key_safe,
        object_storage::{
            BackendError, BackendResult, BatchDeleteOutcome, ByteStream, DeleteFailure,
            MultipartHandle, ObjectStorage,
        },
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use md5::Context;
use serde::Deserialize;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const STAGING_DIR: &str = ".multipart";
const STAGED_KEY_FILE: &str = "key";

/// Query parameters carried by a presigned URL.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedParams {
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
    pub expires: i64,
    pub signature: String,
}

/// Signs and verifies presigned URLs.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<Vec<u8>>,
    public_base_url: String,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, public_base_url: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn mac(
        &self,
        method: &str,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        expires: i64,
    ) -> BackendResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| BackendError::Permanent(format!("invalid signing key: {e}")))?;
        let part = part_number.map(|p| p.to_string()).unwrap_or_default();
        let to_sign = format!(
            "{method}\n{key}\n{}\n{part}\n{expires}",
            upload_id.unwrap_or("")
        );
        mac.update(to_sign.as_bytes());
        Ok(mac)
    }

    /// Build a URL valid for `ttl`.
    pub fn sign_url(
        &self,
        method: &str,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        ttl: Duration,
    ) -> BackendResult<String> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = hex::encode(
            self.mac(method, key, upload_id, part_number, expires)?
                .finalize()
                .into_bytes(),
        );

        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = format!("{}/objects/{}?", self.public_base_url, path);
        if let (Some(upload_id), Some(part)) = (upload_id, part_number) {
            url.push_str(&format!(
                "uploadId={}&partNumber={}&",
                urlencoding::encode(upload_id),
                part
            ));
        }
        url.push_str(&format!("expires={expires}&signature={signature}"));
        Ok(url)
    }

    /// Check signature and expiry in constant time.
    pub fn verify(&self, method: &str, key: &str, params: &SignedParams) -> bool {
        if params.expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(signature) = hex::decode(&params.signature) else {
            return false;
        };
        match self.mac(
            method,
            key,
            params.upload_id.as_deref(),
            params.part_number,
            params.expires,
        ) {
            Ok(mac) => mac.verify_slice(&signature).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct LocalObjectStorage {
    /// Root directory for payloads and staged parts.
    pub base_path: PathBuf,
    signer: UrlSigner,
}

impl LocalObjectStorage {
    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Two-level shard directories from MD5(key), reducing files per directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.staging_dir(upload_id)
            .join(format!("{part_number:05}.part"))
    }

    fn check_key(key: &str) -> BackendResult<()> {
        ensure_key_safe(key).map_err(|err| BackendError::Permanent(err.to_string()))
    }

    fn check_upload_id(upload_id: &str) -> BackendResult<()> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(BackendError::Permanent(format!(
                "malformed upload id `{upload_id}`"
            )));
        }
        Ok(())
    }

    async fn staged_key(&self, upload_id: &str) -> BackendResult<String> {
        Self::check_upload_id(upload_id)?;
        let marker = self.staging_dir(upload_id).join(STAGED_KEY_FILE);
        match fs::read_to_string(&marker).await {
            Ok(key) => Ok(key),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(
                format!("multipart upload {upload_id}"),
            )),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    /// Store one part sent to a presigned URL. Returns the part ETag.
    pub async fn receive_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        stream: ByteStream,
    ) -> BackendResult<String> {
        if part_number == 0 {
            return Err(BackendError::Permanent("part numbers start at 1".into()));
        }
        let staged = self.staged_key(upload_id).await?;
        if staged != key {
            return Err(BackendError::Permanent(format!(
                "upload {upload_id} does not belong to `{key}`"
            )));
        }
        let (_, etag) = write_stream_atomic(&self.part_path(upload_id, part_number), stream).await?;
        Ok(etag)
    }

    /// Open a stored object for streaming out, with its length.
    pub async fn open_object(&self, key: &str) -> BackendResult<(File, u64)> {
        Self::check_key(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::NotFound(key.to_string())
            } else {
                BackendError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Recursively remove empty directories up to the storage root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn create_multipart_upload(
        &self,
        key: &str,
        _content_type: Option<&str>,
    ) -> BackendResult<MultipartHandle> {
        Self::check_key(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let staging = self.staging_dir(&upload_id);
        fs::create_dir_all(&staging).await?;
        fs::write(staging.join(STAGED_KEY_FILE), key.as_bytes()).await?;
        Ok(MultipartHandle {
            upload_id,
            key: key.to_string(),
        })
    }

    async fn presign_part_upload(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        ttl: Duration,
    ) -> BackendResult<String> {
        Self::check_upload_id(&handle.upload_id)?;
        self.signer.sign_url(
            "PUT",
            &handle.key,
            Some(&handle.upload_id),
            Some(part_number),
            ttl,
        )
    }

    async fn complete_multipart_upload(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> BackendResult<String> {
        let staged = self.staged_key(&handle.upload_id).await?;
        if staged != handle.key {
            return Err(BackendError::Permanent(format!(
                "upload {} does not belong to `{}`",
                handle.upload_id, handle.key
            )));
        }
        if parts.is_empty() {
            return Err(BackendError::Permanent("no parts to assemble".into()));
        }

        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);

        let file_path = self.object_path(&handle.key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let assembled = assemble_parts(self, &handle.upload_id, &ordered, &tmp_path).await;
        let etag = match assembled {
            Ok(etag) => etag,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = replace_file(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = fs::remove_dir_all(self.staging_dir(&handle.upload_id)).await {
            debug!("failed to clear staging for {}: {}", handle.upload_id, err);
        }
        Ok(etag)
    }

    async fn abort_multipart_upload(&self, handle: &MultipartHandle) -> BackendResult<()> {
        Self::check_upload_id(&handle.upload_id)?;
        match fs::remove_dir_all(self.staging_dir(&handle.upload_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        Self::check_key(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn batch_delete_objects(&self, keys: &[String]) -> BackendResult<BatchDeleteOutcome> {
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            match self.delete_object(key).await {
                Ok(()) => outcome.deleted.push(key.clone()),
                Err(error) => outcome.errors.push(DeleteFailure {
                    key: key.clone(),
                    error,
                }),
            }
        }
        Ok(outcome)
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendResult<()> {
        let (file, _) = self.open_object(src_key).await?;
        self.put_object_stream(dst_key, Box::pin(ReaderStream::new(file)))
            .await?;
        Ok(())
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        Self::check_key(key)?;
        self.signer.sign_url("GET", key, None, None, ttl)
    }

    async fn head_object(&self, key: &str) -> BackendResult<Option<u64>> {
        Self::check_key(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn get_object_stream(&self, key: &str) -> BackendResult<ByteStream> {
        let (file, _) = self.open_object(key).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn put_object_stream(&self, key: &str, stream: ByteStream) -> BackendResult<u64> {
        Self::check_key(key)?;
        let (size, _) = write_stream_atomic(&self.object_path(key), stream).await?;
        Ok(size)
    }

    /// Write, read back and delete a probe file under the storage root.
    async fn health_check(&self) -> BackendResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let bytes = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if bytes? != b"readyz" {
            return Err(BackendError::Permanent("probe file content mismatch".into()));
        }
        Ok(())
    }
}

/// Concatenate staged parts into `tmp_path`, checking each part's ETag.
/// Returns the MD5 of the assembled object.
async fn assemble_parts(
    storage: &LocalObjectStorage,
    upload_id: &str,
    parts: &[CompletedPart],
    tmp_path: &Path,
) -> BackendResult<String> {
    let mut out = File::create(tmp_path).await?;
    let mut total = Context::new();
    let mut previous = 0;

    for part in parts {
        if part.part_number == previous {
            return Err(BackendError::Permanent(format!(
                "part {} listed twice",
                part.part_number
            )));
        }
        previous = part.part_number;

        let path = storage.part_path(upload_id, part.part_number);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::Permanent(format!("part {} was never uploaded", part.part_number))
            } else {
                BackendError::Io(err)
            }
        })?;

        let mut digest = Context::new();
        let mut chunks = ReaderStream::new(file);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            total.consume(&chunk);
            out.write_all(&chunk).await?;
        }

        let actual = format!("{:x}", digest.compute());
        if actual != part.etag.trim_matches('"') {
            return Err(BackendError::Permanent(format!(
                "etag mismatch for part {}",
                part.part_number
            )));
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(format!("{:x}", total.compute()))
}

/// Stream bytes into `path` through a temp file, fsync, then rename.
/// Returns the size and MD5 of what was written.
async fn write_stream_atomic(path: &Path, mut stream: ByteStream) -> BackendResult<(u64, String)> {
    let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
        BackendError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut size: u64 = 0;
    let mut digest = Context::new();
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        };
        size += chunk.len() as u64;
        digest.consume(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(BackendError::Io(err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(BackendError::Io(err));
    }

    if let Err(err) = replace_file(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(BackendError::Io(err));
    }

    Ok((size, format!("{:x}", digest.compute())))
}

async fn replace_file(tmp_path: &Path, final_path: &Path) -> io::Result<()> {
    match fs::rename(tmp_path, final_path).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(final_path).await?;
            fs::rename(tmp_path, final_path).await
        }
        other => other,
    }
}
