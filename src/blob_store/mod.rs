// Blob Store
//
// Content storage behind a trait so the pipeline can run against S3 in
// production, the local filesystem in development, and an in-memory map in
// tests. Keys are server-chosen; nothing outside this crate ever picks one.

pub mod local;
pub mod mock;

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::S3Config;

/// Part size for S3 multipart uploads. Also the read granularity of
/// `put_stream`, so memory stays bounded for multi-gigabyte objects.
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("S3 SDK error: {0}")]
    Sdk(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Size information without reading the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
}

/// Storage operations the pipeline depends on.
///
/// Guarantees required of implementations: writes are durable before the
/// put call returns; size after write equals bytes written; concurrent
/// readers see the complete object or none.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream bytes into storage under `key`, returning the byte count.
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError>;

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError>;

    async fn open_read(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError>;

    async fn stat(&self, key: &str) -> Result<BlobStat, BlobStoreError>;

    /// Short-lived read token handed to external processes.
    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError>;

    /// Idempotent: deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    /// Keys under a prefix, for the reconciler sweep.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;
}

/// Production S3 blob store
pub struct S3BlobStore {
    client: Client,
    bucket_name: String,
}

impl S3BlobStore {
    pub async fn new(config: S3Config) -> Result<Self, BlobStoreError> {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "scribed-s3-config",
        );

        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);

        if let Some(endpoint) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        let aws_config = builder.load().await;
        Ok(S3BlobStore {
            client: Client::new(&aws_config),
            bucket_name: config.bucket_name,
        })
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError> {
        // Multipart upload keeps memory bounded and gives all-or-nothing
        // visibility: the object does not exist until completion.
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| BlobStoreError::Sdk(format!("create multipart failed: {e}")))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| BlobStoreError::Sdk("missing multipart upload id".to_string()))?
            .to_string();

        let result = self.upload_parts(key, &upload_id, reader).await;
        match result {
            Ok(total) => Ok(total),
            Err(e) => {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket_name)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(data.to_vec().into())
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| BlobStoreError::Sdk(format!("put object failed: {e}")))?;
        Ok(())
    }

    async fn open_read(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = format!("{e}");
                if msg.contains("NoSuchKey") {
                    BlobStoreError::NotFound(key.to_string())
                } else {
                    BlobStoreError::Sdk(format!("get object failed: {msg}"))
                }
            })?;

        Ok(Box::new(response.body.into_async_read()))
    }

    async fn stat(&self, key: &str) -> Result<BlobStat, BlobStoreError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = format!("{e}");
                if msg.contains("NotFound") {
                    BlobStoreError::NotFound(key.to_string())
                } else {
                    BlobStoreError::Sdk(format!("head object failed: {msg}"))
                }
            })?;

        Ok(BlobStat {
            size: head.content_length().unwrap_or(0) as u64,
        })
    }

    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobStoreError::Sdk(format!("presign config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| BlobStoreError::Sdk(format!("presign failed: {e}")))?;

        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobStoreError::Sdk(format!("delete failed: {e}")))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| BlobStoreError::Sdk(format!("list failed: {e}")))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

impl S3BlobStore {
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut total: u64 = 0;
        let mut eof = false;

        while !eof {
            let mut buffer = Vec::with_capacity(MULTIPART_PART_SIZE);
            while buffer.len() < MULTIPART_PART_SIZE {
                let mut chunk = vec![0u8; MULTIPART_PART_SIZE - buffer.len()];
                let read = reader.read(&mut chunk).await?;
                if read == 0 {
                    eof = true;
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
            }

            // The final part may be undersized, but never empty unless the
            // whole stream was empty and this is part 1.
            if buffer.is_empty() && part_number > 1 {
                break;
            }

            total += buffer.len() as u64;
            let upload = self
                .client
                .upload_part()
                .bucket(&self.bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(buffer.into())
                .send()
                .await
                .map_err(|e| BlobStoreError::Sdk(format!("upload part {part_number}: {e}")))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(upload.e_tag().map(String::from))
                    .build(),
            );
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BlobStoreError::Sdk(format!("complete multipart failed: {e}")))?;

        Ok(total)
    }
}

/// Blob store handle shared across the server, worker, and reconciler.
#[derive(Clone)]
pub struct BlobStoreManager {
    store: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for BlobStoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStoreManager")
            .field("store", &"<dyn BlobStore>")
            .finish()
    }
}

impl BlobStoreManager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn new_s3(config: S3Config) -> Result<Self, BlobStoreError> {
        Ok(Self::new(Arc::new(S3BlobStore::new(config).await?)))
    }

    pub fn new_local(root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Arc::new(local::LocalBlobStore::new(root)))
    }

    pub async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError> {
        self.store.put_stream(key, reader).await
    }

    pub async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        self.store.put_bytes(key, data).await
    }

    pub async fn open_read(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError> {
        self.store.open_read(key).await
    }

    /// Read a whole blob into memory. Only for small objects (checkpoint
    /// payloads, assets); audio always goes through `open_read`.
    pub async fn read_to_vec(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let mut reader = self.open_read(key).await?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    pub async fn stat(&self, key: &str) -> Result<BlobStat, BlobStoreError> {
        self.store.stat(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        match self.store.stat(key).await {
            Ok(_) => Ok(true),
            Err(BlobStoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError> {
        self.store.presigned_get(key, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.store.delete(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        self.store.list(prefix).await
    }
}

/// Key layout helpers. Everything the pipeline writes lives under one of
/// these prefixes so the reconciler can enumerate managed keys.
pub mod keys {
    pub const UPLOADS_PREFIX: &str = "uploads/";
    pub const JOBS_PREFIX: &str = "jobs/";

    pub fn upload_chunk(upload_id: &str, index: u32) -> String {
        format!("uploads/{upload_id}/chunks/{index:05}")
    }

    pub fn upload_assembled(upload_id: &str) -> String {
        format!("uploads/{upload_id}/assembled")
    }

    pub fn normalized(job_id: &str) -> String {
        format!("jobs/{job_id}/normalized.wav")
    }

    pub fn segment(job_id: &str, index: usize) -> String {
        format!("jobs/{job_id}/segments/{index:05}.wav")
    }

    pub fn asset(job_id: &str, extension: &str) -> String {
        format!("jobs/{job_id}/assets/transcript.{extension}")
    }
}
