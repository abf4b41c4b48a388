// Upload Session Manager
//
// Accepts arbitrarily large files as fixed-size ordered chunks, survives
// client disconnects, and produces a single verified blob plus a new job.
//
// Chunks are staged as individual blobs under the session prefix; finalize
// streams them in index order into one assembled object while hashing, so
// the assembled blob is never partially visible and a crashed finalize
// leaves the session OPEN with all chunks intact.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::blob_store::{keys, BlobStoreError, BlobStoreManager};
use crate::config::Config;
use crate::database::{Database, DbJob, DbUploadChunk, DbUploadSession};
use crate::models::SessionState;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("TOO_LARGE: {0} bytes exceeds the upload ceiling")]
    TooLarge(i64),
    #[error("UNSUPPORTED_TYPE: {0} is not an audio MIME type")]
    UnsupportedType(String),
    #[error("upload session not found: {0}")]
    SessionNotFound(String),
    #[error("session is not open (state: {0})")]
    SessionNotOpen(String),
    #[error("chunk index {index} out of range [0, {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk {index} length {actual} does not match expected {expected}")]
    LengthMismatch { index: u32, expected: i64, actual: i64 },
    #[error("CHUNK_CONFLICT: chunk {0} was already received with different bytes")]
    ChunkConflict(u32),
    #[error("INCOMPLETE: received {received} of {expected} chunks")]
    Incomplete { received: u32, expected: u32 },
    #[error("HASH_MISMATCH: assembled hash {actual} does not match declared {declared}")]
    HashMismatch { declared: String, actual: String },
    #[error("finalize already in progress for session {0}")]
    FinalizeInProgress(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(#[from] BlobStoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of a chunk PUT: the session's received-indices summary.
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub received: Vec<u32>,
    pub total_chunks: u32,
}

/// Outcome of a successful finalize.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub job_id: String,
    pub storage_key: String,
    pub content_sha256: String,
}

#[derive(Clone)]
pub struct UploadSessionManager {
    db: Database,
    blobs: BlobStoreManager,
    config: Arc<Config>,
    /// Sessions with a finalize in flight in this process. A persisted
    /// "finalizing" state would contradict the crashed-finalize-leaves-OPEN
    /// invariant, so the single-flight guard is process-local.
    finalizing: Arc<Mutex<HashSet<String>>>,
}

impl UploadSessionManager {
    pub fn new(db: Database, blobs: BlobStoreManager, config: Arc<Config>) -> Self {
        Self {
            db,
            blobs,
            config,
            finalizing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open a new session. The chunk size is fixed here and echoed to the
    /// client; chunks of any other length (except the final remainder) are
    /// rejected.
    pub async fn create_session(
        &self,
        owner_id: &str,
        filename: &str,
        total_size: i64,
        mime_type: &str,
    ) -> Result<DbUploadSession, UploadError> {
        if total_size <= 0 {
            return Err(UploadError::InvalidInput(format!(
                "total_size must be positive, got {total_size}"
            )));
        }
        if total_size > self.config.max_upload_bytes as i64 {
            return Err(UploadError::TooLarge(total_size));
        }
        if !mime_type.starts_with("audio/") {
            return Err(UploadError::UnsupportedType(mime_type.to_string()));
        }

        let session = DbUploadSession::new(
            owner_id,
            filename,
            total_size,
            mime_type,
            self.config.chunk_size_bytes as i64,
            self.config.session_ttl_hours,
        );
        self.db.insert_session(&session).await?;

        info!(
            upload_id = %session.upload_id,
            total_size,
            chunks = session.total_chunks(),
            "upload session created"
        );
        Ok(session)
    }

    /// Store one chunk. Re-PUT of identical bytes is idempotent; differing
    /// bytes for an already-received index conflict. Concurrent PUTs of
    /// distinct indices are safe.
    pub async fn put_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        let session = self.require_session(upload_id).await?;
        if session.state != SessionState::Open {
            return Err(UploadError::SessionNotOpen(session.state.as_str().to_string()));
        }

        let total = session.total_chunks();
        if chunk_index >= total {
            return Err(UploadError::IndexOutOfRange { index: chunk_index, total });
        }

        let expected = session.expected_chunk_len(chunk_index);
        if data.len() as i64 != expected {
            return Err(UploadError::LengthMismatch {
                index: chunk_index,
                expected,
                actual: data.len() as i64,
            });
        }

        let digest = hex::encode(Sha256::digest(data));

        if let Some(existing) = self.db.get_chunk_record(upload_id, chunk_index as i64).await? {
            if existing.sha256 == digest {
                // Identical bytes overwrite identically.
                return self.receipt(&session).await;
            }
            return Err(UploadError::ChunkConflict(chunk_index));
        }

        let storage_key = keys::upload_chunk(upload_id, chunk_index);
        self.blobs.put_bytes(&storage_key, data).await?;

        self.db
            .upsert_chunk_record(&DbUploadChunk {
                session_id: upload_id.to_string(),
                chunk_index: chunk_index as i64,
                byte_size: data.len() as i64,
                sha256: digest,
                storage_key,
                created_at: Utc::now(),
            })
            .await?;

        self.receipt(&session).await
    }

    /// Assemble the chunks into one blob, verify, and create the job.
    ///
    /// At most one finalize runs per session; an interrupted finalize leaves
    /// the session OPEN so the client may retry.
    pub async fn finalize(
        &self,
        upload_id: &str,
        client_sha256: Option<&str>,
        language: Option<String>,
        enable_diarization: bool,
    ) -> Result<FinalizeOutcome, UploadError> {
        let _guard = FinalizeGuard::acquire(&self.finalizing, upload_id)?;

        let session = self.require_session(upload_id).await?;
        match session.state {
            SessionState::Open => {}
            SessionState::Complete => {
                // Finalize retry after a completed run: idempotent success.
                return self.completed_outcome(&session).await;
            }
            other => return Err(UploadError::SessionNotOpen(other.as_str().to_string())),
        }

        let chunks = self.db.list_chunk_records(upload_id).await?;
        let expected = session.total_chunks();
        if chunks.len() as u32 != expected {
            return Err(UploadError::Incomplete {
                received: chunks.len() as u32,
                expected,
            });
        }

        let assembled_key = keys::upload_assembled(upload_id);
        let digest = self.assemble(&assembled_key, &chunks).await?;

        if let Some(declared) = client_sha256 {
            if !declared.eq_ignore_ascii_case(&digest) {
                // Leave the session OPEN; chunks are intact for a retry.
                self.blobs.delete(&assembled_key).await?;
                return Err(UploadError::HashMismatch {
                    declared: declared.to_string(),
                    actual: digest,
                });
            }
        }

        let mut completed = session.clone();
        completed.storage_key = Some(assembled_key.clone());
        let job = DbJob::from_finalized_session(
            &completed,
            language,
            enable_diarization,
            self.config.max_job_retries,
        );
        if !self
            .db
            .complete_session_and_create_job(upload_id, &assembled_key, &digest, &job)
            .await?
        {
            // Lost a race with an abort or expiry sweep.
            let session = self.require_session(upload_id).await?;
            return Err(UploadError::SessionNotOpen(session.state.as_str().to_string()));
        }

        // Chunk staging is no longer needed once the assembled blob exists.
        for chunk in &chunks {
            self.blobs.delete(&chunk.storage_key).await?;
        }
        self.db.delete_chunk_records(upload_id).await?;

        info!(upload_id, job_id = %job.job_id, sha256 = %digest, "upload finalized");
        Ok(FinalizeOutcome {
            job_id: job.job_id,
            storage_key: assembled_key,
            content_sha256: digest,
        })
    }

    /// Abort a session and release its chunk storage.
    pub async fn abort(&self, upload_id: &str) -> Result<(), UploadError> {
        let session = self.require_session(upload_id).await?;
        if !self
            .db
            .transition_session(upload_id, SessionState::Open, SessionState::Aborted)
            .await?
        {
            return Err(UploadError::SessionNotOpen(session.state.as_str().to_string()));
        }
        self.release_chunks(upload_id).await?;
        info!(upload_id, "upload session aborted");
        Ok(())
    }

    /// Expire a session past its TTL. Called by the reconciler sweep.
    pub async fn expire(&self, upload_id: &str) -> Result<(), UploadError> {
        if self
            .db
            .transition_session(upload_id, SessionState::Open, SessionState::Expired)
            .await?
        {
            self.release_chunks(upload_id).await?;
            warn!(upload_id, "upload session expired");
        }
        Ok(())
    }

    async fn require_session(&self, upload_id: &str) -> Result<DbUploadSession, UploadError> {
        self.db
            .get_session(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))
    }

    async fn receipt(&self, session: &DbUploadSession) -> Result<ChunkReceipt, UploadError> {
        Ok(ChunkReceipt {
            received: self.db.received_chunk_indices(&session.upload_id).await?,
            total_chunks: session.total_chunks(),
        })
    }

    async fn completed_outcome(
        &self,
        session: &DbUploadSession,
    ) -> Result<FinalizeOutcome, UploadError> {
        // A completed session always has its job: the two are written in one
        // transaction at finalize.
        let job = self
            .db
            .get_job_for_upload(&session.upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session.upload_id.clone()))?;

        Ok(FinalizeOutcome {
            job_id: job.job_id,
            storage_key: session.storage_key.clone().unwrap_or_default(),
            content_sha256: session.content_sha256.clone().unwrap_or_default(),
        })
    }

    /// Stream chunks in index order into the assembled blob, hashing on the
    /// way. A duplex pipe feeds `put_stream` so no chunk set is ever fully
    /// resident in memory.
    async fn assemble(
        &self,
        assembled_key: &str,
        chunks: &[DbUploadChunk],
    ) -> Result<String, UploadError> {
        let (mut writer, mut reader) = tokio::io::duplex(256 * 1024);

        let blobs = self.blobs.clone();
        let chunk_keys: Vec<String> = chunks.iter().map(|c| c.storage_key.clone()).collect();
        let feeder = tokio::spawn(async move {
            let mut hasher = Sha256::new();
            for key in chunk_keys {
                let mut chunk_reader = blobs.open_read(&key).await?;
                let mut buffer = vec![0u8; 256 * 1024];
                loop {
                    let read = tokio::io::AsyncReadExt::read(&mut chunk_reader, &mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                    writer.write_all(&buffer[..read]).await.map_err(BlobStoreError::Io)?;
                }
            }
            writer.shutdown().await.map_err(BlobStoreError::Io)?;
            Ok::<String, BlobStoreError>(hex::encode(hasher.finalize()))
        });

        let put_result = self.blobs.put_stream(assembled_key, &mut reader).await;
        let digest = feeder
            .await
            .map_err(|e| UploadError::InvalidInput(format!("assembly task panicked: {e}")))??;
        put_result?;

        Ok(digest)
    }

    async fn release_chunks(&self, upload_id: &str) -> Result<(), UploadError> {
        for chunk in self.db.list_chunk_records(upload_id).await? {
            self.blobs.delete(&chunk.storage_key).await?;
        }
        self.db.delete_chunk_records(upload_id).await?;
        Ok(())
    }
}

/// RAII entry in the finalizing set.
struct FinalizeGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    upload_id: String,
}

impl<'a> FinalizeGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, upload_id: &str) -> Result<Self, UploadError> {
        let mut locked = set.lock().unwrap();
        if !locked.insert(upload_id.to_string()) {
            return Err(UploadError::FinalizeInProgress(upload_id.to_string()));
        }
        Ok(Self {
            set,
            upload_id: upload_id.to_string(),
        })
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.upload_id);
    }
}
