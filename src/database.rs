use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    AssetKind, JobState, SessionState, Stage, JOB_STATE_CREATED, STAGE_CREATED,
};

/// Database models for the scribed job store
///
/// Three durable collections back the pipeline:
/// - Upload sessions and their per-chunk records
/// - Transcription jobs with stage, lease, checkpoint, and error fields
/// - Output assets and webhook registrations
///
/// Every mutation here is a single statement or transaction; the stage CAS
/// and lease stamping are the coordination primitives the workers rely on.

/// An in-progress chunked file assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbUploadSession {
    pub upload_id: String,
    pub owner_id: String,
    pub filename: String,
    pub total_size: i64,
    pub mime_type: String,
    /// Fixed for the lifetime of the session
    pub chunk_size: i64,
    /// Set when the assembled blob exists (state = complete)
    pub storage_key: Option<String>,
    /// Hex sha256 of the assembled bytes, computed at finalize
    pub content_sha256: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DbUploadSession {
    pub fn new(
        owner_id: &str,
        filename: &str,
        total_size: i64,
        mime_type: &str,
        chunk_size: i64,
        ttl_hours: i64,
    ) -> Self {
        let now = Utc::now();
        DbUploadSession {
            upload_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            total_size,
            mime_type: mime_type.to_string(),
            chunk_size,
            storage_key: None,
            content_sha256: None,
            state: SessionState::Open,
            created_at: now,
            expires_at: now + Duration::hours(ttl_hours),
        }
    }

    /// Number of chunks this session expects: ceil(total_size / chunk_size).
    pub fn total_chunks(&self) -> u32 {
        ((self.total_size + self.chunk_size - 1) / self.chunk_size) as u32
    }

    /// Expected byte length of the chunk at `index`; the final chunk may be
    /// shorter than `chunk_size`.
    pub fn expected_chunk_len(&self, index: u32) -> i64 {
        let last = self.total_chunks() - 1;
        if index == last {
            self.total_size - self.chunk_size * last as i64
        } else {
            self.chunk_size
        }
    }
}

/// One received chunk of an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbUploadChunk {
    pub session_id: String,
    pub chunk_index: i64,
    pub byte_size: i64,
    /// Hex sha256 of the chunk bytes, used to detect conflicting re-PUTs
    pub sha256: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

/// The unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbJob {
    pub job_id: String,
    pub owner_id: String,
    pub upload_id: String,
    pub total_size: i64,
    /// Populated by the validate stage
    pub total_duration_sec: Option<f64>,
    /// Requested language; `None` means AUTO
    pub language: Option<String>,
    pub detected_language: Option<String>,
    pub enable_diarization: bool,
    pub current_stage: Stage,
    pub state: JobState,
    /// Progress within the current stage, 0.0–1.0
    pub progress: f64,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Stage-name → blob key (`original`, `normalized`)
    pub storage_paths: HashMap<String, String>,
    /// Stage-name → elapsed seconds
    pub stage_durations: HashMap<String, f64>,
    pub word_count: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub failed_stage: Option<String>,
    /// Cooperative cancellation flag; handlers observe it at checkpoints
    pub cancel_requested: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DbJob {
    pub fn from_finalized_session(
        session: &DbUploadSession,
        language: Option<String>,
        enable_diarization: bool,
        max_retries: i32,
    ) -> Self {
        let now = Utc::now();
        let mut storage_paths = HashMap::new();
        if let Some(key) = &session.storage_key {
            storage_paths.insert("original".to_string(), key.clone());
        }
        DbJob {
            job_id: Uuid::new_v4().to_string(),
            owner_id: session.owner_id.clone(),
            upload_id: session.upload_id.clone(),
            total_size: session.total_size,
            total_duration_sec: None,
            language,
            detected_language: None,
            enable_diarization,
            current_stage: Stage::Created,
            state: JobState::Created,
            progress: 0.0,
            retry_count: 0,
            max_retries,
            storage_paths,
            stage_durations: HashMap::new(),
            word_count: None,
            error_code: None,
            error_message: None,
            failed_stage: None,
            cancel_requested: false,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A final output of a completed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbAsset {
    pub asset_id: String,
    pub job_id: String,
    pub kind: AssetKind,
    pub storage_key: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl DbAsset {
    pub fn new(job_id: &str, kind: AssetKind, storage_key: &str, byte_size: i64) -> Self {
        DbAsset {
            asset_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            kind,
            storage_key: storage_key.to_string(),
            byte_size,
            mime_type: kind.mime_type().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A per-owner webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbWebhook {
    pub webhook_id: String,
    pub owner_id: String,
    pub url: String,
    /// Shared secret for the HMAC signature header
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

impl DbWebhook {
    pub fn new(owner_id: &str, url: &str, secret: &str) -> Self {
        DbWebhook {
            webhook_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Initialize database connection and create tables
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        // Use sqlite:// with ?mode=rwc to create if it doesn't exist
        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        info!("Connecting to {}", database_url);
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Database { pool };
        db.create_tables().await?;
        Ok(db)
    }

    /// In-memory database for tests. A single pooled connection: every
    /// connection to `sqlite::memory:` would otherwise get its own database.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Database { pool };
        db.create_tables().await?;
        Ok(db)
    }

    /// Create all necessary tables
    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                upload_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                storage_key TEXT,
                content_sha256 TEXT,
                state TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_chunks (
                session_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                byte_size INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, chunk_index),
                FOREIGN KEY (session_id) REFERENCES upload_sessions (upload_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                upload_id TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                total_duration_sec REAL,
                language TEXT,
                detected_language TEXT,
                enable_diarization BOOLEAN NOT NULL DEFAULT FALSE,
                current_stage TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL DEFAULT '{}',
                progress REAL NOT NULL DEFAULT 0.0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                storage_paths TEXT NOT NULL DEFAULT '{{}}',
                stage_durations TEXT NOT NULL DEFAULT '{{}}',
                word_count INTEGER,
                error_code TEXT,
                error_message TEXT,
                failed_stage TEXT,
                cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
                lease_owner TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            STAGE_CREATED, JOB_STATE_CREATED
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_checkpoints (
                job_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, stage),
                FOREIGN KEY (job_id) REFERENCES jobs (job_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                asset_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (job_id, kind),
                FOREIGN KEY (job_id) REFERENCES jobs (job_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                webhook_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                url TEXT NOT NULL,
                secret TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_owner_id ON jobs (owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (state, lease_expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_state ON upload_sessions (state, expires_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_assets_job_id ON assets (job_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_webhooks_owner_id ON webhooks (owner_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ========================================================================
    // Upload sessions
    // ========================================================================

    pub async fn insert_session(&self, session: &DbUploadSession) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                upload_id, owner_id, filename, total_size, mime_type, chunk_size,
                storage_key, content_sha256, state, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.upload_id)
        .bind(&session.owner_id)
        .bind(&session.filename)
        .bind(session.total_size)
        .bind(&session.mime_type)
        .bind(session.chunk_size)
        .bind(&session.storage_key)
        .bind(&session.content_sha256)
        .bind(session.state)
        .bind(session.created_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session(
        &self,
        upload_id: &str,
    ) -> Result<Option<DbUploadSession>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| session_from_row(&row)))
    }

    /// Record a received chunk, overwriting any identical prior record.
    pub async fn upsert_chunk_record(&self, chunk: &DbUploadChunk) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO upload_chunks (
                session_id, chunk_index, byte_size, sha256, storage_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.session_id)
        .bind(chunk.chunk_index)
        .bind(chunk.byte_size)
        .bind(&chunk.sha256)
        .bind(&chunk.storage_key)
        .bind(chunk.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_chunk_record(
        &self,
        session_id: &str,
        chunk_index: i64,
    ) -> Result<Option<DbUploadChunk>, sqlx::Error> {
        let row =
            sqlx::query("SELECT * FROM upload_chunks WHERE session_id = ? AND chunk_index = ?")
                .bind(session_id)
                .bind(chunk_index)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|row| chunk_from_row(&row)))
    }

    /// Chunk records in index order.
    pub async fn list_chunk_records(
        &self,
        session_id: &str,
    ) -> Result<Vec<DbUploadChunk>, sqlx::Error> {
        let rows =
            sqlx::query("SELECT * FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().map(chunk_from_row).collect())
    }

    pub async fn received_chunk_indices(&self, session_id: &str) -> Result<Vec<u32>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("chunk_index") as u32)
            .collect())
    }

    pub async fn delete_chunk_records(&self, session_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// CAS a session from one state to another. Returns false if the session
    /// was not in `from`.
    pub async fn transition_session(
        &self,
        upload_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE upload_sessions SET state = ? WHERE upload_id = ? AND state = ?")
            .bind(to)
            .bind(upload_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Complete a session: assembled blob key + hash, CAS from open.
    pub async fn complete_session(
        &self,
        upload_id: &str,
        storage_key: &str,
        content_sha256: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET state = ?, storage_key = ?, content_sha256 = ?
            WHERE upload_id = ? AND state = ?
            "#,
        )
        .bind(SessionState::Complete)
        .bind(storage_key)
        .bind(content_sha256)
        .bind(upload_id)
        .bind(SessionState::Open)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Complete a session and create its job in one transaction, so a crash
    /// can never leave a completed session without a job (or vice versa).
    /// Returns false when the session was not OPEN.
    pub async fn complete_session_and_create_job(
        &self,
        upload_id: &str,
        storage_key: &str,
        content_sha256: &str,
        job: &DbJob,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET state = ?, storage_key = ?, content_sha256 = ?
            WHERE upload_id = ? AND state = ?
            "#,
        )
        .bind(SessionState::Complete)
        .bind(storage_key)
        .bind(content_sha256)
        .bind(upload_id)
        .bind(SessionState::Open)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, owner_id, upload_id, total_size, total_duration_sec,
                language, detected_language, enable_diarization, current_stage,
                state, progress, retry_count, max_retries, storage_paths,
                stage_durations, word_count, error_code, error_message,
                failed_stage, cancel_requested, lease_owner, lease_expires_at,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.owner_id)
        .bind(&job.upload_id)
        .bind(job.total_size)
        .bind(job.total_duration_sec)
        .bind(&job.language)
        .bind(&job.detected_language)
        .bind(job.enable_diarization)
        .bind(job.current_stage)
        .bind(job.state)
        .bind(job.progress)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(serde_json::to_string(&job.storage_paths).unwrap_or_else(|_| "{}".to_string()))
        .bind(serde_json::to_string(&job.stage_durations).unwrap_or_else(|_| "{}".to_string()))
        .bind(job.word_count)
        .bind(&job.error_code)
        .bind(&job.error_message)
        .bind(&job.failed_stage)
        .bind(job.cancel_requested)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at.map(|dt| dt.to_rfc3339()))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Job created at finalize for an upload session, if any.
    pub async fn get_job_for_upload(&self, upload_id: &str) -> Result<Option<DbJob>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM jobs WHERE upload_id = ? ORDER BY created_at LIMIT 1")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| job_from_row(&row)))
    }

    /// Open sessions past their TTL, for the expiry sweep.
    pub async fn list_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DbUploadSession>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM upload_sessions WHERE state = ? AND expires_at < ?")
            .bind(SessionState::Open)
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(session_from_row).collect())
    }

    /// Rewrite a session's expiry timestamp.
    pub async fn backdate_session_expiry(
        &self,
        upload_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE upload_id = ?")
            .bind(expires_at.to_rfc3339())
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<DbUploadSession>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM upload_sessions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn create_job(&self, job: &DbJob) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, owner_id, upload_id, total_size, total_duration_sec,
                language, detected_language, enable_diarization, current_stage,
                state, progress, retry_count, max_retries, storage_paths,
                stage_durations, word_count, error_code, error_message,
                failed_stage, cancel_requested, lease_owner, lease_expires_at,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.owner_id)
        .bind(&job.upload_id)
        .bind(job.total_size)
        .bind(job.total_duration_sec)
        .bind(&job.language)
        .bind(&job.detected_language)
        .bind(job.enable_diarization)
        .bind(job.current_stage)
        .bind(job.state)
        .bind(job.progress)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(serde_json::to_string(&job.storage_paths).unwrap_or_else(|_| "{}".to_string()))
        .bind(serde_json::to_string(&job.stage_durations).unwrap_or_else(|_| "{}".to_string()))
        .bind(job.word_count)
        .bind(&job.error_code)
        .bind(&job.error_message)
        .bind(&job.failed_stage)
        .bind(job.cancel_requested)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at.map(|dt| dt.to_rfc3339()))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<DbJob>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| job_from_row(&row)))
    }

    pub async fn list_jobs_by_state(
        &self,
        state: JobState,
        limit: i64,
    ) -> Result<Vec<DbJob>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY created_at LIMIT ?")
            .bind(state)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(job_from_row).collect())
    }

    pub async fn list_user_jobs(
        &self,
        owner_id: &str,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<DbJob>, sqlx::Error> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE owner_id = ? AND state = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(owner_id)
                .bind(state)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs WHERE owner_id = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(owner_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.iter().map(job_from_row).collect())
    }

    pub async fn list_all_jobs(&self) -> Result<Vec<DbJob>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM jobs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(job_from_row).collect())
    }

    /// Compare-and-swap on `current_stage`. Returns false when the observed
    /// stage is not `from`, meaning the caller lost the job to another worker.
    pub async fn update_stage(
        &self,
        job_id: &str,
        from: Stage,
        to: Stage,
        initial_progress: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET current_stage = ?, progress = ?, updated_at = ?
            WHERE job_id = ? AND current_stage = ?
            "#,
        )
        .bind(to)
        .bind(initial_progress)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Heartbeat progress within a stage. Only applies while the stage is
    /// unchanged, and never moves progress backwards.
    pub async fn update_stage_progress(
        &self,
        job_id: &str,
        stage: Stage,
        progress: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET progress = MAX(progress, ?), updated_at = ?
            WHERE job_id = ? AND current_stage = ?
            "#,
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_checkpoint(
        &self,
        job_id: &str,
        stage: Stage,
        payload: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO job_checkpoints (job_id, stage, payload, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(stage)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(
        &self,
        job_id: &str,
        stage: Stage,
    ) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT payload FROM job_checkpoints WHERE job_id = ? AND stage = ?")
            .bind(job_id)
            .bind(stage)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("payload")))
    }

    pub async fn set_total_duration(
        &self,
        job_id: &str,
        total_duration_sec: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET total_duration_sec = ?, updated_at = ? WHERE job_id = ?")
            .bind(total_duration_sec)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_detected_language(
        &self,
        job_id: &str,
        language: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET detected_language = ?, updated_at = ? WHERE job_id = ?")
            .bind(language)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_word_count(&self, job_id: &str, word_count: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET word_count = ?, updated_at = ? WHERE job_id = ?")
            .bind(word_count)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge one entry into the storage_paths map.
    ///
    /// Read-modify-write is safe here: only the worker holding the lease
    /// mutates a job's paths.
    pub async fn set_storage_path(
        &self,
        job_id: &str,
        name: &str,
        key: &str,
    ) -> Result<(), sqlx::Error> {
        let job = self.get_job(job_id).await?;
        let Some(job) = job else { return Ok(()) };

        let mut paths = job.storage_paths;
        paths.insert(name.to_string(), key.to_string());

        sqlx::query("UPDATE jobs SET storage_paths = ?, updated_at = ? WHERE job_id = ?")
            .bind(serde_json::to_string(&paths).unwrap_or_else(|_| "{}".to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_stage_duration(
        &self,
        job_id: &str,
        stage: Stage,
        seconds: f64,
    ) -> Result<(), sqlx::Error> {
        let job = self.get_job(job_id).await?;
        let Some(job) = job else { return Ok(()) };

        let mut durations = job.stage_durations;
        durations.insert(stage.as_str().to_string(), seconds);

        sqlx::query("UPDATE jobs SET stage_durations = ?, updated_at = ? WHERE job_id = ?")
            .bind(serde_json::to_string(&durations).unwrap_or_else(|_| "{}".to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the terminal failure of a job.
    pub async fn set_error(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
        failed_stage: Stage,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, error_code = ?, error_message = ?,
                failed_stage = ?, updated_at = ?
            WHERE job_id = ? AND state NOT IN ('complete', 'cancelled')
            "#,
        )
        .bind(JobState::Failed)
        .bind(code)
        .bind(message)
        .bind(failed_stage)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_retry(&self, job_id: &str) -> Result<i32, sqlx::Error> {
        sqlx::query("UPDATE jobs SET retry_count = retry_count + 1, updated_at = ? WHERE job_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT retry_count FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("retry_count"))
    }

    /// Claim runnable jobs for a worker, stamping a fresh lease on each.
    ///
    /// A job is runnable when it is non-terminal and its lease is absent or
    /// expired. The per-job CAS on the lease column prevents two workers
    /// from claiming the same job.
    pub async fn acquire_runnable(
        &self,
        limit: usize,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Vec<DbJob>, sqlx::Error> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let lease_until = (now + Duration::seconds(lease_seconds)).to_rfc3339();

        let candidates = sqlx::query(
            r#"
            SELECT job_id FROM jobs
            WHERE state IN ('created', 'running')
              AND (lease_expires_at IS NULL OR lease_expires_at < ?)
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&now_str)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut acquired = Vec::new();
        for row in candidates {
            let job_id: String = row.get("job_id");
            let result = sqlx::query(
                r#"
                UPDATE jobs SET lease_owner = ?, lease_expires_at = ?, state = 'running', updated_at = ?
                WHERE job_id = ? AND state IN ('created', 'running')
                  AND (lease_expires_at IS NULL OR lease_expires_at < ?)
                "#,
            )
            .bind(worker_id)
            .bind(&lease_until)
            .bind(&now_str)
            .bind(&job_id)
            .bind(&now_str)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                if let Some(job) = self.get_job(&job_id).await? {
                    acquired.push(job);
                }
            }
        }

        Ok(acquired)
    }

    /// Extend the lease held by `worker_id`. Returns false when the lease
    /// has been stolen or the job reached a terminal state.
    pub async fn extend_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, sqlx::Error> {
        let lease_until = (Utc::now() + Duration::seconds(lease_seconds)).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?
            WHERE job_id = ? AND lease_owner = ? AND state = 'running'
            "#,
        )
        .bind(&lease_until)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a lease so another worker may pick the job up immediately.
    pub async fn release_lease(&self, job_id: &str, worker_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL WHERE job_id = ? AND lease_owner = ?",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Owner-side cancellation flag. Returns false when the job is already
    /// terminal.
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET cancel_requested = TRUE, updated_at = ?
            WHERE job_id = ? AND state IN ('created', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_cancelled(&self, job_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, updated_at = ?
            WHERE job_id = ? AND state IN ('created', 'running')
            "#,
        )
        .bind(JobState::Cancelled)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Final transition: CAS generating_outputs → complete, stamping
    /// `completed_at` in the same statement.
    pub async fn mark_complete(&self, job_id: &str) -> Result<bool, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET current_stage = ?, state = ?, progress = 1.0,
                completed_at = ?, updated_at = ?
            WHERE job_id = ? AND current_stage = ?
            "#,
        )
        .bind(Stage::Complete)
        .bind(JobState::Complete)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .bind(Stage::GeneratingOutputs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Assets
    // ========================================================================

    /// Record a job's output assets as a set in one transaction, replacing
    /// any assets from a prior attempt.
    pub async fn insert_assets_atomic(&self, job_id: &str, assets: &[DbAsset]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM assets WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        for asset in assets {
            sqlx::query(
                r#"
                INSERT INTO assets (
                    asset_id, job_id, kind, storage_key, byte_size, mime_type, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&asset.asset_id)
            .bind(&asset.job_id)
            .bind(asset.kind)
            .bind(&asset.storage_key)
            .bind(asset.byte_size)
            .bind(&asset.mime_type)
            .bind(asset.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_assets(&self, job_id: &str) -> Result<Vec<DbAsset>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM assets WHERE job_id = ? ORDER BY kind")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(asset_from_row).collect())
    }

    pub async fn list_all_assets(&self) -> Result<Vec<DbAsset>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM assets")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(asset_from_row).collect())
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    pub async fn insert_webhook(&self, webhook: &DbWebhook) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (webhook_id, owner_id, url, secret, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&webhook.webhook_id)
        .bind(&webhook.owner_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(webhook.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false when the webhook does not exist or belongs to another
    /// owner.
    pub async fn delete_webhook(
        &self,
        webhook_id: &str,
        owner_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhooks WHERE webhook_id = ? AND owner_id = ?")
            .bind(webhook_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_webhooks_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<DbWebhook>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE owner_id = ? ORDER BY created_at")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(webhook_from_row).collect())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw).unwrap().with_timezone(&Utc)
}

fn parse_optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(parse_timestamp)
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> DbUploadSession {
    DbUploadSession {
        upload_id: row.get("upload_id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        total_size: row.get("total_size"),
        mime_type: row.get("mime_type"),
        chunk_size: row.get("chunk_size"),
        storage_key: row.get("storage_key"),
        content_sha256: row.get("content_sha256"),
        state: row.get("state"),
        created_at: parse_timestamp(row.get("created_at")),
        expires_at: parse_timestamp(row.get("expires_at")),
    }
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> DbUploadChunk {
    DbUploadChunk {
        session_id: row.get("session_id"),
        chunk_index: row.get("chunk_index"),
        byte_size: row.get("byte_size"),
        sha256: row.get("sha256"),
        storage_key: row.get("storage_key"),
        created_at: parse_timestamp(row.get("created_at")),
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> DbJob {
    DbJob {
        job_id: row.get("job_id"),
        owner_id: row.get("owner_id"),
        upload_id: row.get("upload_id"),
        total_size: row.get("total_size"),
        total_duration_sec: row.get("total_duration_sec"),
        language: row.get("language"),
        detected_language: row.get("detected_language"),
        enable_diarization: row.get("enable_diarization"),
        current_stage: row.get("current_stage"),
        state: row.get("state"),
        progress: row.get("progress"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        storage_paths: serde_json::from_str(&row.get::<String, _>("storage_paths"))
            .unwrap_or_default(),
        stage_durations: serde_json::from_str(&row.get::<String, _>("stage_durations"))
            .unwrap_or_default(),
        word_count: row.get("word_count"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        failed_stage: row.get("failed_stage"),
        cancel_requested: row.get("cancel_requested"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: parse_optional_timestamp(row.get("lease_expires_at")),
        created_at: parse_timestamp(row.get("created_at")),
        updated_at: parse_timestamp(row.get("updated_at")),
        completed_at: parse_optional_timestamp(row.get("completed_at")),
    }
}

fn asset_from_row(row: &sqlx::sqlite::SqliteRow) -> DbAsset {
    DbAsset {
        asset_id: row.get("asset_id"),
        job_id: row.get("job_id"),
        kind: row.get("kind"),
        storage_key: row.get("storage_key"),
        byte_size: row.get("byte_size"),
        mime_type: row.get("mime_type"),
        created_at: parse_timestamp(row.get("created_at")),
    }
}

fn webhook_from_row(row: &sqlx::sqlite::SqliteRow) -> DbWebhook {
    DbWebhook {
        webhook_id: row.get("webhook_id"),
        owner_id: row.get("owner_id"),
        url: row.get("url"),
        secret: row.get("secret"),
        created_at: parse_timestamp(row.get("created_at")),
    }
}
