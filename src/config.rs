use std::path::PathBuf;

/// Application configuration
///
/// Every pipeline knob has a default so a bare environment still runs.
/// In debug builds a `.env` file is honored for local development.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP listen address, e.g. "127.0.0.1:8080"
    pub bind_addr: String,
    /// SQLite database file path
    pub database_path: String,
    /// Root directory for the filesystem blob store (used when S3 is not configured)
    pub data_dir: PathBuf,
    /// S3 configuration; `None` selects the filesystem store
    pub s3: Option<S3Config>,

    /// Fixed chunk size handed to upload sessions
    pub chunk_size_bytes: u64,
    /// Upload ceiling; sessions above this are rejected with TOO_LARGE
    pub max_upload_bytes: u64,
    /// Upload sessions expire this long after creation unless completed
    pub session_ttl_hours: i64,

    /// Maximum accepted audio duration
    pub max_duration_hours: f64,
    /// Segment window length
    pub segment_duration_sec: f64,
    /// Overlap carried into the head of each window after the first
    pub segment_overlap_sec: f64,

    /// Jobs a single worker drives concurrently
    pub worker_concurrency: usize,
    /// Lease duration stamped by `acquire_runnable`
    pub lease_seconds: i64,
    /// Lease refresh interval while a handler runs
    pub heartbeat_seconds: u64,
    /// Attempts before a stage failure becomes a job failure
    pub max_job_retries: i32,

    /// Recognizer endpoint (OpenAI-compatible audio transcriptions URL)
    pub recognizer_url: String,
    /// Recognizer API key
    pub recognizer_api_key: String,
    /// Recognizer model name
    pub recognizer_model: String,
    /// Per-request timeout
    pub recognizer_timeout_sec: u64,
    /// Backoff base for rate-limited or transient recognizer failures
    pub recognizer_retry_base_ms: u64,
    /// Attempts per recognizer call
    pub recognizer_retry_max: u32,
    /// Pause between successful per-segment requests
    pub recognizer_pacing_ms: u64,
    /// Fallback when language detection fails
    pub default_language: String,

    /// ffmpeg binary
    pub ffmpeg_path: String,
    /// ffprobe binary
    pub ffprobe_path: String,

    /// Webhook delivery on/off
    pub enable_webhooks: bool,
    /// TTL for presigned asset download URLs
    pub presign_ttl_seconds: u64,
    /// Reconciler sweep interval
    pub reconcile_interval_secs: u64,
}

impl Config {
    /// Load configuration from `SCRIBED_*` environment variables.
    pub fn load() -> Self {
        #[cfg(debug_assertions)]
        if dotenvy::dotenv().is_ok() {
            tracing::info!("loaded .env file");
        }

        let data_dir = env_var("SCRIBED_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".scribed")
            });

        let s3 = match env_var("SCRIBED_S3_BUCKET") {
            Some(bucket_name) => Some(S3Config {
                bucket_name,
                region: env_var("SCRIBED_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: env_var("SCRIBED_S3_ACCESS_KEY").unwrap_or_default(),
                secret_access_key: env_var("SCRIBED_S3_SECRET_KEY").unwrap_or_default(),
                endpoint_url: env_var("SCRIBED_S3_ENDPOINT"),
            }),
            None => None,
        };

        Self {
            bind_addr: env_var("SCRIBED_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            database_path: env_var("SCRIBED_DATABASE_PATH")
                .unwrap_or_else(|| data_dir.join("scribed.db").to_string_lossy().into_owned()),
            data_dir,
            s3,
            chunk_size_bytes: env_parse("SCRIBED_CHUNK_SIZE_BYTES", 8 * 1024 * 1024),
            max_upload_bytes: env_parse("SCRIBED_MAX_UPLOAD_BYTES", 5 * 1024 * 1024 * 1024),
            session_ttl_hours: env_parse("SCRIBED_SESSION_TTL_HOURS", 24),
            max_duration_hours: env_parse("SCRIBED_MAX_DURATION_HOURS", 8.0),
            segment_duration_sec: env_parse("SCRIBED_SEGMENT_DURATION_SEC", 60.0),
            segment_overlap_sec: env_parse("SCRIBED_SEGMENT_OVERLAP_SEC", 1.0),
            worker_concurrency: env_parse("SCRIBED_WORKER_CONCURRENCY", 4),
            lease_seconds: env_parse("SCRIBED_LEASE_SECONDS", 300),
            heartbeat_seconds: env_parse("SCRIBED_HEARTBEAT_SECONDS", 30),
            max_job_retries: env_parse("SCRIBED_MAX_JOB_RETRIES", 3),
            recognizer_url: env_var("SCRIBED_RECOGNIZER_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1/audio/transcriptions".to_string()),
            recognizer_api_key: env_var("SCRIBED_RECOGNIZER_API_KEY").unwrap_or_default(),
            recognizer_model: env_var("SCRIBED_RECOGNIZER_MODEL")
                .unwrap_or_else(|| "whisper-1".to_string()),
            recognizer_timeout_sec: env_parse("SCRIBED_RECOGNIZER_TIMEOUT_SEC", 60),
            recognizer_retry_base_ms: env_parse("SCRIBED_RECOGNIZER_RETRY_BASE_MS", 5000),
            recognizer_retry_max: env_parse("SCRIBED_RECOGNIZER_RETRY_MAX", 3),
            recognizer_pacing_ms: env_parse("SCRIBED_RECOGNIZER_PACING_MS", 2000),
            default_language: env_var("SCRIBED_DEFAULT_LANGUAGE").unwrap_or_else(|| "en".to_string()),
            ffmpeg_path: env_var("SCRIBED_FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_path: env_var("SCRIBED_FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            enable_webhooks: env_parse("SCRIBED_ENABLE_WEBHOOKS", true),
            presign_ttl_seconds: env_parse("SCRIBED_PRESIGN_TTL_SECONDS", 3600),
            reconcile_interval_secs: env_parse("SCRIBED_RECONCILE_INTERVAL_SECS", 3600),
        }
    }

    /// Maximum accepted duration in seconds.
    pub fn max_duration_sec(&self) -> f64 {
        self.max_duration_hours * 3600.0
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::load()
    }
}

/// S3 configuration for the blob store
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// For MinIO/S3-compatible services
    pub endpoint_url: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}
