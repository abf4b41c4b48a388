// Shared fixtures for integration tests: an in-memory store stack, fake
// media toolchain, and scripted recognizer wired into a real stage runner.

use std::sync::Arc;
use tokio::sync::watch;

use scribed::blob_store::mock::MemoryBlobStore;
use scribed::blob_store::BlobStoreManager;
use scribed::config::Config;
use scribed::database::Database;
use scribed::media::mock::FakeMediaProcessor;
use scribed::output::OutputAssembler;
use scribed::recognizer::mock::ScriptedTransport;
use scribed::recognizer::{RecognizerTransport, RetryPolicy, RetryingRecognizer};
use scribed::upload::UploadSessionManager;
use scribed::webhook::WebhookNotifier;
use scribed::worker::diarize::SingleSpeakerDiarizer;
use scribed::worker::{StageRunner, WorkerContext};

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

pub struct TestHarness {
    pub db: Database,
    pub store: MemoryBlobStore,
    pub blobs: BlobStoreManager,
    pub uploads: UploadSessionManager,
    pub media: FakeMediaProcessor,
    pub transport: ScriptedTransport,
    pub ctx: Arc<WorkerContext>,
    pub config: Arc<Config>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TestHarness {
    /// Build a harness whose fake prober reports `audio_duration_sec` for
    /// every uploaded blob. Timing knobs are scaled down so tests run in
    /// milliseconds.
    pub async fn new(audio_duration_sec: f64) -> Self {
        Self::with_transport(audio_duration_sec, ScriptedTransport::new()).await
    }

    pub async fn with_transport(audio_duration_sec: f64, transport: ScriptedTransport) -> Self {
        let mut config = Config::load();
        config.chunk_size_bytes = 1024;
        config.max_upload_bytes = 64 * 1024 * 1024;
        config.recognizer_pacing_ms = 0;
        config.recognizer_retry_base_ms = 1;
        config.worker_concurrency = 4;
        config.lease_seconds = 300;
        config.heartbeat_seconds = 1;
        let config = Arc::new(config);

        let db = Database::new_in_memory().await.unwrap();
        let store = MemoryBlobStore::new();
        let blobs = BlobStoreManager::new(Arc::new(store.clone()));
        let uploads = UploadSessionManager::new(db.clone(), blobs.clone(), config.clone());
        let media = FakeMediaProcessor::new(audio_duration_sec);

        let recognizer: Arc<dyn RecognizerTransport> = Arc::new(RetryingRecognizer::new(
            transport.clone(),
            RetryPolicy::new(
                std::time::Duration::from_millis(config.recognizer_retry_base_ms),
                config.recognizer_retry_max,
            ),
        ));

        let ctx = Arc::new(WorkerContext {
            db: db.clone(),
            blobs: blobs.clone(),
            media: Arc::new(media.clone()),
            recognizer,
            diarizer: Arc::new(SingleSpeakerDiarizer),
            assembler: OutputAssembler::new(blobs.clone(), db.clone()),
            notifier: WebhookNotifier::disabled(),
            config: config.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            db,
            store,
            blobs,
            uploads,
            media,
            transport,
            ctx,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn runner(&self) -> StageRunner {
        StageRunner::new(self.ctx.clone(), self.shutdown_rx.clone())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Upload `data` through the chunked session flow and finalize into a
    /// job. `language = None` requests AUTO detection.
    pub async fn upload_job(&self, data: &[u8], language: Option<&str>) -> String {
        let session = self
            .uploads
            .create_session("tester", "input.wav", data.len() as i64, "audio/wav")
            .await
            .unwrap();

        let chunk_size = session.chunk_size as usize;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            self.uploads
                .put_chunk(&session.upload_id, index as u32, chunk)
                .await
                .unwrap();
        }

        self.uploads
            .finalize(
                &session.upload_id,
                None,
                language.map(String::from),
                false,
            )
            .await
            .unwrap()
            .job_id
    }

    /// Run the worker until the job is terminal (or the iteration budget is
    /// spent: a retrying job needs several acquire cycles).
    pub async fn run_to_terminal(&self, job_id: &str, max_cycles: usize) {
        let runner = self.runner();
        for _ in 0..max_cycles {
            runner.run_available().await.unwrap();
            let job = self.db.get_job(job_id).await.unwrap().unwrap();
            if job.state.is_terminal() {
                return;
            }
        }
        panic!("job {job_id} did not reach a terminal state in {max_cycles} cycles");
    }

    /// The stored bytes of one of the job's assets.
    pub async fn asset_bytes(&self, job_id: &str, kind: scribed::models::AssetKind) -> Vec<u8> {
        let assets = self.db.list_assets(job_id).await.unwrap();
        let asset = assets
            .iter()
            .find(|a| a.kind == kind)
            .unwrap_or_else(|| panic!("no {kind:?} asset for {job_id}"));
        self.store.contents(&asset.storage_key).unwrap()
    }
}
