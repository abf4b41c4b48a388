// Cooperative cancellation: handlers observe the flag at checkpoints and
// between per-segment iterations, the job lands in CANCELLED, and the
// reconciler cleans up whatever blobs the stages had written.

mod support;

use std::path::Path;
use std::sync::Arc;

use scribed::blob_store::keys;
use scribed::database::Database;
use scribed::models::JobState;
use scribed::recognizer::mock::ScriptedTransport;
use scribed::recognizer::{Recognition, RecognizerError, RecognizerTransport};
use scribed::reconciler::Reconciler;
use scribed::upload::UploadSessionManager;
use support::TestHarness;

/// Cancel before the worker ever touches the job: the first acquisition
/// notices the flag and finalizes CANCELLED without running a stage.
#[tokio::test]
async fn cancel_before_processing() {
    support::tracing_init();
    let harness = TestHarness::new(120.0).await;

    let data = vec![4u8; 300];
    let job_id = harness.upload_job(&data, Some("en")).await;

    assert!(harness.db.request_cancel(&job_id).await.unwrap());

    let runner = harness.runner();
    runner.run_available().await.unwrap();

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    // No stage ran, so no derived blobs and no assets.
    assert!(harness.db.list_assets(&job_id).await.unwrap().is_empty());
    assert!(harness
        .store
        .contents(&keys::normalized(&job_id))
        .is_none());
}

/// Transport that flips the job's cancel flag from inside the first
/// recognizer call, so cancellation lands mid-transcription.
struct CancelDuringRecognition {
    db: Database,
    job_id: std::sync::Mutex<Option<String>>,
    inner: ScriptedTransport,
}

#[async_trait::async_trait]
impl RecognizerTransport for CancelDuringRecognition {
    async fn recognize(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Recognition, RecognizerError> {
        let pending = self.job_id.lock().unwrap().take();
        if let Some(job_id) = pending {
            let _ = self.db.request_cancel(&job_id).await;
        }
        self.inner.recognize(audio_path, language).await
    }
}

#[tokio::test]
async fn cancel_during_transcription_stops_between_segments() {
    support::tracing_init();
    let harness = TestHarness::new(300.0).await; // 5 segments

    let data = vec![6u8; 300];
    let job_id = harness.upload_job(&data, Some("en")).await;

    // Swap in a context whose recognizer cancels the job on first use.
    let transport = CancelDuringRecognition {
        db: harness.db.clone(),
        job_id: std::sync::Mutex::new(Some(job_id.clone())),
        inner: ScriptedTransport::new(),
    };
    let ctx = Arc::new(scribed::worker::WorkerContext {
        db: harness.ctx.db.clone(),
        blobs: harness.ctx.blobs.clone(),
        media: harness.ctx.media.clone(),
        recognizer: Arc::new(transport),
        diarizer: Arc::new(scribed::worker::diarize::SingleSpeakerDiarizer),
        assembler: scribed::output::OutputAssembler::new(
            harness.ctx.blobs.clone(),
            harness.ctx.db.clone(),
        ),
        notifier: scribed::webhook::WebhookNotifier::disabled(),
        config: harness.config.clone(),
    });

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let runner = scribed::worker::StageRunner::new(ctx, rx);
    runner.run_available().await.unwrap();

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    // Cancellation is not an error and consumes no retries.
    assert!(job.error_code.is_none());
    assert_eq!(job.retry_count, 0);
    // No assets were created.
    assert!(harness.db.list_assets(&job_id).await.unwrap().is_empty());

    // The reconciler removes the cancelled job's derived blobs but keeps the
    // assembled upload with its completed session.
    let reconciler = Reconciler::new(
        harness.db.clone(),
        harness.blobs.clone(),
        UploadSessionManager::new(
            harness.db.clone(),
            harness.blobs.clone(),
            harness.config.clone(),
        ),
        &harness.config,
    );
    let report = reconciler.sweep().await.unwrap();
    assert!(report.blobs_deleted > 0);
    assert!(harness.store.contents(&keys::normalized(&job_id)).is_none());

    let session_blobs = harness.store.key_count();
    // Exactly the assembled upload remains.
    assert_eq!(session_blobs, 1);
}
