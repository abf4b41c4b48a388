// Stage Runner
//
// Drives jobs through the stage sequence:
//
//   CREATED → VALIDATING → TRANSCODING → SEGMENTING → DETECTING_LANGUAGE
//           → TRANSCRIBING → MERGING → DIARIZING → GENERATING_OUTPUTS → COMPLETE
//
// Coordination is lease + CAS, no global lock: `acquire_runnable` stamps a
// lease, a heartbeat task extends it while a handler runs, and every stage
// advance is a compare-and-swap on `current_stage`. A worker that crashes
// simply lets its leases expire; the next worker resumes from the last
// checkpoint. Stage handlers are functions of (job, context) with no
// process-wide mutable state.

pub mod diarize;
pub mod merge;
pub mod stages;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob_store::{BlobStoreError, BlobStoreManager};
use crate::config::Config;
use crate::database::{Database, DbJob};
use crate::error::{ErrorKind, PipelineError};
use crate::media::MediaProcessor;
use crate::models::Stage;
use crate::output::OutputAssembler;
use crate::recognizer::RecognizerTransport;
use crate::webhook::WebhookNotifier;
use diarize::Diarizer;

/// Poll delay when no runnable jobs exist.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Back-off after a store error in the acquire loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);
/// Floor for every stage budget.
const DEFAULT_STAGE_BUDGET: Duration = Duration::from_secs(300);
const VALIDATE_BUDGET: Duration = Duration::from_secs(60);

/// Everything a stage handler needs. Handlers own no state of their own;
/// all side effects flow through these handles.
pub struct WorkerContext {
    pub db: Database,
    pub blobs: BlobStoreManager,
    pub media: Arc<dyn MediaProcessor>,
    pub recognizer: Arc<dyn RecognizerTransport>,
    pub diarizer: Arc<dyn Diarizer>,
    pub assembler: OutputAssembler,
    pub notifier: WebhookNotifier,
    pub config: Arc<Config>,
}

impl WorkerContext {
    /// Cancellation checkpoint: handlers call this between logical units of
    /// work (per segment, per asset).
    pub async fn check_cancelled(&self, job_id: &str) -> Result<(), PipelineError> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::internal("JOB_MISSING", format!("job {job_id} vanished")))?;
        if job.cancel_requested {
            return Err(PipelineError::cancelled());
        }
        Ok(())
    }

    /// Stream a blob to a scratch file so external tools can read it.
    pub async fn materialize(
        &self,
        key: &str,
        scratch: &ScratchDir,
        filename: &str,
    ) -> Result<PathBuf, PipelineError> {
        let path = scratch.file(filename);
        let mut reader = self.blobs.open_read(key).await.map_err(storage_error)?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| PipelineError::transient("SCRATCH_IO", e.to_string()))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| PipelineError::transient("SCRATCH_IO", e.to_string()))?;
        Ok(path)
    }

    /// Emit a webhook event reflecting the job's current row.
    pub async fn notify(&self, job_id: &str) {
        match self.db.get_job(job_id).await {
            Ok(Some(job)) => self.notifier.notify_job(&job),
            Ok(None) => {}
            Err(e) => warn!(job_id, error = %e, "notify lookup failed"),
        }
    }
}

/// Map a blob-store failure into the pipeline taxonomy. Missing blobs are a
/// broken precondition from a prior stage; everything else is transient.
pub(crate) fn storage_error(e: BlobStoreError) -> PipelineError {
    match e {
        BlobStoreError::NotFound(key) => {
            PipelineError::internal("BLOB_MISSING", format!("expected blob absent: {key}"))
        }
        other => PipelineError::transient("STORAGE_ERROR", other.to_string()),
    }
}

/// Per-job scratch directory, removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(job_id: &str) -> Result<Self, PipelineError> {
        let path = std::env::temp_dir().join(format!("scribed-{job_id}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)
            .map_err(|e| PipelineError::transient("SCRATCH_IO", e.to_string()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// One worker process's runner loop.
pub struct StageRunner {
    ctx: Arc<WorkerContext>,
    worker_id: String,
    shutdown: watch::Receiver<bool>,
}

impl StageRunner {
    pub fn new(ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Main loop: claim runnable jobs, drive each to a stopping point, and
    /// idle-poll in between. Returns once shutdown is signalled; running
    /// handlers finish their current stage first and leases are left to
    /// expire for anything unfinished.
    pub async fn run(&self) {
        info!(worker_id = %self.worker_id, "stage runner started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_available().await {
                Ok(0) => {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "acquire loop error");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "stage runner stopped");
    }

    /// Claim up to the concurrency limit and drive the batch. Returns the
    /// number of jobs driven.
    pub async fn run_available(&self) -> Result<usize, PipelineError> {
        let jobs = self
            .ctx
            .db
            .acquire_runnable(
                self.ctx.config.worker_concurrency,
                &self.worker_id,
                self.ctx.config.lease_seconds,
            )
            .await?;

        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }

        let mut handles = Vec::with_capacity(count);
        for job in jobs {
            let runner = self.clone_parts();
            handles.push(tokio::spawn(async move {
                runner.drive_job(job).await;
            }));
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(worker_id = %self.worker_id, error = %e, "job task panicked");
            }
        }

        Ok(count)
    }

    fn clone_parts(&self) -> JobDriver {
        JobDriver {
            ctx: self.ctx.clone(),
            worker_id: self.worker_id.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Drives a single claimed job until it reaches a stopping point: terminal
/// state, stage failure, a stolen CAS, or shutdown.
struct JobDriver {
    ctx: Arc<WorkerContext>,
    worker_id: String,
    shutdown: watch::Receiver<bool>,
}

impl JobDriver {
    async fn drive_job(&self, mut job: DbJob) {
        let heartbeat = self.spawn_heartbeat(&job.job_id);

        loop {
            if *self.shutdown.borrow() {
                // Leave the lease to expire; another worker resumes from the
                // last checkpoint.
                break;
            }
            if job.state.is_terminal() || job.current_stage == Stage::Complete {
                break;
            }
            if job.cancel_requested {
                self.finish_cancelled(&job.job_id).await;
                break;
            }

            let stage = job.current_stage;
            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(
                self.stage_budget(&job, stage),
                stages::run_stage(&self.ctx, &job, stage),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::transient(
                    "STAGE_TIMEOUT",
                    format!("stage {} exceeded its budget", stage.as_str()),
                )),
            };

            match outcome {
                Ok(()) => {
                    if stage != Stage::Created {
                        let elapsed = started.elapsed().as_secs_f64();
                        if let Err(e) = self
                            .ctx
                            .db
                            .record_stage_duration(&job.job_id, stage, elapsed)
                            .await
                        {
                            warn!(job_id = %job.job_id, error = %e, "stage duration write failed");
                        }
                    }

                    if !self.advance(&job, stage).await {
                        // Stolen: a lease expiry let another worker take over.
                        warn!(job_id = %job.job_id, stage = stage.as_str(), "stage CAS lost, dropping job");
                        break;
                    }
                    self.ctx.notify(&job.job_id).await;

                    match self.ctx.db.get_job(&job.job_id).await {
                        Ok(Some(fresh)) => job = fresh,
                        _ => break,
                    }
                }
                Err(err) => {
                    self.handle_failure(&job, stage, err).await;
                    break;
                }
            }
        }

        heartbeat.abort();
    }

    /// CAS the job to the next stage; the final stage lands on COMPLETE.
    async fn advance(&self, job: &DbJob, stage: Stage) -> bool {
        if stage == Stage::GeneratingOutputs {
            match self.ctx.db.mark_complete(&job.job_id).await {
                Ok(advanced) => {
                    if advanced {
                        info!(job_id = %job.job_id, "job complete");
                    }
                    advanced
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "completion write failed");
                    false
                }
            }
        } else {
            let Some(next) = stage.next() else { return false };
            match self.ctx.db.update_stage(&job.job_id, stage, next, 0.0).await {
                Ok(advanced) => {
                    if advanced {
                        info!(
                            job_id = %job.job_id,
                            from = stage.as_str(),
                            to = next.as_str(),
                            "stage advanced"
                        );
                    }
                    advanced
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "stage CAS failed");
                    false
                }
            }
        }
    }

    /// The single place that maps error kinds to retry-or-fail.
    async fn handle_failure(&self, job: &DbJob, stage: Stage, err: PipelineError) {
        match err.kind {
            ErrorKind::Cancelled => {
                self.finish_cancelled(&job.job_id).await;
            }
            ErrorKind::Validation | ErrorKind::Internal => {
                error!(job_id = %job.job_id, stage = stage.as_str(), error = %err, "job failed");
                if let Err(e) = self
                    .ctx
                    .db
                    .set_error(&job.job_id, &err.code, &err.message, stage)
                    .await
                {
                    error!(job_id = %job.job_id, error = %e, "error write failed");
                }
                self.ctx.notify(&job.job_id).await;
            }
            ErrorKind::TransientExternal | ErrorKind::PermanentExternal => {
                match self.ctx.db.increment_retry(&job.job_id).await {
                    Ok(count) if count >= job.max_retries => {
                        error!(
                            job_id = %job.job_id,
                            stage = stage.as_str(),
                            retries = count,
                            error = %err,
                            "retries exhausted"
                        );
                        if let Err(e) = self
                            .ctx
                            .db
                            .set_error(&job.job_id, &err.code, &err.message, stage)
                            .await
                        {
                            error!(job_id = %job.job_id, error = %e, "error write failed");
                        }
                        self.ctx.notify(&job.job_id).await;
                    }
                    Ok(count) => {
                        warn!(
                            job_id = %job.job_id,
                            stage = stage.as_str(),
                            attempt = count,
                            max = job.max_retries,
                            error = %err,
                            "stage will be retried from its checkpoint"
                        );
                        // Release the lease so the retry does not wait out
                        // the full lease window.
                        let _ = self
                            .ctx
                            .db
                            .release_lease(&job.job_id, &self.worker_id)
                            .await;
                    }
                    Err(e) => {
                        error!(job_id = %job.job_id, error = %e, "retry accounting failed");
                    }
                }
            }
        }
    }

    async fn finish_cancelled(&self, job_id: &str) {
        info!(job_id, "job cancelled");
        if let Err(e) = self.ctx.db.mark_cancelled(job_id).await {
            error!(job_id, error = %e, "cancellation write failed");
        }
        self.ctx.notify(job_id).await;
    }

    fn spawn_heartbeat(&self, job_id: &str) -> tokio::task::JoinHandle<()> {
        let db = self.ctx.db.clone();
        let job_id = job_id.to_string();
        let worker_id = self.worker_id.clone();
        let interval = Duration::from_secs(self.ctx.config.heartbeat_seconds.max(1));
        let lease_seconds = self.ctx.config.lease_seconds;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match db.extend_lease(&job_id, &worker_id, lease_seconds).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "lease lost; heartbeat stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "heartbeat failed");
                    }
                }
            }
        })
    }

    /// Hard per-stage budgets: a stage past its budget is aborted and the
    /// failure classified retryable.
    fn stage_budget(&self, job: &DbJob, stage: Stage) -> Duration {
        let duration = job.total_duration_sec.unwrap_or(0.0).max(0.0);
        match stage {
            Stage::Validating => VALIDATE_BUDGET,
            Stage::Transcoding => DEFAULT_STAGE_BUDGET.max(Duration::from_secs_f64(duration * 2.0)),
            Stage::Transcribing => {
                let windows = if self.ctx.config.segment_duration_sec > 0.0 {
                    (duration / self.ctx.config.segment_duration_sec).ceil()
                } else {
                    0.0
                };
                let pacing =
                    windows * self.ctx.config.recognizer_pacing_ms as f64 / 1000.0;
                DEFAULT_STAGE_BUDGET.max(Duration::from_secs_f64(duration * 1.5 + pacing))
            }
            _ => DEFAULT_STAGE_BUDGET,
        }
    }
}
