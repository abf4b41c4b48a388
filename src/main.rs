use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use scribed::blob_store::BlobStoreManager;
use scribed::config::Config;
use scribed::database::Database;
use scribed::media::FfmpegProcessor;
use scribed::output::OutputAssembler;
use scribed::recognizer::{RetryPolicy, RetryingRecognizer, WhisperTransport};
use scribed::reconciler::Reconciler;
use scribed::server::{create_router, ApiState};
use scribed::upload::UploadSessionManager;
use scribed::webhook::WebhookDispatcher;
use scribed::worker::{diarize::SingleSpeakerDiarizer, StageRunner, WorkerContext};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(Config::load());
    info!(bind = %config.bind_addr, "starting scribed");

    if let Err(e) = tokio::fs::create_dir_all(&config.data_dir).await {
        error!(error = %e, "could not create data directory");
        std::process::exit(1);
    }

    let db = match Database::new(&config.database_path).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database initialization failed");
            std::process::exit(1);
        }
    };

    let blobs = match &config.s3 {
        Some(s3) => match BlobStoreManager::new_s3(s3.clone()).await {
            Ok(blobs) => {
                info!(bucket = %s3.bucket_name, "using S3 blob store");
                blobs
            }
            Err(e) => {
                error!(error = %e, "S3 blob store initialization failed");
                std::process::exit(1);
            }
        },
        None => {
            let root = config.data_dir.join("blobs");
            info!(root = %root.display(), "using filesystem blob store");
            BlobStoreManager::new_local(root)
        }
    };

    let uploads = UploadSessionManager::new(db.clone(), blobs.clone(), config.clone());
    let notifier = WebhookDispatcher::start(db.clone(), config.enable_webhooks);

    let recognizer = RetryingRecognizer::new(
        WhisperTransport::new(
            &config.recognizer_url,
            &config.recognizer_api_key,
            &config.recognizer_model,
            std::time::Duration::from_secs(config.recognizer_timeout_sec),
        ),
        RetryPolicy::new(
            std::time::Duration::from_millis(config.recognizer_retry_base_ms),
            config.recognizer_retry_max,
        ),
    );

    let worker_ctx = Arc::new(WorkerContext {
        db: db.clone(),
        blobs: blobs.clone(),
        media: Arc::new(FfmpegProcessor::new(&config.ffmpeg_path, &config.ffprobe_path)),
        recognizer: Arc::new(recognizer),
        diarizer: Arc::new(SingleSpeakerDiarizer),
        assembler: OutputAssembler::new(blobs.clone(), db.clone()),
        notifier: notifier.clone(),
        config: config.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = StageRunner::new(worker_ctx, shutdown_rx.clone());
    let runner_handle = tokio::spawn(async move { runner.run().await });

    let reconciler = Reconciler::new(db.clone(), blobs.clone(), uploads.clone(), &config);
    let reconciler_shutdown = shutdown_rx.clone();
    let reconciler_handle = tokio::spawn(async move { reconciler.run(reconciler_shutdown).await });

    let state = ApiState {
        db,
        uploads,
        blobs,
        notifier,
        config: config.clone(),
    };
    let router = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %config.bind_addr, error = %e, "could not bind");
            std::process::exit(1);
        }
    };
    info!(bind = %config.bind_addr, "API listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    // Stop the background loops; running stage handlers finish their current
    // stage, then leases are left to expire.
    let _ = shutdown_tx.send(true);
    let _ = runner_handle.await;
    let _ = reconciler_handle.await;
    info!("scribed stopped");
}
