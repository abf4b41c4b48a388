// Reconciler
//
// Periodic sweep with two duties: expire upload sessions past their TTL and
// remove orphaned blobs. A blob is orphaned when the session or job it
// belongs to is gone or dead. Rows are always written before blobs, so a
// managed key with no row is garbage, never an in-flight write.
//
// Retention rules: blobs of COMPLETE and FAILED jobs stay (assets remain
// readable; the original upload is kept for manual reprocessing). Blobs of
// CANCELLED jobs and dead sessions are removed.

use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::blob_store::{keys, BlobStoreManager};
use crate::config::Config;
use crate::database::Database;
use crate::models::{JobState, SessionState};
use crate::upload::UploadSessionManager;

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub sessions_expired: usize,
    pub blobs_deleted: usize,
}

pub struct Reconciler {
    db: Database,
    blobs: BlobStoreManager,
    uploads: UploadSessionManager,
    interval_secs: u64,
}

impl Reconciler {
    pub fn new(
        db: Database,
        blobs: BlobStoreManager,
        uploads: UploadSessionManager,
        config: &Config,
    ) -> Self {
        Self {
            db,
            blobs,
            uploads,
            interval_secs: config.reconcile_interval_secs.max(1),
        }
    }

    /// Sweep on an interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.sweep().await {
                Ok(report) => {
                    if report != SweepReport::default() {
                        info!(
                            sessions_expired = report.sessions_expired,
                            blobs_deleted = report.blobs_deleted,
                            "reconciler sweep finished"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "reconciler sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, sqlx::Error> {
        let mut report = SweepReport::default();

        // Pass 1: expire open sessions past their TTL.
        for session in self.db.list_expired_sessions(chrono::Utc::now()).await? {
            if let Err(e) = self.uploads.expire(&session.upload_id).await {
                warn!(upload_id = %session.upload_id, error = %e, "session expiry failed");
                continue;
            }
            report.sessions_expired += 1;
        }

        // Pass 2: orphaned upload blobs.
        let mut session_live: HashMap<String, bool> = HashMap::new();
        for session in self.db.list_sessions().await? {
            let live = matches!(session.state, SessionState::Open | SessionState::Complete);
            session_live.insert(session.upload_id, live);
        }

        match self.blobs.list(keys::UPLOADS_PREFIX).await {
            Ok(upload_keys) => {
                for key in upload_keys {
                    let Some(upload_id) = id_component(&key, keys::UPLOADS_PREFIX) else {
                        continue;
                    };
                    if !session_live.get(upload_id).copied().unwrap_or(false) {
                        self.delete_counted(&key, &mut report).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "upload blob listing failed"),
        }

        // Pass 3: orphaned job blobs.
        let mut job_live: HashMap<String, bool> = HashMap::new();
        for job in self.db.list_all_jobs().await? {
            job_live.insert(job.job_id, job.state != JobState::Cancelled);
        }

        match self.blobs.list(keys::JOBS_PREFIX).await {
            Ok(job_keys) => {
                for key in job_keys {
                    let Some(job_id) = id_component(&key, keys::JOBS_PREFIX) else {
                        continue;
                    };
                    if !job_live.get(job_id).copied().unwrap_or(false) {
                        self.delete_counted(&key, &mut report).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "job blob listing failed"),
        }

        Ok(report)
    }

    async fn delete_counted(&self, key: &str, report: &mut SweepReport) {
        match self.blobs.delete(key).await {
            Ok(()) => report.blobs_deleted += 1,
            Err(e) => warn!(key, error = %e, "orphan blob delete failed"),
        }
    }
}

/// `uploads/<id>/...` → `<id>`
fn id_component<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.split('/').next().filter(|s| !s.is_empty())
}
