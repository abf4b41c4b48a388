// Webhook dispatch
//
// Observers register per-owner endpoints; every job state/stage transition
// produces an event that is signed and delivered at-least-once. Delivery
// state is process-local; receivers de-duplicate on (job_id, updated_at).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::database::{Database, DbJob};
use crate::models::{JobState, Stage};

/// Signature header carried on every delivery.
pub const SIGNATURE_HEADER: &str = "x-scribed-signature";

const DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Payload posted on every state/stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub owner_id: String,
    pub state: JobState,
    pub current_stage: Stage,
    pub progress: f64,
    pub updated_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_job(job: &DbJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            state: job.state,
            current_stage: job.current_stage,
            progress: job.progress,
            updated_at: job.updated_at,
        }
    }

    /// De-duplication key receivers can use to suppress redelivery.
    pub fn dedup_key(&self) -> (String, String) {
        (self.job_id.clone(), self.updated_at.to_rfc3339())
    }
}

/// Hex HMAC-SHA256 of the body under the endpoint's secret, formatted as
/// `sha256=<hex>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Cheap handle the server and worker use to emit events. When webhooks are
/// disabled it swallows everything.
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl WebhookNotifier {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn notify_job(&self, job: &DbJob) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(JobEvent::from_job(job));
        }
    }
}

/// Tracks already-processed events within this process.
#[derive(Default)]
pub struct DeliveryLedger {
    seen: HashSet<(String, String)>,
}

impl DeliveryLedger {
    /// True exactly once per dedup key.
    pub fn first_sighting(&mut self, event: &JobEvent) -> bool {
        self.seen.insert(event.dedup_key())
    }
}

/// Background dispatcher draining the event queue.
pub struct WebhookDispatcher {
    db: Database,
    client: reqwest::Client,
    ledger: Arc<Mutex<DeliveryLedger>>,
}

impl WebhookDispatcher {
    /// Spawn the dispatcher and return the notifier handle. With webhooks
    /// disabled no task is spawned and the notifier is inert.
    pub fn start(db: Database, enabled: bool) -> WebhookNotifier {
        if !enabled {
            return WebhookNotifier::disabled();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let dispatcher = Arc::new(WebhookDispatcher {
            db,
            client: reqwest::Client::new(),
            ledger: Arc::new(Mutex::new(DeliveryLedger::default())),
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.process(event).await;
                });
            }
        });

        WebhookNotifier { tx: Some(tx) }
    }

    async fn process(&self, event: JobEvent) {
        let fresh = self.ledger.lock().unwrap().first_sighting(&event);
        if !fresh {
            return;
        }

        let hooks = match self.db.list_webhooks_for_owner(&event.owner_id).await {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "webhook lookup failed");
                return;
            }
        };
        if hooks.is_empty() {
            return;
        }

        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "webhook payload encoding failed");
                return;
            }
        };

        for hook in hooks {
            self.deliver(&hook.url, &hook.secret, &body, &event.job_id).await;
        }
    }

    /// At-least-once delivery: retries 5xx and transport errors with
    /// exponential backoff, gives up after the attempt budget.
    async fn deliver(&self, url: &str, secret: &str, body: &[u8], job_id: &str) {
        let signature = sign_payload(secret, body);

        for attempt in 0..DELIVERY_ATTEMPTS {
            let response = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .body(body.to_vec())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(job_id, url, "webhook delivered");
                    return;
                }
                Ok(response) if response.status().is_client_error() => {
                    // The receiver rejected the payload; retrying cannot help.
                    warn!(job_id, url, status = %response.status(), "webhook rejected");
                    return;
                }
                Ok(response) => {
                    warn!(job_id, url, status = %response.status(), attempt, "webhook 5xx");
                }
                Err(e) => {
                    warn!(job_id, url, error = %e, attempt, "webhook transport error");
                }
            }

            if attempt + 1 < DELIVERY_ATTEMPTS {
                tokio::time::sleep(DELIVERY_BACKOFF_BASE * 2u32.pow(attempt)).await;
            }
        }

        warn!(job_id, url, "webhook delivery abandoned after retries");
    }
}
