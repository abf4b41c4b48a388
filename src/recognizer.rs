// Recognizer Client
//
// Thin client over an external speech-to-text service. The transport knows
// how to make one request; the retrying wrapper owns backoff policy. Neither
// knows anything about jobs: concurrency and pacing belong to the stage
// runner.

pub mod mock;

use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::models::SubSegment;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer rate limit exceeded")]
    RateLimited,
    #[error("recognizer request timed out")]
    Timeout,
    #[error("transient recognizer error: {0}")]
    Transport(String),
    #[error("permanent recognizer error ({status}): {message}")]
    Permanent { status: u16, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecognizerError {
    /// Transient failures are worth a backoff-and-retry; permanent ones are
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecognizerError::RateLimited
                | RecognizerError::Timeout
                | RecognizerError::Transport(_)
                | RecognizerError::Io(_)
        )
    }
}

/// What the recognizer returned for one audio window.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub language: Option<String>,
    pub sub_segments: Vec<SubSegment>,
}

/// One recognition request. `language = None` asks the service to detect.
#[async_trait::async_trait]
pub trait RecognizerTransport: Send + Sync {
    async fn recognize(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Recognition, RecognizerError>;
}

/// Whisper-compatible HTTP transport (OpenAI audio/transcriptions shape).
pub struct WhisperTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl WhisperTransport {
    pub fn new(url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            url: url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

/// verbose_json response shape (only the fields we read)
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    start: f64,
    end: f64,
    text: String,
}

#[async_trait::async_trait]
impl RecognizerTransport for WhisperTransport {
    async fn recognize(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Recognition, RecognizerError> {
        let audio = tokio::fs::read(audio_path).await?;
        let filename = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment.wav".to_string());

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name(filename)
                    .mime_str("audio/wav")
                    .map_err(|e| RecognizerError::Transport(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0.2");

        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RecognizerError::Timeout
                } else {
                    RecognizerError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RecognizerError::RateLimited);
        }
        if status.is_server_error() {
            return Err(RecognizerError::Transport(format!(
                "server error {status}"
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RecognizerError::Permanent {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| RecognizerError::Transport(format!("unreadable response: {e}")))?;

        Ok(Recognition {
            text: parsed.text,
            language: parsed.language,
            sub_segments: parsed
                .segments
                .into_iter()
                .map(|s| SubSegment {
                    start_sec: s.start,
                    end_sec: s.end,
                    text: s.text,
                })
                .collect(),
        })
    }
}

/// Backoff schedule for transient recognizer failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before the retry following attempt `attempt` (0-based):
    /// base, 2·base, 4·base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt)
    }
}

/// Transport wrapper that absorbs rate limits and transient errors by
/// sleeping, and only surfaces failure once retries exhaust.
pub struct RetryingRecognizer<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: RecognizerTransport> RetryingRecognizer<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait::async_trait]
impl<T: RecognizerTransport> RecognizerTransport for RetryingRecognizer<T> {
    async fn recognize(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Recognition, RecognizerError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.recognize(audio_path, language).await {
                Ok(recognition) => return Ok(recognition),
                Err(err) if err.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    // Small jitter keeps concurrent workers from thundering.
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recognizer retry"
                    );
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{ScriptedOutcome, ScriptedTransport};
    use super::*;

    #[test]
    fn backoff_schedule_doubles() {
        let policy = RetryPolicy::new(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedOutcome::RateLimited);
        transport.push(ScriptedOutcome::RateLimited);
        transport.push(ScriptedOutcome::ok("finally", Some("en")));

        let recognizer = RetryingRecognizer::new(
            transport.clone(),
            RetryPolicy::new(Duration::from_millis(1), 3),
        );

        let temp = tempfile::NamedTempFile::new().unwrap();
        let result = recognizer
            .recognize(temp.path(), Some("en"))
            .await
            .unwrap();
        assert_eq!(result.text, "finally");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.push(ScriptedOutcome::RateLimited);
        }

        let recognizer = RetryingRecognizer::new(
            transport.clone(),
            RetryPolicy::new(Duration::from_millis(1), 3),
        );

        let temp = tempfile::NamedTempFile::new().unwrap();
        let err = recognizer.recognize(temp.path(), None).await.unwrap_err();
        assert!(matches!(err, RecognizerError::RateLimited));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedOutcome::Permanent {
            status: 400,
            message: "unsupported language".to_string(),
        });

        let recognizer = RetryingRecognizer::new(
            transport.clone(),
            RetryPolicy::new(Duration::from_millis(1), 3),
        );

        let temp = tempfile::NamedTempFile::new().unwrap();
        let err = recognizer.recognize(temp.path(), None).await.unwrap_err();
        assert!(matches!(err, RecognizerError::Permanent { status: 400, .. }));
        assert_eq!(transport.call_count(), 1);
    }
}
