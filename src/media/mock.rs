// Synthetic media toolchain for tests: no ffmpeg required.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{AudioStreamInfo, MediaError, MediaInfo, MediaProcessor};

/// Fakes probing and cutting. Durations are configured per "fingerprint"
/// (the first bytes of the file) or fall back to a default, so the same
/// blob probes the same everywhere.
#[derive(Clone)]
pub struct FakeMediaProcessor {
    default_duration_sec: f64,
    durations: Arc<Mutex<HashMap<Vec<u8>, f64>>>,
    fail_transcode: Arc<Mutex<bool>>,
}

impl FakeMediaProcessor {
    pub fn new(default_duration_sec: f64) -> Self {
        Self {
            default_duration_sec,
            durations: Arc::new(Mutex::new(HashMap::new())),
            fail_transcode: Arc::new(Mutex::new(false)),
        }
    }

    /// Register a duration for files starting with `prefix`.
    pub fn set_duration_for(&self, prefix: &[u8], duration_sec: f64) {
        self.durations
            .lock()
            .unwrap()
            .insert(prefix.to_vec(), duration_sec);
    }

    pub fn set_fail_transcode(&self, fail: bool) {
        *self.fail_transcode.lock().unwrap() = fail;
    }

    async fn duration_of(&self, path: &Path) -> Result<f64, MediaError> {
        let data = tokio::fs::read(path).await?;
        let durations = self.durations.lock().unwrap();
        for (prefix, duration) in durations.iter() {
            if data.starts_with(prefix) {
                return Ok(*duration);
            }
        }
        Ok(self.default_duration_sec)
    }
}

#[async_trait::async_trait]
impl MediaProcessor for FakeMediaProcessor {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        Ok(MediaInfo {
            duration_sec: self.duration_of(path).await?,
            container_format: "wav".to_string(),
            audio_streams: vec![AudioStreamInfo {
                codec: "pcm_s16le".to_string(),
                sample_rate: Some(16_000),
                channels: Some(1),
            }],
        })
    }

    async fn transcode_to_pcm16k(&self, src: &Path, dst: &Path) -> Result<(), MediaError> {
        if *self.fail_transcode.lock().unwrap() {
            return Err(MediaError::ToolFailed {
                tool: "ffmpeg".to_string(),
                status: 1,
                stderr: "injected transcode failure".to_string(),
            });
        }
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn extract_window(
        &self,
        src: &Path,
        start_sec: f64,
        duration_sec: f64,
        dst: &Path,
    ) -> Result<(), MediaError> {
        // Deterministic stand-in for the cut bytes: enough for the pipeline
        // to store, hash, and feed to a mock recognizer.
        let data = tokio::fs::read(src).await?;
        let window = format!(
            "window start={start_sec:.3} dur={duration_sec:.3} src_len={}\n",
            data.len()
        );
        tokio::fs::write(dst, window.as_bytes()).await?;
        Ok(())
    }
}
