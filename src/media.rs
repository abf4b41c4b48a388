// Media toolchain seam
//
// Probing, normalization, and window extraction shell out to ffprobe/ffmpeg
// in production. The trait exists so the pipeline can run end to end in
// tests without the binaries installed.

pub mod mock;

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr: String,
    },
    #[error("expected output file missing: {0}")]
    OutputMissing(String),
    #[error("unreadable probe output: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream-level facts about a media object.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

/// What the prober learned about a blob.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_sec: f64,
    pub container_format: String,
    pub audio_streams: Vec<AudioStreamInfo>,
}

/// Media operations the pipeline stages depend on.
#[async_trait::async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Extract duration, container, and stream info.
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError>;

    /// Normalize to canonical PCM signed 16-bit, mono, 16 kHz. Volume is
    /// left unchanged.
    async fn transcode_to_pcm16k(&self, src: &Path, dst: &Path) -> Result<(), MediaError>;

    /// Cut `[start_sec, start_sec + duration_sec)` out of a normalized file.
    async fn extract_window(
        &self,
        src: &Path,
        start_sec: f64,
        duration_sec: f64,
        dst: &Path,
    ) -> Result<(), MediaError>;
}

/// Production implementation over the ffmpeg/ffprobe binaries.
pub struct FfmpegProcessor {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegProcessor {
    pub fn new(ffmpeg_path: &str, ffprobe_path: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_string(),
            ffprobe_path: ffprobe_path.to_string(),
        }
    }

    async fn run_ffmpeg(&self, args: &[&str]) -> Result<(), MediaError> {
        debug!(args = ?args, "running ffmpeg");
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| MediaError::Spawn {
                tool: "ffmpeg".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(MediaError::ToolFailed {
                tool: "ffmpeg".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

// ffprobe -print_format json output shapes (only the fields we read)

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[async_trait::async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| MediaError::Spawn {
                tool: "ffprobe".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(MediaError::ToolFailed {
                tool: "ffprobe".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| MediaError::Parse(e.to_string()))?;

        let format = parsed.format.unwrap_or(ProbeFormat {
            format_name: None,
            duration: None,
        });
        let duration_sec = format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        let audio_streams = parsed
            .streams
            .into_iter()
            .filter(|s| s.codec_type.as_deref() == Some("audio"))
            .map(|s| AudioStreamInfo {
                codec: s.codec_name.unwrap_or_else(|| "unknown".to_string()),
                sample_rate: s.sample_rate.and_then(|r| r.parse().ok()),
                channels: s.channels,
            })
            .collect();

        Ok(MediaInfo {
            duration_sec,
            container_format: format.format_name.unwrap_or_else(|| "unknown".to_string()),
            audio_streams,
        })
    }

    async fn transcode_to_pcm16k(&self, src: &Path, dst: &Path) -> Result<(), MediaError> {
        let src = src.to_string_lossy().into_owned();
        let dst_str = dst.to_string_lossy().into_owned();
        self.run_ffmpeg(&[
            "-i", &src, "-ar", "16000", "-ac", "1", "-acodec", "pcm_s16le", "-vn", "-y", &dst_str,
        ])
        .await?;

        if tokio::fs::metadata(dst).await.is_err() {
            return Err(MediaError::OutputMissing(dst_str));
        }
        Ok(())
    }

    async fn extract_window(
        &self,
        src: &Path,
        start_sec: f64,
        duration_sec: f64,
        dst: &Path,
    ) -> Result<(), MediaError> {
        let src = src.to_string_lossy().into_owned();
        let dst_str = dst.to_string_lossy().into_owned();
        let start = format!("{start_sec:.3}");
        let duration = format!("{duration_sec:.3}");
        self.run_ffmpeg(&["-ss", &start, "-t", &duration, "-i", &src, "-y", &dst_str])
            .await?;

        if tokio::fs::metadata(dst).await.is_err() {
            return Err(MediaError::OutputMissing(dst_str));
        }
        Ok(())
    }
}
