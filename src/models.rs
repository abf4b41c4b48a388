use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// String constants for SQL DEFAULT clauses (keep in sync with as_str())
pub(crate) const JOB_STATE_CREATED: &str = "created";
pub(crate) const STAGE_CREATED: &str = "created";

/// Pipeline stages in execution order.
///
/// `current_stage` on a job names the stage being (or about to be) executed.
/// Successful completion of a stage CAS-advances to the next one; the final
/// advance lands on `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Validating,
    Transcoding,
    Segmenting,
    DetectingLanguage,
    Transcribing,
    Merging,
    Diarizing,
    GeneratingOutputs,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => STAGE_CREATED,
            Stage::Validating => "validating",
            Stage::Transcoding => "transcoding",
            Stage::Segmenting => "segmenting",
            Stage::DetectingLanguage => "detecting_language",
            Stage::Transcribing => "transcribing",
            Stage::Merging => "merging",
            Stage::Diarizing => "diarizing",
            Stage::GeneratingOutputs => "generating_outputs",
            Stage::Complete => "complete",
        }
    }

    /// The stage that follows this one, or `None` past the end of the graph.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Created => Some(Stage::Validating),
            Stage::Validating => Some(Stage::Transcoding),
            Stage::Transcoding => Some(Stage::Segmenting),
            Stage::Segmenting => Some(Stage::DetectingLanguage),
            Stage::DetectingLanguage => Some(Stage::Transcribing),
            Stage::Transcribing => Some(Stage::Merging),
            Stage::Merging => Some(Stage::Diarizing),
            Stage::Diarizing => Some(Stage::GeneratingOutputs),
            Stage::GeneratingOutputs => Some(Stage::Complete),
            Stage::Complete => None,
        }
    }
}

/// Job lifecycle state. Terminal states never mutate except audit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => JOB_STATE_CREATED,
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Cancelled)
    }
}

/// Upload session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Complete,
    Aborted,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Complete => "complete",
            SessionState::Aborted => "aborted",
            SessionState::Expired => "expired",
        }
    }
}

/// Output asset kinds. For a complete job each kind appears exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Txt,
    Json,
    Srt,
    Vtt,
}

impl AssetKind {
    pub const ALL: [AssetKind; 4] = [AssetKind::Txt, AssetKind::Json, AssetKind::Srt, AssetKind::Vtt];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Txt => "txt",
            AssetKind::Json => "json",
            AssetKind::Srt => "srt",
            AssetKind::Vtt => "vtt",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AssetKind::Txt => "text/plain",
            AssetKind::Json => "application/json",
            AssetKind::Srt => "application/x-subrip",
            AssetKind::Vtt => "text/vtt",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

/// Placeholder text recorded for a segment whose recognition exhausted
/// retries. Such fragments carry confidence 0 and are skipped when merging.
pub const FAILED_FRAGMENT_TEXT: &str = "<FAILED>";

/// One windowed slice of normalized audio, the unit of recognition.
///
/// `start/end` are the cut points in the normalized file (overlap included);
/// `original_start/original_end` are the segment-center coordinates used for
/// output timing so overlap never duplicates text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub start_time_sec: f64,
    pub end_time_sec: f64,
    pub storage_key: String,
    pub original_start_sec: f64,
    pub original_end_sec: f64,
}

impl SegmentDescriptor {
    pub fn duration_sec(&self) -> f64 {
        self.end_time_sec - self.start_time_sec
    }
}

/// Recognizer-provided word/phrase timing inside a fragment, stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

/// Recognition result for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    pub index: usize,
    pub start_time_sec: f64,
    pub end_time_sec: f64,
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub sub_segments: Vec<SubSegment>,
}

impl TranscriptFragment {
    /// A fragment written in place of recognition output that exhausted retries.
    pub fn failed(segment: &SegmentDescriptor) -> Self {
        Self {
            index: segment.index,
            start_time_sec: segment.original_start_sec,
            end_time_sec: segment.original_end_sec,
            text: FAILED_FRAGMENT_TEXT.to_string(),
            confidence: 0.0,
            sub_segments: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.text == FAILED_FRAGMENT_TEXT
    }
}

/// Durable record of a stage's output, tagged per stage so a reader can
/// reject payloads written by the wrong stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageCheckpoint {
    Segmenting {
        segments: Vec<SegmentDescriptor>,
    },
    Transcribing {
        fragments: Vec<TranscriptFragment>,
    },
    Merging {
        final_transcript: String,
        word_count: usize,
        failed_segments: usize,
    },
    Diarizing {
        diarized_transcript: String,
        speaker_count: usize,
        attributions: Vec<SpeakerAttribution>,
    },
    GeneratingOutputs {
        asset_kinds: Vec<AssetKind>,
    },
}

impl StageCheckpoint {
    /// Parse a persisted checkpoint, validating on read per the store contract.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| {
            PipelineError::internal("CHECKPOINT_CORRUPT", format!("unreadable checkpoint: {e}"))
        })
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| {
            PipelineError::internal("CHECKPOINT_ENCODE", format!("unencodable checkpoint: {e}"))
        })
    }
}

/// Speaker label assigned to one fragment by the diarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerAttribution {
    pub index: usize,
    pub speaker_id: String,
}
