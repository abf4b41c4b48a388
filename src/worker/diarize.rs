// Speaker attribution
//
// The stage itself is fixed pipeline shape; the diarizer behind it is
// pluggable. The default implementation attributes everything to a single
// speaker. A diarizer failure degrades to that trivial attribution so the
// merged transcript is never lost.

use crate::error::PipelineError;
use crate::models::{SpeakerAttribution, TranscriptFragment};

pub const DEFAULT_SPEAKER: &str = "Speaker 1";

/// `fragments → attributions[index → speaker_id]`
#[async_trait::async_trait]
pub trait Diarizer: Send + Sync {
    async fn attribute(
        &self,
        fragments: &[TranscriptFragment],
    ) -> Result<Vec<SpeakerAttribution>, PipelineError>;
}

/// Labels every fragment as one speaker.
pub struct SingleSpeakerDiarizer;

#[async_trait::async_trait]
impl Diarizer for SingleSpeakerDiarizer {
    async fn attribute(
        &self,
        fragments: &[TranscriptFragment],
    ) -> Result<Vec<SpeakerAttribution>, PipelineError> {
        Ok(trivial_attribution(fragments))
    }
}

/// Everything attributed to `DEFAULT_SPEAKER`.
pub fn trivial_attribution(fragments: &[TranscriptFragment]) -> Vec<SpeakerAttribution> {
    fragments
        .iter()
        .map(|f| SpeakerAttribution {
            index: f.index,
            speaker_id: DEFAULT_SPEAKER.to_string(),
        })
        .collect()
}

pub fn speaker_count(attributions: &[SpeakerAttribution]) -> usize {
    let mut speakers: Vec<&str> = attributions.iter().map(|a| a.speaker_id.as_str()).collect();
    speakers.sort_unstable();
    speakers.dedup();
    speakers.len()
}

/// Render the speaker-labeled transcript.
///
/// With one speaker the label appears once at the head; with several, each
/// fragment is prefixed individually.
pub fn render_diarized(
    fragments: &[TranscriptFragment],
    attributions: &[SpeakerAttribution],
    final_transcript: &str,
) -> String {
    if final_transcript.is_empty() {
        return String::new();
    }

    match speaker_count(attributions) {
        0 | 1 => {
            let speaker = attributions
                .first()
                .map(|a| a.speaker_id.as_str())
                .unwrap_or(DEFAULT_SPEAKER);
            format!("{speaker}: {final_transcript}")
        }
        _ => {
            let mut parts = Vec::new();
            for fragment in fragments {
                if fragment.is_failed() || fragment.text.trim().is_empty() {
                    continue;
                }
                let speaker = attributions
                    .iter()
                    .find(|a| a.index == fragment.index)
                    .map(|a| a.speaker_id.as_str())
                    .unwrap_or(DEFAULT_SPEAKER);
                parts.push(format!("{speaker}: {}", fragment.text.trim()));
            }
            parts.join("\n\n")
        }
    }
}
