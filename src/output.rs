// Output Assembler
//
// Renders the four transcript assets and publishes them as an atomic set:
// blobs first, then one transaction recording the asset rows. A partial blob
// failure deletes what was written before re-raising, so observers never see
// an incomplete kind set.
//
// Formats:
//   TXT - UTF-8, LF
//   JSON - RFC 8259, two-space indent
//   SRT - CRLF, cues numbered by 1-based fragment index, HH:MM:SS,mmm
//   VTT - LF, "WEBVTT" + blank line, HH:MM:SS.mmm

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::blob_store::{keys, BlobStoreManager};
use crate::database::{Database, DbAsset};
use crate::error::PipelineError;
use crate::models::{AssetKind, TranscriptFragment};

/// The JSON asset document. Carries everything needed to regenerate the SRT
/// and VTT assets byte-for-byte (modulo line endings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub transcript: String,
    pub diarized_transcript: String,
    pub segments: Vec<TranscriptFragment>,
    pub metadata: TranscriptMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    pub language: Option<String>,
    pub duration_sec: f64,
    pub word_count: usize,
    pub confidence: f64,
}

/// Seconds → `HH:MM:SS,mmm` (SRT).
pub fn format_srt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// Seconds → `HH:MM:SS.mmm` (WebVTT).
pub fn format_vtt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn split_timestamp(seconds: f64) -> (u64, u64, u64, u64) {
    let seconds = seconds.max(0.0);
    let total_ms = (seconds * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    (total_s / 3600, (total_s % 3600) / 60, total_s % 60, ms)
}

/// The TXT asset: the diarized-or-raw transcript verbatim.
pub fn render_txt(transcript: &str) -> String {
    transcript.to_string()
}

pub fn render_json(document: &TranscriptDocument) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(document)
        .map_err(|e| PipelineError::internal("JSON_ENCODE", format!("asset encoding failed: {e}")))
}

/// SRT cues from the non-failed fragments. Cue numbers keep the fragment's
/// 1-based index, so a failed fragment leaves a gap rather than renumbering
/// everything after it.
pub fn render_srt(fragments: &[TranscriptFragment]) -> String {
    let mut out = String::new();
    for fragment in fragments {
        if fragment.is_failed() || fragment.text.trim().is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{}\r\n{} --> {}\r\n{}\r\n\r\n",
            fragment.index + 1,
            format_srt_timestamp(fragment.start_time_sec),
            format_srt_timestamp(fragment.end_time_sec),
            fragment.text.trim()
        ));
    }
    out
}

/// WebVTT: header, blank line, then cue blocks.
pub fn render_vtt(fragments: &[TranscriptFragment]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for fragment in fragments {
        if fragment.is_failed() || fragment.text.trim().is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_vtt_timestamp(fragment.start_time_sec),
            format_vtt_timestamp(fragment.end_time_sec),
            fragment.text.trim()
        ));
    }
    out
}

/// Mean confidence over the non-failed fragments, 0 when none survived.
pub fn overall_confidence(fragments: &[TranscriptFragment]) -> f64 {
    let kept: Vec<f64> = fragments
        .iter()
        .filter(|f| !f.is_failed())
        .map(|f| f.confidence)
        .collect();
    if kept.is_empty() {
        return 0.0;
    }
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Writes the asset set for a job.
#[derive(Clone)]
pub struct OutputAssembler {
    blobs: BlobStoreManager,
    db: Database,
}

impl OutputAssembler {
    pub fn new(blobs: BlobStoreManager, db: Database) -> Self {
        Self { blobs, db }
    }

    /// Render and publish all four assets. All-or-nothing: blob failures
    /// roll back already-written blobs; the database rows land in one
    /// transaction at the end.
    pub async fn publish(
        &self,
        job_id: &str,
        document: &TranscriptDocument,
    ) -> Result<Vec<DbAsset>, PipelineError> {
        let rendered = [
            (AssetKind::Txt, render_txt(&document.diarized_transcript)),
            (AssetKind::Json, render_json(document)?),
            (AssetKind::Srt, render_srt(&document.segments)),
            (AssetKind::Vtt, render_vtt(&document.segments)),
        ];

        let mut written: Vec<DbAsset> = Vec::new();
        for (kind, content) in &rendered {
            let key = keys::asset(job_id, kind.extension());
            if let Err(e) = self.blobs.put_bytes(&key, content.as_bytes()).await {
                error!(job_id, kind = kind.as_str(), error = %e, "asset write failed, rolling back");
                for asset in &written {
                    let _ = self.blobs.delete(&asset.storage_key).await;
                }
                return Err(PipelineError::transient(
                    "ASSET_WRITE_FAILED",
                    format!("{kind:?} asset write failed: {e}"),
                ));
            }
            written.push(DbAsset::new(job_id, *kind, &key, content.len() as i64));
        }

        self.db.insert_assets_atomic(job_id, &written).await?;
        info!(job_id, count = written.len(), "assets published");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(index: usize, start: f64, end: f64, text: &str) -> TranscriptFragment {
        TranscriptFragment {
            index,
            start_time_sec: start,
            end_time_sec: end,
            text: text.to_string(),
            confidence: 1.0,
            sub_segments: Vec::new(),
        }
    }

    #[test]
    fn srt_timestamps_use_comma_millis() {
        assert_eq!(format_srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_srt_timestamp(59.5), "00:00:59,500");
        assert_eq!(format_srt_timestamp(3661.25), "01:01:01,250");
        assert_eq!(format_srt_timestamp(7.0 * 3600.0), "07:00:00,000");
    }

    #[test]
    fn vtt_timestamps_use_dot_millis() {
        assert_eq!(format_vtt_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_vtt_timestamp(3661.25), "01:01:01.250");
    }

    #[test]
    fn srt_numbers_cues_from_one_with_crlf() {
        let fragments = vec![
            fragment(0, 0.0, 60.0, "first"),
            fragment(1, 60.0, 120.0, "second"),
        ];
        let srt = render_srt(&fragments);
        assert_eq!(
            srt,
            "1\r\n00:00:00,000 --> 00:01:00,000\r\nfirst\r\n\r\n\
             2\r\n00:01:00,000 --> 00:02:00,000\r\nsecond\r\n\r\n"
        );
    }

    #[test]
    fn failed_fragments_leave_numbering_gaps() {
        let mut failed = fragment(1, 60.0, 120.0, "");
        failed.text = crate::models::FAILED_FRAGMENT_TEXT.to_string();
        failed.confidence = 0.0;
        let fragments = vec![
            fragment(0, 0.0, 60.0, "first"),
            failed,
            fragment(2, 120.0, 180.0, "third"),
        ];

        let srt = render_srt(&fragments);
        assert!(srt.contains("1\r\n"));
        assert!(!srt.contains("2\r\n00:"));
        assert!(srt.contains("3\r\n"));
    }

    #[test]
    fn vtt_header_is_exact() {
        let vtt = render_vtt(&[fragment(0, 0.0, 42.0, "only cue")]);
        assert!(vtt.starts_with("WEBVTT\n\n"));
        assert_eq!(
            vtt,
            "WEBVTT\n\n00:00:00.000 --> 00:00:42.000\nonly cue\n\n"
        );
    }

    #[test]
    fn single_cue_srt_is_valid() {
        let srt = render_srt(&[fragment(0, 0.0, 42.0, "only cue")]);
        assert_eq!(srt, "1\r\n00:00:00,000 --> 00:00:42,000\r\nonly cue\r\n\r\n");
    }

    #[test]
    fn json_round_trips_and_regenerates_subtitles() {
        let fragments = vec![
            fragment(0, 0.0, 60.0, "first"),
            fragment(1, 60.0, 120.0, "second"),
        ];
        let document = TranscriptDocument {
            transcript: "first\n\nsecond".to_string(),
            diarized_transcript: "Speaker 1: first\n\nsecond".to_string(),
            segments: fragments.clone(),
            metadata: TranscriptMetadata {
                language: Some("en".to_string()),
                duration_sec: 120.0,
                word_count: 2,
                confidence: 1.0,
            },
        };

        let json = render_json(&document).unwrap();
        // Two-space indentation per the format contract.
        assert!(json.contains("\n  \"transcript\""));

        let decoded: TranscriptDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, document);
        assert_eq!(render_srt(&decoded.segments), render_srt(&fragments));
        assert_eq!(render_vtt(&decoded.segments), render_vtt(&fragments));
    }

    #[test]
    fn confidence_averages_surviving_fragments() {
        let mut low = fragment(0, 0.0, 60.0, "a");
        low.confidence = 0.5;
        let mut failed = fragment(1, 60.0, 120.0, "");
        failed.text = crate::models::FAILED_FRAGMENT_TEXT.to_string();
        failed.confidence = 0.0;
        let high = fragment(2, 120.0, 180.0, "b");

        assert_eq!(overall_confidence(&[low, failed, high]), 0.75);
        assert_eq!(overall_confidence(&[]), 0.0);
    }

    #[tokio::test]
    async fn publish_writes_all_four_kinds() {
        use crate::blob_store::mock::MemoryBlobStore;
        use std::sync::Arc;

        let db = Database::new_in_memory().await.unwrap();
        let store = MemoryBlobStore::new();
        let blobs = BlobStoreManager::new(Arc::new(store.clone()));

        let session = crate::database::DbUploadSession::new(
            "o", "f.wav", 100, "audio/wav", 100, 24,
        );
        db.insert_session(&session).await.unwrap();
        let job = crate::database::DbJob::from_finalized_session(&session, None, false, 3);
        db.create_job(&job).await.unwrap();

        let document = TranscriptDocument {
            transcript: "hello".to_string(),
            diarized_transcript: "Speaker 1: hello".to_string(),
            segments: vec![fragment(0, 0.0, 10.0, "hello")],
            metadata: TranscriptMetadata {
                language: Some("en".to_string()),
                duration_sec: 10.0,
                word_count: 1,
                confidence: 1.0,
            },
        };

        let assembler = OutputAssembler::new(blobs, db.clone());
        let assets = assembler.publish(&job.job_id, &document).await.unwrap();
        assert_eq!(assets.len(), 4);

        let listed = db.list_assets(&job.job_id).await.unwrap();
        assert_eq!(listed.len(), 4);
        for asset in &listed {
            let stored = store.contents(&asset.storage_key).unwrap();
            assert_eq!(stored.len() as i64, asset.byte_size);
        }
    }
}
