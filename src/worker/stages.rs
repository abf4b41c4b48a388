// Stage handlers
//
// Each handler implements one stage's contract against the WorkerContext.
// Handlers are re-entrant: a retry re-reads the prior stage's checkpoint and
// reuses any work already durable (segment blobs, recognized fragments).

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::blob_store::keys;
use crate::database::DbJob;
use crate::error::PipelineError;
use crate::media::MediaError;
use crate::models::{SegmentDescriptor, Stage, StageCheckpoint, TranscriptFragment};
use crate::output::{overall_confidence, TranscriptDocument, TranscriptMetadata};
use crate::segment;

use super::{diarize, merge, storage_error, ScratchDir, WorkerContext};

pub async fn run_stage(
    ctx: &WorkerContext,
    job: &DbJob,
    stage: Stage,
) -> Result<(), PipelineError> {
    match stage {
        // No work: CREATED advances straight into validation and COMPLETE is
        // terminal.
        Stage::Created | Stage::Complete => Ok(()),
        Stage::Validating => validate(ctx, job).await,
        Stage::Transcoding => transcode(ctx, job).await,
        Stage::Segmenting => segment_audio(ctx, job).await,
        Stage::DetectingLanguage => detect_language(ctx, job).await,
        Stage::Transcribing => transcribe(ctx, job).await,
        Stage::Merging => merge_transcripts(ctx, job).await,
        Stage::Diarizing => diarize_transcript(ctx, job).await,
        Stage::GeneratingOutputs => generate_outputs(ctx, job).await,
    }
}

// ============================================================================
// VALIDATING
// ============================================================================

async fn validate(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let original_key = require_path(job, "original")?;

    let stat = match ctx.blobs.stat(&original_key).await {
        Ok(stat) => stat,
        Err(crate::blob_store::BlobStoreError::NotFound(_)) => {
            return Err(PipelineError::validation(
                "SOURCE_MISSING",
                format!("uploaded blob absent: {original_key}"),
            ))
        }
        Err(e) => return Err(storage_error(e)),
    };
    if stat.size as i64 != job.total_size {
        return Err(PipelineError::validation(
            "SIZE_MISMATCH",
            format!("expected {} bytes, found {}", job.total_size, stat.size),
        ));
    }

    progress(ctx, job, Stage::Validating, 0.3).await?;

    let scratch = ScratchDir::create(&job.job_id)?;
    let source = ctx.materialize(&original_key, &scratch, "source").await?;

    progress(ctx, job, Stage::Validating, 0.6).await?;

    let media_info = ctx.media.probe(&source).await.map_err(probe_error)?;

    if media_info.audio_streams.len() != 1 {
        return Err(PipelineError::validation(
            "NO_AUDIO",
            format!(
                "expected exactly one audio stream, found {}",
                media_info.audio_streams.len()
            ),
        ));
    }

    let duration = media_info.duration_sec;
    if duration <= 0.0 {
        return Err(PipelineError::validation(
            "INVALID_DURATION",
            format!("unusable duration {duration}"),
        ));
    }
    // Exactly the cap passes; one second more does not.
    if duration > ctx.config.max_duration_sec() {
        return Err(PipelineError::validation(
            "TOO_LONG",
            format!(
                "{duration:.1}s exceeds the {:.0}h cap",
                ctx.config.max_duration_hours
            ),
        ));
    }

    ctx.db.set_total_duration(&job.job_id, duration).await?;
    progress(ctx, job, Stage::Validating, 1.0).await?;

    info!(job_id = %job.job_id, duration_sec = duration, "validation complete");
    Ok(())
}

fn probe_error(e: MediaError) -> PipelineError {
    match e {
        MediaError::Spawn { .. } => PipelineError::transient("TOOL_UNAVAILABLE", e.to_string()),
        MediaError::ToolFailed { .. } | MediaError::Parse(_) | MediaError::OutputMissing(_) => {
            PipelineError::validation("INVALID_MEDIA", e.to_string())
        }
        MediaError::Io(_) => PipelineError::transient("SCRATCH_IO", e.to_string()),
    }
}

// ============================================================================
// TRANSCODING
// ============================================================================

async fn transcode(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let normalized_key = keys::normalized(&job.job_id);

    // The normalized blob is its own checkpoint: a replay that finds it
    // simply records the path again.
    if blob_present(ctx, &normalized_key).await? {
        ctx.db
            .set_storage_path(&job.job_id, "normalized", &normalized_key)
            .await?;
        progress(ctx, job, Stage::Transcoding, 1.0).await?;
        return Ok(());
    }

    let original_key = require_path(job, "original")?;
    let scratch = ScratchDir::create(&job.job_id)?;
    let source = ctx.materialize(&original_key, &scratch, "source").await?;
    let output = scratch.file("normalized.wav");

    progress(ctx, job, Stage::Transcoding, 0.1).await?;

    // The external process exposes no reliable progress, so a ticker walks
    // the bar by elapsed time while it runs.
    let ticker = spawn_progress_ticker(ctx, &job.job_id, Stage::Transcoding);
    let result = ctx.media.transcode_to_pcm16k(&source, &output).await;
    ticker.abort();

    result.map_err(|e| match e {
        MediaError::ToolFailed { .. } => PipelineError::transient("TRANSCODE_FAILED", e.to_string()),
        MediaError::OutputMissing(_) => PipelineError::transient("TRANSCODE_EMPTY", e.to_string()),
        MediaError::Spawn { .. } => PipelineError::transient("TOOL_UNAVAILABLE", e.to_string()),
        MediaError::Parse(_) | MediaError::Io(_) => {
            PipelineError::transient("TRANSCODE_FAILED", e.to_string())
        }
    })?;

    let meta = tokio::fs::metadata(&output)
        .await
        .map_err(|e| PipelineError::transient("TRANSCODE_EMPTY", e.to_string()))?;
    if meta.len() == 0 {
        return Err(PipelineError::transient(
            "TRANSCODE_EMPTY",
            "normalized output is empty",
        ));
    }

    progress(ctx, job, Stage::Transcoding, 0.9).await?;

    let mut file = tokio::fs::File::open(&output)
        .await
        .map_err(|e| PipelineError::transient("SCRATCH_IO", e.to_string()))?;
    ctx.blobs
        .put_stream(&normalized_key, &mut file)
        .await
        .map_err(storage_error)?;

    ctx.db
        .set_storage_path(&job.job_id, "normalized", &normalized_key)
        .await?;
    progress(ctx, job, Stage::Transcoding, 1.0).await?;

    info!(job_id = %job.job_id, "transcode complete");
    Ok(())
}

fn spawn_progress_ticker(
    ctx: &WorkerContext,
    job_id: &str,
    stage: Stage,
) -> tokio::task::JoinHandle<()> {
    let db = ctx.db.clone();
    let job_id = job_id.to_string();
    tokio::spawn(async move {
        let mut step = 0.2f64;
        while step < 0.9 {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let _ = db.update_stage_progress(&job_id, stage, step).await;
            step += 0.1;
        }
    })
}

// ============================================================================
// SEGMENTING
// ============================================================================

async fn segment_audio(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let duration = job.total_duration_sec.ok_or_else(|| {
        PipelineError::internal("MISSING_DURATION", "validate stage did not record a duration")
    })?;

    let plan = segment::plan(
        duration,
        ctx.config.segment_duration_sec,
        ctx.config.segment_overlap_sec,
    );
    if plan.is_empty() {
        return Err(PipelineError::validation(
            "NO_SEGMENTS",
            format!("{duration:.2}s of audio yields no usable windows"),
        ));
    }

    let normalized_key = require_path(job, "normalized")?;
    let scratch = ScratchDir::create(&job.job_id)?;
    let source = ctx
        .materialize(&normalized_key, &scratch, "normalized.wav")
        .await?;

    let total = plan.len();
    let mut descriptors = Vec::with_capacity(total);

    for window in &plan {
        ctx.check_cancelled(&job.job_id).await?;

        let key = keys::segment(&job.job_id, window.index);
        // Replay reuses segment blobs keyed by (job_id, index); the plan is
        // deterministic so the bytes would be identical anyway.
        if !blob_present(ctx, &key).await? {
            let cut = scratch.file(&format!("segment_{:05}.wav", window.index));
            ctx.media
                .extract_window(&source, window.start_sec, window.duration_sec(), &cut)
                .await
                .map_err(|e| PipelineError::transient("SEGMENT_FAILED", e.to_string()))?;

            let mut file = tokio::fs::File::open(&cut)
                .await
                .map_err(|e| PipelineError::transient("SCRATCH_IO", e.to_string()))?;
            ctx.blobs
                .put_stream(&key, &mut file)
                .await
                .map_err(storage_error)?;
        }

        descriptors.push(SegmentDescriptor {
            index: window.index,
            start_time_sec: window.start_sec,
            end_time_sec: window.end_sec,
            storage_key: key,
            original_start_sec: window.original_start_sec,
            original_end_sec: window.original_end_sec,
        });

        let done = descriptors.len() as f64;
        progress(ctx, job, Stage::Segmenting, 0.1 + 0.8 * done / total as f64).await?;
    }

    let checkpoint = StageCheckpoint::Segmenting {
        segments: descriptors,
    };
    ctx.db
        .set_checkpoint(&job.job_id, Stage::Segmenting, &checkpoint.to_json()?)
        .await?;
    progress(ctx, job, Stage::Segmenting, 1.0).await?;

    info!(job_id = %job.job_id, segments = total, "segmentation complete");
    Ok(())
}

// ============================================================================
// DETECTING_LANGUAGE
// ============================================================================

async fn detect_language(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    // A requested language short-circuits detection.
    if let Some(language) = &job.language {
        ctx.db.set_detected_language(&job.job_id, language).await?;
        progress(ctx, job, Stage::DetectingLanguage, 1.0).await?;
        return Ok(());
    }

    let segments = read_segments(ctx, job).await?;
    progress(ctx, job, Stage::DetectingLanguage, 0.3).await?;

    // Detection must never fail the job; any trouble falls back to the
    // configured default with a warning.
    let mut language = ctx.config.default_language.clone();
    if let Some(first) = segments.first() {
        let scratch = ScratchDir::create(&job.job_id)?;
        match ctx.materialize(&first.storage_key, &scratch, "probe.wav").await {
            Ok(path) => match ctx.recognizer.recognize(&path, None).await {
                Ok(recognition) => {
                    if let Some(detected) = recognition.language {
                        language = detected;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "language detection failed, using default");
                }
            },
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "language probe unavailable, using default");
            }
        }
    }

    ctx.db.set_detected_language(&job.job_id, &language).await?;
    progress(ctx, job, Stage::DetectingLanguage, 1.0).await?;

    info!(job_id = %job.job_id, language = %language, "language detection complete");
    Ok(())
}

// ============================================================================
// TRANSCRIBING
// ============================================================================

async fn transcribe(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let segments = read_segments(ctx, job).await?;
    let total = segments.len();

    // Resume from a partial run: fragments are idempotent on
    // (job_id, segment_index).
    let mut fragments: BTreeMap<usize, TranscriptFragment> =
        match read_checkpoint(ctx, &job.job_id, Stage::Transcribing).await? {
            Some(StageCheckpoint::Transcribing { fragments }) => fragments
                .into_iter()
                // A stage retry re-attempts segments that failed last time;
                // only successful fragments are durable.
                .filter(|f| !f.is_failed())
                .map(|f| (f.index, f))
                .collect(),
            Some(_) => {
                return Err(PipelineError::internal(
                    "CHECKPOINT_CORRUPT",
                    "transcribe checkpoint has the wrong shape",
                ))
            }
            None => BTreeMap::new(),
        };

    let language = job
        .detected_language
        .clone()
        .unwrap_or_else(|| ctx.config.default_language.clone());
    let scratch = ScratchDir::create(&job.job_id)?;

    for segment in &segments {
        if fragments.contains_key(&segment.index) {
            continue;
        }
        ctx.check_cancelled(&job.job_id).await?;

        let path = ctx
            .materialize(
                &segment.storage_key,
                &scratch,
                &format!("segment_{:05}.wav", segment.index),
            )
            .await?;

        let fragment = match ctx.recognizer.recognize(&path, Some(&language)).await {
            Ok(recognition) => TranscriptFragment {
                index: segment.index,
                start_time_sec: segment.original_start_sec,
                end_time_sec: segment.original_end_sec,
                text: recognition.text,
                confidence: 1.0,
                sub_segments: recognition.sub_segments,
            },
            Err(e) => {
                // One bad segment must not fail the job.
                warn!(
                    job_id = %job.job_id,
                    segment = segment.index,
                    error = %e,
                    "segment recognition exhausted retries"
                );
                TranscriptFragment::failed(segment)
            }
        };
        let succeeded = !fragment.is_failed();
        fragments.insert(segment.index, fragment);

        // Checkpoint after every segment so a crash loses at most one call.
        let checkpoint = StageCheckpoint::Transcribing {
            fragments: fragments.values().cloned().collect(),
        };
        ctx.db
            .set_checkpoint(&job.job_id, Stage::Transcribing, &checkpoint.to_json()?)
            .await?;

        let done = fragments.len() as f64;
        progress(ctx, job, Stage::Transcribing, 0.1 + 0.8 * done / total as f64).await?;

        if succeeded && fragments.len() < total {
            // Pacing between successful requests keeps external rate
            // pressure down.
            tokio::time::sleep(std::time::Duration::from_millis(
                ctx.config.recognizer_pacing_ms,
            ))
            .await;
        }
    }

    let all: Vec<TranscriptFragment> = fragments.values().cloned().collect();
    if all.iter().all(|f| f.is_failed()) {
        return Err(PipelineError::permanent(
            "TRANSCRIPTION_FAILED",
            "every segment recognition failed",
        ));
    }

    let checkpoint = StageCheckpoint::Transcribing { fragments: all };
    ctx.db
        .set_checkpoint(&job.job_id, Stage::Transcribing, &checkpoint.to_json()?)
        .await?;
    progress(ctx, job, Stage::Transcribing, 1.0).await?;

    info!(job_id = %job.job_id, segments = total, "transcription complete");
    Ok(())
}

// ============================================================================
// MERGING
// ============================================================================

async fn merge_transcripts(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let fragments = read_fragments(ctx, job).await?;
    progress(ctx, job, Stage::Merging, 0.4).await?;

    let result = merge::merge_fragments(&fragments);

    let checkpoint = StageCheckpoint::Merging {
        final_transcript: result.final_transcript,
        word_count: result.word_count,
        failed_segments: result.failed_segments,
    };
    ctx.db
        .set_checkpoint(&job.job_id, Stage::Merging, &checkpoint.to_json()?)
        .await?;
    ctx.db
        .set_word_count(&job.job_id, result.word_count as i64)
        .await?;
    progress(ctx, job, Stage::Merging, 1.0).await?;

    info!(job_id = %job.job_id, words = result.word_count, "merge complete");
    Ok(())
}

// ============================================================================
// DIARIZING
// ============================================================================

async fn diarize_transcript(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let (final_transcript, _) = read_merge(ctx, job).await?;
    let fragments = read_fragments(ctx, job).await?;
    progress(ctx, job, Stage::Diarizing, 0.3).await?;

    let (attributions, diarized_transcript) = if job.enable_diarization {
        // Diarizer failure degrades to the trivial attribution; the merged
        // transcript is never lost.
        let attributions = match ctx.diarizer.attribute(&fragments).await {
            Ok(attributions) => attributions,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "diarizer failed, using single speaker");
                diarize::trivial_attribution(&fragments)
            }
        };
        let rendered = diarize::render_diarized(&fragments, &attributions, &final_transcript);
        (attributions, rendered)
    } else {
        // Fixed pipeline shape: the stage still records an attribution, but
        // the transcript stays raw.
        (
            diarize::trivial_attribution(&fragments),
            final_transcript.clone(),
        )
    };

    let checkpoint = StageCheckpoint::Diarizing {
        diarized_transcript,
        speaker_count: diarize::speaker_count(&attributions).max(1),
        attributions,
    };
    ctx.db
        .set_checkpoint(&job.job_id, Stage::Diarizing, &checkpoint.to_json()?)
        .await?;
    progress(ctx, job, Stage::Diarizing, 1.0).await?;

    Ok(())
}

// ============================================================================
// GENERATING_OUTPUTS
// ============================================================================

async fn generate_outputs(ctx: &WorkerContext, job: &DbJob) -> Result<(), PipelineError> {
    let (final_transcript, word_count) = read_merge(ctx, job).await?;
    let fragments = read_fragments(ctx, job).await?;

    let diarized_transcript = match read_checkpoint(ctx, &job.job_id, Stage::Diarizing).await? {
        Some(StageCheckpoint::Diarizing {
            diarized_transcript,
            ..
        }) => diarized_transcript,
        _ => final_transcript.clone(),
    };

    ctx.check_cancelled(&job.job_id).await?;
    progress(ctx, job, Stage::GeneratingOutputs, 0.2).await?;

    let document = TranscriptDocument {
        transcript: final_transcript,
        diarized_transcript,
        metadata: TranscriptMetadata {
            language: job.detected_language.clone(),
            duration_sec: job.total_duration_sec.unwrap_or(0.0),
            word_count,
            confidence: overall_confidence(&fragments),
        },
        segments: fragments,
    };

    let assets = ctx.assembler.publish(&job.job_id, &document).await?;

    let checkpoint = StageCheckpoint::GeneratingOutputs {
        asset_kinds: assets.iter().map(|a| a.kind).collect(),
    };
    ctx.db
        .set_checkpoint(&job.job_id, Stage::GeneratingOutputs, &checkpoint.to_json()?)
        .await?;
    progress(ctx, job, Stage::GeneratingOutputs, 1.0).await?;

    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

fn require_path(job: &DbJob, name: &str) -> Result<String, PipelineError> {
    job.storage_paths.get(name).cloned().ok_or_else(|| {
        PipelineError::internal(
            "MISSING_PRECONDITION",
            format!("storage path '{name}' was not recorded by a prior stage"),
        )
    })
}

async fn blob_present(ctx: &WorkerContext, key: &str) -> Result<bool, PipelineError> {
    match ctx.blobs.stat(key).await {
        Ok(stat) => Ok(stat.size > 0),
        Err(crate::blob_store::BlobStoreError::NotFound(_)) => Ok(false),
        Err(e) => Err(storage_error(e)),
    }
}

async fn progress(
    ctx: &WorkerContext,
    job: &DbJob,
    stage: Stage,
    fraction: f64,
) -> Result<(), PipelineError> {
    ctx.db
        .update_stage_progress(&job.job_id, stage, fraction)
        .await?;
    Ok(())
}

async fn read_checkpoint(
    ctx: &WorkerContext,
    job_id: &str,
    stage: Stage,
) -> Result<Option<StageCheckpoint>, PipelineError> {
    match ctx.db.get_checkpoint(job_id, stage).await? {
        Some(raw) => Ok(Some(StageCheckpoint::from_json(&raw)?)),
        None => Ok(None),
    }
}

async fn read_segments(
    ctx: &WorkerContext,
    job: &DbJob,
) -> Result<Vec<SegmentDescriptor>, PipelineError> {
    match read_checkpoint(ctx, &job.job_id, Stage::Segmenting).await? {
        Some(StageCheckpoint::Segmenting { segments }) if !segments.is_empty() => Ok(segments),
        _ => Err(PipelineError::internal(
            "MISSING_PRECONDITION",
            "segment checkpoint absent or empty",
        )),
    }
}

async fn read_fragments(
    ctx: &WorkerContext,
    job: &DbJob,
) -> Result<Vec<TranscriptFragment>, PipelineError> {
    match read_checkpoint(ctx, &job.job_id, Stage::Transcribing).await? {
        Some(StageCheckpoint::Transcribing { fragments }) if !fragments.is_empty() => {
            Ok(fragments)
        }
        _ => Err(PipelineError::internal(
            "MISSING_PRECONDITION",
            "transcript checkpoint absent or empty",
        )),
    }
}

async fn read_merge(
    ctx: &WorkerContext,
    job: &DbJob,
) -> Result<(String, usize), PipelineError> {
    match read_checkpoint(ctx, &job.job_id, Stage::Merging).await? {
        Some(StageCheckpoint::Merging {
            final_transcript,
            word_count,
            ..
        }) => Ok((final_transcript, word_count)),
        _ => Err(PipelineError::internal(
            "MISSING_PRECONDITION",
            "merge checkpoint absent",
        )),
    }
}
