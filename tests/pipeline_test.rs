// End-to-end pipeline: chunked upload through every stage to the four
// assets, over the in-memory store stack, fake media toolchain, and
// scripted recognizer.

mod support;

use scribed::models::{AssetKind, JobState, Stage};
use support::TestHarness;

/// 12 minutes of audio → 12 segments, all stages, four assets.
#[tokio::test]
async fn happy_path_twelve_minute_upload() {
    support::tracing_init();
    let harness = TestHarness::new(720.0).await;

    // Three chunks: 1024, 1024, 452 bytes.
    let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let job_id = harness.upload_job(&data, None).await;

    // The assembled blob matches the original bytes exactly.
    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    let original_key = job.storage_paths.get("original").unwrap();
    assert_eq!(harness.store.contents(original_key).unwrap(), data);
    assert_eq!(job.state, JobState::Created);
    assert_eq!(job.current_stage, Stage::Created);

    harness.run_to_terminal(&job_id, 3).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.current_stage, Stage::Complete);
    assert_eq!(job.progress, 1.0);
    assert!(job.completed_at.is_some());
    assert_eq!(job.total_duration_sec, Some(720.0));
    // AUTO detection populated a language.
    assert_eq!(job.detected_language.as_deref(), Some("en"));
    assert!(job.word_count.unwrap() > 0);

    // Every processing stage recorded a duration.
    for stage in [
        Stage::Validating,
        Stage::Transcoding,
        Stage::Segmenting,
        Stage::DetectingLanguage,
        Stage::Transcribing,
        Stage::Merging,
        Stage::Diarizing,
        Stage::GeneratingOutputs,
    ] {
        assert!(
            job.stage_durations.contains_key(stage.as_str()),
            "missing duration for {}",
            stage.as_str()
        );
    }

    // Twelve fragments, strictly ordered, non-decreasing start times.
    let checkpoint = harness
        .db
        .get_checkpoint(&job_id, Stage::Transcribing)
        .await
        .unwrap()
        .unwrap();
    let parsed = scribed::models::StageCheckpoint::from_json(&checkpoint).unwrap();
    let scribed::models::StageCheckpoint::Transcribing { fragments } = parsed else {
        panic!("wrong checkpoint shape");
    };
    assert_eq!(fragments.len(), 12);
    for (i, fragment) in fragments.iter().enumerate() {
        assert_eq!(fragment.index, i);
        assert!(fragment.start_time_sec < fragment.end_time_sec);
        assert!(!fragment.is_failed());
    }
    for pair in fragments.windows(2) {
        assert!(pair[0].start_time_sec <= pair[1].start_time_sec);
    }

    // All four asset kinds exist.
    let assets = harness.db.list_assets(&job_id).await.unwrap();
    let kinds: Vec<AssetKind> = assets.iter().map(|a| a.kind).collect();
    for kind in AssetKind::ALL {
        assert!(kinds.contains(&kind), "missing asset kind {kind:?}");
    }

    // TXT is non-empty UTF-8.
    let txt = harness.asset_bytes(&job_id, AssetKind::Txt).await;
    assert!(!txt.is_empty());
    let txt = String::from_utf8(txt).unwrap();
    assert!(txt.contains("spoken:"));

    // SRT has 12 cues numbered 1..12, CRLF separated.
    let srt = String::from_utf8(harness.asset_bytes(&job_id, AssetKind::Srt).await).unwrap();
    for cue in 1..=12 {
        assert!(srt.contains(&format!("{cue}\r\n")), "missing cue {cue}");
    }
    assert!(!srt.contains(&format!("{}\r\n", 13)));
    assert!(srt.contains("00:00:00,000 --> 00:01:00,000"));

    // VTT header is exactly WEBVTT followed by a blank line.
    let vtt = String::from_utf8(harness.asset_bytes(&job_id, AssetKind::Vtt).await).unwrap();
    assert!(vtt.starts_with("WEBVTT\n\n"));
    assert!(vtt.contains("00:00:00.000 --> 00:01:00.000"));

    // The JSON document regenerates SRT and VTT byte-for-byte.
    let json = harness.asset_bytes(&job_id, AssetKind::Json).await;
    let document: scribed::output::TranscriptDocument = serde_json::from_slice(&json).unwrap();
    assert_eq!(scribed::output::render_srt(&document.segments), srt);
    assert_eq!(scribed::output::render_vtt(&document.segments), vtt);
    assert_eq!(document.metadata.word_count as i64, job.word_count.unwrap());

    harness.shutdown();
}

/// A requested language skips detection entirely.
#[tokio::test]
async fn requested_language_bypasses_detection() {
    support::tracing_init();
    let harness = TestHarness::new(90.0).await;

    let data = vec![42u8; 600];
    let job_id = harness.upload_job(&data, Some("de")).await;
    harness.run_to_terminal(&job_id, 3).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.detected_language.as_deref(), Some("de"));

    // Every recognizer call carried the requested language; none used AUTO.
    let languages = harness.transport.languages_seen();
    assert!(!languages.is_empty());
    assert!(languages.iter().all(|l| l.as_deref() == Some("de")));
}

/// Short audio: a single segment, a single cue.
#[tokio::test]
async fn single_segment_audio_produces_one_cue() {
    support::tracing_init();
    let harness = TestHarness::new(42.0).await;

    let data = vec![7u8; 100];
    let job_id = harness.upload_job(&data, Some("en")).await;
    harness.run_to_terminal(&job_id, 3).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Complete);

    let srt = String::from_utf8(harness.asset_bytes(&job_id, AssetKind::Srt).await).unwrap();
    assert!(srt.starts_with("1\r\n00:00:00,000 --> 00:01:00,000\r\n"));
    // Exactly one cue block.
    assert_eq!(srt.matches("-->").count(), 1);
}

/// Duration over the cap fails validation with TOO_LONG and never retries.
#[tokio::test]
async fn over_long_audio_fails_validation() {
    support::tracing_init();
    let max_sec = 8.0 * 3600.0;
    let harness = TestHarness::new(max_sec + 1.0).await;

    let data = vec![1u8; 100];
    let job_id = harness.upload_job(&data, Some("en")).await;
    harness.run_to_terminal(&job_id, 3).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_code.as_deref(), Some("TOO_LONG"));
    assert_eq!(job.failed_stage.as_deref(), Some("validating"));
    // Validation errors skip the retry budget.
    assert_eq!(job.retry_count, 0);

    // No assets for a failed job.
    assert!(harness.db.list_assets(&job_id).await.unwrap().is_empty());
}

/// Duration exactly at the cap passes validation.
#[tokio::test]
async fn duration_exactly_at_cap_passes() {
    support::tracing_init();
    let harness = TestHarness::new(8.0 * 3600.0).await;

    let data = vec![1u8; 100];
    let job_id = harness.upload_job(&data, Some("en")).await;

    let runner = harness.runner();
    runner.run_available().await.unwrap();

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    // The job moved past validation (8h of audio means 480 segments; it will
    // finish eventually, but past-validating is the assertion here).
    assert_ne!(job.error_code.as_deref(), Some("TOO_LONG"));
    assert_ne!(job.state, JobState::Failed);
}

/// A transcode failure burns the retry budget and then fails the job.
#[tokio::test]
async fn transcode_failure_exhausts_retries() {
    support::tracing_init();
    let harness = TestHarness::new(120.0).await;
    harness.media.set_fail_transcode(true);

    let data = vec![9u8; 300];
    let job_id = harness.upload_job(&data, Some("en")).await;
    harness.run_to_terminal(&job_id, 10).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_code.as_deref(), Some("TRANSCODE_FAILED"));
    assert_eq!(job.failed_stage.as_deref(), Some("transcoding"));
    assert_eq!(job.retry_count, job.max_retries);
}
