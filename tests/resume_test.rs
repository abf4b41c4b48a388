// Crash-resume behavior: a second worker picking a job up mid-transcription
// resumes from the checkpoint and produces the same transcript as an
// uninterrupted run on the same input.

mod support;

use scribed::models::{AssetKind, JobState, Stage, StageCheckpoint};
use scribed::worker::stages;
use support::TestHarness;

const AUDIO_DURATION: f64 = 600.0; // 10 segments
const LANGUAGE: &str = "en";

fn test_bytes() -> Vec<u8> {
    (0..1500u32).map(|i| (i % 199) as u8).collect()
}

/// Drive one stage by hand the way the runner would: run the handler, then
/// CAS-advance. Lets the test stop a job at an exact stage boundary.
async fn step_stage(harness: &TestHarness, job_id: &str) -> Stage {
    let job = harness.db.get_job(job_id).await.unwrap().unwrap();
    let stage = job.current_stage;
    stages::run_stage(&harness.ctx, &job, stage).await.unwrap();
    let next = stage.next().unwrap();
    if next == Stage::Complete {
        assert!(harness.db.mark_complete(job_id).await.unwrap());
    } else {
        assert!(harness
            .db
            .update_stage(job_id, stage, next, 0.0)
            .await
            .unwrap());
    }
    next
}

#[tokio::test]
async fn resumed_job_matches_uninterrupted_run() {
    support::tracing_init();

    // Reference: an uninterrupted end-to-end run.
    let reference = TestHarness::new(AUDIO_DURATION).await;
    let reference_job = reference.upload_job(&test_bytes(), Some(LANGUAGE)).await;
    reference.run_to_terminal(&reference_job, 3).await;
    let reference_txt = reference.asset_bytes(&reference_job, AssetKind::Txt).await;
    let reference_srt = reference.asset_bytes(&reference_job, AssetKind::Srt).await;

    // Crashing run: drive by hand up to a finished transcription...
    let harness = TestHarness::new(AUDIO_DURATION).await;
    let job_id = harness.upload_job(&test_bytes(), Some(LANGUAGE)).await;

    let mut stage = Stage::Created;
    while stage != Stage::Transcribing {
        stage = step_stage(&harness, &job_id).await;
    }
    // Run the transcribe handler to completion once (but do not advance)...
    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    stages::run_stage(&harness.ctx, &job, Stage::Transcribing)
        .await
        .unwrap();
    let calls_for_full_pass = harness.transport.call_count();
    assert_eq!(calls_for_full_pass, 10);

    // ...then truncate the checkpoint to 4 fragments, as if the worker died
    // after its fourth per-segment checkpoint write.
    let raw = harness
        .db
        .get_checkpoint(&job_id, Stage::Transcribing)
        .await
        .unwrap()
        .unwrap();
    let StageCheckpoint::Transcribing { mut fragments } = StageCheckpoint::from_json(&raw).unwrap()
    else {
        panic!("wrong checkpoint shape");
    };
    fragments.truncate(4);
    let partial = StageCheckpoint::Transcribing { fragments };
    harness
        .db
        .set_checkpoint(&job_id, Stage::Transcribing, &partial.to_json().unwrap())
        .await
        .unwrap();

    // A fresh worker claims the job (the dead worker never held a lease
    // here) and finishes it.
    harness.run_to_terminal(&job_id, 3).await;

    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Complete);

    // Only the missing six segments were recognized again.
    assert_eq!(harness.transport.call_count(), calls_for_full_pass + 6);

    // Byte-identical outputs with the uninterrupted run.
    assert_eq!(
        harness.asset_bytes(&job_id, AssetKind::Txt).await,
        reference_txt
    );
    assert_eq!(
        harness.asset_bytes(&job_id, AssetKind::Srt).await,
        reference_srt
    );

    reference.shutdown();
    harness.shutdown();
}

/// Replaying a completed stage reuses durable work: segment blobs are keyed
/// by (job_id, index) and not re-extracted.
#[tokio::test]
async fn segment_replay_reuses_existing_blobs() {
    support::tracing_init();
    let harness = TestHarness::new(180.0).await;
    let job_id = harness.upload_job(&test_bytes(), Some(LANGUAGE)).await;

    let mut stage = Stage::Created;
    while stage != Stage::DetectingLanguage {
        stage = step_stage(&harness, &job_id).await;
    }

    let keys_after_first = harness_keys(&harness, &job_id);
    assert_eq!(keys_after_first.len(), 3);

    // Re-run the segment stage as a retry would.
    let job = harness.db.get_job(&job_id).await.unwrap().unwrap();
    stages::run_stage(&harness.ctx, &job, Stage::Segmenting)
        .await
        .unwrap();

    assert_eq!(harness_keys(&harness, &job_id), keys_after_first);

    // The checkpoint still describes the same ordered segment set.
    let raw = harness
        .db
        .get_checkpoint(&job_id, Stage::Segmenting)
        .await
        .unwrap()
        .unwrap();
    let StageCheckpoint::Segmenting { segments } = StageCheckpoint::from_json(&raw).unwrap() else {
        panic!("wrong checkpoint shape");
    };
    assert_eq!(segments.len(), 3);
    for (i, segment) in segments.iter().enumerate() {
        assert_eq!(segment.index, i);
    }
}

fn harness_keys(harness: &TestHarness, job_id: &str) -> Vec<String> {
    let prefix = format!("jobs/{job_id}/segments/");
    let mut keys = Vec::new();
    for i in 0..64 {
        let key = scribed::blob_store::keys::segment(job_id, i);
        if harness.store.contents(&key).is_some() {
            keys.push(key);
        }
    }
    assert!(keys.iter().all(|k| k.starts_with(&prefix)));
    keys
}
