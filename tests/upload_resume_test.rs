// Resumable upload: a client that crashes and re-sends remaining chunks out
// of order produces the same assembled blob, byte for byte, as an orderly
// upload of the same file.

mod support;

use support::TestHarness;

#[tokio::test]
async fn out_of_order_resume_assembles_identical_blob() {
    support::tracing_init();

    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();

    // Orderly upload.
    let orderly = TestHarness::new(60.0).await;
    let session_a = orderly
        .uploads
        .create_session("tester", "input.wav", data.len() as i64, "audio/wav")
        .await
        .unwrap();
    for (index, chunk) in data.chunks(session_a.chunk_size as usize).enumerate() {
        orderly
            .uploads
            .put_chunk(&session_a.upload_id, index as u32, chunk)
            .await
            .unwrap();
    }
    let outcome_a = orderly
        .uploads
        .finalize(&session_a.upload_id, None, None, false)
        .await
        .unwrap();

    // Interrupted upload: chunk 1 lands, the client "crashes", reconnects,
    // and sends chunk 2 then chunk 0.
    let resumed = TestHarness::new(60.0).await;
    let session_b = resumed
        .uploads
        .create_session("tester", "input.wav", data.len() as i64, "audio/wav")
        .await
        .unwrap();
    let chunks: Vec<&[u8]> = data.chunks(session_b.chunk_size as usize).collect();
    assert_eq!(chunks.len(), 3);

    resumed
        .uploads
        .put_chunk(&session_b.upload_id, 1, chunks[1])
        .await
        .unwrap();
    // -- crash / reconnect --
    resumed
        .uploads
        .put_chunk(&session_b.upload_id, 2, chunks[2])
        .await
        .unwrap();
    let receipt = resumed
        .uploads
        .put_chunk(&session_b.upload_id, 0, chunks[0])
        .await
        .unwrap();
    assert_eq!(receipt.received, vec![0, 1, 2]);

    let outcome_b = resumed
        .uploads
        .finalize(&session_b.upload_id, None, None, false)
        .await
        .unwrap();

    // Same content hash and same stored bytes.
    assert_eq!(outcome_a.content_sha256, outcome_b.content_sha256);
    assert_eq!(
        orderly.store.contents(&outcome_a.storage_key).unwrap(),
        resumed.store.contents(&outcome_b.storage_key).unwrap()
    );
    assert_eq!(orderly.store.contents(&outcome_a.storage_key).unwrap(), data);
}
