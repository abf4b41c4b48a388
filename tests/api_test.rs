// HTTP surface: the axum router over the in-memory stack. Exercises the
// wire contract end to end, including the error-code mapping.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use scribed::server::{create_router, ApiState};
use scribed::webhook::WebhookNotifier;
use support::TestHarness;

fn router_for(harness: &TestHarness) -> Router {
    create_router(ApiState {
        db: harness.db.clone(),
        uploads: harness.uploads.clone(),
        blobs: harness.blobs.clone(),
        notifier: WebhookNotifier::disabled(),
        config: harness.config.clone(),
    })
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(value.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn send_bytes(router: &Router, uri: &str, data: &[u8]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(data.to_vec()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn upload_process_and_download_over_http() {
    support::tracing_init();
    let harness = TestHarness::new(120.0).await;
    let router = router_for(&harness);

    // Create a session.
    let (status, body) = send(
        &router,
        "POST",
        "/api/uploads/sessions",
        Some(json!({"filename": "talk.wav", "total_size": 1500, "mime_type": "audio/wav"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let upload_id = body["upload_id"].as_str().unwrap().to_string();
    assert_eq!(body["chunk_size"].as_i64().unwrap(), 1024);

    // Two chunks: 1024 + 476 bytes.
    let data: Vec<u8> = (0..1500u32).map(|i| (i % 97) as u8).collect();
    let (status, body) = send_bytes(
        &router,
        &format!("/api/uploads/{upload_id}/chunks/0"),
        &data[..1024],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], json!([0]));
    assert_eq!(body["total_chunks"].as_u64().unwrap(), 2);

    // Session status shows the gap for resuming clients.
    let (status, body) = send(&router, "GET", &format!("/api/uploads/{upload_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], json!([0]));
    assert_eq!(body["state"], "open");

    // Finalize without all chunks conflicts.
    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/uploads/{upload_id}/finalize"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INCOMPLETE");

    let (status, _) = send_bytes(
        &router,
        &format!("/api/uploads/{upload_id}/chunks/1"),
        &data[1024..],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/uploads/{upload_id}/finalize"),
        Some(json!({"language": "en"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    // Job is visible immediately.
    let (status, body) = send(&router, "GET", &format!("/api/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "created");
    assert_eq!(body["current_stage"], "created");

    // Run the pipeline, then poll again.
    harness.run_to_terminal(&job_id, 3).await;
    let (status, body) = send(&router, "GET", &format!("/api/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "complete");
    assert_eq!(body["current_stage"], "complete");
    assert_eq!(body["detected_language"], "en");
    assert!(body.get("error").is_none());

    // Listing includes the job for its owner (no X-Owner-Id header was sent,
    // so the session and job belong to the anonymous owner).
    let (status, body) = send(&router, "GET", "/api/jobs?owner=anonymous", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    let (_, other) = send(&router, "GET", "/api/jobs?owner=someone-else", None).await;
    assert!(other.as_array().unwrap().is_empty());

    // Assets carry presigned URLs for all four kinds.
    let (status, body) = send(&router, "GET", &format!("/api/jobs/{job_id}/assets"), None).await;
    assert_eq!(status, StatusCode::OK);
    let assets = body.as_array().unwrap();
    assert_eq!(assets.len(), 4);
    for asset in assets {
        assert!(asset["download_url"].as_str().unwrap().starts_with("memory://"));
        assert!(asset["byte_size"].as_i64().unwrap() > 0);
    }

    // Cancelling a finished job conflicts.
    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/jobs/{job_id}/cancel"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_TERMINAL");
}

#[tokio::test]
async fn error_codes_map_to_http_statuses() {
    support::tracing_init();
    let harness = TestHarness::new(60.0).await;
    let router = router_for(&harness);

    // Non-audio MIME.
    let (status, body) = send(
        &router,
        "POST",
        "/api/uploads/sessions",
        Some(json!({"filename": "doc.pdf", "total_size": 100, "mime_type": "application/pdf"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["code"], "UNSUPPORTED_TYPE");

    // Over the ceiling.
    let (status, body) = send(
        &router,
        "POST",
        "/api/uploads/sessions",
        Some(json!({
            "filename": "huge.wav",
            "total_size": 128 * 1024 * 1024,
            "mime_type": "audio/wav"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], "TOO_LARGE");

    // Conflicting chunk re-PUT.
    let (_, body) = send(
        &router,
        "POST",
        "/api/uploads/sessions",
        Some(json!({"filename": "a.wav", "total_size": 64, "mime_type": "audio/wav"})),
    )
    .await;
    let upload_id = body["upload_id"].as_str().unwrap().to_string();

    let (status, _) = send_bytes(&router, &format!("/api/uploads/{upload_id}/chunks/0"), &[1u8; 64]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
        send_bytes(&router, &format!("/api/uploads/{upload_id}/chunks/0"), &[2u8; 64]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CHUNK_CONFLICT");

    // Wrong chunk length.
    let (status, body) =
        send_bytes(&router, &format!("/api/uploads/{upload_id}/chunks/0"), &[1u8; 10]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    // Unknown job.
    let (status, body) = send(&router, "GET", "/api/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn webhook_registration_lifecycle() {
    support::tracing_init();
    let harness = TestHarness::new(60.0).await;
    let router = router_for(&harness);

    let (status, body) = send(
        &router,
        "POST",
        "/api/webhooks",
        Some(json!({"url": "https://example.com/hook", "secret": "s3cret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let webhook_id = body["webhook_id"].as_str().unwrap().to_string();

    // Rejects non-http(s) endpoints.
    let (status, _) = send(
        &router,
        "POST",
        "/api/webhooks",
        Some(json!({"url": "ftp://example.com", "secret": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "DELETE", &format!("/api/webhooks/{webhook_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Deleting again is a 404.
    let (status, _) = send(&router, "DELETE", &format!("/api/webhooks/{webhook_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_service_status() {
    support::tracing_init();
    let harness = TestHarness::new(60.0).await;
    let router = router_for(&harness);

    let (status, body) = send(&router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"]["database"], "healthy");
}
