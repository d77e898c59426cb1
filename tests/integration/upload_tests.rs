//! Chunked and single-shot upload flows over HTTP.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::test_utils::{multipart_body, rgb_tiff_bytes, test_app};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Init Validation
// =============================================================================

#[tokio::test]
async fn test_init_rejects_unsupported_extension() {
    let app = test_app().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/datasets/upload/init?filename=image.bmp&filesize=100&total_chunks=1")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unsupported_media_type");
}

#[tokio::test]
async fn test_init_rejects_oversize_file() {
    let app = test_app().await;

    // Test config caps uploads at 64 MiB.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/datasets/upload/init?filename=big.tif&filesize=68719476736&total_chunks=8192")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_init_reports_chunk_size() {
    let app = test_app().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/datasets/upload/init?filename=map.tif&filesize=1000&total_chunks=1")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["chunk_size"], 8 * 1024 * 1024);
    assert_eq!(json["received_chunks"], 0);
    assert!(json["upload_id"].is_string());
}

// =============================================================================
// Chunked Flow
// =============================================================================

/// Upload a TIFF in three chunks, out of order with a re-send, then
/// complete: the dataset row must appear and the assembled bytes must equal
/// the client-side concatenation.
#[tokio::test]
async fn test_chunked_upload_out_of_order_with_resend() {
    let app = test_app().await;
    let tiff = rgb_tiff_bytes(300, 200);

    // Slice into three chunks.
    let cut1 = tiff.len() / 3;
    let cut2 = 2 * tiff.len() / 3;
    let chunks = [&tiff[..cut1], &tiff[cut1..cut2], &tiff[cut2..]];

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!(
            "/api/datasets/upload/init?filename=chunked.tif&filesize={}&total_chunks=3",
            tiff.len()
        ))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let upload_id = body_json(response).await["upload_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Send 2, 0, 0 (re-send), 1.
    for (index, payload) in [(2usize, chunks[2]), (0, chunks[0]), (0, chunks[0]), (1, chunks[1])] {
        let boundary = "----gigatile-test";
        let body = multipart_body(
            boundary,
            &[
                ("upload_id", None, upload_id.as_bytes()),
                ("chunk_index", None, index.to_string().as_bytes()),
                ("chunk", Some("blob"), payload),
            ],
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/datasets/upload/chunk")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!(
            "/api/datasets/upload/complete?upload_id={}&name=bigmap&category=earth",
            upload_id
        ))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["name"], "bigmap");
    assert_eq!(json["category"], "earth");
    assert_eq!(json["width"], 300);
    assert_eq!(json["height"], 200);

    // Assembled bytes equal the client-side concatenation.
    let assembled = std::fs::read(app.upload_path("chunked.tif")).unwrap();
    assert_eq!(assembled, tiff);

    // The staging directory is gone.
    let staging = app.state.config.temp_dir.join(&upload_id);
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_complete_with_missing_chunks_is_rejected() {
    let app = test_app().await;

    let info = app
        .state
        .assembler
        .init("partial.tif", 100, 4)
        .await
        .unwrap();
    app.state
        .assembler
        .append_chunk(info.upload_id, 0, b"abc")
        .await
        .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!(
            "/api/datasets/upload/complete?upload_id={}&name=partial&category=space",
            info.upload_id
        ))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // The session survives and can still be completed later.
    assert_eq!(app.state.assembler.session_count().await, 1);
}

#[tokio::test]
async fn test_cancel_upload() {
    let app = test_app().await;

    let info = app
        .state
        .assembler
        .init("doomed.tif", 100, 2)
        .await
        .unwrap();

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/datasets/upload/{}", info.upload_id))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown session afterwards.
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/datasets/upload/{}", info.upload_id))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_name_on_complete_is_conflict_and_cleans_up() {
    let app = test_app().await;
    let tiff = rgb_tiff_bytes(64, 64);

    for (filename, expect) in [("one.tif", StatusCode::CREATED), ("two.tif", StatusCode::CONFLICT)]
    {
        let info = app
            .state
            .assembler
            .init(filename, tiff.len() as u64, 1)
            .await
            .unwrap();
        app.state
            .assembler
            .append_chunk(info.upload_id, 0, &tiff)
            .await
            .unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/api/datasets/upload/complete?upload_id={}&name=same-name&category=space",
                info.upload_id
            ))
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), expect);
    }

    // The conflicting assembly was removed.
    assert!(!app.upload_path("two.tif").exists());
}

// =============================================================================
// Single-Shot Upload
// =============================================================================

#[tokio::test]
async fn test_single_shot_upload_creates_dataset() {
    let app = test_app().await;
    let owner = app.add_user("alice", "tok-alice").await;
    let tiff = rgb_tiff_bytes(300, 200);

    let boundary = "----gigatile-oneshot";
    let body = multipart_body(boundary, &[("file", Some("oneshot.tif"), &tiff)]);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/datasets/upload?name=oneshot&category=mars")
        .header("authorization", "Bearer tok-alice")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["name"], "oneshot");
    assert_eq!(json["owner_id"], owner.id);
    assert_eq!(json["processing_status"], "pending");
    // Owned uploads expire.
    assert!(json["expires_at"].is_string());
}

#[tokio::test]
async fn test_single_shot_invalid_category() {
    let app = test_app().await;
    let tiff = rgb_tiff_bytes(32, 32);

    let boundary = "----gigatile-badcat";
    let body = multipart_body(boundary, &[("file", Some("x.tif"), &tiff)]);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/datasets/upload?name=x&category=moon")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
