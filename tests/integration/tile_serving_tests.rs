//! Tile serving tests: headers, format fallback, access control, zoom
//! validation and batch limits.

use axum::http::StatusCode;
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::test_utils::{get_request, test_app, write_rgb_tiff};

#[tokio::test]
async fn test_tile_served_with_cache_headers() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("m31.tif"), 600, 400);
    let dataset = app.ingest("m31.tif", "m31", None, true).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/0/0/0.png", dataset.id),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("cross-origin-resource-policy").unwrap(),
        "cross-origin"
    );
    assert_eq!(headers.get("x-tile-format").unwrap(), "png");
    assert_eq!(
        headers.get("etag").unwrap(),
        &format!("\"{}-0-0-0-png\"", dataset.id)
    );

    // The body decodes as a full-size PNG tile.
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let tile = image::load_from_memory(&body).unwrap();
    assert_eq!(tile.width(), 256);
    assert_eq!(tile.height(), 256);
}

/// Requesting a JPG when only PNG tiles exist serves the PNG via the
/// format fallback and reports the format actually served.
#[tokio::test]
async fn test_format_fallback_jpg_to_png() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("fb.tif"), 600, 400);
    let dataset = app.ingest("fb.tif", "fallback", None, true).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/1/1/0.jpg", dataset.id),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tile-format").unwrap(),
        "png"
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/png"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    // PNG magic, not JPEG.
    assert_eq!(&body[1..4], b"PNG");
}

#[tokio::test]
async fn test_zoom_beyond_max_is_bad_request() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("z.tif"), 600, 400);
    let dataset = app.ingest("z.tif", "zoomy", None, true).await;
    assert_eq!(dataset.max_zoom, 2);

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/3/0/0.png", dataset.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_tile_within_zoom_is_404() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("m.tif"), 600, 400);
    let dataset = app.ingest("m.tif", "missing", None, true).await;

    // z2 has 3x2 tiles; x=9 does not exist in any format.
    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/2/9/0.png", dataset.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unprocessed_dataset_is_service_unavailable() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("p.tif"), 64, 64);
    let pending = app.create_pending("p.tif", "not-yet").await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/0/0/0.png", pending.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_private_dataset_requires_owner() {
    let app = test_app().await;
    let alice = app.add_user("alice", "tok-alice").await;
    app.add_user("bob", "tok-bob").await;

    write_rgb_tiff(&app.upload_path("priv.tif"), 64, 64);
    let dataset = app.ingest("priv.tif", "private", Some(&alice), false).await;
    let uri = format!("/api/tiles/{}/0/0/0.png", dataset.id);

    // Anonymous: 401.
    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Another user: 403.
    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, Some("tok-bob")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The owner: 200.
    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, Some("tok-alice")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_demo_tiles_are_public() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("d.tif"), 64, 64);
    let demo = app.ingest("d.tif", "world-readable", None, true).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/0/0/0.png", demo.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Batch
// =============================================================================

#[tokio::test]
async fn test_batch_of_exactly_100_is_accepted() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("b.tif"), 64, 64);
    let dataset = app.ingest("b.tif", "batchy", None, true).await;

    let specs: Vec<String> = (0..100).map(|i| format!("tiles=0/0/{}.png", i)).collect();
    let uri = format!("/api/tiles/{}/batch?{}", dataset.id, specs.join("&"));

    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, None))
        .await
        .unwrap();
    // Object store is disabled in tests: the request is accepted but the
    // batch reports the store as unconfigured.
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "object store not configured");
}

#[tokio::test]
async fn test_batch_of_101_is_bad_request() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("b2.tif"), 64, 64);
    let dataset = app.ingest("b2.tif", "batchy-2", None, true).await;

    let specs: Vec<String> = (0..101).map(|i| format!("tiles=0/0/{}.png", i)).collect();
    let uri = format!("/api/tiles/{}/batch?{}", dataset.id, specs.join("&"));

    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_malformed_spec_is_bad_request() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("b3.tif"), 64, 64);
    let dataset = app.ingest("b3.tif", "batchy-3", None, true).await;

    let uri = format!("/api/tiles/{}/batch?tiles=not-a-spec", dataset.id);
    let response = app
        .router
        .clone()
        .oneshot(get_request(&uri, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Preview
// =============================================================================

#[tokio::test]
async fn test_preview_served_locally() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("pv.tif"), 600, 400);
    let dataset = app.ingest("pv.tif", "preview-check", None, true).await;

    for uri in [
        format!("/api/tiles/{}/preview", dataset.id),
        format!("/datasets/{}_preview.jpg", dataset.id),
    ] {
        let response = app
            .router
            .clone()
            .oneshot(get_request(&uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "public, max-age=86400"
        );
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "image/jpeg"
        );
    }
}

#[tokio::test]
async fn test_preview_missing_is_404() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("nopv.tif"), 64, 64);
    let pending = app.create_pending("nopv.tif", "no-preview").await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/preview", pending.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
