//! Dataset API tests: visibility, CRUD, demo immutability, status, info.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::test_utils::{get_request, test_app, write_rgb_tiff};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(get_request("/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_list_visibility_by_caller() {
    let app = test_app().await;
    let alice = app.add_user("alice", "tok-alice").await;
    app.add_user("bob", "tok-bob").await;

    write_rgb_tiff(&app.upload_path("mine.tif"), 64, 64);
    write_rgb_tiff(&app.upload_path("demo.tif"), 64, 64);

    app.ingest("mine.tif", "mine", Some(&alice), false).await;
    app.ingest("demo.tif", "public-demo", None, true).await;

    // Anonymous callers see demo rows only.
    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/datasets", None))
        .await
        .unwrap();
    let json = body_json(response).await;
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["public-demo"]);

    // Owners see their own rows only.
    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/datasets", Some("tok-alice")))
        .await
        .unwrap();
    let json = body_json(response).await;
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mine"]);

    // A different user sees nothing of Alice's.
    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/datasets", Some("tok-bob")))
        .await
        .unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_get_missing_dataset_is_404() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/datasets/999", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_credential_is_401() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/datasets", Some("bogus")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_demo_dataset_is_immutable() {
    let app = test_app().await;
    app.add_user("alice", "tok-alice").await;

    write_rgb_tiff(&app.upload_path("demo.tif"), 64, 64);
    let demo = app.ingest("demo.tif", "demo-rock", None, true).await;

    // Authenticated update is forbidden.
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/datasets/{}", demo.id))
        .header("authorization", "Bearer tok-alice")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"description": "vandalism"}"#))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Authenticated delete is forbidden too.
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/datasets/{}", demo.id))
        .header("authorization", "Bearer tok-alice")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // But anonymous reads succeed.
    let response = app
        .router
        .clone()
        .oneshot(get_request(&format!("/api/datasets/{}", demo.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_owner_can_update_and_delete() {
    let app = test_app().await;
    let alice = app.add_user("alice", "tok-alice").await;

    write_rgb_tiff(&app.upload_path("own.tif"), 64, 64);
    let dataset = app.ingest("own.tif", "own", Some(&alice), false).await;

    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/datasets/{}", dataset.id))
        .header("authorization", "Bearer tok-alice")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"description": "my nebula", "category": "mars"}"#))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["description"], "my nebula");
    assert_eq!(json["category"], "mars");

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/datasets/{}", dataset.id))
        .header("authorization", "Bearer tok-alice")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/datasets/{}", dataset.id),
            Some("tok-alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_endpoint() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("s.tif"), 64, 64);
    let pending = app.create_pending("s.tif", "status-check").await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/datasets/{}/status", pending.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "pending");
    assert_eq!(json["progress"], 0);
}

#[tokio::test]
async fn test_tile_info_shape() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("info.tif"), 600, 400);
    let dataset = app.ingest("info.tif", "info-check", None, true).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(&format!("/api/tiles/{}/info", dataset.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["type"], "zoomify");
    assert_eq!(json["width"], 600);
    assert_eq!(json["height"], 400);
    assert_eq!(json["tileSize"], 256);
    assert_eq!(json["minZoom"], 0);
    assert_eq!(json["maxZoom"], 2);
    assert_eq!(json["profile"], "level0");
    assert_eq!(
        json["tilesUrl"],
        format!("/api/tiles/{}/{{z}}/{{x}}/{{y}}.png", dataset.id)
    );
}

#[tokio::test]
async fn test_stats_endpoint() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("a.tif"), 64, 64);
    app.ingest("a.tif", "stats-a", None, true).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/stats", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_datasets"], 1);
    assert_eq!(json["completed"], 1);
    assert_eq!(json["total_pixels"], 64 * 64);
}
