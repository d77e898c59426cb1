//! Lifecycle tests: expiry sweeps against fully ingested datasets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tower::ServiceExt;

use gigatile::processor::LifecycleManager;

use super::test_utils::{get_request, system, test_app, write_rgb_tiff};

/// An expired user dataset loses its tile tree, original file, preview and
/// row in one sweep; a second sweep finds no work. (Demo datasets never
/// expire.)
#[tokio::test]
async fn test_expiry_sweep_end_to_end() {
    let app = test_app().await;
    let alice = app.add_user("alice", "tok-alice").await;

    write_rgb_tiff(&app.upload_path("doomed.tif"), 600, 400);
    write_rgb_tiff(&app.upload_path("demo.tif"), 64, 64);

    let doomed = app.ingest("doomed.tif", "doomed", Some(&alice), false).await;
    let demo = app.ingest("demo.tif", "forever-demo", None, true).await;

    // Force the expiry into the past.
    let mut row = app.state.db.get_dataset(doomed.id).await.unwrap();
    row.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    app.state.db.update_dataset(&row).await.unwrap();

    let tile_dir = app.state.processor.tile_base_dir(doomed.id);
    let preview = app.state.processor.preview_path(doomed.id);
    let original = app.upload_path("doomed.tif");
    assert!(tile_dir.exists());
    assert!(preview.exists());
    assert!(original.exists());

    let lifecycle = LifecycleManager::new(
        Arc::clone(&app.state.processor),
        app.state.db.clone(),
        app.state.store.clone(),
        Duration::from_secs(3600),
    );

    assert_eq!(lifecycle.sweep().await.unwrap(), 1);

    assert!(!tile_dir.exists());
    assert!(!preview.exists());
    assert!(!original.exists());
    assert!(app.state.db.get_dataset(doomed.id).await.is_err());

    // The demo dataset is untouched.
    assert!(app.state.db.get_dataset(demo.id).await.is_ok());

    // A second tick finds no work.
    assert_eq!(lifecycle.sweep().await.unwrap(), 0);
}

/// Deleting a dataset cascades to its annotations, and tile requests for
/// the deleted dataset return 404.
#[tokio::test]
async fn test_delete_cascades_and_tiles_404() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("ann.tif"), 64, 64);
    let dataset = app.ingest("ann.tif", "annotated", None, false).await;

    app.state
        .db
        .insert_annotation(
            dataset.id,
            "anonymous",
            serde_json::json!({"type": "Point", "coordinates": [10.0, 20.0]}),
            "point",
            "crater",
        )
        .await
        .unwrap();
    assert_eq!(app.state.db.count_annotations(dataset.id).await.unwrap(), 1);

    app.state
        .processor
        .delete(dataset.id, &system())
        .await
        .unwrap();

    assert_eq!(app.state.db.count_annotations(dataset.id).await.unwrap(), 0);

    let response = app
        .router
        .clone()
        .oneshot(get_request(
            &format!("/api/tiles/{}/0/0/0.png", dataset.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}

/// Reprocessing drops the tile tree and rebuilds it.
#[tokio::test]
async fn test_reprocess_rebuilds_pyramid() {
    let app = test_app().await;

    write_rgb_tiff(&app.upload_path("re.tif"), 300, 200);
    let dataset = app.ingest("re.tif", "reprocessable", None, false).await;

    let tile = app
        .state
        .processor
        .tile_base_dir(dataset.id)
        .join("0/0/0.png");
    assert!(tile.exists());

    // Reprocess synchronously through the processor internals so the test
    // doesn't race the spawned job.
    let path = app.upload_path("re.tif");
    tokio::fs::remove_dir_all(app.state.processor.tile_base_dir(dataset.id))
        .await
        .unwrap();
    app.state
        .processor
        .run_tile_job(dataset.id, &path, "re-task")
        .await
        .unwrap();

    assert!(tile.exists());
    let row = app.state.db.get_dataset(dataset.id).await.unwrap();
    assert_eq!(row.processing_progress, 100);
}
