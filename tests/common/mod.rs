#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use base64::Engine;
use byte_unit::Byte;
use ferryd::api::AppState;
use ferryd::build_app;
use ferryd::config::Config;
use ferryd::state::StateManager;
use ferryd::storage::ChunkStorage;
use ferryd::storage::cleanup::CleanupRunner;
use ferryd::storage::quota::QuotaAccountant;
use ferryd::store::UploadStore;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub async fn setup_test_app() -> Router {
    setup_test_app_with(|_| {}).await
}

/// Build an app against a fresh TempDir and in-memory state backend.
/// The chunk size is shrunk so multi-chunk paths are exercised with small
/// payloads.
pub async fn setup_test_app_with(customize: impl FnOnce(&mut Config)) -> Router {
    // Create temporary directory for test data
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path().to_path_buf();

    // Don't drop temp_dir - leak it so it persists for the test
    std::mem::forget(temp_dir);

    let mut config = Config::default();
    config.storage.storage_path = temp_path;
    config.storage.chunk_size = Byte::from_u64(1024);
    customize(&mut config);

    let store = UploadStore::new(StateManager::memory());
    let storage = Arc::new(ChunkStorage::new(&config.storage.storage_path, store.clone()));
    storage.initialize().await.unwrap();

    let quota = QuotaAccountant::new(
        storage.uploads_path(),
        storage.files_path(),
        config.storage.max_storage_size.map(|b| b.as_u64()),
        store.clone(),
    );
    let cleanup = CleanupRunner::new(Arc::clone(&storage), store.clone(), None);

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        storage,
        quota,
        cleanup,
    });

    build_app(state)
}

pub fn b64(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value)
}

/// Encode `Upload-Metadata` pairs; an empty value produces a bare key.
pub fn metadata_header(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                (*key).to_string()
            } else {
                format!("{} {}", key, b64(value))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// POST a new upload and return its file id from the Location header.
pub async fn tus_create(app: &Router, size: u64, metadata: &[(&str, &str)]) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tus")
                .header("Tus-Resumable", "1.0.0")
                .header("Upload-Length", size.to_string())
                .header("Upload-Metadata", metadata_header(metadata))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);

    let location = response
        .headers()
        .get("location")
        .expect("Location header missing")
        .to_str()
        .unwrap();
    location.rsplit('/').next().unwrap().to_string()
}

pub async fn tus_patch(app: &Router, file_id: &str, offset: u64, data: &[u8]) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/tus/{}", file_id))
                .header("Tus-Resumable", "1.0.0")
                .header("Content-Type", "application/offset+octet-stream")
                .header("Upload-Offset", offset.to_string())
                .body(Body::from(data.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn tus_head(app: &Router, file_id: &str) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/tus/{}", file_id))
                .header("Tus-Resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Create an upload and PATCH it to completion in `chunk`-sized pieces.
pub async fn upload_bytes(
    app: &Router,
    data: &[u8],
    chunk: usize,
    metadata: &[(&str, &str)],
) -> String {
    let file_id = tus_create(app, data.len() as u64, metadata).await;

    let mut offset = 0usize;
    while offset < data.len() {
        let end = (offset + chunk).min(data.len());
        let response = tus_patch(app, &file_id, offset as u64, &data[offset..end]).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let reported: u64 = response
            .headers()
            .get("upload-offset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(reported, end as u64);

        offset = end;
    }

    file_id
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Deterministic non-repeating test payload.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Every TUS response, success or error, must carry the protocol headers.
pub fn assert_tus_headers(response: &Response<Body>) {
    assert_eq!(header(response, "tus-resumable"), Some("1.0.0"));
    assert_eq!(header(response, "tus-version"), Some("1.0.0"));
}
