use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use bb_image_engine::config::EngineConfig;
use bb_image_engine::error::FetchError;
use bb_image_engine::net::{TaskKind, TaskStatus};
use bb_image_engine::source::{HttpSource, ImageSource};
use bb_image_engine::{FetchOrigin, ImageService};

const IMAGE_SIZE: usize = 256 * 1024;

fn image_bytes() -> Vec<u8> {
    let mut body: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect();
    body[..8].copy_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    body
}

async fn serve_image(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    let body = image_bytes();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_LENGTH, body.len().to_string()),
        ],
        body,
    )
}

async fn start_server() -> (SocketAddr, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/images/logo.png", get(serve_image))
        .route(
            "/flaky.png",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .with_state(Arc::clone(&hits));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits, handle)
}

#[tokio::test]
async fn test_http_source_streams_body() {
    let (addr, _hits, _handle) = start_server().await;
    let source = HttpSource::default();

    let mut body = source
        .open(&format!("http://{}/images/logo.png", addr))
        .await
        .unwrap();
    assert_eq!(body.info().content_length, Some(IMAGE_SIZE as u64));
    assert_eq!(body.info().content_type, "image/png");

    let mut data = Vec::new();
    while let Some(chunk) = body.next_chunk().await.unwrap() {
        data.extend_from_slice(&chunk);
    }
    assert_eq!(data, image_bytes());
}

#[tokio::test]
async fn test_http_source_reports_status() {
    let (addr, _hits, _handle) = start_server().await;
    let source = HttpSource::default();

    let err = source
        .open(&format!("http://{}/missing.png", addr))
        .await
        .err()
        .unwrap();
    assert_eq!(FetchError::classify(&err), FetchError::Status(404));
}

#[tokio::test]
async fn test_http_source_connection_refused_is_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = HttpSource::default()
        .open(&format!("http://{}/logo.png", addr))
        .await
        .err()
        .unwrap();
    let cause = FetchError::classify(&err);
    assert!(matches!(cause, FetchError::Transport(_)));
    assert!(cause.is_retryable());
}

#[tokio::test]
async fn test_service_downloads_once_and_tracks_tasks() {
    let (addr, hits, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::with_cache_dir(dir.path().to_string_lossy().to_string());
    let service = ImageService::start_http(config).unwrap();
    let url = format!("http://{}/images/logo.png", addr);

    let (a, b) = tokio::join!(service.fetch(&url), service.fetch(&url));
    assert_eq!(a.unwrap().to_vec(), image_bytes());
    assert_eq!(b.unwrap().to_vec(), image_bytes());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let stream = service.fetch_stream(&url).unwrap();
    assert_eq!(stream.origin(), FetchOrigin::Cache);
    assert_eq!(stream.collect().await.unwrap().len(), IMAGE_SIZE);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let rows = service.tasks();
    assert_eq!(rows[0].id, service.images_group());
    assert_eq!(rows[0].title, "Images");
    assert_eq!(rows[0].kind, TaskKind::Group);
    assert_eq!(rows[0].status, TaskStatus::Completed);
    let leaves: Vec<_> = rows.iter().filter(|r| r.kind == TaskKind::Leaf).collect();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].title, "logo.png");
    assert_eq!(leaves[0].depth, 1);
    assert_eq!(leaves[0].bytes, IMAGE_SIZE as u64);

    let stats = service.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.downloaded_bytes, IMAGE_SIZE as u64);
    assert_eq!(stats.cached_bytes, IMAGE_SIZE as u64);

    service.shutdown().await;
}

#[tokio::test]
async fn test_service_reports_upstream_failure() {
    let (addr, _hits, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_cache_dir(dir.path().to_string_lossy().to_string());
    config.max_retries = 1;
    config.retry_backoff_ms = 10;
    let service = ImageService::start_http(config).unwrap();

    let err = service
        .fetch(&format!("http://{}/flaky.png", addr))
        .await
        .unwrap_err();
    assert_eq!(FetchError::classify(&err), FetchError::Status(503));
    assert_eq!(
        service.net().status(service.images_group()),
        Some(TaskStatus::Errored)
    );
    assert_eq!(service.cache().entry_count(), 0);

    service.shutdown().await;
}
