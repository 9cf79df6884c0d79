//! HTTP fetcher against a mock archive server

use apkzoo::config::ArchiveConfig;
use apkzoo::fetcher::{FetchError, Fetcher, HttpFetcher};
use apkzoo::identifier::Identifier;
use apkzoo::queue::{Callbacks, DownloadQueue, Job, JobState, QueueConfig, RetryPolicy};
use apkzoo::storage::PackageStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const API_KEY: &str = "test-key";

#[derive(Clone)]
enum Reply {
    Body(Bytes),
    Status(u16),
    /// 503 for the first `n` requests, then the body
    FlakyBody(usize, Bytes),
}

#[derive(Default)]
struct Archive {
    replies: Mutex<HashMap<String, Reply>>,
    hits: Mutex<HashMap<String, usize>>,
    requests: AtomicUsize,
}

impl Archive {
    fn reply(&self, identifier: &Identifier, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(identifier.to_string(), reply);
    }

    fn hits(&self, identifier: &Identifier) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(identifier.as_str())
            .copied()
            .unwrap_or(0)
    }
}

async fn download(
    State(archive): State<Arc<Archive>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    archive.requests.fetch_add(1, Ordering::SeqCst);

    if params.get("apikey").map(String::as_str) != Some(API_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(sha256) = params.get("sha256").map(|s| s.to_ascii_uppercase()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let hit = {
        let mut hits = archive.hits.lock().unwrap();
        let count = hits.entry(sha256.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let reply = archive.replies.lock().unwrap().get(&sha256).cloned();
    match reply {
        Some(Reply::Body(body)) => body.into_response(),
        Some(Reply::Status(code)) => StatusCode::from_u16(code).unwrap().into_response(),
        Some(Reply::FlakyBody(failures, _)) if hit <= failures => {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Some(Reply::FlakyBody(_, body)) => body.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_mock_archive() -> (String, Arc<Archive>) {
    let archive = Arc::new(Archive::default());
    let app = Router::new()
        .route("/api/download", get(download))
        .with_state(archive.clone());

    // Bind to random available port
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api/download", bound_addr), archive)
}

/// A package body and the identifier it hashes to
fn package(seed: &str) -> (Identifier, Bytes) {
    let body = Bytes::from(format!("PK\x03\x04 fake apk {}", seed).repeat(512));
    let digest = format!("{:X}", Sha256::digest(&body));
    (Identifier::parse(&digest).unwrap(), body)
}

fn archive_config(url: &str) -> ArchiveConfig {
    ArchiveConfig {
        download_url: url.to_string(),
        connect_timeout_secs: 2,
        request_timeout_secs: 10,
        api_key: Some(API_KEY.to_string()),
        ..ArchiveConfig::default()
    }
}

fn local_fetcher(url: &str, dir: &TempDir) -> HttpFetcher {
    let store = PackageStore::local(dir.path(), 4096, true).unwrap();
    HttpFetcher::new(&archive_config(url), store).unwrap()
}

#[tokio::test]
async fn test_fetch_stores_verified_package() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher(&url, &dir);

    let (id, body) = package("ok");
    archive.reply(&id, Reply::Body(body.clone()));

    let path = fetcher.fetch(&id).await.unwrap();
    assert_eq!(path, dir.path().canonicalize().unwrap().join(format!("{}.apk", id)));
    assert_eq!(std::fs::read(&path).unwrap(), body.as_ref());
    assert!(fetcher.store().contains_verified(&id).await.unwrap());
}

#[tokio::test]
async fn test_verified_copy_skips_network() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher(&url, &dir);

    let (id, body) = package("cached");
    archive.reply(&id, Reply::Body(body));

    fetcher.fetch(&id).await.unwrap();
    fetcher.fetch(&id).await.unwrap();
    assert_eq!(archive.hits(&id), 1);
}

#[tokio::test]
async fn test_status_codes_map_to_failure_kinds() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher(&url, &dir);

    let (missing, _) = package("missing");
    assert_eq!(fetcher.fetch(&missing).await.unwrap_err(), FetchError::NotFound);

    for (seed, code) in [("busy", 503), ("throttled", 429)] {
        let (id, _) = package(seed);
        archive.reply(&id, Reply::Status(code));
        let err = fetcher.fetch(&id).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)), "{}: {:?}", code, err);
        assert!(err.is_retryable());
    }

    let (forbidden, _) = package("forbidden");
    archive.reply(&forbidden, Reply::Status(403));
    let err = fetcher.fetch(&forbidden).await.unwrap_err();
    assert!(matches!(err, FetchError::Rejected(_)));
    assert!(!err.is_retryable());

    // Nothing was stored for any failure
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let config = ArchiveConfig {
        api_key: None,
        ..archive_config(&url)
    };
    let store = PackageStore::local(dir.path(), 4096, true).unwrap();
    let fetcher = HttpFetcher::new(&config, store).unwrap();

    let (id, body) = package("nokey");
    archive.reply(&id, Reply::Body(body));

    let err = fetcher.fetch(&id).await.unwrap_err();
    assert!(matches!(err, FetchError::Rejected(ref msg) if msg.contains("401")));
}

#[tokio::test]
async fn test_wrong_body_is_integrity_failure_and_leaves_nothing() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher(&url, &dir);

    let (id, _) = package("expected");
    let (_, other) = package("something else");
    archive.reply(&id, Reply::Body(other));

    let err = fetcher.fetch(&id).await.unwrap_err();
    assert!(matches!(err, FetchError::IntegrityMismatch(_)));
    assert!(err.is_retryable());
    assert!(!fetcher.store().exists(&id).await.unwrap());
}

#[tokio::test]
async fn test_empty_body_is_not_success() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher(&url, &dir);

    let (id, _) = package("empty");
    archive.reply(&id, Reply::Body(Bytes::new()));

    let err = fetcher.fetch(&id).await.unwrap_err();
    assert!(matches!(err, FetchError::IntegrityMismatch(_)), "{:?}", err);
    assert!(!fetcher.store().exists(&id).await.unwrap());
}

#[tokio::test]
async fn test_unreachable_archive_is_transient() {
    // Nothing listens on the discard port
    let dir = TempDir::new().unwrap();
    let fetcher = local_fetcher("http://127.0.0.1:9/api/download", &dir);
    let (id, _) = package("offline");

    let err = fetcher.fetch(&id).await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(_)), "{:?}", err);
}

#[tokio::test]
async fn test_queue_downloads_through_http() {
    let (url, archive) = start_mock_archive().await;
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(local_fetcher(&url, &dir));

    let mut good = Vec::new();
    for i in 0..6 {
        let (id, body) = package(&format!("batch-{}", i));
        archive.reply(&id, Reply::Body(body));
        good.push(id);
    }
    let (flaky, flaky_body) = package("flaky");
    archive.reply(&flaky, Reply::FlakyBody(2, flaky_body));
    let (gone, _) = package("gone");

    let outcomes: Arc<Mutex<Vec<Job>>> = Arc::default();
    let (ok, failed) = (outcomes.clone(), outcomes.clone());
    let callbacks = Callbacks::new(
        move |job| ok.lock().unwrap().push(job),
        move |job| failed.lock().unwrap().push(job),
    );

    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
    };
    let config = QueueConfig::new(3).with_retry(retry);

    let ids: Vec<Identifier> = good.iter().cloned().chain([flaky.clone(), gone.clone()]).collect();
    let ((), summary) = DownloadQueue::scope(config, fetcher, callbacks, |queue| async move {
        for id in ids {
            queue.enqueue_identifier(id)?;
        }
        Ok::<_, apkzoo::queue::QueueError>(())
    })
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 7);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 2);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 8);

    let flaky_job = outcomes.iter().find(|j| j.identifier == flaky).unwrap();
    assert_eq!(flaky_job.state, JobState::Succeeded);
    assert_eq!(flaky_job.attempts, 3);

    let gone_job = outcomes.iter().find(|j| j.identifier == gone).unwrap();
    assert_eq!(gone_job.state, JobState::Failed);
    assert_eq!(gone_job.attempts, 1);
    assert_eq!(gone_job.last_error, Some(FetchError::NotFound));

    for id in &good {
        let stored = std::fs::read(dir.path().join(format!("{}.apk", id))).unwrap();
        assert_eq!(format!("{:X}", Sha256::digest(&stored)), id.as_str());
    }
    assert_eq!(archive.requests.load(Ordering::SeqCst), 10);
}
