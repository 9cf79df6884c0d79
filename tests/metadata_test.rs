//! Google Play metadata mirror: in-memory dumps and a mock HTTP endpoint

use apkzoo::catalog::{
    Catalog, Database, HttpMetadataSource, IndexError, IndexSource, MemoryIndex, MemoryMetadata, MetadataCatalog,
    SyncError,
};
use apkzoo::config::CatalogConfig;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const API_KEY: &str = "test-key";

fn document(package: &str, version_code: i64) -> String {
    json!({
        "title": format!("{} title", package),
        "descriptionShort": "Short description",
        "descriptionHtml": "<b>Long</b> description",
        "azMetadataDate": "2024-03-01T10:00:00.000000",
        "details": {
            "appDetails": {
                "packageName": package,
                "numDownloads": "10,000+",
                "installationSize": 5_242_880,
                "developerName": "Example Developer",
                "developerEmail": "dev@example.org",
                "uploadDate": "Mar 1, 2024",
                "versionCode": version_code,
                "versionString": format!("1.{}", version_code),
            }
        }
    })
    .to_string()
}

fn dump(lines: &[String]) -> String {
    let mut jsonl = String::new();
    for line in lines {
        jsonl.push_str(line);
        jsonl.push('\n');
    }
    jsonl
}

fn sample() -> Vec<String> {
    vec![
        document("com.example.alpha", 1),
        document("com.example.beta", 2),
        "{\"truncated\": ".to_string(),
        json!({"title": "No package"}).to_string(),
        document("com.example.gamma", 3),
    ]
}

fn metadata_catalog(db: &Database, source: MemoryMetadata, batch_size: usize) -> MetadataCatalog {
    MetadataCatalog::new(db.clone(), Arc::new(source), batch_size)
}

#[tokio::test]
async fn test_sync_skips_malformed_lines() {
    let db = Database::connect_in_memory().await.unwrap();
    let catalog = metadata_catalog(&db, MemoryMetadata::from_jsonl(dump(&sample())).with_version("m1"), 2);

    let stats = catalog.sync().await.unwrap();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.inserted, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.batches, 3);
    assert_eq!(catalog.count().await.unwrap(), 3);
    assert_eq!(catalog.last_synced_version().await.unwrap().as_deref(), Some("m1"));

    let beta = catalog.get("com.example.beta").await.unwrap().unwrap();
    assert_eq!(beta.title.as_deref(), Some("com.example.beta title"));
    assert_eq!(beta.installation_size, Some(5_242_880));
    assert_eq!(beta.version_code, Some(2));
    assert_eq!(beta.version_string.as_deref(), Some("1.2"));
    assert_eq!(beta.data["details"]["appDetails"]["developerEmail"], "dev@example.org");

    assert!(catalog.get("com.example.missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resync_is_idempotent_and_updates_changed_documents() {
    let db = Database::connect_in_memory().await.unwrap();
    metadata_catalog(&db, MemoryMetadata::from_jsonl(dump(&sample())), 10)
        .sync()
        .await
        .unwrap();

    let again = metadata_catalog(&db, MemoryMetadata::from_jsonl(dump(&sample())), 10)
        .sync()
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.unchanged, 3);

    let newer = dump(&[document("com.example.alpha", 7), document("com.example.delta", 1)]);
    let catalog = metadata_catalog(&db, MemoryMetadata::from_jsonl(newer), 10);
    let stats = catalog.sync().await.unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.inserted, 1);
    assert_eq!(catalog.count().await.unwrap(), 4);

    let alpha = catalog.get("com.example.alpha").await.unwrap().unwrap();
    assert_eq!(alpha.version_code, Some(7));
    assert_eq!(alpha.data["details"]["appDetails"]["versionString"], "1.7");
}

#[tokio::test]
async fn test_unchanged_version_is_skipped_unless_forced() {
    let db = Database::connect_in_memory().await.unwrap();
    let catalog = metadata_catalog(&db, MemoryMetadata::from_jsonl(dump(&sample())).with_version("m1"), 10);
    catalog.sync().await.unwrap();

    let skipped = catalog.sync().await.unwrap();
    assert!(skipped.up_to_date);
    assert_eq!(skipped.processed, 0);

    let forced = catalog.force_sync().await.unwrap();
    assert!(!forced.up_to_date);
    assert_eq!(forced.unchanged, 3);
    assert_eq!(forced.skipped, 2);
}

#[tokio::test]
async fn test_interrupted_sync_is_not_logged() {
    let db = Database::connect_in_memory().await.unwrap();
    let source = MemoryMetadata::from_jsonl(dump(&sample())).with_version("m1").interrupt_after(1);
    let catalog = metadata_catalog(&db, source, 2);

    let err = catalog.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Index(IndexError::Interrupted(_))));
    assert_eq!(catalog.count().await.unwrap(), 2);
    assert!(catalog.last_synced_version().await.unwrap().is_none());
}

#[tokio::test]
async fn test_metadata_and_package_logs_are_separate() {
    let db = Database::connect_in_memory().await.unwrap();
    let packages = Catalog::new(
        db.clone(),
        Arc::new(
            MemoryIndex::from_csv(
                "sha256,sha1,md5,dex_date,apk_size,pkg_name,vercode,vt_detection,vt_scan_date,dex_size,markets\n",
            )
            .with_version("shared-etag"),
        ),
        10,
    );
    packages.sync().await.unwrap();

    let metadata = metadata_catalog(&db, MemoryMetadata::from_jsonl(dump(&sample())).with_version("shared-etag"), 10);
    assert!(metadata.last_synced_version().await.unwrap().is_none());
    let stats = metadata.sync().await.unwrap();
    assert!(!stats.up_to_date);
    assert_eq!(stats.inserted, 3);
}

struct MetadataServer {
    body: Mutex<Vec<u8>>,
    etag: Mutex<String>,
    full_downloads: AtomicUsize,
    unauthorized: AtomicUsize,
}

impl MetadataServer {
    fn publish(&self, lines: &[String], etag: &str) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(dump(lines).as_bytes()).unwrap();
        *self.body.lock().unwrap() = encoder.finish().unwrap();
        *self.etag.lock().unwrap() = etag.to_string();
    }
}

async fn serve_metadata(
    State(server): State<Arc<MetadataServer>>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if params.get("apikey").map(String::as_str) != Some(API_KEY) {
        server.unauthorized.fetch_add(1, Ordering::SeqCst);
        return StatusCode::FORBIDDEN.into_response();
    }

    let etag = format!("\"{}\"", server.etag.lock().unwrap());
    if method == Method::HEAD {
        return [(header::ETAG, etag)].into_response();
    }
    if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    server.full_downloads.fetch_add(1, Ordering::SeqCst);
    let body = server.body.lock().unwrap().clone();
    ([(header::ETAG, etag)], body).into_response()
}

async fn start_metadata_server(lines: &[String], etag: &str) -> (String, Arc<MetadataServer>) {
    let server = Arc::new(MetadataServer {
        body: Mutex::new(Vec::new()),
        etag: Mutex::new(String::new()),
        full_downloads: AtomicUsize::new(0),
        unauthorized: AtomicUsize::new(0),
    });
    server.publish(lines, etag);

    let app = Router::new()
        .route("/api/get_gp_metadata_file/full", get(serve_metadata))
        .with_state(server.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api/get_gp_metadata_file/full", bound_addr), server)
}

fn catalog_config(metadata_url: String, dir: &TempDir) -> CatalogConfig {
    CatalogConfig {
        database_path: dir.path().join("catalog.db"),
        metadata_url,
        cache_dir: dir.path().join("cache"),
        batch_size: 2,
        ..CatalogConfig::default()
    }
}

#[tokio::test]
async fn test_http_metadata_sync_downloads_once_per_version() {
    let (url, server) = start_metadata_server(&sample(), "gp-1").await;
    let dir = TempDir::new().unwrap();
    let config = catalog_config(url, &dir);

    let source = HttpMetadataSource::new(&config, Some(API_KEY.to_string()), reqwest::Client::new());
    assert_eq!(source.version().await.unwrap().as_deref(), Some("gp-1"));

    let db = Database::connect(&config.database_path).await.unwrap();
    let catalog = MetadataCatalog::new(db.clone(), Arc::new(source), config.batch_size);

    let stats = catalog.sync().await.unwrap();
    assert_eq!(stats.inserted, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.version.as_deref(), Some("gp-1"));
    assert!(config.cache_dir.join("gp-metadata-full.jsonl.gz").exists());

    let again = catalog.sync().await.unwrap();
    assert!(again.up_to_date);
    assert_eq!(server.full_downloads.load(Ordering::SeqCst), 1);

    server.publish(&[document("com.example.alpha", 9)], "gp-2");
    let updated = catalog.sync().await.unwrap();
    assert_eq!(updated.updated, 1);
    assert_eq!(server.full_downloads.load(Ordering::SeqCst), 2);
    assert_eq!(catalog.last_synced_version().await.unwrap().as_deref(), Some("gp-2"));
    assert_eq!(server.unauthorized.load(Ordering::SeqCst), 0);

    db.close().await;
}

#[tokio::test]
async fn test_http_metadata_without_key_is_rejected() {
    let (url, server) = start_metadata_server(&sample(), "gp-1").await;
    let dir = TempDir::new().unwrap();
    let config = catalog_config(url, &dir);

    let source = HttpMetadataSource::new(&config, None, reqwest::Client::new());
    assert_eq!(source.version().await.unwrap(), None);

    let db = Database::connect_in_memory().await.unwrap();
    let catalog = MetadataCatalog::new(db, Arc::new(source), config.batch_size);
    let err = catalog.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Index(IndexError::Status(403))));
    assert_eq!(catalog.count().await.unwrap(), 0);
    // Version check, sync's own version check, then the download
    assert_eq!(server.unauthorized.load(Ordering::SeqCst), 3);
}
