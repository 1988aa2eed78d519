//! Loopback test server: local backend, SQLite ledger, real TCP listener.

use super::{audit::FlakyAudit, backend::CountingBackend};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::Value;
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};
use std::{net::SocketAddr, sync::Arc};
use tempfile::TempDir;
use tenant_storage::{
    audit::{AuditStore, SqliteAuditStore},
    backends::LocalBackend,
    config::StorageConfig,
    routes::routes::app,
    services::storage_service::StorageService,
};
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const TEST_BUCKET: &str = "files";

/// A running service plus handles on everything behind it.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub service: StorageService,
    pub backend: Arc<CountingBackend>,
    pub audit: Arc<SqliteAuditStore>,
    /// What the service actually writes through.
    pub ledger: Arc<FlakyAudit>,
    pub db: Arc<Pool<Sqlite>>,
    pub addr: SocketAddr,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_max_file_size_mb(100).await
    }

    pub async fn with_max_file_size_mb(max_file_size_mb: u64) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        // Bind first so presigned URLs can point at the real address.
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("listener address");

        let config = StorageConfig {
            backend: "local".into(),
            bucket: TEST_BUCKET.into(),
            endpoint: format!("http://{addr}"),
            local_root: temp_dir.path().join("objects").to_string_lossy().into_owned(),
            signing_secret: "test-secret".into(),
            max_file_size_mb,
            ..StorageConfig::default()
        };

        let db_path = temp_dir.path().join("audit.db");
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .expect("Failed to open audit database");
        let db = Arc::new(pool);
        let audit = Arc::new(SqliteAuditStore::new(db.clone()));
        audit.migrate().await.expect("Failed to migrate audit database");
        let ledger = Arc::new(FlakyAudit::new(audit.clone()));

        let local = LocalBackend::new(&config)
            .await
            .expect("Failed to create local backend");
        let backend = Arc::new(CountingBackend::new(local));

        let service = StorageService::new(
            backend.clone(),
            ledger.clone() as Arc<dyn AuditStore>,
            &config,
        );
        service.init().await.expect("Failed to create bucket");
        backend.reset_calls();

        let router = app(service.clone());
        let served = router.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, served).await;
        });

        Self {
            router,
            service,
            backend,
            audit,
            ledger,
            db,
            addr,
            temp_dir,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Send one request through the router and decode the JSON body.
    pub async fn json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.json(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .header("host", "files.example.com")
            .header("x-username", "alice")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        self.json(request).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.json(Request::delete(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Rows in `file_uploads`, any status.
    pub async fn upload_row_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM file_uploads")
            .fetch_one(self.db.as_ref())
            .await
            .unwrap()
    }

    pub async fn download_row_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM file_downloads")
            .fetch_one(self.db.as_ref())
            .await
            .unwrap()
    }

    /// Issue credentials, PUT `bytes` to the presigned URL, report completion.
    /// Returns the object key.
    pub async fn upload_bytes(&self, router: &str, file_name: &str, bytes: &[u8]) -> String {
        let (_, body) = self
            .post(
                "/api/v1/storage/upload_token",
                serde_json::json!({
                    "file_name": file_name,
                    "content_type": "text/plain",
                    "file_size": bytes.len(),
                    "router": router,
                }),
            )
            .await;
        assert_eq!(body["code"], 0, "upload_token failed: {body}");
        let data = &body["data"];
        let key = data["key"].as_str().unwrap().to_string();
        let url = data["url"].as_str().unwrap();

        let response = reqwest::Client::new()
            .put(url)
            .header("content-type", "text/plain")
            .body(bytes.to_vec())
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "PUT failed: {}", response.status());

        let (_, done) = self
            .post(
                "/api/v1/storage/upload_complete",
                serde_json::json!({ "key": key, "success": true }),
            )
            .await;
        assert_eq!(done["code"], 0, "upload_complete failed: {done}");
        key
    }
}
