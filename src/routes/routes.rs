//! Defines routes for the storage API.
//!
//! ## Structure
//! - **Probes** (mounted at root)
//!   - `GET /healthz`, `GET /readyz`
//!
//! - **Storage endpoints** under `/api/v1/storage`
//!   - `POST   /upload_token`, `/batch_upload_token` (issue upload credentials)
//!   - `POST   /upload_complete`, `/batch_upload_complete`
//!   - `GET    /download/{*key}` (proxied stream), `/download_url/{*key}`
//!   - `GET    /info/{*key}`
//!   - `DELETE /files/{*key}`, `GET /files?router=`, `GET /stats?router=`
//!   - `POST   /batch_delete`
//!   - `GET    /upload_records`, `/upload_records/stats`
//!   - `PUT|GET /blob/{bucket}/{*key}` (signed data plane of the local backend)
//!
//! The wildcard `*key` allows keys like `t1/app/2025/01/03/{uuid}.jpg`; both
//! raw and `%2F`-escaped slashes are accepted.

use crate::{
    handlers::{
        blob_handlers::{get_blob, put_blob},
        health_handlers::{healthz, readyz},
        storage_handlers::{
            batch_delete, batch_upload_complete, batch_upload_token, delete_file, download,
            download_url, info, list_files, stats, upload_complete, upload_record_stats,
            upload_records, upload_token,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

/// Prefix every storage endpoint is nested under.
pub const API_PREFIX: &str = "/api/v1/storage";

/// Build and return the router carrying `StorageService` as shared state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest(API_PREFIX, storage_routes())
}

fn storage_routes() -> Router<StorageService> {
    Router::new()
        .route("/upload_token", post(upload_token))
        .route("/batch_upload_token", post(batch_upload_token))
        .route("/upload_complete", post(upload_complete))
        .route("/batch_upload_complete", post(batch_upload_complete))
        .route("/download/{*key}", get(download))
        .route("/download_url/{*key}", get(download_url))
        .route("/info/{*key}", get(info))
        .route("/files", get(list_files))
        .route("/files/{*key}", delete(delete_file))
        .route("/stats", get(stats))
        .route("/batch_delete", post(batch_delete))
        .route("/upload_records", get(upload_records))
        .route("/upload_records/stats", get(upload_record_stats))
        .route("/blob/{bucket}/{*key}", put(put_blob).get(get_blob))
}

/// Fully assembled application with request tracing.
pub fn app(service: StorageService) -> Router {
    routes()
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}
