//! Audit ledger for issued uploads and proxied downloads.
//!
//! Every read except [`AuditStore::get_upload`] only sees completed uploads.
//! Router-scoped reads cover the router itself and everything beneath it.

pub mod sqlite;

use crate::models::{FileDownloadRecord, FileUploadRecord, UploadStats, UploadStatus};
use async_trait::async_trait;
use thiserror::Error;

pub use sqlite::SqliteAuditStore;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type AuditResult<T> = Result<T, AuditError>;

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a ledger row; `record.id` is ignored.
    async fn create_upload(&self, record: &FileUploadRecord) -> AuditResult<()>;

    /// Returns false when no row carries `key`.
    async fn update_status(&self, key: &str, status: UploadStatus) -> AuditResult<bool>;

    /// Row for `key` in any status.
    async fn get_upload(&self, key: &str) -> AuditResult<Option<FileUploadRecord>>;

    async fn list_uploads_by_user(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)>;

    async fn list_uploads_by_router(
        &self,
        router: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)>;

    async fn stats_by_user(&self, username: &str) -> AuditResult<UploadStats>;

    async fn stats_by_router(&self, router: &str) -> AuditResult<UploadStats>;

    async fn create_download(&self, record: &FileDownloadRecord) -> AuditResult<()>;

    /// Cheap round trip used by readiness probes.
    async fn ping(&self) -> AuditResult<()>;
}
