//! Ledger double: delegates to a real `SqliteAuditStore` and can be told to
//! fail every write.

use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tenant_storage::{
    audit::{AuditError, AuditResult, AuditStore, SqliteAuditStore},
    models::{FileDownloadRecord, FileUploadRecord, UploadStats, UploadStatus},
};

pub struct FlakyAudit {
    inner: Arc<SqliteAuditStore>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl FlakyAudit {
    pub fn new(inner: Arc<SqliteAuditStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    /// Make inserts and status updates fail until switched back.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> AuditResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for FlakyAudit {
    async fn create_upload(&self, record: &FileUploadRecord) -> AuditResult<()> {
        self.check()?;
        self.inner.create_upload(record).await
    }

    async fn update_status(&self, key: &str, status: UploadStatus) -> AuditResult<bool> {
        self.check()?;
        self.inner.update_status(key, status).await
    }

    async fn get_upload(&self, key: &str) -> AuditResult<Option<FileUploadRecord>> {
        self.inner.get_upload(key).await
    }

    async fn list_uploads_by_user(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)> {
        self.inner.list_uploads_by_user(username, limit, offset).await
    }

    async fn list_uploads_by_router(
        &self,
        router: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)> {
        self.inner.list_uploads_by_router(router, limit, offset).await
    }

    async fn stats_by_user(&self, username: &str) -> AuditResult<UploadStats> {
        self.inner.stats_by_user(username).await
    }

    async fn stats_by_router(&self, router: &str) -> AuditResult<UploadStats> {
        self.inner.stats_by_router(router).await
    }

    async fn create_download(&self, record: &FileDownloadRecord) -> AuditResult<()> {
        self.check()?;
        self.inner.create_download(record).await
    }

    async fn ping(&self) -> AuditResult<()> {
        self.inner.ping().await
    }
}
