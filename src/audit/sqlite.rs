use crate::{
    audit::{AuditResult, AuditStore},
    models::{FileDownloadRecord, FileUploadRecord, UploadStats, UploadStatus},
};
use async_trait::async_trait;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const UPLOAD_COLUMNS: &str = "id, file_key, router, file_name, file_size, content_type, hash, \
                              username, tenant, status, uploaded_at";

/// Run the embedded schema; every statement is `IF NOT EXISTS`.
pub async fn run_migrations(db: &Pool<Sqlite>) -> AuditResult<usize> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

/// Ledger backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteAuditStore {
    db: Arc<Pool<Sqlite>>,
}

impl SqliteAuditStore {
    pub fn new(db: Arc<Pool<Sqlite>>) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> AuditResult<usize> {
        run_migrations(&self.db).await
    }
}

/// Bind values for `router = ? OR substr(router, 1, ?) = ?`.
fn router_scope(router: &str) -> (String, i64, String) {
    let router = router.trim_matches('/').to_string();
    let nested = format!("{}/", router);
    let len = nested.chars().count() as i64;
    (router, len, nested)
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn create_upload(&self, record: &FileUploadRecord) -> AuditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_uploads (
                file_key, router, file_name, file_size, content_type,
                hash, username, tenant, status, uploaded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.file_key)
        .bind(&record.router)
        .bind(&record.file_name)
        .bind(record.file_size)
        .bind(&record.content_type)
        .bind(&record.hash)
        .bind(&record.username)
        .bind(&record.tenant)
        .bind(record.status)
        .bind(record.uploaded_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn update_status(&self, key: &str, status: UploadStatus) -> AuditResult<bool> {
        let result = sqlx::query("UPDATE file_uploads SET status = ? WHERE file_key = ?")
            .bind(status)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_upload(&self, key: &str) -> AuditResult<Option<FileUploadRecord>> {
        let sql = format!("SELECT {} FROM file_uploads WHERE file_key = ?", UPLOAD_COLUMNS);
        let row = sqlx::query_as::<_, FileUploadRecord>(&sql)
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn list_uploads_by_user(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)> {
        let sql = format!(
            "SELECT {} FROM file_uploads
             WHERE status = ? AND username = ?
             ORDER BY uploaded_at DESC, id DESC
             LIMIT ? OFFSET ?",
            UPLOAD_COLUMNS
        );
        let rows = sqlx::query_as::<_, FileUploadRecord>(&sql)
            .bind(UploadStatus::Completed)
            .bind(username)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.db)
            .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_uploads WHERE status = ? AND username = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(username)
        .fetch_one(&*self.db)
        .await?;

        Ok((rows, total))
    }

    async fn list_uploads_by_router(
        &self,
        router: &str,
        limit: i64,
        offset: i64,
    ) -> AuditResult<(Vec<FileUploadRecord>, i64)> {
        let (exact, len, nested) = router_scope(router);
        let sql = format!(
            "SELECT {} FROM file_uploads
             WHERE status = ? AND (router = ? OR substr(router, 1, ?) = ?)
             ORDER BY uploaded_at DESC, id DESC
             LIMIT ? OFFSET ?",
            UPLOAD_COLUMNS
        );
        let rows = sqlx::query_as::<_, FileUploadRecord>(&sql)
            .bind(UploadStatus::Completed)
            .bind(&exact)
            .bind(len)
            .bind(&nested)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.db)
            .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_uploads
             WHERE status = ? AND (router = ? OR substr(router, 1, ?) = ?)",
        )
        .bind(UploadStatus::Completed)
        .bind(&exact)
        .bind(len)
        .bind(&nested)
        .fetch_one(&*self.db)
        .await?;

        Ok((rows, total))
    }

    async fn stats_by_user(&self, username: &str) -> AuditResult<UploadStats> {
        let (file_count, total_size): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM file_uploads
             WHERE status = ? AND username = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(username)
        .fetch_one(&*self.db)
        .await?;
        Ok(UploadStats {
            file_count,
            total_size,
        })
    }

    async fn stats_by_router(&self, router: &str) -> AuditResult<UploadStats> {
        let (exact, len, nested) = router_scope(router);
        let (file_count, total_size): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM file_uploads
             WHERE status = ? AND (router = ? OR substr(router, 1, ?) = ?)",
        )
        .bind(UploadStatus::Completed)
        .bind(&exact)
        .bind(len)
        .bind(&nested)
        .fetch_one(&*self.db)
        .await?;
        Ok(UploadStats {
            file_count,
            total_size,
        })
    }

    async fn create_download(&self, record: &FileDownloadRecord) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO file_downloads (file_key, username, ip_address, user_agent, downloaded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.file_key)
        .bind(&record.username)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.downloaded_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> AuditResult<()> {
        sqlx::query("SELECT 1").execute(&*self.db).await?;
        Ok(())
    }
}
