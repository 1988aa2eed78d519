//! src/services/storage_service.rs
//!
//! StorageService: tenant-scoped upload credentials, download URLs, proxied
//! downloads and prefix housekeeping on top of one blob backend, with every
//! upload and download written to the audit ledger. Ledger failures are logged
//! and never fail the data plane.

use crate::{
    audit::AuditStore,
    backends::{BlobBackend, ByteStream, ResponseOverrides, collect_objects},
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    keys,
    models::{
        FileDownloadRecord, FileUploadRecord, ObjectInfo, UploadCredentials, UploadMethod,
        UploadSource, UploadStats, UploadStatus, format_expire,
    },
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Lifetime of every download URL handed out by the service.
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound on files per batch request.
pub const MAX_BATCH_SIZE: usize = 100;

/// One file in an upload-token request.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default)]
    pub content_type: String,
    pub file_size: u64,
    pub router: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_source: Option<UploadSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BatchUploadRequest {
    pub files: Vec<UploadRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_source: Option<UploadSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CompleteRequest {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CompleteResponse {
    pub download_url: String,
    pub expire: String,
}

/// One entry of a batch completion. `router` and `file_name` let the service
/// backfill a ledger row for uploads that never went through credential issuance.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BatchCompleteItem {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BatchCompleteRequest {
    pub items: Vec<BatchCompleteItem>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BatchCompleteResult {
    pub key: String,
    pub success: bool,
    pub download_url: String,
    pub expire: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DownloadUrls {
    pub url: String,
    pub server_url: String,
    pub expire: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileListing {
    pub router: String,
    pub files: Vec<String>,
    pub count: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PrefixStats {
    pub file_count: u64,
    pub total_size: u64,
    pub size_human: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DeleteSummary {
    pub deleted_count: u64,
    #[serde(default)]
    pub failed_keys: Vec<String>,
}

/// Completed-upload listing from the audit ledger.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadRecordPage {
    pub records: Vec<FileUploadRecord>,
    pub total: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerStats {
    pub file_count: i64,
    pub total_size: i64,
    pub size_human: String,
}

/// Whose uploads a ledger query covers.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordScope {
    Router(String),
    User(String),
}

/// Authority the caller reached us through; used to build proxy URLs.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl RequestOrigin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// `{scheme}://{host}/api/v1/storage/download/{escaped key}`
    pub fn download_url(&self, key: &str) -> String {
        format!(
            "{}://{}/api/v1/storage/download/{}",
            self.scheme,
            self.host,
            keys::escape_key(key)
        )
    }
}

/// Who fetched an object through the proxy.
#[derive(Clone, Debug, Default)]
pub struct DownloadContext {
    pub username: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
}

/// An open proxied download: headers are known before the body is polled.
pub struct ProxyDownload {
    pub info: ObjectInfo,
    pub filename: String,
    pub body: ByteStream,
}

impl ProxyDownload {
    pub fn content_disposition(&self) -> String {
        keys::content_disposition(&self.filename)
    }
}

/// Facade over one blob backend and the audit ledger. Holds no locks; clones
/// share the backend client and ledger pool.
#[derive(Clone)]
pub struct StorageService {
    backend: Arc<dyn BlobBackend>,
    audit: Arc<dyn AuditStore>,
    bucket: String,
    region: String,
    max_file_size_mb: u64,
    max_file_size: u64,
    upload_ttl: Duration,
    expose_sdk_config: bool,
}

impl StorageService {
    pub fn new(
        backend: Arc<dyn BlobBackend>,
        audit: Arc<dyn AuditStore>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            backend,
            audit,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            max_file_size_mb: config.max_file_size_mb,
            max_file_size: config.max_file_size_bytes(),
            upload_ttl: Duration::from_secs(config.upload_ttl_secs),
            expose_sdk_config: config.expose_sdk_config,
        }
    }

    /// Create the default bucket when absent. Called once at startup.
    pub async fn init(&self) -> StorageResult<()> {
        self.backend.ensure_bucket(&self.bucket, &self.region).await?;
        info!(bucket = %self.bucket, backend = %self.backend.kind(), "storage bucket ready");
        Ok(())
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Reject a request before any key is minted. Returns `(router, tenant)`.
    fn validate(&self, req: &UploadRequest) -> StorageResult<(String, String)> {
        if req.file_size > self.max_file_size {
            return Err(StorageError::FileTooLarge {
                size: req.file_size,
                max_mb: self.max_file_size_mb,
            });
        }
        if req.file_name.trim().is_empty() {
            return Err(StorageError::BadRequest("file_name is required".into()));
        }
        let router = keys::normalize_router(&req.router);
        let tenant = keys::tenant_of(&router);
        if router.is_empty() || tenant.is_empty() {
            return Err(StorageError::BadRequest("router is required".into()));
        }
        Ok((router, tenant))
    }

    fn attachment(key: &str) -> ResponseOverrides {
        ResponseOverrides {
            content_disposition: Some(keys::content_disposition(keys::basename(key))),
            ..ResponseOverrides::default()
        }
    }

    /// Mint short-lived credentials for one upload and record a pending row.
    pub async fn issue_upload_credentials(
        &self,
        req: &UploadRequest,
        source: UploadSource,
        username: &str,
    ) -> StorageResult<UploadCredentials> {
        let (router, tenant) = self.validate(req)?;
        self.mint(req, router, tenant, source, username).await
    }

    async fn mint(
        &self,
        req: &UploadRequest,
        router: String,
        tenant: String,
        source: UploadSource,
        username: &str,
    ) -> StorageResult<UploadCredentials> {
        let now = Utc::now();
        let key = keys::key_for(&router, &req.file_name, now);
        let content_type = if req.content_type.trim().is_empty() {
            "application/octet-stream".to_string()
        } else {
            req.content_type.clone()
        };

        let mut creds = self
            .backend
            .presign_put(&self.bucket, &key, &content_type, self.upload_ttl)
            .await?;

        if source == UploadSource::Server {
            let endpoint = self.backend.upload_endpoint(source);
            let target = if endpoint.is_empty() {
                creds.server_url.clone()
            } else {
                endpoint
            };
            if !target.is_empty() {
                creds.set_upload_target(&target);
            }
            if self.expose_sdk_config {
                if let Some(sdk) = self.backend.sdk_config(&self.bucket) {
                    creds.method = UploadMethod::SdkUpload;
                    creds.sdk_config = Some(sdk);
                }
            }
        }

        let expires_at = now + ChronoDuration::seconds(self.upload_ttl.as_secs() as i64);
        creds.expires_at = Some(expires_at);
        creds.expire = format_expire(expires_at);
        if creds.cdn_domain.is_none() {
            creds.cdn_domain = self.backend.cdn_domain();
        }

        let urls = self
            .backend
            .presign_get(&self.bucket, &key, DOWNLOAD_URL_TTL, &Self::attachment(&key))
            .await?;
        creds.download_url = urls.external;
        creds.server_download_url = urls.internal;

        let record = FileUploadRecord {
            id: 0,
            file_key: key.clone(),
            router,
            file_name: req.file_name.clone(),
            file_size: req.file_size as i64,
            content_type,
            hash: req.hash.clone().unwrap_or_default(),
            username: username.to_string(),
            tenant: tenant.clone(),
            status: UploadStatus::Pending,
            uploaded_at: now,
        };
        if let Err(err) = self.audit.create_upload(&record).await {
            warn!(key = %key, error = %err, "failed to record pending upload");
        }

        info!(
            key = %key,
            tenant = %tenant,
            size = req.file_size,
            method = ?creds.method,
            "issued upload credentials"
        );
        Ok(creds)
    }

    /// Credentials for up to [`MAX_BATCH_SIZE`] files, in input order. Nothing
    /// is minted unless every file passes validation.
    pub async fn issue_batch_upload_credentials(
        &self,
        batch: &BatchUploadRequest,
        username: &str,
    ) -> StorageResult<Vec<UploadCredentials>> {
        if batch.files.is_empty() {
            return Err(StorageError::BadRequest("files must not be empty".into()));
        }
        if batch.files.len() > MAX_BATCH_SIZE {
            return Err(StorageError::BadRequest(format!(
                "at most {} files per batch, got {}",
                MAX_BATCH_SIZE,
                batch.files.len()
            )));
        }

        let validated = batch
            .files
            .iter()
            .map(|file| self.validate(file).map(|scope| (file, scope)))
            .collect::<StorageResult<Vec<_>>>()?;

        try_join_all(validated.into_iter().map(|(file, (router, tenant))| {
            let source = file
                .upload_source
                .or(batch.upload_source)
                .unwrap_or_default();
            self.mint(file, router, tenant, source, username)
        }))
        .await
    }

    /// External and internal presigned GET URLs, valid for seven days.
    pub async fn issue_download_urls(&self, key: &str) -> StorageResult<DownloadUrls> {
        let key = required_key(key)?;
        let urls = self
            .backend
            .presign_get(&self.bucket, key, DOWNLOAD_URL_TTL, &Self::attachment(key))
            .await?;
        Ok(DownloadUrls {
            url: urls.external,
            server_url: urls.internal,
            expire: download_expire(),
        })
    }

    /// Head then open the object. The download is recorded on a detached task
    /// so a client disconnect cannot cancel the ledger write.
    pub async fn proxy_download(
        &self,
        key: &str,
        ctx: DownloadContext,
    ) -> StorageResult<ProxyDownload> {
        let key = required_key(key)?;
        let info = self.backend.head(&self.bucket, key).await?;
        let body = self.backend.get_stream(&self.bucket, key).await?;

        let audit = Arc::clone(&self.audit);
        let record = FileDownloadRecord {
            id: 0,
            file_key: key.to_string(),
            username: ctx.username,
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent,
            downloaded_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(err) = audit.create_download(&record).await {
                warn!(key = %record.file_key, error = %err, "failed to record download");
            }
        });

        Ok(ProxyDownload {
            filename: keys::basename(key).to_string(),
            info,
            body,
        })
    }

    /// Flip the ledger row to completed or failed. A missing row is not an error.
    pub async fn upload_complete(
        &self,
        req: &CompleteRequest,
        origin: &RequestOrigin,
    ) -> StorageResult<CompleteResponse> {
        let key = required_key(&req.key)?;
        self.mark(key, req.success, req.error.as_deref()).await;

        if !req.success {
            return Ok(CompleteResponse::default());
        }
        Ok(CompleteResponse {
            download_url: origin.download_url(key),
            expire: download_expire(),
        })
    }

    /// Returns whether a ledger row for `key` exists.
    async fn mark(&self, key: &str, success: bool, error: Option<&str>) -> bool {
        let status = if success {
            UploadStatus::Completed
        } else {
            UploadStatus::Failed
        };
        if let Some(reason) = error.filter(|_| !success) {
            warn!(key = %key, reason = %reason, "client reported failed upload");
        }
        match self.audit.update_status(key, status).await {
            Ok(true) => {
                debug!(key = %key, status = %status, "upload status updated");
                true
            }
            Ok(false) => {
                debug!(key = %key, "no ledger row for completed upload");
                false
            }
            // Unknown outcome; treat the row as present so it is not duplicated.
            Err(err) => {
                warn!(key = %key, error = %err, "failed to update upload status");
                true
            }
        }
    }

    /// Per-item completion for up to [`MAX_BATCH_SIZE`] uploads.
    pub async fn batch_upload_complete(
        &self,
        batch: &BatchCompleteRequest,
        origin: &RequestOrigin,
        username: &str,
    ) -> StorageResult<Vec<BatchCompleteResult>> {
        if batch.items.len() > MAX_BATCH_SIZE {
            return Err(StorageError::BadRequest(format!(
                "at most {} items per batch, got {}",
                MAX_BATCH_SIZE,
                batch.items.len()
            )));
        }

        let expire = download_expire();
        let mut results = Vec::with_capacity(batch.items.len());
        for item in &batch.items {
            let key = keys::clean_key(&item.key);
            if key.is_empty() {
                results.push(BatchCompleteResult {
                    key: item.key.clone(),
                    success: false,
                    error: Some("key is required".into()),
                    ..BatchCompleteResult::default()
                });
                continue;
            }

            let found = self.mark(key, item.success, item.error.as_deref()).await;
            if !found && item.success {
                self.backfill(key, item, username).await;
            }

            results.push(if item.success {
                BatchCompleteResult {
                    key: key.to_string(),
                    success: true,
                    download_url: origin.download_url(key),
                    expire: expire.clone(),
                    error: None,
                }
            } else {
                BatchCompleteResult {
                    key: key.to_string(),
                    success: false,
                    error: item.error.clone(),
                    ..BatchCompleteResult::default()
                }
            });
        }
        Ok(results)
    }

    /// Record a completed row for an upload the ledger never saw.
    async fn backfill(&self, key: &str, item: &BatchCompleteItem, username: &str) {
        let Some(router) = item.router.as_deref().map(keys::normalize_router) else {
            return;
        };
        let tenant = keys::tenant_of(&router);
        if tenant.is_empty() {
            return;
        }
        let info = match self.backend.head(&self.bucket, key).await {
            Ok(info) => info,
            Err(err) => {
                debug!(key = %key, error = %err, "skipping ledger backfill");
                return;
            }
        };
        let record = FileUploadRecord {
            id: 0,
            file_key: key.to_string(),
            router,
            file_name: item
                .file_name
                .clone()
                .unwrap_or_else(|| keys::basename(key).to_string()),
            file_size: info.size as i64,
            content_type: info.content_type,
            hash: item.hash.clone().unwrap_or_default(),
            username: username.to_string(),
            tenant,
            status: UploadStatus::Completed,
            uploaded_at: Utc::now(),
        };
        if let Err(err) = self.audit.create_upload(&record).await {
            warn!(key = %key, error = %err, "failed to backfill upload record");
        }
    }

    pub async fn get_info(&self, key: &str) -> StorageResult<ObjectInfo> {
        let key = required_key(key)?;
        self.backend.head(&self.bucket, key).await
    }

    async fn objects_under(&self, router: &str) -> StorageResult<(String, Vec<ObjectInfo>)> {
        let router = keys::normalize_router(router);
        if router.is_empty() {
            return Err(StorageError::BadRequest("router is required".into()));
        }
        let prefix = format!("{}/", router);
        let objects = collect_objects(self.backend.list(&self.bucket, &prefix, true)).await?;
        Ok((router, objects))
    }

    /// Every key beneath `{router}/`.
    pub async fn list_by_prefix(&self, router: &str) -> StorageResult<FileListing> {
        let (router, objects) = self.objects_under(router).await?;
        let files: Vec<String> = objects.into_iter().map(|o| o.key).collect();
        Ok(FileListing {
            router,
            count: files.len(),
            files,
        })
    }

    /// Count and bytes beneath `{router}/`, computed from a live listing.
    pub async fn stats_by_prefix(&self, router: &str) -> StorageResult<PrefixStats> {
        let (_, objects) = self.objects_under(router).await?;
        let total_size = objects.iter().map(|o| o.size).sum();
        Ok(PrefixStats {
            file_count: objects.len() as u64,
            total_size,
            size_human: human_size(total_size),
        })
    }

    /// Idempotent.
    pub async fn delete_by_key(&self, key: &str) -> StorageResult<()> {
        let key = required_key(key)?;
        self.backend.delete(&self.bucket, key).await?;
        info!(key = %key, "deleted object");
        Ok(())
    }

    /// Delete everything beneath `{router}/`. Per-object failures are logged
    /// and reported in `failed_keys`; they do not abort the sweep.
    pub async fn delete_by_prefix(&self, router: &str) -> StorageResult<DeleteSummary> {
        let (router, objects) = self.objects_under(router).await?;
        let mut summary = DeleteSummary::default();
        for object in objects {
            match self.backend.delete(&self.bucket, &object.key).await {
                Ok(()) => summary.deleted_count += 1,
                Err(err) => {
                    warn!(key = %object.key, error = %err, "failed to delete object");
                    summary.failed_keys.push(object.key);
                }
            }
        }
        info!(
            router = %router,
            deleted = summary.deleted_count,
            failed = summary.failed_keys.len(),
            "deleted objects by prefix"
        );
        Ok(summary)
    }

    pub async fn upload_records(
        &self,
        scope: &RecordScope,
        limit: i64,
        offset: i64,
    ) -> StorageResult<UploadRecordPage> {
        let (records, total) = match scope {
            RecordScope::Router(router) => {
                self.audit
                    .list_uploads_by_router(router, limit, offset)
                    .await?
            }
            RecordScope::User(user) => self.audit.list_uploads_by_user(user, limit, offset).await?,
        };
        Ok(UploadRecordPage { records, total })
    }

    pub async fn upload_record_stats(&self, scope: &RecordScope) -> StorageResult<LedgerStats> {
        let UploadStats {
            file_count,
            total_size,
        } = match scope {
            RecordScope::Router(router) => self.audit.stats_by_router(router).await?,
            RecordScope::User(user) => self.audit.stats_by_user(user).await?,
        };
        Ok(LedgerStats {
            file_count,
            total_size,
            size_human: human_size(total_size.max(0) as u64),
        })
    }

    pub async fn ledger_ready(&self) -> StorageResult<()> {
        self.audit.ping().await?;
        Ok(())
    }

    /// Default bucket reachable through the backend.
    pub async fn bucket_ready(&self) -> StorageResult<()> {
        if !self.backend.bucket_exists(&self.bucket).await? {
            return Err(StorageError::NotFound(format!("bucket `{}`", self.bucket)));
        }
        Ok(())
    }
}

fn download_expire() -> String {
    format_expire(Utc::now() + ChronoDuration::seconds(DOWNLOAD_URL_TTL.as_secs() as i64))
}

fn required_key(raw: &str) -> StorageResult<&str> {
    let key = keys::clean_key(raw);
    if key.is_empty() {
        return Err(StorageError::BadRequest("key is required".into()));
    }
    Ok(key)
}

/// Binary-unit rendering: `600 B`, `1.50 KB`, `3.25 MB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
