//! Upload orchestrator: hash, fetch credentials, transfer, report completion.

use crate::{
    models::{FileDescriptor, UploadCredentials, UploadResult, UploadSource},
    sdk::{SdkError, SdkResult, StorageApi, UploadAdapter},
    services::storage_service::{
        BatchCompleteItem, BatchCompleteRequest, BatchUploadRequest, CompleteRequest,
        MAX_BATCH_SIZE, UploadRequest,
    },
};
use chrono::Utc;
use futures::{StreamExt, stream};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{info, warn};

const HASH_BUFFER: usize = 256 * 1024;
const DEFAULT_HASH_CONCURRENCY: usize = 8;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Result of a batch upload: descriptors for the files that made it, in
/// input order, plus a human-readable summary naming the ones that did not.
#[derive(Debug, Clone, Default)]
pub struct BatchUploadOutcome {
    pub files: Vec<FileDescriptor>,
    pub failed: usize,
    pub remark: String,
}

/// A local file after stat and hashing.
#[derive(Debug, Clone)]
struct Prepared {
    path: PathBuf,
    source_name: String,
    size: u64,
    hash: String,
    content_type: String,
}

impl Prepared {
    fn request(&self, router: &str) -> UploadRequest {
        UploadRequest {
            file_name: self.source_name.clone(),
            content_type: self.content_type.clone(),
            file_size: self.size,
            router: router.to_string(),
            hash: Some(self.hash.clone()),
            upload_source: Some(UploadSource::Server),
        }
    }

    fn descriptor(&self, creds: &UploadCredentials, result: &UploadResult, url: &str) -> FileDescriptor {
        FileDescriptor {
            name: result.key.clone(),
            source_name: self.source_name.clone(),
            storage: creds.storage.clone(),
            hash: self.hash.clone(),
            size: self.size,
            upload_ts: Utc::now().timestamp(),
            local_path: self.path.display().to_string(),
            is_uploaded: true,
            url: url.to_string(),
            server_url: result.server_download_url.clone(),
            downloaded: true,
        }
    }
}

/// SHA-256 (lowercase hex) and byte length of a file, in one pass.
pub async fn sha256_file(path: &Path) -> SdkResult<(String, u64)> {
    let mut file = File::open(path).await.map_err(|e| SdkError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| SdkError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

async fn prepare(path: &Path) -> SdkResult<Prepared> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| SdkError::io(path, e))?;
    if !meta.is_file() {
        return Err(SdkError::InvalidInput(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let (hash, size) = sha256_file(path).await?;
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let content_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    Ok(Prepared {
        path: path.to_path_buf(),
        source_name,
        size,
        hash,
        content_type,
    })
}

pub struct Uploader {
    api: Arc<dyn StorageApi>,
    adapter: UploadAdapter,
    hash_concurrency: usize,
    upload_concurrency: usize,
}

impl Uploader {
    pub fn new(api: Arc<dyn StorageApi>) -> SdkResult<Self> {
        Ok(Self {
            api,
            adapter: UploadAdapter::new()?,
            hash_concurrency: DEFAULT_HASH_CONCURRENCY,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        })
    }

    pub fn with_concurrency(mut self, hash: usize, upload: usize) -> Self {
        self.hash_concurrency = hash.max(1);
        self.upload_concurrency = upload.max(1);
        self
    }

    /// Upload one file under `router` and report the outcome to the service.
    pub async fn upload_file(&self, path: &Path, router: &str) -> SdkResult<FileDescriptor> {
        let prepared = prepare(path).await?;
        let creds = self.api.upload_token(&prepared.request(router)).await?;

        let result = self
            .adapter
            .upload(&creds, &prepared.path, prepared.size, &prepared.hash)
            .await;

        let complete = CompleteRequest {
            key: creds.key.clone(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        let completion = self.api.upload_complete(&complete).await;

        let result = result?;
        let url = match completion {
            Ok(resp) if !resp.download_url.is_empty() => resp.download_url,
            Ok(_) => result.download_url.clone(),
            Err(err) => {
                warn!(key = %creds.key, error = %err, "upload completion not acknowledged");
                result.download_url.clone()
            }
        };
        Ok(prepared.descriptor(&creds, &result, &url))
    }

    /// Upload up to [`MAX_BATCH_SIZE`] files under `router`.
    ///
    /// Files that cannot be read or uploaded are left out of `files` and named
    /// in `remark`; only failures of the credential request abort the batch.
    pub async fn upload_files(
        &self,
        paths: &[PathBuf],
        router: &str,
    ) -> SdkResult<BatchUploadOutcome> {
        if paths.is_empty() {
            return Err(SdkError::InvalidInput("no files to upload".into()));
        }
        if paths.len() > MAX_BATCH_SIZE {
            return Err(SdkError::InvalidInput(format!(
                "at most {} files per batch, got {}",
                MAX_BATCH_SIZE,
                paths.len()
            )));
        }

        let mut failures: Vec<String> = Vec::new();

        let hashed: Vec<SdkResult<Prepared>> = stream::iter(paths.iter())
            .map(|path| prepare(path))
            .buffered(self.hash_concurrency)
            .collect()
            .await;
        let mut prepared = Vec::with_capacity(hashed.len());
        for (path, item) in paths.iter().zip(hashed) {
            match item {
                Ok(p) => prepared.push(p),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable file");
                    failures.push(format!("{} ({})", path.display(), err));
                }
            }
        }

        if prepared.is_empty() {
            return Ok(BatchUploadOutcome {
                files: Vec::new(),
                failed: failures.len(),
                remark: remark(0, paths.len(), &failures),
            });
        }

        let batch = BatchUploadRequest {
            files: prepared.iter().map(|p| p.request(router)).collect(),
            upload_source: Some(UploadSource::Server),
        };
        let credentials = self.api.batch_upload_token(&batch).await?;
        if credentials.len() != prepared.len() {
            return Err(SdkError::Gateway {
                code: -500,
                msg: format!(
                    "expected {} credentials, got {}",
                    prepared.len(),
                    credentials.len()
                ),
            });
        }

        let adapter = &self.adapter;
        let transfers: Vec<(Prepared, UploadCredentials, SdkResult<UploadResult>)> =
            stream::iter(prepared.into_iter().zip(credentials))
                .map(|(file, creds)| async move {
                    let result = adapter
                        .upload(&creds, &file.path, file.size, &file.hash)
                        .await;
                    (file, creds, result)
                })
                .buffered(self.upload_concurrency)
                .collect()
                .await;

        let items: Vec<BatchCompleteItem> = transfers
            .iter()
            .map(|(file, creds, result)| BatchCompleteItem {
                key: creds.key.clone(),
                success: result.is_ok(),
                router: Some(router.to_string()),
                file_name: Some(file.source_name.clone()),
                hash: Some(file.hash.clone()),
                error: result.as_ref().err().map(|e| e.to_string()),
            })
            .collect();

        let mut completed_urls: HashMap<String, String> = HashMap::new();
        for chunk in items.chunks(MAX_BATCH_SIZE) {
            let req = BatchCompleteRequest {
                items: chunk.to_vec(),
            };
            match self.api.batch_upload_complete(&req).await {
                Ok(results) => {
                    for r in results.into_iter().filter(|r| r.success) {
                        if !r.download_url.is_empty() {
                            completed_urls.insert(r.key, r.download_url);
                        }
                    }
                }
                Err(err) => warn!(error = %err, count = chunk.len(), "batch completion failed"),
            }
        }

        let total = paths.len();
        let mut files = Vec::new();
        for (file, creds, result) in transfers {
            match result {
                Ok(result) => {
                    let url = completed_urls
                        .get(&result.key)
                        .cloned()
                        .unwrap_or_else(|| result.download_url.clone());
                    files.push(file.descriptor(&creds, &result, &url));
                }
                Err(err) => {
                    warn!(path = %file.path.display(), error = %err, "upload failed");
                    failures.push(format!("{} ({})", file.source_name, err));
                }
            }
        }

        info!(router = %router, uploaded = files.len(), failed = failures.len(), "batch upload finished");
        Ok(BatchUploadOutcome {
            remark: remark(files.len(), total, &failures),
            failed: failures.len(),
            files,
        })
    }
}

fn remark(uploaded: usize, total: usize, failures: &[String]) -> String {
    if failures.is_empty() {
        format!("uploaded {} of {} files", uploaded, total)
    } else {
        format!(
            "uploaded {} of {} files; {} failed: {}",
            uploaded,
            total,
            failures.len(),
            failures.join(", ")
        )
    }
}
