//! Moves one local file to the backend named by a set of upload credentials.
//!
//! Complete `sdk_config` means a native S3 client is built and the file is
//! streamed with `put_stream`; otherwise the file is PUT to the presigned
//! `server_url` (falling back to `url`).

use crate::{
    backends::{BlobBackend, S3Backend},
    models::{UploadCredentials, UploadResult},
    sdk::{SdkError, SdkResult},
};
use reqwest::{StatusCode, header};
use std::{path::Path, time::Duration};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Body chunk size for streamed PUTs.
const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Clone)]
pub struct UploadAdapter {
    http: reqwest::Client,
}

impl UploadAdapter {
    pub fn new() -> SdkResult<Self> {
        // Compression stays off: no gzip/brotli features are enabled on reqwest.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(10 * 60))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(90))
            .build()?;
        Ok(Self { http })
    }

    /// Upload `path` (`size` bytes, SHA-256 `hash`) with `creds`.
    pub async fn upload(
        &self,
        creds: &UploadCredentials,
        path: &Path,
        size: u64,
        hash: &str,
    ) -> SdkResult<UploadResult> {
        let content_type = creds
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let etag = match creds.sdk_config.as_ref().filter(|c| c.is_complete()) {
            Some(sdk) => {
                let backend = S3Backend::from_sdk_config(sdk)?;
                let bucket = if sdk.bucket.is_empty() {
                    &creds.bucket
                } else {
                    &sdk.bucket
                };
                let file = File::open(path).await.map_err(|e| SdkError::io(path, e))?;
                let body = Box::pin(ReaderStream::with_capacity(file, CHUNK_SIZE));
                let outcome = backend
                    .put_stream(bucket, &creds.key, body, size, &content_type)
                    .await?;
                debug!(key = %creds.key, "uploaded through native client");
                outcome.etag
            }
            None => self.put(creds, path, size, &content_type).await?,
        };

        info!(key = %creds.key, size, "upload finished");
        Ok(UploadResult {
            key: creds.key.clone(),
            etag,
            hash: hash.to_string(),
            size,
            content_type,
            download_url: creds.download_url.clone(),
            server_download_url: creds.server_download_url.clone(),
        })
    }

    async fn put(
        &self,
        creds: &UploadCredentials,
        path: &Path,
        size: u64,
        content_type: &str,
    ) -> SdkResult<String> {
        let target = if creds.server_url.is_empty() {
            &creds.url
        } else {
            &creds.server_url
        };
        if target.is_empty() {
            return Err(SdkError::InvalidInput(format!(
                "credentials for `{}` carry no upload url",
                creds.key
            )));
        }

        let file = File::open(path).await.map_err(|e| SdkError::io(path, e))?;
        let stream = ReaderStream::with_capacity(file, CHUNK_SIZE);

        let mut req = self
            .http
            .put(target)
            .header(header::CONTENT_LENGTH, size)
            .header(header::CONTENT_TYPE, content_type);
        for (name, value) in &creds.headers {
            if !name.eq_ignore_ascii_case("content-type") {
                req = req.header(name.as_str(), value.as_str());
            }
        }

        let response = req.body(reqwest::Body::wrap_stream(stream)).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::UploadRejected {
                status: status.as_u16(),
                body,
            });
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(unquote)
            .unwrap_or_default();
        debug!(key = %creds.key, status = %status, "presigned PUT accepted");
        Ok(etag)
    }
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}
