//! S3-compatible backend (MinIO, AWS S3) on the AWS SDK.
//!
//! Two SDK clients are kept: one bound to the internal endpoint (all data
//! operations plus internal presigning) and one bound to the external endpoint.
//! SigV4 signs the Host header, so each URL view must be presigned by the
//! client that targets that host.

use crate::{
    backends::{BlobBackend, ByteStream, ObjectStream, PresignedUrls, PutOutcome, ResponseOverrides},
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    models::{BackendKind, ObjectInfo, SdkConfig, UploadCredentials, UploadSource},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    presigning::PresigningConfig,
    primitives::{ByteStream as SdkByteStream, DateTime as SdkDateTime},
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration,
    },
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

/// Objects larger than this are written with multipart upload.
const MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Part size once multipart is engaged. S3 requires at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

pub struct S3Backend {
    kind: BackendKind,
    client: Client,
    public_client: Client,
    endpoint: String,
    public_endpoint: String,
    region: String,
    access_key: String,
    secret_key: String,
    cdn_domain: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl S3Backend {
    pub fn new(kind: BackendKind, config: &StorageConfig) -> StorageResult<Self> {
        if config.access_key.is_empty() != config.secret_key.is_empty() {
            return Err(StorageError::BadRequest(
                "s3 config requires both access_key and secret_key when either is set".into(),
            ));
        }

        let endpoint = normalize_endpoint(&config.endpoint, config.use_ssl);
        let public_endpoint = normalize_endpoint(config.external_endpoint(), config.use_ssl);
        // AWS S3 proper wants virtual-hosted addressing.
        let path_style = match kind {
            BackendKind::Minio => true,
            _ => config.force_path_style,
        };

        let client = build_client(
            &endpoint,
            &config.region,
            &config.access_key,
            &config.secret_key,
            path_style,
        );
        let public_client = if public_endpoint == endpoint {
            client.clone()
        } else {
            build_client(
                &public_endpoint,
                &config.region,
                &config.access_key,
                &config.secret_key,
                path_style,
            )
        };

        Ok(Self {
            kind,
            client,
            public_client,
            endpoint,
            public_endpoint,
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            cdn_domain: config.cdn_domain.clone(),
        })
    }

    /// Native client from credentials embedded in an upload credential bundle.
    pub fn from_sdk_config(sdk: &SdkConfig) -> StorageResult<Self> {
        let config = StorageConfig {
            backend: BackendKind::Minio.to_string(),
            bucket: sdk.bucket.clone(),
            region: if sdk.region.is_empty() {
                "us-east-1".into()
            } else {
                sdk.region.clone()
            },
            endpoint: sdk.endpoint_url(),
            public_endpoint: None,
            access_key: sdk.access_key.clone(),
            secret_key: sdk.secret_key.clone(),
            use_ssl: sdk.use_ssl,
            ..StorageConfig::default()
        };
        Self::new(BackendKind::Minio, &config)
    }

    fn has_split(&self) -> bool {
        self.public_endpoint != self.endpoint
    }

    async fn start_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> StorageResult<MultipartUpload> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::BackendUnavailable("S3 did not return upload_id".into()))?
            .to_string();
        debug!(key = %key, upload_id = %upload_id, "started multipart upload");
        Ok(MultipartUpload {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload: &mut MultipartUpload,
        data: Bytes,
    ) -> StorageResult<()> {
        let part_number = upload.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key = %key, error = %DisplayErrorContext(&err), "failed to abort multipart upload");
        }
    }

    /// Buffer the body; switch to multipart once it outgrows the threshold.
    async fn drive_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        mut body: ByteStream,
        multipart: &mut Option<MultipartUpload>,
    ) -> StorageResult<PutOutcome> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);

            if multipart.is_none() && buffer.len() >= MULTIPART_THRESHOLD {
                *multipart = Some(self.start_multipart(bucket, key, content_type).await?);
            }
            if let Some(upload) = multipart.as_mut() {
                while buffer.len() >= PART_SIZE {
                    let part = buffer.split_to(PART_SIZE).freeze();
                    self.upload_part(bucket, key, upload, part).await?;
                }
            }
        }

        let Some(upload) = multipart.as_mut() else {
            let data = buffer.freeze();
            let output = self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .content_length(data.len() as i64)
                .body(SdkByteStream::from(data))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;
            return Ok(PutOutcome {
                etag: unquote(output.e_tag().unwrap_or_default()),
            });
        };

        if !buffer.is_empty() {
            let rest = buffer.split().freeze();
            self.upload_part(bucket, key, upload, rest).await?;
        }
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(upload.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        info!(key = %key, parts = upload.parts.len(), "completed multipart upload");
        Ok(PutOutcome {
            etag: unquote(output.e_tag().unwrap_or_default()),
        })
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<UploadCredentials> {
        let external = self
            .public_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let server_url = if self.has_split() {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .presigned(presigning(ttl)?)
                .await
                .map_err(|e| map_sdk_error(e, key))?
                .uri()
                .to_string()
        } else {
            external.uri().to_string()
        };

        let mut headers: HashMap<String, String> = external
            .headers()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        headers.retain(|name, _| !name.eq_ignore_ascii_case("content-type"));
        headers.insert("Content-Type".into(), content_type.to_string());

        let mut creds = UploadCredentials {
            key: key.to_string(),
            bucket: bucket.to_string(),
            method: self.upload_method(),
            storage: self.kind.to_string(),
            url: external.uri().to_string(),
            server_url,
            headers,
            cdn_domain: self.cdn_domain.clone(),
            ..Default::default()
        };
        let url = creds.url.clone();
        creds.set_upload_target(&url);
        Ok(creds)
    }

    #[instrument(skip(self, overrides), fields(backend = "s3"))]
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<PresignedUrls> {
        let presign_with = |client: &Client| {
            client
                .get_object()
                .bucket(bucket)
                .key(key)
                .set_response_cache_control(overrides.cache_control.clone())
                .set_response_content_disposition(overrides.content_disposition.clone())
                .set_response_expires(overrides.expires.map(|at| SdkDateTime::from_secs(at.timestamp())))
        };

        let external = presign_with(&self.public_client)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| map_sdk_error(e, key))?
            .uri()
            .to_string();
        let internal = if self.has_split() {
            presign_with(&self.client)
                .presigned(presigning(ttl)?)
                .await
                .map_err(|e| map_sdk_error(e, key))?
                .uri()
                .to_string()
        } else {
            external.clone()
        };

        Ok(PresignedUrls { external, internal })
    }

    #[instrument(skip(self, body), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> StorageResult<PutOutcome> {
        let mut multipart = None;
        match self
            .drive_upload(bucket, key, content_type, body, &mut multipart)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Some(upload) = multipart {
                    self.abort_multipart(bucket, key, &upload.upload_id).await;
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let reader = output.body.into_async_read();
        Ok(Box::pin(ReaderStream::new(reader)))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
            etag: unquote(output.e_tag().unwrap_or_default()),
            last_modified: output.last_modified().map(to_chrono).unwrap_or_default(),
        })
    }

    fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> ObjectStream {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation_token.take());
                if !recursive {
                    request = request.delimiter("/");
                }

                let output = request
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, &prefix))?;

                for obj in output.contents() {
                    if let Some(key) = obj.key() {
                        yield ObjectInfo {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            content_type: String::new(),
                            etag: unquote(obj.e_tag().unwrap_or_default()),
                            last_modified: obj.last_modified().map(to_chrono).unwrap_or_default(),
                        };
                    }
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
        };

        Box::pin(stream)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        match self
            .client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if status_of(&err) == Some(404) => Ok(()),
            Err(err) => Err(map_sdk_error(err, key)),
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if status_of(&err) == Some(404) => Ok(false),
            Err(err) => Err(map_sdk_error(err, bucket)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> StorageResult<()> {
        if self.bucket_exists(bucket).await? {
            debug!(bucket = %bucket, "bucket already present");
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(bucket);
        if !region.is_empty() && region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %bucket, region = %region, "created bucket");
                Ok(())
            }
            // Lost a creation race with another replica.
            Err(err) if status_of(&err) == Some(409) => Ok(()),
            Err(err) => Err(map_sdk_error(err, bucket)),
        }
    }

    fn cdn_domain(&self) -> Option<String> {
        self.cdn_domain.clone()
    }

    fn upload_endpoint(&self, source: UploadSource) -> String {
        match source {
            UploadSource::Server if self.has_split() => self.endpoint.clone(),
            _ => String::new(),
        }
    }

    fn sdk_config(&self, bucket: &str) -> Option<SdkConfig> {
        if self.access_key.is_empty() {
            return None;
        }
        let use_ssl = self.endpoint.starts_with("https://");
        let endpoint = self
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Some(SdkConfig {
            endpoint,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
            use_ssl,
            bucket: bucket.to_string(),
        })
    }
}

fn build_client(
    endpoint: &str,
    region: &str,
    access_key: &str,
    secret_key: &str,
    force_path_style: bool,
) -> Client {
    let region = if region.is_empty() { "us-east-1" } else { region };
    let mut builder = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .force_path_style(force_path_style);

    if !endpoint.is_empty() {
        builder = builder.endpoint_url(endpoint);
    }
    if !access_key.is_empty() {
        builder = builder.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "tenant-storage",
        ));
    }

    Client::from_conf(builder.build())
}

/// Prepend a scheme to bare `host:port` endpoints and drop trailing slashes.
fn normalize_endpoint(endpoint: &str, use_ssl: bool) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else if use_ssl {
        format!("https://{}", trimmed)
    } else {
        format!("http://{}", trimmed)
    }
}

fn presigning(ttl: Duration) -> StorageResult<PresigningConfig> {
    PresigningConfig::expires_in(ttl)
        .map_err(|e| StorageError::BadRequest(format!("invalid presign expiry: {}", e)))
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
        _ => None,
    }
}

/// Map an SDK error to a storage error, keeping 404 as `NotFound`.
fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if status_of(&err) == Some(404) {
        return StorageError::NotFound(key.to_string());
    }
    StorageError::BackendUnavailable(DisplayErrorContext(&err).to_string())
}

fn unquote(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn to_chrono(dt: &SdkDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            endpoint: "minio.svc.cluster.local:9000".into(),
            public_endpoint: Some("https://files.example.com".into()),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn presign_put_produces_both_views() {
        let backend = S3Backend::new(BackendKind::Minio, &config()).unwrap();
        let creds = backend
            .presign_put("files", "t1/app/2025/01/03/x.csv", "text/csv", Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(creds.method, crate::models::UploadMethod::PresignedUrl);
        assert!(creds.url.starts_with("https://files.example.com/files/t1/app/"));
        assert!(creds
            .server_url
            .starts_with("http://minio.svc.cluster.local:9000/files/t1/app/"));
        assert!(creds.url.contains("X-Amz-Signature="));
        assert_eq!(creds.content_type(), Some("text/csv"));
        assert_eq!(creds.upload_host, "files.example.com");
        assert_eq!(creds.upload_domain, "https://files.example.com");
    }

    #[tokio::test]
    async fn presign_get_passes_response_overrides() {
        let backend = S3Backend::new(BackendKind::Minio, &config()).unwrap();
        let overrides = ResponseOverrides {
            content_disposition: Some("attachment; filename=\"x.csv\"".into()),
            cache_control: Some("no-cache".into()),
            expires: None,
        };
        let urls = backend
            .presign_get("files", "t1/x.csv", Duration::from_secs(60), &overrides)
            .await
            .unwrap();
        assert!(urls.external.contains("response-content-disposition="));
        assert!(urls.external.contains("response-cache-control=no-cache"));
        assert!(urls.internal.starts_with("http://minio.svc.cluster.local:9000/"));
    }

    #[test]
    fn endpoint_normalization_and_server_override() {
        assert_eq!(normalize_endpoint("minio:9000", false), "http://minio:9000");
        assert_eq!(normalize_endpoint("minio:9000/", true), "https://minio:9000");
        assert_eq!(normalize_endpoint("", true), "");

        let backend = S3Backend::new(BackendKind::Minio, &config()).unwrap();
        assert_eq!(
            backend.upload_endpoint(UploadSource::Server),
            "http://minio.svc.cluster.local:9000"
        );
        assert_eq!(backend.upload_endpoint(UploadSource::Browser), "");

        let sdk = backend.sdk_config("files").unwrap();
        assert_eq!(sdk.endpoint, "minio.svc.cluster.local:9000");
        assert!(!sdk.use_ssl);
        assert!(sdk.is_complete());
    }

    #[test]
    fn partial_credentials_are_rejected() {
        let cfg = StorageConfig {
            access_key: "ak".into(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            S3Backend::new(BackendKind::AwsS3, &cfg),
            Err(StorageError::BadRequest(_))
        ));
    }
}
