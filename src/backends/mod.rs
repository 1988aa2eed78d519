//! Blob backend abstraction and the factory that selects one by tag.
//!
//! A backend speaks one store's native protocol and always produces two views
//! of every URL: the external one (browsers) and the internal one (workloads
//! co-located with the store). Deployments without a network split return the
//! same URL twice.

pub mod local;
pub mod s3;

use crate::{
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    models::{BackendKind, ObjectInfo, SdkConfig, UploadCredentials, UploadMethod, UploadSource},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::{fmt, io, sync::Arc, time::Duration};

pub use local::LocalBackend;
pub use s3::S3Backend;

/// Streaming object payload.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Lazy, finite listing; ends after the first error.
pub type ObjectStream = BoxStream<'static, StorageResult<ObjectInfo>>;

/// Response headers a presigned GET asks the backend to send back.
#[derive(Clone, Debug, Default)]
pub struct ResponseOverrides {
    pub cache_control: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub content_disposition: Option<String>,
}

/// Both network views of one presigned URL.
#[derive(Clone, Debug, PartialEq)]
pub struct PresignedUrls {
    pub external: String,
    pub internal: String,
}

#[derive(Clone, Debug, Default)]
pub struct PutOutcome {
    pub etag: String,
}

#[async_trait]
pub trait BlobBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Presign a single PUT. Credentials come back with both URL views, the
    /// Content-Type header to echo, and the parsed upload host.
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<UploadCredentials>;

    /// Presign a GET. Existence is not checked.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<PresignedUrls>;

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> StorageResult<PutOutcome>;

    /// Open a streaming read; `NotFound` when the object is absent.
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream>;

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo>;

    fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> ObjectStream;

    /// Idempotent: a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool>;

    /// Create the bucket when absent; no-op otherwise.
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> StorageResult<()>;

    /// Transport the issued credentials select.
    fn upload_method(&self) -> UploadMethod {
        UploadMethod::PresignedUrl
    }

    fn cdn_domain(&self) -> Option<String> {
        None
    }

    /// Server endpoint override for `source = server`; empty when the default
    /// endpoint applies.
    fn upload_endpoint(&self, source: UploadSource) -> String;

    /// Native client settings for trusted workloads, when the backend has any.
    fn sdk_config(&self, _bucket: &str) -> Option<SdkConfig> {
        None
    }

    /// The filesystem store behind the `local` tag.
    fn local_store(&self) -> Option<&LocalBackend> {
        None
    }
}

/// Build the backend named by `config.backend`.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobBackend>> {
    let kind: BackendKind = config
        .backend
        .parse()
        .map_err(StorageError::UnsupportedBackend)?;

    match kind {
        BackendKind::Minio | BackendKind::AwsS3 => {
            let backend = S3Backend::new(kind, config)?;
            Ok(Arc::new(backend))
        }
        BackendKind::Local => {
            let backend = LocalBackend::new(config).await?;
            Ok(Arc::new(backend))
        }
        BackendKind::TencentCos | BackendKind::AliyunOss => {
            Err(StorageError::BackendNotImplemented(kind.to_string()))
        }
    }
}

/// Collapse an object stream into a vector, stopping at the first error.
pub async fn collect_objects(mut stream: ObjectStream) -> StorageResult<Vec<ObjectInfo>> {
    use futures::StreamExt;

    let mut objects = Vec::new();
    while let Some(item) = stream.next().await {
        objects.push(item?);
    }
    Ok(objects)
}
