//! Blob backend double: delegates to a real `LocalBackend`, counts every call
//! and fails deletes for chosen keys.

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tenant_storage::{
    backends::{
        BlobBackend, ByteStream, LocalBackend, ObjectStream, PresignedUrls, PutOutcome,
        ResponseOverrides,
    },
    errors::{StorageError, StorageResult},
    models::{BackendKind, ObjectInfo, UploadCredentials, UploadSource},
};

#[derive(Debug)]
pub struct CountingBackend {
    inner: LocalBackend,
    calls: AtomicUsize,
    failing_deletes: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            failing_deletes: Mutex::new(HashSet::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Make every later delete of `key` fail with `BackendUnavailable`.
    pub fn fail_delete(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobBackend for CountingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<UploadCredentials> {
        self.hit();
        self.inner.presign_put(bucket, key, content_type, ttl).await
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<PresignedUrls> {
        self.hit();
        self.inner.presign_get(bucket, key, ttl, overrides).await
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> StorageResult<PutOutcome> {
        self.hit();
        self.inner
            .put_stream(bucket, key, body, size, content_type)
            .await
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        self.hit();
        self.inner.get_stream(bucket, key).await
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.hit();
        self.inner.head(bucket, key).await
    }

    fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> ObjectStream {
        self.hit();
        self.inner.list(bucket, prefix, recursive)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.hit();
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(StorageError::BackendUnavailable(format!(
                "injected delete failure for {key}"
            )));
        }
        self.inner.delete(bucket, key).await
    }

    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool> {
        self.hit();
        self.inner.bucket_exists(bucket).await
    }

    async fn ensure_bucket(&self, bucket: &str, region: &str) -> StorageResult<()> {
        self.hit();
        self.inner.ensure_bucket(bucket, region).await
    }

    fn cdn_domain(&self) -> Option<String> {
        self.inner.cdn_domain()
    }

    fn upload_endpoint(&self, source: UploadSource) -> String {
        self.inner.upload_endpoint(source)
    }

    fn local_store(&self) -> Option<&LocalBackend> {
        Some(&self.inner)
    }
}
