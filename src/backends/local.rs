//! Filesystem backend for single-node deployments and development.
//!
//! Payloads live under `{root}/{bucket}/objects/{key}` and a JSON sidecar under
//! `{root}/{bucket}/meta/{key}.json` keeps content type and etag. Presigned
//! URLs point back at this service's `/api/v1/storage/blob` endpoint and carry
//! an HMAC-SHA256 signature over method, bucket, key, expiry and response
//! overrides.

use crate::{
    backends::{BlobBackend, ByteStream, ObjectStream, PresignedUrls, PutOutcome, ResponseOverrides},
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    keys,
    models::{BackendKind, ObjectInfo, UploadCredentials, UploadSource},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Route prefix of the blob endpoint that serves presigned local URLs.
pub const BLOB_ROUTE_PREFIX: &str = "/api/v1/storage/blob";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Query string carried by a presigned local URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
    #[serde(
        rename = "response-content-disposition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_disposition: Option<String>,
    #[serde(
        rename = "response-cache-control",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_control: Option<String>,
    #[serde(
        rename = "response-expires",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_expires: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LocalBackend {
    root: PathBuf,
    endpoint: String,
    public_endpoint: String,
    secret: Vec<u8>,
    cdn_domain: Option<String>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("root", &self.root)
            .field("endpoint", &self.endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let root = PathBuf::from(&config.local_root);
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            public_endpoint: config.external_endpoint().trim_end_matches('/').to_string(),
            secret: config.signing_secret.as_bytes().to_vec(),
            cdn_domain: config.cdn_domain.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check signature and expiry of a presigned request.
    pub fn verify(
        &self,
        method: &str,
        bucket: &str,
        key: &str,
        query: &SignedQuery,
    ) -> StorageResult<()> {
        if query.expires < Utc::now().timestamp() {
            return Err(StorageError::Forbidden("presigned url expired".into()));
        }
        let signature = hex::decode(&query.signature)
            .map_err(|_| StorageError::Forbidden("malformed signature".into()))?;
        let mut mac = self.mac(method, bucket, key, query);
        mac.verify_slice(&signature)
            .map_err(|_| StorageError::Forbidden("signature mismatch".into()))
    }

    fn mac(&self, method: &str, bucket: &str, key: &str, query: &SignedQuery) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        let canonical = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}",
            method,
            bucket,
            key,
            query.expires,
            query.content_disposition.as_deref().unwrap_or(""),
            query.cache_control.as_deref().unwrap_or(""),
            query.response_expires.map(|t| t.to_string()).unwrap_or_default(),
        );
        mac.update(canonical.as_bytes());
        mac
    }

    fn sign(&self, method: &str, bucket: &str, key: &str, mut query: SignedQuery) -> SignedQuery {
        query.signature = hex::encode(self.mac(method, bucket, key, &query).finalize().into_bytes());
        query
    }

    fn presigned_url(&self, base: &str, bucket: &str, key: &str, query: &SignedQuery) -> String {
        let mut pairs = url::form_urlencoded::Serializer::new(String::new());
        pairs.append_pair("expires", &query.expires.to_string());
        pairs.append_pair("signature", &query.signature);
        if let Some(v) = &query.content_disposition {
            pairs.append_pair("response-content-disposition", v);
        }
        if let Some(v) = &query.cache_control {
            pairs.append_pair("response-cache-control", v);
        }
        if let Some(v) = query.response_expires {
            pairs.append_pair("response-expires", &v.to_string());
        }
        format!(
            "{}{}/{}/{}?{}",
            base,
            BLOB_ROUTE_PREFIX,
            keys::escape_key(bucket),
            escape_path(key),
            pairs.finish()
        )
    }

    fn has_split(&self) -> bool {
        self.public_endpoint != self.endpoint
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::BadRequest("invalid object key".into()));
        }
        if key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(StorageError::BadRequest("invalid object key".into()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::BadRequest("invalid object key".into()));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn objects_root(&self, bucket: &str) -> PathBuf {
        self.bucket_root(bucket).join("objects")
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.objects_root(bucket).join(key)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_root(bucket)
            .join("meta")
            .join(format!("{}.json", key))
    }

    async fn write_sidecar(&self, bucket: &str, key: &str, sidecar: &Sidecar) -> StorageResult<()> {
        let path = self.meta_path(bucket, key);
        let parent = parent_of(&path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec(sidecar).map_err(io::Error::other)?;
        fs::write(&tmp_path, bytes).await?;
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    async fn read_info(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let object_path = self.object_path(bucket, key);
        let meta = match fs::metadata(&object_path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(StorageError::NotFound(key.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };

        match fs::read(self.meta_path(bucket, key)).await {
            Ok(bytes) => {
                let sidecar: Sidecar = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
                Ok(ObjectInfo {
                    key: key.to_string(),
                    size: sidecar.size,
                    content_type: sidecar.content_type,
                    etag: sidecar.etag,
                    last_modified: sidecar.last_modified,
                })
            }
            // Payload without sidecar: fall back to filesystem metadata.
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
                content_type: "application/octet-stream".into(),
                etag: String::new(),
                last_modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_default(),
            }),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<UploadCredentials> {
        self.ensure_key_safe(key)?;
        let query = SignedQuery {
            expires: expiry(ttl),
            ..SignedQuery::default()
        };
        let query = self.sign("PUT", bucket, key, query);

        let url = self.presigned_url(&self.public_endpoint, bucket, key, &query);
        let server_url = self.presigned_url(&self.endpoint, bucket, key, &query);
        let mut creds = UploadCredentials {
            key: key.to_string(),
            bucket: bucket.to_string(),
            method: self.upload_method(),
            storage: BackendKind::Local.to_string(),
            url: url.clone(),
            server_url,
            headers: HashMap::from([("Content-Type".to_string(), content_type.to_string())]),
            cdn_domain: self.cdn_domain.clone(),
            ..Default::default()
        };
        creds.set_upload_target(&url);
        Ok(creds)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<PresignedUrls> {
        self.ensure_key_safe(key)?;
        let query = SignedQuery {
            expires: expiry(ttl),
            signature: String::new(),
            content_disposition: overrides.content_disposition.clone(),
            cache_control: overrides.cache_control.clone(),
            response_expires: overrides.expires.map(|at| at.timestamp()),
        };
        let query = self.sign("GET", bucket, key, query);
        Ok(PresignedUrls {
            external: self.presigned_url(&self.public_endpoint, bucket, key, &query),
            internal: self.presigned_url(&self.endpoint, bucket, key, &query),
        })
    }

    /// Writes to a temp file, fsyncs, then renames into place.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        _size: u64,
        content_type: &str,
    ) -> StorageResult<PutOutcome> {
        self.ensure_key_safe(key)?;
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::NotFound(format!("bucket `{}`", bucket)));
        }

        let file_path = self.object_path(bucket, key);
        let parent = parent_of(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let etag = format!("{:x}", digest.compute());
        let sidecar = Sidecar {
            content_type: if content_type.is_empty() {
                "application/octet-stream".into()
            } else {
                content_type.to_string()
            },
            size,
            etag: etag.clone(),
            last_modified: Utc::now(),
        };
        self.write_sidecar(bucket, key, &sidecar).await?;
        debug!(bucket = %bucket, key = %key, size, "stored object");

        Ok(PutOutcome { etag })
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        self.ensure_key_safe(key)?;
        let file = File::open(self.object_path(bucket, key))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Io(err)
                }
            })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        self.read_info(bucket, key).await
    }

    fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> ObjectStream {
        let this = self.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let objects_root = this.objects_root(&bucket);
            // Start from the deepest directory the prefix fully names.
            let start_dir = match prefix.rfind('/') {
                Some(pos) => objects_root.join(&prefix[..pos]),
                None => objects_root.clone(),
            };

            let mut pending = vec![start_dir];
            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => Err(StorageError::Io(err))?,
                };

                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    names.push((entry.file_name(), entry.file_type().await?));
                }
                names.sort_by(|a, b| b.0.cmp(&a.0));

                for (name, file_type) in names {
                    let name = name.to_string_lossy().into_owned();
                    if name.starts_with(".tmp-") {
                        continue;
                    }
                    let path = dir.join(&name);
                    if file_type.is_dir() {
                        pending.push(path);
                        continue;
                    }
                    let Some(key) = relative_key(&objects_root, &path) else {
                        continue;
                    };
                    if !key.starts_with(&prefix) {
                        continue;
                    }
                    if !recursive && key[prefix.len()..].contains('/') {
                        continue;
                    }
                    // Deleted between the scan and the read.
                    match this.read_info(&bucket, &key).await {
                        Ok(info) => yield info,
                        Err(StorageError::NotFound(_)) => continue,
                        Err(err) => Err(err)?,
                    }
                }
            }
        };

        Box::pin(stream)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(bucket, key);
        for path in [file_path.clone(), self.meta_path(bucket, key)] {
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root(bucket)).await;
        }
        let meta_path = self.meta_path(bucket, key);
        if let Some(parent) = meta_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket).join("meta"))
                .await;
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> StorageResult<bool> {
        match fs::metadata(self.objects_root(bucket)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn ensure_bucket(&self, bucket: &str, _region: &str) -> StorageResult<()> {
        validate_bucket_name(bucket)?;
        if self.bucket_exists(bucket).await? {
            return Ok(());
        }
        fs::create_dir_all(self.objects_root(bucket)).await?;
        fs::create_dir_all(self.bucket_root(bucket).join("meta")).await?;
        info!(bucket = %bucket, root = %self.root.display(), "created bucket directory");
        Ok(())
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

    fn local_store(&self) -> Option<&LocalBackend> {
        Some(self)
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| {
        Err(StorageError::BadRequest(format!(
            "bucket `{}` invalid: {}",
            name, reason
        )))
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }
    if is_ipv4_like(name) {
        return invalid("must not be formatted like an IP address");
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

fn expiry(ttl: Duration) -> i64 {
    Utc::now().timestamp() + ttl.as_secs() as i64
}

/// Percent-escape each segment of a key, keeping `/` separators.
fn escape_path(key: &str) -> String {
    key.split('/')
        .map(keys::escape_key)
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &Path) -> StorageResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StorageError::Io(io::Error::other("object path missing parent directory"))
    })
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
