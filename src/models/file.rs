//! Values returned to SDK callers.

use serde::{Deserialize, Serialize};

/// A local file after it went through the upload pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FileDescriptor {
    /// Object key in the backend.
    pub name: String,
    /// Original local filename.
    pub source_name: String,
    pub storage: String,
    pub hash: String,
    pub size: u64,
    /// Unix seconds at upload time.
    pub upload_ts: i64,
    pub local_path: String,
    pub is_uploaded: bool,
    /// External download URL.
    pub url: String,
    /// Internal download URL.
    pub server_url: String,
    /// True while `local_path` holds a valid copy of the content.
    pub downloaded: bool,
}

/// Outcome of one PUT through the upload adapter.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UploadResult {
    pub key: String,
    pub etag: String,
    /// SHA-256 computed by the caller before the transfer.
    pub hash: String,
    pub size: u64,
    pub content_type: String,
    pub download_url: String,
    pub server_download_url: String,
}
