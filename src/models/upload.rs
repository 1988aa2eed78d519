//! Audit ledger rows for uploads and proxied downloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle of an issued upload credential.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One row per issued upload credential.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileUploadRecord {
    /// Row id assigned by the database; zero before insertion.
    pub id: i64,

    /// Object key, unique across the ledger.
    pub file_key: String,

    pub router: String,

    /// Original filename declared by the client.
    pub file_name: String,

    pub file_size: i64,

    pub content_type: String,

    /// Client-declared SHA-256, empty when not provided.
    pub hash: String,

    pub username: String,

    /// First segment of `router`.
    pub tenant: String,

    pub status: UploadStatus,

    pub uploaded_at: DateTime<Utc>,
}

/// One row per proxied download.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileDownloadRecord {
    pub id: i64,
    pub file_key: String,
    pub username: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub downloaded_at: DateTime<Utc>,
}

/// Count and byte total over completed uploads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub file_count: i64,
    pub total_size: i64,
}
