//! Read-only projection of an object stored in a blob backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for one object, returned by head and list operations.
///
/// The struct stores metadata only, never the payload bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectInfo {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size: u64,

    /// Content type (MIME type).
    pub content_type: String,

    /// Backend entity tag, without surrounding quotes.
    pub etag: String,

    /// Timestamp when the object was last modified.
    pub last_modified: DateTime<Utc>,
}
