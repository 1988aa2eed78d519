//! Client-side pieces used by in-cluster workers: the storage API client, the
//! upload adapter, the upload orchestrator and the content-addressed file cache.

pub mod cache;
pub mod client;
pub mod transfer;
pub mod uploader;

use crate::errors::StorageError;
use std::{io, path::Path};
use thiserror::Error;

pub use cache::{CacheEntry, Downloader, FileCache, HttpDownloader};
pub use client::{GatewayClient, InProcessApi, StorageApi};
pub use transfer::UploadAdapter;
pub use uploader::{BatchUploadOutcome, Uploader};

#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {code}: {msg}")]
    Gateway { code: i64, msg: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upload rejected with status {status}: {body}")]
    UploadRejected { status: u16, body: String },
}

impl SdkError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SdkError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
