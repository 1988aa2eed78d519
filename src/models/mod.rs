//! Core data models for the storage service.
//!
//! Audit rows map to database tables via `sqlx::FromRow`; everything
//! serializes as JSON via `serde`.

pub mod credentials;
pub mod file;
pub mod object;
pub mod upload;

pub use credentials::{
    BackendKind, EXPIRE_FORMAT, SdkConfig, UploadCredentials, UploadMethod, UploadSource,
    format_expire,
};
pub use file::{FileDescriptor, UploadResult};
pub use object::ObjectInfo;
pub use upload::{FileDownloadRecord, FileUploadRecord, UploadStats, UploadStatus};
