//! Tenant-scoped object storage: presigned upload credentials, proxied
//! downloads and an audit ledger over pluggable blob backends, plus the SDK
//! pieces (upload orchestrator, upload adapter, content-addressed file cache)
//! that in-cluster workers use against it.

pub mod audit;
pub mod backends;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod keys;
pub mod models;
pub mod routes;
pub mod sdk;
pub mod services;
