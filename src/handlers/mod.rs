pub mod blob_handlers;
pub mod health_handlers;
pub mod storage_handlers;

use crate::services::storage_service::{DownloadContext, RequestOrigin};
use axum::{
    Json,
    http::{HeaderMap, header},
};
use serde::Serialize;

/// Header the gateway sets to the authenticated user.
pub const USER_HEADER: &str = "x-username";

/// Success envelope: `{code: 0, msg: "ok", data}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i64,
    pub msg: &'static str,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        msg: "ok",
        data,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn username(headers: &HeaderMap) -> Option<String> {
    header_str(headers, USER_HEADER).map(str::to_string)
}

/// Scheme and authority the client used, honouring the proxy headers.
pub fn request_origin(headers: &HeaderMap) -> RequestOrigin {
    let scheme = match header_str(headers, "x-forwarded-proto") {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    };
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, header::HOST.as_str()))
        .unwrap_or("localhost");
    RequestOrigin::new(scheme, host)
}

pub fn download_context(headers: &HeaderMap) -> DownloadContext {
    let ip_address = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or_default()
        .to_string();
    DownloadContext {
        username: username(headers),
        ip_address,
        user_agent: header_str(headers, header::USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
    }
}
