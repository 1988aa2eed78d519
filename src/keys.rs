//! Object key derivation and tenant resolution.
//!
//! Every object lives at `{tenant}/{subpath}/{YYYY}/{MM}/{DD}/{uuid}{.ext}`
//! where `tenant/subpath` is the normalized router.

use chrono::{DateTime, Datelike, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use uuid::Uuid;

/// Characters left untouched when a key is embedded as a single path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// RFC 5987 `attr-char`: everything else is percent-encoded in `filename*`.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Trim surrounding slashes and collapse repeated separators.
pub fn normalize_router(router: &str) -> String {
    router
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// First segment of the router; empty when the router is empty.
pub fn tenant_of(router: &str) -> String {
    router
        .split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Extension of `filename` including the dot, taken from the last `.` of the
/// final path component. Empty when there is none.
pub fn extension_of(filename: &str) -> &str {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rfind('.') {
        Some(pos) => &base[pos..],
        None => "",
    }
}

/// Build a fresh object key. Two calls never return the same key.
pub fn key_for(router: &str, filename: &str, now: DateTime<Utc>) -> String {
    let router = normalize_router(router);
    let date = format!("{:04}/{:02}/{:02}", now.year(), now.month(), now.day());
    let ext = extension_of(filename);
    let id = Uuid::new_v4();
    if router.is_empty() {
        format!("{}/{}{}", date, id, ext)
    } else {
        format!("{}/{}/{}{}", router, date, id, ext)
    }
}

/// Strip leading slashes from a key captured out of a URL path.
pub fn clean_key(raw: &str) -> &str {
    raw.trim_start_matches('/')
}

/// Last segment of a key, used as the download filename.
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Percent-escape a key so it fits in one URL path segment (`/` included).
pub fn escape_key(key: &str) -> String {
    utf8_percent_encode(key, PATH_SEGMENT).to_string()
}

/// `Content-Disposition` for downloading `filename` as an attachment. The
/// quoted form is an ASCII fallback; `filename*` carries the exact UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, ATTR_CHAR)
    )
}
