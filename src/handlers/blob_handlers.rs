//! Data plane of the `local` backend: `PUT|GET /api/v1/storage/blob/{bucket}/{*key}`.
//!
//! Requests must carry a signature minted by the backend's presigner. Unlike
//! the business API these handlers answer with real HTTP status codes, since
//! browsers and HTTP clients PUT here directly.

use crate::{
    backends::{
        BlobBackend,
        local::{LocalBackend, SignedQuery},
    },
    errors::{AppError, StorageError},
    services::storage_service::StorageService,
};
use axum::{
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io;

fn blob_error(err: StorageError) -> AppError {
    let status = match &err {
        StorageError::BadRequest(_) => StatusCode::BAD_REQUEST,
        StorageError::Forbidden(_) => StatusCode::FORBIDDEN,
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError::from(err).with_status(status)
}

fn local_store(service: &StorageService) -> Result<&LocalBackend, AppError> {
    service.backend().local_store().ok_or_else(|| {
        AppError::new(-404, "blob endpoint is only served by the local backend")
            .with_status(StatusCode::NOT_FOUND)
    })
}

fn signed(query: Result<Query<SignedQuery>, QueryRejection>) -> Result<SignedQuery, AppError> {
    query.map(|Query(q)| q).map_err(|rejection| {
        AppError::new(-403, format!("missing signature: {}", rejection.body_text()))
            .with_status(StatusCode::FORBIDDEN)
    })
}

/// PUT an object through a presigned URL.
pub async fn put_blob(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    query: Result<Query<SignedQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let store = local_store(&service)?;
    let query = signed(query)?;
    store
        .verify("PUT", &bucket, &key, &query)
        .map_err(blob_error)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let outcome = store
        .put_stream(&bucket, &key, Box::pin(stream), size, &content_type)
        .await
        .map_err(blob_error)?;

    let mut response = Response::new(Body::empty());
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", outcome.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// GET an object through a presigned URL, applying the signed response overrides.
pub async fn get_blob(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    query: Result<Query<SignedQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let store = local_store(&service)?;
    let query = signed(query)?;
    store
        .verify("GET", &bucket, &key, &query)
        .map_err(blob_error)?;

    let info = store.head(&bucket, &key).await.map_err(blob_error)?;
    let stream = store.get_stream(&bucket, &key).await.map_err(blob_error)?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&info.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(info.size));
    if !info.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", info.etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(info.last_modified)) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    if let Some(value) = query
        .content_disposition
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(value) = query
        .cache_control
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Some(value) = query
        .response_expires
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .and_then(|at| HeaderValue::from_str(&http_date(at)).ok())
    {
        headers.insert(header::EXPIRES, value);
    }

    Ok(response)
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
