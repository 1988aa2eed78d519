//! Business endpoints under `/api/v1/storage`.
//!
//! Every handler answers HTTP 200 with the `{code, msg, data}` envelope;
//! failures carry a negative code. Downloads stream the object body and only
//! start once the object has been found.

use crate::{
    errors::AppError,
    handlers::{download_context, ok, request_origin, username},
    keys,
    services::storage_service::{
        BatchCompleteRequest, BatchUploadRequest, CompleteRequest, RecordScope, StorageService,
        UploadRequest,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct RouterQuery {
    pub router: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub router: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub router: Option<String>,
    pub user: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl RecordsQuery {
    fn scope(&self) -> Result<RecordScope, AppError> {
        match (non_empty(&self.router), non_empty(&self.user)) {
            (Some(router), _) => Ok(RecordScope::Router(keys::normalize_router(router))),
            (None, Some(user)) => Ok(RecordScope::User(user.to_string())),
            (None, None) => Err(AppError::bad_request("router or user is required")),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

fn router_param(query: Result<Query<RouterQuery>, QueryRejection>) -> Result<String, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    non_empty(&query.router)
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("router is required"))
}

/// POST `/upload_token`
pub async fn upload_token(
    State(service): State<StorageService>,
    headers: HeaderMap,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = body(payload)?;
    let source = req.upload_source.unwrap_or_default();
    let user = username(&headers).unwrap_or_default();
    let creds = service.issue_upload_credentials(&req, source, &user).await?;
    Ok(ok(creds))
}

/// POST `/batch_upload_token`
pub async fn batch_upload_token(
    State(service): State<StorageService>,
    headers: HeaderMap,
    payload: Result<Json<BatchUploadRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = body(payload)?;
    let user = username(&headers).unwrap_or_default();
    let creds = service.issue_batch_upload_credentials(&req, &user).await?;
    Ok(ok(creds))
}

/// POST `/upload_complete`
pub async fn upload_complete(
    State(service): State<StorageService>,
    headers: HeaderMap,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = body(payload)?;
    let resp = service
        .upload_complete(&req, &request_origin(&headers))
        .await?;
    Ok(ok(resp))
}

/// POST `/batch_upload_complete`
pub async fn batch_upload_complete(
    State(service): State<StorageService>,
    headers: HeaderMap,
    payload: Result<Json<BatchCompleteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = body(payload)?;
    let user = username(&headers).unwrap_or_default();
    let results = service
        .batch_upload_complete(&req, &request_origin(&headers), &user)
        .await?;
    let succeeded = results.iter().filter(|r| r.success).count();
    Ok(ok(json!({
        "results": results,
        "success_count": succeeded,
        "failed_count": results.len() - succeeded,
    })))
}

/// GET `/download/{*key}` streams the object through the service.
pub async fn download(
    State(service): State<StorageService>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let download = service
        .proxy_download(&key, download_context(&headers))
        .await?;

    let mut response = Response::new(Body::empty());
    let resp_headers = response.headers_mut();
    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&download.info.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.info.size));
    if let Ok(value) = HeaderValue::from_str(&download.content_disposition()) {
        resp_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    *response.status_mut() = StatusCode::OK;
    *response.body_mut() = Body::from_stream(download.body);
    Ok(response)
}

/// GET `/download_url/{*key}`
pub async fn download_url(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(ok(service.issue_download_urls(&key).await?))
}

/// GET `/info/{*key}`
pub async fn info(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(ok(service.get_info(&key).await?))
}

/// DELETE `/files/{*key}`
pub async fn delete_file(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_by_key(&key).await?;
    Ok(ok(json!({ "key": keys::clean_key(&key) })))
}

/// GET `/files?router=`
pub async fn list_files(
    State(service): State<StorageService>,
    query: Result<Query<RouterQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let router = router_param(query)?;
    Ok(ok(service.list_by_prefix(&router).await?))
}

/// GET `/stats?router=`
pub async fn stats(
    State(service): State<StorageService>,
    query: Result<Query<RouterQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let router = router_param(query)?;
    Ok(ok(service.stats_by_prefix(&router).await?))
}

/// POST `/batch_delete`
pub async fn batch_delete(
    State(service): State<StorageService>,
    payload: Result<Json<BatchDeleteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = body(payload)?;
    Ok(ok(service.delete_by_prefix(&req.router).await?))
}

/// GET `/upload_records?router=|user=&limit=&offset=`
pub async fn upload_records(
    State(service): State<StorageService>,
    query: Result<Query<RecordsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let scope = query.scope()?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    Ok(ok(service.upload_records(&scope, limit, offset).await?))
}

/// GET `/upload_records/stats?router=|user=`
pub async fn upload_record_stats(
    State(service): State<StorageService>,
    query: Result<Query<RecordsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let scope = query.scope()?;
    Ok(ok(service.upload_record_stats(&scope).await?))
}
