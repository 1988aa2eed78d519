//! Access to the storage endpoints from SDK code.
//!
//! [`GatewayClient`] goes over HTTP through the platform gateway;
//! [`InProcessApi`] calls a [`StorageService`] living in the same process.

use crate::{
    handlers::USER_HEADER,
    models::{UploadCredentials, UploadSource},
    routes::routes::API_PREFIX,
    sdk::{SdkError, SdkResult},
    services::storage_service::{
        BatchCompleteRequest, BatchCompleteResult, BatchUploadRequest, CompleteRequest,
        CompleteResponse, RequestOrigin, StorageService, UploadRequest,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{env, time::Duration};
use tracing::debug;

/// Storage operations the upload orchestrator depends on.
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn upload_token(&self, req: &UploadRequest) -> SdkResult<UploadCredentials>;

    /// Credentials in the same order as `req.files`.
    async fn batch_upload_token(&self, req: &BatchUploadRequest)
    -> SdkResult<Vec<UploadCredentials>>;

    async fn upload_complete(&self, req: &CompleteRequest) -> SdkResult<CompleteResponse>;

    async fn batch_upload_complete(
        &self,
        req: &BatchCompleteRequest,
    ) -> SdkResult<Vec<BatchCompleteResult>>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BatchCompleteData {
    results: Vec<BatchCompleteResult>,
}

/// HTTP client for the storage API behind the gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    username: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: Option<String>) -> SdkResult<Self> {
        if url::Url::parse(base_url).is_err() {
            return Err(SdkError::InvalidInput(format!(
                "invalid gateway url `{}`",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            username: None,
        })
    }

    /// Reads `GATEWAY_URL` and the optional `GATEWAY_TOKEN`.
    pub fn from_env() -> SdkResult<Self> {
        let base_url = env::var("GATEWAY_URL")
            .map_err(|_| SdkError::InvalidInput("GATEWAY_URL is not set".into()))?;
        let token = env::var("GATEWAY_TOKEN").ok().filter(|t| !t.is_empty());
        Self::new(&base_url, token)
    }

    /// Act on behalf of `username` (sent as the gateway user header).
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> SdkResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(user) = &self.username {
            req = req.header(USER_HEADER, user);
        }

        let response = req.send().await?.error_for_status()?;
        let envelope: ApiEnvelope<T> = response.json().await?;
        debug!(path = %path, code = envelope.code, "gateway response");
        if envelope.code != 0 {
            return Err(SdkError::Gateway {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        envelope.data.ok_or_else(|| SdkError::Gateway {
            code: envelope.code,
            msg: "response carried no data".into(),
        })
    }
}

#[async_trait]
impl StorageApi for GatewayClient {
    async fn upload_token(&self, req: &UploadRequest) -> SdkResult<UploadCredentials> {
        self.post("/upload_token", req).await
    }

    async fn batch_upload_token(
        &self,
        req: &BatchUploadRequest,
    ) -> SdkResult<Vec<UploadCredentials>> {
        self.post("/batch_upload_token", req).await
    }

    async fn upload_complete(&self, req: &CompleteRequest) -> SdkResult<CompleteResponse> {
        self.post("/upload_complete", req).await
    }

    async fn batch_upload_complete(
        &self,
        req: &BatchCompleteRequest,
    ) -> SdkResult<Vec<BatchCompleteResult>> {
        let data: BatchCompleteData = self.post("/batch_upload_complete", req).await?;
        Ok(data.results)
    }
}

/// Direct calls on a co-located [`StorageService`].
#[derive(Clone)]
pub struct InProcessApi {
    service: StorageService,
    origin: RequestOrigin,
    username: String,
}

impl InProcessApi {
    /// `origin` is the authority proxy download URLs are built against.
    pub fn new(service: StorageService, origin: RequestOrigin, username: impl Into<String>) -> Self {
        Self {
            service,
            origin,
            username: username.into(),
        }
    }
}

#[async_trait]
impl StorageApi for InProcessApi {
    async fn upload_token(&self, req: &UploadRequest) -> SdkResult<UploadCredentials> {
        let source = req.upload_source.unwrap_or(UploadSource::Server);
        Ok(self
            .service
            .issue_upload_credentials(req, source, &self.username)
            .await?)
    }

    async fn batch_upload_token(
        &self,
        req: &BatchUploadRequest,
    ) -> SdkResult<Vec<UploadCredentials>> {
        Ok(self
            .service
            .issue_batch_upload_credentials(req, &self.username)
            .await?)
    }

    async fn upload_complete(&self, req: &CompleteRequest) -> SdkResult<CompleteResponse> {
        Ok(self.service.upload_complete(req, &self.origin).await?)
    }

    async fn batch_upload_complete(
        &self,
        req: &BatchCompleteRequest,
    ) -> SdkResult<Vec<BatchCompleteResult>> {
        Ok(self
            .service
            .batch_upload_complete(req, &self.origin, &self.username)
            .await?)
    }
}
