//! Upload credentials handed to browsers and SDK workers.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Wire format for every timestamp in credential and completion payloads.
pub const EXPIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_expire(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(EXPIRE_FORMAT).to_string()
}

/// Client-side transport selected by the credentials.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    #[default]
    PresignedUrl,
    FormUpload,
    SdkUpload,
}

/// Which network view a credential should favour.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadSource {
    #[default]
    Browser,
    Server,
}

/// Backend tags understood by the factory.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Minio,
    TencentCos,
    AliyunOss,
    AwsS3,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Minio => "minio",
            BackendKind::TencentCos => "tencentcos",
            BackendKind::AliyunOss => "aliyunoss",
            BackendKind::AwsS3 => "awss3",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minio" => Ok(BackendKind::Minio),
            "tencentcos" => Ok(BackendKind::TencentCos),
            "aliyunoss" => Ok(BackendKind::AliyunOss),
            "awss3" => Ok(BackendKind::AwsS3),
            "local" => Ok(BackendKind::Local),
            other => Err(other.to_string()),
        }
    }
}

/// Direct-client configuration for trusted in-cluster workloads.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SdkConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub use_ssl: bool,
    pub bucket: String,
}

impl SdkConfig {
    /// True when every field needed to build a native client is present.
    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.is_empty()
            && !self.bucket.is_empty()
    }

    /// Endpoint with a scheme, derived from `use_ssl` when the endpoint is bare.
    pub fn endpoint_url(&self) -> String {
        let lower = self.endpoint.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            self.endpoint.clone()
        } else if self.use_ssl {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

/// Short-lived, scoped credentials for a single object upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UploadCredentials {
    pub key: String,
    pub bucket: String,
    pub expire: String,
    pub method: UploadMethod,
    pub storage: String,

    /// External-view URL, used by browsers.
    pub url: String,
    /// Internal-view URL, used by co-located workloads.
    pub server_url: String,
    pub headers: HashMap<String, String>,
    pub upload_host: String,
    pub upload_domain: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_data: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_config: Option<SdkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn_domain: Option<String>,

    pub download_url: String,
    pub server_download_url: String,

    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadCredentials {
    /// Point `upload_host` / `upload_domain` at the host of `url`.
    pub fn set_upload_target(&mut self, url: &str) {
        let (host, domain) = split_host(url);
        self.upload_host = host;
        self.upload_domain = domain;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// `(host[:port], scheme://host[:port])` of a URL; empty strings when unparsable.
pub fn split_host(raw: &str) -> (String, String) {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let host = match (parsed.host_str(), parsed.port()) {
                (Some(h), Some(p)) => format!("{}:{}", h, p),
                (Some(h), None) => h.to_string(),
                _ => String::new(),
            };
            if host.is_empty() {
                (String::new(), String::new())
            } else {
                let domain = format!("{}://{}", parsed.scheme(), host);
                (host, domain)
            }
        }
        Err(_) => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_domain_are_parsed() {
        let (host, domain) = split_host("https://files.example.com/bucket/key?X-Amz-Expires=60");
        assert_eq!(host, "files.example.com");
        assert_eq!(domain, "https://files.example.com");

        let (host, domain) = split_host("http://minio.svc.cluster.local:9000/b/k");
        assert_eq!(host, "minio.svc.cluster.local:9000");
        assert_eq!(domain, "http://minio.svc.cluster.local:9000");
    }

    #[test]
    fn backend_tags_are_case_insensitive() {
        assert_eq!("MinIO".parse::<BackendKind>(), Ok(BackendKind::Minio));
        assert_eq!(" local ".parse::<BackendKind>(), Ok(BackendKind::Local));
        assert!("gcs".parse::<BackendKind>().is_err());
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let creds = UploadCredentials {
            key: "t1/a.csv".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(value["method"], "presigned_url");
        assert!(value.get("sdk_config").is_none());
        assert!(value.get("expires_at").is_none());
    }

    #[test]
    fn sdk_config_completeness() {
        let mut cfg = SdkConfig {
            endpoint: "minio:9000".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: String::new(),
            use_ssl: false,
            bucket: "files".into(),
        };
        assert!(cfg.is_complete());
        assert_eq!(cfg.endpoint_url(), "http://minio:9000");
        cfg.secret_key.clear();
        assert!(!cfg.is_complete());
    }
}
