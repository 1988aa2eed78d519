use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageConfig,
}

/// Backend selection plus the upload policy applied by the storage service.
#[derive(Clone)]
pub struct StorageConfig {
    /// Backend tag: `minio|tencentcos|aliyunoss|awss3|local`.
    pub backend: String,
    pub bucket: String,
    pub region: String,
    /// Endpoint reachable from inside the cluster; the service talks to it.
    pub endpoint: String,
    /// Endpoint reachable by browsers; defaults to `endpoint`.
    pub public_endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub force_path_style: bool,
    /// Root directory for the `local` backend.
    pub local_root: String,
    /// Key for signing `local` backend URLs.
    pub signing_secret: String,
    pub cdn_domain: Option<String>,
    pub max_file_size_mb: u64,
    pub upload_ttl_secs: u64,
    /// Hand native client settings to server-sourced requests.
    pub expose_sdk_config: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "minio".into(),
            bucket: "files".into(),
            region: "us-east-1".into(),
            endpoint: "http://127.0.0.1:9000".into(),
            public_endpoint: None,
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
            force_path_style: true,
            local_root: "./data/objects".into(),
            signing_secret: String::new(),
            cdn_domain: None,
            max_file_size_mb: 100,
            upload_ttl_secs: 3600,
            expose_sdk_config: false,
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .field("use_ssl", &self.use_ssl)
            .field("local_root", &self.local_root)
            .field("max_file_size_mb", &self.max_file_size_mb)
            .field("upload_ttl_secs", &self.upload_ttl_secs)
            .field("expose_sdk_config", &self.expose_sdk_config)
            .finish_non_exhaustive()
    }
}

impl StorageConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// External endpoint, falling back to the internal one.
    pub fn external_endpoint(&self) -> &str {
        self.public_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(&self.endpoint)
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Tenant-scoped object storage service")]
pub struct Args {
    /// Host to bind to (overrides STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL for the audit ledger (overrides STORAGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Backend tag (overrides STORAGE_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Default bucket (overrides STORAGE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Internal backend endpoint (overrides STORAGE_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// External backend endpoint (overrides STORAGE_PUBLIC_ENDPOINT)
    #[arg(long)]
    pub public_endpoint: Option<String>,

    /// Root directory for the local backend (overrides STORAGE_LOCAL_ROOT)
    #[arg(long)]
    pub local_root: Option<String>,

    /// Per-file size cap in megabytes (overrides STORAGE_MAX_FILE_SIZE_MB)
    #[arg(long)]
    pub max_file_size_mb: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// Merge CLI arguments over values read through `lookup`.
    pub fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let defaults = StorageConfig::default();

        let port = args
            .port
            .map(Ok)
            .unwrap_or_else(|| parse_var(&lookup, "STORAGE_PORT", 3000))?;
        let host = args
            .host
            .unwrap_or_else(|| string_var(&lookup, "STORAGE_HOST", "0.0.0.0"));
        let database_url = args.database_url.unwrap_or_else(|| {
            string_var(
                &lookup,
                "STORAGE_DATABASE_URL",
                "sqlite://./data/meta/storage.db?mode=rwc",
            )
        });

        let backend = args
            .backend
            .unwrap_or_else(|| string_var(&lookup, "STORAGE_BACKEND", &defaults.backend));
        // The local backend serves its own blobs, so its endpoint is this server.
        let default_endpoint = if backend.eq_ignore_ascii_case("local") {
            format!("http://127.0.0.1:{}", port)
        } else {
            defaults.endpoint.clone()
        };

        let storage = StorageConfig {
            bucket: args
                .bucket
                .unwrap_or_else(|| string_var(&lookup, "STORAGE_BUCKET", &defaults.bucket)),
            region: string_var(&lookup, "STORAGE_REGION", &defaults.region),
            endpoint: args
                .endpoint
                .unwrap_or_else(|| string_var(&lookup, "STORAGE_ENDPOINT", &default_endpoint)),
            public_endpoint: args
                .public_endpoint
                .or_else(|| optional_var(&lookup, "STORAGE_PUBLIC_ENDPOINT")),
            access_key: string_var(&lookup, "STORAGE_ACCESS_KEY", ""),
            secret_key: string_var(&lookup, "STORAGE_SECRET_KEY", ""),
            use_ssl: parse_var(&lookup, "STORAGE_USE_SSL", defaults.use_ssl)?,
            force_path_style: parse_var(
                &lookup,
                "STORAGE_FORCE_PATH_STYLE",
                defaults.force_path_style,
            )?,
            local_root: args
                .local_root
                .unwrap_or_else(|| string_var(&lookup, "STORAGE_LOCAL_ROOT", &defaults.local_root)),
            signing_secret: string_var(
                &lookup,
                "STORAGE_SIGNING_SECRET",
                &defaults.signing_secret,
            ),
            cdn_domain: optional_var(&lookup, "STORAGE_CDN_DOMAIN"),
            max_file_size_mb: args.max_file_size_mb.map(Ok).unwrap_or_else(|| {
                parse_var(&lookup, "STORAGE_MAX_FILE_SIZE_MB", defaults.max_file_size_mb)
            })?,
            upload_ttl_secs: parse_var(&lookup, "STORAGE_UPLOAD_TTL_SECS", defaults.upload_ttl_secs)?,
            expose_sdk_config: parse_var(
                &lookup,
                "STORAGE_EXPOSE_SDK_CONFIG",
                defaults.expose_sdk_config,
            )?,
            backend,
        };
        if storage.backend.eq_ignore_ascii_case("local") && storage.signing_secret.trim().is_empty()
        {
            bail!("STORAGE_SIGNING_SECRET must be set for the local backend");
        }

        Ok(Self {
            host,
            port,
            database_url,
            storage,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn string_var<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    lookup(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    lookup(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
