use crate::error::{Error, Result};
use crate::models::RetentionPolicy;
use crate::state::BackendKind;
use byte_unit::Byte;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub uploads: UploadConfig,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum declared size of a single upload (None = unlimited)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: Option<Byte>,

    /// Maximum accepted HTTP request body (bounds a single PATCH chunk)
    #[serde(default = "default_max_request_body")]
    pub max_request_body: Byte,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: Byte,

    /// Total on-disk budget for uploads/ + files/ (None = unlimited)
    #[serde(default)]
    pub max_storage_size: Option<Byte>,
}

/// Retention override granted to a specific API token.
#[derive(Debug, Deserialize, Clone)]
pub struct TokenRetentionPolicy {
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub retention_ttl: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Seconds an incomplete upload may linger before the sweep reclaims it
    #[serde(default = "default_upload_expiration_seconds")]
    pub upload_expiration_seconds: i64,

    #[serde(default)]
    pub default_retention: RetentionPolicy,

    #[serde(default)]
    pub default_retention_ttl: Option<i64>,

    /// Per-token retention overrides, keyed by the opaque X-API-Token value
    #[serde(default)]
    pub token_retention_policies: HashMap<String, TokenRetentionPolicy>,

    /// Seconds between background cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_upload_size() -> Option<Byte> {
    Some(Byte::from_u64(512 * 1024 * 1024))
}

fn default_max_request_body() -> Byte {
    Byte::from_u64(512 * 1024 * 1024)
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_chunk_size() -> Byte {
    Byte::from_u64(4 * 1024 * 1024)
}

fn default_upload_expiration_seconds() -> i64 {
    86400
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_size: default_max_upload_size(),
            max_request_body: default_max_request_body(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            chunk_size: default_chunk_size(),
            max_storage_size: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_expiration_seconds: default_upload_expiration_seconds(),
            default_retention: RetentionPolicy::default(),
            default_retention_ttl: None,
            token_retention_policies: HashMap::new(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: default_redis_url(),
        }
    }
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Add config file sources in order of precedence (lower to higher)
        if config_path.is_none() {
            // Release builds: look in /etc/ferryd/
            #[cfg(not(debug_assertions))]
            {
                builder = builder
                    .add_source(config::File::with_name("/etc/ferryd/config").required(false));
            }

            // Debug builds: look in current working directory
            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        // Custom config path (if specified via --config)
        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        // Environment variables (highest precedence)
        builder = builder.add_source(config::Environment::with_prefix("FERRYD"));

        let config = builder.build().map_err(|e| Error::Config {
            msg: format!("Failed to load configuration: {}", e),
        })?;

        let mut config: Self = config.try_deserialize().map_err(|e| Error::Config {
            msg: format!("Failed to deserialize configuration: {}", e),
        })?;

        // Convert relative storage_path to absolute and clean it
        if !config.storage.storage_path.is_absolute() {
            let cwd = std::env::current_dir().map_err(|e| Error::Config {
                msg: format!("Failed to get current directory: {}", e),
            })?;
            config.storage.storage_path = cwd.join(&config.storage.storage_path);
        }

        // Clean up the path (resolve . and .. components)
        // If canonicalize fails (e.g., path doesn't exist yet), keep the absolute path
        if let Ok(canonical) = config.storage.storage_path.canonicalize() {
            config.storage.storage_path = canonical;
        }

        Ok(config)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "max_upload_size",
                &self.max_upload_size.map(|b| {
                    format!("{}", b.get_appropriate_unit(byte_unit::UnitType::Binary))
                }),
            )
            .field(
                "max_request_body",
                &format!(
                    "{}",
                    self.max_request_body
                        .get_appropriate_unit(byte_unit::UnitType::Binary)
                ),
            )
            .finish()
    }
}
