//! Configuration for the gallery client.
//!
//! Values are layered from built-in defaults, optional config files and
//! environment variables (`GALLERY__STORE__URL` -> `store.url`). The hosted
//! store's base URL and anonymous key are required; a missing value is a
//! startup failure.

use crate::model::{
    BUCKET_NAME, GROSS_SIZE_FACTOR, MAX_EDGE_PIXELS, MAX_FINAL_BYTES, PHOTOS_TABLE, TARGET_BYTES,
};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

/// Main configuration for the gallery client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// S3 configuration (self-hosted backend only)
    #[serde(default)]
    pub s3: Option<S3Config>,
    /// Database configuration (self-hosted backend only)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Upload limits
    #[serde(default)]
    pub upload: UploadConfig,
    /// Photo feed configuration
    #[serde(default)]
    pub feed: FeedConfig,
    /// Upload modal behaviour
    #[serde(default)]
    pub modal: ModalConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Which backend implements the storage gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Hosted store: REST storage, REST table API and websocket realtime
    #[default]
    Supabase,
    /// S3-compatible bucket plus a PostgreSQL table
    SelfHosted,
}

/// Backing store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend implementation
    #[serde(default)]
    pub backend: StoreBackend,
    /// Base URL of the store (e.g. "https://project.supabase.co")
    pub url: Option<String>,
    /// Anonymous access key
    pub anon_key: Option<String>,
    /// Bucket for uploaded images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Table holding photo rows
    #[serde(default = "default_table")]
    pub table: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL objects are served from; defaults to `{endpoint}/{bucket}`
    pub public_base_url: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Upload limits
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted image after compression, in bytes
    #[serde(default = "default_max_final_bytes")]
    pub max_final_bytes: usize,
    /// Files above `max_final_bytes * gross_size_factor` are rejected before compression
    #[serde(default = "default_gross_size_factor")]
    pub gross_size_factor: usize,
    /// Compression target size in bytes
    #[serde(default = "default_target_bytes")]
    pub target_bytes: usize,
    /// Longest edge of a compressed image
    #[serde(default = "default_max_edge_pixels")]
    pub max_edge_pixels: u32,
}

/// Photo feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Delay between a successful batch and the reconciling refetch
    #[serde(default = "default_refresh_delay_ms")]
    pub refresh_delay_ms: u64,
    /// Periodic reconciling refetch; 0 disables it
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Realtime heartbeat interval
    #[serde(default = "default_heartbeat_secs")]
    pub realtime_heartbeat_secs: u64,
    /// Base delay between realtime reconnection attempts
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay between realtime reconnection attempts
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Upload modal behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ModalConfig {
    /// Delay before a finished batch closes the modal
    #[serde(default = "default_auto_close_ms")]
    pub auto_close_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "wedding-gallery".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bucket() -> String {
    BUCKET_NAME.to_string()
}

fn default_table() -> String {
    PHOTOS_TABLE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_final_bytes() -> usize {
    MAX_FINAL_BYTES
}

fn default_gross_size_factor() -> usize {
    GROSS_SIZE_FACTOR
}

fn default_target_bytes() -> usize {
    TARGET_BYTES
}

fn default_max_edge_pixels() -> u32 {
    MAX_EDGE_PIXELS
}

fn default_refresh_delay_ms() -> u64 {
    800
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_auto_close_ms() -> u64 {
    2200
}

impl Config {
    /// Load configuration from config files and the environment, then validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/wedding-gallery/gallery").required(false))
            // GALLERY__STORE__ANON_KEY -> store.anon_key
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        config.apply_store_env(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Fill store credentials from the hosted store's conventional variable
    /// names when the prefixed keys are absent.
    pub fn apply_store_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.store.url.is_none() {
            self.store.url = lookup("SUPABASE_URL").or_else(|| lookup("NEXT_PUBLIC_SUPABASE_URL"));
        }
        if self.store.anon_key.is_none() {
            self.store.anon_key =
                lookup("SUPABASE_ANON_KEY").or_else(|| lookup("NEXT_PUBLIC_SUPABASE_ANON_KEY"));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.store.table) {
            return Err(ConfigError::InvalidValue {
                key: "store.table".to_string(),
                message: "must be a lowercase SQL identifier".to_string(),
            });
        }

        match self.store.backend {
            StoreBackend::Supabase => {
                self.validate_store_url()?;

                let has_key = self
                    .store
                    .anon_key
                    .as_deref()
                    .is_some_and(|k| !k.trim().is_empty());
                if !has_key {
                    return Err(ConfigError::MissingRequired("store.anon_key".to_string()));
                }
            }
            StoreBackend::SelfHosted => {
                // the bundled migration and NOTIFY trigger target this table
                if self.store.table != PHOTOS_TABLE {
                    return Err(ConfigError::InvalidValue {
                        key: "store.table".to_string(),
                        message: format!("the self_hosted backend only supports {PHOTOS_TABLE:?}"),
                    });
                }
                if self.s3.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "s3 (required for the self_hosted backend)".to_string(),
                    ));
                }
                if self.database.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "database (required for the self_hosted backend)".to_string(),
                    ));
                }
            }
        }

        if self.upload.max_final_bytes == 0 || self.upload.gross_size_factor == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload".to_string(),
                message: "size limits must be positive".to_string(),
            });
        }

        Ok(())
    }

    fn validate_store_url(&self) -> Result<(), ConfigError> {
        let url = self
            .store
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("store.url".to_string()))?;

        let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidValue {
            key: "store.url".to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "store.url".to_string(),
                message: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }
        Ok(())
    }

    /// Store base URL without a trailing slash. Empty before validation.
    pub fn store_url(&self) -> String {
        self.store
            .url
            .as_deref()
            .unwrap_or_default()
            .trim()
            .trim_end_matches('/')
            .to_string()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.store.request_timeout_secs)
    }
}

impl FeedConfig {
    /// Delay before the post-batch refetch
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    /// Periodic reconcile interval, if enabled
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    /// Realtime heartbeat interval
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs.max(1))
    }

    /// Base reconnect delay
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Maximum reconnect delay
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl ModalConfig {
    /// Delay before a finished batch closes the modal
    pub fn auto_close_delay(&self) -> Duration {
        Duration::from_millis(self.auto_close_ms)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('a'..='z' | '_'))
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            anon_key: None,
            bucket: default_bucket(),
            table: default_table(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_final_bytes: default_max_final_bytes(),
            gross_size_factor: default_gross_size_factor(),
            target_bytes: default_target_bytes(),
            max_edge_pixels: default_max_edge_pixels(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            refresh_delay_ms: default_refresh_delay_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            realtime_heartbeat_secs: default_heartbeat_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl Default for ModalConfig {
    fn default() -> Self {
        Self {
            auto_close_ms: default_auto_close_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosted_config() -> Config {
        let mut config = Config::default();
        config.store.url = Some("https://wedding.supabase.co/".to_string());
        config.store.anon_key = Some("anon-key".to_string());
        config
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.store.bucket, "wedding-gallery");
        assert_eq!(config.store.table, "photos");
        assert_eq!(config.upload.max_final_bytes, 2 * 1024 * 1024);
        assert_eq!(config.upload.target_bytes, 300 * 1024);
        assert_eq!(config.feed.refresh_delay(), Duration::from_millis(800));
        assert_eq!(config.modal.auto_close_delay(), Duration::from_millis(2200));
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "store.url"
        ));
    }

    #[test]
    fn test_missing_anon_key_is_fatal() {
        let mut config = hosted_config();
        config.store.anon_key = Some("  ".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "store.anon_key"
        ));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let mut config = hosted_config();
        config.store.url = Some("not a url".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_valid_hosted_config() {
        let config = hosted_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_url(), "https://wedding.supabase.co");
    }

    #[test]
    fn test_self_hosted_requires_sections() {
        let mut config = hosted_config();
        config.store.backend = StoreBackend::SelfHosted;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    fn self_hosted_config() -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackend::SelfHosted;
        config.s3 = Some(S3Config {
            bucket: "wedding-gallery".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            force_path_style: true,
            public_base_url: None,
        });
        config.database = Some(DatabaseConfig {
            url: "postgres://localhost/gallery".to_string(),
            max_connections: 5,
            connect_timeout_secs: 10,
            run_migrations: true,
        });
        config
    }

    #[test]
    fn test_self_hosted_does_not_need_store_url() {
        let config = self_hosted_config();
        assert!(config.store.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_self_hosted_rejects_unmigrated_table() {
        let mut config = self_hosted_config();
        config.store.table = "wedding_photos".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "store.table"
        ));
    }

    #[test]
    fn test_store_env_fallback() {
        let mut config = Config::default();
        config.apply_store_env(|key| match key {
            "NEXT_PUBLIC_SUPABASE_URL" => Some("https://fallback.supabase.co".to_string()),
            "SUPABASE_ANON_KEY" => Some("key".to_string()),
            _ => None,
        });

        assert_eq!(config.store.url.as_deref(), Some("https://fallback.supabase.co"));
        assert_eq!(config.store.anon_key.as_deref(), Some("key"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_env_does_not_override_explicit_values() {
        let mut config = hosted_config();
        config.apply_store_env(|_| Some("https://other.example".to_string()));
        assert_eq!(config.store.url.as_deref(), Some("https://wedding.supabase.co/"));
    }

    #[test]
    fn test_reconcile_interval_zero_disables() {
        let mut feed = FeedConfig::default();
        assert_eq!(feed.reconcile_interval(), Some(Duration::from_secs(60)));
        feed.reconcile_interval_secs = 0;
        assert_eq!(feed.reconcile_interval(), None);
    }

    #[test]
    fn test_table_must_be_identifier() {
        let mut config = hosted_config();
        config.store.table = "photos; drop".to_string();
        assert!(config.validate().is_err());
    }
}
