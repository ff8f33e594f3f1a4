use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Web server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    3000
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://data/workpush.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Storage encryption settings
///
/// The key is a passphrase, not raw key bytes; it is padded/truncated to the
/// cipher's key size. Existing databases depend on that derivation, so it
/// must not change without a migration.
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Passphrase used to encrypt stored secrets (required, set via
    /// WORKPUSH_SECURITY__ENCRYPTION_KEY or config/local.toml)
    #[serde(default)]
    pub encryption_key: String,
}

/// WeCom API client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WecomConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Request timeout for all WeCom API calls
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Access tokens are expired this many seconds before the TTL the
    /// platform reports, so a cached token is never used at the edge.
    #[serde(default = "default_token_margin_secs")]
    pub token_margin_secs: u64,
}

fn default_api_base() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_token_margin_secs() -> u64 {
    300
}

impl Default for WecomConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            token_margin_secs: default_token_margin_secs(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub wecom: WecomConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: WORKPUSH_)
            // e.g., WORKPUSH_SECURITY__ENCRYPTION_KEY, WORKPUSH_WEB__PORT
            .add_source(
                Environment::with_prefix("WORKPUSH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG
            .get()
            .expect("Config not initialized. Call AppConfig::init() first.")
    }
}
