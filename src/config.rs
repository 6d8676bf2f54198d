//! Configuration of the voucher server.
//!
//! Settings come from a JSON file (`--config`, env `CONFIG`, default `config.json`).
//! Every field is optional: a missing field falls back to an environment variable, then to
//! a hardcoded default. A missing file at the default path means "all defaults".
//!
//! ```json
//! {
//!   "port": 8080,
//!   "device": {
//!     "address": "192.168.88.1:8728",
//!     "username": "api",
//!     "password": "$ROUTER_PASSWORD"
//!   },
//!   "offers": { "1h": "1H", "1d": "1D", "1w": "1W" },
//!   "notifications": { "sender_pattern": "(?i)^mvola$" },
//!   "expiry": { "sweep_interval_secs": 60, "max_age_secs": 420 }
//! }
//! ```

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::routeros::RouterOsConfig;
use crate::notification::ConfirmationParser;
use crate::offer::OfferCatalog;
use crate::util::LiteralOrEnv;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// CLI arguments for the voucher server.
#[derive(Parser, Debug)]
#[command(name = "hotspot-voucher")]
#[command(about = "Mobile-money hotspot voucher server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    device: DeviceConfig,
    #[serde(default)]
    offers: OfferCatalog,
    #[serde(default)]
    notifications: NotificationConfig,
    #[serde(default)]
    expiry: ExpiryConfig,
}

/// Connection to the hotspot controller's API service.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// `host:port`; defaults to `$ROUTER_HOST:$ROUTER_PORT`.
    #[serde(default = "config_defaults::default_device_address")]
    pub address: String,
    #[serde(default = "config_defaults::default_device_username")]
    pub username: LiteralOrEnv<String>,
    #[serde(default = "config_defaults::default_device_password")]
    pub password: LiteralOrEnv<String>,
    #[serde(default = "config_defaults::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "config_defaults::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "config_defaults::default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: config_defaults::default_device_address(),
            username: config_defaults::default_device_username(),
            password: config_defaults::default_device_password(),
            connect_timeout_secs: config_defaults::default_connect_timeout_secs(),
            command_timeout_secs: config_defaults::default_command_timeout_secs(),
            reconnect_delay_secs: config_defaults::default_reconnect_delay_secs(),
        }
    }
}

impl DeviceConfig {
    pub fn routeros(&self) -> RouterOsConfig {
        RouterOsConfig {
            address: self.address.clone(),
            username: self.username.inner().clone(),
            password: self.password.inner().clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Which inbound notifications count as payment confirmations.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Regex the sender identifier must match.
    #[serde(default = "config_defaults::default_sender_pattern")]
    pub sender_pattern: String,
    /// Token that follows the amount in the message, e.g. `Ar` in `1 000 Ar`.
    #[serde(default = "config_defaults::default_currency_marker")]
    pub currency_marker: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            sender_pattern: config_defaults::default_sender_pattern(),
            currency_marker: config_defaults::default_currency_marker(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "config_defaults::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age after which an unpaid session is evicted.
    #[serde(default = "config_defaults::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: config_defaults::default_sweep_interval_secs(),
            max_age_secs: config_defaults::default_max_age_secs(),
        }
    }
}

impl ExpiryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            device: DeviceConfig::default(),
            offers: OfferCatalog::default(),
            notifications: NotificationConfig::default(),
            expiry: ExpiryConfig::default(),
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::device::routeros::DEFAULT_API_PORT;
    use crate::notification::{DEFAULT_CURRENCY_MARKER, DEFAULT_SENDER_PATTERN};
    use crate::util::LiteralOrEnv;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const DEFAULT_ROUTER_HOST: &str = "192.168.88.1";
    pub const DEFAULT_ROUTER_USER: &str = "admin";

    /// Returns the default port value with fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST)
    }

    /// `$ROUTER_HOST:$ROUTER_PORT`, falling back to `192.168.88.1` and the API port.
    pub fn default_device_address() -> String {
        let host = env::var("ROUTER_HOST").unwrap_or_else(|_| DEFAULT_ROUTER_HOST.to_string());
        let port = env::var("ROUTER_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(DEFAULT_API_PORT);
        format!("{host}:{port}")
    }

    pub fn default_device_username() -> LiteralOrEnv<String> {
        LiteralOrEnv::from_literal(
            env::var("ROUTER_USER").unwrap_or_else(|_| DEFAULT_ROUTER_USER.to_string()),
        )
    }

    pub fn default_device_password() -> LiteralOrEnv<String> {
        LiteralOrEnv::from_literal(env::var("ROUTER_PASSWORD").unwrap_or_default())
    }

    pub fn default_connect_timeout_secs() -> u64 {
        10
    }

    pub fn default_command_timeout_secs() -> u64 {
        10
    }

    pub fn default_reconnect_delay_secs() -> u64 {
        5
    }

    pub fn default_sender_pattern() -> String {
        DEFAULT_SENDER_PATTERN.to_string()
    }

    pub fn default_currency_marker() -> String {
        DEFAULT_CURRENCY_MARKER.to_string()
    }

    pub fn default_sweep_interval_secs() -> u64 {
        60
    }

    pub fn default_max_age_secs() -> u64 {
        7 * 60
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid notification pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("No offers configured")]
    NoOffers,
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn offers(&self) -> &OfferCatalog {
        &self.offers
    }

    pub fn notifications(&self) -> &NotificationConfig {
        &self.notifications
    }

    pub fn expiry(&self) -> &ExpiryConfig {
        &self.expiry
    }

    /// Compiles the configured sender pattern and currency marker.
    pub fn confirmation_parser(&self) -> Result<ConfirmationParser, ConfigError> {
        let parser = ConfirmationParser::new(
            &self.notifications.sender_pattern,
            &self.notifications.currency_marker,
        )?;
        Ok(parser)
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument (or `$CONFIG`)
    /// 2. `./config.json`, if it exists; defaults otherwise
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        if cli_args.config == Path::new(DEFAULT_CONFIG_PATH) && !cli_args.config.exists() {
            tracing::info!("No {DEFAULT_CONFIG_PATH} found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(cli_args.config)
    }

    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        if config.offers.is_empty() {
            return Err(ConfigError::NoOffers);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{DEFAULT_CURRENCY_MARKER, DEFAULT_SENDER_PATTERN};

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.offers(), &OfferCatalog::default());
        assert_eq!(config.notifications().sender_pattern, DEFAULT_SENDER_PATTERN);
        assert_eq!(config.notifications().currency_marker, DEFAULT_CURRENCY_MARKER);
        assert_eq!(config.expiry().sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.expiry().max_age(), Duration::from_secs(420));
        assert_eq!(config.device().reconnect_delay(), Duration::from_secs(5));
        assert_eq!(
            config.device().routeros().connect_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_json(
            r#"{
                "host": "127.0.0.1",
                "port": 3000,
                "device": {
                    "address": "10.0.0.1:8729",
                    "username": "voucher",
                    "password": "s3cret",
                    "command_timeout_secs": 3
                },
                "offers": { "30m": "HALF" },
                "notifications": { "sender_pattern": "^OrangeMoney$", "currency_marker": "MGA" },
                "expiry": { "sweep_interval_secs": 30, "max_age_secs": 600 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.host(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.port(), 3000);
        let routeros = config.device().routeros();
        assert_eq!(routeros.address, "10.0.0.1:8729");
        assert_eq!(routeros.username, "voucher");
        assert_eq!(routeros.password, "s3cret");
        assert_eq!(routeros.command_timeout, Duration::from_secs(3));
        assert!(config.offers().lookup("30m").is_some());
        assert!(config.offers().lookup("1h").is_none());
        assert_eq!(config.expiry().max_age(), Duration::from_secs(600));
        assert!(config.confirmation_parser().is_ok());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"offers": {}}"#),
            Err(ConfigError::NoOffers)
        ));
        assert!(matches!(
            Config::from_json(r#"{"port": "eighty"}"#),
            Err(ConfigError::JsonParse(_))
        ));
        let config = Config::from_json(r#"{"notifications": {"sender_pattern": "("}}"#).unwrap();
        assert!(matches!(
            config.confirmation_parser(),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load_from_path(PathBuf::from("/nonexistent/hotspot.json"));
        assert!(matches!(result, Err(ConfigError::FileRead(..))));
    }

    #[test]
    fn test_debug_output_hides_password() {
        let config = Config::from_json(r#"{"device": {"password": "s3cret"}}"#).unwrap();
        assert!(!format!("{config:?}").contains("s3cret"));
        assert!(!format!("{:?}", config.device().routeros()).contains("s3cret"));
    }
}
