//! Configuration management
//!
//! Two sources feed one `ClientConfig`: a TOML file (or a plugin option
//! string `Key=Value;Key=Value`) and either the `SS_*` environment or the
//! command line for addresses. `ClientConfig::validate` turns the result
//! into an immutable `TunnelSettings` the tunnel runs on.

use crate::client::RetryPolicy;
use crate::crypto::{PublicKey, Uid};
use crate::obfuscation::BrowserProfile;
use crate::protocol::HANDSHAKE_TIMEOUT;
use crate::transport::format_addr;
use crate::tunnel::{UNLIMITED_CREDIT, UNLIMITED_RATE};
use crate::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Must specify {0}")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

fn invalid(field: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from either a file path or an inline plugin option string
    pub fn from_source(source: &str) -> Result<Self, ConfigError> {
        if Path::new(source).is_file() {
            return Self::load(source);
        }
        if source.contains('=') {
            return Ok(Self {
                client: ClientConfig::from_plugin_opts(source)?,
                logging: LoggingConfig::default(),
            });
        }
        Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{}: no such file", source),
        )))
    }
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_name() -> String {
    "www.bing.com".to_string()
}

fn default_browser_sig() -> String {
    "chrome".to_string()
}

fn default_num_conn() -> usize {
    4
}

fn default_retry_backoff_secs() -> u64 {
    3
}

fn default_handshake_timeout_secs() -> u64 {
    HANDSHAKE_TIMEOUT
}

fn default_rate() -> f64 {
    UNLIMITED_RATE
}

fn default_credit() -> u64 {
    UNLIMITED_CREDIT
}

/// Client configuration as written by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen host
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Local listen port
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Remote server host
    #[serde(default)]
    pub remote_host: String,
    /// Remote server port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Client identity (base64, 16 or 32 bytes)
    #[serde(default)]
    pub uid: String,
    /// Server X25519 public key (base64)
    #[serde(default)]
    pub public_key: String,
    /// SNI presented in the ClientHello
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Session ticket lifetime hint in seconds; must be non-zero
    #[serde(default)]
    pub ticket_time_hint: u64,
    /// Browser whose ClientHello to imitate (chrome, firefox)
    #[serde(default = "default_browser_sig")]
    pub browser_sig: String,
    /// Physical connections per session
    #[serde(default = "default_num_conn")]
    pub num_conn: usize,
    /// Delay between handshake attempts, in seconds
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Give up after this many attempts per connection (unbounded if unset)
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,
    /// Per-record read timeout during the handshake, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Upload rate in bytes per second
    #[serde(default = "default_rate")]
    pub up_rate: f64,
    /// Download rate in bytes per second
    #[serde(default = "default_rate")]
    pub down_rate: f64,
    /// Upload cap in bytes
    #[serde(default = "default_credit")]
    pub up_credit: u64,
    /// Download cap in bytes
    #[serde(default = "default_credit")]
    pub down_credit: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_host: default_local_host(),
            local_port: None,
            remote_host: String::new(),
            remote_port: default_remote_port(),
            uid: String::new(),
            public_key: String::new(),
            server_name: default_server_name(),
            ticket_time_hint: 0,
            browser_sig: default_browser_sig(),
            num_conn: default_num_conn(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_max_attempts: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            up_rate: default_rate(),
            down_rate: default_rate(),
            up_credit: default_credit(),
            down_credit: default_credit(),
        }
    }
}

impl ClientConfig {
    /// Parse a plugin option string such as
    /// `UID=...;PublicKey=...;ServerName=www.bing.com;TicketTimeHint=3600;NumConn=4;BrowserSig=chrome`
    pub fn from_plugin_opts(opts: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for pair in opts.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Parse(format!("expected Key=Value, got {:?}", pair)))?;
            let value = value.trim();

            match key.trim() {
                "UID" => config.uid = value.to_string(),
                "PublicKey" => config.public_key = value.to_string(),
                "ServerName" => config.server_name = value.to_string(),
                "BrowserSig" => config.browser_sig = value.to_string(),
                "TicketTimeHint" => {
                    config.ticket_time_hint =
                        value.parse().map_err(|e| invalid("ticket_time_hint", e))?
                }
                "NumConn" => config.num_conn = value.parse().map_err(|e| invalid("num_conn", e))?,
                other => return Err(ConfigError::Parse(format!("unknown option {:?}", other))),
            }
        }

        Ok(config)
    }

    /// Overlay addresses from the launch source
    pub fn apply(&mut self, source: &LaunchSource) {
        if let Some(host) = &source.local_host {
            self.local_host = host.clone();
        }
        if source.local_port.is_some() {
            self.local_port = source.local_port;
        }
        if let Some(host) = &source.remote_host {
            self.remote_host = host.clone();
        }
        if let Some(port) = source.remote_port {
            self.remote_port = port;
        }
    }

    /// Check required fields and parse key material
    pub fn validate(&self) -> Result<TunnelSettings, ConfigError> {
        let local_port = self.local_port.ok_or(ConfigError::Missing("local_port"))?;
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::Missing("remote_host"));
        }
        if self.ticket_time_hint == 0 {
            return Err(invalid("ticket_time_hint", "cannot be empty or 0"));
        }
        if self.num_conn == 0 {
            return Err(invalid("num_conn", "must be at least 1"));
        }
        if self.uid.is_empty() {
            return Err(ConfigError::Missing("uid"));
        }
        if self.public_key.is_empty() {
            return Err(ConfigError::Missing("public_key"));
        }

        let uid = Uid::from_base64(&self.uid).map_err(|e| invalid("uid", e))?;
        let server_public =
            PublicKey::from_base64(&self.public_key).map_err(|e| invalid("public_key", e))?;
        let profile = self
            .browser_sig
            .parse::<BrowserProfile>()
            .map_err(|e| invalid("browser_sig", e))?;

        Ok(TunnelSettings {
            local_addr: format_addr(&self.local_host, local_port),
            remote_addr: format_addr(&self.remote_host, self.remote_port),
            uid,
            server_public,
            server_name: self.server_name.clone(),
            ticket_time_hint: self.ticket_time_hint,
            profile,
            num_conn: self.num_conn,
            retry: RetryPolicy {
                backoff: Duration::from_secs(self.retry_backoff_secs),
                max_attempts: self.retry_max_attempts,
            },
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            up_rate: self.up_rate,
            down_rate: self.down_rate,
            up_credit: self.up_credit,
            down_credit: self.down_credit,
        })
    }
}

/// Validated, immutable settings shared by every component of a client
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Local listen address, IPv6 bracketed
    pub local_addr: String,
    /// Remote dial address, IPv6 bracketed
    pub remote_addr: String,
    pub uid: Uid,
    pub server_public: PublicKey,
    pub server_name: String,
    pub ticket_time_hint: u64,
    pub profile: BrowserProfile,
    pub num_conn: usize,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    pub up_rate: f64,
    pub down_rate: f64,
    pub up_credit: u64,
    pub down_credit: u64,
}

/// Addresses and option string supplied at launch, from the `SS_*`
/// environment (plugin mode) or from command-line flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSource {
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    /// Config file path or inline plugin options
    pub options: Option<String>,
}

fn parse_port(field: &'static str, value: Option<String>) -> Result<Option<u16>, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().parse().map(Some).map_err(|e| invalid(field, e)),
        _ => Ok(None),
    }
}

impl LaunchSource {
    /// Read the plugin environment. `None` unless `SS_LOCAL_HOST` is set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(local_host) = lookup("SS_LOCAL_HOST") else {
            return Ok(None);
        };

        Ok(Some(Self {
            local_host: Some(local_host),
            local_port: parse_port("local_port", lookup("SS_LOCAL_PORT"))?,
            remote_host: lookup("SS_REMOTE_HOST").filter(|h| !h.is_empty()),
            remote_port: parse_port("remote_port", lookup("SS_REMOTE_PORT"))?,
            options: lookup("SS_PLUGIN_OPTIONS").filter(|o| !o.is_empty()),
        }))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ServerKeyPair;
    use std::collections::HashMap;

    fn complete() -> ClientConfig {
        ClientConfig {
            local_port: Some(1984),
            remote_host: "203.0.113.7".to_string(),
            uid: Uid::from_bytes(&[9u8; 16]).unwrap().to_base64(),
            public_key: ServerKeyPair::generate().public.to_base64(),
            ticket_time_hint: 3600,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_validate_defaults() {
        let settings = complete().validate().unwrap();
        assert_eq!(settings.local_addr, "127.0.0.1:1984");
        assert_eq!(settings.remote_addr, "203.0.113.7:443");
        assert_eq!(settings.num_conn, 4);
        assert_eq!(settings.retry.backoff, Duration::from_secs(3));
        assert_eq!(settings.retry.max_attempts, None);
        assert_eq!(settings.profile, BrowserProfile::Chrome);
    }

    #[test]
    fn test_fatal_fields_are_named() {
        let mut config = complete();
        config.local_port = None;
        assert!(matches!(config.validate(), Err(ConfigError::Missing("local_port"))));

        let mut config = complete();
        config.remote_host.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("remote_host"))));

        let mut config = complete();
        config.ticket_time_hint = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ticket_time_hint"));

        let mut config = complete();
        config.num_conn = 0;
        assert!(config.validate().is_err());

        let mut config = complete();
        config.uid = "not base64!".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "uid", .. })
        ));
    }

    #[test]
    fn test_ipv6_remote_is_bracketed() {
        let mut config = complete();
        config.remote_host = "2001:db8::1".to_string();
        config.local_host = "::1".to_string();
        let settings = config.validate().unwrap();
        assert_eq!(settings.remote_addr, "[2001:db8::1]:443");
        assert_eq!(settings.local_addr, "[::1]:1984");
    }

    #[test]
    fn test_plugin_opts() {
        let config = ClientConfig::from_plugin_opts(
            "UID=CQkJCQkJCQkJCQkJCQkJCQ==; PublicKey=abc; ServerName=www.example.com;\
             TicketTimeHint=900;NumConn=2;BrowserSig=firefox",
        )
        .unwrap();
        assert_eq!(config.server_name, "www.example.com");
        assert_eq!(config.ticket_time_hint, 900);
        assert_eq!(config.num_conn, 2);
        assert_eq!(config.browser_sig, "firefox");

        assert!(ClientConfig::from_plugin_opts("NumConn=lots").is_err());
        assert!(ClientConfig::from_plugin_opts("Bogus=1").is_err());
    }

    #[test]
    fn test_launch_source_from_env() {
        let env: HashMap<&str, &str> = [
            ("SS_LOCAL_HOST", "127.0.0.1"),
            ("SS_LOCAL_PORT", "1080"),
            ("SS_REMOTE_HOST", "example.org"),
            ("SS_REMOTE_PORT", "8443"),
            ("SS_PLUGIN_OPTIONS", "NumConn=1"),
        ]
        .into_iter()
        .collect();

        let source = LaunchSource::from_lookup(|k| env.get(k).map(|v| v.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(source.local_port, Some(1080));
        assert_eq!(source.remote_port, Some(8443));

        let mut config = ClientConfig::default();
        config.apply(&source);
        assert_eq!(config.remote_host, "example.org");
        assert_eq!(config.remote_port, 8443);

        assert!(LaunchSource::from_lookup(|_| None).unwrap().is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config {
            client: complete(),
            logging: LoggingConfig::default(),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.uid, config.client.uid);
        assert_eq!(parsed.client.num_conn, 4);
    }

    #[test]
    fn test_minimal_toml() {
        let parsed: Config = toml::from_str(
            r#"
            [client]
            local_port = 1984
            remote_host = "example.org"
            ticket_time_hint = 3600
            "#,
        )
        .unwrap();
        assert_eq!(parsed.client.remote_port, 443);
        assert_eq!(parsed.client.up_credit, UNLIMITED_CREDIT);
        assert_eq!(parsed.logging.level, "info");
    }
}
