//! Configuration data types.

use crate::relay::ForwardingMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Proxy listener and relay settings
    pub proxy: ProxyConfig,

    /// Demo echo backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Transport security settings
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Proxy configuration (listener + relay behavior).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address and port the proxy listens on
    pub listen: SocketAddr,

    /// Upstream backend address every stream is relayed to
    pub upstream: SocketAddr,

    /// `:authority` to use toward the upstream; defaults to the upstream address
    #[serde(default)]
    pub upstream_authority: Option<String>,

    /// Header forwarding discipline: immediate or batch_headers
    #[serde(default)]
    pub forwarding: ForwardingMode,

    /// Connection timeout toward the upstream
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Grace period granted to in-flight streams on shutdown before hard abort
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Demo echo backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Address and port the echo backend listens on
    #[serde(default = "default_backend_listen")]
    pub listen: SocketAddr,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen: default_backend_listen(),
        }
    }
}

/// Transport security configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Common name for self-signed certificate generation
    #[serde(default = "default_common_name")]
    pub common_name: String,

    /// Validity period for generated certificates
    #[serde(default = "default_cert_validity", with = "humantime_serde")]
    pub validity: Duration,

    /// PEM certificate chain path; when set (with `key`), generation is skipped
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// PEM private key path
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// Root CA bundle used by `strict` validation
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Certificate validation policy for outbound connections
    #[serde(default)]
    pub validation: ValidationPolicy,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            validity: default_cert_validity(),
            cert: None,
            key: None,
            ca: None,
            validation: ValidationPolicy::default(),
        }
    }
}

/// Certificate validation policy for TLS client connections.
///
/// `AcceptAny` disables verification entirely and exists for test/demo
/// setups built on self-signed certificates.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    Strict,
    #[default]
    AcceptAny,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_backend_listen() -> SocketAddr {
    "127.0.0.1:10000".parse().unwrap()
}

fn default_common_name() -> String {
    "grelay".to_string()
}

fn default_cert_validity() -> Duration {
    // 5 years, matching the lifetime the demo certificates were issued with.
    Duration::from_secs(5 * 365 * 24 * 60 * 60)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sections() {
        let config = Config {
            global: GlobalConfig::default(),
            proxy: ProxyConfig {
                listen: "127.0.0.1:11000".parse().unwrap(),
                upstream: "127.0.0.1:10000".parse().unwrap(),
                upstream_authority: None,
                forwarding: ForwardingMode::default(),
                connect_timeout: default_connect_timeout(),
                shutdown_grace: default_shutdown_grace(),
            },
            backend: BackendConfig::default(),
            tls: TlsConfig::default(),
        };
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.tls.validation, ValidationPolicy::AcceptAny);
        assert_eq!(config.proxy.forwarding, ForwardingMode::Immediate);
    }

    #[test]
    fn test_forwarding_mode_serde() {
        let mode: ForwardingMode = serde_yaml::from_str("immediate").unwrap();
        assert_eq!(mode, ForwardingMode::Immediate);

        let mode: ForwardingMode = serde_yaml::from_str("batch_headers").unwrap();
        assert_eq!(mode, ForwardingMode::BatchHeaders);
    }

    #[test]
    fn test_validation_policy_serde() {
        let policy: ValidationPolicy = serde_yaml::from_str("strict").unwrap();
        assert_eq!(policy, ValidationPolicy::Strict);

        let policy: ValidationPolicy = serde_yaml::from_str("accept_any").unwrap();
        assert_eq!(policy, ValidationPolicy::AcceptAny);
    }
}
