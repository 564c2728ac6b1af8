use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::CipherSuite;
use serde::Deserialize;

use crate::key_schedule::CipherParams;
use crate::logging::LogLevel;

const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TLS_PORT: u16 = 443;

/// Top-level configuration for one handshake attempt
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub local: LocalConfig,
    /// Deadline for every blocking receive
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default)]
    pub cipher_policy: CipherPolicy,
    #[serde(default)]
    pub trust: TrustSource,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl HandshakeConfig {
    /// Creates a config offering only TLS_RSA_WITH_AES_128_GCM_SHA256 against the native trust store
    pub fn rsa_aes128_gcm(host: impl Into<String>, port: u16) -> Self {
        Self {
            target: TargetConfig {
                host: host.into(),
                port,
                server_name: None,
            },
            local: LocalConfig::default(),
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            cipher_policy: CipherPolicy::default(),
            trust: TrustSource::Native,
            log_level: LogLevel::Info,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.host.trim().is_empty() {
            return Err(ConfigError::Invalid("target.host is empty".to_string()));
        }
        if self.target.port == 0 {
            return Err(ConfigError::Invalid("target.port must be non-zero".to_string()));
        }
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid("receive_timeout_ms must be non-zero".to_string()));
        }
        if self.cipher_policy.offered.is_empty() {
            return Err(ConfigError::Invalid("cipher_policy.offered is empty".to_string()));
        }
        if self.cipher_policy.enforce_rsa_key_exchange {
            if let Some(suite) = self
                .cipher_policy
                .offered
                .iter()
                .find(|suite| CipherParams::for_suite(**suite).is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "{:?} offered while RSA key exchange is enforced",
                    CipherSuite::from(*suite)
                )));
            }
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Identity the leaf certificate must carry. `None` defers to the leaf's
    /// own DNS name, which is all an IP-literal target can offer.
    pub fn expected_server_name(&self) -> Option<String> {
        match &self.target.server_name {
            Some(name) => Some(name.clone()),
            None if self.target.host.parse::<IpAddr>().is_ok() => None,
            None => Some(self.target.host.clone()),
        }
    }
}

/// Remote endpoint of the handshake
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default = "default_tls_port")]
    pub port: u16,
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Local side of the raw connection; unset fields are discovered at connect time
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Which cipher suites to offer and whether to insist on RSA key exchange
#[derive(Debug, Clone, Deserialize)]
pub struct CipherPolicy {
    #[serde(default = "default_offered_suites")]
    pub offered: Vec<u16>,
    #[serde(default = "default_enforce_rsa")]
    pub enforce_rsa_key_exchange: bool,
}

impl Default for CipherPolicy {
    fn default() -> Self {
        Self {
            offered: default_offered_suites(),
            enforce_rsa_key_exchange: default_enforce_rsa(),
        }
    }
}

/// Where trust anchors come from
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrustSource {
    #[default]
    Native,
    PemFile { path: PathBuf },
}

fn default_receive_timeout_ms() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

fn default_tls_port() -> u16 {
    DEFAULT_TLS_PORT
}

fn default_offered_suites() -> Vec<u16> {
    vec![CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256.get_u16()]
}

fn default_enforce_rsa() -> bool {
    true
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid configuration JSON: {}", e),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
