//! Configuration management for keyledger services
//!
//! Values come from a `.env` file (if present) and `KEYLEDGER_*` environment
//! variables. Nested sections are separated by a double underscore, e.g.
//! `KEYLEDGER_ENVELOPE__MASTER_KEY` or `KEYLEDGER_ANCHOR__URL`.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "KEYLEDGER";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which envelope backend wraps key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeBackend {
    #[default]
    Local,
    Provider,
}

/// External key-protection provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub key_id: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_id: None,
            timeout_ms: 5_000,
        }
    }
}

/// Envelope configuration
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub backend: EnvelopeBackend,
    /// 64 hex chars, or any string (hashed with SHA-256)
    pub master_key: Option<String>,
    pub provider: ProviderConfig,
}

impl fmt::Debug for EnvelopeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeConfig")
            .field("backend", &self.backend)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider)
            .finish()
    }
}

/// How the audit chain verifier treats hashes it cannot reproduce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerifyMode {
    /// Unreproducible hash is a broken chain
    #[default]
    Strict,
    /// Unreproducible hash with intact linkage is flagged, not broken
    Tolerant,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub verify_mode: AuditVerifyMode,
}

/// Notarization (audit anchoring) settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub network: Option<String>,
    pub timeout_ms: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            network: None,
            timeout_ms: 10_000,
        }
    }
}

impl AnchorConfig {
    /// Anchoring runs only when enabled and an endpoint is set
    pub fn is_active(&self) -> bool {
        self.enabled && self.url.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Periodic rotation trigger settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Store settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the JSON snapshot; in-memory only when unset
    pub path: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    pub envelope: EnvelopeConfig,
    pub grace_period_days_default: u32,
    pub audit: AuditConfig,
    pub anchor: AnchorConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            envelope: EnvelopeConfig::default(),
            grace_period_days_default: 7,
            audit: AuditConfig::default(),
            anchor: AnchorConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            log_level: None,
            log_json: false,
        }
    }
}

impl KmsConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_source(Self::environment())
    }

    /// Load configuration from an explicit variable map (same names as the environment)
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_source(Self::environment().source(Some(vars)))
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn from_source(source: config::Environment) -> Result<Self, ConfigError> {
        let settings = config::Config::builder().add_source(source).build()?;
        let config: KmsConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the services cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.envelope.backend == EnvelopeBackend::Provider {
            if self.envelope.provider.endpoint.is_none() {
                return Err(ConfigError::Invalid(
                    "envelope.provider.endpoint must be set when envelope.backend=provider"
                        .to_string(),
                ));
            }
            if self.envelope.provider.key_id.is_none() {
                return Err(ConfigError::Invalid(
                    "envelope.provider.key_id must be set when envelope.backend=provider"
                        .to_string(),
                ));
            }
        }
        if self.envelope.provider.timeout_ms == 0 || self.anchor.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "provider and anchor timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = KmsConfig::from_map(HashMap::new()).unwrap();
        assert_eq!(config.envelope.backend, EnvelopeBackend::Local);
        assert_eq!(config.grace_period_days_default, 7);
        assert_eq!(config.audit.verify_mode, AuditVerifyMode::Strict);
        assert!(!config.anchor.is_active());
        assert_eq!(config.scheduler.interval(), Duration::from_secs(3_600));
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn test_nested_values_from_variables() {
        let config = KmsConfig::from_map(vars(&[
            ("KEYLEDGER_GRACE_PERIOD_DAYS_DEFAULT", "14"),
            ("KEYLEDGER_ENVELOPE__MASTER_KEY", "correct horse"),
            ("KEYLEDGER_AUDIT__VERIFY_MODE", "tolerant"),
            ("KEYLEDGER_ANCHOR__ENABLED", "true"),
            ("KEYLEDGER_ANCHOR__URL", "http://127.0.0.1:9000/anchor"),
            ("KEYLEDGER_SCHEDULER__INTERVAL_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.grace_period_days_default, 14);
        assert_eq!(config.envelope.master_key.as_deref(), Some("correct horse"));
        assert_eq!(config.audit.verify_mode, AuditVerifyMode::Tolerant);
        assert!(config.anchor.is_active());
        assert_eq!(config.scheduler.interval_secs, 60);
    }

    #[test]
    fn test_provider_backend_requires_endpoint() {
        let result = KmsConfig::from_map(vars(&[("KEYLEDGER_ENVELOPE__BACKEND", "provider")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_master_key_is_redacted_in_debug() {
        let config = EnvelopeConfig {
            master_key: Some("super-secret".to_string()),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
