use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use herald_gate::{MAX_CODE_ATTEMPTS, MIN_CODE_ATTEMPTS};

use crate::error::{RootError, RootResult};

pub const JOB_SECRET_ENV: &str = "HERALD_JOB_SECRET";
pub const ADMIN_SECRET_ENV: &str = "HERALD_ADMIN_SECRET";
pub const ACCESS_KEY_ENV: &str = "HERALD_ACCESS_KEY";

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file, ignored by the memory backend.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    dirs_or_default(".herald/herald.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
        }
    }
}

/// Gatekeeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Verification attempts per one-time code, between 3 and 5.
    #[serde(default = "default_code_max_attempts")]
    pub code_max_attempts: u32,

    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,

    /// Lifetime of an accessor session token.
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,

    #[serde(default = "default_comprehension_attempts")]
    pub comprehension_attempts: u32,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    /// Key for accessor session tokens.
    #[serde(default)]
    pub access_key: String,
}

fn default_code_max_attempts() -> u32 {
    MAX_CODE_ATTEMPTS
}

fn default_code_ttl() -> u64 {
    herald_gate::DEFAULT_CODE_TTL_SECS
}

fn default_access_token_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_comprehension_attempts() -> u32 {
    herald_gate::DEFAULT_COMPREHENSION_ATTEMPTS
}

fn default_provider_timeout() -> u64 {
    10
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            code_max_attempts: default_code_max_attempts(),
            code_ttl_secs: default_code_ttl(),
            access_token_ttl_secs: default_access_token_ttl(),
            comprehension_attempts: default_comprehension_attempts(),
            provider_timeout_secs: default_provider_timeout(),
            access_key: String::new(),
        }
    }
}

/// How a provider signs its callbacks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    #[default]
    None,
    HmacTimestamped,
    HmacUrlBody,
    Ed25519,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub scheme: SignatureScheme,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Accepted during secret rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_public_key: Option<String>,

    /// Public callback URL, signed by the url+body scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Delivery and reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Reject callbacks with an invalid signature instead of logging them.
    #[serde(default)]
    pub strict_signatures: bool,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_recovery")]
    pub breaker_recovery_secs: u64,

    /// Dispatches younger than this are left to the webhooks.
    #[serde(default = "default_drift_min_age")]
    pub drift_min_age_secs: u64,

    #[serde(default = "default_drift_lookback")]
    pub drift_lookback_secs: u64,

    #[serde(default)]
    pub email_webhook: WebhookConfig,

    #[serde(default)]
    pub sms_webhook: WebhookConfig,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_recovery() -> u64 {
    60
}

fn default_drift_min_age() -> u64 {
    2 * 3600
}

fn default_drift_lookback() -> u64 {
    7 * 24 * 3600
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            strict_signatures: false,
            provider_timeout_secs: default_provider_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_recovery_secs: default_breaker_recovery(),
            drift_min_age_secs: default_drift_min_age(),
            drift_lookback_secs: default_drift_lookback(),
            email_webhook: WebhookConfig::default(),
            sms_webhook: WebhookConfig::default(),
        }
    }
}

/// Integrity ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Minimum age of a blockchain submission before it is polled.
    #[serde(default = "default_maturation")]
    pub maturation_secs: u64,

    /// Polls before an unconfirmed proof is marked failed.
    #[serde(default = "default_poll_retry_cap")]
    pub poll_retry_cap: u32,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_signer_identity")]
    pub signer_identity: String,

    /// Ed25519 seed, hex.
    #[serde(default)]
    pub signing_seed: String,
}

fn default_maturation() -> u64 {
    3600
}

fn default_poll_retry_cap() -> u32 {
    10
}

fn default_signer_identity() -> String {
    "herald".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            maturation_secs: default_maturation(),
            poll_retry_cap: default_poll_retry_cap(),
            provider_timeout_secs: default_provider_timeout(),
            signer_identity: default_signer_identity(),
            signing_seed: String::new(),
        }
    }
}

/// Scheduled jobs and the secrets guarding their triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub job_secret: String,

    #[serde(default)]
    pub admin_secret: String,

    #[serde(default = "default_hourly")]
    pub drift_interval_secs: u64,

    #[serde(default = "default_hourly")]
    pub subsidiarity_interval_secs: u64,

    #[serde(default = "default_daily")]
    pub firmness_interval_secs: u64,

    #[serde(default = "default_hourly")]
    pub proof_poll_interval_secs: u64,

    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Run the interval tasks inside `herald serve`.
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
}

fn default_hourly() -> u64 {
    3600
}

fn default_daily() -> u64 {
    24 * 3600
}

fn default_batch_limit() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            job_secret: String::new(),
            admin_secret: String::new(),
            drift_interval_secs: default_hourly(),
            subsidiarity_interval_secs: default_hourly(),
            firmness_interval_secs: default_daily(),
            proof_poll_interval_secs: default_hourly(),
            batch_limit: default_batch_limit(),
            scheduler_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// In-process providers that never leave the host.
    #[default]
    Sandbox,
    /// JSON bridge in front of the real provider accounts.
    Bridge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub mode: ProviderMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_token: Option<String>,
}

/// Top-level configuration for the herald binary.
///
/// Loaded from a TOML file (typically `~/.herald/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

/// 32 random bytes, hex.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl RootConfig {
    /// Defaults with fresh secrets and a fresh signing seed, as written by
    /// `herald init`.
    pub fn generated() -> Self {
        let mut config = Self::default();
        config.gate.access_key = generate_secret();
        config.jobs.job_secret = generate_secret();
        config.jobs.admin_secret = generate_secret();
        config.ledger.signing_seed = herald_ledger::LedgerSigner::generate_seed_hex();
        config
    }

    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration. Environment overrides apply either
    /// way.
    pub fn load(path: &Path) -> RootResult<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
            toml::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    /// Replace secrets with the values found by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(value) = non_empty(JOB_SECRET_ENV) {
            self.jobs.job_secret = value;
        }
        if let Some(value) = non_empty(ADMIN_SECRET_ENV) {
            self.jobs.admin_secret = value;
        }
        if let Some(value) = non_empty(ACCESS_KEY_ENV) {
            self.gate.access_key = value;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RootResult<()> {
        let attempts = self.gate.code_max_attempts;
        if !(MIN_CODE_ATTEMPTS..=MAX_CODE_ATTEMPTS).contains(&attempts) {
            return Err(RootError::Config(format!(
                "code_max_attempts must be between {} and {}, got {}",
                MIN_CODE_ATTEMPTS, MAX_CODE_ATTEMPTS, attempts
            )));
        }
        let non_zero = [
            ("code_ttl_secs", self.gate.code_ttl_secs),
            ("access_token_ttl_secs", self.gate.access_token_ttl_secs),
            ("comprehension_attempts", u64::from(self.gate.comprehension_attempts)),
            ("gate.provider_timeout_secs", self.gate.provider_timeout_secs),
            ("delivery.provider_timeout_secs", self.delivery.provider_timeout_secs),
            ("breaker_threshold", u64::from(self.delivery.breaker_threshold)),
            ("ledger.provider_timeout_secs", self.ledger.provider_timeout_secs),
            ("poll_retry_cap", u64::from(self.ledger.poll_retry_cap)),
            ("drift_interval_secs", self.jobs.drift_interval_secs),
            ("subsidiarity_interval_secs", self.jobs.subsidiarity_interval_secs),
            ("firmness_interval_secs", self.jobs.firmness_interval_secs),
            ("proof_poll_interval_secs", self.jobs.proof_poll_interval_secs),
            ("batch_limit", self.jobs.batch_limit as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(RootError::Config(format!("{} must be > 0", name)));
            }
        }
        if self.delivery.drift_min_age_secs >= self.delivery.drift_lookback_secs {
            return Err(RootError::Config(
                "drift_min_age_secs must be below drift_lookback_secs".into(),
            ));
        }
        if self.providers.mode == ProviderMode::Bridge && self.providers.bridge_url.is_none() {
            return Err(RootError::Config(
                "bridge mode needs providers.bridge_url".into(),
            ));
        }
        Ok(())
    }

    /// Secrets the server cannot start without.
    pub fn ensure_secrets(&self) -> RootResult<()> {
        let required = [
            ("gate.access_key", &self.gate.access_key),
            ("jobs.job_secret", &self.jobs.job_secret),
            ("jobs.admin_secret", &self.jobs.admin_secret),
            ("ledger.signing_seed", &self.ledger.signing_seed),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(RootError::Config(format!(
                    "{} is not set, run `herald init`",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".herald/config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RootConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.backend, StorageBackend::Sqlite);
        assert!(config.database.path.to_str().unwrap().contains(".herald"));
        assert_eq!(config.gate.code_max_attempts, 5);
        assert_eq!(config.gate.code_ttl_secs, 600);
        assert_eq!(config.gate.comprehension_attempts, 3);
        assert_eq!(config.ledger.maturation_secs, 3600);
        assert_eq!(config.ledger.poll_retry_cap, 10);
        assert_eq!(config.providers.mode, ProviderMode::Sandbox);
        assert!(!config.delivery.strict_signatures);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[server]
bind = "0.0.0.0"
port = 9000

[database]
backend = "memory"

[gate]
code_max_attempts = 3

[delivery]
strict_signatures = true

[delivery.email_webhook]
scheme = "hmac_timestamped"
secret = "current"
previous_secret = "old"

[delivery.sms_webhook]
scheme = "hmac_url_body"
secret = "token"
url = "https://herald.example.com/webhooks/sms"

[providers]
mode = "bridge"
bridge_url = "http://127.0.0.1:7000"
"#;
        let config: RootConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.gate.code_max_attempts, 3);
        assert!(config.delivery.strict_signatures);
        assert_eq!(
            config.delivery.email_webhook.scheme,
            SignatureScheme::HmacTimestamped
        );
        assert_eq!(
            config.delivery.email_webhook.previous_secret.as_deref(),
            Some("old")
        );
        assert_eq!(config.delivery.sms_webhook.scheme, SignatureScheme::HmacUrlBody);
        assert_eq!(config.providers.mode, ProviderMode::Bridge);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_ok() {
        assert!(RootConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validate_attempt_ceiling() {
        let mut config = RootConfig::default();
        config.gate.code_max_attempts = 2;
        assert!(config.validate().is_err());
        config.gate.code_max_attempts = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_interval() {
        let mut config = RootConfig::default();
        config.jobs.firmness_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_bridge_needs_url() {
        let mut config = RootConfig::default();
        config.providers.mode = ProviderMode::Bridge;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets_required_until_generated() {
        assert!(RootConfig::default().ensure_secrets().is_err());
        let config = RootConfig::generated();
        assert!(config.ensure_secrets().is_ok());
        assert_eq!(config.jobs.job_secret.len(), 64);
        assert_ne!(config.jobs.job_secret, config.jobs.admin_secret);
    }

    #[test]
    fn test_overrides_replace_secrets() {
        let env: HashMap<&str, &str> = [(JOB_SECRET_ENV, "from-env"), (ADMIN_SECRET_ENV, " ")]
            .into_iter()
            .collect();
        let mut config = RootConfig::default();
        config.jobs.admin_secret = "from-file".into();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.jobs.job_secret, "from-env");
        assert_eq!(config.jobs.admin_secret, "from-file");
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = RootConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.gate.code_ttl_secs, 600);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = std::env::temp_dir().join(format!("herald-test-config-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("config.toml");

        let mut config = RootConfig::generated();
        config.server.port = 9443;
        config.delivery.email_webhook.scheme = SignatureScheme::Ed25519;
        config.delivery.email_webhook.public_key = Some("00".repeat(32));
        config.save(&path).unwrap();

        let loaded = RootConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9443);
        assert_eq!(loaded.ledger.signing_seed, config.ledger.signing_seed);
        assert_eq!(loaded.delivery.email_webhook.scheme, SignatureScheme::Ed25519);
        assert!(loaded.delivery.sms_webhook.secret.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
