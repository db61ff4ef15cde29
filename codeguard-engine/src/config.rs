//! Configuration for the integrity engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GuardError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity signal collection
    pub identity: IdentityConfig,
    /// Code issuance
    pub registry: RegistryConfig,
    /// Claim adjudication
    pub claims: ClaimsConfig,
    /// Trade validation
    pub trades: TradesConfig,
    /// Policy sweep
    pub sweep: SweepConfig,
    /// Chat and watch-time gatekeepers
    pub gatekeeper: GatekeeperConfig,
    /// General settings
    pub general: GeneralConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Read and parse a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| GuardError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&yaml)
            .map_err(|e| GuardError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let reg = &self.registry;
        let len = reg.gold_prefix.len() + reg.middle_length + reg.gold_suffix.len();
        if reg.middle_length == 0 || len > reg.max_code_length {
            return Err(GuardError::Config(format!(
                "code template yields {} characters, limit is {}",
                len, reg.max_code_length
            )));
        }
        let literal_ok = |s: &str| s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !literal_ok(&reg.gold_prefix) || !literal_ok(&reg.gold_suffix) {
            return Err(GuardError::Config(
                "gold prefix and suffix must be uppercase alphanumeric".to_string(),
            ));
        }
        if reg.max_generation_attempts == 0 {
            return Err(GuardError::Config(
                "max_generation_attempts must be at least 1".to_string(),
            ));
        }
        if self.gatekeeper.tick_secs == 0 {
            return Err(GuardError::Config("tick_secs must be at least 1".to_string()));
        }
        if self.identity.session_ttl_secs == 0 {
            return Err(GuardError::Config("session_ttl_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Identity signal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Bound on each fingerprint or geolocation lookup (ms)
    pub lookup_timeout_ms: u64,
    /// Geolocation endpoint; `{ip}` is replaced with the address
    pub geo_url_template: String,
    /// Optional bearer token for the geolocation endpoint
    pub geo_token: Option<String>,
    /// Cached session contexts older than this are captured again (s)
    pub session_ttl_secs: u64,
}

impl IdentityConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: 5_000,
            geo_url_template: "https://ipinfo.io/{ip}/json".to_string(),
            geo_token: None,
            session_ttl_secs: 3_600,
        }
    }
}

/// Code issuance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub gold_prefix: String,
    /// Random alphanumeric characters between prefix and suffix
    pub middle_length: usize,
    pub gold_suffix: String,
    /// Upper bound on identifier length
    pub max_code_length: usize,
    /// Gold codes per owner before the farming rule applies
    pub farming_threshold: usize,
    /// Regenerations allowed on identifier collision
    pub max_generation_attempts: usize,
    /// Credits granted on redemption
    pub code_value: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            gold_prefix: "1".to_string(),
            middle_length: 3,
            gold_suffix: "GO".to_string(),
            max_code_length: 8,
            farming_threshold: 4,
            max_generation_attempts: 16,
            code_value: 10,
        }
    }
}

/// Claim adjudication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Bound on one arbiter call (ms)
    pub arbiter_timeout_ms: u64,
    /// Arbiter backend: `rule-based` or `openai`
    pub arbiter: String,
    /// OpenAI-compatible endpoint, used when `arbiter` is `openai`
    pub arbiter_base_url: Option<String>,
    pub arbiter_model: Option<String>,
    pub arbiter_api_key: Option<String>,
}

impl ClaimsConfig {
    pub fn arbiter_timeout(&self) -> Duration {
        Duration::from_millis(self.arbiter_timeout_ms)
    }
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            arbiter_timeout_ms: 30_000,
            arbiter: "rule-based".to_string(),
            arbiter_base_url: None,
            arbiter_model: None,
            arbiter_api_key: None,
        }
    }
}

/// Trade validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradesConfig {
    /// Trades per role above which the re-audit flags (24 h window)
    pub velocity_threshold: i64,
    pub velocity_window_hours: i64,
}

impl Default for TradesConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 10,
            velocity_window_hours: 24,
        }
    }
}

/// Policy sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Animal transfers per role above which both parties are banned
    pub transfer_threshold: i64,
    pub transfer_window_hours: i64,
    /// Level assigned when backfilling animal-mode users
    pub default_animal_level: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            transfer_threshold: 5,
            transfer_window_hours: 24,
            default_animal_level: "1".to_string(),
        }
    }
}

/// Gatekeeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Seconds without interaction after which a viewer is idle
    pub inactivity_limit_secs: i64,
    /// Watch ticker period (seconds)
    pub tick_secs: u64,
    /// Messages returned by `recent_messages` when no limit is given
    pub default_message_limit: u32,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            inactivity_limit_secs: 60,
            tick_secs: 60,
            default_message_limit: 50,
        }
    }
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// SQLite database path
    pub database_path: String,
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "codeguard.db".to_string(),
            log_level: "info".to_string(),
        }
    }
}
