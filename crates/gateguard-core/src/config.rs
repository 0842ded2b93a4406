//! Configuration parsing and validation.
//!
//! Configuration is read from TOML. Every section and field is optional and
//! falls back to the defaults below; unknown keys are rejected.
//!
//! ```toml
//! [ledger]
//! max_entries = 100000
//! eviction_percent = 10
//! max_age_secs = 0
//!
//! [in_flight]
//! ttl_secs = 600
//! sweep_interval_secs = 60
//!
//! [store]
//! database = "gateguard.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default ledger capacity.
pub const DEFAULT_MAX_LEDGER_ENTRIES: usize = 100_000;

/// Default share of the ledger evicted when it reaches capacity.
pub const DEFAULT_EVICTION_PERCENT: u8 = 10;

/// Default staleness threshold for in-flight marks (10 minutes).
pub const DEFAULT_IN_FLIGHT_TTL_SECS: u64 = 600;

/// Default period of the in-flight sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Upper bound for `ledger.max_age_secs` and `in_flight.ttl_secs` (100
/// years). Keeps `now - horizon` inside the representable time range.
pub const MAX_HORIZON_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its permitted range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level guard configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardConfig {
    /// Idempotency ledger settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// In-flight tracker settings.
    #[serde(default)]
    pub in_flight: InFlightConfig,

    /// Storage settings for the command-line front end.
    #[serde(default)]
    pub store: StoreConfig,
}

impl GuardConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every value against its permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.max_entries == 0 {
            return Err(ConfigError::Validation(
                "ledger.max_entries must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.ledger.eviction_percent) {
            return Err(ConfigError::Validation(format!(
                "ledger.eviction_percent must be within 1..=100, got {}",
                self.ledger.eviction_percent
            )));
        }
        if self.ledger.max_age_secs > MAX_HORIZON_SECS {
            return Err(ConfigError::Validation(format!(
                "ledger.max_age_secs must be at most {MAX_HORIZON_SECS}, got {}",
                self.ledger.max_age_secs
            )));
        }
        if self.in_flight.ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "in_flight.ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.in_flight.ttl_secs > MAX_HORIZON_SECS {
            return Err(ConfigError::Validation(format!(
                "in_flight.ttl_secs must be at most {MAX_HORIZON_SECS}, got {}",
                self.in_flight.ttl_secs
            )));
        }
        if self.in_flight.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "in_flight.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Idempotency ledger settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Entry count at which the oldest entries are evicted.
    pub max_entries: usize,

    /// Percentage of `max_entries` evicted in one batch.
    pub eviction_percent: u8,

    /// Entries older than this many seconds are purged on insert.
    /// Zero disables age-based retention.
    pub max_age_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_LEDGER_ENTRIES,
            eviction_percent: DEFAULT_EVICTION_PERCENT,
            max_age_secs: 0,
        }
    }
}

impl LedgerConfig {
    /// Creates a config with custom capacity and default eviction settings.
    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Sets the age-based retention horizon.
    #[must_use]
    pub const fn with_max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Number of entries removed by one capacity eviction (at least one).
    #[must_use]
    pub fn eviction_batch(&self) -> usize {
        let percent = usize::from(self.eviction_percent.clamp(1, 100));
        self.max_entries.saturating_mul(percent).div_ceil(100).max(1)
    }

    /// Age-based retention horizon, if enabled.
    #[must_use]
    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.max_age_secs == 0 {
            return None;
        }
        i64::try_from(self.max_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }
}

/// In-flight tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InFlightConfig {
    /// Marks older than this many seconds are removed by the sweep.
    pub ttl_secs: u64,

    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
}

impl Default for InFlightConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_IN_FLIGHT_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl InFlightConfig {
    /// Staleness threshold as a duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep period as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the `SQLite` database holding entities and the ledger.
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("gateguard.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GuardConfig::from_toml("").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.ledger.max_entries, DEFAULT_MAX_LEDGER_ENTRIES);
        assert_eq!(config.in_flight.ttl(), Duration::from_secs(600));
        assert_eq!(config.store.database, PathBuf::from("gateguard.db"));
    }

    #[test]
    fn test_partial_config() {
        let config = GuardConfig::from_toml(
            r#"
            [ledger]
            max_entries = 500

            [store]
            database = "/var/lib/gateguard/state.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.max_entries, 500);
        assert_eq!(config.ledger.eviction_percent, DEFAULT_EVICTION_PERCENT);
        assert_eq!(config.in_flight, InFlightConfig::default());
        assert_eq!(
            config.store.database,
            PathBuf::from("/var/lib/gateguard/state.db")
        );
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = GuardConfig::from_toml("[ledger]\ncapacity = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = GuardConfig::from_toml("[ledger]\nmax_entries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_out_of_range_eviction_percent() {
        let err = GuardConfig::from_toml("[ledger]\neviction_percent = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = GuardConfig::from_toml("[ledger]\neviction_percent = 101\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = GuardConfig::from_toml("[in_flight]\nttl_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("ttl_secs"));
    }

    #[test]
    fn test_rejects_unbounded_horizons() {
        let err = GuardConfig::from_toml("[ledger]\nmax_age_secs = 9000000000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_age_secs"));

        let err =
            GuardConfig::from_toml("[in_flight]\nttl_secs = 9000000000000000\n").unwrap_err();
        assert!(err.to_string().contains("ttl_secs"));

        let config =
            GuardConfig::from_toml(&format!("[ledger]\nmax_age_secs = {MAX_HORIZON_SECS}\n"))
                .unwrap();
        assert!(config.ledger.max_age().is_some());
    }

    #[test]
    fn test_eviction_batch_rounds_up() {
        assert_eq!(LedgerConfig::with_max_entries(100).eviction_batch(), 10);
        assert_eq!(LedgerConfig::with_max_entries(25).eviction_batch(), 3);
        assert_eq!(LedgerConfig::with_max_entries(5).eviction_batch(), 1);
        assert_eq!(LedgerConfig::with_max_entries(1).eviction_batch(), 1);
    }

    #[test]
    fn test_max_age() {
        assert_eq!(LedgerConfig::default().max_age(), None);
        assert_eq!(
            LedgerConfig::default().with_max_age_secs(30).max_age(),
            Some(chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = GuardConfig::default();
        config.ledger.max_entries = 42;
        let rendered = config.to_toml().unwrap();
        assert_eq!(GuardConfig::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateguard.toml");
        std::fs::write(&path, "[in_flight]\nttl_secs = 120\n").unwrap();

        let config = GuardConfig::from_file(&path).unwrap();
        assert_eq!(config.in_flight.ttl_secs, 120);

        let err = GuardConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
