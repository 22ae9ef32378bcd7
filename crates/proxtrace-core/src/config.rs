//! Engine settings management.
//!
//! Handles loading, saving, and validating proxtrace settings including:
//! - Incubation period used for key matching and data retention
//! - Sighting retention and the daily sighting quota
//! - Device calibration (TX power and RSSI correction)
//! - Where persistent data lives
//!
//! Settings are layered: compiled defaults, then an optional TOML file, then
//! `PROXTRACE__*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default incubation period in days.
pub const DEFAULT_INCUBATION_PERIOD_DAYS: i64 = 14;

/// Longest incubation period accepted.
pub const MAX_INCUBATION_PERIOD_DAYS: i64 = 60;

/// Default number of days sightings are kept.
pub const DEFAULT_SCAN_DATA_RETENTION_DAYS: i64 = 60;

/// Default number of sightings stored per day (around 100 MB of records).
pub const DEFAULT_DAILY_SIGHTING_LIMIT: i64 = 1896 * 1024;

/// Default cap on the gap between two scan cycles.
pub const DEFAULT_MAX_SECONDS_SINCE_LAST_SCAN: u32 = 300;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PROXTRACE";

/// Errors from loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered sources could not be merged or deserialized.
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    /// Settings could not be serialized to TOML.
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The settings file could not be written.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A field holds an out-of-range value.
    #[error("invalid value for '{field}': {message}")]
    Validation {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// No platform data directory could be determined.
    #[error("cannot determine data directory")]
    NoDataDirectory,
}

/// Result alias for settings operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Radio calibration of the local device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    /// Correction subtracted from every attenuation, in dB.
    pub rssi_correction: i32,

    /// Calibrated transmit power advertised in beacon metadata, in dBm.
    pub tx_power: i8,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            rssi_correction: -5,
            tx_power: -19,
        }
    }
}

/// Main engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldSettings {
    /// Days a diagnosis key, own key, or exposure result stays relevant.
    pub incubation_period_days: i64,

    /// Days sightings are kept before eviction.
    pub scan_data_retention_days: i64,

    /// Maximum sightings persisted per calendar day.
    pub daily_sighting_limit: i64,

    /// Cap on the computed seconds between two scan cycles.
    pub max_seconds_since_last_scan: u32,

    /// Local radio calibration.
    pub calibration: Calibration,

    /// Directory for persistent data. `None` picks the platform default.
    pub data_dir: Option<PathBuf>,
}

impl Default for ShieldSettings {
    fn default() -> Self {
        Self {
            incubation_period_days: DEFAULT_INCUBATION_PERIOD_DAYS,
            scan_data_retention_days: DEFAULT_SCAN_DATA_RETENTION_DAYS,
            daily_sighting_limit: DEFAULT_DAILY_SIGHTING_LIMIT,
            max_seconds_since_last_scan: DEFAULT_MAX_SECONDS_SINCE_LAST_SCAN,
            calibration: Calibration::default(),
            data_dir: None,
        }
    }
}

impl ShieldSettings {
    /// Load settings from defaults, an optional TOML file, and the environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is out of range.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validated()
    }

    /// Save settings to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check ranges, clamping the incubation period like the protocol does.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for values that cannot be clamped.
    pub fn validated(mut self) -> ConfigResult<Self> {
        let clamped = self
            .incubation_period_days
            .clamp(1, MAX_INCUBATION_PERIOD_DAYS);
        if clamped != self.incubation_period_days {
            warn!(
                requested = self.incubation_period_days,
                clamped, "incubation period out of range, clamping"
            );
            self.incubation_period_days = clamped;
        }
        if self.scan_data_retention_days < 1 {
            return Err(ConfigError::Validation {
                field: "scan_data_retention_days",
                message: format!("must be at least 1, got {}", self.scan_data_retention_days),
            });
        }
        if self.daily_sighting_limit < 0 {
            return Err(ConfigError::Validation {
                field: "daily_sighting_limit",
                message: format!("must not be negative, got {}", self.daily_sighting_limit),
            });
        }
        if self.max_seconds_since_last_scan == 0 {
            return Err(ConfigError::Validation {
                field: "max_seconds_since_last_scan",
                message: "must be greater than zero".into(),
            });
        }
        Ok(self)
    }

    /// Directory holding the store, falling back to the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDataDirectory`] when no directory is configured and
    /// the platform has none.
    pub fn resolved_data_dir(&self) -> ConfigResult<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        default_data_dir()
    }
}

/// Platform data directory for proxtrace.
///
/// # Errors
///
/// Returns [`ConfigError::NoDataDirectory`] if the platform exposes no home directory.
pub fn default_data_dir() -> ConfigResult<PathBuf> {
    directories::ProjectDirs::from("", "", "proxtrace")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::NoDataDirectory)
}

/// Default settings file location.
///
/// # Errors
///
/// Returns [`ConfigError::NoDataDirectory`] if the platform exposes no home directory.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    directories::ProjectDirs::from("", "", "proxtrace")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or(ConfigError::NoDataDirectory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ShieldSettings::default();
        assert_eq!(settings.incubation_period_days, 14);
        assert_eq!(settings.daily_sighting_limit, 1_941_504);
        assert_eq!(settings.calibration.tx_power, -19);
        assert_eq!(settings.calibration.rssi_correction, -5);
    }

    #[test]
    fn test_incubation_period_is_clamped() {
        let settings = ShieldSettings {
            incubation_period_days: 90,
            ..ShieldSettings::default()
        }
        .validated()
        .unwrap();
        assert_eq!(settings.incubation_period_days, 60);

        let settings = ShieldSettings {
            incubation_period_days: 0,
            ..ShieldSettings::default()
        }
        .validated()
        .unwrap();
        assert_eq!(settings.incubation_period_days, 1);
    }

    #[test]
    fn test_negative_limit_rejected() {
        let err = ShieldSettings {
            daily_sighting_limit: -1,
            ..ShieldSettings::default()
        }
        .validated()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation {
                field: "daily_sighting_limit",
                ..
            }
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let settings = ShieldSettings {
            incubation_period_days: 10,
            daily_sighting_limit: 500,
            calibration: Calibration {
                rssi_correction: 3,
                tx_power: -8,
            },
            ..ShieldSettings::default()
        };
        settings.save(&path).unwrap();

        let loaded = ShieldSettings::load(Some(&path)).unwrap();
        assert_eq!(loaded.incubation_period_days, 10);
        assert_eq!(loaded.daily_sighting_limit, 500);
        assert_eq!(loaded.calibration.tx_power, -8);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ShieldSettings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.incubation_period_days, DEFAULT_INCUBATION_PERIOD_DAYS);
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let settings = ShieldSettings {
            data_dir: Some(PathBuf::from("/tmp/proxtrace")),
            ..ShieldSettings::default()
        };
        assert_eq!(
            settings.resolved_data_dir().unwrap(),
            PathBuf::from("/tmp/proxtrace")
        );
    }
}
