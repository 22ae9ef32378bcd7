//! Exposure risk scoring.
//!
//! A contact's total risk value is the product of four table lookups, one per
//! input dimension, clamped to `[0, 4096]`. Each input is first mapped to one of
//! eight buckets; a higher bucket means a riskier contact.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entries in each scoring table.
pub const BUCKETS: usize = 8;

/// Largest allowed table entry.
pub const MAX_TABLE_VALUE: u8 = 8;

/// Largest total risk value.
pub const MAX_RISK_VALUE: i32 = 4096;

/// Largest attenuation fed into the calculator, in dB.
pub const MAX_ATTENUATION: i32 = 255;

/// A weight table indexed by bucket.
pub type RiskTable = [u8; BUCKETS];

/// Invalid diagnosis configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskConfigError {
    /// A table does not have eight entries.
    #[error("{table} must have {BUCKETS} entries, got {len}")]
    TableLength {
        /// Offending table.
        table: &'static str,
        /// Supplied length.
        len: usize,
    },

    /// A table entry is outside `[0, 8]`.
    #[error("{table}[{index}] = {value} is outside 0..={MAX_TABLE_VALUE}")]
    TableValue {
        /// Offending table.
        table: &'static str,
        /// Entry index.
        index: usize,
        /// Supplied value.
        value: i32,
    },

    /// A threshold is outside `[0, 255]` or the pair is not ordered.
    #[error("attenuation duration thresholds {0:?} must be ordered and within 0..=255")]
    Thresholds([i32; 2]),

    /// The minimum risk value is outside `[1, 4096]`.
    #[error("minimum risk value threshold {0} is outside 1..=4096")]
    MinimumRiskValue(i32),
}

/// Scoring tables and thresholds for one matching pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDiagnosisConfiguration", into = "RawDiagnosisConfiguration")]
pub struct DiagnosisConfiguration {
    attenuation_risk_values: RiskTable,
    days_after_contacted_risk_values: RiskTable,
    duration_risk_values: RiskTable,
    initial_risk_level_risk_values: RiskTable,
    attenuation_duration_thresholds: [u8; 2],
    minimum_risk_value_threshold: i32,
}

impl Default for DiagnosisConfiguration {
    fn default() -> Self {
        Self {
            attenuation_risk_values: [4; BUCKETS],
            days_after_contacted_risk_values: [4; BUCKETS],
            duration_risk_values: [4; BUCKETS],
            initial_risk_level_risk_values: [4; BUCKETS],
            attenuation_duration_thresholds: [50, 74],
            minimum_risk_value_threshold: 1,
        }
    }
}

/// Unvalidated form used for deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDiagnosisConfiguration {
    /// Weights by attenuation bucket.
    pub attenuation_risk_values: Vec<i32>,
    /// Weights by days-since-contact bucket.
    pub days_after_contacted_risk_values: Vec<i32>,
    /// Weights by duration bucket.
    pub duration_risk_values: Vec<i32>,
    /// Weights by transmission risk.
    pub initial_risk_level_risk_values: Vec<i32>,
    /// Low and high attenuation thresholds, in dB.
    pub attenuation_duration_thresholds: [i32; 2],
    /// Contacts scoring below this are dropped.
    pub minimum_risk_value_threshold: i32,
}

impl Default for RawDiagnosisConfiguration {
    fn default() -> Self {
        DiagnosisConfiguration::default().into()
    }
}

impl From<DiagnosisConfiguration> for RawDiagnosisConfiguration {
    fn from(config: DiagnosisConfiguration) -> Self {
        let widen = |table: RiskTable| table.iter().map(|&v| i32::from(v)).collect();
        Self {
            attenuation_risk_values: widen(config.attenuation_risk_values),
            days_after_contacted_risk_values: widen(config.days_after_contacted_risk_values),
            duration_risk_values: widen(config.duration_risk_values),
            initial_risk_level_risk_values: widen(config.initial_risk_level_risk_values),
            attenuation_duration_thresholds: config
                .attenuation_duration_thresholds
                .map(i32::from),
            minimum_risk_value_threshold: config.minimum_risk_value_threshold,
        }
    }
}

impl TryFrom<RawDiagnosisConfiguration> for DiagnosisConfiguration {
    type Error = RiskConfigError;

    fn try_from(raw: RawDiagnosisConfiguration) -> Result<Self, Self::Error> {
        let [low, high] = raw.attenuation_duration_thresholds;
        let in_range = |v: i32| (0..=MAX_ATTENUATION).contains(&v);
        if !in_range(low) || !in_range(high) || low > high {
            return Err(RiskConfigError::Thresholds(raw.attenuation_duration_thresholds));
        }
        if !(1..=MAX_RISK_VALUE).contains(&raw.minimum_risk_value_threshold) {
            return Err(RiskConfigError::MinimumRiskValue(
                raw.minimum_risk_value_threshold,
            ));
        }
        Ok(Self {
            attenuation_risk_values: table("attenuation_risk_values", &raw.attenuation_risk_values)?,
            days_after_contacted_risk_values: table(
                "days_after_contacted_risk_values",
                &raw.days_after_contacted_risk_values,
            )?,
            duration_risk_values: table("duration_risk_values", &raw.duration_risk_values)?,
            initial_risk_level_risk_values: table(
                "initial_risk_level_risk_values",
                &raw.initial_risk_level_risk_values,
            )?,
            attenuation_duration_thresholds: [narrow(low), narrow(high)],
            minimum_risk_value_threshold: raw.minimum_risk_value_threshold,
        })
    }
}

fn table(name: &'static str, values: &[i32]) -> Result<RiskTable, RiskConfigError> {
    if values.len() != BUCKETS {
        return Err(RiskConfigError::TableLength {
            table: name,
            len: values.len(),
        });
    }
    let mut out = [0u8; BUCKETS];
    for (index, (&value, slot)) in values.iter().zip(out.iter_mut()).enumerate() {
        *slot = u8::try_from(value)
            .ok()
            .filter(|v| *v <= MAX_TABLE_VALUE)
            .ok_or(RiskConfigError::TableValue {
                table: name,
                index,
                value,
            })?;
    }
    Ok(out)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn narrow(value: i32) -> u8 {
    value as u8
}

impl DiagnosisConfiguration {
    /// Build a configuration from its parts.
    ///
    /// # Errors
    ///
    /// Returns a [`RiskConfigError`] for any value out of range.
    pub fn new(
        attenuation_risk_values: RiskTable,
        days_after_contacted_risk_values: RiskTable,
        duration_risk_values: RiskTable,
        initial_risk_level_risk_values: RiskTable,
        attenuation_duration_thresholds: [u8; 2],
        minimum_risk_value_threshold: i32,
    ) -> Result<Self, RiskConfigError> {
        let widen = |table: RiskTable| table.iter().map(|&v| i32::from(v)).collect();
        RawDiagnosisConfiguration {
            attenuation_risk_values: widen(attenuation_risk_values),
            days_after_contacted_risk_values: widen(days_after_contacted_risk_values),
            duration_risk_values: widen(duration_risk_values),
            initial_risk_level_risk_values: widen(initial_risk_level_risk_values),
            attenuation_duration_thresholds: attenuation_duration_thresholds.map(i32::from),
            minimum_risk_value_threshold,
        }
        .try_into()
    }

    /// Low and high attenuation thresholds splitting the duration buckets.
    #[must_use]
    pub const fn attenuation_duration_thresholds(&self) -> [u8; 2] {
        self.attenuation_duration_thresholds
    }

    /// Contacts scoring below this value are discarded.
    #[must_use]
    pub const fn minimum_risk_value_threshold(&self) -> i32 {
        self.minimum_risk_value_threshold
    }
}

/// Attenuation bucket: stronger signal (lower attenuation) scores higher.
#[must_use]
pub const fn attenuation_bucket(attenuation: i32) -> usize {
    if attenuation > 73 {
        0
    } else if attenuation > 63 {
        1
    } else if attenuation > 51 {
        2
    } else if attenuation > 33 {
        3
    } else if attenuation > 27 {
        4
    } else if attenuation > 15 {
        5
    } else if attenuation > 10 {
        6
    } else {
        7
    }
}

/// Duration bucket: `ceil(minutes / 5)`, at most 7.
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub const fn duration_bucket(minutes: i32) -> usize {
    if minutes <= 0 {
        0
    } else if minutes > 35 {
        7
    } else {
        ((minutes + 4) / 5) as usize
    }
}

/// Days bucket: `7 - days / 2`, clamped to `[0, 7]`.
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub const fn days_bucket(days: i64) -> usize {
    let bucket = 7 - days.div_euclid(2);
    if bucket < 0 {
        0
    } else if bucket > 7 {
        7
    } else {
        bucket as usize
    }
}

/// Transmission component: 0 for levels up to 1, else `level - 1`.
#[must_use]
pub const fn transmission_bucket(initial_risk_level: u8) -> usize {
    if initial_risk_level <= 1 {
        0
    } else {
        let bucket = (initial_risk_level - 1) as usize;
        if bucket > 7 {
            7
        } else {
            bucket
        }
    }
}

/// Maps contact parameters to a total risk value.
#[derive(Debug, Clone)]
pub struct RiskScoreCalculator {
    config: DiagnosisConfiguration,
}

impl RiskScoreCalculator {
    /// Create a calculator for one configuration.
    #[must_use]
    pub const fn new(config: DiagnosisConfiguration) -> Self {
        Self { config }
    }

    /// Total risk value of a contact, in `[0, 4096]`.
    #[must_use]
    pub fn score(
        &self,
        attenuation: i32,
        days_since_exposure: i64,
        duration_minutes: i32,
        initial_risk_level: u8,
    ) -> i32 {
        let c = &self.config;
        let total = i32::from(c.attenuation_risk_values[attenuation_bucket(attenuation)])
            * i32::from(c.days_after_contacted_risk_values[days_bucket(days_since_exposure)])
            * i32::from(c.duration_risk_values[duration_bucket(duration_minutes)])
            * i32::from(c.initial_risk_level_risk_values[transmission_bucket(initial_risk_level)]);
        total.clamp(0, MAX_RISK_VALUE)
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &DiagnosisConfiguration {
        &self.config
    }
}
