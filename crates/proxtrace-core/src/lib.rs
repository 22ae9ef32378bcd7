//! # proxtrace-core
//!
//! Core logic for a privacy-preserving proximity tracing protocol.
//!
//! Devices advertise short-lived rolling identifiers derived from a daily
//! secret, record the identifiers they hear, and later match those recordings
//! against keys published by diagnosed users.
//!
//! ## Architecture
//!
//! - [`keys`] - daily periodic keys of the local apps
//! - [`crypto`] - HKDF subkeys, rolling identifiers and metadata encryption
//! - [`beacon`] - the 20-byte advertisement payload
//! - [`scan`] - per-cycle sighting aggregation with a daily quota
//! - [`bundle`] - diagnosis key bundle import
//! - [`matching`] - matching published keys against sightings
//! - [`risk`] - risk configuration and scoring
//! - [`exposure`] - sketches, details and windows
//! - [`storage`] - the persistence trait with memory and JSON file backends
//! - [`session`] - start/notify-once session state
//! - [`executor`] - sequential queue and worker pool
//! - [`service`] - the composition root and its async front end
//! - [`config`] - engine settings
//! - [`time`] - clock and interval arithmetic
//! - [`error`] - unified error types for the crate
//! - [`types`] - shared byte types and app identity

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod beacon;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod exposure;
pub mod keys;
pub mod matching;
pub mod risk;
pub mod scan;
pub mod service;
pub mod session;
pub mod storage;
pub mod time;
pub mod types;

// Re-export primary types for convenience
pub use beacon::{Beacon, BEACON_LEN};
pub use bundle::{BundleError, DiagnosisKeyImporter, ImportedBundle, KeyBundle};
pub use config::{
    default_config_path, default_data_dir, Calibration, ConfigError, ConfigResult, ShieldSettings,
};
pub use crypto::{CryptoError, RollingCodeCipher};
pub use error::{Result, ShieldError};
pub use executor::{SequentialQueue, TaskError, TaskQueues, WorkerPool};
pub use exposure::{ContactDetail, ContactSketch, ContactWindow, ExposureStore, ScanInfo};
pub use keys::{CurrentKey, KeyError, PeriodicKey, PeriodicKeyStore};
pub use matching::{MatchingEngine, WINDOW_MODE_TOKEN};
pub use risk::{DiagnosisConfiguration, RiskConfigError, RiskScoreCalculator};
pub use scan::{FlushReport, ScanAggregator, ScanError, Sighting};
pub use service::{ContactShield, ShieldRuntime};
pub use session::{ContactSession, StartAttempt, StartOutcome};
pub use storage::{ContactStore, JsonFileStore, MemoryStore, StoreError};
pub use time::{Clock, ManualClock, SystemClock, TimeBase};
pub use types::{AppId, InvalidAppId};
