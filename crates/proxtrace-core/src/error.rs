//! Unified error types for the proxtrace core library.
//!
//! This module provides a unified error type [`ShieldError`] that covers all failure
//! modes across the tracing engine. Each module also has its own specific error type
//! (`CryptoError`, `KeyError`, `BundleError`, `ScanError`, `StoreError`, `ConfigError`)
//! for internal use.
//!
//! # Recovery policy
//!
//! - **Per-entity failures** (one bad key entry, one undecryptable sighting, one
//!   unreadable bundle) are logged and skipped by the caller; they never abort a
//!   matching pass or an import batch.
//! - **Crypto failures on the app's own key** are surfaced, never replaced with a
//!   zero-filled key.
//! - **Storage failures** propagate to whoever triggered the operation. There is no
//!   retry in the core.
//!
//! # Example
//!
//! ```rust
//! use proxtrace_core::error::{Result, ShieldError};
//!
//! fn require_identifier(bytes: &[u8]) -> Result<[u8; 16]> {
//!     bytes
//!         .try_into()
//!         .map_err(|_| ShieldError::MalformedSighting(format!("identifier has {} bytes", bytes.len())))
//! }
//! # assert!(require_identifier(&[0u8; 3]).is_err());
//! ```

use thiserror::Error;

/// The unified error type for all proxtrace operations.
#[derive(Debug, Error)]
pub enum ShieldError {
    // =========================================================================
    // CRYPTOGRAPHIC ERRORS
    // =========================================================================
    /// Key derivation, encryption or the random source failed.
    #[error("Cryptographic operation failed: {0}")]
    CryptoFailure(String),

    // =========================================================================
    // INPUT VALIDATION ERRORS
    // =========================================================================
    /// A periodic key carried an out-of-range field.
    #[error("Malformed periodic key: {0}")]
    MalformedKey(String),

    /// A diagnosis key bundle could not be opened or decoded.
    #[error("Malformed diagnosis key bundle: {0}")]
    MalformedBundle(String),

    /// A radio sighting had the wrong shape.
    #[error("Malformed sighting: {0}")]
    MalformedSighting(String),

    /// The app identity is not a valid package name.
    #[error("Invalid app identity: '{0}'. Expected a dotted package name such as 'org.example.app'.")]
    InvalidAppId(String),

    // =========================================================================
    // STORAGE ERRORS
    // =========================================================================
    /// The persistence collaborator failed.
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// The daily sighting quota is exhausted.
    #[error("Daily sighting quota of {limit} records is exhausted. Scanning resumes tomorrow.")]
    QuotaExceeded {
        /// Configured daily limit.
        limit: i64,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The settings file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The settings were parsed but contain invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // RUNTIME ERRORS
    // =========================================================================
    /// A queued task was dropped or panicked.
    #[error("Background task failed: {0}")]
    TaskFailure(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for proxtrace operations.
pub type Result<T> = std::result::Result<T, ShieldError>;

impl ShieldError {
    /// Returns `true` if this error comes from a cryptographic primitive.
    #[inline]
    #[must_use]
    pub const fn is_crypto_error(&self) -> bool {
        matches!(self, Self::CryptoFailure(_))
    }

    /// Returns `true` if this error is about a single malformed input entity.
    #[inline]
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedKey(_)
                | Self::MalformedBundle(_)
                | Self::MalformedSighting(_)
                | Self::InvalidAppId(_)
        )
    }

    /// Returns `true` if this error is related to persistence.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::StorageFailure(_) | Self::QuotaExceeded { .. } | Self::IoError(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if the failing entity can be skipped and the surrounding
    /// batch continued.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedKey(_)
                | Self::MalformedBundle(_)
                | Self::MalformedSighting(_)
                | Self::QuotaExceeded { .. }
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::CryptoFailure(_) => "CRYPTO_FAILURE",
            Self::MalformedKey(_) => "MALFORMED_KEY",
            Self::MalformedBundle(_) => "MALFORMED_BUNDLE",
            Self::MalformedSighting(_) => "MALFORMED_SIGHTING",
            Self::InvalidAppId(_) => "INVALID_APP_ID",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::TaskFailure(_) => "TASK_FAILURE",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::crypto::CryptoError> for ShieldError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        Self::CryptoFailure(err.to_string())
    }
}

impl From<crate::keys::KeyError> for ShieldError {
    fn from(err: crate::keys::KeyError) -> Self {
        Self::MalformedKey(err.to_string())
    }
}

impl From<crate::bundle::BundleError> for ShieldError {
    fn from(err: crate::bundle::BundleError) -> Self {
        use crate::bundle::BundleError;
        match err {
            BundleError::Io(e) => Self::IoError(e),
            other => Self::MalformedBundle(other.to_string()),
        }
    }
}

impl From<crate::scan::ScanError> for ShieldError {
    fn from(err: crate::scan::ScanError) -> Self {
        use crate::scan::ScanError;
        match err {
            ScanError::QuotaExceeded { limit } => Self::QuotaExceeded { limit },
            ScanError::Store(e) => e.into(),
            other => Self::MalformedSighting(other.to_string()),
        }
    }
}

impl From<crate::storage::StoreError> for ShieldError {
    fn from(err: crate::storage::StoreError) -> Self {
        Self::StorageFailure(err.to_string())
    }
}

impl From<crate::config::ConfigError> for ShieldError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Serialize(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::WriteError { path, source } => {
                Self::StorageFailure(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::Validation { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::NoDataDirectory => {
                Self::ConfigValidationError("Cannot determine data directory".into())
            }
        }
    }
}

impl From<crate::risk::RiskConfigError> for ShieldError {
    fn from(err: crate::risk::RiskConfigError) -> Self {
        Self::ConfigValidationError(err.to_string())
    }
}

impl From<crate::executor::TaskError> for ShieldError {
    fn from(err: crate::executor::TaskError) -> Self {
        Self::TaskFailure(err.to_string())
    }
}

impl From<crate::types::InvalidAppId> for ShieldError {
    fn from(err: crate::types::InvalidAppId) -> Self {
        Self::InvalidAppId(err.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================
