//! Shared types.
//!
//! Most domain types are defined in their respective modules (keys, scan, exposure).

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a rolling identifier in bytes.
pub const IDENTIFIER_LEN: usize = 16;

/// Length of the encrypted metadata in bytes.
pub const METADATA_LEN: usize = 4;

/// A rolling identifier as broadcast over the air.
pub type Identifier = [u8; IDENTIFIER_LEN];

/// Encrypted (or decrypted) beacon metadata.
pub type MetadataBytes = [u8; METADATA_LEN];

/// Maximum accepted length of an app identity.
pub const MAX_APP_ID_LENGTH: usize = 255;

static APP_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("app id pattern compiles")
});

/// Error returned when a string is not a valid app identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid app identity '{0}'")]
pub struct InvalidAppId(pub String);

/// Identity of the host application that owns keys and exposure results.
///
/// App identities use package-name syntax, e.g. `org.example.tracer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    /// Validate and wrap an app identity.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAppId`] if the string is empty, too long, or not a dotted
    /// package name.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidAppId> {
        let value = value.into();
        if is_valid_app_id(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidAppId(value))
        }
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AppId {
    type Error = InvalidAppId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AppId> for String {
    fn from(value: AppId) -> Self {
        value.0
    }
}

impl std::str::FromStr for AppId {
    type Err = InvalidAppId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Check whether `value` is a syntactically valid app identity.
#[must_use]
pub fn is_valid_app_id(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_APP_ID_LENGTH && APP_ID_REGEX.is_match(value)
}
