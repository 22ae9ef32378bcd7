//! Diagnosis key bundle import.
//!
//! A bundle is a zip archive with two entries:
//!
//! - `export.bin`: a 16-byte header followed by a protobuf
//!   `TemporaryExposureKeyExport`.
//! - `export.sig`: a protobuf `TEKSignatureList`.
//!
//! The protobuf schema is the established exposure-key export format; the
//! messages in [`proto`] reproduce its field numbers and wire types.

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use prost::Message;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::{PeriodicKey, DEFAULT_ROLLING_PERIOD};

/// Archive entry holding the key export.
pub const EXPORT_ENTRY: &str = "export.bin";

/// Archive entry holding the signature list.
pub const SIGNATURE_ENTRY: &str = "export.sig";

/// Length of the header in front of the export payload.
pub const HEADER_LEN: usize = 16;

/// Header written by current exporters.
pub const EXPORT_HEADER: &[u8; HEADER_LEN] = b"EK Export v1    ";

/// Largest decompressed archive entry the importer accepts.
pub const MAX_ENTRY_BYTES: u64 = 16 * 1024 * 1024;

/// Protobuf messages of the export format.
#[allow(missing_docs)]
pub mod proto {
    /// The body of `export.bin` after the header.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TemporaryExposureKeyExport {
        #[prost(fixed64, optional, tag = "1")]
        pub start_timestamp: Option<u64>,
        #[prost(fixed64, optional, tag = "2")]
        pub end_timestamp: Option<u64>,
        #[prost(string, optional, tag = "3")]
        pub region: Option<String>,
        #[prost(int32, optional, tag = "4")]
        pub batch_num: Option<i32>,
        #[prost(int32, optional, tag = "5")]
        pub batch_size: Option<i32>,
        #[prost(message, repeated, tag = "6")]
        pub signature_infos: Vec<SignatureInfo>,
        #[prost(message, repeated, tag = "7")]
        pub keys: Vec<TemporaryExposureKey>,
        #[prost(message, repeated, tag = "8")]
        pub revised_keys: Vec<TemporaryExposureKey>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SignatureInfo {
        #[prost(string, optional, tag = "3")]
        pub verification_key_version: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub verification_key_id: Option<String>,
        #[prost(string, optional, tag = "5")]
        pub signature_algorithm: Option<String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TemporaryExposureKey {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub key_data: Option<Vec<u8>>,
        #[prost(int32, optional, tag = "2")]
        pub transmission_risk_level: Option<i32>,
        #[prost(int32, optional, tag = "3")]
        pub rolling_start_interval_number: Option<i32>,
        #[prost(int32, optional, tag = "4")]
        pub rolling_period: Option<i32>,
        /// Wire value of the `ReportType` enum (0 unknown through 5 revoked).
        #[prost(int32, optional, tag = "5")]
        pub report_type: Option<i32>,
        #[prost(sint32, optional, tag = "6")]
        pub days_since_onset_of_symptoms: Option<i32>,
    }

    /// The body of `export.sig`.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TekSignatureList {
        #[prost(message, repeated, tag = "1")]
        pub signatures: Vec<TekSignature>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TekSignature {
        #[prost(message, optional, tag = "1")]
        pub signature_info: Option<SignatureInfo>,
        #[prost(int32, optional, tag = "2")]
        pub batch_num: Option<i32>,
        #[prost(int32, optional, tag = "3")]
        pub batch_size: Option<i32>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub signature: Option<Vec<u8>>,
    }
}

/// Errors opening or decoding a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The bundle file could not be read.
    #[error("failed to read bundle: {0}")]
    Io(#[from] std::io::Error),

    /// The container is not a readable zip archive.
    #[error("bundle is not a valid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A required entry is absent.
    #[error("bundle has no '{0}' entry")]
    MissingEntry(&'static str),

    /// An entry decompresses past the size limit.
    #[error("bundle entry '{entry}' exceeds {limit} bytes")]
    EntryTooLarge {
        /// Offending entry.
        entry: &'static str,
        /// Limit in bytes.
        limit: u64,
    },

    /// `export.bin` is not longer than its header.
    #[error("export body has {0} bytes, expected more than {HEADER_LEN}")]
    BodyTooShort(usize),

    /// A protobuf payload failed to decode.
    #[error("failed to decode {part}: {source}")]
    Decode {
        /// Which entry failed.
        part: &'static str,
        /// Decoder error.
        source: prost::DecodeError,
    },
}

/// One diagnosis key bundle, on disk or in memory.
#[derive(Debug, Clone)]
pub struct KeyBundle {
    name: String,
    source: BundleSource,
}

#[derive(Debug, Clone)]
enum BundleSource {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl KeyBundle {
    /// A bundle stored at `path`. The file is read when the bundle is parsed.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            source: BundleSource::File(path),
        }
    }

    /// A bundle already held in memory.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: BundleSource::Memory(bytes),
        }
    }

    /// Display name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of a file-backed bundle.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            BundleSource::File(path) => Some(path),
            BundleSource::Memory(_) => None,
        }
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>, BundleError> {
        match &self.source {
            BundleSource::File(path) => Ok(Cow::Owned(std::fs::read(path)?)),
            BundleSource::Memory(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

/// Everything decoded from one bundle.
#[derive(Debug, Clone, Default)]
pub struct ImportedBundle {
    /// Header text in front of the export payload.
    pub header: String,
    /// Start of the export window, seconds since the epoch.
    pub start_timestamp: Option<u64>,
    /// End of the export window, seconds since the epoch.
    pub end_timestamp: Option<u64>,
    /// Region the keys were published for.
    pub region: Option<String>,
    /// Position of this bundle in its batch.
    pub batch_num: Option<i32>,
    /// Number of bundles in the batch.
    pub batch_size: Option<i32>,
    /// Signatures in `export.sig`.
    pub signature_count: usize,
    /// Key entries that failed validation.
    pub rejected: usize,
    /// Valid keys, in export order.
    pub keys: Vec<PeriodicKey>,
}

/// Parses diagnosis key bundles into periodic keys.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosisKeyImporter {
    max_entry_bytes: u64,
}

impl Default for DiagnosisKeyImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosisKeyImporter {
    /// Create an importer accepting entries up to [`MAX_ENTRY_BYTES`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_entry_bytes: MAX_ENTRY_BYTES,
        }
    }

    /// Change the per-entry size limit.
    #[must_use]
    pub const fn with_max_entry_bytes(mut self, limit: u64) -> Self {
        self.max_entry_bytes = limit;
        self
    }

    /// Decode a bundle. Invalid key entries are counted and skipped.
    ///
    /// The signature list is decoded but not verified.
    ///
    /// # Errors
    ///
    /// Returns a [`BundleError`] if the bundle cannot be opened or decoded.
    pub fn parse(&self, bundle: &KeyBundle) -> Result<ImportedBundle, BundleError> {
        let bytes = bundle.bytes()?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_ref()))?;
        let signature_data = read_entry(&mut archive, SIGNATURE_ENTRY, self.max_entry_bytes)?;
        let body = read_entry(&mut archive, EXPORT_ENTRY, self.max_entry_bytes)?;

        if body.len() <= HEADER_LEN {
            return Err(BundleError::BodyTooShort(body.len()));
        }
        let (header, payload) = body.split_at(HEADER_LEN);

        let signatures = proto::TekSignatureList::decode(signature_data.as_slice()).map_err(
            |source| BundleError::Decode {
                part: SIGNATURE_ENTRY,
                source,
            },
        )?;
        let export =
            proto::TemporaryExposureKeyExport::decode(payload).map_err(|source| {
                BundleError::Decode {
                    part: EXPORT_ENTRY,
                    source,
                }
            })?;

        let mut imported = ImportedBundle {
            header: String::from_utf8_lossy(header).into_owned(),
            start_timestamp: export.start_timestamp,
            end_timestamp: export.end_timestamp,
            region: export.region.clone(),
            batch_num: export.batch_num,
            batch_size: export.batch_size,
            signature_count: signatures.signatures.len(),
            ..ImportedBundle::default()
        };
        for entry in &export.keys {
            match key_from_entry(entry) {
                Ok(key) => imported.keys.push(key),
                Err(reason) => {
                    debug!(bundle = bundle.name(), %reason, "discarding key entry");
                    imported.rejected += 1;
                }
            }
        }
        info!(
            bundle = bundle.name(),
            keys = imported.keys.len(),
            rejected = imported.rejected,
            "parsed diagnosis key bundle"
        );
        Ok(imported)
    }

    /// Keys of a bundle; an unreadable bundle yields no keys.
    #[must_use]
    pub fn import(&self, bundle: &KeyBundle) -> Vec<PeriodicKey> {
        match self.parse(bundle) {
            Ok(imported) => imported.keys,
            Err(e) => {
                warn!(bundle = bundle.name(), error = %e, "skipping unreadable bundle");
                Vec::new()
            }
        }
    }
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &'static str,
    limit: u64,
) -> Result<Vec<u8>, BundleError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(BundleError::MissingEntry(name)),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    entry.take(limit.saturating_add(1)).read_to_end(&mut data)?;
    if data.len() as u64 > limit {
        return Err(BundleError::EntryTooLarge { entry: name, limit });
    }
    Ok(data)
}

fn key_from_entry(entry: &proto::TemporaryExposureKey) -> Result<PeriodicKey, crate::keys::KeyError> {
    PeriodicKey::try_from_raw(
        entry.key_data.as_deref().unwrap_or_default(),
        i64::from(entry.rolling_start_interval_number.unwrap_or(0)),
        entry
            .rolling_period
            .map_or(DEFAULT_ROLLING_PERIOD, i64::from),
        entry.transmission_risk_level.unwrap_or(0),
        entry.report_type.unwrap_or(0),
    )
}
