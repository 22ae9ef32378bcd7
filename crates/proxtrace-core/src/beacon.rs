//! Wire format of the advertised beacon.
//!
//! A beacon is the rolling identifier followed by the encrypted metadata, 20
//! bytes in total at fixed offsets.

use crate::types::{Identifier, MetadataBytes, IDENTIFIER_LEN, METADATA_LEN};

/// Total beacon length.
pub const BEACON_LEN: usize = IDENTIFIER_LEN + METADATA_LEN;

/// One advertised beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Beacon {
    /// Rolling identifier.
    pub identifier: Identifier,
    /// Encrypted metadata.
    pub metadata: MetadataBytes,
}

impl Beacon {
    /// Pack into the 20-byte payload.
    #[must_use]
    pub fn pack(&self) -> [u8; BEACON_LEN] {
        let mut payload = [0u8; BEACON_LEN];
        payload[..IDENTIFIER_LEN].copy_from_slice(&self.identifier);
        payload[IDENTIFIER_LEN..].copy_from_slice(&self.metadata);
        payload
    }

    /// Unpack a payload. Returns `None` if fewer than 20 bytes are given; any
    /// trailing bytes are ignored.
    #[must_use]
    pub fn unpack(payload: &[u8]) -> Option<Self> {
        let identifier = payload.get(..IDENTIFIER_LEN)?.try_into().ok()?;
        let metadata = payload.get(IDENTIFIER_LEN..BEACON_LEN)?.try_into().ok()?;
        Some(Self {
            identifier,
            metadata,
        })
    }
}
