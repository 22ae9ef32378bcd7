//! Rolling identifier and metadata cipher.
//!
//! From one 16-byte periodic key two independent subkeys are derived with
//! HKDF-SHA256 (no salt, info = ASCII context string):
//!
//! - the identifier key (`"EN-RPIK"`) encrypts, with AES-128 in ECB mode, a padded
//!   block carrying the interval number; the ciphertext is the rolling identifier
//!   for that interval.
//! - the metadata key (`"EN-AEMK"`) encrypts the 4-byte beacon metadata with
//!   AES-128-CTR, using the rolling identifier as the initial counter block.
//!
//! Every primitive failure is reported as a [`CryptoError`]; nothing here maps a
//! failure to an empty or zero-filled output.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::time::encode_interval;
use crate::types::{Identifier, MetadataBytes, IDENTIFIER_LEN};

/// HKDF info string for the identifier subkey.
pub const IDENTIFIER_KEY_INFO: &[u8] = b"EN-RPIK";

/// HKDF info string for the metadata subkey.
pub const METADATA_KEY_INFO: &[u8] = b"EN-AEMK";

/// ASCII tag at the start of every padded identifier block.
pub const IDENTIFIER_TAG: &[u8; 6] = b"EN-RPI";

/// Byte offset of the encoded interval number inside the padded block.
pub const INTERVAL_OFFSET: usize = 12;

/// Length of every derived subkey.
pub const SUBKEY_LEN: usize = 16;

/// Metadata format version carried in byte 0.
pub const METADATA_VERSION: u8 = 0b0100_0000;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Errors from key derivation and the AES primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// HKDF refused the requested output length.
    #[error("HKDF expansion failed for context '{context}'")]
    KeyDerivation {
        /// Hex encoded context of the failed expansion.
        context: String,
    },

    /// A key or IV had the wrong length for the cipher.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Which input was wrong.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// The operating system random source failed.
    #[error("random source failure: {0}")]
    RandomSource(String),
}

/// Result alias for cryptographic operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Derive a 16-byte subkey from `ikm` with HKDF-SHA256, no salt, one expansion block.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the expansion fails.
pub fn derive_subkey(ikm: &[u8], info: &'static [u8]) -> CryptoResult<[u8; SUBKEY_LEN]> {
    let mut output = [0u8; SUBKEY_LEN];
    hkdf_expand(ikm, info, &mut output)?;
    Ok(output)
}

fn hkdf_expand(ikm: &[u8], info: &[u8], output: &mut [u8]) -> CryptoResult<()> {
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, output)
        .map_err(|_| CryptoError::KeyDerivation {
            context: hex::encode(info),
        })
}

/// Build the plaintext block encrypted into the identifier for `interval`.
#[must_use]
pub fn padded_identifier_block(interval: i64) -> [u8; IDENTIFIER_LEN] {
    let mut block = [0u8; IDENTIFIER_LEN];
    block[..IDENTIFIER_TAG.len()].copy_from_slice(IDENTIFIER_TAG);
    block[INTERVAL_OFFSET..INTERVAL_OFFSET + 4].copy_from_slice(&encode_interval(interval));
    block
}

/// Build the metadata plaintext advertised with every identifier.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn metadata_plaintext(tx_power: i8) -> MetadataBytes {
    [METADATA_VERSION, tx_power as u8, 0, 0]
}

/// Read the calibrated TX power out of decrypted metadata.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn tx_power_of(plaintext: &MetadataBytes) -> i8 {
    plaintext[1] as i8
}

/// Both subkeys of one periodic key, ready for repeated use.
#[derive(Clone)]
pub struct RollingCodeCipher {
    identifier_cipher: Aes128,
    metadata_key: [u8; SUBKEY_LEN],
}

impl std::fmt::Debug for RollingCodeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingCodeCipher").finish_non_exhaustive()
    }
}

impl RollingCodeCipher {
    /// Derive the identifier and metadata subkeys from a periodic key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if `periodic_key` is not 16 bytes, or a
    /// derivation error from HKDF.
    pub fn new(periodic_key: &[u8]) -> CryptoResult<Self> {
        if periodic_key.len() != SUBKEY_LEN {
            return Err(CryptoError::InvalidLength {
                what: "periodic key",
                expected: SUBKEY_LEN,
                actual: periodic_key.len(),
            });
        }
        let identifier_key = derive_subkey(periodic_key, IDENTIFIER_KEY_INFO)?;
        let metadata_key = derive_subkey(periodic_key, METADATA_KEY_INFO)?;
        let identifier_cipher =
            Aes128::new_from_slice(&identifier_key).map_err(|_| CryptoError::InvalidLength {
                what: "identifier key",
                expected: SUBKEY_LEN,
                actual: identifier_key.len(),
            })?;
        Ok(Self {
            identifier_cipher,
            metadata_key,
        })
    }

    /// Rolling identifier broadcast during `interval`.
    #[must_use]
    pub fn derive_identifier(&self, interval: i64) -> Identifier {
        let mut block = GenericArray::from(padded_identifier_block(interval));
        self.identifier_cipher.encrypt_block(&mut block);
        let mut identifier = [0u8; IDENTIFIER_LEN];
        identifier.copy_from_slice(&block);
        identifier
    }

    /// Encrypt beacon metadata under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if the cipher rejects key or IV.
    pub fn encrypt_metadata(
        &self,
        identifier: &Identifier,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.apply_metadata_keystream(identifier, plaintext)
    }

    /// Decrypt metadata observed together with `identifier`.
    ///
    /// CTR mode is symmetric, so this is the same keystream application as
    /// encryption. The plaintext is not checked beyond its length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if the cipher rejects key or IV.
    pub fn decrypt_metadata(
        &self,
        identifier: &Identifier,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.apply_metadata_keystream(identifier, ciphertext)
    }

    /// Decrypt metadata and return it only if it has the expected 4-byte shape.
    ///
    /// # Errors
    ///
    /// Propagates cipher failures; a wrong-length plaintext is `Ok(None)`.
    pub fn decrypt_metadata_block(
        &self,
        identifier: &Identifier,
        ciphertext: &[u8],
    ) -> CryptoResult<Option<MetadataBytes>> {
        let plaintext = self.decrypt_metadata(identifier, ciphertext)?;
        Ok(<MetadataBytes>::try_from(plaintext.as_slice()).ok())
    }

    fn apply_metadata_keystream(&self, identifier: &Identifier, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut cipher = Aes128Ctr::new_from_slices(&self.metadata_key, identifier).map_err(|_| {
            CryptoError::InvalidLength {
                what: "metadata key or IV",
                expected: SUBKEY_LEN,
                actual: identifier.len(),
            }
        })?;
        let mut buffer = data.to_vec();
        cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [
        0x75, 0xc7, 0x34, 0xc6, 0xdd, 0x1a, 0x78, 0x2d, 0xe7, 0xa9, 0x65, 0xda, 0x5e, 0xb9, 0x31,
        0x25,
    ];

    #[test]
    fn test_padded_block_layout() {
        let block = padded_identifier_block(0x0102_0304);
        assert_eq!(&block[..6], b"EN-RPI");
        assert_eq!(&block[6..12], &[0u8; 6]);
        assert_eq!(&block[12..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_subkeys_are_distinct() {
        let identifier_key = derive_subkey(&KEY, IDENTIFIER_KEY_INFO).unwrap();
        let metadata_key = derive_subkey(&KEY, METADATA_KEY_INFO).unwrap();
        assert_ne!(identifier_key, metadata_key);
    }

    #[test]
    fn test_failed_expansion_reports_hex_context() {
        let mut too_long = vec![0u8; 255 * 32 + 1];
        let err = hkdf_expand(&KEY, &[0xff, 0x00, 0x41], &mut too_long).unwrap_err();
        assert_eq!(
            err,
            CryptoError::KeyDerivation {
                context: "ff0041".into()
            }
        );
    }

    #[test]
    fn test_hkdf_is_first_block_of_rfc5869_expansion() {
        let mut long = [0u8; 32];
        Hkdf::<Sha256>::new(None, &KEY)
            .expand(IDENTIFIER_KEY_INFO, &mut long)
            .unwrap();
        let short = derive_subkey(&KEY, IDENTIFIER_KEY_INFO).unwrap();
        assert_eq!(&long[..16], &short);
    }

    #[test]
    fn test_identifier_is_deterministic() {
        let cipher = RollingCodeCipher::new(&KEY).unwrap();
        let other = RollingCodeCipher::new(&KEY).unwrap();
        assert_eq!(cipher.derive_identifier(2_650_847), other.derive_identifier(2_650_847));
    }

    #[test]
    fn test_identifier_changes_with_interval() {
        let cipher = RollingCodeCipher::new(&KEY).unwrap();
        assert_ne!(cipher.derive_identifier(2_650_847), cipher.derive_identifier(2_650_848));
    }

    #[test]
    fn test_identifier_changes_with_key() {
        let mut other_key = KEY;
        other_key[0] ^= 1;
        let a = RollingCodeCipher::new(&KEY).unwrap();
        let b = RollingCodeCipher::new(&other_key).unwrap();
        assert_ne!(a.derive_identifier(100), b.derive_identifier(100));
    }

    #[test]
    fn test_bad_key_length_is_an_error_not_empty_output() {
        let err = RollingCodeCipher::new(&[0u8; 15]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidLength {
                what: "periodic key",
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn test_metadata_ciphertext_differs_from_plaintext() {
        let cipher = RollingCodeCipher::new(&KEY).unwrap();
        let identifier = cipher.derive_identifier(7);
        let plaintext = metadata_plaintext(-19);
        let ciphertext = cipher.encrypt_metadata(&identifier, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 4);
        assert_ne!(ciphertext, plaintext.to_vec());
    }

    #[test]
    fn test_wrong_length_metadata_decrypts_to_none() {
        let cipher = RollingCodeCipher::new(&KEY).unwrap();
        let identifier = cipher.derive_identifier(7);
        assert_eq!(
            cipher.decrypt_metadata_block(&identifier, &[1, 2, 3]).unwrap(),
            None
        );
    }

    #[test]
    fn test_unknown_metadata_version_is_tolerated() {
        // Decrypted metadata is accepted on length alone; the version byte is not checked.
        let cipher = RollingCodeCipher::new(&KEY).unwrap();
        let identifier = cipher.derive_identifier(9);
        let odd_version = [0xff, 0x10, 0xaa, 0xbb];
        let ciphertext = cipher.encrypt_metadata(&identifier, &odd_version).unwrap();
        assert_eq!(
            cipher.decrypt_metadata_block(&identifier, &ciphertext).unwrap(),
            Some(odd_version)
        );
    }

    #[test]
    fn test_tx_power_round_trip() {
        assert_eq!(tx_power_of(&metadata_plaintext(-19)), -19);
        assert_eq!(tx_power_of(&metadata_plaintext(8)), 8);
    }

    proptest! {
        #[test]
        fn prop_metadata_round_trip(key in any::<[u8; 16]>(), interval in 0i64..5_000_000, plaintext in any::<[u8; 4]>()) {
            let cipher = RollingCodeCipher::new(&key).unwrap();
            let identifier = cipher.derive_identifier(interval);
            let ciphertext = cipher.encrypt_metadata(&identifier, &plaintext).unwrap();
            let decrypted = cipher.decrypt_metadata(&identifier, &ciphertext).unwrap();
            prop_assert_eq!(decrypted, plaintext.to_vec());
        }
    }
}
