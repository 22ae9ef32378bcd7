//! Periodic keys and their daily rotation.
//!
//! A periodic key is the 16-byte secret from which a device derives one day of
//! rolling identifiers. Own keys are generated by [`PeriodicKeyStore`], one per
//! app and calendar day. Diagnosis keys are parsed from import bundles and only
//! live for one matching pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, CryptoResult, RollingCodeCipher};
use crate::error::Result;
use crate::storage::{ContactStore, StoredKey};
use crate::time::{same_day, TimeBase, INTERVALS_PER_DAY};
use crate::types::AppId;

/// Length of a periodic key in bytes.
pub const KEY_LEN: usize = 16;

/// Highest transmission risk level.
pub const MAX_RISK_LEVEL: u8 = 8;

/// Highest report type.
pub const MAX_REPORT_TYPE: u8 = 5;

/// Rolling period assumed when a bundle entry omits it.
pub const DEFAULT_ROLLING_PERIOD: i64 = INTERVALS_PER_DAY;

/// Reasons a raw key entry is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Key content is not 16 bytes.
    #[error("key content must be {KEY_LEN} bytes, got {0}")]
    ContentLength(usize),

    /// Start interval is negative.
    #[error("valid time must not be negative, got {0}")]
    NegativeValidTime(i64),

    /// Rolling period is negative.
    #[error("life time must not be negative, got {0}")]
    NegativeLifeTime(i64),

    /// Transmission risk level outside [0, 8].
    #[error("transmission risk level must be within 0..={MAX_RISK_LEVEL}, got {0}")]
    RiskLevelOutOfRange(i32),

    /// Report type outside [0, 5].
    #[error("report type must be within 0..={MAX_REPORT_TYPE}, got {0}")]
    ReportTypeOutOfRange(i32),
}

/// A periodic key and its validity window.
///
/// Constructors clamp out-of-range values instead of failing; use
/// [`PeriodicKey::try_from_raw`] where a bad entry must be rejected.
/// Deserialization goes through the same validation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPeriodicKey", into = "RawPeriodicKey")]
pub struct PeriodicKey {
    content: [u8; KEY_LEN],
    valid_time: i64,
    life_time: i64,
    initial_risk_level: u8,
    report_type: u8,
}

impl fmt::Debug for PeriodicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicKey")
            .field("content", &"<redacted>")
            .field("valid_time", &self.valid_time)
            .field("life_time", &self.life_time)
            .field("initial_risk_level", &self.initial_risk_level)
            .field("report_type", &self.report_type)
            .finish()
    }
}

impl PeriodicKey {
    /// Build a key, clamping `valid_time` to be non-negative and `life_time` to
    /// `[0, 144]`.
    #[must_use]
    pub fn new(content: [u8; KEY_LEN], valid_time: i64, life_time: i64) -> Self {
        if valid_time < 0 || !(0..=INTERVALS_PER_DAY).contains(&life_time) {
            debug!(valid_time, life_time, "clamping periodic key window");
        }
        Self {
            content,
            valid_time: valid_time.max(0),
            life_time: life_time.clamp(0, INTERVALS_PER_DAY),
            initial_risk_level: 0,
            report_type: 0,
        }
    }

    /// Set the transmission risk level, clamped to `[0, 8]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_initial_risk_level(mut self, level: i32) -> Self {
        let clamped = level.clamp(0, i32::from(MAX_RISK_LEVEL));
        if clamped != level {
            warn!(level, clamped, "risk level out of range, clamping");
        }
        self.initial_risk_level = clamped as u8;
        self
    }

    /// Set the report type. Values outside `[0, 5]` leave it unchanged.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_report_type(mut self, report_type: i32) -> Self {
        if (0..=i32::from(MAX_REPORT_TYPE)).contains(&report_type) {
            self.report_type = report_type as u8;
        } else {
            warn!(report_type, kept = self.report_type, "report type out of range, ignoring");
        }
        self
    }

    /// Validate a raw key entry without clamping.
    ///
    /// # Errors
    ///
    /// Returns the first [`KeyError`] that applies.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn try_from_raw(
        content: &[u8],
        valid_time: i64,
        life_time: i64,
        initial_risk_level: i32,
        report_type: i32,
    ) -> std::result::Result<Self, KeyError> {
        let content: [u8; KEY_LEN] = content
            .try_into()
            .map_err(|_| KeyError::ContentLength(content.len()))?;
        if valid_time < 0 {
            return Err(KeyError::NegativeValidTime(valid_time));
        }
        if life_time < 0 {
            return Err(KeyError::NegativeLifeTime(life_time));
        }
        if !(0..=i32::from(MAX_RISK_LEVEL)).contains(&initial_risk_level) {
            return Err(KeyError::RiskLevelOutOfRange(initial_risk_level));
        }
        if !(0..=i32::from(MAX_REPORT_TYPE)).contains(&report_type) {
            return Err(KeyError::ReportTypeOutOfRange(report_type));
        }
        let mut key = Self::new(content, valid_time, life_time);
        key.initial_risk_level = initial_risk_level as u8;
        key.report_type = report_type as u8;
        Ok(key)
    }

    /// Secret key bytes.
    #[must_use]
    pub const fn content(&self) -> &[u8; KEY_LEN] {
        &self.content
    }

    /// First interval of validity.
    #[must_use]
    pub const fn valid_time(&self) -> i64 {
        self.valid_time
    }

    /// Number of intervals the key is valid for.
    #[must_use]
    pub const fn life_time(&self) -> i64 {
        self.life_time
    }

    /// Transmission risk level.
    #[must_use]
    pub const fn initial_risk_level(&self) -> u8 {
        self.initial_risk_level
    }

    /// Report type of the diagnosis.
    #[must_use]
    pub const fn report_type(&self) -> u8 {
        self.report_type
    }

    /// Derive the identifier and metadata subkeys of this key.
    ///
    /// # Errors
    ///
    /// Propagates key derivation failures.
    pub fn cipher(&self) -> CryptoResult<RollingCodeCipher> {
        RollingCodeCipher::new(&self.content)
    }
}

/// Serialized form of [`PeriodicKey`], checked on the way in.
#[derive(Serialize, Deserialize)]
struct RawPeriodicKey {
    #[serde(with = "hex_content")]
    content: [u8; KEY_LEN],
    valid_time: i64,
    life_time: i64,
    initial_risk_level: i32,
    report_type: i32,
}

impl From<PeriodicKey> for RawPeriodicKey {
    fn from(key: PeriodicKey) -> Self {
        Self {
            content: key.content,
            valid_time: key.valid_time,
            life_time: key.life_time,
            initial_risk_level: i32::from(key.initial_risk_level),
            report_type: i32::from(key.report_type),
        }
    }
}

impl TryFrom<RawPeriodicKey> for PeriodicKey {
    type Error = KeyError;

    fn try_from(raw: RawPeriodicKey) -> std::result::Result<Self, Self::Error> {
        Self::try_from_raw(
            &raw.content,
            raw.valid_time,
            raw.life_time,
            raw.initial_risk_level,
            raw.report_type,
        )
    }
}

mod hex_content {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::KEY_LEN;

    pub fn serialize<S: Serializer>(content: &[u8; KEY_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_LEN], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| D::Error::invalid_length(bytes.len(), &"16 bytes"))
    }
}

/// The app's key for today.
#[derive(Clone, PartialEq, Eq)]
pub struct CurrentKey {
    /// Secret key bytes.
    pub content: [u8; KEY_LEN],
    /// Interval at which the key was generated.
    pub interval: i64,
    /// Whether this call generated the key.
    pub rotated: bool,
}

impl fmt::Debug for CurrentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentKey")
            .field("interval", &self.interval)
            .field("rotated", &self.rotated)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
struct CachedKey {
    content: [u8; KEY_LEN],
    interval: i64,
}

/// Owner of every app's current periodic key.
pub struct PeriodicKeyStore {
    store: Arc<dyn ContactStore>,
    time: TimeBase,
    cache: Mutex<HashMap<AppId, CachedKey>>,
}

impl fmt::Debug for PeriodicKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicKeyStore")
            .field("cached_apps", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl PeriodicKeyStore {
    /// Create a key store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>, time: TimeBase) -> Self {
        Self {
            store,
            time,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Today's key for `app`, generating and persisting a fresh one on the first
    /// call of a new day.
    ///
    /// The caller is expected to run eviction when `rotated` is set.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the random source fails and a storage error if
    /// the key cannot be read or persisted.
    pub fn get_current_key(&self, app: &AppId) -> Result<CurrentKey> {
        let now = self.time.interval_number();
        let mut cache = self.cache.lock();

        if let Some(cached) = cache.get(app) {
            if same_day(cached.interval, now) {
                return Ok(CurrentKey {
                    content: cached.content,
                    interval: cached.interval,
                    rotated: false,
                });
            }
        }

        if let Some(stored) = self.store.latest_periodic_key(app)? {
            if same_day(stored.interval, now) {
                match <[u8; KEY_LEN]>::try_from(stored.content.as_slice()) {
                    Ok(content) => {
                        debug!(app = %app, interval = stored.interval, "restored periodic key");
                        let restored = CachedKey {
                            content,
                            interval: stored.interval,
                        };
                        cache.insert(app.clone(), restored);
                        return Ok(CurrentKey {
                            content,
                            interval: stored.interval,
                            rotated: false,
                        });
                    }
                    Err(_) => warn!(
                        app = %app,
                        len = stored.content.len(),
                        "stored periodic key is damaged, regenerating"
                    ),
                }
            }
        }

        let content = generate_key()?;
        self.store.insert_periodic_key(&StoredKey {
            app: app.clone(),
            content: content.to_vec(),
            interval: now,
        })?;
        cache.insert(
            app.clone(),
            CachedKey {
                content,
                interval: now,
            },
        );
        info!(app = %app, interval = now, "generated new periodic key");
        Ok(CurrentKey {
            content,
            interval: now,
            rotated: true,
        })
    }

    /// Every stored key of `app`, each valid until the end of its day.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the keys cannot be read.
    pub fn history_keys(&self, app: &AppId) -> Result<Vec<PeriodicKey>> {
        let keys = self
            .store
            .periodic_keys(app)?
            .into_iter()
            .filter_map(|stored| {
                let Ok(content) = <[u8; KEY_LEN]>::try_from(stored.content.as_slice()) else {
                    warn!(app = %app, interval = stored.interval, "skipping damaged stored key");
                    return None;
                };
                let life_time = INTERVALS_PER_DAY - stored.interval.rem_euclid(INTERVALS_PER_DAY);
                Some(PeriodicKey::new(content, stored.interval, life_time))
            })
            .collect();
        Ok(keys)
    }

    /// Forget the cached key of `app`.
    pub fn forget(&self, app: &AppId) {
        self.cache.lock().remove(app);
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        debug!("clearing periodic key cache");
        self.cache.lock().clear();
    }
}

fn generate_key() -> std::result::Result<[u8; KEY_LEN], CryptoError> {
    let mut content = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut content)
        .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::time::{ManualClock, SECONDS_PER_DAY};

    const DAY_100: i64 = 100 * SECONDS_PER_DAY;

    fn fixture(seconds: i64) -> (Arc<ManualClock>, Arc<MemoryStore>, PeriodicKeyStore) {
        let clock = Arc::new(ManualClock::at_epoch_seconds(seconds));
        let store = Arc::new(MemoryStore::new());
        let keys = PeriodicKeyStore::new(store.clone(), TimeBase::new(clock.clone()));
        (clock, store, keys)
    }

    fn app() -> AppId {
        AppId::new("org.example.tracer").unwrap()
    }

    #[test]
    fn test_first_call_generates_and_persists() {
        let (_clock, store, keys) = fixture(DAY_100 + 3_600);
        let key = keys.get_current_key(&app()).unwrap();
        assert!(key.rotated);
        assert_eq!(key.interval, 100 * 144 + 6);
        let stored = store.latest_periodic_key(&app()).unwrap().unwrap();
        assert_eq!(stored.content, key.content.to_vec());
    }

    #[test]
    fn test_same_day_returns_cached_key() {
        let (clock, _store, keys) = fixture(DAY_100);
        let first = keys.get_current_key(&app()).unwrap();
        clock.advance_seconds(3_600 * 5);
        let second = keys.get_current_key(&app()).unwrap();
        assert!(!second.rotated);
        assert_eq!(first.content, second.content);
    }

    #[test]
    fn test_new_day_rotates() {
        let (clock, store, keys) = fixture(DAY_100);
        let first = keys.get_current_key(&app()).unwrap();
        clock.advance_seconds(SECONDS_PER_DAY);
        let second = keys.get_current_key(&app()).unwrap();
        assert!(second.rotated);
        assert_ne!(first.content, second.content);
        assert_eq!(store.periodic_keys(&app()).unwrap().len(), 2);
    }

    #[test]
    fn test_restores_from_store_after_clear() {
        let (_clock, _store, keys) = fixture(DAY_100);
        let first = keys.get_current_key(&app()).unwrap();
        keys.clear();
        let restored = keys.get_current_key(&app()).unwrap();
        assert!(!restored.rotated);
        assert_eq!(first.content, restored.content);
    }

    #[test]
    fn test_keys_are_per_app() {
        let (_clock, _store, keys) = fixture(DAY_100);
        let other = AppId::new("org.example.other").unwrap();
        let a = keys.get_current_key(&app()).unwrap();
        let b = keys.get_current_key(&other).unwrap();
        assert_ne!(a.content, b.content);
    }

    #[test]
    fn test_history_life_time_runs_to_end_of_day() {
        let (_clock, store, keys) = fixture(DAY_100);
        store
            .insert_periodic_key(&StoredKey {
                app: app(),
                content: vec![1; 16],
                interval: 144 * 99 + 44,
            })
            .unwrap();
        store
            .insert_periodic_key(&StoredKey {
                app: app(),
                content: vec![2; 3],
                interval: 144 * 99 + 50,
            })
            .unwrap();
        let history = keys.history_keys(&app()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].valid_time(), 144 * 99 + 44);
        assert_eq!(history[0].life_time(), 100);
    }

    #[test]
    fn test_constructor_clamps() {
        let key = PeriodicKey::new([0; 16], -5, 500)
            .with_initial_risk_level(12)
            .with_report_type(9);
        assert_eq!(key.valid_time(), 0);
        assert_eq!(key.life_time(), 144);
        assert_eq!(key.initial_risk_level(), 8);
        assert_eq!(key.report_type(), 0);

        let key = PeriodicKey::new([0; 16], 10, -1).with_initial_risk_level(-3);
        assert_eq!(key.life_time(), 0);
        assert_eq!(key.initial_risk_level(), 0);
    }

    #[test]
    fn test_try_from_raw_rejects() {
        assert_eq!(
            PeriodicKey::try_from_raw(&[0; 15], 0, 144, 0, 0),
            Err(KeyError::ContentLength(15))
        );
        assert_eq!(
            PeriodicKey::try_from_raw(&[0; 16], -1, 144, 0, 0),
            Err(KeyError::NegativeValidTime(-1))
        );
        assert_eq!(
            PeriodicKey::try_from_raw(&[0; 16], 0, -1, 0, 0),
            Err(KeyError::NegativeLifeTime(-1))
        );
        assert_eq!(
            PeriodicKey::try_from_raw(&[0; 16], 0, 144, 9, 0),
            Err(KeyError::RiskLevelOutOfRange(9))
        );
        assert_eq!(
            PeriodicKey::try_from_raw(&[0; 16], 0, 144, 0, 6),
            Err(KeyError::ReportTypeOutOfRange(6))
        );
        let key = PeriodicKey::try_from_raw(&[9; 16], 288, 144, 6, 1).unwrap();
        assert_eq!(key.initial_risk_level(), 6);
        assert_eq!(key.report_type(), 1);
    }

    #[test]
    fn test_debug_redacts_content() {
        let key = PeriodicKey::new([0xab; 16], 0, 144);
        assert!(!format!("{key:?}").contains("171"));
        assert!(format!("{key:?}").contains("redacted"));
    }

    #[test]
    fn test_serde_hex_content() {
        let key = PeriodicKey::new([0x0f; 16], 144, 144);
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("0f0f0f0f"));
        let back: PeriodicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_deserialize_validates_fields() {
        let content = "0f".repeat(16);
        let entry = |valid_time: i64, life_time: i64, risk: i32, report: i32| {
            format!(
                r#"{{"content":"{content}","valid_time":{valid_time},"life_time":{life_time},"initial_risk_level":{risk},"report_type":{report}}}"#
            )
        };
        assert!(serde_json::from_str::<PeriodicKey>(&entry(-1, 144, 0, 0)).is_err());
        assert!(serde_json::from_str::<PeriodicKey>(&entry(10, -5, 0, 0)).is_err());
        assert!(serde_json::from_str::<PeriodicKey>(&entry(10, 144, 9, 0)).is_err());
        assert!(serde_json::from_str::<PeriodicKey>(&entry(10, 144, 0, 6)).is_err());

        let clamped: PeriodicKey = serde_json::from_str(&entry(10, 500, 8, 5)).unwrap();
        assert_eq!(clamped.life_time(), 144);
        assert_eq!(clamped.initial_risk_level(), 8);
    }
}
