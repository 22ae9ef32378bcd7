//! Matching diagnosis keys against recorded sightings.
//!
//! For every imported key the engine regenerates the key's rolling identifiers,
//! looks each one up in the sighting store, decrypts the metadata of every hit
//! and turns the hits into exposure results:
//!
//! - **detail mode** scores each key's contact and folds the resulting
//!   [`ContactDetail`]s into the sketch of the caller's token;
//! - **window mode** groups each key's hits into [`ContactWindow`]s of at most
//!   30 minutes.
//!
//! Window mode is selected by passing [`WINDOW_MODE_TOKEN`] as the token.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bundle::{DiagnosisKeyImporter, KeyBundle};
use crate::config::{Calibration, ShieldSettings};
use crate::crypto::tx_power_of;
use crate::error::Result;
use crate::exposure::{
    ContactDetail, ContactSketch, ContactWindow, ExposureStore, ScanInfo, MAX_DURATION_MINUTES,
};
use crate::keys::PeriodicKey;
use crate::risk::{DiagnosisConfiguration, RiskScoreCalculator, MAX_ATTENUATION};
use crate::scan::Sighting;
use crate::storage::ContactStore;
use crate::time::{interval_to_day, interval_to_day_millis, TimeBase, INTERVALS_PER_DAY};
use crate::types::AppId;

/// Token value that selects window mode.
pub const WINDOW_MODE_TOKEN: &str = "TOKEN_WINDOW_MODE";

/// Minutes credited to a legacy sighting in detail mode.
pub const LEGACY_DURATION_STEP_MINUTES: i32 = 5;

/// Longest span of one contact window, in seconds.
pub const CONTACT_WINDOW_SECONDS: u64 = 30 * 60;

/// A sighting whose metadata decrypted under a diagnosis key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedSighting {
    /// The stored sighting.
    pub sighting: Sighting,
    /// Calibrated TX power of the sender.
    pub tx_power: i8,
}

/// Regenerates identifiers of diagnosis keys and records what matched.
pub struct MatchingEngine {
    store: Arc<dyn ContactStore>,
    exposure: Arc<ExposureStore>,
    importer: DiagnosisKeyImporter,
    time: TimeBase,
    incubation_period_days: i64,
    calibration: Calibration,
}

impl std::fmt::Debug for MatchingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingEngine")
            .field("incubation_period_days", &self.incubation_period_days)
            .field("calibration", &self.calibration)
            .finish_non_exhaustive()
    }
}

impl MatchingEngine {
    /// Create an engine over the sighting store and exposure store.
    #[must_use]
    pub fn new(
        store: Arc<dyn ContactStore>,
        exposure: Arc<ExposureStore>,
        time: TimeBase,
        settings: &ShieldSettings,
    ) -> Self {
        Self {
            store,
            exposure,
            importer: DiagnosisKeyImporter::new(),
            time,
            incubation_period_days: settings.incubation_period_days,
            calibration: settings.calibration,
        }
    }

    /// Run a matching pass. Returns whether any new contact data was recorded.
    ///
    /// Unreadable bundles, invalid key entries and keys whose derivation fails
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn analyze(
        &self,
        bundles: &[KeyBundle],
        config: &DiagnosisConfiguration,
        token: &str,
        app: &AppId,
    ) -> Result<bool> {
        if token == WINDOW_MODE_TOKEN {
            return self.analyze_window(bundles, app);
        }
        self.analyze_detail(bundles, config, token, app)
    }

    /// Run a window-mode pass.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn analyze_window(&self, bundles: &[KeyBundle], app: &AppId) -> Result<bool> {
        let cutoff = self.incubation_cutoff();
        let mut updated = false;
        for bundle in bundles {
            for key in self.importer.import(bundle) {
                let matches = self.matched_sightings(&key, cutoff)?;
                if matches.is_empty() {
                    continue;
                }
                let windows = self.contact_windows(&key, &matches);
                if !windows.is_empty() {
                    debug!(app = %app, windows = windows.len(), "recording contact windows");
                    self.exposure.add_windows(app, windows)?;
                    updated = true;
                }
            }
        }
        info!(app = %app, updated, "window analysis finished");
        Ok(updated)
    }

    fn analyze_detail(
        &self,
        bundles: &[KeyBundle],
        config: &DiagnosisConfiguration,
        token: &str,
        app: &AppId,
    ) -> Result<bool> {
        let stale = self.time.retention_cutoff(self.incubation_period_days);
        let record = self.exposure.prepare_sketch(app, token, stale)?;
        let cutoff = self.incubation_cutoff();
        let today = self.time.day_number();
        let calculator = RiskScoreCalculator::new(config.clone());

        let mut sketch = record.sketch.clone();
        let mut updated = false;
        for bundle in bundles {
            let mut details = Vec::new();
            for key in self.importer.import(bundle) {
                let matches = self.matched_sightings(&key, cutoff)?;
                if matches.is_empty() {
                    continue;
                }
                let Some(detail) = self.contact_detail(&key, &matches, &calculator, today) else {
                    continue;
                };
                self.exposure.add_detail(&record, detail.clone())?;
                details.push(detail);
            }
            if !details.is_empty() {
                sketch = sketch.merge(&ContactSketch::from_details(&details, today));
                updated = true;
            }
        }
        if updated {
            // Update rather than insert, so the details written above survive.
            self.exposure.update_sketch(&record, sketch)?;
        }
        info!(app = %app, token, updated, "detail analysis finished");
        Ok(updated)
    }

    /// Interval before which diagnosis keys are ignored.
    #[must_use]
    pub fn incubation_cutoff(&self) -> i64 {
        self.time.interval_number() - self.incubation_period_days * INTERVALS_PER_DAY
    }

    /// Sightings of `key`'s identifiers whose metadata decrypts to 4 bytes.
    ///
    /// A key older than `cutoff`, with no lifetime, or whose subkeys cannot be
    /// derived has no matches.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn matched_sightings(&self, key: &PeriodicKey, cutoff: i64) -> Result<Vec<MatchedSighting>> {
        let start = key.valid_time();
        if start < cutoff {
            debug!(valid_time = start, cutoff, "key is outside the incubation period");
            return Ok(Vec::new());
        }
        let life_time = key.life_time();
        if life_time <= 0 {
            return Ok(Vec::new());
        }
        let cipher = match key.cipher() {
            Ok(cipher) => cipher,
            Err(e) => {
                warn!(valid_time = start, error = %e, "cannot derive subkeys, skipping key");
                return Ok(Vec::new());
            }
        };
        let end = start + life_time - 1;

        let mut matches = Vec::new();
        for offset in 0..life_time.min(INTERVALS_PER_DAY) {
            let identifier = cipher.derive_identifier(start + offset);
            for sighting in self.store.sightings_for(&identifier, start, end)? {
                let plaintext =
                    match cipher.decrypt_metadata_block(&identifier, &sighting.encrypted_metadata) {
                        Ok(Some(plaintext)) => plaintext,
                        Ok(None) => {
                            debug!("decrypted metadata has the wrong length, skipping");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "metadata decryption failed, skipping sighting");
                            continue;
                        }
                    };
                debug!(identifier = %hex::encode(identifier), "identifier matched");
                matches.push(MatchedSighting {
                    sighting,
                    tx_power: tx_power_of(&plaintext),
                });
            }
        }
        Ok(matches)
    }

    fn attenuation(&self, tx_power: i8, rssi: i32) -> i32 {
        i32::from(tx_power) - rssi - self.calibration.rssi_correction
    }

    /// Score one key's matches. `None` if the score is below the configured minimum.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn contact_detail(
        &self,
        key: &PeriodicKey,
        matches: &[MatchedSighting],
        calculator: &RiskScoreCalculator,
        today_day: i64,
    ) -> Option<ContactDetail> {
        let config = calculator.config();
        let [low, high] = config.attenuation_duration_thresholds().map(i32::from);
        let mut durations = [0; 3];
        let mut duration = 0;
        let mut min_signal = i32::MAX;

        for matched in matches {
            let sighting = &matched.sighting;
            let signal = self.attenuation(matched.tx_power, sighting.max_rssi);
            min_signal = min_signal.min(signal);
            let step = if sighting.is_legacy() {
                LEGACY_DURATION_STEP_MINUTES
            } else {
                (sighting.seconds_since_last_scan / 60) as i32
            };
            let band = if signal < low {
                0
            } else if signal >= high {
                2
            } else {
                1
            };
            durations[band] = (durations[band] + step).min(MAX_DURATION_MINUTES);
            duration += step;
        }

        let duration = duration.min(MAX_DURATION_MINUTES);
        let attenuation = min_signal.clamp(0, MAX_ATTENUATION);
        let key_day = interval_to_day(key.valid_time());
        let days_since = (today_day - key_day).max(0);
        let total = calculator.score(attenuation, days_since, duration, key.initial_risk_level());
        if total < config.minimum_risk_value_threshold() {
            debug!(
                total,
                threshold = config.minimum_risk_value_threshold(),
                "risk below threshold, discarding contact"
            );
            return None;
        }
        Some(ContactDetail::new(
            key_day,
            duration,
            attenuation,
            key.initial_risk_level(),
            total,
            durations,
        ))
    }

    /// Group one key's matches into windows of at most 30 minutes.
    ///
    /// Legacy sightings carry no per-scan duration and are left out.
    #[must_use]
    pub fn contact_windows(&self, key: &PeriodicKey, matches: &[MatchedSighting]) -> Vec<ContactWindow> {
        let date_millis = interval_to_day_millis(key.valid_time());
        let close = |scan_infos: Vec<ScanInfo>| ContactWindow {
            date_millis,
            report_type: key.report_type(),
            scan_infos,
        };

        let mut windows = Vec::new();
        let mut scan_infos = Vec::new();
        let mut seconds: u64 = 0;
        for matched in matches {
            let sighting = &matched.sighting;
            if sighting.is_legacy() {
                continue;
            }
            let step = u64::from(sighting.seconds_since_last_scan);
            seconds += step;
            if seconds > CONTACT_WINDOW_SECONDS {
                if !scan_infos.is_empty() {
                    windows.push(close(std::mem::take(&mut scan_infos)));
                }
                seconds = step;
            }
            scan_infos.push(ScanInfo {
                average_attenuation: self.attenuation(matched.tx_power, sighting.average_rssi),
                minimum_attenuation: self.attenuation(matched.tx_power, sighting.max_rssi),
                seconds_since_last_scan: sighting.seconds_since_last_scan,
            });
        }
        if !scan_infos.is_empty() {
            windows.push(close(scan_infos));
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::{bundle_bytes, tek};
    use crate::crypto::{metadata_plaintext, RollingCodeCipher};
    use crate::storage::MemoryStore;
    use crate::time::{ManualClock, MILLIS_PER_DAY, SECONDS_PER_DAY};

    const TODAY: i64 = 20_000;
    const KEY: [u8; 16] = [0x42; 16];

    struct Fixture {
        store: Arc<MemoryStore>,
        exposure: Arc<ExposureStore>,
        engine: MatchingEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch_seconds(TODAY * SECONDS_PER_DAY + 7_200));
        let time = TimeBase::new(clock);
        let store = Arc::new(MemoryStore::new());
        let exposure = Arc::new(ExposureStore::new(store.clone(), time.clone()));
        let engine = MatchingEngine::new(
            store.clone(),
            exposure.clone(),
            time,
            &ShieldSettings::default(),
        );
        Fixture {
            store,
            exposure,
            engine,
        }
    }

    fn app() -> AppId {
        AppId::new("org.example.tracer").unwrap()
    }

    fn sighting(key: &[u8; 16], interval: i64, rssi: i32, average: i32, seconds: u32) -> Sighting {
        let cipher = RollingCodeCipher::new(key).unwrap();
        let identifier = cipher.derive_identifier(interval);
        let metadata = cipher
            .encrypt_metadata(&identifier, &metadata_plaintext(-19))
            .unwrap();
        Sighting {
            identifier,
            encrypted_metadata: metadata.try_into().unwrap(),
            max_rssi: rssi,
            average_rssi: average,
            interval_number: interval,
            seconds_since_last_scan: seconds,
        }
    }

    fn yesterday() -> i64 {
        (TODAY - 1) * INTERVALS_PER_DAY
    }

    fn bundle(start: i64) -> KeyBundle {
        let start = i32::try_from(start).unwrap();
        KeyBundle::from_bytes("test", bundle_bytes(vec![tek(KEY, start, 4, 1)]))
    }

    #[test]
    fn test_detail_mode_records_detail_and_sketch() {
        let f = fixture();
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 3, -60, -62, 300)).unwrap();
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 4, -60, -62, 300)).unwrap();

        let updated = f
            .engine
            .analyze(&[bundle(yesterday())], &DiagnosisConfiguration::default(), "t1", &app())
            .unwrap();
        assert!(updated);

        let details = f.exposure.details(&app(), "t1").unwrap();
        assert_eq!(details.len(), 1);
        let detail = &details[0];
        // -19 - (-60) - (-5)
        assert_eq!(detail.attenuation_risk_value, 46);
        assert_eq!(detail.duration_minutes, 10);
        assert_eq!(detail.attenuation_durations, [10, 0, 0]);
        assert_eq!(detail.day_number, TODAY - 1);
        assert_eq!(detail.total_risk_value, 256);

        let sketch = f.exposure.sketch(&app(), "t1").unwrap();
        assert_eq!(sketch.number_of_hits, 1);
        assert_eq!(sketch.days_since_last_hit, 1);
        assert_eq!(sketch.max_risk_value, 256);
    }

    #[test]
    fn test_repeated_pass_merges_into_same_sketch() {
        let f = fixture();
        f.store.insert_sighting(&sighting(&KEY, yesterday(), -60, -62, 300)).unwrap();
        let config = DiagnosisConfiguration::default();
        assert!(f.engine.analyze(&[bundle(yesterday())], &config, "t", &app()).unwrap());
        assert!(f.engine.analyze(&[bundle(yesterday())], &config, "t", &app()).unwrap());
        assert_eq!(f.exposure.sketch(&app(), "t").unwrap().number_of_hits, 2);
        assert_eq!(f.exposure.details(&app(), "t").unwrap().len(), 2);
    }

    #[test]
    fn test_stale_key_contributes_nothing() {
        let f = fixture();
        let stale = f.engine.incubation_cutoff() - 1;
        f.store.insert_sighting(&sighting(&KEY, stale, -60, -62, 300)).unwrap();
        let updated = f
            .engine
            .analyze(&[bundle(stale)], &DiagnosisConfiguration::default(), "t", &app())
            .unwrap();
        assert!(!updated);
        assert!(f.exposure.details(&app(), "t").unwrap().is_empty());
    }

    #[test]
    fn test_below_minimum_is_discarded() {
        let f = fixture();
        f.store.insert_sighting(&sighting(&KEY, yesterday(), -60, -62, 300)).unwrap();
        let config =
            DiagnosisConfiguration::new([4; 8], [4; 8], [4; 8], [4; 8], [50, 74], 4096).unwrap();
        assert!(!f.engine.analyze(&[bundle(yesterday())], &config, "t", &app()).unwrap());
        assert_eq!(f.exposure.sketch(&app(), "t").unwrap(), ContactSketch::default());
    }

    #[test]
    fn test_unrelated_sightings_do_not_match() {
        let f = fixture();
        f.store
            .insert_sighting(&sighting(&[0x13; 16], yesterday(), -60, -62, 300))
            .unwrap();
        assert!(!f
            .engine
            .analyze(&[bundle(yesterday())], &DiagnosisConfiguration::default(), "t", &app())
            .unwrap());
    }

    #[test]
    fn test_sighting_outside_key_lifetime_is_ignored() {
        let f = fixture();
        let key = PeriodicKey::new(KEY, yesterday(), 10);
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 20, -60, -62, 300)).unwrap();
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 9, -60, -62, 300)).unwrap();
        let matches = f.engine.matched_sightings(&key, 0).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tx_power, -19);
    }

    #[test]
    fn test_bad_bundle_does_not_abort_batch() {
        let f = fixture();
        f.store.insert_sighting(&sighting(&KEY, yesterday(), -60, -62, 300)).unwrap();
        let bundles = [KeyBundle::from_bytes("broken", vec![1, 2, 3]), bundle(yesterday())];
        assert!(f
            .engine
            .analyze(&bundles, &DiagnosisConfiguration::default(), "t", &app())
            .unwrap());
    }

    #[test]
    fn test_legacy_sighting_counts_five_minutes() {
        let f = fixture();
        let key = PeriodicKey::new(KEY, yesterday(), 144);
        let matches = vec![MatchedSighting {
            sighting: sighting(&KEY, yesterday(), -40, 0, 0),
            tx_power: -19,
        }];
        let calculator = RiskScoreCalculator::new(DiagnosisConfiguration::default());
        let detail = f.engine.contact_detail(&key, &matches, &calculator, TODAY).unwrap();
        assert_eq!(detail.duration_minutes, 5);
        // -19 + 40 + 5 = 26 < 50
        assert_eq!(detail.attenuation_durations, [5, 0, 0]);
        assert!(f.engine.contact_windows(&key, &matches).is_empty());
    }

    #[test]
    fn test_attenuation_bands_and_caps() {
        let f = fixture();
        let key = PeriodicKey::new(KEY, yesterday(), 144);
        let strong = sighting(&KEY, yesterday(), -40, -40, 600);
        let medium = sighting(&KEY, yesterday(), -70, -70, 600);
        let weak = sighting(&KEY, yesterday(), -95, -95, 1_200);
        let matches: Vec<_> = [strong.clone(), strong, medium, weak]
            .into_iter()
            .map(|sighting| MatchedSighting {
                sighting,
                tx_power: -19,
            })
            .collect();
        let calculator = RiskScoreCalculator::new(DiagnosisConfiguration::default());
        let detail = f.engine.contact_detail(&key, &matches, &calculator, TODAY).unwrap();
        // signals: 26, 26, 56, 81
        assert_eq!(detail.attenuation_durations, [20, 10, 20]);
        assert_eq!(detail.duration_minutes, 30);
        assert_eq!(detail.attenuation_risk_value, 26);
    }

    #[test]
    fn test_window_mode_splits_after_thirty_minutes() {
        let f = fixture();
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 1, -60, -65, 1_000)).unwrap();
        f.store.insert_sighting(&sighting(&KEY, yesterday() + 2, -60, -65, 1_000)).unwrap();

        let updated = f
            .engine
            .analyze(&[bundle(yesterday())], &DiagnosisConfiguration::default(), WINDOW_MODE_TOKEN, &app())
            .unwrap();
        assert!(updated);
        let windows = f.exposure.windows(&app()).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].date_millis, (TODAY - 1) * MILLIS_PER_DAY);
        assert_eq!(windows[0].report_type, 1);
        assert_eq!(windows[0].scan_infos.len(), 1);
        let info = windows[0].scan_infos[0];
        assert_eq!(info.minimum_attenuation, 46);
        assert_eq!(info.average_attenuation, 51);
        assert_eq!(info.seconds_since_last_scan, 1_000);
        assert!(f.exposure.sketch(&app(), WINDOW_MODE_TOKEN).unwrap().number_of_hits == 0);
    }

    #[test]
    fn test_window_keeps_short_scans_together() {
        let f = fixture();
        let key = PeriodicKey::new(KEY, yesterday(), 144);
        let matches: Vec<_> = (0..6)
            .map(|i| MatchedSighting {
                sighting: sighting(&KEY, yesterday() + i, -60, -60, 300),
                tx_power: -19,
            })
            .collect();
        let windows = f.engine.contact_windows(&key, &matches);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].scan_infos.len(), 6);
    }
}
