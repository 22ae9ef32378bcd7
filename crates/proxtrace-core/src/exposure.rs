//! Exposure results and their persistence.
//!
//! A matching pass in detail mode produces one [`ContactDetail`] per matched
//! diagnosis key and folds them into a single [`ContactSketch`] per
//! (app, token). Window mode instead produces [`ContactWindow`]s, each holding
//! at most 30 minutes of [`ScanInfo`] samples.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::risk::{MAX_ATTENUATION, MAX_RISK_VALUE};
use crate::storage::{ContactStore, DetailRecord, SketchRecord, WindowRecord};
use crate::time::TimeBase;
use crate::types::AppId;

/// Cap on every duration, in minutes.
pub const MAX_DURATION_MINUTES: i32 = 30;

/// Minutes spent in the low, medium and high attenuation bands.
pub type AttenuationDurations = [i32; 3];

/// Clamp each band to `[0, 30]`.
#[must_use]
pub fn clamp_durations(durations: AttenuationDurations) -> AttenuationDurations {
    durations.map(|minutes| minutes.clamp(0, MAX_DURATION_MINUTES))
}

/// Band-wise sum, capped at 30.
#[must_use]
pub fn add_durations(a: AttenuationDurations, b: AttenuationDurations) -> AttenuationDurations {
    let mut out = [0; 3];
    for (slot, (x, y)) in out.iter_mut().zip(a.into_iter().zip(b)) {
        *slot = x.saturating_add(y).clamp(0, MAX_DURATION_MINUTES);
    }
    out
}

/// Exposure to one diagnosis key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetail {
    /// Day the diagnosis key was valid.
    pub day_number: i64,
    /// Total contact time, at most 30 minutes.
    pub duration_minutes: i32,
    /// Lowest attenuation observed, in `[0, 255]`.
    pub attenuation_risk_value: i32,
    /// Transmission risk level of the key.
    pub initial_risk_level: u8,
    /// Risk score, in `[0, 4096]`.
    pub total_risk_value: i32,
    /// Minutes per attenuation band.
    pub attenuation_durations: AttenuationDurations,
}

impl ContactDetail {
    /// Build a detail, clamping every field to its range.
    #[must_use]
    pub fn new(
        day_number: i64,
        duration_minutes: i32,
        attenuation_risk_value: i32,
        initial_risk_level: u8,
        total_risk_value: i32,
        attenuation_durations: AttenuationDurations,
    ) -> Self {
        Self {
            day_number: day_number.max(0),
            duration_minutes: duration_minutes.clamp(0, MAX_DURATION_MINUTES),
            attenuation_risk_value: attenuation_risk_value.clamp(0, MAX_ATTENUATION),
            initial_risk_level,
            total_risk_value: total_risk_value.clamp(0, MAX_RISK_VALUE),
            attenuation_durations: clamp_durations(attenuation_durations),
        }
    }
}

/// Aggregate over every detail of one (app, token).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSketch {
    /// Days since the most recent contact.
    pub days_since_last_hit: i32,
    /// Number of contributing details.
    pub number_of_hits: i32,
    /// Highest detail score.
    pub max_risk_value: i32,
    /// Sum of detail scores, saturating at `i32::MAX`.
    pub summation_risk_value: i32,
    /// Minutes per attenuation band, each capped at 30.
    pub attenuation_durations: AttenuationDurations,
}

impl ContactSketch {
    /// Aggregate `details` in one pass, relative to `today_day`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_details(details: &[ContactDetail], today_day: i64) -> Self {
        if details.is_empty() {
            return Self::default();
        }
        let mut summation: i64 = 0;
        let mut durations = [0; 3];
        let mut latest_day = 0;
        let mut max_risk = 0;
        for detail in details {
            summation += i64::from(detail.total_risk_value);
            durations = add_durations(durations, detail.attenuation_durations);
            latest_day = latest_day.max(detail.day_number);
            max_risk = max_risk.max(detail.total_risk_value);
        }
        let days = (today_day - latest_day).clamp(0, i64::from(i32::MAX));
        Self {
            days_since_last_hit: days as i32,
            number_of_hits: i32::try_from(details.len()).unwrap_or(i32::MAX),
            max_risk_value: max_risk,
            summation_risk_value: summation.min(i64::from(i32::MAX)) as i32,
            attenuation_durations: durations,
        }
    }

    /// Merge `other` into this sketch. A sketch without hits is replaced.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        if self.number_of_hits == 0 {
            return other.clone();
        }
        Self {
            days_since_last_hit: self.days_since_last_hit.min(other.days_since_last_hit),
            number_of_hits: self.number_of_hits.saturating_add(other.number_of_hits),
            max_risk_value: self.max_risk_value.max(other.max_risk_value),
            summation_risk_value: self
                .summation_risk_value
                .saturating_add(other.summation_risk_value),
            attenuation_durations: add_durations(
                self.attenuation_durations,
                other.attenuation_durations,
            ),
        }
    }

    /// Fold one detail into the sketch.
    pub fn merge_detail(&mut self, detail: &ContactDetail, today_day: i64) {
        *self = self.merge(&Self::from_details(std::slice::from_ref(detail), today_day));
    }
}

/// One scan inside a contact window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Attenuation from the mean RSSI of the scan.
    pub average_attenuation: i32,
    /// Attenuation from the strongest RSSI of the scan.
    pub minimum_attenuation: i32,
    /// Gap to the previous scan cycle.
    pub seconds_since_last_scan: u32,
}

/// Up to 30 minutes of scans of one diagnosis key on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactWindow {
    /// UTC midnight of the key's day, in milliseconds since the epoch.
    pub date_millis: i64,
    /// Report type of the diagnosis key.
    pub report_type: u8,
    /// Scans in observation order.
    pub scan_infos: Vec<ScanInfo>,
}

/// Sketch, detail and window lifecycle on top of a [`ContactStore`].
pub struct ExposureStore {
    store: Arc<dyn ContactStore>,
    time: TimeBase,
}

impl std::fmt::Debug for ExposureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureStore").finish_non_exhaustive()
    }
}

impl ExposureStore {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>, time: TimeBase) -> Self {
        Self { store, time }
    }

    /// Get ready for a detail-mode pass: drop the app's sketches older than
    /// `cutoff` and make sure a sketch record exists for `token`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn prepare_sketch(&self, app: &AppId, token: &str, cutoff: i64) -> Result<SketchRecord> {
        let removed = self.store.delete_sketches_before(app, cutoff)?;
        if removed > 0 {
            debug!(app = %app, removed, "removed stale sketches");
        }
        if let Some(existing) = self.store.sketch(app, token)? {
            return Ok(existing);
        }
        self.add_sketch(app, token, ContactSketch::default())
    }

    /// Store a new sketch for (app, token), replacing any previous one and its
    /// details.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn add_sketch(&self, app: &AppId, token: &str, sketch: ContactSketch) -> Result<SketchRecord> {
        let record = SketchRecord {
            id: Uuid::new_v4(),
            app: app.clone(),
            token: token.to_string(),
            sketch,
            last_update_interval: self.time.interval_number(),
        };
        self.store.insert_sketch(&record)?;
        Ok(record)
    }

    /// Overwrite the values of an existing sketch, keeping its details.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn update_sketch(&self, record: &SketchRecord, sketch: ContactSketch) -> Result<()> {
        let updated = SketchRecord {
            sketch,
            last_update_interval: self.time.interval_number(),
            ..record.clone()
        };
        self.store.update_sketch(&updated)?;
        Ok(())
    }

    /// Append a detail to a sketch.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn add_detail(&self, sketch: &SketchRecord, detail: ContactDetail) -> Result<()> {
        self.store.insert_details(&[DetailRecord {
            sketch_id: sketch.id,
            detail,
        }])?;
        Ok(())
    }

    /// Append windows for `app`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn add_windows(&self, app: &AppId, windows: Vec<ContactWindow>) -> Result<()> {
        let interval = self.time.interval_number();
        for window in windows {
            self.store.insert_window(&WindowRecord {
                app: app.clone(),
                window,
                last_update_interval: interval,
            })?;
        }
        Ok(())
    }

    /// The sketch for (app, token); an empty sketch if there is none.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn sketch(&self, app: &AppId, token: &str) -> Result<ContactSketch> {
        Ok(self
            .store
            .sketch(app, token)?
            .map(|record| record.sketch)
            .unwrap_or_default())
    }

    /// Details recorded for (app, token).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn details(&self, app: &AppId, token: &str) -> Result<Vec<ContactDetail>> {
        let Some(record) = self.store.sketch(app, token)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .details(record.id)?
            .into_iter()
            .map(|d| d.detail)
            .collect())
    }

    /// Windows recorded for `app`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn windows(&self, app: &AppId) -> Result<Vec<ContactWindow>> {
        Ok(self
            .store
            .windows(app)?
            .into_iter()
            .map(|w| w.window)
            .collect())
    }

    /// Delete the app's sketches, details and windows written before `cutoff`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete_before(&self, app: &AppId, cutoff: i64) -> Result<()> {
        let sketches = self.store.delete_sketches_before(app, cutoff)?;
        let windows = self.store.delete_windows_before(app, cutoff)?;
        debug!(app = %app, cutoff, sketches, windows, "evicted exposure results");
        Ok(())
    }

    /// Delete every exposure result of `app`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete_app(&self, app: &AppId) -> Result<()> {
        self.store.delete_sketches(app)?;
        self.store.delete_windows(app)?;
        info!(app = %app, "deleted exposure results");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::time::{ManualClock, SECONDS_PER_DAY};
    use proptest::prelude::*;

    fn detail(day: i64, risk: i32, durations: AttenuationDurations) -> ContactDetail {
        ContactDetail::new(day, 10, 40, 2, risk, durations)
    }

    fn fixture() -> (Arc<ManualClock>, ExposureStore) {
        let clock = Arc::new(ManualClock::at_epoch_seconds(30 * SECONDS_PER_DAY));
        let store = ExposureStore::new(Arc::new(MemoryStore::new()), TimeBase::new(clock.clone()));
        (clock, store)
    }

    fn app() -> AppId {
        AppId::new("org.example.tracer").unwrap()
    }

    #[test]
    fn test_detail_clamps() {
        let d = ContactDetail::new(-1, 45, 300, 3, 5000, [40, -2, 10]);
        assert_eq!(d.day_number, 0);
        assert_eq!(d.duration_minutes, 30);
        assert_eq!(d.attenuation_risk_value, 255);
        assert_eq!(d.total_risk_value, 4096);
        assert_eq!(d.attenuation_durations, [30, 0, 10]);
    }

    #[test]
    fn test_sketch_from_details() {
        let sketch = ContactSketch::from_details(
            &[detail(25, 100, [10, 5, 0]), detail(28, 40, [25, 0, 3])],
            30,
        );
        assert_eq!(sketch.days_since_last_hit, 2);
        assert_eq!(sketch.number_of_hits, 2);
        assert_eq!(sketch.max_risk_value, 100);
        assert_eq!(sketch.summation_risk_value, 140);
        assert_eq!(sketch.attenuation_durations, [30, 5, 3]);
    }

    #[test]
    fn test_merge_into_empty_takes_other() {
        let other = ContactSketch::from_details(&[detail(29, 8, [1, 2, 3])], 30);
        assert_eq!(ContactSketch::default().merge(&other), other);
    }

    #[test]
    fn test_summation_saturates() {
        let a = ContactSketch {
            number_of_hits: 1,
            summation_risk_value: i32::MAX - 1,
            ..ContactSketch::default()
        };
        let b = ContactSketch {
            number_of_hits: 1,
            summation_risk_value: 4096,
            ..ContactSketch::default()
        };
        assert_eq!(a.merge(&b).summation_risk_value, i32::MAX);
    }

    #[test]
    fn test_prepare_creates_stable_placeholder() {
        let (_clock, store) = fixture();
        let first = store.prepare_sketch(&app(), "t", 0).unwrap();
        let second = store.prepare_sketch(&app(), "t", 0).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.sketch(&app(), "t").unwrap(), ContactSketch::default());
    }

    #[test]
    fn test_update_keeps_details() {
        let (_clock, store) = fixture();
        let record = store.prepare_sketch(&app(), "t", 0).unwrap();
        store.add_detail(&record, detail(29, 64, [5, 0, 0])).unwrap();
        let sketch = ContactSketch::from_details(&store.details(&app(), "t").unwrap(), 30);
        store.update_sketch(&record, sketch.clone()).unwrap();
        assert_eq!(store.details(&app(), "t").unwrap().len(), 1);
        assert_eq!(store.sketch(&app(), "t").unwrap(), sketch);
    }

    #[test]
    fn test_add_sketch_replaces_details() {
        let (_clock, store) = fixture();
        let record = store.prepare_sketch(&app(), "t", 0).unwrap();
        store.add_detail(&record, detail(29, 64, [5, 0, 0])).unwrap();
        store.add_sketch(&app(), "t", ContactSketch::default()).unwrap();
        assert!(store.details(&app(), "t").unwrap().is_empty());
    }

    #[test]
    fn test_missing_results_are_empty() {
        let (_clock, store) = fixture();
        assert_eq!(store.sketch(&app(), "nope").unwrap(), ContactSketch::default());
        assert!(store.details(&app(), "nope").unwrap().is_empty());
        assert!(store.windows(&app()).unwrap().is_empty());
    }

    #[test]
    fn test_prepare_drops_stale_sketch() {
        let (clock, store) = fixture();
        let old = store.prepare_sketch(&app(), "t", 0).unwrap();
        store.add_detail(&old, detail(29, 64, [5, 0, 0])).unwrap();
        clock.advance_seconds(20 * SECONDS_PER_DAY);
        let cutoff = 40 * 144;
        let fresh = store.prepare_sketch(&app(), "t", cutoff).unwrap();
        assert_ne!(old.id, fresh.id);
        assert!(store.details(&app(), "t").unwrap().is_empty());
    }

    #[test]
    fn test_delete_app_wipes_windows_and_sketches() {
        let (_clock, store) = fixture();
        let record = store.prepare_sketch(&app(), "t", 0).unwrap();
        store.add_detail(&record, detail(29, 64, [5, 0, 0])).unwrap();
        store
            .add_windows(&app(), vec![ContactWindow::default()])
            .unwrap();
        store.delete_app(&app()).unwrap();
        assert!(store.details(&app(), "t").unwrap().is_empty());
        assert!(store.windows(&app()).unwrap().is_empty());
    }

    fn arb_detail() -> impl Strategy<Value = ContactDetail> {
        (0i64..40, 0i32..=4096, any::<[u8; 3]>()).prop_map(|(day, risk, d)| {
            detail(day, risk, d.map(|m| i32::from(m % 31)))
        })
    }

    proptest! {
        #[test]
        fn prop_incremental_merge_matches_batch(details in prop::collection::vec(arb_detail(), 1..20)) {
            let today = 40;
            let batch = ContactSketch::from_details(&details, today);
            let mut incremental = ContactSketch::default();
            for d in &details {
                incremental.merge_detail(d, today);
            }
            prop_assert_eq!(incremental, batch);
        }

        #[test]
        fn prop_merge_is_associative(a in arb_detail(), b in arb_detail(), c in arb_detail()) {
            let today = 40;
            let [sa, sb, sc] = [a, b, c].map(|d| ContactSketch::from_details(&[d], today));
            prop_assert_eq!(sa.merge(&sb).merge(&sc), sa.merge(&sb.merge(&sc)));
        }

        #[test]
        fn prop_durations_stay_clamped(details in prop::collection::vec(arb_detail(), 0..50)) {
            let sketch = ContactSketch::from_details(&details, 40);
            prop_assert!(sketch.attenuation_durations.iter().all(|m| (0..=30).contains(m)));
        }
    }
}
