//! Sighting aggregation.
//!
//! During one scan cycle the radio may report the same rolling identifier many
//! times. [`ScanAggregator`] collapses those reports into one
//! [`ScanDataDetail`] per identifier and, when the cycle ends, flushes them to
//! the store as [`Sighting`] records, subject to a daily quota.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::storage::{ContactStore, StoreError};
use crate::time::{day_start_interval, TimeBase, INTERVALS_PER_DAY, SECONDS_PER_MINUTE};
use crate::types::{Identifier, MetadataBytes, IDENTIFIER_LEN, METADATA_LEN};

/// Errors from recording or flushing sightings.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The identifier is not 16 bytes.
    #[error("identifier must be {IDENTIFIER_LEN} bytes, got {0}")]
    IdentifierLength(usize),

    /// The metadata is not 4 bytes.
    #[error("metadata must be {METADATA_LEN} bytes, got {0}")]
    MetadataLength(usize),

    /// Today's quota of stored sightings is used up.
    #[error("daily sighting quota of {limit} exhausted")]
    QuotaExceeded {
        /// Configured daily limit.
        limit: i64,
    },

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One stored observation of a peer's rolling identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Observed rolling identifier.
    pub identifier: Identifier,
    /// Observed encrypted metadata.
    pub encrypted_metadata: MetadataBytes,
    /// Strongest RSSI of the scan cycle.
    pub max_rssi: i32,
    /// Rounded mean RSSI of the scan cycle; 0 for legacy records.
    pub average_rssi: i32,
    /// Interval of the strongest observation.
    pub interval_number: i64,
    /// Seconds between the start of the previous scan cycle and this one.
    pub seconds_since_last_scan: u32,
}

impl Sighting {
    /// Whether this record predates per-scan averaging.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        self.average_rssi == 0
    }
}

/// Running aggregate for one identifier within a scan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanDataDetail {
    /// Observed rolling identifier.
    pub identifier: Identifier,
    /// Metadata from the first observation.
    pub metadata: MetadataBytes,
    /// Strongest RSSI so far.
    pub max_rssi: i32,
    /// Mean RSSI so far.
    pub average_rssi: f64,
    /// Observations merged.
    pub count: u32,
    /// Interval of the strongest observation.
    pub interval_number: i64,
}

impl ScanDataDetail {
    /// Start an aggregate from a first observation.
    #[must_use]
    pub fn new(identifier: Identifier, metadata: MetadataBytes, rssi: i32, interval: i64) -> Self {
        Self {
            identifier,
            metadata,
            max_rssi: rssi,
            average_rssi: f64::from(rssi),
            count: 1,
            interval_number: interval,
        }
    }

    /// Merge a repeat observation.
    pub fn add_rssi(&mut self, rssi: i32, interval: i64) {
        if rssi > self.max_rssi {
            self.max_rssi = rssi;
            self.interval_number = interval;
        }
        let count = f64::from(self.count);
        self.average_rssi = self.average_rssi.mul_add(count, f64::from(rssi)) / (count + 1.0);
        self.count += 1;
    }

    /// Turn the aggregate into a storable record.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_sighting(&self, seconds_since_last_scan: u32) -> Sighting {
        // Halves round toward positive infinity.
        let average_rssi = (self.average_rssi + 0.5).floor() as i32;
        Sighting {
            identifier: self.identifier,
            encrypted_metadata: self.metadata,
            max_rssi: self.max_rssi,
            average_rssi,
            interval_number: self.interval_number,
            seconds_since_last_scan,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Sightings written to the store.
    pub persisted: usize,
    /// Aggregates dropped because the quota ran out.
    pub discarded: usize,
}

#[derive(Debug, Default)]
struct AggregatorState {
    pending: IndexMap<Identifier, ScanDataDetail>,
    /// Sightings still allowed today; `None` until the first flush after a reset.
    remaining_quota: Option<i64>,
}

/// In-memory cache of the current scan cycle.
pub struct ScanAggregator {
    store: Arc<dyn ContactStore>,
    time: TimeBase,
    daily_limit: i64,
    state: Mutex<AggregatorState>,
}

impl fmt::Debug for ScanAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScanAggregator")
            .field("daily_limit", &self.daily_limit)
            .field("pending", &state.pending.len())
            .field("remaining_quota", &state.remaining_quota)
            .finish_non_exhaustive()
    }
}

impl ScanAggregator {
    /// Create an aggregator persisting into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>, time: TimeBase, daily_limit: i64) -> Self {
        Self {
            store,
            time,
            daily_limit,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// Record one radio observation.
    ///
    /// # Errors
    ///
    /// Rejects identifiers that are not 16 bytes and metadata that is not 4 bytes.
    pub fn record(&self, identifier: &[u8], metadata: &[u8], rssi: i32) -> Result<(), ScanError> {
        let identifier: Identifier = identifier
            .try_into()
            .map_err(|_| ScanError::IdentifierLength(identifier.len()))?;
        let metadata: MetadataBytes = metadata
            .try_into()
            .map_err(|_| ScanError::MetadataLength(metadata.len()))?;
        let interval = self.time.interval_number();

        let mut state = self.state.lock();
        state
            .pending
            .entry(identifier)
            .and_modify(|detail| detail.add_rssi(rssi, interval))
            .or_insert_with(|| ScanDataDetail::new(identifier, metadata, rssi, interval));
        trace!(identifier = %hex::encode(identifier), rssi, "recorded sighting");
        Ok(())
    }

    /// Persist every pending aggregate and clear the cache.
    ///
    /// Once today's quota is used up the remaining aggregates of this flush are
    /// discarded. The cache is cleared even if the store fails.
    ///
    /// # Errors
    ///
    /// Returns a store error if counting or inserting fails.
    pub fn flush(&self, seconds_since_last_scan: u32) -> Result<FlushReport, ScanError> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        let remaining = match state.remaining_quota {
            Some(remaining) => remaining,
            None => {
                let remaining = self.daily_limit - self.today_count()?;
                debug!(remaining, "initialized daily sighting quota");
                remaining
            }
        };
        state.remaining_quota = Some(remaining);

        let allowed = usize::try_from(remaining.max(0)).unwrap_or(usize::MAX);
        let batch: Vec<Sighting> = pending
            .values()
            .take(allowed)
            .map(|detail| detail.to_sighting(seconds_since_last_scan))
            .collect();
        let report = FlushReport {
            persisted: batch.len(),
            discarded: pending.len() - batch.len(),
        };
        self.store.insert_sightings(&batch)?;
        state.remaining_quota = Some(remaining - i64::try_from(batch.len()).unwrap_or(i64::MAX));

        if report.discarded > 0 {
            warn!(
                discarded = report.discarded,
                limit = self.daily_limit,
                "daily sighting quota reached, discarding scan results"
            );
        }
        info!(
            persisted = report.persisted,
            seconds_since_last_scan, "flushed scan cycle"
        );
        Ok(report)
    }

    /// Discard pending aggregates without persisting them.
    pub fn clear(&self) {
        self.state.lock().pending.clear();
    }

    /// Forget the cached quota so the next flush recounts today's sightings.
    pub fn reset_quota(&self) {
        self.state.lock().remaining_quota = None;
    }

    /// Number of identifiers in the current cycle.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether today's quota is known to be used up.
    #[must_use]
    pub fn storage_limited(&self) -> bool {
        self.state
            .lock()
            .remaining_quota
            .is_some_and(|remaining| remaining <= 0)
    }

    /// Fail with [`ScanError::QuotaExceeded`] if the quota is used up.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_capacity(&self) -> Result<(), ScanError> {
        if self.storage_limited() {
            return Err(ScanError::QuotaExceeded {
                limit: self.daily_limit,
            });
        }
        Ok(())
    }

    fn today_count(&self) -> Result<i64, StoreError> {
        let start = day_start_interval(self.time.day_number());
        let count = self
            .store
            .count_sightings_in_range(start, start + INTERVALS_PER_DAY)?;
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

/// Start times of the previous and current scan cycles.
#[derive(Debug, Clone, Copy)]
pub struct ScanCycleClock {
    last_start: Option<i64>,
    current_start: Option<i64>,
    max_seconds: u32,
}

impl ScanCycleClock {
    /// Create a clock with no cycle started.
    #[must_use]
    pub const fn new(max_seconds: u32) -> Self {
        Self {
            last_start: None,
            current_start: None,
            max_seconds,
        }
    }

    /// Mark the start of a new cycle at `now` (seconds since the epoch).
    pub fn begin(&mut self, now: i64) {
        self.last_start = self.current_start;
        self.current_start = Some(now);
    }

    /// Forget both cycles.
    pub fn reset(&mut self) {
        self.last_start = None;
        self.current_start = None;
    }

    /// Gap between the previous and current cycle starts, rounded to whole
    /// minutes and capped.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn seconds_since_last_scan(&self) -> u32 {
        let (Some(last), Some(current)) = (self.last_start, self.current_start) else {
            return 0;
        };
        if current <= last {
            return 0;
        }
        let gap = current - last;
        let minutes = (gap + SECONDS_PER_MINUTE / 2) / SECONDS_PER_MINUTE;
        let rounded = minutes * SECONDS_PER_MINUTE;
        rounded.min(i64::from(self.max_seconds)) as u32
    }
}
