//! The engine's composition root.
//!
//! [`ContactShield`] owns one instance of every service (key store, scan
//! aggregator, exposure store, matching engine, session) over a shared
//! [`ContactStore`]. [`ShieldRuntime`] drives it from async code through the
//! task queues of [`crate::executor`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::beacon::{Beacon, BEACON_LEN};
use crate::bundle::KeyBundle;
use crate::config::ShieldSettings;
use crate::crypto::{metadata_plaintext, CryptoError, RollingCodeCipher};
use crate::error::Result;
use crate::executor::TaskQueues;
use crate::exposure::{ContactDetail, ContactSketch, ContactWindow, ExposureStore};
use crate::keys::{CurrentKey, PeriodicKey, PeriodicKeyStore};
use crate::matching::MatchingEngine;
use crate::risk::DiagnosisConfiguration;
use crate::scan::{FlushReport, ScanAggregator, ScanCycleClock};
use crate::session::ContactSession;
use crate::storage::{ContactStore, JsonFileStore};
use crate::time::TimeBase;
use crate::types::{AppId, METADATA_LEN};

/// Every engine service, wired over one store.
pub struct ContactShield {
    settings: ShieldSettings,
    time: TimeBase,
    store: Arc<dyn ContactStore>,
    keys: PeriodicKeyStore,
    aggregator: ScanAggregator,
    exposure: Arc<ExposureStore>,
    matcher: MatchingEngine,
    session: ContactSession,
    scan_clock: Mutex<ScanCycleClock>,
}

impl std::fmt::Debug for ContactShield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactShield")
            .field("settings", &self.settings)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ContactShield {
    /// Wire the services over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>, settings: ShieldSettings, time: TimeBase) -> Self {
        let exposure = Arc::new(ExposureStore::new(store.clone(), time.clone()));
        let matcher = MatchingEngine::new(store.clone(), exposure.clone(), time.clone(), &settings);
        Self {
            keys: PeriodicKeyStore::new(store.clone(), time.clone()),
            aggregator: ScanAggregator::new(
                store.clone(),
                time.clone(),
                settings.daily_sighting_limit,
            ),
            scan_clock: Mutex::new(ScanCycleClock::new(settings.max_seconds_since_last_scan)),
            session: ContactSession::new(),
            exposure,
            matcher,
            store,
            time,
            settings,
        }
    }

    /// Open a file-backed engine in the settings' data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be resolved or the
    /// snapshot cannot be loaded.
    pub fn open(settings: ShieldSettings) -> Result<Self> {
        let dir = settings.resolved_data_dir()?;
        let store = JsonFileStore::open_in(&dir)?;
        info!(path = %store.path().display(), "opened contact store");
        Ok(Self::new(Arc::new(store), settings, TimeBase::system()))
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &ShieldSettings {
        &self.settings
    }

    /// Start/stop state of the radio session.
    #[must_use]
    pub const fn session(&self) -> &ContactSession {
        &self.session
    }

    /// The app's key for today. Generating a new key evicts expired data.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if no key can be generated and a storage error if
    /// it cannot be persisted or eviction fails.
    pub fn current_key(&self, app: &AppId) -> Result<CurrentKey> {
        let key = self.keys.get_current_key(app)?;
        if key.rotated {
            self.evict_expired(app)?;
        }
        Ok(key)
    }

    /// The 20-byte advertisement for the current interval.
    ///
    /// # Errors
    ///
    /// See [`Self::current_key`]. Cipher failures are surfaced, never replaced
    /// by a zero key.
    pub fn current_beacon(&self, app: &AppId) -> Result<[u8; BEACON_LEN]> {
        let key = self.current_key(app)?;
        let cipher = RollingCodeCipher::new(&key.content)?;
        let identifier = cipher.derive_identifier(self.time.interval_number());
        let encrypted = cipher.encrypt_metadata(
            &identifier,
            &metadata_plaintext(self.settings.calibration.tx_power),
        )?;
        let metadata = encrypted
            .try_into()
            .map_err(|bytes: Vec<u8>| CryptoError::InvalidLength {
                what: "metadata ciphertext",
                expected: METADATA_LEN,
                actual: bytes.len(),
            })?;
        Ok(Beacon {
            identifier,
            metadata,
        }
        .pack())
    }

    /// Record one observed advertisement.
    ///
    /// # Errors
    ///
    /// Rejects identifiers that are not 16 bytes and metadata that is not 4 bytes.
    pub fn record_sighting(&self, identifier: &[u8], metadata: &[u8], rssi: i32) -> Result<()> {
        self.aggregator.record(identifier, metadata, rssi)?;
        Ok(())
    }

    /// Start a scan cycle: drop leftovers and note the start time.
    pub fn begin_scan_cycle(&self) {
        self.aggregator.clear();
        self.scan_clock
            .lock()
            .begin(self.time.seconds_since_epoch());
    }

    /// End a scan cycle, persisting its aggregates.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn end_scan_cycle(&self) -> Result<FlushReport> {
        let seconds = self.scan_clock.lock().seconds_since_last_scan();
        self.flush(seconds)
    }

    /// Persist pending aggregates with an explicit scan gap.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn flush(&self, seconds_since_last_scan: u32) -> Result<FlushReport> {
        Ok(self.aggregator.flush(seconds_since_last_scan)?)
    }

    /// Whether today's sighting quota is used up.
    #[must_use]
    pub fn storage_limited(&self) -> bool {
        self.aggregator.storage_limited()
    }

    /// Fail with `QuotaExceeded` if today's sighting quota is used up.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_capacity(&self) -> Result<()> {
        Ok(self.aggregator.ensure_capacity()?)
    }

    /// Run a matching pass; the window-mode token selects window mode.
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
        self.matcher.analyze(bundles, config, token, app)
    }

    /// Run a window-mode matching pass.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn analyze_window(&self, bundles: &[KeyBundle], app: &AppId) -> Result<bool> {
        self.matcher.analyze_window(bundles, app)
    }

    /// Sketch recorded for (app, token).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn sketch(&self, app: &AppId, token: &str) -> Result<ContactSketch> {
        self.exposure.sketch(app, token)
    }

    /// Details recorded for (app, token).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn details(&self, app: &AppId, token: &str) -> Result<Vec<ContactDetail>> {
        self.exposure.details(app, token)
    }

    /// Windows recorded for `app`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn windows(&self, app: &AppId) -> Result<Vec<ContactWindow>> {
        self.exposure.windows(app)
    }

    /// The app's own keys, for publication after a diagnosis.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn history_keys(&self, app: &AppId) -> Result<Vec<PeriodicKey>> {
        self.keys.history_keys(app)
    }

    /// Drop data past its retention: sightings older than the scan retention,
    /// and the app's keys and exposure results older than the incubation period.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn evict_expired(&self, app: &AppId) -> Result<()> {
        let sighting_cutoff = self
            .time
            .retention_cutoff(self.settings.scan_data_retention_days);
        let cutoff = self
            .time
            .retention_cutoff(self.settings.incubation_period_days);

        let sightings = self.store.delete_sightings_before(sighting_cutoff)?;
        let keys = self.store.delete_periodic_keys_before(app, cutoff)?;
        self.exposure.delete_before(app, cutoff)?;
        self.aggregator.clear();
        self.aggregator.reset_quota();
        info!(app = %app, sightings, keys, cutoff, "evicted expired data");
        Ok(())
    }

    /// Forget everything about `app`, as on uninstall.
    ///
    /// Sightings are not attributed to apps and are wiped entirely.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete_by_app(&self, app: &AppId) -> Result<()> {
        self.store.delete_periodic_keys(app)?;
        self.exposure.delete_app(app)?;
        self.store.delete_all_sightings()?;
        self.aggregator.clear();
        self.keys.forget(app);
        info!(app = %app, "deleted app data");
        Ok(())
    }
}

/// Async front end routing engine calls through the task queues.
///
/// Key access, scan-cycle transitions, eviction and wipes run on the
/// sequential queue. Sighting records, matching passes and result reads run on
/// the worker pool.
#[derive(Debug, Clone)]
pub struct ShieldRuntime {
    shield: Arc<ContactShield>,
    queues: TaskQueues,
}

impl ShieldRuntime {
    /// Start the queues. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(shield: Arc<ContactShield>, workers: usize) -> Self {
        debug!(workers, "starting shield runtime");
        Self {
            shield,
            queues: TaskQueues::spawn(workers),
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub const fn shield(&self) -> &Arc<ContactShield> {
        &self.shield
    }

    /// See [`ContactShield::current_beacon`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn current_beacon(&self, app: AppId) -> Result<[u8; BEACON_LEN]> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.current_beacon(&app))
            .await?
    }

    /// See [`ContactShield::record_sighting`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn record_sighting(&self, identifier: Vec<u8>, metadata: Vec<u8>, rssi: i32) -> Result<()> {
        let shield = self.shield.clone();
        self.queues
            .pool
            .run(move || shield.record_sighting(&identifier, &metadata, rssi))
            .await?
    }

    /// See [`ContactShield::begin_scan_cycle`].
    ///
    /// # Errors
    ///
    /// A task failure if the queue is gone.
    pub async fn begin_scan_cycle(&self) -> Result<()> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.begin_scan_cycle())
            .await?;
        Ok(())
    }

    /// See [`ContactShield::end_scan_cycle`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn end_scan_cycle(&self) -> Result<FlushReport> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.end_scan_cycle())
            .await?
    }

    /// See [`ContactShield::flush`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn flush(&self, seconds_since_last_scan: u32) -> Result<FlushReport> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.flush(seconds_since_last_scan))
            .await?
    }

    /// See [`ContactShield::ensure_capacity`]. Ordered after pending flushes.
    ///
    /// # Errors
    ///
    /// Quota exhaustion, or a task failure if the queue is gone.
    pub async fn ensure_capacity(&self) -> Result<()> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.ensure_capacity())
            .await?
    }

    /// See [`ContactShield::history_keys`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn history_keys(&self, app: AppId) -> Result<Vec<PeriodicKey>> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.history_keys(&app))
            .await?
    }

    /// See [`ContactShield::analyze`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn analyze(
        &self,
        bundles: Vec<KeyBundle>,
        config: DiagnosisConfiguration,
        token: String,
        app: AppId,
    ) -> Result<bool> {
        let shield = self.shield.clone();
        self.queues
            .pool
            .run(move || shield.analyze(&bundles, &config, &token, &app))
            .await?
    }

    /// See [`ContactShield::analyze_window`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn analyze_window(&self, bundles: Vec<KeyBundle>, app: AppId) -> Result<bool> {
        let shield = self.shield.clone();
        self.queues
            .pool
            .run(move || shield.analyze_window(&bundles, &app))
            .await?
    }

    /// See [`ContactShield::sketch`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn sketch(&self, app: AppId, token: String) -> Result<ContactSketch> {
        let shield = self.shield.clone();
        self.queues
            .pool
            .run(move || shield.sketch(&app, &token))
            .await?
    }

    /// See [`ContactShield::details`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn details(&self, app: AppId, token: String) -> Result<Vec<ContactDetail>> {
        let shield = self.shield.clone();
        self.queues
            .pool
            .run(move || shield.details(&app, &token))
            .await?
    }

    /// See [`ContactShield::windows`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the pool is gone.
    pub async fn windows(&self, app: AppId) -> Result<Vec<ContactWindow>> {
        let shield = self.shield.clone();
        self.queues.pool.run(move || shield.windows(&app)).await?
    }

    /// See [`ContactShield::evict_expired`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn evict_expired(&self, app: AppId) -> Result<()> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.evict_expired(&app))
            .await?
    }

    /// See [`ContactShield::delete_by_app`].
    ///
    /// # Errors
    ///
    /// Engine errors, or a task failure if the queue is gone.
    pub async fn delete_by_app(&self, app: AppId) -> Result<()> {
        let shield = self.shield.clone();
        self.queues
            .sequential
            .run(move || shield.delete_by_app(&app))
            .await?
    }
}
