//! Start/notify-once bookkeeping for the tracing session.
//!
//! A caller asks the engine to start; the radio answers asynchronously with
//! either a result or an error, possibly both, in any order. The caller's
//! responder must fire exactly once per start attempt.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Outcome reported to a start responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Advertising and scanning are running.
    Started,
    /// The radio refused to start.
    Failed(String),
}

/// One-shot callback armed by [`ContactSession::begin_start`].
pub type Responder = Box<dyn FnOnce(StartOutcome) + Send>;

/// How a start request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAttempt {
    /// The session was already running; the responder was answered right away.
    AlreadyRunning,
    /// The responder waits for the radio.
    Pending,
}

/// Tracks whether tracing runs and whether a start caller still awaits an answer.
#[derive(Default)]
pub struct ContactSession {
    running: AtomicBool,
    need_response: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl fmt::Debug for ContactSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContactSession")
            .field("running", &self.is_running())
            .field("need_response", &self.need_response.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ContactSession {
    /// A stopped session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether tracing is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a start request.
    pub fn begin_start(&self, responder: Responder) -> StartAttempt {
        if self.is_running() {
            debug!("session already running");
            responder(StartOutcome::Started);
            return StartAttempt::AlreadyRunning;
        }
        *self.responder.lock() = Some(responder);
        self.need_response.store(true, Ordering::Release);
        StartAttempt::Pending
    }

    /// The radio finished starting.
    ///
    /// Only marks the session running when this call settles the pending start.
    pub fn on_radio_result(&self, ok: bool) {
        if !self.claim() {
            debug!(ok, "start already settled, ignoring radio result");
            return;
        }
        if ok {
            self.running.store(true, Ordering::Release);
            info!("tracing session started");
            self.respond(StartOutcome::Started);
        } else {
            warn!("radio failed to start");
            self.respond(StartOutcome::Failed("radio failed to start".into()));
        }
    }

    /// The radio reported an error.
    pub fn on_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "radio error");
        if self.claim() {
            self.respond(StartOutcome::Failed(reason));
        }
    }

    /// Stop tracing. A pending responder is dropped unanswered.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.need_response.store(false, Ordering::Release);
        self.responder.lock().take();
        info!("tracing session stopped");
    }

    fn claim(&self) -> bool {
        self.need_response
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn respond(&self, outcome: StartOutcome) {
        let responder = self.responder.lock().take();
        if let Some(responder) = responder {
            responder(outcome);
        }
    }
}
