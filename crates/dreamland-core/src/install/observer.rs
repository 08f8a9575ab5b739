//! Observer protocol for installation runs.
//!
//! Callbacks arrive on the install worker thread in this order: zero or more
//! `on_phase` interleaved with zero or more `on_line` / `on_error_line`,
//! followed by exactly one of `on_done` / `on_error`. The worker is serial,
//! so implementations must return promptly and re-dispatch to their own
//! context if they touch presentation state. An observer that panics
//! receives no further callbacks; the run itself carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};

use super::{FailureKind, InstallationFailure, Phase};

/// Receives events from an installation run.
pub trait InstallObserver: Send + Sync {
    /// A new phase was entered.
    fn on_phase(&self, phase: Phase);

    /// The privileged operation wrote a line to standard output.
    fn on_line(&self, line: &str);

    /// The privileged operation wrote a line to standard error.
    fn on_error_line(&self, line: &str);

    /// The run completed successfully. No further callbacks follow.
    fn on_done(&self);

    /// The run failed. No further callbacks follow.
    fn on_error(&self, failure: &InstallationFailure);
}

/// One recorded observer callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObserverEvent {
    /// `on_phase`.
    Phase {
        /// The phase entered.
        phase: Phase,
    },
    /// `on_line`.
    Line {
        /// The output line.
        line: String,
    },
    /// `on_error_line`.
    ErrorLine {
        /// The error output line.
        line: String,
    },
    /// `on_done`.
    Done,
    /// `on_error`.
    Error {
        /// Phase the run failed in.
        phase: Phase,
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable message.
        message: String,
    },
}

impl ObserverEvent {
    /// Whether this event ends a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Observer that records every callback in order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<ObserverEvent>>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Phases recorded so far, in order.
    #[must_use]
    pub fn phases(&self) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObserverEvent::Phase { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ObserverEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl InstallObserver for EventLog {
    fn on_phase(&self, phase: Phase) {
        self.push(ObserverEvent::Phase { phase });
    }

    fn on_line(&self, line: &str) {
        self.push(ObserverEvent::Line {
            line: line.to_string(),
        });
    }

    fn on_error_line(&self, line: &str) {
        self.push(ObserverEvent::ErrorLine {
            line: line.to_string(),
        });
    }

    fn on_done(&self) {
        self.push(ObserverEvent::Done);
    }

    fn on_error(&self, failure: &InstallationFailure) {
        self.push(ObserverEvent::Error {
            phase: failure.phase,
            kind: failure.kind(),
            message: failure.to_string(),
        });
    }
}

/// Observer that forwards every callback to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl InstallObserver for TracingObserver {
    fn on_phase(&self, phase: Phase) {
        info!(phase = %phase, code = phase.code(), "install phase");
    }

    fn on_line(&self, line: &str) {
        info!(target: "dreamland::install::output", "{line}");
    }

    fn on_error_line(&self, line: &str) {
        warn!(target: "dreamland::install::output", "{line}");
    }

    fn on_done(&self) {
        info!("installation finished");
    }

    fn on_error(&self, failure: &InstallationFailure) {
        error!(phase = %failure.phase, kind = ?failure.kind(), "{failure}");
    }
}

/// Delivery gate between a run and its observer.
///
/// Drops callbacks once the caller abandons the run and guarantees that at
/// most one terminal callback is delivered, with nothing after it. A panic
/// inside a callback is contained here and closes the gate.
pub(crate) struct ObserverGate {
    observer: Arc<dyn InstallObserver>,
    abandoned: Arc<AtomicBool>,
    terminated: AtomicBool,
    faulted: AtomicBool,
}

impl ObserverGate {
    pub(crate) fn new(observer: Arc<dyn InstallObserver>, abandoned: Arc<AtomicBool>) -> Self {
        Self {
            observer,
            abandoned,
            terminated: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    fn detached(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst) || self.faulted.load(Ordering::SeqCst)
    }

    fn open(&self) -> bool {
        !self.detached() && !self.terminated.load(Ordering::SeqCst)
    }

    /// Claim the single terminal slot; false if detached or already claimed.
    fn claim_terminal(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst) && !self.detached()
    }

    fn deliver(&self, callback: &'static str, f: impl FnOnce(&dyn InstallObserver)) {
        let observer = &*self.observer;
        if panic::catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
            self.faulted.store(true, Ordering::SeqCst);
            error!(callback, "install observer panicked; dropping its remaining callbacks");
        }
    }

    pub(crate) fn phase(&self, phase: Phase) {
        if self.open() {
            self.deliver("on_phase", |o| o.on_phase(phase));
        }
    }

    pub(crate) fn line(&self, line: &str) {
        if self.open() {
            self.deliver("on_line", |o| o.on_line(line));
        }
    }

    pub(crate) fn error_line(&self, line: &str) {
        if self.open() {
            self.deliver("on_error_line", |o| o.on_error_line(line));
        }
    }

    pub(crate) fn done(&self) {
        if self.claim_terminal() {
            self.deliver("on_done", |o| o.on_done());
        }
    }

    pub(crate) fn error(&self, failure: &InstallationFailure) {
        if self.claim_terminal() {
            self.deliver("on_error", |o| o.on_error(failure));
        }
    }
}
