//! Framework installation pipeline.
//!
//! An installation run moves forward through a fixed sequence of phases:
//!
//! ```text
//! Idle -> Preparing -> Checking -> Installing -> Finalizing -> Done
//!              \            \            \             \
//!               +------------+------------+-------------+--> Failed
//! ```
//!
//! Progress, output lines and the terminal outcome are delivered to an
//! [`InstallObserver`] on the install worker thread.
//!
//! # Invariants
//!
//! - Phases are strictly increasing within a run; none is skipped or repeated.
//! - Exactly one of `on_done` / `on_error` is delivered, and it is the last
//!   callback of the run.
//! - A pipeline value runs at most once: [`InstallationPipeline::start`]
//!   consumes it.

mod observer;
mod pipeline;
mod spawner;
mod verify;
mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use observer::{EventLog, InstallObserver, ObserverEvent, TracingObserver};
pub use pipeline::{AbandonToken, HandleError, InstallationPipeline, PipelineHandle};
pub use spawner::{MAX_LINE_LENGTH, OperationSpec, OperationSpecBuilder};
pub use verify::PostInstallCheck;
pub use worker::{InstallWorker, WorkerError};

/// A step of the installation pipeline.
///
/// The discriminant is the stable integer tag used in logs and JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    /// Validating the configured operation.
    Preparing = 0,
    /// Checking the host security environment.
    Checking = 1,
    /// Running the privileged operation.
    Installing = 2,
    /// Verifying the result and updating framework state.
    Finalizing = 3,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 4] = [
        Self::Preparing,
        Self::Checking,
        Self::Installing,
        Self::Finalizing,
    ];

    /// Stable integer tag.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up a phase by its integer tag.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Preparing),
            1 => Some(Self::Checking),
            2 => Some(Self::Installing),
            3 => Some(Self::Finalizing),
            _ => None,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Checking => "checking",
            Self::Installing => "installing",
            Self::Finalizing => "finalizing",
        }
    }

    /// The phase that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Preparing => Some(Self::Checking),
            Self::Checking => Some(Self::Installing),
            Self::Installing => Some(Self::Finalizing),
            Self::Finalizing => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started.
    Idle,
    /// Executing the given phase.
    Running(Phase),
    /// Completed successfully.
    Done,
    /// Failed while in the given phase.
    Failed(Phase),
}

impl RunState {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running(phase) => write!(f, "running({phase})"),
            Self::Done => f.write_str("done"),
            Self::Failed(phase) => write!(f, "failed({phase})"),
        }
    }
}

/// A rejected run-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run transition from {from} to {to}")]
pub struct TransitionError {
    /// State before the attempted transition.
    pub from: RunState,
    /// Attempted target state.
    pub to: RunState,
}

/// Enforces the forward-only phase sequence of a run.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTracker {
    state: RunState,
}

impl PhaseTracker {
    /// A tracker in the `Idle` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RunState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Phase currently executing, or the phase a failed run stopped in.
    #[must_use]
    pub const fn phase(&self) -> Option<Phase> {
        match self.state {
            RunState::Running(phase) | RunState::Failed(phase) => Some(phase),
            RunState::Idle | RunState::Done => None,
        }
    }

    /// Enter `phase`, which must directly follow the current one.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` if `phase` would skip, repeat or regress.
    pub fn enter(&mut self, phase: Phase) -> Result<Phase, TransitionError> {
        let expected = match self.state {
            RunState::Idle => Some(Phase::Preparing),
            RunState::Running(current) => current.next(),
            RunState::Done | RunState::Failed(_) => None,
        };
        if expected != Some(phase) {
            return Err(TransitionError {
                from: self.state,
                to: RunState::Running(phase),
            });
        }
        self.state = RunState::Running(phase);
        Ok(phase)
    }

    /// Complete the run. Only valid from `Finalizing`.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` from any other state.
    pub fn finish(&mut self) -> Result<(), TransitionError> {
        if self.state != RunState::Running(Phase::Finalizing) {
            return Err(TransitionError {
                from: self.state,
                to: RunState::Done,
            });
        }
        self.state = RunState::Done;
        Ok(())
    }

    /// Fail the run in its current phase and return that phase.
    ///
    /// A run that fails before entering any phase is attributed to
    /// `Preparing`. Failing an already terminal run leaves it unchanged.
    pub fn fail(&mut self) -> Phase {
        match self.state {
            RunState::Running(phase) | RunState::Failed(phase) => {
                self.state = RunState::Failed(phase);
                phase
            },
            RunState::Idle => {
                self.state = RunState::Failed(Phase::Preparing);
                Phase::Preparing
            },
            RunState::Done => Phase::Finalizing,
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// How the privileged operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
}

impl OperationStatus {
    /// Whether the operation reported success.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<std::process::ExitStatus> for OperationStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Coarse classification of an installation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The host cannot support the installation.
    EnvironmentUnsupported,
    /// The OS denied a required operation.
    PermissionDenied,
    /// The privileged operation reported failure.
    OperationFailed,
    /// An unexpected I/O error occurred.
    Io,
    /// The pipeline violated its own phase ordering.
    Internal,
}

/// Errors that terminate an installation run.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The host environment cannot support the installation.
    #[error("environment unsupported: {reason}")]
    EnvironmentUnsupported {
        /// Why the environment is unsupported.
        reason: String,
    },

    /// The OS denied a required operation.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// What was denied.
        reason: String,
    },

    /// The privileged operation exited unsuccessfully.
    #[error("privileged operation failed with {status}")]
    OperationFailed {
        /// How the operation ended.
        status: OperationStatus,
        /// Trailing error output captured from the operation.
        diagnostic: Option<String>,
    },

    /// An unexpected I/O error.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Phase ordering was violated.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl InstallError {
    /// Classify an I/O error, separating permission denials.
    pub fn from_io(context: impl Into<String>, source: std::io::Error) -> Self {
        let context = context.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                reason: format!("{context}: {source}"),
            }
        } else {
            Self::Io { context, source }
        }
    }

    /// The failure classification.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::EnvironmentUnsupported { .. } => FailureKind::EnvironmentUnsupported,
            Self::PermissionDenied { .. } => FailureKind::PermissionDenied,
            Self::OperationFailed { .. } => FailureKind::OperationFailed,
            Self::Io { .. } => FailureKind::Io,
            Self::InvalidTransition(_) => FailureKind::Internal,
        }
    }

    /// Captured diagnostic output, if any.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::OperationFailed { diagnostic, .. } => diagnostic.as_deref(),
            _ => None,
        }
    }
}

/// A terminal installation failure and the phase it occurred in.
#[derive(Debug, Error)]
#[error("{phase} failed: {error}")]
pub struct InstallationFailure {
    /// Phase in which the run failed.
    pub phase: Phase,
    /// What went wrong.
    #[source]
    pub error: InstallError,
}

impl InstallationFailure {
    /// The failure classification.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_codes() {
        for window in Phase::ALL.windows(2) {
            assert!(window[0] < window[1]);
            assert_eq!(window[0].next(), Some(window[1]));
            assert_eq!(window[0].code() + 1, window[1].code());
        }
        for phase in Phase::ALL {
            assert_eq!(Phase::from_code(phase.code()), Some(phase));
        }
        assert_eq!(Phase::from_code(4), None);
        assert_eq!(Phase::Finalizing.next(), None);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Installing.to_string(), "installing");
        assert_eq!(
            serde_json::to_string(&Phase::Checking).unwrap(),
            "\"checking\""
        );
    }

    #[test]
    fn test_tracker_full_sequence() {
        let mut tracker = PhaseTracker::new();
        for phase in Phase::ALL {
            assert_eq!(tracker.enter(phase), Ok(phase));
            assert_eq!(tracker.phase(), Some(phase));
        }
        tracker.finish().unwrap();
        assert_eq!(tracker.state(), RunState::Done);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_tracker_rejects_skip_and_repeat() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.enter(Phase::Checking).is_err());

        tracker.enter(Phase::Preparing).unwrap();
        assert!(tracker.enter(Phase::Preparing).is_err());
        assert!(tracker.enter(Phase::Installing).is_err());
        assert_eq!(tracker.state(), RunState::Running(Phase::Preparing));
    }

    #[test]
    fn test_tracker_rejects_regression() {
        let mut tracker = PhaseTracker::new();
        tracker.enter(Phase::Preparing).unwrap();
        tracker.enter(Phase::Checking).unwrap();

        let err = tracker.enter(Phase::Preparing).unwrap_err();
        assert_eq!(err.from, RunState::Running(Phase::Checking));
        assert_eq!(
            err.to_string(),
            "invalid run transition from running(checking) to running(preparing)"
        );
    }

    #[test]
    fn test_tracker_finish_requires_finalizing() {
        let mut tracker = PhaseTracker::new();
        tracker.enter(Phase::Preparing).unwrap();
        assert!(tracker.finish().is_err());
    }

    #[test]
    fn test_tracker_fail_is_terminal() {
        let mut tracker = PhaseTracker::new();
        tracker.enter(Phase::Preparing).unwrap();
        tracker.enter(Phase::Checking).unwrap();

        assert_eq!(tracker.fail(), Phase::Checking);
        assert_eq!(tracker.state(), RunState::Failed(Phase::Checking));
        assert!(tracker.enter(Phase::Installing).is_err());
        assert!(tracker.finish().is_err());
    }

    #[test]
    fn test_fail_before_start_is_preparing() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.fail(), Phase::Preparing);
    }

    #[test]
    fn test_error_kinds() {
        let denied = InstallError::from_io(
            "spawn",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.kind(), FailureKind::PermissionDenied);

        let io = InstallError::from_io("spawn", std::io::Error::from(std::io::ErrorKind::Other));
        assert_eq!(io.kind(), FailureKind::Io);

        let failed = InstallError::OperationFailed {
            status: OperationStatus {
                code: Some(3),
                signal: None,
            },
            diagnostic: Some("boom".into()),
        };
        assert_eq!(failed.kind(), FailureKind::OperationFailed);
        assert_eq!(failed.diagnostic(), Some("boom"));
        assert_eq!(
            failed.to_string(),
            "privileged operation failed with exit code 3"
        );
    }

    #[test]
    fn test_failure_message_names_phase() {
        let failure = InstallationFailure {
            phase: Phase::Checking,
            error: InstallError::EnvironmentUnsupported {
                reason: "SELinux is enforcing".into(),
            },
        };
        assert_eq!(
            failure.to_string(),
            "checking failed: environment unsupported: SELinux is enforcing"
        );
        assert_eq!(failure.kind(), FailureKind::EnvironmentUnsupported);
    }

    #[test]
    fn test_operation_status_display() {
        let killed = OperationStatus {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "signal 9");
        assert!(!killed.success());
        assert!(
            OperationStatus {
                code: Some(0),
                signal: None
            }
            .success()
        );
    }
}
