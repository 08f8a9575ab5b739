//! Process-wide framework state.
//!
//! [`FrameworkStatus`] is a shared handle to whether the framework is
//! installed and active. It is refreshed at startup and after a pipeline run
//! completes, and read by every activation decision.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Installed/active status of the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameworkState {
    /// The framework is installed on the device.
    pub installed: bool,
    /// The framework is loaded and hooks can take effect.
    pub active: bool,
}

/// Shared handle to the current [`FrameworkState`].
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct FrameworkStatus {
    inner: Arc<RwLock<FrameworkState>>,
}

impl FrameworkStatus {
    /// Create a handle holding `state`.
    #[must_use]
    pub fn new(state: FrameworkState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> FrameworkState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the framework is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.get().active
    }

    /// Replace the state wholesale.
    pub fn set(&self, state: FrameworkState) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != state {
            info!(
                installed = state.installed,
                active = state.active,
                "framework state changed"
            );
        }
        *guard = state;
    }

    /// Record a completed installation with the verified activity.
    pub fn record_install(&self, active: bool) -> FrameworkState {
        let state = FrameworkState {
            installed: true,
            active,
        };
        self.set(state);
        state
    }
}
