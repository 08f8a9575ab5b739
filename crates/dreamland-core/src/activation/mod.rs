//! Per-entity activation state.
//!
//! Apps and modules are tracked as [`ActivationRecord`]s. Their `enabled`
//! flag can only change while the framework is active and only for
//! supported records. Accepted changes are persisted through an
//! [`ActivationBackend`] and announced to subscribers.
//!
//! Each record sits behind its own lock inside a map guarded by an outer
//! lock. Writers to one identifier serialize; other identifiers are not
//! blocked, and readers always receive a whole record.

mod backend;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use backend::{ActivationBackend, BackendError, EphemeralBackend, JsonFileBackend};

use crate::framework::FrameworkStatus;

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Kind of hookable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// An installed application that modules can hook into.
    App,
    /// A framework module.
    Module,
}

impl EntityKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Module => "module",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation state of one app or module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// Stable identifier (package name).
    pub identifier: String,
    /// Human-readable name.
    pub display_name: String,
    /// App or module.
    pub kind: EntityKind,
    /// Whether hooks for this entity are enabled.
    pub enabled: bool,
    /// Whether the entity can be toggled on this device.
    pub supported: bool,
}

impl ActivationRecord {
    /// A disabled app record. Apps are always supported.
    #[must_use]
    pub fn app(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
            kind: EntityKind::App,
            enabled: false,
            supported: true,
        }
    }

    /// A disabled module record.
    #[must_use]
    pub fn module(
        identifier: impl Into<String>,
        display_name: impl Into<String>,
        supported: bool,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
            kind: EntityKind::Module,
            enabled: false,
            supported,
        }
    }

    fn normalized(mut self) -> Self {
        if self.kind == EntityKind::App {
            self.supported = true;
        }
        self
    }
}

/// Notification of an accepted change to `enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationChange {
    /// Entity that changed.
    pub identifier: String,
    /// App or module.
    pub kind: EntityKind,
    /// New value.
    pub enabled: bool,
}

/// Why a change was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The framework is not installed or not active.
    FrameworkInactive,
    /// The entity cannot be toggled on this device.
    Unsupported,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameworkInactive => f.write_str("framework is not active"),
            Self::Unsupported => f.write_str("not supported on this device"),
        }
    }
}

/// Activation store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this identifier is tracked.
    #[error("no activation record for '{0}'")]
    NotFound(String),

    /// The change was refused; nothing was modified.
    #[error("cannot change '{identifier}': {reason}")]
    Rejected {
        /// Entity the change targeted.
        identifier: String,
        /// Why it was refused.
        reason: RejectReason,
    },

    /// Persisting the change failed; nothing was modified.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Thread-safe store of activation records.
#[derive(Debug)]
pub struct ActivationStore {
    records: RwLock<HashMap<String, Arc<RwLock<ActivationRecord>>>>,
    framework: FrameworkStatus,
    backend: Arc<dyn ActivationBackend>,
    changes: broadcast::Sender<ActivationChange>,
}

impl ActivationStore {
    /// Create a store, loading previously persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot load its records.
    pub fn new(
        framework: FrameworkStatus,
        backend: Arc<dyn ActivationBackend>,
    ) -> Result<Self, StoreError> {
        let loaded = backend.load()?;
        debug!(count = loaded.len(), "loaded activation records");
        let records = loaded
            .into_iter()
            .map(|record| {
                let record = record.normalized();
                (record.identifier.clone(), Arc::new(RwLock::new(record)))
            })
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            records: RwLock::new(records),
            framework,
            backend,
            changes,
        })
    }

    /// Create a store that persists nothing.
    #[must_use]
    pub fn ephemeral(framework: FrameworkStatus) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            framework,
            backend: Arc::new(EphemeralBackend),
            changes,
        }
    }

    /// Register an entity or refresh its metadata.
    ///
    /// An already tracked entity keeps its current `enabled` value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the record cannot be persisted.
    pub fn track(&self, record: ActivationRecord) -> Result<ActivationRecord, StoreError> {
        let record = record.normalized();
        if let Ok(entry) = self.entry(&record.identifier) {
            return self.refresh(&entry, record, false);
        }

        // Persisted before the map is locked so a slow write never stalls
        // readers of other identifiers.
        self.backend.store(&record)?;

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = records.get(&record.identifier).cloned() {
            drop(records);
            // Tracked concurrently; our write may have replaced the winner's.
            return self.refresh(&entry, record, true);
        }
        records.insert(
            record.identifier.clone(),
            Arc::new(RwLock::new(record.clone())),
        );
        drop(records);
        debug!(identifier = %record.identifier, kind = %record.kind, "tracked");
        Ok(record)
    }

    /// Change whether an entity is enabled.
    ///
    /// Refused unless the framework is active and the entity is supported.
    /// Setting the current value again succeeds without notifying.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` if the change is not allowed,
    /// `StoreError::NotFound` for an unknown identifier, or
    /// `StoreError::Backend` if the change cannot be persisted.
    pub fn set_enabled(
        &self,
        identifier: &str,
        enabled: bool,
    ) -> Result<ActivationRecord, StoreError> {
        let entry = self.entry(identifier)?;
        if !self.framework.is_active() {
            return Err(StoreError::Rejected {
                identifier: identifier.to_string(),
                reason: RejectReason::FrameworkInactive,
            });
        }

        let mut current = entry.write().unwrap_or_else(PoisonError::into_inner);
        if !current.supported {
            return Err(StoreError::Rejected {
                identifier: identifier.to_string(),
                reason: RejectReason::Unsupported,
            });
        }
        if current.enabled == enabled {
            return Ok(current.clone());
        }

        let updated = ActivationRecord {
            enabled,
            ..current.clone()
        };
        self.backend.store(&updated)?;
        *current = updated.clone();
        drop(current);

        info!(identifier, enabled, "activation changed");
        // No subscribers is not an error.
        let _ = self.changes.send(ActivationChange {
            identifier: updated.identifier.clone(),
            kind: updated.kind,
            enabled,
        });
        Ok(updated)
    }

    /// Current record for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for an unknown identifier.
    pub fn query(&self, identifier: &str) -> Result<ActivationRecord, StoreError> {
        let entry = self.entry(identifier)?;
        let record = entry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(record.clone())
    }

    /// Snapshot of every record, sorted by identifier.
    #[must_use]
    pub fn records(&self) -> Vec<ActivationRecord> {
        let entries: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut records: Vec<_> = entries
            .iter()
            .map(|entry| entry.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        records
    }

    /// Receive a notification for every accepted change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationChange> {
        self.changes.subscribe()
    }

    /// Number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, identifier: &str) -> Result<Arc<RwLock<ActivationRecord>>, StoreError> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))
    }

    fn refresh(
        &self,
        entry: &RwLock<ActivationRecord>,
        record: ActivationRecord,
        rewrite: bool,
    ) -> Result<ActivationRecord, StoreError> {
        let mut current = entry.write().unwrap_or_else(PoisonError::into_inner);
        let updated = ActivationRecord {
            enabled: current.enabled,
            ..record
        };
        if rewrite || *current != updated {
            self.backend.store(&updated)?;
            *current = updated.clone();
        }
        Ok(updated)
    }
}
