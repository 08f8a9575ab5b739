//! # dreamland-core
//!
//! Core of the Dreamland hooking-framework manager.
//!
//! The manager installs the framework onto a device by running a privileged
//! operation, reports progress while it runs, and afterwards lets the user
//! enable or disable hooks for individual apps and modules.
//!
//! - [`selinux`]: decides whether SELinux is enabled and enforcing, and reads
//!   process and file security contexts. Probing never fails; it degrades.
//! - [`install`]: the installation pipeline. Runs on a dedicated worker,
//!   moves through `Preparing`, `Checking`, `Installing`, `Finalizing`, and
//!   reports to an [`InstallObserver`] with exactly one terminal callback.
//! - [`activation`]: per-entity enabled state, gated on the framework being
//!   active.
//! - [`framework`]: the shared installed/active status.
//! - [`config`]: the TOML configuration.
//! - [`context`]: wires the pieces above together.
//!
//! ## Example
//!
//! ```rust
//! use dreamland_core::{
//!     ActivationRecord, ActivationStore, FrameworkStatus, RejectReason, StoreError,
//! };
//!
//! let framework = FrameworkStatus::default();
//! let store = ActivationStore::ephemeral(framework.clone());
//! store.track(ActivationRecord::app("com.example.app", "Example")).unwrap();
//!
//! // Nothing can be enabled until the framework is active.
//! assert!(matches!(
//!     store.set_enabled("com.example.app", true),
//!     Err(StoreError::Rejected { reason: RejectReason::FrameworkInactive, .. })
//! ));
//!
//! framework.record_install(true);
//! assert!(store.set_enabled("com.example.app", true).unwrap().enabled);
//! ```

#![warn(missing_docs)]

pub mod activation;
pub mod config;
pub mod context;
pub mod framework;
pub mod install;
pub mod selinux;

pub use activation::{
    ActivationBackend, ActivationChange, ActivationRecord, ActivationStore, BackendError,
    EntityKind, EphemeralBackend, JsonFileBackend, RejectReason, StoreError,
};
pub use config::{ConfigError, ManagerConfig};
pub use context::{ContextError, ManagerContext};
pub use framework::{FrameworkState, FrameworkStatus};
pub use install::{
    FailureKind, InstallError, InstallObserver, InstallationFailure, InstallationPipeline,
    ObserverEvent, Phase, PipelineHandle,
};
pub use selinux::{SecurityContextState, SelinuxProbe};
