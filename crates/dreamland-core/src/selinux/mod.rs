//! SELinux state detection.
//!
//! [`SelinuxProbe`] answers whether mandatory access control is enabled and
//! enforcing, and looks up security contexts. It combines direct reads of
//! selinuxfs with the optional platform API.
//!
//! # Contracts
//!
//! - The probe never returns an error. Every failure degrades to a
//!   conservative answer and is logged.
//! - Nothing is cached. Enforcement can be toggled out-of-band by another
//!   privileged actor, so every call re-reads the host.
//! - When SELinux is disabled, the probe reports permissive and no context.
//! - An ambiguous enforcement state resolves toward enforcing.

mod platform;
mod strategy;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

pub use platform::{NoPlatformApi, PlatformError, PlatformSelinux, ProcfsPlatform};
pub use strategy::{
    EnforcementSource, Verdict, classify_status_read, enforcement_chain, read_status_byte,
    resolve,
};

/// Default selinuxfs mount point.
pub const DEFAULT_SELINUX_MOUNT: &str = "/sys/fs/selinux";

/// Name of the enforcement status file inside the selinuxfs mount.
pub const ENFORCE_FILE_NAME: &str = "enforce";

/// A point-in-time view of the host's SELinux state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContextState {
    /// Whether SELinux is enabled.
    pub enabled: bool,
    /// Whether SELinux is enforcing. Always false when disabled.
    pub enforcing: bool,
    /// Security context of the current process. Always `None` when disabled.
    pub process_context: Option<String>,
}

/// Read-only SELinux queries against the host.
#[derive(Debug, Clone)]
pub struct SelinuxProbe {
    mount_dir: PathBuf,
    platform: Arc<dyn PlatformSelinux>,
}

impl SelinuxProbe {
    /// Create a probe for the given selinuxfs mount and platform API.
    #[must_use]
    pub fn new(mount_dir: impl Into<PathBuf>, platform: Arc<dyn PlatformSelinux>) -> Self {
        Self {
            mount_dir: mount_dir.into(),
            platform,
        }
    }

    /// Create a probe for the running host (`/sys/fs/selinux` and `/proc`).
    #[must_use]
    pub fn system() -> Self {
        Self::new(DEFAULT_SELINUX_MOUNT, Arc::new(ProcfsPlatform::default()))
    }

    /// The selinuxfs mount directory.
    #[must_use]
    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// Path of the enforcement status file.
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.mount_dir.join(ENFORCE_FILE_NAME)
    }

    /// Returns whether SELinux is enabled.
    ///
    /// The presence of the selinuxfs mount is authoritative; the platform API
    /// is only consulted when the mount is absent.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        if self.mount_dir.exists() {
            return true;
        }
        match self.platform.is_enabled() {
            Ok(enabled) => enabled,
            Err(e) => {
                error!(error = %e, "platform SELinux enabled query failed");
                false
            },
        }
    }

    /// Returns whether SELinux is enforcing.
    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        resolve(&enforcement_chain(&self.status_file()), &*self.platform)
    }

    /// Returns the security context of the current process.
    ///
    /// `None` if SELinux is disabled or the lookup fails.
    #[must_use]
    pub fn process_context(&self) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        match self.platform.context() {
            Ok(context) => Some(context),
            Err(e) => {
                error!(error = %e, "failed to get the security context of the current process");
                None
            },
        }
    }

    /// Returns the security context of the file at `path`.
    ///
    /// `None` if SELinux is disabled or the lookup fails.
    #[must_use]
    pub fn file_context(&self, path: &Path) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        match self.platform.file_context(path) {
            Ok(context) => Some(context),
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to get file security context");
                None
            },
        }
    }

    /// Take a snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SecurityContextState {
        if !self.is_enabled() {
            return SecurityContextState {
                enabled: false,
                enforcing: false,
                process_context: None,
            };
        }
        SecurityContextState {
            enabled: true,
            enforcing: self.is_enforcing(),
            process_context: self.process_context(),
        }
    }
}
