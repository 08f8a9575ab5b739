//! Manager context.
//!
//! Owns the long-lived pieces every surface shares: the SELinux probe,
//! framework status, activation store, and install worker.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::activation::{
    ActivationBackend, ActivationStore, BackendError, EphemeralBackend, JsonFileBackend,
    StoreError,
};
use crate::config::ManagerConfig;
use crate::framework::{FrameworkState, FrameworkStatus};
use crate::install::{InstallWorker, InstallationPipeline, WorkerError};
use crate::selinux::SelinuxProbe;

/// Errors building a [`ManagerContext`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// The activation state could not be opened or loaded.
    #[error("failed to load activation state: {0}")]
    Store(#[from] StoreError),

    /// The install worker could not be started.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl From<BackendError> for ContextError {
    fn from(e: BackendError) -> Self {
        Self::Store(StoreError::Backend(e))
    }
}

/// Shared manager state.
#[derive(Debug)]
pub struct ManagerContext {
    config: ManagerConfig,
    probe: SelinuxProbe,
    framework: FrameworkStatus,
    activations: Arc<ActivationStore>,
    worker: InstallWorker,
}

impl ManagerContext {
    /// Build the context from configuration.
    ///
    /// Framework status starts as not installed; call
    /// [`refresh_framework`](Self::refresh_framework) to detect it.
    ///
    /// # Errors
    ///
    /// Returns an error if activation state cannot be loaded or the install
    /// worker cannot be started.
    pub fn initialize(config: ManagerConfig) -> Result<Self, ContextError> {
        let probe = config.selinux.probe();
        let framework = FrameworkStatus::default();

        let backend: Arc<dyn ActivationBackend> = match &config.state.activation_file {
            Some(path) => Arc::new(JsonFileBackend::open(path)?),
            None => Arc::new(EphemeralBackend),
        };
        let activations = Arc::new(ActivationStore::new(framework.clone(), backend)?);
        let worker = InstallWorker::spawn()?;

        debug!(
            mount_dir = %probe.mount_dir().display(),
            tracked = activations.len(),
            "manager context initialized"
        );
        Ok(Self {
            config,
            probe,
            framework,
            activations,
            worker,
        })
    }

    /// Detect whether the framework is installed and active.
    ///
    /// Installed means the install marker exists; active additionally
    /// requires the post-install check to pass.
    pub async fn refresh_framework(&self) -> FrameworkState {
        let installed = self.config.framework.install_marker.exists();
        let active = installed && self.config.installer.verify.verify().await;
        let state = FrameworkState { installed, active };
        info!(installed, active, "framework detected");
        self.framework.set(state);
        state
    }

    /// A pipeline for one installation run.
    #[must_use]
    pub fn pipeline(&self) -> InstallationPipeline {
        InstallationPipeline::new(
            &self.config.installer,
            self.probe.clone(),
            self.framework.clone(),
            self.worker.clone(),
        )
        .with_install_marker(&self.config.framework.install_marker)
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The SELinux probe.
    #[must_use]
    pub const fn probe(&self) -> &SelinuxProbe {
        &self.probe
    }

    /// Shared framework status.
    #[must_use]
    pub const fn framework(&self) -> &FrameworkStatus {
        &self.framework
    }

    /// Shared activation store.
    #[must_use]
    pub fn activations(&self) -> Arc<ActivationStore> {
        Arc::clone(&self.activations)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::install::PostInstallCheck;

    fn config(dir: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.selinux.mount_dir = dir.join("selinux");
        config.selinux.platform_api = false;
        config.framework.install_marker = dir.join("installed");
        config
    }

    #[tokio::test]
    async fn test_refresh_without_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let context = ManagerContext::initialize(config(dir.path())).unwrap();

        let state = context.refresh_framework().await;
        assert_eq!(state, FrameworkState::default());
    }

    #[tokio::test]
    async fn test_refresh_installed_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("installed"), "").unwrap();
        let context = ManagerContext::initialize(config(dir.path())).unwrap();

        let state = context.refresh_framework().await;
        assert!(state.installed);
        assert!(state.active);
        assert!(context.framework().is_active());
    }

    #[tokio::test]
    async fn test_refresh_installed_but_inactive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("installed"), "").unwrap();
        let mut config = config(dir.path());
        config.installer.verify = PostInstallCheck::MarkerFile {
            path: dir.path().join("active"),
        };
        let context = ManagerContext::initialize(config).unwrap();

        let state = context.refresh_framework().await;
        assert!(state.installed);
        assert!(!state.active);
    }

    #[test]
    fn test_activation_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activation.json");
        std::fs::write(
            &path,
            r#"{"com.example.mod":{"identifier":"com.example.mod","display_name":"Mod","kind":"module","enabled":true,"supported":true}}"#,
        )
        .unwrap();
        let mut config = config(dir.path());
        config.state.activation_file = Some(path);

        let context = ManagerContext::initialize(config).unwrap();
        assert!(context.activations().query("com.example.mod").unwrap().enabled);
    }

    #[test]
    fn test_corrupt_activation_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activation.json");
        std::fs::write(&path, "[").unwrap();
        let mut config = config(dir.path());
        config.state.activation_file = Some(path);

        assert!(matches!(
            ManagerContext::initialize(config),
            Err(ContextError::Store(StoreError::Backend(_)))
        ));
    }
}
