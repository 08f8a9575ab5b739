//! Configuration parsing and management.
//!
//! The manager reads a TOML file describing where to look for SELinux, which
//! privileged command performs the installation, how to verify it, and where
//! activation state is persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::install::{OperationSpec, PostInstallCheck};
use crate::selinux::{
    DEFAULT_SELINUX_MOUNT, NoPlatformApi, PlatformSelinux, ProcfsPlatform, SelinuxProbe,
};

/// Top-level manager configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// SELinux probing.
    #[serde(default)]
    pub selinux: SelinuxConfig,

    /// Installation pipeline.
    #[serde(default)]
    pub installer: InstallerConfig,

    /// Framework detection.
    #[serde(default)]
    pub framework: FrameworkConfig,

    /// Activation state persistence.
    #[serde(default)]
    pub state: StateConfig,
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed or
    /// validated.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.installer.operation.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "installer.command must not be empty".to_string(),
            ));
        }
        if self.installer.diagnostic_tail_lines == 0 {
            return Err(ConfigError::Validation(
                "installer.diagnostic_tail_lines must be at least 1".to_string(),
            ));
        }
        if let PostInstallCheck::Command { spec } = &self.installer.verify {
            if spec.command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "installer.verify.command must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// SELinux probing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelinuxConfig {
    /// selinuxfs mount point.
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,

    /// procfs root used by the platform query fallback.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Whether to consult the platform query fallback at all.
    #[serde(default = "default_true")]
    pub platform_api: bool,
}

impl Default for SelinuxConfig {
    fn default() -> Self {
        Self {
            mount_dir: default_mount_dir(),
            proc_root: default_proc_root(),
            platform_api: true,
        }
    }
}

impl SelinuxConfig {
    /// Build the probe this configuration describes.
    #[must_use]
    pub fn probe(&self) -> SelinuxProbe {
        let platform: Arc<dyn PlatformSelinux> = if self.platform_api {
            Arc::new(ProcfsPlatform::new(&self.proc_root))
        } else {
            Arc::new(NoPlatformApi)
        };
        SelinuxProbe::new(&self.mount_dir, platform)
    }
}

/// Installation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// The privileged operation.
    #[serde(flatten)]
    pub operation: OperationSpec,

    /// The installer carries the policy exceptions needed on an enforcing
    /// host. When false, an enforcing host is rejected during `Checking`.
    #[serde(default)]
    pub allow_enforcing: bool,

    /// Number of trailing error lines kept as failure diagnostic.
    #[serde(default = "default_diagnostic_tail_lines")]
    pub diagnostic_tail_lines: usize,

    /// Post-install verification.
    #[serde(default)]
    pub verify: PostInstallCheck,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            operation: OperationSpec::builder()
                .command("/system/bin/sh")
                .args(["/data/adb/dreamland/install.sh"])
                .build(),
            allow_enforcing: false,
            diagnostic_tail_lines: default_diagnostic_tail_lines(),
            verify: PostInstallCheck::default(),
        }
    }
}

/// Framework detection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameworkConfig {
    /// File whose presence means the framework is installed. Written after
    /// every successful installation.
    #[serde(default = "default_install_marker")]
    pub install_marker: PathBuf,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            install_marker: default_install_marker(),
        }
    }
}

/// Activation state persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// JSON file holding activation records. Absent means in-memory only.
    #[serde(default)]
    pub activation_file: Option<PathBuf>,
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SELINUX_MOUNT)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_install_marker() -> PathBuf {
    PathBuf::from("/data/adb/dreamland/installed")
}

const fn default_true() -> bool {
    true
}

const fn default_diagnostic_tail_lines() -> usize {
    20
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
