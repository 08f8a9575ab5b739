//! Post-install verification.
//!
//! Decides whether a freshly installed framework is active. Verification
//! never fails a run: an inconclusive check reports the framework inactive.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::spawner::OperationSpec;

/// How to decide whether the installed framework is active.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostInstallCheck {
    /// Treat a successful installation as active.
    #[default]
    AssumeActive,

    /// Active when the marker file exists.
    MarkerFile {
        /// File written by the framework once loaded.
        path: PathBuf,
    },

    /// Active when the command exits successfully.
    Command {
        /// Verification command.
        #[serde(flatten)]
        spec: OperationSpec,
    },
}

impl PostInstallCheck {
    /// Run the check.
    pub async fn verify(&self) -> bool {
        match self {
            Self::AssumeActive => true,
            Self::MarkerFile { path } => {
                let present = path.exists();
                debug!(path = %path.display(), present, "checked activation marker");
                present
            },
            Self::Command { spec } => {
                let mut cmd = Command::new(&spec.command);
                cmd.args(&spec.args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                if let Some(cwd) = &spec.cwd {
                    cmd.current_dir(cwd);
                }
                for (k, v) in &spec.env {
                    cmd.env(k, v);
                }
                match cmd.status().await {
                    Ok(status) => status.success(),
                    Err(e) => {
                        warn!(error = %e, command = %spec.command, "verification command failed to run");
                        false
                    },
                }
            },
        }
    }
}
