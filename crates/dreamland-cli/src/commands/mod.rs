//! CLI command implementations.

pub mod activation;
pub mod install;
pub mod selinux;

use anyhow::{Context, Result};
use dreamland_core::{ManagerConfig, ManagerContext};

/// Build a single-threaded runtime for one command.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Initialize the manager and detect the framework.
pub async fn open(config: ManagerConfig) -> Result<ManagerContext> {
    let context = ManagerContext::initialize(config).context("failed to initialize manager")?;
    context.refresh_framework().await;
    Ok(context)
}
