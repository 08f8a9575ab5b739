//! SELinux inspection.

use std::path::Path;

use anyhow::{Context, Result};
use dreamland_core::ManagerConfig;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SelinuxReport<'a> {
    mount_dir: &'a Path,
    enabled: bool,
    enforcing: bool,
    process_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<FileReport<'a>>,
}

#[derive(Debug, Serialize)]
struct FileReport<'a> {
    path: &'a Path,
    context: Option<String>,
}

/// Print the SELinux state the installer would see.
pub fn show(config: &ManagerConfig, file: Option<&Path>, json: bool) -> Result<()> {
    let probe = config.selinux.probe();
    let state = probe.snapshot();
    let report = SelinuxReport {
        mount_dir: probe.mount_dir(),
        enabled: state.enabled,
        enforcing: state.enforcing,
        process_context: state.process_context,
        file: file.map(|path| FileReport {
            path,
            context: probe.file_context(path),
        }),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{out}");
        return Ok(());
    }

    let mode = match (report.enabled, report.enforcing) {
        (false, _) => "disabled",
        (true, false) => "permissive",
        (true, true) => "enforcing",
    };
    println!("SELinux:         {mode}");
    println!("Mount:           {}", report.mount_dir.display());
    println!(
        "Process context: {}",
        report.process_context.as_deref().unwrap_or("-")
    );
    if let Some(file) = &report.file {
        println!(
            "File context:    {} ({})",
            file.context.as_deref().unwrap_or("-"),
            file.path.display()
        );
    }
    Ok(())
}
