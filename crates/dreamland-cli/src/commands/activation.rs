//! Framework status and activation commands.

use anyhow::{Context, Result};
use dreamland_core::{ActivationRecord, ManagerConfig};

use super::{open, runtime};

/// Show whether the framework is installed and active.
pub fn status(config: ManagerConfig) -> Result<()> {
    let rt = runtime()?;

    rt.block_on(async {
        let context = open(config).await?;
        let state = context.framework().get();
        let selinux = context.probe().snapshot();

        println!("Installed: {}", yes_no(state.installed));
        println!("Active:    {}", yes_no(state.active));
        println!(
            "SELinux:   {}",
            match (selinux.enabled, selinux.enforcing) {
                (false, _) => "disabled",
                (true, false) => "permissive",
                (true, true) => "enforcing",
            }
        );
        println!("Tracked:   {}", context.activations().len());
        Ok(())
    })
}

/// List tracked apps and modules.
pub fn list(config: ManagerConfig) -> Result<()> {
    let rt = runtime()?;

    rt.block_on(async {
        let context = open(config).await?;
        let records = context.activations().records();

        if records.is_empty() {
            println!("Nothing tracked");
            return Ok(());
        }

        println!(
            "{:<40} {:<24} {:<8} {:<8} {:<9}",
            "IDENTIFIER", "NAME", "KIND", "ENABLED", "SUPPORTED"
        );
        println!("{}", "-".repeat(93));
        for record in records {
            println!(
                "{:<40} {:<24} {:<8} {:<8} {:<9}",
                truncate(&record.identifier, 40),
                truncate(&record.display_name, 24),
                record.kind.as_str(),
                yes_no(record.enabled),
                yes_no(record.supported),
            );
        }
        Ok(())
    })
}

/// Track an app or module.
pub fn track(
    config: ManagerConfig,
    identifier: &str,
    name: &str,
    module: bool,
    supported: bool,
) -> Result<()> {
    let rt = runtime()?;

    rt.block_on(async {
        let context = open(config).await?;
        let record = if module {
            ActivationRecord::module(identifier, name, supported)
        } else {
            ActivationRecord::app(identifier, name)
        };
        let record = context
            .activations()
            .track(record)
            .with_context(|| format!("failed to track '{identifier}'"))?;

        println!(
            "Tracking {} '{}' ({})",
            record.kind,
            record.identifier,
            if record.enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    })
}

/// Enable or disable an app or module.
pub fn set(config: ManagerConfig, identifier: &str, enabled: bool) -> Result<()> {
    let rt = runtime()?;

    rt.block_on(async {
        let context = open(config).await?;
        let record = context
            .activations()
            .set_enabled(identifier, enabled)
            .with_context(|| {
                format!(
                    "failed to {} '{identifier}'",
                    if enabled { "enable" } else { "disable" }
                )
            })?;

        println!(
            "{} {} '{}'",
            if record.enabled { "Enabled" } else { "Disabled" },
            record.kind,
            record.identifier
        );
        Ok(())
    })
}

const fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Truncate a string to the given character count, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("com.example.very.long.package", 12), "com.examp...");
        assert_eq!(truncate("abcdef", 3), "abc");
    }
}
