//! Framework installation.
//!
//! The run streams to the terminal. Ctrl-C abandons the observer; the
//! installer itself is never killed, so the command still waits for it to
//! exit before returning.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use dreamland_core::install::InstallObserver;
use dreamland_core::{InstallationFailure, ManagerConfig, ObserverEvent, Phase};

use super::{open, runtime};

/// Prints observer events to the terminal.
#[derive(Debug, Clone, Copy)]
struct ConsoleObserver {
    json: bool,
}

impl ConsoleObserver {
    fn emit_json(event: &ObserverEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize observer event"),
        }
    }
}

impl InstallObserver for ConsoleObserver {
    fn on_phase(&self, phase: Phase) {
        if self.json {
            Self::emit_json(&ObserverEvent::Phase { phase });
        } else {
            println!("==> {phase}");
        }
    }

    fn on_line(&self, line: &str) {
        if self.json {
            Self::emit_json(&ObserverEvent::Line {
                line: line.to_string(),
            });
        } else {
            println!("    {line}");
        }
    }

    fn on_error_line(&self, line: &str) {
        if self.json {
            Self::emit_json(&ObserverEvent::ErrorLine {
                line: line.to_string(),
            });
        } else {
            eprintln!("  ! {line}");
        }
    }

    fn on_done(&self) {
        if self.json {
            Self::emit_json(&ObserverEvent::Done);
        } else {
            println!("Installation complete");
        }
    }

    fn on_error(&self, failure: &InstallationFailure) {
        if self.json {
            Self::emit_json(&ObserverEvent::Error {
                phase: failure.phase,
                kind: failure.kind(),
                message: failure.to_string(),
            });
        } else {
            eprintln!("Installation failed: {failure}");
            if let Some(diagnostic) = failure.error.diagnostic() {
                eprintln!("Last error output:");
                for line in diagnostic.lines() {
                    eprintln!("  {line}");
                }
            }
        }
    }
}

/// Run one installation.
pub fn run(config: ManagerConfig, json: bool) -> Result<()> {
    let rt = runtime()?;

    rt.block_on(async {
        let context = open(config).await?;
        let handle = context
            .pipeline()
            .start(Arc::new(ConsoleObserver { json }))
            .context("failed to start installation")?;
        let token = handle.abandon_token();
        let outcome = handle.outcome();
        tokio::pin!(outcome);

        let abandoned = tokio::select! {
            result = &mut outcome => {
                let state = result.context("installation failed")?;
                if !json && !state.active {
                    println!("Framework installed but not active yet; a reboot may be required");
                }
                return Ok(());
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                token.abandon();
                if !json {
                    eprintln!("Abandoned; waiting for the installer to exit");
                }
                outcome.await
            },
        };

        match abandoned {
            Ok(state) => bail!(
                "installation abandoned (installer finished, framework installed={}, active={})",
                state.installed,
                state.active
            ),
            Err(e) => Err(e).context("installation abandoned"),
        }
    })
}
