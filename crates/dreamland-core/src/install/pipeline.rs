//! The installation run itself.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::observer::{InstallObserver, ObserverGate};
use super::spawner::{self, MAX_LINE_LENGTH, OperationSpec, SpawnedOperation, read_line_bounded};
use super::verify::PostInstallCheck;
use super::worker::{InstallWorker, WorkerError};
use super::{InstallError, InstallationFailure, OperationStatus, Phase, PhaseTracker};
use crate::config::InstallerConfig;
use crate::framework::{FrameworkState, FrameworkStatus};
use crate::selinux::SelinuxProbe;

/// Capacity of the channel carrying output lines from the reader tasks.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Errors observed through a [`PipelineHandle`].
#[derive(Debug, Error)]
pub enum HandleError {
    /// The run failed.
    #[error(transparent)]
    Failed(#[from] InstallationFailure),

    /// The worker stopped before the run reported an outcome.
    #[error("install worker stopped before the run reported an outcome")]
    WorkerLost,
}

/// A single installation attempt.
///
/// Build a fresh pipeline for every attempt; [`start`](Self::start)
/// consumes it.
pub struct InstallationPipeline {
    plan: RunPlan,
    worker: InstallWorker,
}

/// Everything a run needs, moved onto the worker.
struct RunPlan {
    operation: OperationSpec,
    verify: PostInstallCheck,
    allow_enforcing: bool,
    diagnostic_tail_lines: usize,
    probe: SelinuxProbe,
    framework: FrameworkStatus,
    install_marker: Option<PathBuf>,
}

impl InstallationPipeline {
    /// Create a pipeline for one run.
    #[must_use]
    pub fn new(
        config: &InstallerConfig,
        probe: SelinuxProbe,
        framework: FrameworkStatus,
        worker: InstallWorker,
    ) -> Self {
        Self {
            plan: RunPlan {
                operation: config.operation.clone(),
                verify: config.verify.clone(),
                allow_enforcing: config.allow_enforcing,
                diagnostic_tail_lines: config.diagnostic_tail_lines,
                probe,
                framework,
                install_marker: None,
            },
            worker,
        }
    }

    /// Record each successful run by writing `path`, so a later process can
    /// detect the installation.
    #[must_use]
    pub fn with_install_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.plan.install_marker = Some(path.into());
        self
    }

    /// Start the run on the install worker.
    ///
    /// Returns immediately; events are delivered to `observer` on the worker
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Closed` if the worker is no longer running.
    pub fn start(self, observer: Arc<dyn InstallObserver>) -> Result<PipelineHandle, WorkerError> {
        let abandoned = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let gate = ObserverGate::new(observer, Arc::clone(&abandoned));
        let plan = self.plan;

        self.worker.submit(async move {
            let outcome = plan.run(&gate).await;
            // The caller may have dropped its handle.
            let _ = outcome_tx.send(outcome);
        })?;

        Ok(PipelineHandle {
            abandoned,
            outcome: outcome_rx,
        })
    }
}

/// Caller-side handle to a started run.
#[derive(Debug)]
pub struct PipelineHandle {
    abandoned: Arc<AtomicBool>,
    outcome: oneshot::Receiver<Result<FrameworkState, InstallationFailure>>,
}

/// Cloneable token that abandons a run's observer.
#[derive(Debug, Clone)]
pub struct AbandonToken(Arc<AtomicBool>);

impl AbandonToken {
    /// Stop delivering callbacks. The run itself continues to completion.
    pub fn abandon(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl PipelineHandle {
    /// Stop delivering callbacks to the observer.
    ///
    /// The privileged operation is not interrupted: it is drained to
    /// completion and the outcome remains available from this handle.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    /// Whether the observer has been abandoned.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// A token that can abandon the run from elsewhere.
    #[must_use]
    pub fn abandon_token(&self) -> AbandonToken {
        AbandonToken(Arc::clone(&self.abandoned))
    }

    /// Wait for the run to finish.
    ///
    /// # Errors
    ///
    /// Returns the run's failure, or `HandleError::WorkerLost` if the worker
    /// went away.
    pub async fn outcome(self) -> Result<FrameworkState, HandleError> {
        match self.outcome.await {
            Ok(outcome) => outcome.map_err(HandleError::from),
            Err(_) => Err(HandleError::WorkerLost),
        }
    }

    /// Block the current thread until the run finishes.
    ///
    /// Must not be called from within an async runtime.
    ///
    /// # Errors
    ///
    /// Same as [`outcome`](Self::outcome).
    pub fn wait(self) -> Result<FrameworkState, HandleError> {
        match self.outcome.blocking_recv() {
            Ok(outcome) => outcome.map_err(HandleError::from),
            Err(_) => Err(HandleError::WorkerLost),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum StreamEvent {
    Line(Stream, String),
    ReadFailed(Stream, std::io::Error),
}

impl RunPlan {
    async fn run(self, gate: &ObserverGate) -> Result<FrameworkState, InstallationFailure> {
        let mut tracker = PhaseTracker::new();
        let result = match self.drive(&mut tracker, gate).await {
            Ok(state) => tracker.finish().map(|()| state).map_err(InstallError::from),
            Err(error) => Err(error),
        };

        match result {
            Ok(state) => {
                info!(
                    installed = state.installed,
                    active = state.active,
                    "installation completed"
                );
                gate.done();
                Ok(state)
            },
            Err(error) => {
                let failure = InstallationFailure {
                    phase: tracker.fail(),
                    error,
                };
                warn!(phase = %failure.phase, kind = ?failure.kind(), "{failure}");
                gate.error(&failure);
                Err(failure)
            },
        }
    }

    async fn drive(
        &self,
        tracker: &mut PhaseTracker,
        gate: &ObserverGate,
    ) -> Result<FrameworkState, InstallError> {
        gate.phase(tracker.enter(Phase::Preparing)?);
        let program = self.operation.validate()?;
        debug!(program = %program.display(), "installer resolved");

        gate.phase(tracker.enter(Phase::Checking)?);
        self.check_environment()?;

        gate.phase(tracker.enter(Phase::Installing)?);
        self.execute(gate).await?;

        gate.phase(tracker.enter(Phase::Finalizing)?);
        if let Some(marker) = &self.install_marker {
            // The operation already succeeded; losing the marker only costs
            // detection on the next start.
            if let Err(e) = write_install_marker(marker) {
                warn!(path = %marker.display(), error = %e, "failed to write install marker");
            }
        }
        let active = self.verify.verify().await;
        Ok(self.framework.record_install(active))
    }

    /// Refuse to start when enforcement would silently block the operation.
    fn check_environment(&self) -> Result<(), InstallError> {
        let selinux = self.probe.snapshot();
        info!(
            enabled = selinux.enabled,
            enforcing = selinux.enforcing,
            context = selinux.process_context.as_deref().unwrap_or("-"),
            "security environment"
        );

        if selinux.enforcing && !self.allow_enforcing {
            return Err(InstallError::EnvironmentUnsupported {
                reason: "SELinux is enforcing and the installer has no policy exceptions for it"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Run the privileged operation, streaming its output, until it exits.
    async fn execute(&self, gate: &ObserverGate) -> Result<(), InstallError> {
        let SpawnedOperation { mut child, pid } = spawner::spawn(&self.operation)?;
        info!(pid, command = %self.operation.command, "privileged operation started");

        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        // Drained even after abandonment; the gate drops the callbacks.
        let mut tail = VecDeque::with_capacity(self.diagnostic_tail_lines);
        let mut read_error = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Line(Stream::Stdout, line) => gate.line(&line),
                StreamEvent::Line(Stream::Stderr, line) => {
                    gate.error_line(&line);
                    if self.diagnostic_tail_lines > 0 {
                        if tail.len() == self.diagnostic_tail_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                },
                StreamEvent::ReadFailed(stream, e) => {
                    warn!(?stream, error = %e, "failed to read privileged operation output");
                    read_error.get_or_insert(e);
                },
            }
        }

        let status = child.wait().await.map_err(|e| {
            InstallError::from_io("failed to wait for the privileged operation", e)
        })?;
        let status = OperationStatus::from(status);
        info!(pid, %status, "privileged operation exited");

        if !status.success() {
            let diagnostic = (!tail.is_empty()).then(|| Vec::from(tail).join("\n"));
            return Err(InstallError::OperationFailed { status, diagnostic });
        }
        if let Some(e) = read_error {
            return Err(InstallError::from_io(
                "failed to read privileged operation output",
                e,
            ));
        }
        Ok(())
    }
}

fn write_install_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"")?;
    debug!(path = %path.display(), "install marker written");
    Ok(())
}

/// Forward lines from one output stream until EOF.
///
/// After a read error the rest of the stream is discarded so the child never
/// blocks on a full pipe.
async fn pump<R>(reader: R, stream: Stream, tx: mpsc::Sender<StreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        match read_line_bounded(&mut reader, MAX_LINE_LENGTH).await {
            Ok(Some(line)) => {
                if tx.send(StreamEvent::Line(stream, line)).await.is_err() {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(StreamEvent::ReadFailed(stream, e)).await;
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            },
        }
    }
}
