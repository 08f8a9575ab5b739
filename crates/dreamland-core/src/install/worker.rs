//! Dedicated install worker.
//!
//! Installation performs privileged, blocking work and must never run on
//! the caller's interaction thread. [`InstallWorker`] owns one OS thread with
//! a single-threaded tokio runtime and executes submitted runs one at a time
//! in submission order. Observer callbacks are delivered on this thread.
//! A job that panics is logged and dropped; later jobs still run.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors from the install worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker thread or its runtime could not be started.
    #[error("failed to start install worker: {0}")]
    Start(#[source] std::io::Error),

    /// The worker has shut down and no longer accepts runs.
    #[error("install worker is no longer running")]
    Closed,
}

/// Handle to the serial install worker.
///
/// Clones submit to the same worker. The worker thread exits once every
/// handle is dropped and the queued runs have finished.
#[derive(Debug, Clone)]
pub struct InstallWorker {
    jobs: mpsc::UnboundedSender<Job>,
}

impl InstallWorker {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Start` if the runtime or thread cannot be
    /// created.
    pub fn spawn() -> Result<Self, WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Start)?;
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("dreamland-install".to_string())
            .spawn(move || {
                debug!("install worker started");
                while let Some(job) = queue.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(job))).is_err() {
                        error!("install job panicked");
                    }
                }
                info!("install worker stopped");
            })
            .map_err(WorkerError::Start)?;

        Ok(Self { jobs })
    }

    /// Queue a job for execution on the worker.
    pub(crate) fn submit<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.jobs
            .send(Box::pin(job))
            .map_err(|_| WorkerError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn test_jobs_run_off_caller_thread_in_order() {
        let worker = InstallWorker::spawn().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caller = std::thread::current().id();

        let mut receivers = Vec::new();
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            let (tx, rx) = oneshot::channel();
            worker
                .submit(async move {
                    tokio::task::yield_now().await;
                    seen.lock().unwrap().push(i);
                    let _ = tx.send(std::thread::current().id());
                })
                .unwrap();
            receivers.push(rx);
        }

        for rx in receivers {
            assert_ne!(rx.blocking_recv().unwrap(), caller);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_worker_thread_is_named() {
        let worker = InstallWorker::spawn().unwrap();
        let (tx, rx) = oneshot::channel();
        worker
            .submit(async move {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            })
            .unwrap();
        assert_eq!(rx.blocking_recv().unwrap().as_deref(), Some("dreamland-install"));
    }

    fn broken_bookkeeping() {
        panic!("installer bookkeeping bug");
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let worker = InstallWorker::spawn().unwrap();
        worker
            .submit(async {
                broken_bookkeeping();
            })
            .unwrap();

        let (tx, rx) = oneshot::channel();
        worker
            .submit(async move {
                let _ = tx.send("next run");
            })
            .unwrap();
        assert_eq!(rx.blocking_recv().unwrap(), "next run");
    }
}
