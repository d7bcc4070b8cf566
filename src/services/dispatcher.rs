//! Work dispatch.
//!
//! Units of work are plain data ([`Job`]) so they can cross any transport.
//! [`QueueDispatcher`] hands them to an in-process [`WorkerPool`] over a
//! `flume` channel; submitters never wait for execution.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::{panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::errors::PipelineResult;

/// An independent unit of work.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Enumerate active servers and submit one `Scan` for each.
    SweepFleet,
    Scan { server_id: i64 },
    Download { file_id: i64 },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("work queue is closed; no workers are accepting jobs")]
    Closed,
}

/// Fire-and-forget submission of units of work.
#[cfg_attr(test, mockall::automock)]
pub trait Dispatcher: Send + Sync {
    /// Queue `job` and return immediately. Delivery is at-most-once and
    /// unordered with respect to other jobs.
    fn submit(&self, job: Job) -> Result<(), DispatchError>;
}

/// Runs a unit of work. Implemented by the pipeline.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> PipelineResult<()>;
}

/// Dispatcher backed by an in-process MPMC queue.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: flume::Sender<Job>,
}

impl QueueDispatcher {
    /// Create a dispatcher and the receiving end the worker pool drains.
    pub fn channel() -> (Self, flume::Receiver<Job>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl Dispatcher for QueueDispatcher {
    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.tx.send(job).map_err(|_| DispatchError::Closed)?;
        tracing::trace!(?job, "job queued");
        Ok(())
    }
}

/// A fixed set of tokio tasks draining the job queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` tasks that run jobs from `rx` through `handler` until
    /// `shutdown` fires or every sender is gone.
    pub fn spawn<H: JobHandler>(
        rx: flume::Receiver<Job>,
        handler: Arc<H>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        loop {
                            let job = tokio::select! {
                                _ = shutdown.cancelled() => break,
                                job = rx.recv_async() => match job {
                                    Ok(job) => job,
                                    Err(_) => break,
                                },
                            };
                            run_job(handler.as_ref(), job).await;
                        }
                        tracing::debug!("worker stopped");
                    }
                    .instrument(tracing::info_span!("worker", worker)),
                )
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Execute one job, keeping its failure (or panic) local to it.
async fn run_job<H: JobHandler>(handler: &H, job: Job) {
    let outcome = AssertUnwindSafe(handler.handle(job)).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_orphaned() => {
            tracing::error!(?job, orphaned = true, error = %err, "unit of work references missing records");
        }
        Ok(Err(err)) if err.is_config() => {
            tracing::error!(?job, error = %err, "unit of work aborted by configuration error");
        }
        Ok(Err(err)) => {
            tracing::warn!(?job, error = %err, "unit of work failed");
        }
        Err(_) => {
            tracing::error!(?job, "unit of work panicked");
        }
    }
}
