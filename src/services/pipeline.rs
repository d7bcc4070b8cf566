//! Routes dispatched jobs to the scanner, the downloader and the fleet sweep.

use crate::{
    errors::PipelineResult,
    services::{
        dispatcher::{Dispatcher, Job, JobHandler},
        downloader::{DownloadOutcome, Downloader},
        scanner::Scanner,
        state_store::StateStore,
    },
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Pipeline {
    store: StateStore,
    scanner: Scanner,
    downloader: Downloader,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Pipeline {
    pub fn new(
        store: StateStore,
        scanner: Scanner,
        downloader: Downloader,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            scanner,
            downloader,
            dispatcher,
        }
    }

    /// Submit one scan per active server. Returns how many were submitted.
    pub async fn sweep_fleet(&self) -> PipelineResult<usize> {
        let servers = self.store.list_active_servers().await?;
        let mut submitted = 0;
        for server in &servers {
            match self.dispatcher.submit(Job::Scan {
                server_id: server.id,
            }) {
                Ok(()) => submitted += 1,
                Err(err) => {
                    warn!(server = %server.name, error = %err, "scan not submitted");
                    return Err(err.into());
                }
            }
        }
        info!(servers = submitted, "fleet scan submitted");
        Ok(submitted)
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: Job) -> PipelineResult<()> {
        match job {
            Job::SweepFleet => {
                self.sweep_fleet().await?;
            }
            Job::Scan { server_id } => {
                self.scanner.scan(server_id).await?;
            }
            Job::Download { file_id } => match self.downloader.download(file_id).await? {
                DownloadOutcome::Downloaded { bytes } => {
                    debug!(file_id, bytes, "download unit finished");
                }
                DownloadOutcome::Failed => {
                    debug!(file_id, "download unit recorded a failure");
                }
                DownloadOutcome::Skipped(status) => {
                    debug!(file_id, %status, "download unit had nothing to do");
                }
            },
        }
        Ok(())
    }
}
