pub mod credentials;
pub mod dispatcher;
pub mod downloader;
pub mod pipeline;
pub mod remote;
pub mod scanner;
pub mod scheduler;
pub mod state_store;

use crate::errors::{PipelineError, PipelineResult};
use std::{future::Future, time::Duration};

/// Await a remote call, giving up after `after`.
pub(crate) async fn with_deadline<T, E, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> PipelineResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PipelineError::Timeout { operation, after }),
    }
}
