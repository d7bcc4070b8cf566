//! HTTP handlers and the state they share.

pub mod file_handlers;
pub mod health_handlers;

use crate::services::{dispatcher::Dispatcher, state_store::StateStore};
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Staging directory probed by the readiness check.
    pub staging_dir: PathBuf,
}
