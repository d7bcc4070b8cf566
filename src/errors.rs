use crate::services::{
    credentials::CredentialError, dispatcher::DispatchError, remote::RemoteError,
    state_store::StoreError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io, time::Duration};
use thiserror::Error;
use uuid::Uuid;

/// Failure of a single scan or download unit of work.
///
/// These never travel back to whoever submitted the unit; the worker that ran
/// it logs them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("local staging I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("file {0} referenced by a download unit does not exist")]
    OrphanedFile(i64),
    #[error("server {server_uuid} owning file {file_id} does not exist")]
    OrphanedServer { file_id: i64, server_uuid: Uuid },
    #[error("refusing to stage unsafe filename `{0}`")]
    UnsafeFilename(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl PipelineError {
    /// Configuration faults are fatal to the unit and are not the file's fault.
    pub fn is_config(&self) -> bool {
        matches!(self, PipelineError::Credential(_))
    }

    /// Work item points at rows that are gone.
    pub fn is_orphaned(&self) -> bool {
        matches!(
            self,
            PipelineError::OrphanedFile(_) | PipelineError::OrphanedServer { .. }
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A lightweight wrapper for HTTP-facing errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "state store request failed");
        AppError::internal(err.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}
