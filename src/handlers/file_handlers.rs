//! Scan triggers and file status lookup.
//!
//! Triggers only queue work; they never wait for or report scan outcomes.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::file::File,
    services::dispatcher::Job,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ScanStarted {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
}

/// `POST /files/scan`: queue a scan of every active server.
pub async fn trigger_scan(State(state): State<AppState>) -> Result<Json<ScanStarted>, AppError> {
    state.dispatcher.submit(Job::SweepFleet)?;
    tracing::info!("fleet scan requested");
    Ok(Json(ScanStarted {
        status: "scan_started",
        server_id: None,
    }))
}

/// `POST /servers/{id}/scan`: queue a scan of one server.
///
/// Inactive or unknown servers are filtered by the scanner itself, so this
/// answers `scan_started` for them too.
pub async fn trigger_server_scan(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
) -> Result<Json<ScanStarted>, AppError> {
    state.dispatcher.submit(Job::Scan { server_id })?;
    tracing::info!(server_id, "server scan requested");
    Ok(Json(ScanStarted {
        status: "scan_started",
        server_id: Some(server_id),
    }))
}

/// `GET /files/{id}`: current record for one tracked file.
pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Json<File>, AppError> {
    state
        .store
        .get_file(file_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("file {} not found", file_id)))
}
