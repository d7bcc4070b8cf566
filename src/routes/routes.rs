//! Defines the HTTP surface of the harvester.
//!
//! ## Structure
//! - **Triggers**
//!   - `POST /files/scan`: queue a scan of every active server
//!   - `POST /servers/{id}/scan`: queue a scan of one server
//!
//! - **Inspection**
//!   - `GET /files/{id}`: tracked file record
//!   - `GET /healthz`, `/readyz`: liveness and readiness

use crate::handlers::{
    AppState,
    file_handlers::{get_file, trigger_scan, trigger_server_scan},
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Every handler receives the shared [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files/scan", post(trigger_scan))
        .route("/files/{id}", get(get_file))
        .route("/servers/{id}/scan", post(trigger_server_scan))
}
