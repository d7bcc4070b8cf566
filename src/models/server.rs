//! Represents a remote file server polled by the scanner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A remote endpoint in the fleet.
///
/// Rows are created and edited outside the pipeline; the scanner and the
/// downloader only ever read them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Server {
    /// Internal identifier used by scan units of work.
    pub id: i64,

    /// Stable external identifier. Files point back to their server by this value.
    pub uuid: Uuid,

    /// Human readable label.
    pub name: String,

    pub host: String,

    /// SSH port, 22 unless the row says otherwise.
    pub port: u16,

    pub username: String,

    /// Opaque reference handed to the credential provider (e.g. an encrypted blob or a key name).
    #[serde(skip_serializing)]
    pub credential_ref: String,

    /// Only active servers are ever scanned.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Server {
    /// `host:port` string suitable for a TCP connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
