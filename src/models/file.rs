//! Represents a remote file tracked through its processing lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Processing stage of a tracked file.
///
/// Stages advance strictly forward:
/// `Discovered -> Downloaded -> MinioUploaded -> AmqpNotifySent -> Completed`.
/// `Error` can be entered from any in-progress stage and is terminal, as is
/// `Completed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Downloaded,
    MinioUploaded,
    AmqpNotifySent,
    Completed,
    Error,
}

impl FileStatus {
    /// Position along the happy path. `None` for `Error`.
    pub fn stage(self) -> Option<u8> {
        match self {
            FileStatus::Discovered => Some(0),
            FileStatus::Downloaded => Some(1),
            FileStatus::MinioUploaded => Some(2),
            FileStatus::AmqpNotifySent => Some(3),
            FileStatus::Completed => Some(4),
            FileStatus::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Error)
    }

    /// Transition table.
    ///
    /// A non-terminal status may move exactly one stage forward, or to `Error`.
    /// Everything else, including writing the same status again, is rejected.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.stage(), next.stage()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Downloaded => "downloaded",
            FileStatus::MinioUploaded => "minio_uploaded",
            FileStatus::AmqpNotifySent => "amqp_notify_sent",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote file known to the pipeline.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct File {
    pub id: i64,

    /// Back-reference to the owning server's external uuid.
    pub server_uuid: Uuid,

    /// Remote directory the file was listed in.
    pub remote_path: String,

    pub filename: String,

    /// Size reported by the remote stat call; absent when the stat failed.
    pub size_bytes: Option<i64>,

    /// Content hash, filled in by a later stage.
    pub file_hash: Option<String>,

    pub hash_algo: Option<String>,

    pub status: FileStatus,

    /// Human readable failure cause. Present exactly when `status` is `Error`.
    pub error_message: Option<String>,

    /// Object-store key, filled in by the upload stage.
    pub object_key: Option<String>,

    /// Bumped on every status write; used for optimistic concurrency.
    pub version: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl File {
    /// Full remote location (`remote_path/filename`).
    pub fn remote_location(&self) -> String {
        join_remote(&self.remote_path, &self.filename)
    }

    /// `error_message` must be non-empty iff the file is in `Error`.
    pub fn check_invariants(&self) -> bool {
        let has_message = self
            .error_message
            .as_deref()
            .is_some_and(|m| !m.trim().is_empty());
        has_message == (self.status == FileStatus::Error)
    }
}

/// Insert payload produced by the scanner for a newly seen remote entry.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub server_uuid: Uuid,
    pub remote_path: String,
    pub filename: String,
    pub size_bytes: Option<i64>,
}

/// Join a remote directory and an entry name with a single `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
