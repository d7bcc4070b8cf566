//! src/services/state_store.rs
//!
//! Durable record of servers and tracked files, backed by SQLite.
//! Every operation borrows a pooled connection for a single statement and
//! gives it back; nothing here holds a connection across remote I/O.

use crate::{
    config::DedupKey,
    models::{
        file::{File, FileStatus, NewFile},
        server::Server,
    },
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const FILE_COLUMNS: &str = "id, server_uuid, remote_path, filename, size_bytes, file_hash, \
     hash_algo, status, error_message, object_key, version, created_at, updated_at";

const SERVER_COLUMNS: &str =
    "id, uuid, name, host, port, username, credential_ref, is_active, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file {id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        id: i64,
        from: FileStatus,
        to: FileStatus,
    },
    #[error("file {id}: error message must be set exactly when status is error")]
    ErrorMessageMismatch { id: i64 },
    #[error("file {id} changed concurrently (expected version {expected})")]
    StaleWrite { id: i64, expected: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// StateStore exposes the handful of reads and writes the pipeline needs:
/// - server lookups (by id, by uuid, all active)
/// - file lookups and dedup-aware inserts
/// - validated, version-checked status transitions
#[derive(Clone)]
pub struct StateStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl StateStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get_server(&self, id: i64) -> StoreResult<Option<Server>> {
        let sql = format!("SELECT {} FROM servers WHERE id = ?", SERVER_COLUMNS);
        let server = sqlx::query_as::<_, Server>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(server)
    }

    pub async fn get_server_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Server>> {
        let sql = format!("SELECT {} FROM servers WHERE uuid = ?", SERVER_COLUMNS);
        let server = sqlx::query_as::<_, Server>(&sql)
            .bind(uuid)
            .fetch_optional(&*self.db)
            .await?;
        Ok(server)
    }

    /// All servers with the active flag set, in id order.
    pub async fn list_active_servers(&self) -> StoreResult<Vec<Server>> {
        let sql = format!(
            "SELECT {} FROM servers WHERE is_active = 1 ORDER BY id",
            SERVER_COLUMNS
        );
        let servers = sqlx::query_as::<_, Server>(&sql)
            .fetch_all(&*self.db)
            .await?;
        Ok(servers)
    }

    pub async fn get_file(&self, id: i64) -> StoreResult<Option<File>> {
        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        let file = sqlx::query_as::<_, File>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(file)
    }

    /// Insert `new_file` in `Discovered` unless a matching record already exists.
    ///
    /// The existence check and the insert are one statement, so two scans
    /// racing over the same listing cannot both insert. Returns `None` when a
    /// match was found and nothing was written.
    pub async fn insert_file_if_absent(
        &self,
        new_file: &NewFile,
        key: DedupKey,
    ) -> StoreResult<Option<File>> {
        let now = Utc::now();
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO files (server_uuid, remote_path, filename, size_bytes, status, \
             version, created_at, updated_at) SELECT ",
        );
        {
            let mut values = builder.separated(", ");
            values.push_bind(new_file.server_uuid);
            values.push_bind(&new_file.remote_path);
            values.push_bind(&new_file.filename);
            values.push_bind(new_file.size_bytes);
            values.push_bind(FileStatus::Discovered);
            values.push_bind(0_i64);
            values.push_bind(now);
            values.push_bind(now);
        }
        builder.push(" WHERE NOT EXISTS (SELECT 1 FROM files WHERE ");
        push_dedup_predicate(&mut builder, new_file, key);
        builder.push(") RETURNING ");
        builder.push(FILE_COLUMNS);

        let inserted = builder
            .build_query_as::<File>()
            .fetch_optional(&*self.db)
            .await?;
        Ok(inserted)
    }

    /// Move `current` to `next`, recording `error_message` alongside.
    ///
    /// Rejects transitions the status table forbids and writes that would
    /// break the error-message invariant. The write only lands if the row's
    /// version still matches `current.version`; otherwise `StaleWrite` is
    /// returned and the caller should reload.
    pub async fn transition_file(
        &self,
        current: &File,
        next: FileStatus,
        error_message: Option<String>,
    ) -> StoreResult<File> {
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: current.id,
                from: current.status,
                to: next,
            });
        }
        let has_message = error_message
            .as_deref()
            .is_some_and(|m| !m.trim().is_empty());
        if has_message != (next == FileStatus::Error) {
            return Err(StoreError::ErrorMessageMismatch { id: current.id });
        }

        let sql = format!(
            "UPDATE files SET status = ?, error_message = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?
             RETURNING {}",
            FILE_COLUMNS
        );
        let updated = sqlx::query_as::<_, File>(&sql)
            .bind(next)
            .bind(error_message)
            .bind(Utc::now())
            .bind(current.id)
            .bind(current.version)
            .fetch_optional(&*self.db)
            .await?;

        let updated = updated.ok_or(StoreError::StaleWrite {
            id: current.id,
            expected: current.version,
        })?;
        debug_assert!(updated.check_invariants());
        Ok(updated)
    }
}

/// Append the WHERE clause identifying "the same file" under `key`.
///
/// Size comparison is null-safe (`IS`) so entries whose stat failed still
/// dedup against each other by name.
fn push_dedup_predicate<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    probe: &'a NewFile,
    key: DedupKey,
) {
    match key {
        DedupKey::NameAndSize => {
            builder.push("filename = ");
            builder.push_bind(&probe.filename);
            builder.push(" AND size_bytes IS ");
            builder.push_bind(probe.size_bytes);
        }
        DedupKey::Location => {
            builder.push("server_uuid = ");
            builder.push_bind(probe.server_uuid);
            builder.push(" AND remote_path = ");
            builder.push_bind(&probe.remote_path);
            builder.push(" AND filename = ");
            builder.push_bind(&probe.filename);
        }
    }
}
