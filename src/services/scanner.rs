//! Reconciles one server's remote directory against the state store.
//!
//! All remote I/O (connect, list, stat) happens first; only then are new
//! records written, each committed before its download is submitted. A server
//! refusing to stat one entry degrades that entry to an unknown size; a
//! connection or session failure at any point aborts the scan with nothing
//! written.

use crate::{
    config::DedupKey,
    errors::{PipelineError, PipelineResult},
    models::file::{NewFile, join_remote},
    services::{
        credentials::CredentialProvider,
        dispatcher::{Dispatcher, Job},
        remote::RemoteConnector,
        state_store::StateStore,
        with_deadline,
    },
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Knobs shared by every scan.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Directory listed on each server.
    pub remote_root: String,
    pub dedup_key: DedupKey,
    /// Deadline for each connect/list/stat call.
    pub remote_timeout: Duration,
}

/// Counters describing one scan pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Entries listed, excluding `.` and `..`.
    pub listed: usize,
    /// New records inserted (and downloads submitted).
    pub discovered: usize,
    /// Entries that matched an existing record.
    pub already_known: usize,
    /// Entries whose size could not be read.
    pub size_unknown: usize,
}

pub struct Scanner {
    store: StateStore,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn RemoteConnector>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: ScanSettings,
}

impl Scanner {
    pub fn new(
        store: StateStore,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn RemoteConnector>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            store,
            credentials,
            connector,
            dispatcher,
            settings,
        }
    }

    /// Scan the server with id `server_id`.
    ///
    /// Unknown or inactive servers are skipped without opening a session.
    /// A connection, listing or session failure (including a deadline)
    /// aborts the scan before any record is written; records inserted before
    /// a later store failure are kept.
    #[tracing::instrument(skip(self), fields(server = tracing::field::Empty))]
    pub async fn scan(&self, server_id: i64) -> PipelineResult<ScanReport> {
        let mut report = ScanReport::default();

        let Some(server) = self.store.get_server(server_id).await? else {
            info!("server not found; nothing to scan");
            return Ok(report);
        };
        tracing::Span::current().record("server", server.name.as_str());
        if !server.is_active {
            info!("server is inactive; skipping scan");
            return Ok(report);
        }

        let secret = self.credentials.resolve(&server).await?;
        let timeout = self.settings.remote_timeout;
        let root = self.settings.remote_root.as_str();

        let mut session =
            with_deadline("connect", timeout, self.connector.connect(&server, &secret)).await?;
        let names = with_deadline("list", timeout, session.list_dir(root)).await?;

        let mut entries = Vec::with_capacity(names.len());
        for name in names.into_iter().filter(|n| !is_dir_marker(n)) {
            let path = join_remote(root, &name);
            let size_bytes = match with_deadline("stat", timeout, session.file_size(&path)).await {
                Ok(size) => i64::try_from(size).ok(),
                Err(PipelineError::Remote(err)) if err.is_entry_level() => {
                    warn!(path = %path, error = %err, "could not read size; recording it as unknown");
                    None
                }
                Err(err) => return Err(err),
            };
            if size_bytes.is_none() {
                report.size_unknown += 1;
            }
            entries.push(NewFile {
                server_uuid: server.uuid,
                remote_path: root.to_string(),
                filename: name,
                size_bytes,
            });
        }
        drop(session);
        report.listed = entries.len();

        for entry in &entries {
            match self
                .store
                .insert_file_if_absent(entry, self.settings.dedup_key)
                .await?
            {
                Some(file) => {
                    report.discovered += 1;
                    debug!(file_id = file.id, filename = %file.filename, "discovered new file");
                    if let Err(err) = self.dispatcher.submit(Job::Download { file_id: file.id }) {
                        warn!(file_id = file.id, error = %err, "download not submitted; file stays discovered");
                    }
                }
                None => report.already_known += 1,
            }
        }

        info!(
            listed = report.listed,
            discovered = report.discovered,
            already_known = report.already_known,
            size_unknown = report.size_unknown,
            "scan finished"
        );
        Ok(report)
    }
}

fn is_dir_marker(name: &str) -> bool {
    name == "." || name == ".."
}
