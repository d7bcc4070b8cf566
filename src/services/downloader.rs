//! Fetches one discovered file into local staging storage.
//!
//! Bytes land in a uniquely named `.part-*` file which is renamed over
//! `<staging>/<filename>` only once the transfer is complete and synced, so a
//! failed attempt never leaves a half-written file under the final name. A
//! transfer abandoned at its deadline is cancelled and cleans up its own
//! `.part-*` file.
//! Status writes reload the row first and are version-checked.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        file::{File, FileStatus},
        server::Server,
    },
    services::{
        credentials::{CredentialProvider, Secret},
        remote::RemoteConnector,
        state_store::{StateStore, StoreError},
        with_deadline,
    },
};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at landing a status write when concurrent writers keep bumping
/// the row version.
const STATUS_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Local directory downloads are written to.
    pub staging_dir: PathBuf,
    /// Deadline for connecting.
    pub remote_timeout: Duration,
    /// Deadline for the whole byte transfer.
    pub transfer_timeout: Duration,
}

/// What a download unit ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Bytes staged, status moved to `Downloaded`.
    Downloaded { bytes: u64 },
    /// Attempt failed, status moved to `Error`.
    Failed,
    /// File was no longer `Discovered`; nothing was done.
    Skipped(FileStatus),
}

/// Result of a version-checked status write.
enum Recorded {
    Written,
    /// Another writer moved the file to this status first.
    Superseded(FileStatus),
}

pub struct Downloader {
    store: StateStore,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn RemoteConnector>,
    settings: DownloadSettings,
}

impl Downloader {
    pub fn new(
        store: StateStore,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn RemoteConnector>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            store,
            credentials,
            connector,
            settings,
        }
    }

    /// Local path a file with `filename` is staged at.
    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.settings.staging_dir.join(filename)
    }

    /// Download the file with id `file_id`. One attempt, no retry.
    ///
    /// Missing file or server rows are reported as orphaned work and leave no
    /// trace in the store. Transfer, protocol, timeout and local I/O failures
    /// mark the file `Error` with a readable message. A missing credential is
    /// returned as a configuration error and leaves the file `Discovered`.
    #[tracing::instrument(skip(self))]
    pub async fn download(&self, file_id: i64) -> PipelineResult<DownloadOutcome> {
        let file = self
            .store
            .get_file(file_id)
            .await?
            .ok_or(PipelineError::OrphanedFile(file_id))?;
        if file.status != FileStatus::Discovered {
            debug!(status = %file.status, "file already past discovery; skipping");
            return Ok(DownloadOutcome::Skipped(file.status));
        }
        let server = self
            .store
            .get_server_by_uuid(file.server_uuid)
            .await?
            .ok_or(PipelineError::OrphanedServer {
                file_id,
                server_uuid: file.server_uuid,
            })?;

        match self.fetch(&server, &file).await {
            Ok(bytes) => {
                info!(bytes, filename = %file.filename, "file staged");
                Ok(match self.record(file_id, FileStatus::Downloaded, None).await? {
                    Recorded::Written => DownloadOutcome::Downloaded { bytes },
                    Recorded::Superseded(status) => DownloadOutcome::Skipped(status),
                })
            }
            Err(err) if err.is_config() => Err(err),
            Err(err) => {
                warn!(error = %err, filename = %file.filename, "download failed");
                self.record(file_id, FileStatus::Error, Some(err.to_string()))
                    .await?;
                Ok(DownloadOutcome::Failed)
            }
        }
    }

    async fn fetch(&self, server: &Server, file: &File) -> PipelineResult<u64> {
        ensure_filename_safe(&file.filename)?;
        let secret = self.credentials.resolve(server).await?;

        fs::create_dir_all(&self.settings.staging_dir).await?;
        let target = self.staged_path(&file.filename);
        let part = self
            .settings
            .staging_dir
            .join(format!(".part-{}", Uuid::new_v4()));

        let result = self
            .transfer(server, &secret, &file.remote_location(), &part)
            .await;
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                discard(&part).await;
                return Err(err);
            }
        };

        // Overwrite whatever an earlier attempt left at the final name.
        if let Err(err) = fs::rename(&part, &target).await {
            discard(&part).await;
            return Err(err.into());
        }
        Ok(bytes)
    }

    async fn transfer(
        &self,
        server: &Server,
        secret: &Secret,
        remote: &str,
        part: &Path,
    ) -> PipelineResult<u64> {
        let mut session = with_deadline(
            "connect",
            self.settings.remote_timeout,
            self.connector.connect(server, secret),
        )
        .await?;
        with_deadline(
            "transfer",
            self.settings.transfer_timeout,
            session.fetch_to(remote, part),
        )
        .await
    }

    /// Reload the row and move it to `next`.
    ///
    /// When another writer already moved the file somewhere `next` cannot
    /// follow, the newer state wins and nothing is written.
    async fn record(
        &self,
        file_id: i64,
        next: FileStatus,
        error_message: Option<String>,
    ) -> PipelineResult<Recorded> {
        let mut last_version = 0;
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let current = self
                .store
                .get_file(file_id)
                .await?
                .ok_or(PipelineError::OrphanedFile(file_id))?;
            last_version = current.version;
            if !current.status.can_transition_to(next) {
                warn!(
                    current = %current.status,
                    wanted = %next,
                    "file changed underneath the download; keeping the newer status"
                );
                return Ok(Recorded::Superseded(current.status));
            }
            match self
                .store
                .transition_file(&current, next, error_message.clone())
                .await
            {
                Ok(_) => return Ok(Recorded::Written),
                Err(StoreError::StaleWrite { .. }) => {
                    debug!("status write raced with another writer; reloading");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::StaleWrite {
            id: file_id,
            expected: last_version,
        }
        .into())
    }
}

/// Staging files are keyed by bare filename; anything that could escape the
/// staging directory or collide with our `.part-*` files is refused.
fn ensure_filename_safe(name: &str) -> PipelineResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with(".part-")
        || name.contains('/')
        || name.contains('\\')
        || name.bytes().any(|b| b.is_ascii_control());
    if bad {
        return Err(PipelineError::UnsafeFilename(name.to_string()));
    }
    Ok(())
}

async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("removed partial download {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove partial download {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DedupKey,
        services::{
            credentials::{CredentialError, MockCredentialProvider, Secret},
            remote::testing::{FakeEntry, FakeRemote},
            state_store::testing::{insert_server, memory_store, new_file},
        },
    };

    struct Harness {
        store: StateStore,
        remote: Arc<FakeRemote>,
        staging: tempfile::TempDir,
        downloader: Arc<Downloader>,
    }

    async fn harness_with(remote: Arc<FakeRemote>, credentials: MockCredentialProvider) -> Harness {
        build(remote, credentials, Duration::from_secs(5)).await
    }

    async fn build(
        remote: Arc<FakeRemote>,
        credentials: MockCredentialProvider,
        transfer_timeout: Duration,
    ) -> Harness {
        let store = memory_store().await;
        let staging = tempfile::tempdir().unwrap();
        let downloader = Arc::new(Downloader::new(
            store.clone(),
            Arc::new(credentials),
            Arc::new(Arc::clone(&remote)),
            DownloadSettings {
                staging_dir: staging.path().to_path_buf(),
                remote_timeout: Duration::from_secs(5),
                transfer_timeout,
            },
        ));
        Harness {
            store,
            remote,
            staging,
            downloader,
        }
    }

    fn password() -> MockCredentialProvider {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_resolve()
            .returning(|_| Ok(Secret::new("pw")));
        credentials
    }

    async fn harness(remote: Arc<FakeRemote>) -> Harness {
        harness_with(remote, password()).await
    }

    async fn discovered(h: &Harness, server: &Server, name: &str, size: i64) -> File {
        h.store
            .insert_file_if_absent(&new_file(server, name, Some(size)), DedupKey::NameAndSize)
            .await
            .unwrap()
            .unwrap()
    }

    fn leftover_parts(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".part-"))
            .collect()
    }

    #[tokio::test]
    async fn successful_download_marks_downloaded() {
        let h = harness(FakeRemote::with_entries(vec![(
            "a.txt",
            FakeEntry::File(b"hello world".to_vec()),
        )]))
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 11).await;

        let outcome = h.downloader.download(file.id).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 11 });

        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Downloaded);
        assert!(stored.error_message.is_none());
        assert!(stored.check_invariants());

        let staged = std::fs::read(h.staging.path().join("a.txt")).unwrap();
        assert_eq!(staged, b"hello world");
        assert!(leftover_parts(h.staging.path()).is_empty());
    }

    #[tokio::test]
    async fn redownload_overwrites_existing_staged_copy() {
        let h = harness(FakeRemote::with_entries(vec![(
            "a.txt",
            FakeEntry::File(b"fresh".to_vec()),
        )]))
        .await;
        std::fs::write(h.staging.path().join("a.txt"), b"stale contents").unwrap();
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 5).await;

        h.downloader.download(file.id).await.unwrap();
        let staged = std::fs::read(h.staging.path().join("a.txt")).unwrap();
        assert_eq!(staged, b"fresh");
    }

    #[tokio::test]
    async fn connection_failure_marks_error_with_message() {
        let h = harness(FakeRemote::refusing()).await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 100).await;

        let outcome = h.downloader.download(file.id).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Failed);

        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        let message = stored.error_message.clone().unwrap();
        assert!(message.contains("connection refused"), "{message}");
        assert!(stored.check_invariants());
        assert!(!h.staging.path().join("a.txt").exists());
        assert!(leftover_parts(h.staging.path()).is_empty());
    }

    #[tokio::test]
    async fn broken_transfer_leaves_no_partial_file() {
        let h = harness(FakeRemote::with_entries(vec![(
            "big.bin",
            FakeEntry::BrokenTransfer(4096),
        )]))
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "big.bin", 4096).await;

        assert_eq!(
            h.downloader.download(file.id).await.unwrap(),
            DownloadOutcome::Failed
        );
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        assert!(stored.error_message.unwrap().contains("connection reset"));
        assert!(!h.staging.path().join("big.bin").exists());
        assert!(leftover_parts(h.staging.path()).is_empty());
        assert_eq!(h.remote.connect_count(), 1);
    }

    #[tokio::test]
    async fn hung_transfer_hits_the_deadline_and_marks_error() {
        let h = build(
            FakeRemote::with_entries(vec![("a.txt", FakeEntry::HangingTransfer)]),
            password(),
            Duration::from_millis(100),
        )
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 1).await;

        assert_eq!(
            h.downloader.download(file.id).await.unwrap(),
            DownloadOutcome::Failed
        );
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        let message = stored.error_message.clone().unwrap();
        assert!(message.contains("transfer timed out"), "{message}");
        assert!(stored.check_invariants());
        assert!(leftover_parts(h.staging.path()).is_empty());
    }

    #[tokio::test]
    async fn timed_out_blocking_transfer_leaves_nothing_behind() {
        let h = build(
            FakeRemote::with_entries(vec![(
                "slow.bin",
                FakeEntry::SlowTransfer {
                    delay: Duration::from_millis(300),
                    bytes: b"too late".to_vec(),
                },
            )]),
            password(),
            Duration::from_millis(50),
        )
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "slow.bin", 8).await;

        assert_eq!(
            h.downloader.download(file.id).await.unwrap(),
            DownloadOutcome::Failed
        );

        // Give the abandoned blocking copy time to wake up and finish.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(leftover_parts(h.staging.path()).is_empty());
        assert!(!h.staging.path().join("slow.bin").exists());
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
    }

    #[tokio::test]
    async fn newer_status_written_during_transfer_wins() {
        let h = harness(FakeRemote::with_entries(vec![(
            "a.txt",
            FakeEntry::GatedTransfer(b"late".to_vec()),
        )]))
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 4).await;

        let downloader = Arc::clone(&h.downloader);
        let file_id = file.id;
        let task = tokio::spawn(async move { downloader.download(file_id).await });

        h.remote.transfer_started.notified().await;
        h.store
            .transition_file(&file, FileStatus::Error, Some("withdrawn by operator".into()))
            .await
            .unwrap();
        h.remote.release_transfer.notify_one();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DownloadOutcome::Skipped(FileStatus::Error));
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("withdrawn by operator"));
        assert_eq!(stored.version, file.version + 1);
    }

    #[tokio::test]
    async fn status_write_retries_after_a_concurrent_version_bump() {
        let h = harness(FakeRemote::with_entries(vec![(
            "a.txt",
            FakeEntry::File(b"abc".to_vec()),
        )]))
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 3).await;

        // The first status write finds the row bumped by another writer and
        // lands nothing; later writes go through.
        for stmt in [
            "CREATE TABLE bump_once (id INTEGER)",
            "INSERT INTO bump_once VALUES (1)",
            "CREATE TRIGGER bump_before_write BEFORE UPDATE OF status ON files
             WHEN EXISTS (SELECT 1 FROM bump_once)
             BEGIN
                 DELETE FROM bump_once;
                 UPDATE files SET version = version + 1 WHERE id = OLD.id;
                 SELECT RAISE(IGNORE);
             END",
        ] {
            sqlx::query(stmt).execute(&*h.store.db).await.unwrap();
        }

        let outcome = h.downloader.download(file.id).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 3 });

        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Downloaded);
        assert_eq!(stored.version, file.version + 2);
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bump_once")
            .fetch_one(&*h.store.db)
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn missing_file_is_reported_as_orphaned() {
        let h = harness(FakeRemote::with_entries(vec![])).await;

        let err = h.downloader.download(77).await.unwrap_err();
        assert!(matches!(err, PipelineError::OrphanedFile(77)));
        assert!(err.is_orphaned());
        assert_eq!(h.remote.connect_count(), 0);
    }

    #[tokio::test]
    async fn missing_server_is_reported_without_status_change() {
        let h = harness(FakeRemote::with_entries(vec![])).await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 1).await;
        sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(server.id)
            .execute(&*h.store.db)
            .await
            .unwrap();

        let err = h.downloader.download(file.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::OrphanedServer { .. }));
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Discovered);
        assert_eq!(stored.version, file.version);
    }

    #[tokio::test]
    async fn already_downloaded_file_is_skipped() {
        let h = harness(FakeRemote::with_entries(vec![(
            "a.txt",
            FakeEntry::File(b"x".to_vec()),
        )]))
        .await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 1).await;
        h.store
            .transition_file(&file, FileStatus::Downloaded, None)
            .await
            .unwrap();

        let outcome = h.downloader.download(file.id).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Skipped(FileStatus::Downloaded));
        assert_eq!(h.remote.connect_count(), 0);
    }

    #[tokio::test]
    async fn unsafe_filename_is_refused_and_marked_error() {
        let h = harness(FakeRemote::with_entries(vec![])).await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "../escape.sh", 3).await;

        assert_eq!(
            h.downloader.download(file.id).await.unwrap(),
            DownloadOutcome::Failed
        );
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Error);
        assert!(stored.error_message.unwrap().contains("unsafe filename"));
        assert_eq!(h.remote.connect_count(), 0);
    }

    #[tokio::test]
    async fn missing_credential_leaves_file_discovered() {
        let mut credentials = MockCredentialProvider::new();
        credentials.expect_resolve().returning(|server| {
            Err(CredentialError::Missing {
                server: server.name.clone(),
                source_name: "environment variable SFTP_PASSWORD".into(),
            })
        });
        let h = harness_with(FakeRemote::with_entries(vec![]), credentials).await;
        let server = insert_server(&h.store, "alpha", true).await;
        let file = discovered(&h, &server, "a.txt", 1).await;

        let err = h.downloader.download(file.id).await.unwrap_err();
        assert!(err.is_config());
        let stored = h.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Discovered);
    }

    #[test]
    fn filename_guard() {
        assert!(ensure_filename_safe("report-2024.csv").is_ok());
        assert!(ensure_filename_safe(".hidden").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "bad\nname", ".part-123"] {
            assert!(ensure_filename_safe(bad).is_err(), "{bad:?}");
        }
    }
}
