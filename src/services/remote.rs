//! Remote directory access.
//!
//! [`RemoteConnector`] opens a [`RemoteSession`] against one server; the
//! session lists a directory, stats entries and streams a file to a local
//! path. [`SftpConnector`] is the production implementation over libssh2,
//! whose blocking calls run on tokio's blocking pool.

use crate::{models::server::Server, services::credentials::Secret};
use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::{
    fs,
    io::{self, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("authentication as `{user}` rejected by {addr}")]
    Auth { addr: String, user: String },
    /// The server answered with a status about this one entry (missing,
    /// permission denied, ...). The session itself is still usable.
    #[error("{operation} `{path}` refused: {message}")]
    Entry {
        operation: &'static str,
        path: String,
        message: String,
    },
    /// Transport or session level failure.
    #[error("{operation} `{path}` failed: {message}")]
    Protocol {
        operation: &'static str,
        path: String,
        message: String,
    },
    #[error("writing {}: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transfer into {0} was cancelled")]
    Cancelled(String),
    #[error("remote I/O task aborted: {0}")]
    Task(String),
}

impl RemoteError {
    /// Failure confined to a single entry; other entries can still be read
    /// over the same session.
    pub fn is_entry_level(&self) -> bool {
        matches!(self, RemoteError::Entry { .. })
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// An open session against one server.
#[async_trait]
pub trait RemoteSession: Send {
    /// Names (not paths) of the non-directory entries in `dir`.
    async fn list_dir(&mut self, dir: &str) -> RemoteResult<Vec<String>>;

    /// Size in bytes of the entry at `path`.
    async fn file_size(&mut self, path: &str) -> RemoteResult<u64>;

    /// Copy the remote file at `path` into `local`, truncating it first.
    /// Returns the number of bytes written.
    ///
    /// On failure, or when the returned future is dropped before it
    /// completes, `local` is removed by the implementation once it stops
    /// writing.
    async fn fetch_to(&mut self, path: &str, local: &Path) -> RemoteResult<u64>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, server: &Server, secret: &Secret)
    -> RemoteResult<Box<dyn RemoteSession>>;
}

/// Opens SFTP sessions with password authentication.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    /// Applied to the TCP connect and to every libssh2 call on the session.
    pub timeout: Duration,
}

impl SftpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RemoteConnector for SftpConnector {
    async fn connect(
        &self,
        server: &Server,
        secret: &Secret,
    ) -> RemoteResult<Box<dyn RemoteSession>> {
        let addr = server.addr();
        let host = server.host.clone();
        let port = server.port;
        let user = server.username.clone();
        let password = secret.clone();
        let timeout = self.timeout;

        let inner = blocking(move || {
            let tcp = connect_tcp(&host, port, timeout).map_err(|source| RemoteError::Connect {
                addr: addr.clone(),
                source,
            })?;

            let mut session = Session::new().map_err(|e| protocol("session", &addr, e))?;
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| protocol("handshake", &addr, e))?;
            session
                .userauth_password(&user, password.expose())
                .map_err(|_| RemoteError::Auth {
                    addr: addr.clone(),
                    user: user.clone(),
                })?;
            if !session.authenticated() {
                return Err(RemoteError::Auth { addr, user });
            }
            let sftp = session.sftp().map_err(|e| protocol("sftp", &addr, e))?;

            Ok(SftpInner {
                _session: session,
                sftp,
            })
        })
        .await?;

        tracing::debug!(server = %server.name, addr = %server.addr(), "sftp session opened");
        Ok(Box::new(SftpSession {
            inner: Arc::new(Mutex::new(inner)),
        }))
    }
}

struct SftpInner {
    // Keeps the transport alive for as long as the SFTP channel is in use.
    _session: Session,
    sftp: Sftp,
}

/// One authenticated SFTP channel. Calls are serialized through the mutex and
/// executed on the blocking pool.
pub struct SftpSession {
    inner: Arc<Mutex<SftpInner>>,
}

impl SftpSession {
    async fn with_sftp<T, F>(&self, f: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> RemoteResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| RemoteError::Task("sftp session lock poisoned".into()))?;
            f(&guard.sftp)
        })
        .await
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn list_dir(&mut self, dir: &str) -> RemoteResult<Vec<String>> {
        let dir = dir.to_string();
        self.with_sftp(move |sftp| {
            let entries = sftp
                .readdir(Path::new(&dir))
                .map_err(|e| sftp_error("readdir", &dir, e))?;
            Ok(listable_names(&dir, entries))
        })
        .await
    }

    async fn file_size(&mut self, path: &str) -> RemoteResult<u64> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let stat = sftp
                .stat(Path::new(&path))
                .map_err(|e| sftp_error("stat", &path, e))?;
            stat.size.ok_or_else(|| RemoteError::Entry {
                operation: "stat",
                path,
                message: "server did not report a size".into(),
            })
        })
        .await
    }

    async fn fetch_to(&mut self, path: &str, local: &Path) -> RemoteResult<u64> {
        let path = path.to_string();
        let local = local.to_path_buf();
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancelled));

        self.with_sftp(move |sftp| {
            stage_to(&local, &cancelled, |out| {
                let mut remote = sftp
                    .open(Path::new(&path))
                    .map_err(|e| sftp_error("open", &path, e))?;
                // Read errors come from the channel, write errors from the local disk.
                copy_split(&mut remote, out, &cancelled).map_err(|e| match e {
                    CopyError::Read(source) => protocol("read", &path, source),
                    CopyError::Write(source) => RemoteError::LocalIo {
                        path: local.clone(),
                        source,
                    },
                    CopyError::Cancelled => RemoteError::Cancelled(local.display().to_string()),
                })
            })
        })
        .await
    }
}

/// Names of the listed entries worth tracking. Directories are skipped, and
/// so are names that are not valid UTF-8, since they could not be addressed
/// again through a `String` path.
fn listable_names(dir: &str, entries: Vec<(PathBuf, FileStat)>) -> Vec<String> {
    entries
        .into_iter()
        .filter_map(|(path, stat)| {
            if stat.is_dir() {
                return None;
            }
            let name = path.file_name()?;
            match name.to_str() {
                Some(name) => Some(name.to_string()),
                None => {
                    tracing::warn!(
                        dir,
                        name = %name.to_string_lossy(),
                        "skipping entry whose name is not valid UTF-8"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Sets the shared flag when dropped. Held by the async side of a blocking
/// transfer so the blocking side sees when its caller went away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Create `local`, let `fill` write it, then flush and sync.
///
/// `local` is removed again if anything fails or if `cancelled` is set by the
/// time the write finishes. Nothing is created when `cancelled` is already set.
fn stage_to<F>(local: &Path, cancelled: &AtomicBool, fill: F) -> RemoteResult<u64>
where
    F: FnOnce(&mut fs::File) -> RemoteResult<u64>,
{
    let is_cancelled = || cancelled.load(Ordering::SeqCst);
    if is_cancelled() {
        return Err(RemoteError::Cancelled(local.display().to_string()));
    }
    let local_err = |source: io::Error| RemoteError::LocalIo {
        path: local.to_path_buf(),
        source,
    };

    let result = fs::File::create(local)
        .map_err(local_err)
        .and_then(|mut out| {
            let copied = fill(&mut out)?;
            out.flush().map_err(local_err)?;
            out.sync_all().map_err(local_err)?;
            Ok(copied)
        })
        .and_then(|copied| {
            if is_cancelled() {
                Err(RemoteError::Cancelled(local.display().to_string()))
            } else {
                Ok(copied)
            }
        });

    if result.is_err() {
        match fs::remove_file(local) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("could not remove {}: {}", local.display(), err),
        }
    }
    result
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
    Cancelled,
}

fn copy_split(
    reader: &mut impl io::Read,
    writer: &mut impl Write,
    cancelled: &AtomicBool,
) -> Result<u64, CopyError> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(CopyError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host))
    }))
}

fn protocol(operation: &'static str, path: &str, err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Protocol {
        operation,
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// SFTP status codes describe the entry; libssh2 session codes describe the
/// connection.
fn sftp_error(operation: &'static str, path: &str, err: ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(_) => RemoteError::Entry {
            operation,
            path: path.to_string(),
            message: err.message().to_string(),
        },
        ErrorCode::Session(_) => protocol(operation, path, err),
    }
}

async fn blocking<T, F>(f: F) -> RemoteResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RemoteResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RemoteError::Task(e.to_string()))?
}

#[cfg(test)]
pub mod testing {
    //! In-memory remote used by the pipeline tests.

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Clone, Debug)]
    pub enum FakeEntry {
        /// Regular file with the given contents.
        File(Vec<u8>),
        /// Listed, but the server refuses to stat it.
        Unstattable,
        /// Stat fails because the connection went away.
        DropsConnection,
        /// Stat works, but the transfer breaks with a connection error.
        BrokenTransfer(u64),
        /// Stat works, the transfer never finishes.
        HangingTransfer,
        /// Transfer runs on the blocking pool and only starts writing after
        /// `delay`.
        SlowTransfer { delay: Duration, bytes: Vec<u8> },
        /// Transfer signals `transfer_started`, then waits for
        /// `release_transfer` before writing.
        GatedTransfer(Vec<u8>),
    }

    /// One fake server directory. Counts the sessions opened against it.
    #[derive(Default)]
    pub struct FakeRemote {
        pub entries: Mutex<Vec<(String, FakeEntry)>>,
        pub refuse_connections: bool,
        pub fail_listing: bool,
        pub hang_listing: bool,
        pub connects: AtomicUsize,
        pub transfer_started: Notify,
        pub release_transfer: Notify,
    }

    impl FakeRemote {
        pub fn with_entries(entries: Vec<(&str, FakeEntry)>) -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(
                    entries
                        .into_iter()
                        .map(|(name, entry)| (name.to_string(), entry))
                        .collect(),
                ),
                ..Self::default()
            })
        }

        pub fn refusing() -> Arc<Self> {
            Arc::new(Self {
                refuse_connections: true,
                ..Self::default()
            })
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn entry(&self, path: &str) -> Option<FakeEntry> {
            let name = path.rsplit('/').next().unwrap_or(path);
            self.entries
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, e)| e.clone())
        }
    }

    #[async_trait]
    impl RemoteConnector for Arc<FakeRemote> {
        async fn connect(
            &self,
            server: &Server,
            _secret: &Secret,
        ) -> RemoteResult<Box<dyn RemoteSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connections {
                return Err(RemoteError::Connect {
                    addr: server.addr(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
                });
            }
            Ok(Box::new(FakeSession {
                remote: Arc::clone(self),
            }))
        }
    }

    struct FakeSession {
        remote: Arc<FakeRemote>,
    }

    fn write_local(local: &Path, bytes: &[u8]) -> RemoteResult<u64> {
        fs::write(local, bytes).map_err(|source| RemoteError::LocalIo {
            path: local.to_path_buf(),
            source,
        })?;
        Ok(bytes.len() as u64)
    }

    fn missing(operation: &'static str, path: &str) -> RemoteError {
        RemoteError::Entry {
            operation,
            path: path.to_string(),
            message: "no such file".into(),
        }
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn list_dir(&mut self, dir: &str) -> RemoteResult<Vec<String>> {
            if self.remote.hang_listing {
                std::future::pending::<()>().await;
            }
            if self.remote.fail_listing {
                return Err(protocol("readdir", dir, "channel closed"));
            }
            Ok(self
                .remote
                .entries
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect())
        }

        async fn file_size(&mut self, path: &str) -> RemoteResult<u64> {
            match self.remote.entry(path) {
                Some(FakeEntry::File(bytes))
                | Some(FakeEntry::SlowTransfer { bytes, .. })
                | Some(FakeEntry::GatedTransfer(bytes)) => Ok(bytes.len() as u64),
                Some(FakeEntry::BrokenTransfer(size)) => Ok(size),
                Some(FakeEntry::HangingTransfer) => Ok(1),
                Some(FakeEntry::DropsConnection) => Err(RemoteError::Connect {
                    addr: "fake".into(),
                    source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
                }),
                Some(FakeEntry::Unstattable) | None => Err(missing("stat", path)),
            }
        }

        async fn fetch_to(&mut self, path: &str, local: &Path) -> RemoteResult<u64> {
            match self.remote.entry(path) {
                Some(FakeEntry::File(bytes)) => write_local(local, &bytes),
                Some(FakeEntry::BrokenTransfer(_)) => {
                    // Leave a partial file behind, like a transfer cut mid-stream.
                    let _ = fs::write(local, b"partial");
                    Err(protocol("read", path, "connection reset by peer"))
                }
                Some(FakeEntry::HangingTransfer) => std::future::pending().await,
                Some(FakeEntry::SlowTransfer { delay, bytes }) => {
                    let cancelled = Arc::new(AtomicBool::new(false));
                    let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancelled));
                    let local = local.to_path_buf();
                    blocking(move || {
                        std::thread::sleep(delay);
                        stage_to(&local, &cancelled, |out| {
                            out.write_all(&bytes).map_err(|source| RemoteError::LocalIo {
                                path: local.clone(),
                                source,
                            })?;
                            Ok(bytes.len() as u64)
                        })
                    })
                    .await
                }
                Some(FakeEntry::GatedTransfer(bytes)) => {
                    self.remote.transfer_started.notify_one();
                    self.remote.release_transfer.notified().await;
                    write_local(local, &bytes)
                }
                _ => Err(missing("open", path)),
            }
        }
    }
}
