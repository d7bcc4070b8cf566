//! Credential resolution for remote servers.
//!
//! The pipeline only sees [`CredentialProvider`]; which backend answers is a
//! configuration choice.

use crate::{config::CredentialSource, models::server::Server};
use async_trait::async_trait;
use std::{env, fmt, io, path::PathBuf, sync::Arc};
use thiserror::Error;

/// Default environment variable holding the shared SFTP password.
pub const PASSWORD_ENV: &str = "SFTP_PASSWORD";

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential for server `{server}`: {source_name} is not set")]
    Missing { server: String, source_name: String },
    #[error("reading credential for server `{server}` from {path}: {source}")]
    Unreadable {
        server: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return the secret used to authenticate against `server`.
    async fn resolve(&self, server: &Server) -> Result<Secret, CredentialError>;
}

/// Reads one shared secret from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new(PASSWORD_ENV)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn resolve(&self, server: &Server) -> Result<Secret, CredentialError> {
        match env::var(&self.var) {
            Ok(value) if !value.is_empty() => Ok(Secret::new(value)),
            _ => Err(CredentialError::Missing {
                server: server.name.clone(),
                source_name: format!("environment variable {}", self.var),
            }),
        }
    }
}

/// Reads a per-server secret from `<dir>/<server uuid>`, the layout secret
/// managers use when mounting secrets as files.
#[derive(Debug, Clone)]
pub struct DirCredentialProvider {
    dir: PathBuf,
}

impl DirCredentialProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CredentialProvider for DirCredentialProvider {
    async fn resolve(&self, server: &Server) -> Result<Secret, CredentialError> {
        let path = self.dir.join(server.uuid.to_string());
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = contents.trim_end_matches(['\r', '\n']);
                if value.is_empty() {
                    Err(CredentialError::Missing {
                        server: server.name.clone(),
                        source_name: format!("secret file {}", path.display()),
                    })
                } else {
                    Ok(Secret::new(value))
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CredentialError::Missing {
                server: server.name.clone(),
                source_name: format!("secret file {}", path.display()),
            }),
            Err(source) => Err(CredentialError::Unreadable {
                server: server.name.clone(),
                path,
                source,
            }),
        }
    }
}

/// Build the provider selected by configuration.
pub fn from_source(source: &CredentialSource) -> Arc<dyn CredentialProvider> {
    match source {
        CredentialSource::Env => Arc::new(EnvCredentialProvider::default()),
        CredentialSource::Dir(dir) => Arc::new(DirCredentialProvider::new(dir.clone())),
    }
}
