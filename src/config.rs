use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Which attributes decide that a remote entry is already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupKey {
    /// Filename and size only. Identical names and sizes on different servers
    /// or directories collapse into one record.
    NameAndSize,
    /// Owning server, remote directory and filename.
    Location,
}

impl FromStr for DedupKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name-size" => Ok(DedupKey::NameAndSize),
            "location" => Ok(DedupKey::Location),
            other => bail!("unknown dedup key `{}` (expected `name-size` or `location`)", other),
        }
    }
}

/// Backend the credential provider reads secrets from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// One shared secret in the `SFTP_PASSWORD` environment variable.
    Env,
    /// One file per server, named after the server uuid.
    Dir(PathBuf),
}

impl FromStr for CredentialSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "env" {
            return Ok(CredentialSource::Env);
        }
        match s.strip_prefix("dir:") {
            Some(path) if !path.is_empty() => Ok(CredentialSource::Dir(PathBuf::from(path))),
            _ => bail!("unknown credential source `{}` (expected `env` or `dir:<path>`)", s),
        }
    }
}

/// Transport the dispatcher hands units of work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broker {
    /// In-process queue drained by the local worker pool.
    Memory,
}

impl FromStr for Broker {
    type Err = anyhow::Error;

    fn from_str(url: &str) -> Result<Self> {
        let scheme = url.split("://").next().unwrap_or(url);
        match scheme {
            "memory" => Ok(Broker::Memory),
            other => bail!("unsupported broker scheme `{}` in `{}`", other, url),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub db_pool_size: u32,
    pub staging_dir: PathBuf,
    pub remote_root: String,
    pub scan_interval: Duration,
    pub workers: usize,
    pub broker: Broker,
    pub credential_source: CredentialSource,
    pub remote_timeout: Duration,
    pub transfer_timeout: Duration,
    pub dedup_key: DedupKey,
}

/// What the process should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub migrate_only: bool,
    pub scheduler: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Polls SFTP servers and stages newly discovered files")]
pub struct Args {
    /// Host to bind to (overrides HARVESTER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides HARVESTER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides HARVESTER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum pooled database connections (overrides HARVESTER_DB_POOL_SIZE)
    #[arg(long)]
    pub db_pool_size: Option<u32>,

    /// Local directory downloads are staged in (overrides HARVESTER_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Remote directory listed on every server (overrides HARVESTER_REMOTE_ROOT)
    #[arg(long)]
    pub remote_root: Option<String>,

    /// Seconds between fleet scans (overrides HARVESTER_SCAN_INTERVAL_SECS)
    #[arg(long)]
    pub scan_interval_secs: Option<u64>,

    /// Number of concurrent workers (overrides HARVESTER_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Work-dispatch broker URL (overrides HARVESTER_BROKER_URL)
    #[arg(long)]
    pub broker_url: Option<String>,

    /// `env` or `dir:<path>` (overrides HARVESTER_CREDENTIAL_SOURCE)
    #[arg(long)]
    pub credential_source: Option<String>,

    /// Deadline for connect/list/stat calls in seconds (overrides HARVESTER_REMOTE_TIMEOUT_SECS)
    #[arg(long)]
    pub remote_timeout_secs: Option<u64>,

    /// Deadline for a single file transfer in seconds (overrides HARVESTER_TRANSFER_TIMEOUT_SECS)
    #[arg(long)]
    pub transfer_timeout_secs: Option<u64>,

    /// `name-size` or `location` (overrides HARVESTER_DEDUP_KEY)
    #[arg(long)]
    pub dedup_key: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Do not start the periodic scan scheduler; scans only run on HTTP trigger
    #[arg(long)]
    pub no_scheduler: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key))
    }

    /// Merge parsed arguments over values looked up through `lookup`.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<(Self, RunMode)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |key: &str, default: &str| -> Result<String> {
            match lookup(key) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let env_port = parse_env::<u16>(&lookup, "HARVESTER_PORT", 9000)?;
        let env_pool = parse_env::<u32>(&lookup, "HARVESTER_DB_POOL_SIZE", 5)?;
        let env_interval = parse_env::<u64>(&lookup, "HARVESTER_SCAN_INTERVAL_SECS", 60)?;
        let env_workers = parse_env::<usize>(&lookup, "HARVESTER_WORKERS", 4)?;
        let env_remote_timeout = parse_env::<u64>(&lookup, "HARVESTER_REMOTE_TIMEOUT_SECS", 30)?;
        let env_transfer_timeout =
            parse_env::<u64>(&lookup, "HARVESTER_TRANSFER_TIMEOUT_SECS", 600)?;

        let broker_url = match args.broker_url {
            Some(url) => url,
            None => text("HARVESTER_BROKER_URL", "memory://")?,
        };
        let credential_source = match args.credential_source {
            Some(source) => source,
            None => text("HARVESTER_CREDENTIAL_SOURCE", "env")?,
        };
        let dedup_key = match args.dedup_key {
            Some(key) => key,
            None => text("HARVESTER_DEDUP_KEY", "name-size")?,
        };

        let workers = args.workers.unwrap_or(env_workers);
        if workers == 0 {
            bail!("worker count must be at least 1");
        }
        let scan_interval = args.scan_interval_secs.unwrap_or(env_interval);
        if scan_interval == 0 {
            bail!("scan interval must be at least 1 second");
        }

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => text("HARVESTER_HOST", "0.0.0.0")?,
            },
            port: args.port.unwrap_or(env_port),
            database_url: match args.database_url {
                Some(url) => url,
                None => text("HARVESTER_DATABASE_URL", "sqlite://./data/meta/harvester.db")?,
            },
            db_pool_size: args.db_pool_size.unwrap_or(env_pool).max(1),
            staging_dir: match args.staging_dir {
                Some(dir) => dir,
                None => PathBuf::from(text("HARVESTER_STAGING_DIR", "./data/staging")?),
            },
            remote_root: match args.remote_root {
                Some(root) => root,
                None => text("HARVESTER_REMOTE_ROOT", ".")?,
            },
            scan_interval: Duration::from_secs(scan_interval),
            workers,
            broker: broker_url.parse().context("parsing broker URL")?,
            credential_source: credential_source
                .parse()
                .context("parsing credential source")?,
            remote_timeout: Duration::from_secs(
                args.remote_timeout_secs.unwrap_or(env_remote_timeout),
            ),
            transfer_timeout: Duration::from_secs(
                args.transfer_timeout_secs.unwrap_or(env_transfer_timeout),
            ),
            dedup_key: dedup_key.parse().context("parsing dedup key")?,
        };

        let mode = RunMode {
            migrate_only: args.migrate,
            scheduler: !args.no_scheduler,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    key: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
