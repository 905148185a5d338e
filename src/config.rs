use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "TEMP_FILE_HOST_";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_REQUEST_BYTES: usize = 101 * 1024 * 1024;

/// Centralized server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub staging_dir: String,
    pub database_url: String,
    /// Base URL clients fetch media from, e.g. `http://localhost:3000`.
    pub public_url: String,
    /// Folder prefix for provider identifiers.
    pub folder: String,
    pub max_request_bytes: usize,
    pub sweep_interval: Duration,
    pub orphan_grace: Duration,
    pub session_ttl: Duration,
}

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(author, version, about = "Temporary file host: server and upload client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Upload files one at a time, chunking large ones
    Upload {
        #[command(flatten)]
        client: ClientArgs,
        /// Files to upload, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List uploaded files, newest first
    List {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Delete an uploaded file from storage and metadata
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        /// Provider identifier as shown by `list`
        public_id: String,
    },
    /// Download an uploaded file to a local path
    Download {
        #[command(flatten)]
        client: ClientArgs,
        /// Provider identifier as shown by `list`
        public_id: String,
        /// Destination path; defaults to the original file name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Server flags; each overrides the matching `TEMP_FILE_HOST_*` variable.
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Host to bind to (overrides TEMP_FILE_HOST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TEMP_FILE_HOST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides TEMP_FILE_HOST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for chunks in flight (overrides TEMP_FILE_HOST_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides TEMP_FILE_HOST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for media links (overrides TEMP_FILE_HOST_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Identifier folder prefix (overrides TEMP_FILE_HOST_FOLDER)
    #[arg(long)]
    pub folder: Option<String>,

    /// Largest accepted upload request body (overrides TEMP_FILE_HOST_MAX_REQUEST_BYTES)
    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ClientArgs {
    /// Server base URL (overrides TEMP_FILE_HOST_SERVER)
    #[arg(long)]
    pub server: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args(args: ServeArgs) -> Result<(Self, bool)> {
        Self::resolve(args, |key| env::var(key))
    }

    /// Merge `args` over values produced by `lookup`, which receives full
    /// variable names such as `TEMP_FILE_HOST_PORT`.
    pub fn resolve<F>(args: ServeArgs, lookup: F) -> Result<(Self, bool)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        // --- Environment fallback ---
        let env_host = var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_var(&var, "PORT", DEFAULT_PORT)?;
        let env_storage = var("STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_staging = var("STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db =
            var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/meta/files.db".into());
        let env_public_url = var("PUBLIC_URL").ok();
        let env_folder = var("FOLDER").unwrap_or_else(|_| "temp-file-host".into());
        let env_max_request = parse_var(&var, "MAX_REQUEST_BYTES", DEFAULT_MAX_REQUEST_BYTES)?;
        let sweep_secs: u64 = parse_var(&var, "SWEEP_INTERVAL_SECS", 300)?;
        let grace_secs: u64 = parse_var(&var, "ORPHAN_GRACE_SECS", 3600)?;
        let ttl_secs: u64 = parse_var(&var, "SESSION_TTL_SECS", 3600)?;

        // --- Merge ---
        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let public_url = args
            .public_url
            .or(env_public_url)
            .unwrap_or_else(|| default_public_url(&host, port));

        let cfg = Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: public_url.trim_end_matches('/').to_string(),
            folder: args.folder.unwrap_or(env_folder),
            max_request_bytes: args.max_request_bytes.unwrap_or(env_max_request),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            orphan_grace: Duration::from_secs(grace_secs),
            session_ttl: Duration::from_secs(ttl_secs),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client-side configuration: where the server lives.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
}

impl ClientConfig {
    pub fn from_env_and_args(args: ClientArgs) -> Self {
        let server = args
            .server
            .or_else(|| env::var(format!("{}SERVER", ENV_PREFIX)).ok())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", DEFAULT_PORT));
        Self {
            server: server.trim_end_matches('/').to_string(),
        }
    }
}

fn default_public_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    format!("http://{}:{}", host, port)
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}{}", ENV_PREFIX, name)),
    }
}
