use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_dir: String,
    pub temp_dir: String,
    pub container: String,
    pub pg_dump: String,
    pub pg_restore: String,
    pub report_tables: String,
    pub analysis_tables: String,
    pub cascade_concurrency: usize,
    pub operation_timeout: Option<Duration>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Cold archive service for linked reports and analyses")]
pub struct Args {
    /// Host to bind to (overrides COLD_ARCHIVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides COLD_ARCHIVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// PostgreSQL URL of the catalog database (overrides COLD_ARCHIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where archived dumps are stored (overrides COLD_ARCHIVE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for staging dumps in transit (overrides COLD_ARCHIVE_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<String>,

    /// Object store container for archives (overrides COLD_ARCHIVE_CONTAINER)
    #[arg(long)]
    pub container: Option<String>,

    /// Maximum cascade siblings processed at once (overrides COLD_ARCHIVE_CASCADE_CONCURRENCY)
    #[arg(long)]
    pub cascade_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::from_env()?.merge(args.clone_overrides());
        Ok((cfg, args.migrate))
    }

    /// Environment-only configuration with built-in defaults.
    pub fn from_env() -> Result<Self> {
        let timeout_secs: Option<u64> = env_parse_opt("COLD_ARCHIVE_OPERATION_TIMEOUT_SECS")?;
        let cascade_concurrency: usize =
            env_parse_opt("COLD_ARCHIVE_CASCADE_CONCURRENCY")?.unwrap_or(4);

        Ok(Self {
            host: env_or("COLD_ARCHIVE_HOST", "0.0.0.0"),
            port: env_parse_opt("COLD_ARCHIVE_PORT")?.unwrap_or(3000),
            database_url: env_or("COLD_ARCHIVE_DATABASE_URL", "postgres://localhost/reports"),
            storage_dir: env_or("COLD_ARCHIVE_STORAGE_DIR", "./data/objects"),
            temp_dir: env::var("COLD_ARCHIVE_TEMP_DIR")
                .unwrap_or_else(|_| env::temp_dir().join("cold-archive").display().to_string()),
            container: env_or("COLD_ARCHIVE_CONTAINER", "cold-archive"),
            pg_dump: env_or("COLD_ARCHIVE_PG_DUMP", "pg_dump"),
            pg_restore: env_or("COLD_ARCHIVE_PG_RESTORE", "pg_restore"),
            report_tables: env_or("COLD_ARCHIVE_REPORT_TABLES", "report_{id}_*"),
            analysis_tables: env_or("COLD_ARCHIVE_ANALYSIS_TABLES", "analysis_{id}_*"),
            cascade_concurrency: cascade_concurrency.max(1),
            operation_timeout: timeout_secs.map(Duration::from_secs),
        })
    }

    /// Apply CLI overrides on top of environment values.
    fn merge(self, overrides: Overrides) -> Self {
        Self {
            host: overrides.host.unwrap_or(self.host),
            port: overrides.port.unwrap_or(self.port),
            database_url: overrides.database_url.unwrap_or(self.database_url),
            storage_dir: overrides.storage_dir.unwrap_or(self.storage_dir),
            temp_dir: overrides.temp_dir.unwrap_or(self.temp_dir),
            container: overrides.container.unwrap_or(self.container),
            cascade_concurrency: overrides
                .cascade_concurrency
                .map(|n| n.max(1))
                .unwrap_or(self.cascade_concurrency),
            ..self
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The database URL may carry a password, so it is never printed.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &"<redacted>")
            .field("storage_dir", &self.storage_dir)
            .field("temp_dir", &self.temp_dir)
            .field("container", &self.container)
            .field("pg_dump", &self.pg_dump)
            .field("pg_restore", &self.pg_restore)
            .field("report_tables", &self.report_tables)
            .field("analysis_tables", &self.analysis_tables)
            .field("cascade_concurrency", &self.cascade_concurrency)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// CLI values that take precedence over the environment.
#[derive(Debug, Default)]
struct Overrides {
    host: Option<String>,
    port: Option<u16>,
    database_url: Option<String>,
    storage_dir: Option<String>,
    temp_dir: Option<String>,
    container: Option<String>,
    cascade_concurrency: Option<usize>,
}

impl Args {
    fn clone_overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            database_url: self.database_url.clone(),
            storage_dir: self.storage_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            container: self.container.clone(),
            cascade_concurrency: self.cascade_concurrency,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

/// Parse an optional environment variable, failing on unparsable values.
fn env_parse_opt<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
