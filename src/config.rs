use crate::services::{
    identity::{DEFAULT_FALLBACK_USER_ID, IdentityPolicy},
    image_service::DEFAULT_URL_TTL,
    validation::{DEFAULT_ALLOWED_TYPES, DEFAULT_MAX_SIZE_BYTES, ImagePolicy},
};
use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "IMAGE_SERVICE_";

/// Which pair of storage gateways the service talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-process maps; nothing survives a restart.
    Memory,
    /// Files on disk plus a SQLite table.
    Local,
    /// S3 and DynamoDB (or a compatible emulator via `--endpoint-url`).
    Aws,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub bucket_name: String,
    pub table_name: String,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub storage_dir: String,
    pub database_url: String,
    pub url_ttl_secs: u64,
    pub allowed_types: Vec<String>,
    pub max_size_bytes: usize,
    pub allow_anonymous: bool,
    pub fallback_user_id: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image upload and retrieval API")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides IMAGE_SERVICE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Bucket holding the image bytes (overrides IMAGE_SERVICE_BUCKET_NAME)
    #[arg(long)]
    pub bucket_name: Option<String>,

    /// Table holding the image records (overrides IMAGE_SERVICE_TABLE_NAME)
    #[arg(long)]
    pub table_name: Option<String>,

    /// Custom AWS endpoint, e.g. a LocalStack URL (overrides IMAGE_SERVICE_ENDPOINT_URL)
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// AWS region (overrides IMAGE_SERVICE_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Directory where objects are stored (overrides IMAGE_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Lifetime of download URLs in seconds (overrides IMAGE_SERVICE_URL_TTL_SECS)
    #[arg(long)]
    pub url_ttl_secs: Option<u64>,

    /// Comma-separated accepted content types (overrides IMAGE_SERVICE_ALLOWED_TYPES)
    #[arg(long, value_delimiter = ',')]
    pub allowed_types: Option<Vec<String>>,

    /// Largest accepted payload in bytes (overrides IMAGE_SERVICE_MAX_SIZE_BYTES)
    #[arg(long)]
    pub max_size_bytes: Option<usize>,

    /// Attribute requests without an identity to the fallback user
    #[arg(long)]
    pub allow_anonymous: bool,

    /// User id for anonymous requests (overrides IMAGE_SERVICE_FALLBACK_USER_ID)
    #[arg(long)]
    pub fallback_user_id: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, process_env)?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables returned by `lookup` over defaults.
    ///
    /// `lookup` receives the unprefixed variable name (`PORT`, not
    /// `IMAGE_SERVICE_PORT`).
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let env = EnvSource { lookup };

        let backend = match args.backend {
            Some(b) => b,
            None => match env.get("BACKEND")? {
                Some(raw) => <Backend as ValueEnum>::from_str(raw.trim(), true)
                    .map_err(|e| anyhow!(e))
                    .with_context(|| format!("parsing {}BACKEND value `{}`", ENV_PREFIX, raw))?,
                None => Backend::Local,
            },
        };

        let allowed_types = match args.allowed_types {
            Some(list) => normalize_types(list),
            None => match env.get("ALLOWED_TYPES")? {
                Some(raw) => normalize_types(raw.split(',').map(str::to_string)),
                None => DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
            },
        };

        let env_anonymous = match env.get("ALLOW_ANONYMOUS")? {
            Some(raw) => parse_bool(&raw)
                .with_context(|| format!("parsing {}ALLOW_ANONYMOUS value `{}`", ENV_PREFIX, raw))?,
            None => false,
        };

        // --- Merge ---
        let cfg = Self {
            host: or_env(args.host, &env, "HOST", "0.0.0.0")?,
            port: parsed_or_env(args.port, &env, "PORT", 3000)?,
            backend,
            bucket_name: or_env(args.bucket_name, &env, "BUCKET_NAME", "imagehost")?,
            table_name: or_env(args.table_name, &env, "TABLE_NAME", "ImageMetaData")?,
            endpoint_url: optional(args.endpoint_url, &env, "ENDPOINT_URL")?,
            region: optional(args.region, &env, "REGION")?,
            storage_dir: or_env(args.storage_dir, &env, "STORAGE_DIR", "./data/objects")?,
            database_url: or_env(
                args.database_url,
                &env,
                "DATABASE_URL",
                "sqlite://./data/meta/images.db",
            )?,
            url_ttl_secs: parsed_or_env(
                args.url_ttl_secs,
                &env,
                "URL_TTL_SECS",
                DEFAULT_URL_TTL.as_secs(),
            )?,
            allowed_types,
            max_size_bytes: parsed_or_env(
                args.max_size_bytes,
                &env,
                "MAX_SIZE_BYTES",
                DEFAULT_MAX_SIZE_BYTES,
            )?,
            allow_anonymous: args.allow_anonymous || env_anonymous,
            fallback_user_id: or_env(
                args.fallback_user_id,
                &env,
                "FALLBACK_USER_ID",
                DEFAULT_FALLBACK_USER_ID,
            )?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.url_ttl_secs > 0, "url_ttl_secs must be greater than zero");
        ensure!(
            !self.allowed_types.is_empty(),
            "allowed_types must name at least one content type"
        );
        ensure!(self.max_size_bytes > 0, "max_size_bytes must be greater than zero");
        ensure!(
            !self.fallback_user_id.trim().is_empty(),
            "fallback_user_id must not be blank"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn image_policy(&self) -> ImagePolicy {
        ImagePolicy::new(self.allowed_types.clone(), self.max_size_bytes)
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        if self.allow_anonymous {
            IdentityPolicy::AllowAnonymous {
                fallback_user_id: self.fallback_user_id.clone(),
            }
        } else {
            IdentityPolicy::Required
        }
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }

    /// Request body cap at the transport. Twice the image cap so a
    /// base64-encoded payload at the limit still reaches validation.
    pub fn body_limit(&self) -> usize {
        self.max_size_bytes.saturating_mul(2)
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    fn get(&self, name: &str) -> Result<Option<String>> {
        (self.lookup)(name)
    }
}

fn process_env(name: &str) -> Result<Option<String>> {
    let key = format!("{}{}", ENV_PREFIX, name);
    match env::var(&key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn or_env<F>(arg: Option<String>, env: &EnvSource<F>, name: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    Ok(match arg {
        Some(v) => v,
        None => env.get(name)?.unwrap_or_else(|| default.to_string()),
    })
}

fn optional<F>(arg: Option<String>, env: &EnvSource<F>, name: &str) -> Result<Option<String>>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    let value = match arg {
        Some(v) => Some(v),
        None => env.get(name)?,
    };
    Ok(value.filter(|v| !v.trim().is_empty()))
}

fn parsed_or_env<T, F>(arg: Option<T>, env: &EnvSource<F>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<Option<String>>,
{
    if let Some(v) = arg {
        return Ok(v);
    }
    match env.get(name)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, raw)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("`{}` is not a boolean", other)),
    }
}

fn normalize_types<I>(types: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    types
        .into_iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
