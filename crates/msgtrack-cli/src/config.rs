use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use clap::Args;
use msgtrack_core::clock::{parse_zone, DEFAULT_ZONE};
use msgtrack_n8n_adapter::retry::RetryPolicy;
use msgtrack_n8n_adapter::{N8nAuth, N8nConfig, DEFAULT_API_PREFIX, DEFAULT_TIMEOUT_SECS};
use msgtrack_storage::{StoreOptions, DEFAULT_BUSY_TIMEOUT_MS};
use msgtrack_sync::DEFAULT_WORKERS;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "message_statuses.sqlite3";

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// SQLite database holding the status records
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    /// IANA zone for formatted timestamps
    #[arg(long, global = true)]
    pub timezone: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub zone: Tz,
    pub debug: bool,
    pub log_level: Option<String>,
    pub store: StoreOptions,
    pub workers: usize,
}

/// Connection settings for the workflow API; only needed by commands that
/// read from n8n.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub n8n: N8nConfig,
}

pub fn load_config(args: &GlobalArgs) -> Result<AppConfig> {
    resolve_config(args, &|key| std::env::var(key).ok())
}

pub fn load_source_config() -> Result<SourceConfig> {
    resolve_source_config(&|key| std::env::var(key).ok())
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn resolve_config(args: &GlobalArgs, env: EnvLookup<'_>) -> Result<AppConfig> {
    let db_path = args
        .db
        .clone()
        .or_else(|| env_value(env, "MSGTRACK_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

    let zone_name = args
        .timezone
        .clone()
        .or_else(|| env_value(env, "MSGTRACK_TIMEZONE"))
        .unwrap_or_else(|| DEFAULT_ZONE.to_string());
    let zone = parse_zone(&zone_name).map_err(|err| anyhow!(err))?;

    let busy_timeout_ms = env_parse(env, "MSGTRACK_STORE_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS)?;
    let workers = env_parse(env, "MSGTRACK_WORKERS", DEFAULT_WORKERS)?.max(1);

    Ok(AppConfig {
        db_path,
        zone,
        debug: args.debug || env_true(env, "MSGTRACK_DEBUG"),
        log_level: env_value(env, "MSGTRACK_LOG_LEVEL"),
        store: StoreOptions {
            busy_timeout: Duration::from_millis(busy_timeout_ms),
        },
        workers,
    })
}

fn resolve_source_config(env: EnvLookup<'_>) -> Result<SourceConfig> {
    let base_url = env_value(env, "N8N_BASE_URL").context("N8N_BASE_URL is not set")?;
    let workflow_id =
        env_value(env, "WORKFLOW_ID_WHATSAPP").context("WORKFLOW_ID_WHATSAPP is not set")?;
    let auth = N8nAuth::from_parts(
        env_value(env, "N8N_API_KEY").as_deref(),
        env_value(env, "N8N_BASIC_USER").as_deref(),
        env_value(env, "N8N_BASIC_PASS").as_deref(),
    )?;
    let api_prefix =
        env_value(env, "N8N_API_PREFIX").unwrap_or_else(|| DEFAULT_API_PREFIX.to_string());

    let timeout_secs = env_parse(env, "MSGTRACK_HTTP_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
    let max_attempts = env_parse(
        env,
        "MSGTRACK_HTTP_MAX_RETRIES",
        RetryPolicy::default().max_attempts,
    )?;

    let mut n8n = N8nConfig::new(&base_url, auth, workflow_id).with_api_prefix(&api_prefix);
    n8n.timeout = Duration::from_secs(timeout_secs);
    n8n.retry = RetryPolicy {
        max_attempts: max_attempts.max(1),
        ..RetryPolicy::default()
    };
    Ok(SourceConfig { n8n })
}

fn env_value(env: EnvLookup<'_>, key: &str) -> Option<String> {
    env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(env: EnvLookup<'_>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_value(env, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("invalid {key}={raw:?}: {err}")),
        None => Ok(default),
    }
}

fn env_true(env: EnvLookup<'_>, key: &str) -> bool {
    match env(key) {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}
