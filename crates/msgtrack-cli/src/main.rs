mod config;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config, load_source_config, AppConfig, GlobalArgs};
use msgtrack_core::source::DEFAULT_MAX_EXECUTIONS;
use msgtrack_core::{DeliveryStatus, SourceFilter, StatusStore, StoreError, SystemClock};
use msgtrack_n8n_adapter::N8nExecutionSource;
use msgtrack_storage::MessageStore;
use msgtrack_sync::{run_pass, track_message, PassConfig, PassError, TrackRequest};
use serde::Serialize;
use serde_json::json;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "msgtrack")]
#[command(about = "WhatsApp delivery-status tracker for n8n workflows", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every message seen in recent executions
    Scan {
        /// Executions to fetch
        #[arg(long, default_value_t = DEFAULT_MAX_EXECUTIONS)]
        limit: usize,
        /// Only statuses addressed to this conversation (wa_id)
        #[arg(long)]
        conversation: Option<String>,
        /// Ignore statuses older than this epoch second
        #[arg(long)]
        since: Option<i64>,
        /// Keep only the N messages with the newest activity
        #[arg(long)]
        max_messages: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Follow one message until a terminal status shows up
    Track {
        conversation: String,
        message: String,
        #[arg(long, default_value_t = DEFAULT_MAX_EXECUTIONS)]
        limit: usize,
        #[arg(long)]
        since: Option<i64>,
    },
    /// Print the stored record of a message
    Show { message_id: String },
    /// List stored records, newest first
    List {
        #[arg(long, conflicts_with = "status")]
        conversation: Option<String>,
        /// Latest status to match, e.g. read or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli.global) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(event = "command_failed", error = %format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<ExitCode> {
    match command {
        Commands::Scan {
            limit,
            conversation,
            since,
            max_messages,
            workers,
        } => {
            let mut pass = PassConfig::new(String::new());
            pass.workers = workers.unwrap_or(config.workers).max(1);
            pass.filter = SourceFilter {
                conversation_id: conversation,
                since,
                max_executions: limit,
            };
            pass.max_messages = max_messages;
            scan(config, pass).await
        }
        Commands::Track {
            conversation,
            message,
            limit,
            since,
        } => {
            let request = TrackRequest {
                conversation_id: conversation,
                message_id: message,
                since,
                max_executions: limit,
            };
            blocking(move || track(&config, &request)).await
        }
        Commands::Show { message_id } => blocking(move || show(&config, &message_id)).await,
        Commands::List {
            conversation,
            status,
            limit,
        } => blocking(move || list(&config, conversation, status, limit)).await,
    }
}

async fn scan(config: AppConfig, mut pass: PassConfig) -> Result<ExitCode> {
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = cancel.clone();

    let mut task = tokio::task::spawn_blocking(move || -> Result<ExitCode> {
        let source_config = load_source_config()?;
        pass.workflow_id = source_config.n8n.workflow_id.clone();
        // fail fast on an unusable database before touching the API
        drop(open_store(&config)?);

        let source = N8nExecutionSource::new(source_config.n8n)?;
        let clock = SystemClock::new(config.zone);
        let opener = || MessageStore::open(&config.db_path, config.store).map_err(StoreError::from);

        let report = match run_pass(&source, opener, &clock, &pass, &worker_cancel) {
            Ok(report) => report,
            Err(PassError::Source(err)) => {
                error!(event = "pass_aborted", error = %err);
                return Ok(ExitCode::FAILURE);
            }
            Err(err) => return Err(err.into()),
        };

        print_json(&report)?;
        if report.is_total_store_failure() {
            error!(
                event = "store_unavailable",
                failed = report.failed,
                db_path = %config.db_path.display()
            );
            return Ok(ExitCode::FAILURE);
        }
        Ok(ExitCode::SUCCESS)
    });

    tokio::select! {
        joined = &mut task => joined.context("scan task failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!(event = "cancel_requested");
            cancel.store(true, Ordering::SeqCst);
            task.await.context("scan task failed")?
        }
    }
}

fn track(config: &AppConfig, request: &TrackRequest) -> Result<ExitCode> {
    let source_config = load_source_config()?;
    let workflow_id = source_config.n8n.workflow_id.clone();
    let store = open_store(config)?;
    let source = N8nExecutionSource::new(source_config.n8n)?;
    let clock = SystemClock::new(config.zone);

    match track_message(&source, &store, &clock, &workflow_id, request) {
        Ok(report) => {
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(PassError::Source(err)) => {
            error!(event = "track_aborted", message_id = %request.message_id, error = %err);
            Ok(ExitCode::FAILURE)
        }
        Err(PassError::Reconcile(err)) if err.is_store_unavailable() => {
            error!(event = "store_unavailable", message_id = %request.message_id, error = %err);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn show(config: &AppConfig, message_id: &str) -> Result<ExitCode> {
    let store = open_store(config)?;
    match store.find(message_id)? {
        Some(record) => print_json(&record)?,
        None => {
            info!(event = "message_not_found", message_id);
            print_json(&json!({ "messageId": message_id, "found": false }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list(
    config: &AppConfig,
    conversation: Option<String>,
    status: Option<String>,
    limit: usize,
) -> Result<ExitCode> {
    let store = open_store(config)?;
    let records = match (conversation, status) {
        (Some(conversation), _) => store.by_conversation(&conversation, limit)?,
        (None, Some(status)) => {
            let status: DeliveryStatus = status
                .parse()
                .map_err(|err| anyhow!("invalid --status: {err}"))?;
            store.by_latest_status(&status, limit)?
        }
        (None, None) => store.recent(limit)?,
    };
    print_json(&records)?;
    Ok(ExitCode::SUCCESS)
}

fn open_store(config: &AppConfig) -> Result<MessageStore> {
    MessageStore::open(&config.db_path, config.store)
        .with_context(|| format!("open status store at {}", config.db_path.display()))
}

async fn blocking<F>(job: F) -> Result<ExitCode>
where
    F: FnOnce() -> Result<ExitCode> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .context("blocking task failed")?
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("render json")?;
    println!("{rendered}");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.log_level.clone().unwrap_or_else(|| "info".to_string()))
        })
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}
