//! IRP client (irp-client) - command-line entry point
//!
//! Uploads IR documents, runs an analysis session with optional follow-up,
//! or watches realtime row changes for a session or project.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use irp_client::config::ClientConfig;
use irp_client::models::{BatchProgress, FollowupKind, UploadFile};
use irp_client::services::{
    format_file_size, ChannelTiming, HistoryClient, RealtimeChannel, WsConnector,
};
use irp_client::ClientError;
use irp_common::config::LoggingConfig;
use irp_common::events::{ClientEvent, EventBus};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for irp-client
#[derive(Parser, Debug)]
#[command(name = "irp-client")]
#[command(about = "Upload IR documents and run investment-report analysis")]
#[command(version)]
struct Args {
    /// Config file (default: $IRP_CONFIG, then <config dir>/irp/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overrides the config file
    #[arg(long, global = true, env = "IRP_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token (default: $IRP_AUTH_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Use the simulated blob transport (no real storage upload)
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and upload files
    Upload {
        /// Company the documents belong to
        #[arg(long)]
        company: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Upload files, run the analysis and print the result
    Analyze {
        #[arg(long)]
        company: String,

        /// Public reference URL to analyze instead of (or with) files
        #[arg(long)]
        url: Option<String>,

        /// Ask one follow-up question after the analysis completes
        #[arg(long)]
        followup: Option<FollowupKind>,

        /// Question text for a custom follow-up
        #[arg(long)]
        question: Option<String>,

        files: Vec<PathBuf>,
    },

    /// Print realtime changes for a conversation session or project
    Watch {
        /// Conversation session id
        #[arg(long, conflicts_with = "project")]
        session: Option<String>,

        /// Analysis project id
        #[arg(long)]
        project: Option<String>,

        /// Print stored rows before watching
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let mut config = ClientConfig::load(
        args.config.as_deref(),
        args.token.as_deref(),
        args.base_url.as_deref(),
    )
    .context("Failed to load configuration")?;
    if args.simulate {
        config.settings.upload.simulate = true;
    }

    init_tracing(&config.settings.logging)?;

    match &config.source {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }
    info!("Backend: {}", config.settings.base_url);
    if config.auth_token.is_none() {
        warn!("No bearer token configured; backend calls are unauthenticated");
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let events = EventBus::default();
    let printer = tokio::spawn(print_events(events.subscribe()));

    let outcome = match args.command {
        Command::Upload { company, files } => upload(&config, &events, &company, files, &cancel).await,
        Command::Analyze {
            company,
            url,
            followup,
            question,
            files,
        } => {
            analyze(
                &config,
                &events,
                &company,
                files,
                url.as_deref(),
                followup,
                question.as_deref(),
                &cancel,
            )
            .await
        }
        Command::Watch {
            session,
            project,
            history,
        } => watch(&config, &events, session, project, history, &cancel).await,
    };

    // Let the printer drain what was already published
    drop(events);
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    outcome
}

/// Registry + EnvFilter + fmt layer; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "irp_client={level},irp_common={level}",
            level = logging.level
        )
        .into()
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, cancelling");
            cancel.cancel();
        }
        Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
    }
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<ClientEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(ClientEvent::UploadCompleted { filename, .. }) => println!("  uploaded {}", filename),
            Ok(ClientEvent::UploadFailed {
                filename,
                error_message,
                ..
            }) => println!("  failed   {}: {}", filename, error_message),
            Ok(ClientEvent::AnalysisStep {
                step_index, label, ..
            }) => println!("  step {}: {}", step_index + 1, label),
            Ok(ClientEvent::ReauthenticationRequired { .. }) => {
                println!("  authentication required: set IRP_AUTH_TOKEN or pass --token")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Event printer lagged by {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn load_files(paths: Vec<PathBuf>) -> Result<Vec<UploadFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = UploadFile::from_path(&path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        println!("  {} ({})", file.name(), format_file_size(file.size()));
        files.push(file);
    }
    Ok(files)
}

fn progress_printer() -> Arc<dyn Fn(BatchProgress) + Send + Sync> {
    Arc::new(|progress: BatchProgress| {
        println!(
            "  [{}] {} {:.0}%",
            progress.file_index + 1,
            progress.filename,
            progress.percent()
        );
    })
}

async fn upload(
    config: &ClientConfig,
    events: &EventBus,
    company: &str,
    paths: Vec<PathBuf>,
    cancel: &CancellationToken,
) -> Result<()> {
    let backend = config.backend(events)?;
    let queue = config.upload_queue(&backend, events).await;
    let files = load_files(paths).await?;

    match queue.enqueue(files, company, progress_printer(), cancel).await {
        Ok(uploaded) => {
            for file in uploaded {
                println!("{} -> {}", file.filename, file.blob_location);
            }
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn analyze(
    config: &ClientConfig,
    events: &EventBus,
    company: &str,
    paths: Vec<PathBuf>,
    reference_url: Option<&str>,
    followup: Option<FollowupKind>,
    question: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let backend = config.backend(events)?;
    let uploads = Arc::new(config.upload_queue(&backend, events).await);
    let mut controller = config
        .controller(&backend, uploads, events)
        .with_upload_progress(progress_printer());
    let files = load_files(paths).await?;

    let result = match controller.submit(company, files, reference_url, cancel).await {
        Ok(result) => result,
        Err(ClientError::Authentication) => {
            bail!("Authentication required: set IRP_AUTH_TOKEN or pass --token")
        }
        Err(e) => bail!("Analysis failed: {}", e),
    };

    println!("\n{}", result.summary());

    if let Some(kind) = followup {
        let entry = controller
            .followup(kind, question)
            .await
            .context("Follow-up failed")?;
        println!("\n[{}] {}", entry.kind, entry.answer);
        if let Some(metrics) = entry.metrics {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }
    Ok(())
}

async fn watch(
    config: &ClientConfig,
    events: &EventBus,
    session: Option<String>,
    project: Option<String>,
    history: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let realtime = &config.settings.realtime;
    let request_timeout = config.settings.polling.request_timeout();

    if history {
        let mut client = HistoryClient::from_settings(realtime, request_timeout)?;
        if let Some(token) = &config.auth_token {
            client = client.with_access_token(token.clone());
        }
        let rows = match (&session, &project) {
            (Some(id), _) => client.fetch_conversation_history(id).await?,
            (None, Some(id)) => client.fetch_analysis_results(id).await?,
            (None, None) => bail!("--session or --project is required"),
        };
        for row in rows {
            println!("{}", row);
        }
    }

    let connector = Arc::new(WsConnector::from_settings(realtime)?);
    let channel = RealtimeChannel::new(
        connector,
        ChannelTiming::from(realtime),
        Some(events.clone()),
    );

    let print = |change: &irp_client::services::ChangeRecord| -> anyhow::Result<()> {
        println!("{} {}: {}", change.event_kind.as_str(), change.table, change.record);
        Ok(())
    };
    match (&session, &project) {
        (Some(id), _) => channel.subscribe_to_conversation(id, print)?,
        (None, Some(id)) => channel.subscribe_to_analysis_results(id, print)?,
        (None, None) => bail!("--session or --project is required"),
    };

    channel.connect();
    info!("Watching realtime changes, Ctrl+C to stop");
    cancel.cancelled().await;
    channel.disconnect().await;
    Ok(())
}
