//! a11y-progress - follow accessibility analysis jobs from the terminal
//!
//! This tool provides commands for:
//! - Watching a job's live progress stream
//! - Inspecting who is listening on the backend
//! - Publishing progress events and broadcasts by hand
//! - Managing persisted client preferences
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/a11y-progress/config.toml (~/.config/a11y-progress/config.toml)
//! - Preferences: $XDG_DATA_HOME/a11y-progress/preferences.json
//! - Logs: $XDG_STATE_HOME/a11y-progress/a11y-progress.log

mod watch;

use a11y_progress_core::api::ProgressApiClient;
use a11y_progress_core::store::{ClientStore, Theme};
use a11y_progress_core::{Config, EventKind, ProgressEvent};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "a11y-progress")]
#[command(about = "Follow accessibility analysis jobs in real time")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Backend base URL (overrides server.url from config)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream live progress for an upload
    Watch {
        upload_id: String,

        /// Exit once the analysis reports completion
        #[arg(long)]
        exit_on_complete: bool,
    },

    /// Show configuration and backend reachability
    Status,

    /// Show active progress listeners
    Connections {
        /// Limit to a single upload
        upload_id: Option<String>,
    },

    /// Publish a progress event for an upload
    Emit {
        upload_id: String,

        /// Event type, e.g. agent_start or analysis_complete
        event_type: String,

        #[arg(long)]
        agent: Option<String>,

        /// Fraction complete, 0.0 to 1.0
        #[arg(long)]
        progress: Option<f64>,

        #[arg(long)]
        message: Option<String>,
    },

    /// Broadcast a JSON object to an upload's listeners
    Broadcast {
        upload_id: String,

        /// JSON object payload
        payload: String,
    },

    /// Show or change persisted preferences
    Prefs {
        /// Set the theme (system, light, dark)
        #[arg(long)]
        theme: Option<Theme>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(url) = args.server {
        config.server.url = url;
        config.validate().context("invalid --server")?;
    }

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(
            a11y_progress_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Watch {
            upload_id,
            exit_on_complete,
        } => watch::run(&config, &upload_id, exit_on_complete).await,
        Command::Status => cmd_status(&config).await,
        Command::Connections { upload_id } => cmd_connections(&config, upload_id.as_deref()).await,
        Command::Emit {
            upload_id,
            event_type,
            agent,
            progress,
            message,
        } => {
            let mut event = ProgressEvent::new(event_type).with_upload_id(upload_id);
            if let Some(agent) = agent {
                event = event.with_agent(agent);
            }
            if let Some(progress) = progress {
                event = event.with_progress(progress);
            }
            if let Some(message) = message {
                event = event.with_message(message);
            }
            cmd_emit(&config, &event).await
        }
        Command::Broadcast { upload_id, payload } => {
            cmd_broadcast(&config, &upload_id, &payload).await
        }
        Command::Prefs { theme } => cmd_prefs(theme),
    }
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("a11y-progress Configuration");
    println!("===========================");
    println!();
    println!("Config File:     {}", Config::config_path().display());
    println!("Server URL:      {}", config.server.url);
    println!("Stream URL:      {}", config.progress_url("<upload_id>"));
    println!("Timeout:         {}s", config.server.timeout_secs);
    println!("Max Retries:     {}", config.server.max_retries);
    println!(
        "Reconnect:       {} attempts, {}ms apart",
        config.channel.max_reconnect_attempts, config.channel.reconnect_delay_ms
    );
    match config.channel.liveness_timeout() {
        Some(timeout) => println!("Liveness:        {}s", timeout.as_secs()),
        None => println!("Liveness:        disabled"),
    }
    println!(
        "History:         {} updates, {} completed, {} errored",
        config.progress.recent_updates, config.progress.completed, config.progress.errored
    );

    let client = ProgressApiClient::new(config.server.clone())?;
    println!();
    if client.health_check().await? {
        println!("Backend: reachable");
    } else {
        println!("Backend: unreachable");
    }

    Ok(())
}

async fn cmd_connections(config: &Config, upload_id: Option<&str>) -> Result<()> {
    let client = ProgressApiClient::new(config.server.clone())?;

    match upload_id {
        Some(upload_id) => {
            let info = client
                .connection_info(upload_id)
                .await
                .context("failed to fetch connection info")?;
            println!("Upload:          {}", info.upload_id);
            println!("Listeners:       {}", info.active_connections);
            println!("Status:          {}", info.status);
        }
        None => {
            let summary = client
                .all_connections()
                .await
                .context("failed to fetch connections")?;
            println!("Uploads:         {}", summary.total_uploads);
            println!("Listeners:       {}", summary.total_connections);

            let mut uploads: Vec<_> = summary.connections_by_upload.into_iter().collect();
            uploads.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if !uploads.is_empty() {
                println!();
                println!("{:<40} {:>9}", "UPLOAD", "LISTENERS");
                for (upload_id, count) in uploads {
                    println!("{:<40} {:>9}", upload_id, count);
                }
            }
        }
    }

    Ok(())
}

async fn cmd_emit(config: &Config, event: &ProgressEvent) -> Result<()> {
    if let EventKind::Unknown(raw) = &event.kind {
        tracing::warn!(event_type = %raw, "Publishing unrecognized event type");
    }
    if event.kind.is_agent_scoped() && event.agent().is_none() {
        bail!("{} requires --agent", event.kind);
    }

    let client = ProgressApiClient::new(config.server.clone())?;
    let ack = client
        .send_progress_update(event)
        .await
        .context("failed to publish progress event")?;
    println!("{}", ack.message);
    Ok(())
}

async fn cmd_broadcast(config: &Config, upload_id: &str, payload: &str) -> Result<()> {
    let message: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;

    let client = ProgressApiClient::new(config.server.clone())?;
    let ack = client
        .broadcast(upload_id, &message)
        .await
        .context("failed to broadcast")?;
    println!("{}", ack.message);
    Ok(())
}

fn cmd_prefs(theme: Option<Theme>) -> Result<()> {
    let mut store = ClientStore::load();

    if let Some(theme) = theme {
        store.set_theme(theme).context("failed to save preferences")?;
    }

    let prefs = store.preferences();
    println!("Preferences:     {}", Config::preferences_path().display());
    println!("Theme:           {:?}", prefs.theme);
    println!(
        "Severities:      {}",
        join_or_dash(&prefs.filters.severities)
    );
    println!("Agents:          {}", join_or_dash(&prefs.filters.agents));
    println!(
        "Search:          {}",
        prefs.filters.search.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn join_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(", ")
    }
}
