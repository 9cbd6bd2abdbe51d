use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error as AnyhowError;
use clap::{Parser, Subcommand};
use db::models::sync_node::SyncNode;
use db::{DBService, DbErr};
use server::{AppState, http};
use services::services::apply::ApplyService;
use services::services::config::{self, ConfigError};
use services::services::dispatcher::Dispatcher;
use services::services::relay::RelayClient;
use services::services::sender::{HttpTransport, Sender, TransportError};
use services::services::trace::{JsonLineParser, TraceListener};
use services::services::triggers::{TriggerError, TriggerInstaller};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, prelude::*};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[derive(Parser)]
#[command(name = "sync-agent", about = "Multi-master row replication agent")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the support schema and install capture triggers
    Install,
    /// Remove the capture triggers from every integrated table
    Uninstall,
    /// Run the agent in the foreground (what the service supervisor invokes)
    Start,
    /// Stop a supervised agent (delegated to the service supervisor)
    Stop,
    /// Launch the configuration front-end (shipped separately)
    Ui,
}

fn init_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Start) {
        Command::Install => install(&cli.config).await,
        Command::Uninstall => uninstall(&cli.config).await,
        Command::Start => run_agent(&cli.config).await,
        Command::Stop => {
            println!("Process control belongs to the OS service supervisor; use it to stop the agent.");
            Ok(())
        }
        Command::Ui => {
            println!("The configuration front-end ships separately; edit {} directly or use it.", cli.config.display());
            Ok(())
        }
    }
}

async fn install(config_path: &PathBuf) -> Result<(), AgentError> {
    let config = config::load_config_from_file(config_path)?;
    let db = DBService::new(&config.database.dsn).await?;
    let installer = TriggerInstaller::new(db.pool.clone(), &config.capture.ignored_columns);
    let installed = installer.install_all().await?;
    println!("Support schema ready; triggers installed on {installed} table(s).");
    Ok(())
}

async fn uninstall(config_path: &PathBuf) -> Result<(), AgentError> {
    let config = config::load_config_from_file(config_path)?;
    let db = DBService::new(&config.database.dsn).await?;
    let installer = TriggerInstaller::new(db.pool.clone(), &config.capture.ignored_columns);
    installer.uninstall_all().await?;
    println!("Capture triggers removed.");
    Ok(())
}

async fn run_agent(config_path: &PathBuf) -> Result<(), AgentError> {
    tracing::info!(path = %config_path.display(), "loading configuration");
    let config = Arc::new(config::load_config_from_file(config_path)?);

    let db = DBService::new(&config.database.dsn).await?;

    // Keep triggers in step with the registry on every start; a new table
    // registered by the front-end gets its capture on the next restart.
    let installer = TriggerInstaller::new(db.pool.clone(), &config.capture.ignored_columns);
    match installer.install_all().await {
        Ok(count) => tracing::info!(tables = count, "capture triggers verified"),
        Err(err) => tracing::warn!(error = %err, "trigger auto-installation failed"),
    }

    // Statically configured upstream peer, registered before the first tick.
    if let Some(remote_url) = config.webhook.remote_url.as_deref().filter(|u| !u.is_empty()) {
        let remote_node_id = config.webhook.remote_node_id.as_str();
        tracing::info!(node_id = remote_node_id, url = remote_url, "registering static peer");
        SyncNode::register(&db.pool, remote_node_id, Some(remote_url)).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);

    let apply = ApplyService::new(db.clone());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let relay_handle = if config.relay.enabled {
        tracing::info!(hub = config.relay.hub_url.as_deref().unwrap_or(""), "relay enabled");
        let (client, handle) = RelayClient::new(&config, apply.clone(), shutdown_rx.clone());
        tasks.push(client.spawn());
        Some(handle)
    } else {
        None
    };

    let transport = HttpTransport::new(config.request_timeout(), config.sync_token())?;
    tasks.push(
        Sender::new(db.clone(), &config, transport, relay_handle, shutdown_rx.clone()).spawn(),
    );
    tasks.push(Dispatcher::new(db.clone(), &config, shutdown_rx.clone()).spawn());

    if config.trace.enabled {
        if let Some(log_path) = config.trace.log_path.as_deref().filter(|p| !p.is_empty()) {
            let listener = TraceListener::new(
                db.clone(),
                &config.node_id,
                PathBuf::from(log_path),
                config.trace_poll_interval(),
                Box::new(JsonLineParser),
                shutdown_rx.clone(),
            );
            tasks.push(listener.spawn());
        } else {
            tracing::warn!("trace.enabled is set but trace.log_path is empty");
        }
    }

    let state = AppState::new(config.clone(), apply);
    let app_router = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.webhook.listen_addr).await?;
    tracing::info!(
        node_id = %config.node_id,
        addr = %config.webhook.listen_addr,
        "sync agent running"
    );

    axum::serve(
        listener,
        app_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_watch_true(shutdown_rx.clone()))
    .await?;

    // Give the loops until the deadline to finish their current iteration.
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            "workers did not stop within {:?}, exiting anyway",
            GRACEFUL_SHUTDOWN_TIMEOUT
        );
    }

    tracing::info!("sync agent stopped");
    Ok(())
}

fn spawn_signal_watcher(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(sig) => sig,
                Err(err) => {
                    tracing::error!("Failed to install SIGINT handler: {err}");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sig) => Some(sig),
                Err(err) => {
                    tracing::error!("Failed to install SIGTERM handler: {err}");
                    None
                }
            };

            tokio::select! {
                _ = sigint.recv() => {},
                _ = async {
                    match sigterm.as_mut() {
                        Some(sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {},
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {err}");
                return;
            }
        }

        tracing::info!("shutdown signal received, stopping");
        let _ = shutdown_tx.send(true);
    });
}

async fn wait_for_watch_true(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
