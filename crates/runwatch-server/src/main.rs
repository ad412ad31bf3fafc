use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use runwatch_alerts::EngineTimings;
use runwatch_core::config::RunwatchConfig;
use tracing::{debug, info, warn};

mod app;
mod http;
mod relay;

#[derive(Parser)]
#[command(name = "runwatch-server", version, about = "Runtime alert and auto-stop engine")]
struct Cli {
    /// Config file. Falls back to RUNWATCH_CONFIG, then ~/.runwatch/runwatch.toml.
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the HTTP API with the dispatch engine (default).
    Serve,
    /// Run a single dispatch tick and print its report.
    Tick,
    /// Run a single retention sweep.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "runwatch_server=info,runwatch_alerts=info,runwatch_countdown=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("RUNWATCH_CONFIG").ok());
    let config = RunwatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        RunwatchConfig::default()
    });

    let db_path = config.database.path.clone();
    app::ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;

    let timings = EngineTimings::from_config(&config);
    let state = Arc::new(app::AppState::build(config, db)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Tick => {
            let report = state.dispatcher.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sweep => {
            let purged = state.dispatcher.sweep(timings.retention).await?;
            println!("purged {purged} alert record(s)");
        }
        Command::Serve => serve(state, timings).await?,
    }
    Ok(())
}

async fn serve(state: Arc<app::AppState>, timings: EngineTimings) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move { dispatcher.run(timings, shutdown_rx).await });

    // Countdowns that expired while the server was down fire now.
    if let Some(countdowns) = state.countdowns.clone() {
        tokio::spawn(async move {
            match countdowns.resume_all().await {
                Ok(outcomes) => info!(count = outcomes.len(), "local countdowns reconciled"),
                Err(e) => warn!("countdown reconciliation failed: {e}"),
            }
        });
    }

    let mut events = state.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(?event, "alert event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "alert event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let addr: SocketAddr = format!("{}:{}", state.config.server.bind, state.config.server.port).parse()?;
    let router = app::build_router(state);
    info!("runwatch server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal dispatch engine to stop
    let _ = shutdown_tx.send(true);
    Ok(())
}
