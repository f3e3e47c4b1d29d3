use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ud_domain::config::LaunchConfig;
use ud_gateway::api;
use ud_gateway::bootstrap::{build_app_state, spawn_background_tasks, UnconfiguredLlm};

#[derive(Debug, Parser)]
#[command(name = "undoabled", about = "Undoable daemon — recorded, reversible agent runs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start the daemon (default).
    Serve,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Serve) => serve().await,
        Some(Command::Version) => {
            println!("undoabled {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ud_gateway=debug")),
        )
        .json()
        .init();
}

async fn serve() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(LaunchConfig::from_env().context("resolving launch config")?);
    config
        .check_bind_policy()
        .context("bind policy check failed")?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        policy = ?config.security_policy,
        approval = ?config.approval_mode,
        "undoable daemon starting"
    );

    // The LLM backend is wired here; without one, runs fail with a
    // configuration hint while the rest of the daemon stays usable.
    let state = build_app_state(config.clone(), Arc::new(UnconfiguredLlm))
        .await
        .context("building daemon state")?;
    spawn_background_tasks(&state).await;

    let router = api::build_router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    state.shutdown.run_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
