use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dx_gateway::api::offer::close_media_channel;
use dx_gateway::api::router::build_router;
use dx_gateway::config::GatewayConfig;
use dx_gateway::media::UnconfiguredFactory;
use dx_gateway::state::AppState;

#[derive(Parser)]
#[command(name = "duplex", about = "Multi-tenant real-time interaction gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the gateway server (default).
    Serve,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(GatewayConfig::from_env()).await
        }
        Some(Command::Version) => {
            println!("duplex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dx_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!(bind = %config.bind_addr, "duplex starting");

    // The voice pipeline backend is supplied by the embedding application;
    // standalone, media offers are rejected until one is wired in.
    let state = AppState::new(config, Arc::new(UnconfiguredFactory));
    tracing::warn!("no media pipeline backend configured, media offers will be rejected");

    spawn_sweepers(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("binding {}", state.config.bind_addr))?;
    tracing::info!(addr = %state.config.bind_addr, "duplex listening");

    let shutdown_state = state.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install shutdown signal handler");
            }
            tracing::info!("shutdown signal received");
            shutdown(&shutdown_state).await;
        })
        .await
        .context("serving")?;

    tracing::info!("duplex stopped");
    Ok(())
}

/// Periodic sweeps: stale connections, stale bus subscriptions, expired
/// sessions.
fn spawn_sweepers(state: AppState) {
    let interval = state.config.sweep_interval;
    let idle_timeout = state.config.idle_timeout;
    let session_ttl = state.config.session_ttl_hours;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = state
                .connections
                .sweep_stale(&state.bus, &state.sessions, &state.history, idle_timeout)
                .await;
            let stale_subs = state.bus.sweep_stale(idle_timeout);
            let stale_sessions = state.sessions.sweep_stale(session_ttl);
            if evicted + stale_subs + stale_sessions > 0 {
                tracing::info!(
                    connections = evicted,
                    subscriptions = stale_subs,
                    sessions = stale_sessions,
                    "stale sweep complete"
                );
            }
        }
    });
}

/// Tear down every live connection and close all media channels.
async fn shutdown(state: &AppState) {
    let connections = state.connections.list();
    tracing::info!(count = connections.len(), "tearing down connections");
    for ctx in connections {
        state
            .connections
            .teardown(&ctx, &state.bus, &state.sessions, &state.history)
            .await;
    }

    let pc_ids = state.media.pc_ids();
    tracing::info!(count = pc_ids.len(), "closing media channels");
    for pc_id in pc_ids {
        close_media_channel(state, &pc_id).await;
    }
}
