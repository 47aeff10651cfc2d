//! # Controller binary
//!
//! Runs the `ControllerRpc` gRPC server (§6) and a thin REST projection
//! (ambient outer surface) over a shared [`state::AppState`]: the topology
//! graph and the policy store.

mod error;
mod policy_store;
mod rest;
mod rpc;
mod state;

use clap::Parser;
use segment_core::config::ControllerConfig;
use std::path::PathBuf;

/// segment-controller: topology and policy control plane for the
/// micro-segmentation enforcer.
#[derive(Parser)]
#[command(name = "segment-controller")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Falls back to built-in defaults.
    #[arg(short, long, env = "SEGMENT_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::load_or_default(cli.config)?;

    segment_core::telemetry::init_logging(&config.common.log_filter)?;
    let metrics_addr: std::net::SocketAddr = config.common.metrics_addr.parse()?;
    segment_core::telemetry::init_metrics(metrics_addr)?;

    tracing::info!(
        rpc = %config.rpc_listen_addr,
        rest = %config.rest_listen_addr,
        "starting segment-controller"
    );

    let rpc_addr: std::net::SocketAddr = config.rpc_listen_addr.parse()?;
    let rest_addr: std::net::SocketAddr = config.rest_listen_addr.parse()?;
    let app_state = state::AppState::new(config);

    // The REST projection computes its views live off `AppState::graph`
    // rather than caching them, so there's nothing to invalidate here yet;
    // this just keeps the link-change feed (spec §4.7) observed so a future
    // cache layer has somewhere to subscribe. See the graph edge counter.
    let mut link_events = app_state.graph.subscribe();
    tokio::spawn(async move {
        loop {
            match link_events.recv().await {
                Ok(event) => {
                    metrics::counter!("segment_graph_link_events_total", "class" => format!("{:?}", event.class))
                        .increment(1);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "link-event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let rpc_state = app_state.clone();
    let rpc_handle = tokio::spawn(async move { rpc::start_grpc_server(rpc_addr, rpc_state).await });

    let rest_router = rest::router(app_state);
    let rest_handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(rest_addr).await?;
        tracing::info!(%rest_addr, "serving REST projection");
        axum::serve(listener, rest_router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = rpc_handle => {
            res??;
        }
        res = rest_handle => {
            res??;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
