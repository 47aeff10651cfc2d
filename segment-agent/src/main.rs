//! # Agent binary
//!
//! Wires together the runtime watcher, lifecycle coordinator, port
//! interceptor, data-plane client, flow aggregator, and Controller client
//! (spec §2, §5).

use clap::Parser;
use segment_agent::controller_client::{new_agent_id, AgentIdentity, ControllerClient};
use segment_agent::dataplane::DataPlaneClient;
use segment_agent::intercept::{net_ns_by_name, BridgeTopology, PortInterceptor};
use segment_agent::lifecycle::LifecycleCoordinator;
use segment_agent::runtime::{ContainerdWatcher, DockerWatcher, RuntimeFlavor, RuntimeInspector, SharedSkipSet, Watcher};
use segment_agent::state::ContainerRegistry;
use segment_core::config::AgentConfig;
use segment_core::dataplane::DataPlaneMessage;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// segment-agent: per-host interception, policy enforcement, and flow
/// reporting for the micro-segmentation enforcer.
#[derive(Parser)]
#[command(name = "segment-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Falls back to built-in defaults.
    #[arg(short, long, env = "SEGMENT_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load_or_default(cli.config)?;

    segment_core::telemetry::init_logging(&config.common.log_filter)?;
    let metrics_addr: std::net::SocketAddr = config.common.metrics_addr.parse()?;
    segment_core::telemetry::init_metrics(metrics_addr)?;

    tracing::info!(
        controller = %config.controller_addr,
        runtime = %config.runtime_flavor,
        "starting segment-agent"
    );

    let enforcer_ns = net_ns_by_name(&config.enforcer_namespace)?;
    let bridge = BridgeTopology::for_prefix(&config.bridge_prefix);
    let interceptor = Arc::new(PortInterceptor::new(enforcer_ns, bridge, tokio::runtime::Handle::current()));

    let registry = ContainerRegistry::new();
    let aggregator = Arc::new(segment_agent::aggregator::FlowAggregator::new());
    let dataplane = Arc::new(DataPlaneClient::new(config.dataplane_socket_path.clone()));

    let identity = AgentIdentity {
        agent_id: new_agent_id(),
        host_id: hostname(),
        hostname: hostname(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let controller = Arc::new(ControllerClient::new(config.controller_addr.clone(), identity));

    let skip_set = SharedSkipSet::with_defaults(config.skip_set_overrides.clone());

    let (watcher, inspector): (Box<dyn Watcher>, Arc<dyn RuntimeInspector>) =
        match RuntimeFlavor::from_str_or_docker(&config.runtime_flavor) {
            RuntimeFlavor::Docker => {
                let docker = Arc::new(DockerWatcher::connect(None, skip_set.clone())?);
                (Box::new(DockerAdapter(docker.clone())), docker)
            }
            RuntimeFlavor::Containerd => {
                let containerd = Arc::new(ContainerdWatcher::new(config.dataplane_socket_path.clone()));
                (Box::new(ContainerdAdapter(containerd.clone())), containerd)
            }
        };

    let coordinator = Arc::new(LifecycleCoordinator::new(
        registry,
        interceptor,
        dataplane.clone(),
        controller.clone(),
        aggregator.clone(),
        inspector,
        skip_set,
        config.report_interval_min_secs,
    ));

    match controller.register().await {
        Ok(interval) => coordinator.handle().push_config_agent(Some(interval as u64)),
        Err(e) => tracing::warn!(error = %e, "initial registration failed, continuing with defaults"),
    }

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.run(events_tx).await {
            tracing::error!(error = %e, "runtime watcher exited");
        }
    });

    let pump_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                coordinator.submit_event(event);
            }
        })
    };

    let run_handle = tokio::spawn(coordinator.clone().run());

    let recv_handle = {
        let dataplane = dataplane.clone();
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            loop {
                match dataplane.recv().await {
                    Ok(DataPlaneMessage::Connection(conn)) => aggregator.record_connection(conn),
                    Ok(DataPlaneMessage::ThreatLog(threat)) => {
                        aggregator.record_threat(threat);
                    }
                    Ok(_) => {} // configuration echoes, if any; nothing to do
                    Err(e) => tracing::warn!(error = %e, "data-plane receive failed"),
                }
            }
        })
    };

    let flush_handle = {
        let controller = controller.clone();
        let aggregator = aggregator.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                let interval = coordinator.current_report_interval_secs().max(1);
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let batch = aggregator.drain_batch();
                if !batch.is_empty() {
                    match controller.report_connections(&batch).await {
                        Ok(new_interval) => coordinator.handle().push_config_agent(Some(new_interval as u64)),
                        Err(e) => {
                            tracing::warn!(error = %e, "report_connections failed, requeuing batch");
                            aggregator.requeue(batch);
                        }
                    }
                }

                let threats = aggregator.drain_threats();
                if !threats.is_empty() {
                    if let Err(e) = controller.report_threats(&threats).await {
                        tracing::warn!(error = %e, "report_threats failed, threats dropped");
                    }
                }
            }
        })
    };

    let heartbeat_handle = {
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(15)).await;
                if let Err(e) = controller.heartbeat().await {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");

    watcher_handle.abort();
    pump_handle.abort();
    run_handle.abort();
    recv_handle.abort();
    flush_handle.abort();
    heartbeat_handle.abort();

    coordinator.shutdown().await;

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Adapts an `Arc<DockerWatcher>` to the object-safe [`Watcher`] trait so
/// both runtime flavors can share one `Box<dyn Watcher>` slot in `main`.
struct DockerAdapter(Arc<DockerWatcher>);

#[async_trait::async_trait]
impl Watcher for DockerAdapter {
    async fn run(&self, tx: mpsc::Sender<segment_core::dataplane::ContainerEvent>) -> segment_agent::error::AgentResult<()> {
        self.0.run(tx).await
    }
}

struct ContainerdAdapter(Arc<ContainerdWatcher>);

#[async_trait::async_trait]
impl Watcher for ContainerdAdapter {
    async fn run(&self, tx: mpsc::Sender<segment_core::dataplane::ContainerEvent>) -> segment_agent::error::AgentResult<()> {
        self.0.run(tx).await
    }
}
