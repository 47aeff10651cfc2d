//! Logging and metrics bootstrap shared by both binaries.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the tracing subscriber. `filter` is the default level when
/// `SEGMENT_LOG`/`RUST_LOG` is unset.
pub fn init_logging(filter: &str) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter))
        .context("failed to build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();

    Ok(())
}

/// Bind the Prometheus exporter on `addr` (`host:port`). Registers the
/// shared counters/gauges used by both tiers; per-component metrics are
/// recorded inline at their call sites with `metrics::counter!`/`gauge!`.
pub fn init_metrics(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;

    metrics::describe_counter!(
        "segment_containers_intercepted_total",
        "Containers successfully intercepted"
    );
    metrics::describe_counter!(
        "segment_tc_filter_install_failures_total",
        "TC filter install failures"
    );
    metrics::describe_counter!(
        "segment_aggregator_drops_total",
        "Connection records dropped by the flow aggregator, by reason"
    );
    metrics::describe_counter!(
        "segment_rpc_errors_total",
        "Controller RPC errors, by method"
    );
    metrics::describe_gauge!(
        "segment_graph_edges",
        "Current edge count in the topology graph"
    );
    metrics::describe_counter!(
        "segment_graph_link_events_total",
        "Link-creation events fired by the topology graph, by class"
    );

    Ok(())
}
