//! Shared Controller state handed to both the gRPC server and the REST
//! projection.

use crate::policy_store::PolicyStore;
use segment_core::config::ControllerConfig;
use segment_core::graph::TopologyGraph;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<TopologyGraph>,
    pub policies: Arc<PolicyStore>,
    pub config: Arc<ControllerConfig>,
}

impl AppState {
    pub fn new(config: ControllerConfig) -> Self {
        let graph = Arc::new(TopologyGraph::new(config.max_entries_per_edge));
        Self {
            policies: Arc::new(PolicyStore::new(graph.clone())),
            graph,
            config: Arc::new(config),
        }
    }
}
