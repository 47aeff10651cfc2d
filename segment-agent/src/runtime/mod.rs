//! Runtime watcher (spec §4.6): a polymorphic container-event source that
//! the lifecycle coordinator drains. Docker today, containerd is
//! structurally ready but not wired into [`Watcher::connect`] yet — see
//! `docker.rs`'s module doc for why.

mod containerd;
mod docker;
mod skip_set;

pub use containerd::ContainerdWatcher;
pub use docker::DockerWatcher;
pub use skip_set::{SharedSkipSet, SkipSet};

use crate::error::AgentResult;
use async_trait::async_trait;
use segment_core::dataplane::ContainerEvent;
use segment_core::domain::container::RuntimeMetadata;
use tokio::sync::mpsc;

/// Runtime flavor selection (spec §4.6), mirrors `AgentConfig::runtime_flavor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    Docker,
    Containerd,
}

impl RuntimeFlavor {
    pub fn from_str_or_docker(s: &str) -> Self {
        match s {
            "containerd" => Self::Containerd,
            _ => Self::Docker,
        }
    }
}

/// A source of container lifecycle events. Implementations own their
/// reconnect-and-re-enumerate loop and never return from `run` except on
/// an unrecoverable setup error; transient socket errors are folded into
/// `ContainerEventKind::SocketError` events pushed through the channel,
/// per spec §4.6 "on socket error: emit SocketError, then reconnect with
/// backoff and re-enumerate".
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn run(&self, tx: mpsc::Sender<ContainerEvent>) -> AgentResult<()>;
}

/// Fetches the metadata the lifecycle coordinator attaches to a container
/// at AddContainer time (spec §4.2 "fetch metadata"). Split out from
/// [`Watcher`] because the Docker event stream itself never carries it —
/// only an explicit inspect call does — while containerd's task events
/// don't expose an equivalent cheaply, so that watcher reports a minimal
/// stand-in.
#[async_trait]
pub trait RuntimeInspector: Send + Sync {
    async fn inspect(&self, container_id: &str) -> AgentResult<RuntimeMetadata>;
}
