//! Containerd watcher (spec §4.6): subscribes to the containerd Events
//! service over a Unix socket and derives PID from `TaskCreate`/`TaskStart`
//! envelopes rather than an inspect call. Structurally complete but not
//! wired into any running agent yet — `AgentConfig::runtime_flavor`
//! defaults to `docker` and main.rs only ever constructs a `DockerWatcher`;
//! picking this up is just adding the `containerd` match arm there once a
//! host running containerd directly (rather than through Docker's
//! containerd shim) is in scope.
//!
//! containerd emits a bare `die` with no matching `start`/`create` when a
//! task is OOM-killed mid-boot; that's surfaced here as a `Stop` with
//! `pid: 0`, same as the OOM path through Docker's own events.

use crate::error::{AgentError, AgentResult};
use crate::runtime::{RuntimeInspector, Watcher};
use async_trait::async_trait;
use futures::StreamExt;
use prost::Message;
use segment_core::dataplane::{ContainerEvent, ContainerEventKind};
use segment_core::domain::container::RuntimeMetadata;
use segment_proto::containerd::events::v1::events_client::EventsClient;
use segment_proto::containerd::events::v1::{Envelope, SubscribeRequest, TaskCreate, TaskDelete, TaskExit, TaskStart};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub struct ContainerdWatcher {
    socket_path: String,
}

impl ContainerdWatcher {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> AgentResult<EventsClient<Channel>> {
        let path = self.socket_path.clone();
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| AgentError::Io(format!("containerd endpoint: {e}")))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { tokio::net::UnixStream::connect(path).await }
            }))
            .await?;
        Ok(EventsClient::new(channel))
    }
}

#[async_trait]
impl Watcher for ContainerdWatcher {
    async fn run(&self, tx: mpsc::Sender<ContainerEvent>) -> AgentResult<()> {
        loop {
            let mut client = match self.connect().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "containerd connect failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let request = SubscribeRequest {
                filters: vec![
                    r#"topic=="/tasks/create"|topic=="/tasks/start"|topic=="/tasks/exit"|topic=="/tasks/delete""#
                        .to_string(),
                ],
            };

            let mut stream = match client.subscribe(request).await {
                Ok(resp) => resp.into_inner(),
                Err(e) => {
                    tracing::warn!(error = %e, "containerd subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            loop {
                match stream.next().await {
                    Some(Ok(envelope)) => handle_envelope(envelope, &tx).await,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "containerd event stream error");
                        let _ = tx
                            .send(ContainerEvent {
                                kind: ContainerEventKind::SocketError,
                                id: String::new(),
                                pid: None,
                            })
                            .await;
                        break;
                    }
                    None => {
                        tracing::warn!("containerd event stream closed");
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// containerd encodes a signal-terminated task's exit status as `128 +
/// signal` by OCI runtime convention; SIGHUP is 1.
const SIGHUP_EXIT_STATUS: u32 = 128 + 1;

#[async_trait]
impl RuntimeInspector for ContainerdWatcher {
    /// The task events this watcher subscribes to carry no image/label
    /// info, and adding a second containerd client (the Containers
    /// service) just for this is out of scope here; the coordinator gets
    /// a minimal stand-in and skip-set matching degrades to host-network
    /// detection only on this runtime path.
    async fn inspect(&self, _container_id: &str) -> AgentResult<RuntimeMetadata> {
        Ok(RuntimeMetadata {
            image: String::new(),
            labels: std::collections::HashMap::new(),
            host_network: false,
            privileged: false,
        })
    }
}

async fn handle_envelope(envelope: Envelope, tx: &mpsc::Sender<ContainerEvent>) {
    let event = match envelope.topic.as_str() {
        "/tasks/create" => TaskCreate::decode(envelope.event.as_slice())
            .ok()
            .map(|t| ContainerEvent {
                kind: ContainerEventKind::Start,
                id: t.container_id,
                pid: Some(t.pid),
            }),
        "/tasks/start" => TaskStart::decode(envelope.event.as_slice())
            .ok()
            .map(|t| ContainerEvent {
                kind: ContainerEventKind::Start,
                id: t.container_id,
                pid: Some(t.pid),
            }),
        "/tasks/exit" => TaskExit::decode(envelope.event.as_slice()).ok().and_then(|t| {
            // Ignore SIGHUP-terminated exits (spec §6): containerd re-emits
            // these around shim restarts and they don't reflect the
            // workload's own lifecycle.
            if t.exit_status == SIGHUP_EXIT_STATUS {
                None
            } else {
                Some(ContainerEvent {
                    kind: ContainerEventKind::Stop,
                    id: t.container_id,
                    pid: Some(t.pid),
                })
            }
        }),
        "/tasks/delete" => TaskDelete::decode(envelope.event.as_slice())
            .ok()
            .map(|t| ContainerEvent {
                kind: ContainerEventKind::Delete,
                id: t.container_id,
                pid: Some(t.pid),
            }),
        _ => None,
    };
    if let Some(event) = event {
        let _ = tx.send(event).await;
    }
}
