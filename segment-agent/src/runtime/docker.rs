//! Docker watcher (spec §4.6): `bollard`'s event stream plus container
//! inspection for the PID. Containerd support (`containerd.rs`) listens on
//! the containerd Events service and derives PID from TaskCreate/Start
//! envelopes instead of an inspect call; both funnel into the same
//! `ContainerEvent` channel so the lifecycle coordinator never branches on
//! runtime flavor.

use crate::error::AgentResult;
use crate::runtime::skip_set::SharedSkipSet;
use crate::runtime::{RuntimeInspector, Watcher};
use async_trait::async_trait;
use bollard::models::EventMessageTypeEnum;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use segment_core::dataplane::{ContainerEvent, ContainerEventKind};
use segment_core::domain::container::RuntimeMetadata;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Duration;

pub struct DockerWatcher {
    docker: Docker,
    skip: SharedSkipSet,
}

impl DockerWatcher {
    pub fn connect(socket_path: Option<&str>, skip: SharedSkipSet) -> AgentResult<Self> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker, skip })
    }

    async fn pid_of(&self, container_id: &str) -> AgentResult<Option<u32>> {
        let inspect = self.docker.inspect_container(container_id, None).await?;
        Ok(inspect.state.and_then(|s| s.pid).filter(|p| *p > 0).map(|p| p as u32))
    }

    async fn should_skip(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => {
                let image = inspect.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default();
                let host_network = inspect
                    .host_config
                    .as_ref()
                    .and_then(|h| h.network_mode.as_deref())
                    .map(|m| m == "host")
                    .unwrap_or(false);
                let privileged = inspect.host_config.as_ref().and_then(|h| h.privileged).unwrap_or(false);
                self.skip.matches(&image, host_network, privileged)
            }
            // Container already gone by the time we inspected it; let the
            // lifecycle coordinator's own state check absorb the no-op.
            Err(_) => false,
        }
    }

    async fn enumerate_running(&self, tx: &mpsc::Sender<ContainerEvent>) -> AgentResult<()> {
        let containers = self
            .docker
            .list_containers::<String>(None)
            .await?;
        for c in containers {
            let Some(id) = c.id else { continue };
            if self.should_skip(&id).await {
                continue;
            }
            if let Some(pid) = self.pid_of(&id).await? {
                let _ = tx
                    .send(ContainerEvent {
                        kind: ContainerEventKind::Start,
                        id,
                        pid: Some(pid),
                    })
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Watcher for DockerWatcher {
    async fn run(&self, tx: mpsc::Sender<ContainerEvent>) -> AgentResult<()> {
        loop {
            if let Err(e) = self.enumerate_running(&tx).await {
                tracing::warn!(error = %e, "initial container enumeration failed, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }

            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            let options = EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            };
            let mut stream = self.docker.events(Some(options));

            loop {
                match stream.next().await {
                    Some(Ok(msg)) => {
                        if msg.typ != Some(EventMessageTypeEnum::CONTAINER) {
                            continue;
                        }
                        let Some(id) = msg.actor.and_then(|a| a.id) else { continue };
                        let action = msg.action.unwrap_or_default();
                        self.handle_action(&id, &action, &tx).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "docker event stream error");
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
                        tracing::warn!("docker event stream closed");
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

impl DockerWatcher {
    async fn handle_action(&self, id: &str, action: &str, tx: &mpsc::Sender<ContainerEvent>) {
        match action {
            "start" => {
                if self.should_skip(id).await {
                    return;
                }
                match self.pid_of(id).await {
                    Ok(Some(pid)) => {
                        let _ = tx
                            .send(ContainerEvent {
                                kind: ContainerEventKind::Start,
                                id: id.to_string(),
                                pid: Some(pid),
                            })
                            .await;
                    }
                    Ok(None) => tracing::warn!(id, "start event with no pid"),
                    Err(e) => tracing::warn!(id, error = %e, "failed to inspect started container"),
                }
            }
            "die" | "stop" | "kill" => {
                // Docker's die/stop/kill events never carry the PID (spec
                // §6); the coordinator resolves it from stored state.
                let _ = tx
                    .send(ContainerEvent {
                        kind: ContainerEventKind::Stop,
                        id: id.to_string(),
                        pid: None,
                    })
                    .await;
            }
            "destroy" => {
                let _ = tx
                    .send(ContainerEvent {
                        kind: ContainerEventKind::Delete,
                        id: id.to_string(),
                        pid: None,
                    })
                    .await;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RuntimeInspector for DockerWatcher {
    async fn inspect(&self, container_id: &str) -> AgentResult<RuntimeMetadata> {
        let inspect = self.docker.inspect_container(container_id, None).await?;
        let image = inspect.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default();
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let host_network = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.as_deref())
            .map(|m| m == "host")
            .unwrap_or(false);
        let privileged = inspect.host_config.as_ref().and_then(|h| h.privileged).unwrap_or(false);
        Ok(RuntimeMetadata {
            image,
            labels,
            host_network,
            privileged,
        })
    }
}
