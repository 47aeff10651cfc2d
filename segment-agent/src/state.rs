//! The agent's `ContainerState` map (spec §3, §5): owned by the lifecycle
//! worker, read under a read-lock by every other task. Nothing outside
//! [`crate::lifecycle::coordinator`] is allowed to take the write half.

use segment_core::domain::container::ContainerState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct ContainerRegistry {
    inner: Arc<RwLock<HashMap<String, ContainerState>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<ContainerState> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<ContainerState> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Only the lifecycle worker calls the `_mut` methods below; enforced
    /// by convention (spec §5: "ContainerState map ... Writers: lifecycle
    /// worker only"), not by the type system, matching the single-writer
    /// discipline the coordinator already serializes through its task
    /// queue.
    pub async fn insert(&self, state: ContainerState) {
        self.inner.write().await.insert(state.id.clone(), state);
    }

    pub async fn remove(&self, id: &str) -> Option<ContainerState> {
        self.inner.write().await.remove(id)
    }

    pub async fn mutate<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ContainerState) -> R,
    {
        let mut guard = self.inner.write().await;
        guard.get_mut(id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_core::domain::container::RuntimeMetadata;

    fn sample(id: &str, pid: u32) -> ContainerState {
        ContainerState::new(
            id.to_string(),
            format!("name-{id}"),
            pid,
            RuntimeMetadata {
                image: "nginx".to_string(),
                labels: Default::default(),
                host_network: false,
                privileged: false,
            },
        )
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let registry = ContainerRegistry::new();
        registry.insert(sample("c1", 1000)).await;
        let got = registry.get("c1").await.unwrap();
        assert_eq!(got.pid, 1000);
    }

    #[tokio::test]
    async fn mutate_applies_in_place() {
        let registry = ContainerRegistry::new();
        registry.insert(sample("c1", 1000)).await;
        registry
            .mutate("c1", |c| c.mode.quarantined = true)
            .await
            .unwrap();
        assert!(registry.get("c1").await.unwrap().mode.quarantined);
    }
}
