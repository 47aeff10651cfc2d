//! The lifecycle coordinator (spec §4.2): the single writer of
//! [`ContainerRegistry`], draining the task queue and applying the
//! per-container state table. Every other task in the agent only reads
//! container state; this is the one place that mutates it.

use crate::aggregator::FlowAggregator;
use crate::controller_client::ControllerClient;
use crate::dataplane::SharedDataPlaneClient;
use crate::error::AgentResult;
use crate::intercept::PortInterceptor;
use crate::lifecycle::queue::{Task, TaskQueue};
use crate::runtime::{RuntimeInspector, SharedSkipSet};
use crate::state::ContainerRegistry;
use segment_core::dataplane::{
    AppConfigPayload, ContainerEvent, ContainerEventKind, MacConfigPayload, PolicyConfigPayload, PortPairConfigPayload,
};
use segment_core::domain::container::{ContainerLifecycleState, ContainerState, RuntimeMetadata};
use segment_core::domain::intercept::{InterceptMode, QUARANTINE_PREFERENCE};
use segment_core::domain::policy::{WorkloadMode, WorkloadPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::time::Duration;

/// How often the coordinator checks for a newer policy version per
/// workload it owns (spec §4.2 "Periodic policy pull").
const POLICY_PULL_INTERVAL: Duration = Duration::from_secs(10);

/// Metadata-fetch attempts on `AddContainer` before falling back to an
/// empty placeholder (spec §4.2 "fetch metadata (retry ×2)").
const METADATA_FETCH_ATTEMPTS: usize = 2;

pub struct LifecycleCoordinator {
    registry: ContainerRegistry,
    interceptor: Arc<PortInterceptor>,
    dataplane: SharedDataPlaneClient,
    controller: Arc<ControllerClient>,
    aggregator: Arc<FlowAggregator>,
    inspector: Arc<dyn RuntimeInspector>,
    skip_set: SharedSkipSet,
    queue: TaskQueue,
    /// Last policy accepted per workload id, mirrored against
    /// `ContainerState::policy_version` so the periodic pull only re-pushes
    /// what actually changed.
    policies: AsyncRwLock<HashMap<String, WorkloadPolicy>>,
    report_interval_secs: AtomicU64,
}

impl LifecycleCoordinator {
    pub fn new(
        registry: ContainerRegistry,
        interceptor: Arc<PortInterceptor>,
        dataplane: SharedDataPlaneClient,
        controller: Arc<ControllerClient>,
        aggregator: Arc<FlowAggregator>,
        inspector: Arc<dyn RuntimeInspector>,
        skip_set: SharedSkipSet,
        default_report_interval_secs: u64,
    ) -> Self {
        Self {
            registry,
            interceptor,
            dataplane,
            controller,
            aggregator,
            inspector,
            skip_set,
            queue: TaskQueue::default(),
            policies: AsyncRwLock::new(HashMap::new()),
            report_interval_secs: AtomicU64::new(default_report_interval_secs),
        }
    }

    /// Handle other tasks use to enqueue work without holding a reference
    /// to the coordinator's internals.
    pub fn handle(self: &Arc<Self>) -> CoordinatorHandle {
        CoordinatorHandle { inner: self.clone() }
    }

    pub fn current_report_interval_secs(&self) -> u64 {
        self.report_interval_secs.load(Ordering::Relaxed)
    }

    /// Runs forever: drains the task queue and fires the policy-pull tick.
    /// Intended to be the body of one dedicated `tokio::spawn`ed task.
    pub async fn run(self: Arc<Self>) {
        let mut policy_tick = tokio::time::interval(POLICY_PULL_INTERVAL);
        policy_tick.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                task = self.queue.pop() => self.dispatch(task).await,
                _ = policy_tick.tick() => self.policy_pull_tick().await,
            }
        }
    }

    async fn dispatch(&self, task: Task) {
        let result = match task {
            Task::AddContainer { id, pid } => self.handle_add(id, pid).await,
            Task::InterceptContainer { id } => self.handle_intercept(id).await,
            Task::StopContainer { id, pid } => self.handle_stop(id, pid).await,
            Task::DeleteContainer { id } => self.handle_delete(id).await,
            Task::ReinterceptContainer { id, new_mode } => self.handle_reintercept(id, new_mode).await,
            Task::ConfigContainer { id, quarantined } => self.handle_config_container(id, quarantined).await,
            Task::ConfigAgent { report_interval_secs } => {
                self.handle_config_agent(report_interval_secs);
                Ok(())
            }
            Task::ConfigSystem { skip_set_overrides } => {
                self.handle_config_system(skip_set_overrides);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "lifecycle task failed");
        }
    }

    /// Translates one runtime-watcher event into a task and enqueues it
    /// (spec §4.6 funnels into §4.2's queue). `SocketError` carries no
    /// per-container action of its own — the watcher re-enumerates and
    /// replays synthetic starts on reconnect, which surface here as
    /// ordinary `AddContainer` tasks.
    pub fn submit_event(&self, event: ContainerEvent) {
        match event.kind {
            ContainerEventKind::Start => {
                if let Some(pid) = event.pid {
                    self.queue.push(Task::AddContainer { id: event.id, pid });
                } else {
                    tracing::warn!(id = %event.id, "start event with no pid, dropping");
                }
            }
            ContainerEventKind::Stop => {
                // Docker's die/stop/kill never carries a pid (spec §6); the
                // pid guard below resolves it from stored state instead.
                let pid = event.pid.unwrap_or(0);
                self.queue.push(Task::StopContainer { id: event.id, pid });
            }
            ContainerEventKind::Delete => {
                self.queue.push(Task::DeleteContainer { id: event.id });
            }
            ContainerEventKind::SocketError => {
                tracing::warn!("runtime watcher reported a socket error; reconnect in progress");
            }
        }
    }

    // --- absent -> AddContainer -> pending ---------------------------------

    async fn handle_add(&self, id: String, pid: u32) -> AgentResult<()> {
        if self.registry.contains(&id).await {
            // Already tracked (e.g. a replayed synthetic start after
            // reconnect); idempotent no-op.
            return Ok(());
        }

        let metadata = self.fetch_metadata(&id).await;
        let can_intercept = !metadata.host_network;

        let mut state = ContainerState::new(id.clone(), id.clone(), pid, metadata);
        state.can_intercept = can_intercept;
        self.registry.insert(state).await;

        if let Err(e) = self.controller.report_workload_add(&id, &id, Vec::new()).await {
            tracing::warn!(id = %id, error = %e, "failed to report workload add to controller");
        }

        if can_intercept {
            self.queue.push(Task::InterceptContainer { id });
        }
        metrics::counter!("segment_containers_intercepted_total").increment(0); // ensure the series exists
        Ok(())
    }

    async fn fetch_metadata(&self, id: &str) -> RuntimeMetadata {
        for attempt in 1..=METADATA_FETCH_ATTEMPTS {
            match self.inspector.inspect(id).await {
                Ok(metadata) => return metadata,
                Err(e) => tracing::warn!(id, attempt, error = %e, "metadata fetch failed"),
            }
        }
        RuntimeMetadata {
            image: String::new(),
            labels: HashMap::new(),
            host_network: false,
            privileged: false,
        }
    }

    // --- pending -> Intercept -> intercepted -------------------------------

    async fn handle_intercept(&self, id: String) -> AgentResult<()> {
        let Some(state) = self.registry.get(&id).await else {
            return Ok(());
        };
        if !matches!(state.state, ContainerLifecycleState::Pending) {
            return Ok(());
        }

        let policy = self.resolve_policy(&id).await;
        let mode = intercept_mode_for(policy.mode);

        let pairs = match self.interceptor.intercept_container(state.pid, mode, &state.pairs).await {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "interception failed, container marked degraded");
                self.registry
                    .mutate(&id, |c| c.state = ContainerLifecycleState::Degraded)
                    .await;
                return Err(e);
            }
        };

        let new_pairs = &pairs[state.pairs.len()..];
        for pair in new_pairs {
            self.dataplane
                .push_mac_config(MacConfigPayload {
                    add: true,
                    ep_mac: pair.original_mac,
                    ucmac: pair.ucmac,
                    bcmac: pair.bcmac,
                    tap: matches!(mode, InterceptMode::Tap),
                })
                .await?;
            self.dataplane
                .push_port_pair(PortPairConfigPayload {
                    in_port: pair.in_port.clone(),
                    ex_port: pair.ex_port.clone(),
                    container_mac: pair.original_mac,
                    pair_id: pair.ex_port.clone(),
                })
                .await?;
        }

        self.dataplane
            .push_policy(PolicyConfigPayload { policy: policy.clone() })
            .await?;

        self.registry
            .mutate(&id, |c| {
                c.pairs = pairs;
                c.mode.inline = true;
                c.policy_version = policy.version;
                c.state = ContainerLifecycleState::Intercepted;
            })
            .await;
        self.policies.write().await.insert(id.clone(), policy);

        metrics::counter!("segment_containers_intercepted_total").increment(1);
        Ok(())
    }

    /// Fetches (or reuses a cached) `WorkloadPolicy`, defaulting to
    /// `Monitor` with no rules if the Controller has none on record yet.
    async fn resolve_policy(&self, id: &str) -> WorkloadPolicy {
        if let Some(cached) = self.policies.read().await.get(id).cloned() {
            return cached;
        }
        match self.controller.get_policies(&[id.to_string()]).await {
            Ok(mut policies) if !policies.is_empty() => policies.remove(0),
            Ok(_) => default_policy(id),
            Err(e) => {
                tracing::warn!(id, error = %e, "get_policies failed, defaulting to monitor");
                default_policy(id)
            }
        }
    }

    // --- intercepted -> Stop(pid) -> stopped -------------------------------

    async fn handle_stop(&self, id: String, pid: u32) -> AgentResult<()> {
        let Some(state) = self.registry.get(&id).await else {
            return Ok(());
        };
        if pid != 0 && !state.pid_matches(pid) {
            // Stale event for a pid that has already been replaced; the
            // runtime can re-emit these (spec §4.2 "Ordering guarantees").
            return Ok(());
        }
        if !matches!(state.state, ContainerLifecycleState::Intercepted) {
            return Ok(());
        }

        // Strict teardown order (spec §4.2): TC filters stop traffic first,
        // then DP state is retracted, then ports are released. `detach`
        // itself deletes filters before qdiscs/ports, so by the time this
        // loop returns no frames can reach the DP for this pair any more;
        // retracting the DP's MAC/pair bookkeeping after is a pure
        // bookkeeping cleanup, not a traffic-path race.
        for pair in &state.pairs {
            self.interceptor.detach(pair).await?;
            self.dataplane.retract_mac_config(&pair.ucmac).await;
            self.dataplane.retract_port_pair(&pair.ex_port).await;
        }

        self.registry
            .mutate(&id, |c| c.state = ContainerLifecycleState::Stopped)
            .await;
        Ok(())
    }

    // --- stopped -> Delete -> absent ----------------------------------------

    async fn handle_delete(&self, id: String) -> AgentResult<()> {
        if !self.registry.contains(&id).await {
            return Ok(());
        }
        self.dataplane.retract_policy(&id).await;
        self.policies.write().await.remove(&id);
        self.registry.remove(&id).await;
        Ok(())
    }

    // --- intercepted -> ReIntercept (mode change) -> intercepted ------------

    async fn handle_reintercept(&self, id: String, new_mode: InterceptMode) -> AgentResult<()> {
        let Some(state) = self.registry.get(&id).await else {
            return Ok(());
        };
        if !matches!(state.state, ContainerLifecycleState::Intercepted) {
            return Ok(());
        }

        let mut updated_pairs = Vec::with_capacity(state.pairs.len());
        for pair in &state.pairs {
            let updated = self.interceptor.change_mode(pair, new_mode).await?;
            self.dataplane
                .push_mac_config(MacConfigPayload {
                    add: true,
                    ep_mac: updated.original_mac,
                    ucmac: updated.ucmac,
                    bcmac: updated.bcmac,
                    tap: matches!(new_mode, InterceptMode::Tap),
                })
                .await?;
            updated_pairs.push(updated);
        }

        self.registry
            .mutate(&id, |c| c.pairs = updated_pairs)
            .await;

        if let Some(policy) = self.policies.read().await.get(&id).cloned() {
            self.dataplane.push_policy(PolicyConfigPayload { policy }).await?;
        }
        Ok(())
    }

    // --- quarantine toggle (ConfigContainer) --------------------------------

    async fn handle_config_container(&self, id: String, quarantined: Option<bool>) -> AgentResult<()> {
        let Some(quarantined) = quarantined else {
            return Ok(());
        };
        let Some(state) = self.registry.get(&id).await else {
            return Ok(());
        };
        if quarantined == state.mode.quarantined {
            return Ok(());
        }

        for pair in &state.pairs {
            if quarantined {
                self.interceptor.quarantine(pair, QUARANTINE_PREFERENCE).await?;
            } else {
                self.interceptor.unquarantine(pair, QUARANTINE_PREFERENCE).await?;
            }
        }
        self.registry.mutate(&id, |c| c.mode.quarantined = quarantined).await;
        Ok(())
    }

    fn handle_config_agent(&self, report_interval_secs: Option<u64>) {
        if let Some(secs) = report_interval_secs {
            self.report_interval_secs.store(secs, Ordering::Relaxed);
        }
    }

    fn handle_config_system(&self, skip_set_overrides: Option<Vec<String>>) {
        if let Some(overrides) = skip_set_overrides {
            self.skip_set.add_overrides(overrides);
        }
    }

    // --- periodic policy pull (spec §4.2) -----------------------------------

    async fn policy_pull_tick(&self) {
        let containers = self.registry.all().await;
        let ids: Vec<String> = containers
            .iter()
            .filter(|c| matches!(c.state, ContainerLifecycleState::Intercepted))
            .map(|c| c.id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }

        let fetched = match self.controller.get_policies(&ids).await {
            Ok(policies) => policies,
            Err(e) => {
                tracing::warn!(error = %e, "periodic policy pull failed");
                return;
            }
        };

        for policy in fetched {
            let Some(state) = self.registry.get(&policy.workload_id).await else {
                continue;
            };
            if policy.version <= state.policy_version {
                continue;
            }

            let old_mode = self
                .policies
                .read()
                .await
                .get(&policy.workload_id)
                .map(|p| p.mode);

            if let Err(e) = self
                .dataplane
                .push_policy(PolicyConfigPayload { policy: policy.clone() })
                .await
            {
                tracing::warn!(id = %policy.workload_id, error = %e, "failed to push pulled policy");
                continue;
            }

            self.registry
                .mutate(&policy.workload_id, |c| c.policy_version = policy.version)
                .await;
            self.policies.write().await.insert(policy.workload_id.clone(), policy.clone());

            if old_mode.is_some_and(|m| m != policy.mode) {
                self.queue.push(Task::ReinterceptContainer {
                    id: policy.workload_id,
                    new_mode: intercept_mode_for(policy.mode),
                });
            }
        }
    }

    /// Pushes one observed app binding to the data plane (spec §4.5
    /// `AppConfig`); used by whatever on-host component first detects an
    /// application on a port.
    pub async fn push_app_config(&self, payload: AppConfigPayload) -> AgentResult<()> {
        self.dataplane.push_apps(payload).await
    }

    pub fn aggregator(&self) -> &FlowAggregator {
        &self.aggregator
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Best-effort teardown of every still-intercepted container (spec §5
    /// "On shutdown: drain the task queue, detach every container
    /// (best-effort, continue on error), close DP, close RPC"). Callers
    /// stop feeding the queue and abort the `run` loop before calling this.
    pub async fn shutdown(&self) {
        for container in self.registry.all().await {
            if !matches!(container.state, ContainerLifecycleState::Intercepted) {
                continue;
            }
            for pair in &container.pairs {
                if let Err(e) = self.interceptor.detach(pair).await {
                    tracing::warn!(id = %container.id, error = %e, "detach during shutdown failed, continuing");
                }
            }
        }
    }
}

fn intercept_mode_for(mode: WorkloadMode) -> InterceptMode {
    match mode {
        WorkloadMode::Monitor => InterceptMode::Tap,
        WorkloadMode::Protect => InterceptMode::Fwd,
    }
}

fn default_policy(workload_id: &str) -> WorkloadPolicy {
    WorkloadPolicy {
        workload_id: workload_id.to_string(),
        mode: WorkloadMode::Monitor,
        default_action: WorkloadMode::Monitor.default_action(),
        rules: Vec::new(),
        version: 0,
    }
}

/// A cheap, cloneable front for submitting runtime events and config tasks
/// without exposing the coordinator's state directly.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<LifecycleCoordinator>,
}

impl CoordinatorHandle {
    pub fn submit_event(&self, event: ContainerEvent) {
        self.inner.submit_event(event);
    }

    pub fn push_config_agent(&self, report_interval_secs: Option<u64>) {
        self.inner.queue.push(Task::ConfigAgent { report_interval_secs });
    }

    pub fn push_config_system(&self, skip_set_overrides: Option<Vec<String>>) {
        self.inner.queue.push(Task::ConfigSystem { skip_set_overrides });
    }

    pub fn push_config_container(&self, id: String, quarantined: Option<bool>) {
        self.inner.queue.push(Task::ConfigContainer { id, quarantined });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intercept_mode_follows_workload_mode() {
        assert_eq!(intercept_mode_for(WorkloadMode::Monitor), InterceptMode::Tap);
        assert_eq!(intercept_mode_for(WorkloadMode::Protect), InterceptMode::Fwd);
    }

    #[test]
    fn default_policy_is_monitor_with_no_rules() {
        let policy = default_policy("w1");
        assert_eq!(policy.mode, WorkloadMode::Monitor);
        assert!(policy.rules.is_empty());
        assert_eq!(policy.version, 0);
    }
}
