//! Per-container state (spec §3). Only the lifecycle coordinator mutates
//! these; everything else reads under a read-lock (spec §5).

use crate::domain::intercept::InterceptPair;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A container's lifecycle position. A container is in exactly one of these
/// at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerLifecycleState {
    Pending,
    Intercepted,
    Stopped,
    Deleted,
    /// Interception rollback itself failed; no further operations target
    /// this container until a manual reset (spec §7, `InterceptionLeaked`).
    Degraded,
}

/// Observed server port on a container: protocol + detected application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub port: u16,
    pub ip_proto: u8,
    pub detected_server_id: Option<String>,
    pub application_id: u32,
    pub server_version: Option<String>,
    pub source: AppInfoSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppInfoSource {
    FromController,
    FromDataPlane,
}

/// Mode flags carried per container (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerModeFlags {
    pub inline: bool,
    pub quarantined: bool,
}

/// Runtime metadata captured at AddContainer time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub image: String,
    pub labels: HashMap<String, String>,
    pub host_network: bool,
    pub privileged: bool,
}

/// A managed container, keyed by its runtime-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub runtime: RuntimeMetadata,
    pub pairs: Vec<InterceptPair>,
    /// Observed server ports, keyed by `(port, ip_proto)`.
    pub apps: HashMap<(u16, u8), AppInfo>,
    pub mode: ContainerModeFlags,
    pub can_intercept: bool,
    pub policy_mode: String,
    pub state: ContainerLifecycleState,
    pub policy_version: u64,
}

impl ContainerState {
    pub fn new(id: String, name: String, pid: u32, runtime: RuntimeMetadata) -> Self {
        Self {
            id,
            name,
            pid,
            runtime,
            pairs: Vec::new(),
            apps: HashMap::new(),
            mode: ContainerModeFlags::default(),
            can_intercept: true,
            policy_mode: "monitor".to_string(),
            state: ContainerLifecycleState::Pending,
            policy_version: 0,
        }
    }

    /// Verifies the pid guard used on Stop events (spec §4.2, testable
    /// property 9): a stop for a stale pid is a no-op.
    pub fn pid_matches(&self, pid: u32) -> bool {
        self.pid == pid
    }
}
