//! Configuration loading shared by both tiers. Loading itself is out of
//! core scope (spec §1) but its shape is ambient: both binaries need
//! something to read settings from, loaded the same way.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings common to the Agent and the Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub log_filter: String,
    pub metrics_addr: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Per-host Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub common: CommonConfig,
    /// Path to the data-plane AF_UNIX datagram socket (§4.5).
    pub dataplane_socket_path: String,
    /// Name of the enforcer's working network namespace (§4.1).
    pub enforcer_namespace: String,
    /// Prefix used for the mirror bridge veth pair (`vbr-<prefix>` / `vth-<prefix>`).
    pub bridge_prefix: String,
    /// MTU applied to the mirror bridge ports; must match the node's jumbo setting.
    pub mtu: u32,
    /// Controller gRPC endpoint.
    pub controller_addr: String,
    /// Bounds on the adaptive report interval, in seconds.
    pub report_interval_min_secs: u64,
    pub report_interval_max_secs: u64,
    /// Container runtime flavor: "docker" or "containerd".
    pub runtime_flavor: String,
    /// Extra skip-set entries on top of the built-in defaults (substring match
    /// against image name, or a bare Kubernetes namespace name).
    pub skip_set_overrides: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            dataplane_socket_path: "/run/segment/dataplane.sock".to_string(),
            enforcer_namespace: "segment-enforcer".to_string(),
            bridge_prefix: "seg0".to_string(),
            mtu: 9000,
            controller_addr: "http://127.0.0.1:7443".to_string(),
            report_interval_min_secs: 5,
            report_interval_max_secs: 60,
            runtime_flavor: "docker".to_string(),
            skip_set_overrides: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from an explicit CLI path, or fall back to hardcoded defaults.
    /// Environment overrides are applied on top either way.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match cli_path {
            Some(path) => {
                tracing::info!(?path, "loading agent configuration");
                Self::from_toml_file(&path)
                    .map_err(|e| anyhow::anyhow!("failed to load config at {:?}: {}", path, e))?
            }
            None => {
                tracing::warn!("no --config given; using built-in agent defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SEGMENT_CONTROLLER_ADDR") {
            tracing::info!(%addr, "environment override: SEGMENT_CONTROLLER_ADDR");
            self.controller_addr = addr;
        }
        if let Ok(filter) = std::env::var("SEGMENT_LOG") {
            self.common.log_filter = filter;
        }
    }
}

/// Controller-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub common: CommonConfig,
    /// gRPC listen address for the `ControllerRpc` service.
    pub rpc_listen_addr: String,
    /// REST projection listen address (ambient, out of core scope per §1).
    pub rest_listen_addr: String,
    pub report_interval_default_secs: u64,
    pub max_entries_per_edge: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            rpc_listen_addr: "0.0.0.0:7443".to_string(),
            rest_listen_addr: "0.0.0.0:8080".to_string(),
            report_interval_default_secs: 5,
            max_entries_per_edge: 256,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match cli_path {
            Some(path) => {
                tracing::info!(?path, "loading controller configuration");
                Self::from_toml_file(&path)
                    .map_err(|e| anyhow::anyhow!("failed to load config at {:?}: {}", path, e))?
            }
            None => {
                tracing::warn!("no --config given; using built-in controller defaults");
                Self::default()
            }
        };
        if let Ok(filter) = std::env::var("SEGMENT_LOG") {
            config.common.log_filter = filter;
        }
        Ok(config)
    }
}
