//! gRPC surface: [`ControllerRpc`] as generated from `controller.proto`.
//!
//! Grounded on the teacher's `AegisRuntimeService`/`start_grpc_server` shape:
//! a struct holding `Arc` state, one `impl` of the generated service trait,
//! and a free function that builds and serves the `tonic` server.

use crate::state::AppState;
use chrono::Utc;
use segment_core::domain::connection::{Connection, ThreatRecord};
use segment_core::domain::policy::{PolicyAction as DomainAction, PolicyRule, WorkloadMode, WorkloadPolicy};
use segment_core::graph::NodeId;
use segment_proto::controller::v1::controller_rpc_server::{ControllerRpc, ControllerRpcServer};
use segment_proto::controller::v1::{
    self, GetPoliciesRequest, GetPoliciesResponse, HeartbeatAck, HeartbeatRequest, PolicyRuleWire,
    RegisterAck, RegisterRequest, ReportAck, ReportConnectionsRequest, ReportThreatsRequest,
    ReportWorkloadRequest, WorkloadPolicyWire,
};
use std::net::IpAddr;
use std::str::FromStr;
use tonic::{Request, Response, Status};

pub struct ControllerRpcService {
    state: AppState,
}

impl ControllerRpcService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn into_server(self) -> ControllerRpcServer<Self> {
        ControllerRpcServer::new(self)
    }

    fn report_interval(&self) -> u32 {
        self.state.config.report_interval_default_secs as u32
    }
}

fn action_to_wire(action: DomainAction) -> i32 {
    match action {
        DomainAction::Open => v1::PolicyAction::Open as i32,
        DomainAction::Allow => v1::PolicyAction::Allow as i32,
        DomainAction::Deny => v1::PolicyAction::Deny as i32,
        DomainAction::Violate => v1::PolicyAction::Violate as i32,
    }
}

fn mode_to_wire(mode: WorkloadMode) -> i32 {
    match mode {
        WorkloadMode::Monitor => v1::WorkloadMode::Monitor as i32,
        WorkloadMode::Protect => v1::WorkloadMode::Protect as i32,
    }
}

fn rule_to_wire(rule: &PolicyRule) -> PolicyRuleWire {
    PolicyRuleWire {
        id: rule.id as u32,
        ingress: rule.ingress,
        src: rule.src.start.to_string(),
        src_end: rule.src.end.to_string(),
        dst: rule.dst.start.to_string(),
        dst_end: rule.dst.end.to_string(),
        proto: rule.proto as u32,
        dport: rule.dport.start as u32,
        dport_end: rule.dport.end as u32,
        application_id: rule.application_id.unwrap_or(0),
        action: action_to_wire(rule.action),
    }
}

fn policy_to_wire(policy: &WorkloadPolicy) -> WorkloadPolicyWire {
    WorkloadPolicyWire {
        workload_id: policy.workload_id.clone(),
        mode: mode_to_wire(policy.mode),
        default_action: action_to_wire(policy.default_action),
        rules: policy.rules.iter().map(rule_to_wire).collect(),
        version: policy.version,
    }
}

fn parse_ip(s: &str) -> Result<IpAddr, Status> {
    IpAddr::from_str(s).map_err(|e| Status::invalid_argument(format!("invalid ip {s:?}: {e}")))
}

#[tonic::async_trait]
impl ControllerRpc for ControllerRpcService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterAck>, Status> {
        let req = request.into_inner();
        let agent = req.agent.unwrap_or_default();
        tracing::info!(agent_id = %agent.agent_id, host_id = %agent.host_id, "agent registered");
        Ok(Response::new(RegisterAck {
            request_id: req.request_id,
            report_interval_seconds: self.report_interval(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatAck>, Status> {
        let req = request.into_inner();
        Ok(Response::new(HeartbeatAck {
            request_id: req.request_id,
        }))
    }

    async fn report_connections(
        &self,
        request: Request<ReportConnectionsRequest>,
    ) -> Result<Response<ReportAck>, Status> {
        let req = request.into_inner();
        let now = Utc::now().timestamp_millis();

        for rec in &req.connections {
            let client_ip = parse_ip(&rec.client_ip)?;
            let server_ip = parse_ip(&rec.server_ip)?;
            let action = match v1::PolicyAction::try_from(rec.policy_action as i32)
                .unwrap_or(v1::PolicyAction::Unspecified)
            {
                v1::PolicyAction::Allow => DomainAction::Allow,
                v1::PolicyAction::Deny => DomainAction::Deny,
                v1::PolicyAction::Violate => DomainAction::Violate,
                _ => DomainAction::Open,
            };

            let conn = Connection {
                client_workload_id: rec.client_workload_id.clone(),
                server_workload_id: rec.server_workload_id.clone(),
                client_ip,
                server_ip,
                client_port: rec.client_port as u16,
                server_port: rec.server_port as u16,
                ip_proto: rec.ip_proto as u8,
                application_id: rec.application_id,
                bytes: rec.bytes,
                sessions: rec.sessions,
                first_seen_unix_ms: rec.first_seen_unix_ms,
                last_seen_unix_ms: rec.last_seen_unix_ms,
                threat_id: rec.threat_id,
                severity: rec.severity,
                policy_action: action,
                policy_id: if rec.policy_id == 0 {
                    None
                } else {
                    Some(rec.policy_id as u64)
                },
                ingress: rec.ingress,
                external_peer: rec.external_peer,
            };

            let from_id = NodeId::workload(&conn.client_workload_id);
            let to_id = if conn.external_peer {
                NodeId::ip(conn.server_ip)
            } else {
                NodeId::workload(&conn.server_workload_id)
            };
            self.state
                .graph
                .merge_connection(&conn, from_id, to_id, now)
                .await;
        }

        metrics::counter!("segment_graph_edges").increment(req.connections.len() as u64);

        Ok(Response::new(ReportAck {
            request_id: req.request_id,
            report_interval_seconds: self.report_interval(),
        }))
    }

    async fn report_threats(
        &self,
        request: Request<ReportThreatsRequest>,
    ) -> Result<Response<ReportAck>, Status> {
        let req = request.into_inner();
        for t in &req.threats {
            let peer_ip = parse_ip(&t.peer_ip)?;
            let record = ThreatRecord {
                workload_id: t.workload_id.clone(),
                peer_ip,
                threat_id: t.threat_id,
                severity: t.severity,
                reported_at_unix_ms: t.reported_at_unix_ms,
                count: t.count,
            };
            tracing::warn!(
                workload_id = %record.workload_id,
                peer_ip = %record.peer_ip,
                threat_id = record.threat_id,
                severity = record.severity,
                "threat reported"
            );
        }
        Ok(Response::new(ReportAck {
            request_id: req.request_id,
            report_interval_seconds: self.report_interval(),
        }))
    }

    async fn report_workload(
        &self,
        request: Request<ReportWorkloadRequest>,
    ) -> Result<Response<ReportAck>, Status> {
        let req = request.into_inner();
        if let Some(workload) = &req.workload {
            self.state
                .graph
                .ensure_node(
                    &NodeId::workload(&workload.workload_id),
                    segment_core::graph::NodeAttrs {
                        alias: Some(workload.name.clone()),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(Response::new(ReportAck {
            request_id: req.request_id,
            report_interval_seconds: self.report_interval(),
        }))
    }

    async fn get_policies(
        &self,
        request: Request<GetPoliciesRequest>,
    ) -> Result<Response<GetPoliciesResponse>, Status> {
        let req = request.into_inner();
        let policies = if req.workload_ids.is_empty() {
            self.state.policies.all()
        } else {
            self.state.policies.get_many(&req.workload_ids)
        };

        Ok(Response::new(GetPoliciesResponse {
            request_id: req.request_id,
            policies: policies.iter().map(policy_to_wire).collect(),
        }))
    }
}

pub async fn start_grpc_server(addr: std::net::SocketAddr, state: AppState) -> anyhow::Result<()> {
    let service = ControllerRpcService::new(state).into_server();
    tracing::info!(%addr, "starting controller gRPC server");
    tonic::transport::Server::builder()
        .add_service(service)
        .serve(addr)
        .await?;
    Ok(())
}
