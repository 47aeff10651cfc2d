//! Connection report records (spec §3) and the 5-tuple aggregation key used
//! by the flow aggregator (§4.4) and the topology graph merge (§4.7).

use crate::domain::policy::PolicyAction;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Key that two `Connection` records must share to be additively merged
/// (spec §3): `(clientWL, serverWL, serverIP, serverPort, proto)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub client_workload_id: String,
    pub server_workload_id: String,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub ip_proto: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub client_workload_id: String,
    pub server_workload_id: String,
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub client_port: u16,
    pub server_port: u16,
    pub ip_proto: u8,
    pub application_id: u32,
    pub bytes: u64,
    pub sessions: u64,
    pub first_seen_unix_ms: i64,
    pub last_seen_unix_ms: i64,
    pub threat_id: u32,
    pub severity: u32,
    pub policy_action: PolicyAction,
    pub policy_id: Option<u64>,
    pub ingress: bool,
    pub external_peer: bool,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            client_workload_id: self.client_workload_id.clone(),
            server_workload_id: self.server_workload_id.clone(),
            server_ip: self.server_ip,
            server_port: self.server_port,
            ip_proto: self.ip_proto,
        }
    }

    /// Additively merges `other` into `self` per the aggregation law (spec
    /// §3, §8 property 5): bytes/sessions sum, severity/policyAction take
    /// the max, lastSeen takes the max.
    pub fn merge(&mut self, other: &Connection) {
        self.bytes += other.bytes;
        self.sessions += other.sessions;
        self.severity = self.severity.max(other.severity);
        self.policy_action = self.policy_action.max(other.policy_action);
        self.last_seen_unix_ms = self.last_seen_unix_ms.max(other.last_seen_unix_ms);
        self.first_seen_unix_ms = self.first_seen_unix_ms.min(other.first_seen_unix_ms);
        if other.threat_id != 0 {
            self.threat_id = other.threat_id;
        }
    }
}

/// Threat-log record (spec §4.4): bypasses aggregation except for a 5s
/// per-source-MAC de-duplication window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub workload_id: String,
    pub peer_ip: IpAddr,
    pub threat_id: u32,
    pub severity: u32,
    pub reported_at_unix_ms: i64,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: u64, sessions: u64, severity: u32, action: PolicyAction) -> Connection {
        Connection {
            client_workload_id: "c".into(),
            server_workload_id: "s".into(),
            client_ip: "10.0.0.1".parse().unwrap(),
            server_ip: "10.0.0.2".parse().unwrap(),
            client_port: 4444,
            server_port: 80,
            ip_proto: 6,
            application_id: 0,
            bytes,
            sessions,
            first_seen_unix_ms: 0,
            last_seen_unix_ms: 0,
            threat_id: 0,
            severity,
            policy_action: action,
            policy_id: None,
            ingress: false,
            external_peer: false,
        }
    }

    #[test]
    fn merge_sums_bytes_and_sessions_and_maxes_severity_and_action() {
        let mut acc = sample(100, 1, 0, PolicyAction::Allow);
        acc.merge(&sample(250, 2, 2, PolicyAction::Violate));
        acc.merge(&sample(50, 1, 1, PolicyAction::Allow));

        assert_eq!(acc.bytes, 400);
        assert_eq!(acc.sessions, 4);
        assert_eq!(acc.severity, 2);
        assert_eq!(acc.policy_action, PolicyAction::Violate);
    }
}
