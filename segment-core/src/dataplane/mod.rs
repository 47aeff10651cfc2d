//! Data-plane wire types (spec §4.5, §6): length-delimited JSON messages
//! over an `AF_UNIX SOCK_DGRAM` socket, max 8 KiB per message.

use crate::domain::connection::{Connection, ThreatRecord};
use crate::domain::intercept::MacAddr;
use crate::domain::policy::WorkloadPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Maximum encoded message size accepted on the data-plane socket (spec §6).
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfigPayload {
    pub add: bool,
    pub ep_mac: MacAddr,
    pub ucmac: MacAddr,
    pub bcmac: MacAddr,
    pub tap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPairConfigPayload {
    pub in_port: String,
    pub ex_port: String,
    pub container_mac: MacAddr,
    pub pair_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfigPayload {
    pub cidrs: Vec<ipnet::IpNet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfigPayload {
    pub policy: WorkloadPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAddrMapPayload {
    pub map: std::collections::HashMap<String, Vec<ipnet::IpNet>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfigEntry {
    pub port: u16,
    pub proto: u8,
    pub application_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfigPayload {
    pub ep_mac: MacAddr,
    pub apps: Vec<AppConfigEntry>,
}

/// One message on the data-plane socket, tagged by `Kind` discriminator
/// (spec §4.5, §6). Variants above the line flow agent -> DP; below flow
/// DP -> agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DataPlaneMessage {
    MacConfig(MacConfigPayload),
    PortPairConfig(PortPairConfigPayload),
    SubnetConfig(SubnetConfigPayload),
    PolicyConfig(PolicyConfigPayload),
    PolicyAddrMap(PolicyAddrMapPayload),
    AppConfig(AppConfigPayload),
    Connection(Connection),
    ThreatLog(ThreatRecord),
    KeepAlive,
}

impl DataPlaneMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// State the data-plane client re-pushes, in order, on every (re)connect
/// (spec §4.5): MACs, pairs, subnets, policies, apps.
#[derive(Debug, Clone, Default)]
pub struct DataPlaneFullConfig {
    pub macs: Vec<MacConfigPayload>,
    pub pairs: Vec<PortPairConfigPayload>,
    pub subnets: Option<SubnetConfigPayload>,
    pub policies: Vec<PolicyConfigPayload>,
    pub policy_addr_map: Option<PolicyAddrMapPayload>,
    pub apps: Vec<AppConfigPayload>,
}

impl DataPlaneFullConfig {
    /// Produces the ordered message sequence re-sent on reconnect: MACs,
    /// pairs, subnets, policies, the policy-address map, apps (spec §4.3
    /// "the policy-address map ... is also diffed and re-pushed", grouped
    /// with the policy push it resolves group references for).
    pub fn as_messages(&self) -> Vec<DataPlaneMessage> {
        let mut out = Vec::new();
        out.extend(self.macs.iter().cloned().map(DataPlaneMessage::MacConfig));
        out.extend(self.pairs.iter().cloned().map(DataPlaneMessage::PortPairConfig));
        if let Some(subnets) = &self.subnets {
            out.push(DataPlaneMessage::SubnetConfig(subnets.clone()));
        }
        out.extend(self.policies.iter().cloned().map(DataPlaneMessage::PolicyConfig));
        if let Some(policy_addr_map) = &self.policy_addr_map {
            out.push(DataPlaneMessage::PolicyAddrMap(policy_addr_map.clone()));
        }
        out.extend(self.apps.iter().cloned().map(DataPlaneMessage::AppConfig));
        out
    }
}

/// A container-runtime lifecycle event (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerEventKind {
    Start,
    Stop,
    Delete,
    SocketError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub kind: ContainerEventKind,
    pub id: String,
    pub pid: Option<u32>,
}

/// Resolves a peer IP for the topology graph when no workload id is known
/// (spec §4.7: "fall back to `ip.<addr>`").
pub fn fallback_node_key(ip: IpAddr) -> String {
    ip.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_round_trips() {
        let msg = DataPlaneMessage::KeepAlive;
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() <= MAX_MESSAGE_SIZE);
        let decoded = DataPlaneMessage::decode(&encoded).unwrap();
        assert!(matches!(decoded, DataPlaneMessage::KeepAlive));
    }

    #[test]
    fn full_config_replays_in_order() {
        let cfg = DataPlaneFullConfig {
            macs: vec![MacConfigPayload {
                add: true,
                ep_mac: MacAddr::ucmac(1),
                ucmac: MacAddr::ucmac(1),
                bcmac: MacAddr::bcmac(1),
                tap: true,
            }],
            pairs: vec![],
            subnets: Some(SubnetConfigPayload { cidrs: vec![] }),
            policies: vec![],
            policy_addr_map: None,
            apps: vec![],
        };
        let messages = cfg.as_messages();
        assert!(matches!(messages[0], DataPlaneMessage::MacConfig(_)));
        assert!(matches!(messages[1], DataPlaneMessage::SubnetConfig(_)));
    }

    #[test]
    fn policy_addr_map_replays_after_policies() {
        let cfg = DataPlaneFullConfig {
            macs: vec![],
            pairs: vec![],
            subnets: None,
            policies: vec![PolicyConfigPayload {
                policy: crate::domain::policy::WorkloadPolicy::new(
                    "wl-1".to_string(),
                    crate::domain::policy::WorkloadMode::Monitor,
                ),
            }],
            policy_addr_map: Some(PolicyAddrMapPayload {
                map: std::collections::HashMap::from([("web".to_string(), vec![])]),
            }),
            apps: vec![],
        };
        let messages = cfg.as_messages();
        assert!(matches!(messages[0], DataPlaneMessage::PolicyConfig(_)));
        assert!(matches!(messages[1], DataPlaneMessage::PolicyAddrMap(_)));
    }
}
