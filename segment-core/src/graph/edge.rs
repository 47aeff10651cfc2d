//! Topology graph edges: three link classes each carrying a class-specific
//! attribute (spec §3, §4.7).

use crate::domain::policy::PolicyAction;
use crate::graph::node::NodeAttrs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkClass {
    /// Authorized communication, irrespective of observed traffic.
    Policy,
    /// Observed traffic.
    Graph,
    /// Node metadata, carried on a self-loop.
    Attr,
}

/// The 5-tuple key within a `graph` edge's `entries` map (spec §4.7,
/// GLOSSARY): `(port, ipProto, application, hashedClientIP, hashedServerIP)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntryKey {
    pub port: u16,
    pub ip_proto: u8,
    pub application_id: u32,
    pub client_ip_hash: u64,
    pub server_ip_hash: u64,
}

/// One aggregated observation bucket within a `graph` edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntry {
    pub bytes: u64,
    pub sessions: u64,
    pub severity: u32,
    pub policy_action: PolicyAction,
    pub threat_id: u32,
    pub policy_id: Option<u64>,
    pub last_seen_unix_ms: i64,
    pub fqdn: Option<String>,
}

impl GraphEntry {
    /// Merges an inbound observation into this entry in place (spec §4.7
    /// merge step): adds bytes/sessions, maxes severity, updates
    /// policyAction by priority, refreshes lastSeenAt, updates FQDN if
    /// provided.
    pub fn merge(&mut self, bytes: u64, sessions: u64, severity: u32, action: PolicyAction, threat_id: u32, policy_id: Option<u64>, seen_at_unix_ms: i64, fqdn: Option<&str>) {
        self.bytes += bytes;
        self.sessions += sessions;
        self.severity = self.severity.max(severity);
        self.policy_action = self.policy_action.max(action);
        if threat_id != 0 {
            self.threat_id = threat_id;
        }
        if policy_id.is_some() {
            self.policy_id = policy_id;
        }
        self.last_seen_unix_ms = self.last_seen_unix_ms.max(seen_at_unix_ms);
        if let Some(fqdn) = fqdn {
            self.fqdn = Some(fqdn.to_string());
        }
    }
}

/// `graph`-class edge attribute: aggregated totals recomputed from
/// `entries` after each merge, plus the per-5-tuple entry map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphEdgeAttr {
    pub bytes: u64,
    pub sessions: u64,
    pub severity: u32,
    pub policy_action: Option<PolicyAction>,
    pub entries: BTreeMap<EntryKey, GraphEntry>,
}

impl GraphEdgeAttr {
    /// Recomputes `bytes`/`sessions`/`severity`/`policyAction` from
    /// `entries` (spec §4.7: "recomputed ... after each merge").
    pub fn reaggregate(&mut self) {
        self.bytes = 0;
        self.sessions = 0;
        self.severity = 0;
        self.policy_action = None;
        for entry in self.entries.values() {
            self.bytes += entry.bytes;
            self.sessions += entry.sessions;
            self.severity = self.severity.max(entry.severity);
            self.policy_action = Some(match self.policy_action {
                Some(current) => current.max(entry.policy_action),
                None => entry.policy_action,
            });
        }
    }

    /// Drops the lowest-`lastSeenAt` entries until at
    /// `max_entries - margin` (spec §4.7 eviction), then re-aggregates.
    pub fn evict_to(&mut self, max_entries: usize, margin: usize) {
        if self.entries.len() <= max_entries {
            return;
        }
        let target = max_entries.saturating_sub(margin);
        let mut by_age: Vec<(EntryKey, i64)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.last_seen_unix_ms))
            .collect();
        by_age.sort_by_key(|(_, t)| *t);
        let to_drop = self.entries.len().saturating_sub(target);
        for (key, _) in by_age.into_iter().take(to_drop) {
            self.entries.remove(&key);
        }
        self.reaggregate();
    }
}

/// A single port spec contributing to a `policy`-class edge, e.g.
/// `tcp/443`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PortSpec {
    pub proto: u8,
    pub port: u16,
}

/// `policy`-class edge attribute: ports/apps this link authorizes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyEdgeAttr {
    pub ports: std::collections::BTreeSet<PortSpec>,
    pub apps: std::collections::BTreeSet<u32>,
    pub ports_seen: std::collections::BTreeSet<PortSpec>,
    pub last_recalc_at_unix_ms: i64,
}

/// The edge-attribute payload, specific to the edge's `LinkClass`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EdgeAttr {
    Graph(GraphEdgeAttr),
    Policy(PolicyEdgeAttr),
    Attr(NodeAttrs),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bytes: u64, sessions: u64, severity: u32, action: PolicyAction, seen: i64) -> GraphEntry {
        GraphEntry {
            bytes,
            sessions,
            severity,
            policy_action: action,
            threat_id: 0,
            policy_id: None,
            last_seen_unix_ms: seen,
            fqdn: None,
        }
    }

    #[test]
    fn reaggregate_sums_all_entries() {
        let mut attr = GraphEdgeAttr::default();
        attr.entries.insert(
            EntryKey {
                port: 80,
                ip_proto: 6,
                application_id: 0,
                client_ip_hash: 1,
                server_ip_hash: 2,
            },
            entry(100, 1, 0, PolicyAction::Allow, 10),
        );
        attr.entries.insert(
            EntryKey {
                port: 443,
                ip_proto: 6,
                application_id: 0,
                client_ip_hash: 1,
                server_ip_hash: 2,
            },
            entry(250, 2, 2, PolicyAction::Violate, 20),
        );
        attr.reaggregate();
        assert_eq!(attr.bytes, 350);
        assert_eq!(attr.sessions, 3);
        assert_eq!(attr.severity, 2);
        assert_eq!(attr.policy_action, Some(PolicyAction::Violate));
    }

    #[test]
    fn evict_to_drops_oldest_first() {
        let mut attr = GraphEdgeAttr::default();
        for i in 0..5u16 {
            attr.entries.insert(
                EntryKey {
                    port: i,
                    ip_proto: 6,
                    application_id: 0,
                    client_ip_hash: 0,
                    server_ip_hash: 0,
                },
                entry(10, 1, 0, PolicyAction::Allow, i as i64),
            );
        }
        attr.evict_to(3, 1);
        assert_eq!(attr.entries.len(), 2);
        assert!(!attr.entries.contains_key(&EntryKey {
            port: 0,
            ip_proto: 6,
            application_id: 0,
            client_ip_hash: 0,
            server_ip_hash: 0,
        }));
    }
}
