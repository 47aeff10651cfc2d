//! The Controller-side topology graph (spec §4.7, §9): a directed
//! multigraph over three link classes, stored as a per-node adjacency map
//! so an edge insertion can update both endpoints under one write lock
//! (spec §9 design note).

use crate::domain::connection::Connection;
use crate::domain::policy::PolicyAction;
use crate::graph::edge::{EdgeAttr, EntryKey, GraphEdgeAttr, GraphEntry, LinkClass, PolicyEdgeAttr, PortSpec};
use crate::graph::node::{NodeAttrs, NodeId};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the link-change broadcast channel (spec §4.7 invariant:
/// "link-creation and deletion fire callbacks"). A lagging subscriber just
/// misses old events on its next recv, per `broadcast`'s own semantics;
/// nothing here depends on every event being observed.
const LINK_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fired after a link (edge) is created or removed between two nodes, so a
/// REST-side cache can invalidate its view of those nodes (spec §4.7).
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub class: LinkClass,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Class {
    Policy,
    Graph,
    Attr,
}

impl From<crate::graph::edge::LinkClass> for Class {
    fn from(c: crate::graph::edge::LinkClass) -> Self {
        use crate::graph::edge::LinkClass::*;
        match c {
            Policy => Class::Policy,
            Graph => Class::Graph,
            Attr => Class::Attr,
        }
    }
}

#[derive(Default)]
struct NodeRecord {
    outgoing: HashMap<Class, HashMap<NodeId, EdgeAttr>>,
    incoming: HashMap<Class, HashMap<NodeId, EdgeAttr>>,
}

/// Hashes an IP address into the 64-bit form used inside a `graph` edge's
/// 5-tuple entry key (spec GLOSSARY: "hashedClientIP"/"hashedServerIP").
pub fn hash_ip(ip: IpAddr) -> u64 {
    let mut hasher = Sha256::new();
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

#[derive(Debug, Clone)]
pub struct EndpointView {
    pub id: NodeId,
    pub attrs: NodeAttrs,
}

#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub from: NodeId,
    pub to: NodeId,
    pub bytes: u64,
    pub sessions: u64,
    pub severity: u32,
    pub policy_action: Option<PolicyAction>,
}

#[derive(Debug, Clone)]
pub struct ConversationDetail {
    pub summary: ConversationSummary,
    pub entries: Vec<(EntryKey, GraphEntry)>,
}

/// The topology graph. Subscribers registered via [`TopologyGraph::subscribe`]
/// receive a [`LinkEvent`] after a link's first creation so the REST
/// projection can invalidate caches (spec §4.7 invariant).
pub struct TopologyGraph {
    inner: RwLock<HashMap<NodeId, NodeRecord>>,
    max_entries_per_edge: usize,
    link_events: broadcast::Sender<LinkEvent>,
}

impl TopologyGraph {
    pub fn new(max_entries_per_edge: usize) -> Self {
        let (link_events, _) = broadcast::channel(LINK_EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(HashMap::new()),
            max_entries_per_edge,
            link_events,
        }
    }

    /// Subscribes to link-creation/deletion events (spec §4.7 invariant).
    /// Dropping the receiver unsubscribes; a receiver that falls behind the
    /// channel capacity just lags, per `broadcast`'s own semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }

    fn notify_link_created(&self, class: LinkClass, from: NodeId, to: NodeId) {
        // No receivers is the common case (nothing subscribed yet); ignore.
        let _ = self.link_events.send(LinkEvent { class, from, to });
    }

    fn ensure_node_locked(g: &mut HashMap<NodeId, NodeRecord>, id: &NodeId, attrs: NodeAttrs) {
        if g.contains_key(id) {
            return;
        }
        let mut rec = NodeRecord::default();
        rec.outgoing
            .entry(Class::Attr)
            .or_default()
            .insert(id.clone(), EdgeAttr::Attr(attrs));
        g.insert(id.clone(), rec);
    }

    pub async fn ensure_node(&self, id: &NodeId, attrs: NodeAttrs) {
        let mut g = self.inner.write().await;
        Self::ensure_node_locked(&mut g, id, attrs);
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Merges one inbound `Connection` report into the `graph`-class edge
    /// between `from_id` and `to_id` (spec §4.7). Self-loops (`from_id ==
    /// to_id`) are ignored per spec §9's open question resolution. Both
    /// endpoints are materialized with their `attr` self-edge if new.
    pub async fn merge_connection(
        &self,
        conn: &Connection,
        from_id: NodeId,
        to_id: NodeId,
        observed_at_unix_ms: i64,
    ) {
        if from_id == to_id {
            return;
        }
        let mut g = self.inner.write().await;
        Self::ensure_node_locked(&mut g, &from_id, NodeAttrs::default());
        Self::ensure_node_locked(&mut g, &to_id, NodeAttrs::default());

        let key = EntryKey {
            port: conn.server_port,
            ip_proto: conn.ip_proto,
            application_id: conn.application_id,
            client_ip_hash: hash_ip(conn.client_ip),
            server_ip_hash: hash_ip(conn.server_ip),
        };

        let mut created = false;
        let edge_attr = g
            .get_mut(&from_id)
            .expect("just ensured")
            .outgoing
            .entry(Class::Graph)
            .or_default()
            .entry(to_id.clone())
            .or_insert_with(|| {
                created = true;
                EdgeAttr::Graph(GraphEdgeAttr::default())
            });

        if let EdgeAttr::Graph(ga) = edge_attr {
            let entry = ga.entries.entry(key).or_insert_with(|| GraphEntry {
                bytes: 0,
                sessions: 0,
                severity: 0,
                policy_action: PolicyAction::Open,
                threat_id: 0,
                policy_id: None,
                last_seen_unix_ms: observed_at_unix_ms,
                fqdn: None,
            });
            entry.merge(
                conn.bytes,
                conn.sessions,
                conn.severity,
                conn.policy_action,
                conn.threat_id,
                conn.policy_id,
                observed_at_unix_ms.max(conn.last_seen_unix_ms),
                None,
            );
            let margin = (self.max_entries_per_edge / 8).max(1);
            ga.evict_to(self.max_entries_per_edge, margin);
        }

        let mirrored = g
            .get(&from_id)
            .unwrap()
            .outgoing
            .get(&Class::Graph)
            .unwrap()
            .get(&to_id)
            .unwrap()
            .clone();
        g.get_mut(&to_id)
            .unwrap()
            .incoming
            .entry(Class::Graph)
            .or_default()
            .insert(from_id.clone(), mirrored);

        drop(g);
        if created {
            self.notify_link_created(LinkClass::Graph, from_id, to_id);
        }
    }

    /// Creates or updates the `policy`-class edge between `from_id` and
    /// `to_id`, recording that `port` (with `proto`/`app`) is authorized.
    pub async fn record_policy_link(
        &self,
        from_id: NodeId,
        to_id: NodeId,
        proto: u8,
        port: u16,
        application_id: Option<u32>,
        now_unix_ms: i64,
    ) {
        if from_id == to_id {
            return;
        }
        let mut g = self.inner.write().await;
        Self::ensure_node_locked(&mut g, &from_id, NodeAttrs::default());
        Self::ensure_node_locked(&mut g, &to_id, NodeAttrs::default());

        let mut created = false;
        let edge_attr = g
            .get_mut(&from_id)
            .unwrap()
            .outgoing
            .entry(Class::Policy)
            .or_default()
            .entry(to_id.clone())
            .or_insert_with(|| {
                created = true;
                EdgeAttr::Policy(PolicyEdgeAttr::default())
            });

        if let EdgeAttr::Policy(pa) = edge_attr {
            pa.ports.insert(PortSpec { proto, port });
            pa.ports_seen.insert(PortSpec { proto, port });
            if let Some(app) = application_id {
                pa.apps.insert(app);
            }
            pa.last_recalc_at_unix_ms = now_unix_ms;
        }

        let mirrored = g
            .get(&from_id)
            .unwrap()
            .outgoing
            .get(&Class::Policy)
            .unwrap()
            .get(&to_id)
            .unwrap()
            .clone();
        g.get_mut(&to_id)
            .unwrap()
            .incoming
            .entry(Class::Policy)
            .or_default()
            .insert(from_id.clone(), mirrored);

        drop(g);
        if created {
            self.notify_link_created(LinkClass::Policy, from_id, to_id);
        }
    }

    /// `ListEndpoints(view, acl)`: every node visible under `acl`.
    pub async fn list_endpoints(&self, acl: impl Fn(&NodeId) -> bool) -> Vec<EndpointView> {
        let g = self.inner.read().await;
        g.iter()
            .filter(|(id, _)| acl(id))
            .filter_map(|(id, rec)| {
                rec.outgoing.get(&Class::Attr)?.get(id).map(|attr| {
                    let attrs = match attr {
                        EdgeAttr::Attr(a) => a.clone(),
                        _ => NodeAttrs::default(),
                    };
                    EndpointView {
                        id: id.clone(),
                        attrs,
                    }
                })
            })
            .collect()
    }

    /// `ListConversations(acl)`: every node pair with a `graph` edge where
    /// both endpoints pass `acl`.
    pub async fn list_conversations(
        &self,
        acl: impl Fn(&NodeId) -> bool,
    ) -> Vec<ConversationSummary> {
        let g = self.inner.read().await;
        let mut out = Vec::new();
        for (from, rec) in g.iter() {
            if !acl(from) {
                continue;
            }
            if let Some(edges) = rec.outgoing.get(&Class::Graph) {
                for (to, attr) in edges {
                    if !acl(to) {
                        continue;
                    }
                    if let EdgeAttr::Graph(ga) = attr {
                        out.push(ConversationSummary {
                            from: from.clone(),
                            to: to.clone(),
                            bytes: ga.bytes,
                            sessions: ga.sessions,
                            severity: ga.severity,
                            policy_action: ga.policy_action,
                        });
                    }
                }
            }
        }
        out
    }

    /// `GetConversationDetail(u, v, acl)`.
    pub async fn conversation_detail(
        &self,
        from: &NodeId,
        to: &NodeId,
        acl: impl Fn(&NodeId) -> bool,
    ) -> Option<ConversationDetail> {
        if !acl(from) || !acl(to) {
            return None;
        }
        let g = self.inner.read().await;
        let attr = g.get(from)?.outgoing.get(&Class::Graph)?.get(to)?;
        if let EdgeAttr::Graph(ga) = attr {
            Some(ConversationDetail {
                summary: ConversationSummary {
                    from: from.clone(),
                    to: to.clone(),
                    bytes: ga.bytes,
                    sessions: ga.sessions,
                    severity: ga.severity,
                    policy_action: ga.policy_action,
                },
                entries: ga.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::PolicyAction;

    fn sample_connection(bytes: u64, sessions: u64, severity: u32, action: PolicyAction) -> Connection {
        Connection {
            client_workload_id: "wl-client".into(),
            server_workload_id: "wl-server".into(),
            client_ip: "10.0.0.1".parse().unwrap(),
            server_ip: "10.0.0.2".parse().unwrap(),
            client_port: 5555,
            server_port: 443,
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

    #[tokio::test]
    async fn merge_materializes_both_endpoints() {
        let graph = TopologyGraph::new(256);
        let from = NodeId::workload("c1");
        let to = NodeId::workload("s1");
        graph
            .merge_connection(&sample_connection(100, 1, 0, PolicyAction::Allow), from.clone(), to.clone(), 1)
            .await;
        assert_eq!(graph.node_count().await, 2);
    }

    #[tokio::test]
    async fn merge_fires_a_link_event_only_on_first_materialization() {
        let graph = TopologyGraph::new(256);
        let mut events = graph.subscribe();
        let from = NodeId::workload("c1");
        let to = NodeId::workload("s1");

        graph
            .merge_connection(&sample_connection(100, 1, 0, PolicyAction::Allow), from.clone(), to.clone(), 1)
            .await;
        let event = events.try_recv().expect("first merge should fire a link event");
        assert_eq!(event.class, LinkClass::Graph);
        assert_eq!(event.from, from);
        assert_eq!(event.to, to);

        graph
            .merge_connection(&sample_connection(50, 1, 0, PolicyAction::Allow), from.clone(), to.clone(), 2)
            .await;
        assert!(
            events.try_recv().is_err(),
            "re-merging an existing edge must not fire a second event"
        );
    }

    #[tokio::test]
    async fn merge_ignores_self_loops() {
        let graph = TopologyGraph::new(256);
        let id = NodeId::workload("c1");
        graph
            .merge_connection(&sample_connection(100, 1, 0, PolicyAction::Allow), id.clone(), id.clone(), 1)
            .await;
        assert_eq!(graph.node_count().await, 0);
    }

    #[tokio::test]
    async fn merge_is_associative_modulo_last_seen(
    ) {
        let from = NodeId::workload("c1");
        let to = NodeId::workload("s1");

        let graph_a = TopologyGraph::new(256);
        graph_a
            .merge_connection(&sample_connection(10, 1, 0, PolicyAction::Allow), from.clone(), to.clone(), 1)
            .await;
        graph_a
            .merge_connection(&sample_connection(20, 1, 1, PolicyAction::Violate), from.clone(), to.clone(), 2)
            .await;
        graph_a
            .merge_connection(&sample_connection(30, 1, 2, PolicyAction::Deny), from.clone(), to.clone(), 3)
            .await;

        let graph_b = TopologyGraph::new(256);
        graph_b
            .merge_connection(&sample_connection(10, 1, 0, PolicyAction::Allow), from.clone(), to.clone(), 1)
            .await;
        graph_b
            .merge_connection(&sample_connection(20, 1, 1, PolicyAction::Violate), from.clone(), to.clone(), 2)
            .await;
        graph_b
            .merge_connection(&sample_connection(30, 1, 2, PolicyAction::Deny), from.clone(), to.clone(), 3)
            .await;

        let detail_a = graph_a.conversation_detail(&from, &to, |_| true).await.unwrap();
        let detail_b = graph_b.conversation_detail(&from, &to, |_| true).await.unwrap();
        assert_eq!(detail_a.summary.bytes, detail_b.summary.bytes);
        assert_eq!(detail_a.summary.sessions, detail_b.summary.sessions);
        assert_eq!(detail_a.summary.severity, detail_b.summary.severity);
    }
}
