//! Flow aggregator (spec §4.4): a bounded, insert-or-merge connection map
//! flushed on a timer, plus the threat-log dedup path.

use parking_lot::Mutex;
use segment_core::domain::connection::{Connection, ConnectionKey, ThreatRecord};
use segment_core::domain::policy::PolicyAction;
use std::collections::HashMap;

/// Capacity of `connectionMap` (spec §4.4).
pub const MAX_ENTRIES: usize = 131_072;
/// Max entries drained per flush call (spec §4.4).
pub const FLUSH_BATCH_MAX: usize = 512;
/// Threat de-duplication window, in milliseconds (spec §4.4: "5-second
/// per-source-MAC de-duplication").
const THREAT_DEDUP_WINDOW_MS: i64 = 5_000;

struct Inner {
    connections: HashMap<ConnectionKey, Connection>,
    threats: HashMap<(String, u32), ThreatRecord>,
}

pub struct FlowAggregator {
    inner: Mutex<Inner>,
}

/// True if `action` should be prioritized ahead of plain allow/open traffic
/// for flushing and for eviction protection (spec §4.4, §8 property 6).
fn is_priority(c: &Connection) -> bool {
    matches!(c.policy_action, PolicyAction::Violate | PolicyAction::Deny) || c.threat_id != 0
}

impl FlowAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                threats: HashMap::new(),
            }),
        }
    }

    /// Inserts or merges one connection record (spec §4.4 "insert or add to
    /// an existing entry"). Applies the overflow policy if the map is at
    /// capacity and this is a new key.
    pub fn record_connection(&self, conn: Connection) {
        let mut inner = self.inner.lock();
        let key = conn.key();

        if let Some(existing) = inner.connections.get_mut(&key) {
            existing.merge(&conn);
            return;
        }

        if inner.connections.len() >= MAX_ENTRIES {
            if is_priority(&conn) {
                // Evict the oldest allow/open entry to make room (spec
                // §4.4 "Overflow policy").
                let victim = inner
                    .connections
                    .iter()
                    .filter(|(_, c)| !is_priority(c))
                    .min_by_key(|(_, c)| c.last_seen_unix_ms)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(victim) => {
                        inner.connections.remove(&victim);
                    }
                    None => {
                        // No low-priority victim exists; every live entry is
                        // already priority traffic, so this insert is dropped
                        // rather than evicting a record property 6 protects.
                        metrics::counter!("segment_aggregator_drops_total").increment(1);
                        return;
                    }
                }
            } else {
                metrics::counter!("segment_aggregator_drops_total").increment(1);
                return;
            }
        }

        inner.connections.insert(key, conn);
    }

    /// Records a threat, applying the 5s per-(workload, threat id)
    /// de-duplication window (spec §4.4). Returns `true` if this report was
    /// suppressed as a duplicate.
    pub fn record_threat(&self, threat: ThreatRecord) -> bool {
        let mut inner = self.inner.lock();
        let dedup_key = (threat.workload_id.clone(), threat.threat_id);
        if let Some(existing) = inner.threats.get_mut(&dedup_key) {
            if threat.reported_at_unix_ms - existing.reported_at_unix_ms < THREAT_DEDUP_WINDOW_MS {
                existing.count += threat.count;
                existing.reported_at_unix_ms = threat.reported_at_unix_ms;
                return true;
            }
        }
        inner.threats.insert(dedup_key, threat);
        false
    }

    /// Drains up to [`FLUSH_BATCH_MAX`] entries, priority entries first
    /// (spec §4.4 "Flush").
    pub fn drain_batch(&self) -> Vec<Connection> {
        let mut inner = self.inner.lock();
        if inner.connections.is_empty() {
            return Vec::new();
        }

        let mut keys: Vec<ConnectionKey> = inner.connections.keys().cloned().collect();
        keys.sort_by_key(|k| {
            let priority = inner.connections.get(k).map(is_priority).unwrap_or(false);
            std::cmp::Reverse(priority)
        });
        keys.truncate(FLUSH_BATCH_MAX);

        keys.into_iter()
            .filter_map(|k| inner.connections.remove(&k))
            .collect()
    }

    /// Re-inserts entries that failed to ship over RPC (spec §4.4 "On
    /// transport failure, re-insert the drained entries"), applying the
    /// same overflow policy as a fresh insert.
    pub fn requeue(&self, entries: Vec<Connection>) {
        for conn in entries {
            self.record_connection(conn);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Drains every pending threat record for the flush loop's
    /// `ReportThreats` call, clearing the dedup table (spec §4.4 "Threat
    /// log path"). Unlike [`Self::drain_batch`] there is no batching cap;
    /// threat volume is expected to be orders of magnitude below
    /// connection volume.
    pub fn drain_threats(&self) -> Vec<segment_core::domain::connection::ThreatRecord> {
        let mut inner = self.inner.lock();
        inner.threats.drain().map(|(_, v)| v).collect()
    }
}

impl Default for FlowAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn conn(bytes: u64, sessions: u64, severity: u32, action: PolicyAction, last_seen: i64) -> Connection {
        Connection {
            client_workload_id: "c".into(),
            server_workload_id: "s".into(),
            client_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            server_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
            client_port: 4444,
            server_port: 80,
            ip_proto: 6,
            application_id: 0,
            bytes,
            sessions,
            first_seen_unix_ms: last_seen,
            last_seen_unix_ms: last_seen,
            threat_id: 0,
            severity,
            policy_action: action,
            policy_id: None,
            ingress: false,
            external_peer: false,
        }
    }

    #[test]
    fn merges_records_sharing_a_five_tuple() {
        // Scenario S3: three records with tuple T merge into bytes=400,
        // sessions=4, severity=2, action=violate.
        let agg = FlowAggregator::new();
        agg.record_connection(conn(100, 1, 0, PolicyAction::Allow, 1));
        agg.record_connection(conn(250, 2, 2, PolicyAction::Violate, 2));
        agg.record_connection(conn(50, 1, 1, PolicyAction::Allow, 3));

        let batch = agg.drain_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].bytes, 400);
        assert_eq!(batch[0].sessions, 4);
        assert_eq!(batch[0].severity, 2);
        assert_eq!(batch[0].policy_action, PolicyAction::Violate);
    }

    #[test]
    fn flush_prioritizes_violate_and_threat_entries() {
        let agg = FlowAggregator::new();
        let mut plain = conn(1, 1, 0, PolicyAction::Allow, 1);
        plain.server_port = 1;
        let mut flagged = conn(1, 1, 3, PolicyAction::Violate, 2);
        flagged.server_port = 2;
        agg.record_connection(plain);
        agg.record_connection(flagged);

        let batch = agg.drain_batch();
        assert_eq!(batch[0].policy_action, PolicyAction::Violate);
    }

    #[test]
    fn threat_dedup_suppresses_within_window() {
        let agg = FlowAggregator::new();
        let threat = ThreatRecord {
            workload_id: "w1".into(),
            peer_ip: "10.0.0.5".parse().unwrap(),
            threat_id: 7,
            severity: 5,
            reported_at_unix_ms: 1000,
            count: 1,
        };
        assert!(!agg.record_threat(threat.clone()));
        let mut repeat = threat.clone();
        repeat.reported_at_unix_ms = 1500;
        assert!(agg.record_threat(repeat));
    }
}
