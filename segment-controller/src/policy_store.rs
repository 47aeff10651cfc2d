//! # Policy store
//!
//! Holds the declarative `GroupRule` set, the group/address tables, and the
//! last compiled `WorkloadPolicy` per workload. Recompiles on every mutation
//! and hands the caller a diff to push to the owning agents.
//!
//! ## Relationships
//! - Wraps [`segment_core::policy::compiler`] for compilation and diffing.
//! - Consumed by the RPC server's `GetPolicies` handler and by whichever
//!   component ingests `GroupRule` updates (out of core scope per spec §1).
//! - Projects authorized workload pairs onto the shared [`TopologyGraph`]'s
//!   `policy`-class edges (spec §4.7) on every `replace_rules` call.

use chrono::Utc;
use parking_lot::RwLock;
use segment_core::domain::policy::{GroupRule, RuleEndpoint, WorkloadMode, WorkloadPolicy};
use segment_core::graph::{NodeId, TopologyGraph};
use segment_core::policy::{compile_workload_policies, diff_policies, parse_port_spec, GroupTables, PolicyDiff};
use std::collections::HashMap;
use std::sync::Arc;

pub struct PolicyStore {
    inner: RwLock<Inner>,
    graph: Arc<TopologyGraph>,
}

struct Inner {
    rules: Vec<GroupRule>,
    tables: GroupTables,
    modes: HashMap<String, WorkloadMode>,
    compiled: HashMap<String, WorkloadPolicy>,
}

impl PolicyStore {
    pub fn new(graph: Arc<TopologyGraph>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: Vec::new(),
                tables: GroupTables::default(),
                modes: HashMap::new(),
                compiled: HashMap::new(),
            }),
            graph,
        }
    }

    /// Replaces the full rule/table input set, recompiles, and returns the
    /// diff against what was previously compiled (spec §4.3 "Diff and
    /// push"). The newly compiled state becomes the stored baseline.
    ///
    /// Also projects every `Allow` rule onto the topology graph's
    /// `policy`-class edges (spec §4.7: "authorized communication,
    /// irrespective of observed traffic"). The compiled `PolicyRule` form
    /// loses group identity on a group-to-group rule (an unresolved group
    /// peer compiles down to the unconstrained `IpRange::ANY`, see
    /// `policy::compiler::resolve_endpoint`), so the projection instead
    /// walks the declarative `GroupRule`s directly against `tables` to
    /// recover the concrete workload/IP pairs a rule authorizes.
    pub async fn replace_rules(
        &self,
        rules: Vec<GroupRule>,
        tables: GroupTables,
        modes: HashMap<String, WorkloadMode>,
    ) -> Result<Vec<PolicyDiff>, segment_core::error::CoreError> {
        let diffs = {
            let mut inner = self.inner.write();
            let compiled = compile_workload_policies(&rules, &tables, &modes)?;
            let diffs = diff_policies(&inner.compiled, &compiled);

            let mut next = inner.compiled.clone();
            for diff in &diffs {
                match diff {
                    PolicyDiff::Add(p) | PolicyDiff::Modify(p) => {
                        next.insert(p.workload_id.clone(), p.clone());
                    }
                    PolicyDiff::Delete(id) => {
                        next.remove(id);
                    }
                }
            }

            inner.rules = rules.clone();
            inner.tables = tables.clone();
            inner.modes = modes;
            inner.compiled = next;
            diffs
        };

        self.project_policy_links(&rules, &tables).await?;
        Ok(diffs)
    }

    /// Materializes `policy`-class graph edges for every workload pair an
    /// `Allow` rule authorizes (spec §4.7, §4.3).
    async fn project_policy_links(
        &self,
        rules: &[GroupRule],
        tables: &GroupTables,
    ) -> Result<(), segment_core::error::CoreError> {
        let mut group_members: HashMap<&str, Vec<&str>> = HashMap::new();
        for (workload_id, groups) in &tables.workload_groups {
            for group in groups {
                group_members.entry(group.as_str()).or_default().push(workload_id.as_str());
            }
        }

        let now = Utc::now().timestamp_millis();
        for rule in rules {
            if rule.action != segment_core::domain::policy::PolicyAction::Allow {
                continue;
            }
            let ports = parse_port_spec(&rule.ports)?;
            let sources = Self::resolve_workload_peers(&rule.from, &group_members);
            let dests = Self::resolve_workload_peers(&rule.to, &group_members);

            for from_workload in &sources {
                for to_workload in &dests {
                    if from_workload == to_workload {
                        continue;
                    }
                    for &(proto, port_range) in &ports {
                        self.graph
                            .record_policy_link(
                                NodeId::workload(from_workload),
                                NodeId::workload(to_workload),
                                proto,
                                port_range.start,
                                None,
                                now,
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves a rule endpoint to the workload ids it names. Only a group
    /// endpoint names workloads directly; a literal IP, CIDR, or
    /// address-group endpoint addresses something outside the workload
    /// namespace (or an unbounded range of it) and is skipped rather than
    /// guessing at a workload identity or flooding the graph with one edge
    /// per address.
    fn resolve_workload_peers<'a>(
        endpoint: &'a RuleEndpoint,
        group_members: &HashMap<&'a str, Vec<&'a str>>,
    ) -> Vec<String> {
        match endpoint {
            RuleEndpoint::Group(name) => group_members
                .get(name.as_str())
                .into_iter()
                .flatten()
                .map(|w| w.to_string())
                .collect(),
            RuleEndpoint::Ip(_) | RuleEndpoint::Cidr(_) | RuleEndpoint::AddressGroup(_) => Vec::new(),
        }
    }

    /// Returns the current compiled policy for one workload, if any.
    pub fn get(&self, workload_id: &str) -> Option<WorkloadPolicy> {
        self.inner.read().compiled.get(workload_id).cloned()
    }

    /// Returns the current compiled policy for every requested workload id;
    /// unknown ids are silently skipped (spec §4.2 "policy compile errors
    /// for one workload never block others").
    pub fn get_many(&self, workload_ids: &[String]) -> Vec<WorkloadPolicy> {
        let inner = self.inner.read();
        workload_ids
            .iter()
            .filter_map(|id| inner.compiled.get(id).cloned())
            .collect()
    }

    pub fn all(&self) -> Vec<WorkloadPolicy> {
        self.inner.read().compiled.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_core::domain::policy::PolicyAction;
    use std::collections::HashSet;

    #[tokio::test]
    async fn replace_rules_produces_add_then_modify() {
        let store = PolicyStore::new(Arc::new(TopologyGraph::new(256)));
        let mut workload_groups = HashMap::new();
        workload_groups.insert("A".to_string(), HashSet::from(["grpA".to_string()]));
        let tables = GroupTables {
            workload_groups,
            address_groups: HashMap::new(),
        };
        let rules = vec![GroupRule {
            id: 1,
            from: RuleEndpoint::Group("grpA".to_string()),
            to: RuleEndpoint::Cidr("10.0.0.0/24".parse().unwrap()),
            ports: "tcp/80".to_string(),
            application: None,
            action: PolicyAction::Allow,
            priority: 0,
        }];

        let diffs = store
            .replace_rules(rules.clone(), tables.clone(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(matches!(diffs[0], PolicyDiff::Add(_)));

        let mut modes = HashMap::new();
        modes.insert("A".to_string(), WorkloadMode::Protect);
        let diffs = store.replace_rules(rules, tables, modes).await.unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(matches!(diffs[0], PolicyDiff::Modify(_)));
    }

    #[tokio::test]
    async fn allow_rule_between_groups_becomes_a_policy_edge() {
        let graph = Arc::new(TopologyGraph::new(256));
        let store = PolicyStore::new(graph.clone());

        let mut workload_groups = HashMap::new();
        workload_groups.insert("web-1".to_string(), HashSet::from(["web".to_string()]));
        workload_groups.insert("db-1".to_string(), HashSet::from(["db".to_string()]));
        let tables = GroupTables {
            workload_groups,
            address_groups: HashMap::new(),
        };
        let rules = vec![GroupRule {
            id: 1,
            from: RuleEndpoint::Group("web".to_string()),
            to: RuleEndpoint::Group("db".to_string()),
            ports: "tcp/5432".to_string(),
            application: None,
            action: PolicyAction::Allow,
            priority: 0,
        }];

        store.replace_rules(rules, tables, HashMap::new()).await.unwrap();

        let endpoints = graph.list_endpoints(|_| true).await;
        assert_eq!(endpoints.len(), 2, "both workloads should be materialized by the policy projection");
    }
}
