//! Policy compiler (spec §4.3): declarative `GroupRule`s + membership +
//! address tables compile into one `WorkloadPolicy` per member workload.

use crate::domain::policy::{GroupRule, IpRange, PolicyRule, PortRange, RuleEndpoint, WorkloadMode, WorkloadPolicy};
use crate::error::{CoreError, CoreResult};
use std::collections::{HashMap, HashSet};

/// Compiler inputs (spec §4.3): group membership and the address-group
/// table. `workload_groups` maps a workload id to the set of (workload)
/// group names it belongs to.
#[derive(Debug, Clone, Default)]
pub struct GroupTables {
    pub workload_groups: HashMap<String, HashSet<String>>,
    pub address_groups: HashMap<String, Vec<IpRange>>,
}

/// Result of diffing a newly compiled policy against the stored one for a
/// workload (spec §4.3).
#[derive(Debug, Clone)]
pub enum PolicyDiff {
    Add(WorkloadPolicy),
    Modify(WorkloadPolicy),
    Delete(String),
}

/// Parses a declarative port spec (`proto/p1,p2-p3,…` or `any`) into
/// `(proto, PortRange)` pairs, one per comma-separated item (spec §4.3).
pub fn parse_port_spec(spec: &str) -> CoreResult<Vec<(u8, PortRange)>> {
    let spec = spec.trim();
    if spec.eq_ignore_ascii_case("any") {
        return Ok(vec![(0, PortRange::ANY)]);
    }

    let (proto_str, ports_str) = spec
        .split_once('/')
        .ok_or_else(|| CoreError::PolicyCompileError(format!("malformed port spec: {spec}")))?;

    let proto = match proto_str.to_ascii_lowercase().as_str() {
        "tcp" => 6,
        "udp" => 17,
        "any" => 0,
        other => other
            .parse::<u8>()
            .map_err(|_| CoreError::PolicyCompileError(format!("unknown protocol: {other}")))?,
    };

    if ports_str.eq_ignore_ascii_case("any") {
        return Ok(vec![(proto, PortRange::ANY)]);
    }

    let mut out = Vec::new();
    for item in ports_str.split(',') {
        let item = item.trim();
        if let Some((start, end)) = item.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| CoreError::PolicyCompileError(format!("bad port range: {item}")))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| CoreError::PolicyCompileError(format!("bad port range: {item}")))?;
            out.push((proto, PortRange { start, end }));
        } else {
            let port: u16 = item
                .parse()
                .map_err(|_| CoreError::PolicyCompileError(format!("bad port: {item}")))?;
            out.push((proto, PortRange { start: port, end: port }));
        }
    }
    Ok(out)
}

fn cidr_to_range(net: &ipnet::IpNet) -> IpRange {
    IpRange {
        start: net.network(),
        end: net.broadcast(),
    }
}

/// Resolves one rule endpoint to the IP ranges it contributes (spec §4.3):
/// literal IP -> `[ip, ip]`; CIDR -> `[firstIP, lastIP]`; address group ->
/// one range per contained CIDR/IP. A workload-group endpoint carries no
/// fixed address at this layer (the compiler's inputs don't map group
/// members to IPs), so it resolves to the unconstrained `ANY` range — see
/// the compiler-scope open question in DESIGN.md.
fn resolve_endpoint(endpoint: &RuleEndpoint, tables: &GroupTables) -> Vec<IpRange> {
    match endpoint {
        RuleEndpoint::Ip(ip) => vec![IpRange::single(*ip)],
        RuleEndpoint::Cidr(net) => vec![cidr_to_range(net)],
        RuleEndpoint::AddressGroup(name) => tables
            .address_groups
            .get(name)
            .cloned()
            .unwrap_or_default(),
        RuleEndpoint::Group(_) => vec![IpRange::ANY],
    }
}

/// Compiles every `GroupRule` into the per-workload `WorkloadPolicy` set
/// (spec §4.3). `modes` supplies each workload's `WorkloadMode`; workloads
/// absent from it default to `Monitor`.
pub fn compile_workload_policies(
    rules: &[GroupRule],
    tables: &GroupTables,
    modes: &HashMap<String, WorkloadMode>,
) -> CoreResult<HashMap<String, WorkloadPolicy>> {
    let mut accum: HashMap<String, Vec<(u32, PolicyRule)>> = HashMap::new();

    for rule in rules {
        let ports = parse_port_spec(&rule.ports)?;

        for (workload_id, groups) in &tables.workload_groups {
            let is_from = matches!(&rule.from, RuleEndpoint::Group(g) if groups.contains(g));
            let is_to = matches!(&rule.to, RuleEndpoint::Group(g) if groups.contains(g));
            if !is_from && !is_to {
                continue;
            }

            if is_from {
                for peer in resolve_endpoint(&rule.to, tables) {
                    for &(proto, dport) in &ports {
                        accum.entry(workload_id.clone()).or_default().push((
                            rule.priority,
                            PolicyRule {
                                id: rule.id,
                                ingress: false,
                                src: IpRange::ANY,
                                dst: peer,
                                proto,
                                dport,
                                application_id: None,
                                action: rule.action,
                            },
                        ));
                    }
                }
            }

            if is_to {
                for peer in resolve_endpoint(&rule.from, tables) {
                    for &(proto, dport) in &ports {
                        accum.entry(workload_id.clone()).or_default().push((
                            rule.priority,
                            PolicyRule {
                                id: rule.id,
                                ingress: true,
                                src: peer,
                                dst: IpRange::ANY,
                                proto,
                                dport,
                                application_id: None,
                                action: rule.action,
                            },
                        ));
                    }
                }
            }
        }
    }

    let mut out = HashMap::new();
    for (workload_id, mut entries) in accum {
        // Higher priority first; ties break on rule id ascending (spec §4.3).
        entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
        let mode = modes.get(&workload_id).copied().unwrap_or(WorkloadMode::Monitor);
        let mut policy = WorkloadPolicy::new(workload_id.clone(), mode);
        policy.rules = entries.into_iter().map(|(_, r)| r).collect();
        out.insert(workload_id, policy);
    }
    Ok(out)
}

/// Diffs freshly compiled policies against the stored set (spec §4.3):
/// absent -> `Add`; structurally changed -> `Modify` with a bumped
/// version; removed -> `Delete`. `new` policies are returned with a
/// monotonic version one greater than the stored policy's, or `0` if new.
pub fn diff_policies(
    stored: &HashMap<String, WorkloadPolicy>,
    compiled: &HashMap<String, WorkloadPolicy>,
) -> Vec<PolicyDiff> {
    let mut diffs = Vec::new();

    for (workload_id, new_policy) in compiled {
        match stored.get(workload_id) {
            None => {
                let mut p = new_policy.clone();
                p.version = 0;
                diffs.push(PolicyDiff::Add(p));
            }
            Some(old_policy) => {
                if !old_policy.structurally_equal(new_policy) {
                    let mut p = new_policy.clone();
                    p.version = old_policy.version + 1;
                    diffs.push(PolicyDiff::Modify(p));
                }
            }
        }
    }

    for workload_id in stored.keys() {
        if !compiled.contains_key(workload_id) {
            diffs.push(PolicyDiff::Delete(workload_id.clone()));
        }
    }

    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::PolicyAction;

    #[test]
    fn parses_tcp_port_list() {
        let parsed = parse_port_spec("tcp/80,443").unwrap();
        assert_eq!(parsed, vec![(6, PortRange { start: 80, end: 80 }), (6, PortRange { start: 443, end: 443 })]);
    }

    #[test]
    fn parses_any() {
        assert_eq!(parse_port_spec("any").unwrap(), vec![(0, PortRange::ANY)]);
    }

    #[test]
    fn compiles_cidr_destination_rule() {
        let mut workload_groups = HashMap::new();
        workload_groups.insert("A".to_string(), HashSet::from(["grpA".to_string()]));

        let tables = GroupTables {
            workload_groups,
            address_groups: HashMap::new(),
        };

        let rules = vec![GroupRule {
            id: 101,
            from: RuleEndpoint::Group("grpA".to_string()),
            to: RuleEndpoint::Cidr("10.1.0.0/16".parse().unwrap()),
            ports: "tcp/443".to_string(),
            application: None,
            action: PolicyAction::Allow,
            priority: 0,
        }];

        let compiled = compile_workload_policies(&rules, &tables, &HashMap::new()).unwrap();
        let policy = &compiled["A"];
        assert_eq!(policy.rules.len(), 1);
        let rule = &policy.rules[0];
        assert_eq!(rule.id, 101);
        assert!(!rule.ingress);
        assert_eq!(rule.dst.start, "10.1.0.0".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(rule.dst.end, "10.1.255.255".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(rule.proto, 6);
        assert_eq!(rule.dport, PortRange { start: 443, end: 443 });
        assert_eq!(rule.action, PolicyAction::Allow);
    }

    #[test]
    fn compiles_two_egress_rules_for_multi_port_group_to_group() {
        let mut workload_groups = HashMap::new();
        workload_groups.insert("A".to_string(), HashSet::from(["G".to_string()]));

        let tables = GroupTables {
            workload_groups,
            address_groups: HashMap::new(),
        };

        let rules = vec![GroupRule {
            id: 7,
            from: RuleEndpoint::Group("G".to_string()),
            to: RuleEndpoint::Group("H".to_string()),
            ports: "tcp/80,443".to_string(),
            application: None,
            action: PolicyAction::Allow,
            priority: 0,
        }];

        let compiled = compile_workload_policies(&rules, &tables, &HashMap::new()).unwrap();
        let policy = &compiled["A"];
        assert_eq!(policy.rules.len(), 2);
        assert!(policy.rules.iter().all(|r| !r.ingress && r.proto == 6));
        assert!(policy
            .rules
            .iter()
            .any(|r| r.dport == PortRange { start: 80, end: 80 }));
        assert!(policy
            .rules
            .iter()
            .any(|r| r.dport == PortRange { start: 443, end: 443 }));
    }

    #[test]
    fn diff_detects_add_modify_delete() {
        let mut stored = HashMap::new();
        let mut unchanged = WorkloadPolicy::new("wl-keep".into(), WorkloadMode::Monitor);
        unchanged.version = 3;
        stored.insert("wl-keep".to_string(), unchanged.clone());

        let mut changed_old = WorkloadPolicy::new("wl-change".into(), WorkloadMode::Monitor);
        changed_old.version = 1;
        stored.insert("wl-change".to_string(), changed_old);

        stored.insert(
            "wl-gone".to_string(),
            WorkloadPolicy::new("wl-gone".into(), WorkloadMode::Monitor),
        );

        let mut compiled = HashMap::new();
        compiled.insert("wl-keep".to_string(), unchanged);
        let changed_new = WorkloadPolicy::new("wl-change".into(), WorkloadMode::Protect);
        compiled.insert("wl-change".to_string(), changed_new);
        compiled.insert(
            "wl-new".to_string(),
            WorkloadPolicy::new("wl-new".into(), WorkloadMode::Monitor),
        );

        let diffs = diff_policies(&stored, &compiled);
        assert_eq!(diffs.len(), 3);
        assert!(diffs
            .iter()
            .any(|d| matches!(d, PolicyDiff::Add(p) if p.workload_id == "wl-new")));
        assert!(diffs
            .iter()
            .any(|d| matches!(d, PolicyDiff::Modify(p) if p.workload_id == "wl-change" && p.version == 2)));
        assert!(diffs
            .iter()
            .any(|d| matches!(d, PolicyDiff::Delete(id) if id == "wl-gone")));
    }
}
