//! Policy data model (spec §3, §4.3): declarative `GroupRule`s compile into
//! per-workload `PolicyRule` sets.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// The action a matched rule (or the workload default) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Open,
    Allow,
    Deny,
    Violate,
}

impl PolicyAction {
    /// Relative priority used when merging/aggregating actions (higher wins).
    /// `Violate` and `Deny` rank above `Allow`/`Open` so the aggregator and
    /// the graph merge never silently downgrade a flagged flow.
    pub fn priority(self) -> u8 {
        match self {
            PolicyAction::Open => 0,
            PolicyAction::Allow => 1,
            PolicyAction::Deny => 3,
            PolicyAction::Violate => 2,
        }
    }

    pub fn max(self, other: Self) -> Self {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

/// Effective per-workload mode, binding the default action (spec §4.3).
/// `Discover` is intentionally not supported as a source mode; callers
/// migrating from a Controller that still emits it should silently treat it
/// as `Monitor` (spec §9 open question), which [`WorkloadMode::from_wire`]
/// does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadMode {
    Monitor,
    Protect,
}

impl WorkloadMode {
    pub fn default_action(self) -> PolicyAction {
        match self {
            WorkloadMode::Monitor => PolicyAction::Violate,
            WorkloadMode::Protect => PolicyAction::Deny,
        }
    }

    /// Maps an arbitrary wire string to a mode, treating the unsupported
    /// `"discover"` value as a synonym for `Monitor`.
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "protect" => WorkloadMode::Protect,
            _ => WorkloadMode::Monitor,
        }
    }
}

/// An IP range `[start, end]`, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    /// Sentinel "unconstrained" range used when a rule's peer endpoint is a
    /// workload group the compiler cannot resolve to a concrete address
    /// (see [`crate::policy::compiler`]).
    pub const ANY: IpRange = IpRange {
        start: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        end: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
    };

    pub fn single(ip: IpAddr) -> Self {
        Self { start: ip, end: ip }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.is_any() {
            return true;
        }
        match (self.start, self.end, ip) {
            (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(v)) => {
                u32::from(v) >= u32::from(s) && u32::from(v) <= u32::from(e)
            }
            (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(v)) => {
                u128::from(v) >= u128::from(s) && u128::from(v) <= u128::from(e)
            }
            _ => false,
        }
    }
}

/// Sentinel "any" range: `[0, 0]` per spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange { start: 0, end: 0 };

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    pub fn contains(&self, port: u16) -> bool {
        self.is_any() || (port >= self.start && port <= self.end)
    }
}

/// One compiled, per-workload rule (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: u64,
    pub ingress: bool,
    pub src: IpRange,
    pub dst: IpRange,
    /// 0 = any; otherwise IANA protocol number (6 = TCP, 17 = UDP, …).
    pub proto: u8,
    pub dport: PortRange,
    pub application_id: Option<u32>,
    pub action: PolicyAction,
}

/// The full compiled policy for one workload (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadPolicy {
    pub workload_id: String,
    pub mode: WorkloadMode,
    pub default_action: PolicyAction,
    pub rules: Vec<PolicyRule>,
    pub version: u64,
}

impl WorkloadPolicy {
    pub fn new(workload_id: String, mode: WorkloadMode) -> Self {
        Self {
            workload_id,
            default_action: mode.default_action(),
            mode,
            rules: Vec::new(),
            version: 0,
        }
    }

    /// Evaluates `rules` in stored order against one flow (spec §4.3 match
    /// semantics); returns the winning action and the matched rule id, or
    /// `default_action`/`None` if nothing matched.
    pub fn evaluate(
        &self,
        ingress: bool,
        src: IpAddr,
        dst: IpAddr,
        proto: u8,
        dport: u16,
        application_id: u32,
    ) -> (PolicyAction, Option<u64>) {
        for rule in &self.rules {
            if rule.ingress != ingress {
                continue;
            }
            if !rule.src.contains(src) || !rule.dst.contains(dst) {
                continue;
            }
            if rule.proto != 0 && rule.proto != proto {
                continue;
            }
            if !rule.dport.contains(dport) {
                continue;
            }
            if let Some(app) = rule.application_id {
                if app != 0 && app != application_id {
                    continue;
                }
            }
            return (rule.action, Some(rule.id));
        }
        (self.default_action, None)
    }

    /// Structural equality check used by the diff/push step (spec §4.3):
    /// identical beyond `version`.
    pub fn structurally_equal(&self, other: &WorkloadPolicy) -> bool {
        self.workload_id == other.workload_id
            && self.mode == other.mode
            && self.default_action == other.default_action
            && self.rules == other.rules
    }
}

/// An endpoint reference on a `GroupRule`: a group name, a literal IP, a
/// CIDR, or a reference into the address-group table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleEndpoint {
    Group(String),
    Ip(IpAddr),
    Cidr(ipnet::IpNet),
    AddressGroup(String),
}

/// Declarative source rule (spec §3), compiled by
/// [`crate::policy::compiler`] into effective `PolicyRule`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRule {
    pub id: u64,
    pub from: RuleEndpoint,
    pub to: RuleEndpoint,
    /// `proto/p1,p2-p3,…` or `any`.
    pub ports: String,
    pub application: Option<String>,
    pub action: PolicyAction,
    pub priority: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_any_matches_everything() {
        assert!(PortRange::ANY.contains(1));
        assert!(PortRange::ANY.contains(65535));
    }

    #[test]
    fn action_max_prefers_deny_over_allow() {
        assert_eq!(
            PolicyAction::Allow.max(PolicyAction::Deny),
            PolicyAction::Deny
        );
        assert_eq!(
            PolicyAction::Deny.max(PolicyAction::Allow),
            PolicyAction::Deny
        );
    }

    #[test]
    fn evaluate_first_match_wins() {
        let mut policy = WorkloadPolicy::new("wl-a".into(), WorkloadMode::Protect);
        policy.rules.push(PolicyRule {
            id: 101,
            ingress: false,
            src: IpRange::single("10.0.0.1".parse().unwrap()),
            dst: IpRange {
                start: "10.1.0.0".parse().unwrap(),
                end: "10.1.255.255".parse().unwrap(),
            },
            proto: 6,
            dport: PortRange {
                start: 443,
                end: 443,
            },
            application_id: None,
            action: PolicyAction::Allow,
        });

        let (action, rule_id) = policy.evaluate(
            false,
            "10.0.0.1".parse().unwrap(),
            "10.1.2.3".parse().unwrap(),
            6,
            443,
            0,
        );
        assert_eq!(action, PolicyAction::Allow);
        assert_eq!(rule_id, Some(101));

        let (action, rule_id) = policy.evaluate(
            false,
            "10.0.0.1".parse().unwrap(),
            "10.2.0.1".parse().unwrap(),
            6,
            443,
            0,
        );
        assert_eq!(action, PolicyAction::Deny);
        assert_eq!(rule_id, None);
    }
}
