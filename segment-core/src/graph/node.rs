//! Topology graph node identity (spec §3, §4.7).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's kind, encoded as a stable string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Workload,
    Host,
    Ip,
    AddressGroup,
}

impl NodeKind {
    fn prefix(self) -> &'static str {
        match self {
            NodeKind::Workload => "workload",
            NodeKind::Host => "host",
            NodeKind::Ip => "ip",
            NodeKind::AddressGroup => "addrgrp",
        }
    }
}

/// A node identified by a stable string prefix: `workload.<id>`,
/// `host.<id>`, `ip.<addr>`, or `addrgrp.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(kind: NodeKind, key: impl AsRef<str>) -> Self {
        Self(format!("{}.{}", kind.prefix(), key.as_ref()))
    }

    pub fn workload(id: impl AsRef<str>) -> Self {
        Self::new(NodeKind::Workload, id)
    }

    pub fn host(id: impl AsRef<str>) -> Self {
        Self::new(NodeKind::Host, id)
    }

    pub fn ip(addr: std::net::IpAddr) -> Self {
        Self::new(NodeKind::Ip, addr.to_string())
    }

    pub fn address_group(name: impl AsRef<str>) -> Self {
        Self::new(NodeKind::AddressGroup, name)
    }

    pub fn kind(&self) -> Option<NodeKind> {
        let prefix = self.0.split('.').next()?;
        match prefix {
            "workload" => Some(NodeKind::Workload),
            "host" => Some(NodeKind::Host),
            "ip" => Some(NodeKind::Ip),
            "addrgrp" => Some(NodeKind::AddressGroup),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node-kind metadata carried on the `attr` self-edge (spec §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub alias: Option<String>,
    pub external: bool,
    pub host: bool,
    pub managed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_carries_expected_prefix() {
        assert_eq!(NodeId::workload("abc").0, "workload.abc");
        assert_eq!(NodeId::host("h1").0, "host.h1");
        assert_eq!(
            NodeId::ip("10.0.0.1".parse().unwrap()).0,
            "ip.10.0.0.1"
        );
        assert_eq!(NodeId::address_group("grpA").0, "addrgrp.grpA");
    }

    #[test]
    fn kind_round_trips() {
        assert_eq!(NodeId::workload("x").kind(), Some(NodeKind::Workload));
    }
}
