//! Thin synchronous wrapper over `rtnetlink` for the link/address/namespace
//! operations the interceptor needs (spec §4.1 steps 1-6). Every method
//! blocks the calling thread via `futures::executor::block_on`, so this is
//! only ever used from inside the interceptor's `spawn_blocking` closure —
//! the same closure that owns the `setns` thread-pinning contract in
//! [`crate::intercept::netns`]. A fresh `rtnetlink` connection is opened
//! per namespace scope because a connection's socket is bound in whatever
//! namespace was active when it was created.

use crate::error::{AgentError, AgentResult};
use futures::executor::block_on;
use futures::TryStreamExt;
use rtnetlink::Handle;
use segment_core::domain::intercept::MacAddr;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};

/// A netlink session bound to whatever network namespace was active on the
/// calling thread at construction time.
pub struct LinkOps {
    handle: Handle,
}

fn nl_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Netlink(e.to_string())
}

impl LinkOps {
    /// Opens a fresh rtnetlink connection in the current namespace and
    /// spawns its I/O driver onto `rt`.
    pub fn open(rt: &tokio::runtime::Handle) -> AgentResult<Self> {
        let (conn, handle, _messages) = rtnetlink::new_connection().map_err(nl_err)?;
        rt.spawn(conn);
        Ok(Self { handle })
    }

    pub fn find_by_name(&self, name: &str) -> AgentResult<Option<u32>> {
        block_on(async {
            let mut links = self.handle.link().get().match_name(name.to_string()).execute();
            match links.try_next().await.map_err(nl_err)? {
                Some(msg) => Ok(Some(msg.header.index)),
                None => Ok(None),
            }
        })
    }

    pub fn require_by_name(&self, name: &str) -> AgentResult<u32> {
        self.find_by_name(name)?
            .ok_or_else(|| AgentError::Netlink(format!("interface not found: {name}")))
    }

    /// Reads back the link-layer address currently assigned to `index`.
    pub fn mac_of(&self, index: u32) -> AgentResult<MacAddr> {
        block_on(async {
            let mut links = self.handle.link().get().match_index(index).execute();
            let msg = links
                .try_next()
                .await
                .map_err(nl_err)?
                .ok_or_else(|| AgentError::Netlink(format!("no such link: {index}")))?;
            let addr = msg.attributes.iter().find_map(|a| match a {
                netlink_packet_route::link::LinkAttribute::Address(bytes) => Some(bytes.clone()),
                _ => None,
            });
            let bytes = addr.ok_or_else(|| AgentError::Netlink(format!("link {index} has no address attribute")))?;
            if bytes.len() != 6 {
                return Err(AgentError::Netlink(format!("link {index} address is not 6 bytes")));
            }
            let mut arr = [0u8; 6];
            arr.copy_from_slice(&bytes);
            Ok(MacAddr(arr))
        })
    }

    /// Lists every non-loopback interface name in the current namespace
    /// scope (spec §4.1 "enumerate interfaces, skipping loopback").
    pub fn list_non_loopback(&self) -> AgentResult<Vec<String>> {
        block_on(async {
            let mut out = Vec::new();
            let mut links = self.handle.link().get().execute();
            while let Some(msg) = links.try_next().await.map_err(nl_err)? {
                if msg.header.flags.contains(&netlink_packet_route::link::LinkFlag::Loopback) {
                    continue;
                }
                if let Some(name) = msg.attributes.iter().find_map(|a| match a {
                    netlink_packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                }) {
                    out.push(name);
                }
            }
            Ok(out)
        })
    }

    pub fn set_down(&self, index: u32) -> AgentResult<()> {
        block_on(async { self.handle.link().set(index).down().execute().await.map_err(nl_err) })
    }

    pub fn set_up(&self, index: u32) -> AgentResult<()> {
        block_on(async { self.handle.link().set(index).up().execute().await.map_err(nl_err) })
    }

    pub fn rename(&self, index: u32, new_name: &str) -> AgentResult<()> {
        block_on(async {
            self.handle
                .link()
                .set(index)
                .name(new_name.to_string())
                .execute()
                .await
                .map_err(nl_err)
        })
    }

    pub fn set_mac(&self, index: u32, mac: MacAddr) -> AgentResult<()> {
        block_on(async {
            self.handle
                .link()
                .set(index)
                .address(mac.0.to_vec())
                .execute()
                .await
                .map_err(nl_err)
        })
    }

    pub fn list_addrs(&self, index: u32) -> AgentResult<Vec<(IpAddr, u8)>> {
        block_on(async {
            let mut out = Vec::new();
            let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
            while let Some(msg) = addrs.try_next().await.map_err(nl_err)? {
                let prefix_len = msg.header.prefix_len;
                for attr in &msg.attributes {
                    if let netlink_packet_route::address::AddressAttribute::Address(ip) = attr {
                        out.push((*ip, prefix_len));
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn add_addr(&self, index: u32, ip: IpAddr, prefix_len: u8) -> AgentResult<()> {
        block_on(async {
            self.handle
                .address()
                .add(index, ip, prefix_len)
                .execute()
                .await
                .map_err(nl_err)
        })
    }

    pub fn del_addr(&self, index: u32, ip: IpAddr, prefix_len: u8) -> AgentResult<()> {
        block_on(async {
            let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
            while let Some(msg) = addrs.try_next().await.map_err(nl_err)? {
                let matches = msg.header.prefix_len == prefix_len
                    && msg.attributes.iter().any(|a| {
                        matches!(a, netlink_packet_route::address::AddressAttribute::Address(a) if *a == ip)
                    });
                if matches {
                    self.handle.address().del(msg).execute().await.map_err(nl_err)?;
                }
            }
            Ok(())
        })
    }

    /// Creates a veth pair where `name` keeps this namespace's choice of
    /// index/name and `peer` is the other end (spec §4.1 step 3).
    pub fn create_veth(&self, name: &str, peer: &str) -> AgentResult<()> {
        block_on(async {
            self.handle
                .link()
                .add()
                .veth(name.to_string(), peer.to_string())
                .execute()
                .await
                .map_err(nl_err)
        })
    }

    pub fn delete(&self, index: u32) -> AgentResult<()> {
        block_on(async { self.handle.link().del(index).execute().await.map_err(nl_err) })
    }

    /// Moves `index` into the namespace identified by `target_ns` (spec
    /// §4.1 step 5/6).
    pub fn move_to_namespace(&self, index: u32, target_ns: &OwnedFd) -> AgentResult<()> {
        block_on(async {
            self.handle
                .link()
                .set(index)
                .setns_by_fd(target_ns.as_raw_fd())
                .execute()
                .await
                .map_err(nl_err)
        })
    }
}
