//! Port interception: namespace surgery, TC filter install, and the
//! mode-change/quarantine/detach operations built on top of them.

mod linkops;
mod netns;
mod tc;

mod interceptor;

pub use interceptor::{BridgeTopology, PortInterceptor};
pub use netns::{current_net_ns, net_ns_by_name, net_ns_of_pid};
