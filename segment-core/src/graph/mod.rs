pub mod edge;
pub mod node;
pub mod store;

pub use edge::{EdgeAttr, EntryKey, GraphEdgeAttr, GraphEntry, LinkClass, PolicyEdgeAttr, PortSpec};
pub use node::{NodeAttrs, NodeId, NodeKind};
pub use store::{ConversationDetail, ConversationSummary, EndpointView, LinkEvent, TopologyGraph};
