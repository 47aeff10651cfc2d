//! # segment-core
//!
//! Shared domain model, policy compiler, topology graph, and data-plane
//! wire types for the container micro-segmentation enforcer. Both
//! `segment-agent` and `segment-controller` depend on this crate; neither
//! owns a private copy of these types.
//!
//! | Concern | Module |
//! |---|---|
//! | Port interception value types, sentinel MACs | [`domain::intercept`] |
//! | Per-container state | [`domain::container`] |
//! | Policy data model | [`domain::policy`] |
//! | Connection/threat records | [`domain::connection`] |
//! | Policy compiler (GroupRule -> WorkloadPolicy) | [`policy::compiler`] |
//! | Topology graph | [`graph`] |
//! | Data-plane wire messages | [`dataplane`] |
//! | Error taxonomy | [`error`] |
//! | Configuration loading | [`config`] |
//! | Logging/metrics bootstrap | [`telemetry`] |

pub mod config;
pub mod dataplane;
pub mod domain;
pub mod error;
pub mod graph;
pub mod policy;
pub mod telemetry;
