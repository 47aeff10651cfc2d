//! Data-plane socket client (spec §4.5): sends config messages to the
//! packet engine and receives connection/threat records, over a reconnecting
//! `AF_UNIX SOCK_DGRAM` socket.

mod client;

pub use client::{DataPlaneClient, SharedDataPlaneClient};
