pub mod compiler;

pub use compiler::{compile_workload_policies, diff_policies, parse_port_spec, GroupTables, PolicyDiff};
