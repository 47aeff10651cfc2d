//! The lifecycle coordinator (spec §4.2): the single writer of all
//! per-container state, driven by a bounded task queue.

mod coordinator;
mod queue;

pub use coordinator::{CoordinatorHandle, LifecycleCoordinator};
pub use queue::{Task, TaskQueue, QUEUE_CAPACITY};
