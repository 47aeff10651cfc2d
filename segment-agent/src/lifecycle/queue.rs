//! The bounded task queue the lifecycle coordinator drains (spec §4.2):
//! capacity 256, back-pressure by dropping the oldest non-stop task when
//! full.

use segment_core::domain::intercept::InterceptMode;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Capacity of the lifecycle task queue (spec §4.2).
pub const QUEUE_CAPACITY: usize = 256;

/// One unit of work for the lifecycle coordinator (spec §4.2's task-kind
/// list). `StopContainer` is the only kind the back-pressure policy
/// protects from eviction — dropping a pending teardown would strand an
/// intercepted pair.
#[derive(Debug, Clone)]
pub enum Task {
    AddContainer { id: String, pid: u32 },
    InterceptContainer { id: String },
    StopContainer { id: String, pid: u32 },
    DeleteContainer { id: String },
    ReinterceptContainer { id: String, new_mode: InterceptMode },
    ConfigContainer { id: String, quarantined: Option<bool> },
    ConfigAgent { report_interval_secs: Option<u64> },
    ConfigSystem { skip_set_overrides: Option<Vec<String>> },
}

impl Task {
    fn is_stop(&self) -> bool {
        matches!(self, Task::StopContainer { .. })
    }
}

struct Inner {
    tasks: VecDeque<Task>,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { tasks: VecDeque::new() }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues `task`. If the queue is at capacity, evicts the oldest
    /// non-stop task to make room; if every queued task is itself a stop,
    /// the incoming task is dropped rather than starving teardown (spec
    /// §4.2 "back-pressure by dropping the oldest non-stop task if full").
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock();
        if inner.tasks.len() >= self.capacity {
            if let Some(pos) = inner.tasks.iter().position(|t| !t.is_stop()) {
                inner.tasks.remove(pos);
                metrics::counter!("segment_lifecycle_queue_drops_total").increment(1);
            } else {
                metrics::counter!("segment_lifecycle_queue_drops_total").increment(1);
                return;
            }
        }
        inner.tasks.push_back(task);
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for and removes the next task. Race-free against concurrent
    /// `push`: the `notified()` future is created before the queue is
    /// checked, so a push landing between the check and the `.await`
    /// still wakes this call (see `tokio::sync::Notify` docs).
    pub async fn pop(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.inner.lock().tasks.pop_front() {
                return task;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_returns_pushed_task_in_fifo_order() {
        let q = TaskQueue::new(QUEUE_CAPACITY);
        q.push(Task::DeleteContainer { id: "a".into() });
        q.push(Task::DeleteContainer { id: "b".into() });
        let first = q.pop().await;
        assert!(matches!(first, Task::DeleteContainer { id } if id == "a"));
    }

    #[tokio::test]
    async fn pop_waits_for_a_later_push() {
        let q = std::sync::Arc::new(TaskQueue::new(QUEUE_CAPACITY));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(Task::DeleteContainer { id: "late".into() });
        let task = handle.await.unwrap();
        assert!(matches!(task, Task::DeleteContainer { id } if id == "late"));
    }

    #[test]
    fn overflow_evicts_oldest_non_stop_task_first() {
        let q = TaskQueue::new(2);
        q.push(Task::StopContainer { id: "keep".into(), pid: 1 });
        q.push(Task::DeleteContainer { id: "evict-me".into() });
        q.push(Task::DeleteContainer { id: "newest".into() });
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn overflow_drops_incoming_task_when_queue_is_all_stops() {
        let q = TaskQueue::new(1);
        q.push(Task::StopContainer { id: "a".into(), pid: 1 });
        q.push(Task::StopContainer { id: "b".into(), pid: 2 });
        assert_eq!(q.len(), 1);
    }
}
