use crossbeam_queue::SegQueue;

use crate::error::Result;

/// Priority lane for tasks injected into a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Executed before any low-priority task in the same drain; never
    /// shunted.
    High,
    /// Executed in batches of at most
    /// [`MAX_ASYNC_TASKS_AT_ONE_TIME`](crate::netpoll::MAX_ASYNC_TASKS_AT_ONE_TIME)
    /// per drain; may backlog.
    Low,
}

/// A deferred closure executed on the owning event-loop thread with mutable
/// access to the loop context `C`.
pub type Task<C> = Box<dyn FnOnce(&mut C) -> Result<()> + Send>;

/// The two task lanes feeding a poller. Multi-producer (any thread may
/// enqueue), single-consumer (only the polling thread drains).
pub struct TaskQueues<C> {
    urgent: SegQueue<Task<C>>,
    backlog: SegQueue<Task<C>>,
}

impl<C> TaskQueues<C> {
    pub fn new() -> Self {
        TaskQueues {
            urgent: SegQueue::new(),
            backlog: SegQueue::new(),
        }
    }

    /// Enqueue a task. Low-priority tasks spill to the backlog lane once the
    /// urgent lane holds `threshold` entries or more; a few slipping into
    /// the urgent lane under a racing flash of producers is tolerated.
    pub fn push(&self, priority: Priority, task: Task<C>, threshold: usize) {
        if priority == Priority::Low && self.urgent.len() >= threshold {
            self.backlog.push(task);
        } else {
            self.urgent.push(task);
        }
    }

    pub fn pop_urgent(&self) -> Option<Task<C>> {
        self.urgent.pop()
    }

    pub fn pop_backlog(&self) -> Option<Task<C>> {
        self.backlog.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.backlog.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(tag: u32) -> Task<Vec<u32>> {
        Box::new(move |seen: &mut Vec<u32>| {
            seen.push(tag);
            Ok(())
        })
    }

    #[test]
    fn urgent_lane_is_fifo() {
        let queues: TaskQueues<Vec<u32>> = TaskQueues::new();
        for i in 0..100 {
            queues.push(Priority::High, noop(i), 1024);
        }
        let mut seen = Vec::new();
        while let Some(task) = queues.pop_urgent() {
            task(&mut seen).unwrap();
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn low_priority_spills_past_threshold() {
        let queues: TaskQueues<Vec<u32>> = TaskQueues::new();
        for i in 0..4 {
            queues.push(Priority::Low, noop(i), 2);
        }
        // First two land urgent, the rest spill.
        let mut urgent = 0;
        while queues.pop_urgent().is_some() {
            urgent += 1;
        }
        let mut backlog = 0;
        while queues.pop_backlog().is_some() {
            backlog += 1;
        }
        assert_eq!(urgent, 2);
        assert_eq!(backlog, 2);
    }

    #[test]
    fn high_priority_never_spills() {
        let queues: TaskQueues<Vec<u32>> = TaskQueues::new();
        for i in 0..10 {
            queues.push(Priority::High, noop(i), 0);
        }
        assert!(queues.pop_backlog().is_none());
        let mut n = 0;
        while queues.pop_urgent().is_some() {
            n += 1;
        }
        assert_eq!(n, 10);
    }
}
