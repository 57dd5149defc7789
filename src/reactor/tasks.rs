//! Scheduled-task min-heap with lazy-deletion cancellation.
//!
//! A binary heap ordered by deadline; cancelling a task just flips a shared
//! flag (the "tombstone"). The loop skips tombstoned entries when it scans
//! for due work.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// Handle returned by `schedule`/`schedule_background`. Cancellation is
/// idempotent and O(log n) amortized (the tombstone is skipped lazily on the
/// next scan rather than removed from the heap immediately).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    fn new() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancelled: flag.clone(),
            },
            flag,
        )
    }

    /// Cancels the associated task. A no-op if the task already fired or was
    /// already cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }

    /// True if cancelled (or already fired and then cancelled, which is
    /// harmless — the task itself is gone either way).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Relaxed)
    }
}

pub(crate) type Task = Box<dyn FnOnce() + 'static>;

pub(crate) struct ScheduledTask {
    pub(crate) deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<Task>,
}

impl ScheduledTask {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn take(&mut self) -> Option<Task> {
        self.task.take()
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed so `BinaryHeap` (a max-heap) behaves as a min-heap on
    // deadline; same-deadline tasks run in insertion (seq) order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of scheduled tasks plus a monotonic sequence counter used to
/// break deadline ties in insertion order.
#[derive(Default)]
pub(crate) struct ScheduleHeap {
    heap: BinaryHeap<ScheduledTask>,
    next_seq: u64,
}

impl ScheduleHeap {
    pub(crate) fn push(&mut self, deadline: Instant, task: Task) -> CancelHandle {
        let (handle, cancelled) = CancelHandle::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledTask {
            deadline,
            seq,
            cancelled,
            task: Some(task),
        });
        handle
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        // Skip tombstones without mutating, for timeout computation.
        self.heap
            .iter()
            .filter(|t| !t.is_cancelled())
            .map(|t| t.deadline)
            .min()
    }

    pub(crate) fn is_empty_ignoring_tombstones(&self) -> bool {
        self.heap.iter().all(|t| t.is_cancelled())
    }

    /// Pops every task whose deadline has passed, discarding tombstones as it
    /// goes, and returns their closures in deadline (then insertion) order.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.is_cancelled() {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let mut top = self.heap.pop().expect("peeked Some");
            if let Some(task) = top.take() {
                due.push(task);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn due_tasks_run_in_deadline_then_insertion_order() {
        let mut heap = ScheduleHeap::default();
        let base = Instant::now();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        heap.push(base, Box::new(move || o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        heap.push(base, Box::new(move || o2.lock().unwrap().push(2)));
        let o3 = order.clone();
        heap.push(base + Duration::from_secs(10), Box::new(move || o3.lock().unwrap().push(3)));

        for task in heap.drain_due(base) {
            task();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancelling_already_fired_task_is_a_noop() {
        let mut heap = ScheduleHeap::default();
        let base = Instant::now();
        let handle = heap.push(base, Box::new(|| ()));
        let _ = heap.drain_due(base);
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancelled_task_is_skipped_when_due() {
        let mut heap = ScheduleHeap::default();
        let base = Instant::now();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = heap.push(base, Box::new(move || ran2.store(true, AtomicOrdering::SeqCst)));
        handle.cancel();
        let due = heap.drain_due(base);
        assert!(due.is_empty());
        assert!(!ran.load(AtomicOrdering::SeqCst));
    }
}
