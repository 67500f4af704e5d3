use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimerEntry {
    task: TaskId,
    deadline: Instant,
}

/// Earliest deadline first; ties resolve by lower task id.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.task.cmp(&self.task))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline queue with lazy deletion: re-arming or stopping a task only
/// touches the index, superseded heap entries are skipped when they surface.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    armed: HashMap<TaskId, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, task: TaskId, deadline: Instant) {
        self.armed.insert(task, deadline);
        self.heap.push(TimerEntry { task, deadline });
    }

    pub fn stop(&mut self, task: TaskId) -> Option<Instant> {
        self.armed.remove(&task)
    }

    pub fn is_armed(&self, task: TaskId) -> bool {
        self.armed.contains_key(&task)
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|entry| entry.deadline)
    }

    pub fn pop_ready(&mut self, now: Instant) -> Option<TaskId> {
        self.discard_stale();
        let entry = self.heap.peek()?;
        if entry.deadline > now {
            return None;
        }
        let entry = self.heap.pop()?;
        self.armed.remove(&entry.task);
        Some(entry.task)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(entry) = self.heap.peek() {
            match self.armed.get(&entry.task) {
                Some(deadline) if *deadline == entry.deadline => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}
