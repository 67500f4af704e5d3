use crate::entities::creature::MapKey;
use crate::net::session::SessionId;
use crate::runtime::timers::{TaskId, TimerQueue};
use crate::telemetry::logging;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Tasks bound to a map die with the map; tasks bound to a session die
/// with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskGroup {
    Map(MapKey),
    Session(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStep {
    Continue(Duration),
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    Capacity { limit: usize },
    Stopped,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Capacity { limit } => write!(f, "task capacity {} exhausted", limit),
            SchedulerError::Stopped => write!(f, "scheduler stopped"),
        }
    }
}

impl std::error::Error for SchedulerError {}

type TaskBody = Box<dyn FnMut() -> TaskStep + Send>;

struct TaskEntry {
    group: Option<TaskGroup>,
    /// `None` while a worker is running the task.
    body: Option<TaskBody>,
    cancelled: bool,
}

#[derive(Default)]
struct SchedulerState {
    timers: TimerQueue,
    tasks: HashMap<TaskId, TaskEntry>,
    groups: HashMap<TaskGroup, HashSet<TaskId>>,
    stopped: bool,
}

impl SchedulerState {
    fn claim(&mut self, id: TaskId) -> Option<TaskBody> {
        let entry = self.tasks.get_mut(&id)?;
        if entry.cancelled {
            return None;
        }
        entry.body.take()
    }

    /// Returns the body when the task is over so the caller can drop it
    /// outside the state lock.
    fn finish_run(
        &mut self,
        id: TaskId,
        body: TaskBody,
        step: TaskStep,
        now: Instant,
    ) -> Option<TaskBody> {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return Some(body);
        };
        match step {
            TaskStep::Continue(delay) if !entry.cancelled && !self.stopped => {
                entry.body = Some(body);
                self.timers.set(id, now + delay);
                None
            }
            _ => {
                self.remove(id);
                Some(body)
            }
        }
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskBody> {
        let entry = self.tasks.remove(&id)?;
        self.timers.stop(id);
        if let Some(group) = entry.group {
            if let Some(members) = self.groups.get_mut(&group) {
                members.remove(&id);
                if members.is_empty() {
                    self.groups.remove(&group);
                }
            }
        }
        entry.body
    }

    fn cancel(&mut self, id: TaskId) -> (bool, Option<TaskBody>) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return (false, None);
        };
        if entry.body.is_none() {
            entry.cancelled = true;
            self.timers.stop(id);
            return (true, None);
        }
        (true, self.remove(id))
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    next_id: AtomicU64,
    max_tasks: usize,
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_body(&self, id: TaskId, body: &mut TaskBody) -> TaskStep {
        match panic::catch_unwind(AssertUnwindSafe(|| body())) {
            Ok(step) => step,
            Err(_) => {
                logging::log_error(&format!("task {} panicked and was dropped", id.0));
                TaskStep::Finish
            }
        }
    }

    fn run_claimed(&self, id: TaskId, mut body: TaskBody) {
        let step = self.run_body(id, &mut body);
        let finished = {
            let mut state = self.lock_state();
            state.finish_run(id, body, step, Instant::now())
        };
        self.wake.notify_one();
        drop(finished);
    }
}

/// Timer-driven worker pool. Every behavior loop, diff pass and deferred
/// combat action is a task here; none of them owns a thread.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(worker_threads: usize, max_tasks: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self::manual(max_tasks));
        let mut workers = scheduler
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for index in 0..worker_threads.max(1) {
            let inner = Arc::clone(&scheduler.inner);
            let spawned = thread::Builder::new()
                .name(format!("overworld-worker-{}", index))
                .spawn(move || worker_loop(inner));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => logging::log_error(&format!("worker spawn failed: {}", err)),
            }
        }
        drop(workers);
        scheduler
    }

    /// A scheduler without workers; tasks run only through `run_due`.
    pub fn manual(max_tasks: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                wake: Condvar::new(),
                next_id: AtomicU64::new(1),
                max_tasks,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule_recurring<F>(
        &self,
        group: Option<TaskGroup>,
        first_delay: Duration,
        body: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() -> TaskStep + Send + 'static,
    {
        self.insert(group, first_delay, Box::new(body))
    }

    pub fn schedule_once<F>(
        &self,
        group: Option<TaskGroup>,
        delay: Duration,
        action: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut action = Some(action);
        self.insert(
            group,
            delay,
            Box::new(move || {
                if let Some(action) = action.take() {
                    action();
                }
                TaskStep::Finish
            }),
        )
    }

    fn insert(
        &self,
        group: Option<TaskGroup>,
        delay: Duration,
        body: TaskBody,
    ) -> Result<TaskId, SchedulerError> {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.inner.lock_state();
            if state.stopped {
                return Err(SchedulerError::Stopped);
            }
            if state.tasks.len() >= self.inner.max_tasks {
                return Err(SchedulerError::Capacity {
                    limit: self.inner.max_tasks,
                });
            }
            state.tasks.insert(
                id,
                TaskEntry {
                    group,
                    body: Some(body),
                    cancelled: false,
                },
            );
            if let Some(group) = group {
                state.groups.entry(group).or_default().insert(id);
            }
            state.timers.set(id, Instant::now() + delay);
        }
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// A running task finishes its current iteration and is not rescheduled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let (found, body) = self.inner.lock_state().cancel(id);
        drop(body);
        found
    }

    pub fn cancel_group(&self, group: TaskGroup) -> usize {
        let mut dropped = Vec::new();
        let count = {
            let mut state = self.inner.lock_state();
            let ids: Vec<TaskId> = state
                .groups
                .get(&group)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default();
            for id in &ids {
                let (_, body) = state.cancel(*id);
                dropped.extend(body);
            }
            ids.len()
        };
        drop(dropped);
        count
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        let state = self.inner.lock_state();
        state
            .tasks
            .get(&id)
            .map(|entry| !entry.cancelled)
            .unwrap_or(false)
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock_state().tasks.len()
    }

    pub fn group_len(&self, group: TaskGroup) -> usize {
        let state = self.inner.lock_state();
        state.groups.get(&group).map(HashSet::len).unwrap_or(0)
    }

    /// Runs every task due at `now` on the calling thread, each at most
    /// once. A task that reschedules itself for `now` or earlier waits for
    /// the next call.
    pub fn run_due(&self, now: Instant) -> usize {
        let due: Vec<TaskId> = {
            let mut state = self.inner.lock_state();
            let mut due = Vec::new();
            while let Some(id) = state.timers.pop_ready(now) {
                due.push(id);
            }
            due
        };
        let mut ran = 0;
        for id in due {
            let claimed = self.inner.lock_state().claim(id);
            let Some(mut body) = claimed else {
                continue;
            };
            let step = self.inner.run_body(id, &mut body);
            let finished = self.inner.lock_state().finish_run(id, body, step, now);
            drop(finished);
            ran += 1;
        }
        ran
    }

    pub fn shutdown(&self) {
        let bodies: Vec<TaskBody> = {
            let mut state = self.inner.lock_state();
            state.stopped = true;
            let ids: Vec<TaskId> = state.tasks.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.cancel(id).1)
                .collect()
        };
        self.inner.wake.notify_all();
        drop(bodies);
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                logging::log_error("scheduler worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    let mut state = inner.lock_state();
    loop {
        if state.stopped {
            return;
        }
        let now = Instant::now();
        if let Some(id) = state.timers.pop_ready(now) {
            let Some(body) = state.claim(id) else {
                continue;
            };
            drop(state);
            inner.run_claimed(id, body);
            state = inner.lock_state();
            continue;
        }
        state = match state.timers.next_deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                match inner.wake.wait_timeout(state, timeout) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => inner.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn recurring_task_runs_until_finish() {
        let scheduler = Scheduler::manual(16);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .schedule_recurring(None, Duration::ZERO, move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    TaskStep::Finish
                } else {
                    TaskStep::Continue(Duration::ZERO)
                }
            })
            .expect("schedule");

        let now = Instant::now();
        assert_eq!(scheduler.run_due(now), 1);
        assert_eq!(scheduler.run_due(now + Duration::from_millis(1)), 1);
        assert_eq!(scheduler.run_due(now + Duration::from_millis(2)), 1);
        assert_eq!(scheduler.task_count(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_delay_task_runs_once_per_call() {
        let scheduler = Scheduler::manual(16);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let id = scheduler
            .schedule_recurring(None, Duration::ZERO, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskStep::Continue(Duration::ZERO)
            })
            .expect("schedule");

        let now = Instant::now();
        assert_eq!(scheduler.run_due(now), 1);
        assert_eq!(scheduler.run_due(now), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_scheduled(id));
        assert!(scheduler.cancel(id));
        assert_eq!(scheduler.run_due(now), 0);
    }

    #[test]
    fn one_shot_waits_for_its_delay() {
        let scheduler = Scheduler::manual(16);
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        let id = scheduler
            .schedule_once(None, Duration::from_secs(10), move || {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .expect("schedule");

        assert_eq!(scheduler.run_due(Instant::now()), 0);
        assert!(scheduler.is_scheduled(id));
        scheduler.run_due(Instant::now() + Duration::from_secs(11));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(id));
    }

    #[test]
    fn cancel_group_drops_pending_tasks() {
        let scheduler = Scheduler::manual(16);
        let map = TaskGroup::Map(MapKey::new(1, 1));
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let flag = Arc::clone(&fired);
            scheduler
                .schedule_once(Some(map), Duration::ZERO, move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                })
                .expect("schedule");
        }
        let other = Arc::clone(&fired);
        scheduler
            .schedule_once(None, Duration::ZERO, move || {
                other.fetch_add(10, Ordering::SeqCst);
            })
            .expect("schedule");

        assert_eq!(scheduler.group_len(map), 3);
        assert_eq!(scheduler.cancel_group(map), 3);
        assert_eq!(scheduler.group_len(map), 0);
        scheduler.run_due(Instant::now());
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn capacity_is_enforced() {
        let scheduler = Scheduler::manual(1);
        scheduler
            .schedule_once(None, Duration::from_secs(1), || {})
            .expect("first");
        let err = scheduler
            .schedule_once(None, Duration::from_secs(1), || {})
            .expect_err("second");
        assert_eq!(err, SchedulerError::Capacity { limit: 1 });
    }

    #[test]
    fn workers_run_tasks_and_cancel_in_flight() {
        let scheduler = Scheduler::start(2, 64);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let id = scheduler
            .schedule_recurring(None, Duration::ZERO, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskStep::Continue(Duration::from_millis(2))
            })
            .expect("schedule");

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
        assert!(scheduler.cancel(id));
        assert!(wait_until(|| scheduler.task_count() == 0));
        let settled = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
        scheduler.shutdown();
    }

    #[test]
    fn panicking_task_is_isolated() {
        let scheduler = Scheduler::manual(8);
        scheduler
            .schedule_once(None, Duration::ZERO, || panic!("boom"))
            .expect("schedule");
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        scheduler
            .schedule_once(None, Duration::ZERO, move || {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .expect("schedule");
        assert_eq!(scheduler.run_due(Instant::now()), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn stopped_scheduler_refuses_new_tasks() {
        let scheduler = Scheduler::manual(8);
        scheduler.shutdown();
        assert_eq!(
            scheduler.schedule_once(None, Duration::ZERO, || {}),
            Err(SchedulerError::Stopped)
        );
    }
}
