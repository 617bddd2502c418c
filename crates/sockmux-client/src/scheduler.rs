//! Deferred execution for reconnect attempts and call timeouts.
//!
//! A scheduler must never run a task on the calling thread, even with a
//! zero delay: tasks are scheduled while the client is handling an event
//! and take the client's locks when they run.
//!
//! Every scheduled task gets a [`TimerId`]. Cancelling a timer that has not
//! fired drops its task without running it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ScheduleError;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Arrange for `task` to run once `delay` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the task cannot be armed; it is dropped
    /// without running.
    fn schedule(&self, delay: Duration, task: Task) -> Result<TimerId, ScheduleError>;

    /// Drop a task that has not started yet. Returns false if it already
    /// ran, is running, or was never scheduled here.
    fn cancel(&self, id: TimerId) -> bool;
}

/// Longest delay honored; later deadlines are clamped so `Instant`
/// arithmetic cannot overflow.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cancelled heap entries tolerated before the heap is rebuilt.
const COMPACT_SLACK: usize = 64;

#[derive(Default)]
struct TimerQueue {
    due: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    worker_running: bool,
    shutdown: bool,
}

impl TimerQueue {
    fn compact(&mut self) {
        if self.due.len() > self.tasks.len() * 2 + COMPACT_SLACK {
            let tasks = &self.tasks;
            self.due.retain(|Reverse((_, id))| tasks.contains_key(id));
        }
    }
}

#[derive(Default)]
struct Timers {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

impl Timers {
    fn queue(&self) -> MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs every task on one background thread, in deadline order.
///
/// The thread is spawned by the first [`schedule`](Scheduler::schedule)
/// call and exits once the scheduler is dropped. A spawn failure is
/// returned to the caller and retried on the next call.
#[derive(Default)]
pub struct ThreadScheduler {
    timers: Arc<Timers>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.timers.queue().tasks.len()
    }

    fn ensure_worker(&self, queue: &mut TimerQueue) -> Result<(), ScheduleError> {
        if queue.worker_running {
            return Ok(());
        }
        let timers = Arc::clone(&self.timers);
        std::thread::Builder::new()
            .name("sockmux-timer".to_string())
            .spawn(move || run_timers(&timers))?;
        queue.worker_running = true;
        Ok(())
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TimerId, ScheduleError> {
        let mut queue = self.timers.queue();
        self.ensure_worker(&mut queue)?;
        let id = queue.next_id;
        queue.next_id += 1;
        let at = Instant::now() + delay.min(MAX_DELAY);
        queue.due.push(Reverse((at, id)));
        queue.tasks.insert(id, task);
        drop(queue);
        self.timers.wakeup.notify_one();
        Ok(TimerId(id))
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut queue = self.timers.queue();
        let removed = queue.tasks.remove(&id.0).is_some();
        if removed {
            queue.compact();
        }
        removed
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.timers.queue().shutdown = true;
        self.timers.wakeup.notify_all();
    }
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.timers.queue();
        f.debug_struct("ThreadScheduler")
            .field("pending", &queue.tasks.len())
            .field("worker_running", &queue.worker_running)
            .finish()
    }
}

fn run_timers(timers: &Timers) {
    let mut queue = timers.queue();
    loop {
        if queue.shutdown {
            debug!(dropped = queue.tasks.len(), "timer thread exiting");
            return;
        }
        let now = Instant::now();
        match queue.due.peek().copied() {
            Some(Reverse((at, id))) if at <= now => {
                queue.due.pop();
                let Some(task) = queue.tasks.remove(&id) else {
                    continue;
                };
                drop(queue);
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!("scheduled task panicked");
                }
                queue = timers.queue();
            }
            Some(Reverse((at, _))) => {
                queue = match timers.wakeup.wait_timeout(queue, at - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            None => {
                queue = timers
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// Runs tasks on a Tokio runtime.
///
/// The delay is awaited on the runtime; the task itself runs on the blocking
/// pool since reconnect attempts may block on the connector.
#[cfg(feature = "async")]
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
    timers: Arc<Mutex<TokioTimers>>,
}

#[cfg(feature = "async")]
#[derive(Debug, Default)]
struct TokioTimers {
    next_id: u64,
    sleeping: HashMap<u64, tokio::task::AbortHandle>,
}

#[cfg(feature = "async")]
impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            timers: Arc::default(),
        }
    }

    /// Scheduler bound to the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }

    /// Number of tasks still sleeping.
    pub fn pending(&self) -> usize {
        lock_tokio_timers(&self.timers).sleeping.len()
    }
}

#[cfg(feature = "async")]
fn lock_tokio_timers(timers: &Mutex<TokioTimers>) -> MutexGuard<'_, TokioTimers> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "async")]
impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TimerId, ScheduleError> {
        // Held across the spawn so the task cannot look itself up before
        // it is registered.
        let mut timers = lock_tokio_timers(&self.timers);
        let id = timers.next_id;
        timers.next_id += 1;

        let registry = Arc::clone(&self.timers);
        let handle = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay.min(MAX_DELAY)).await;
            }
            let claimed = lock_tokio_timers(&registry).sleeping.remove(&id).is_some();
            if !claimed {
                return;
            }
            if let Err(err) = tokio::task::spawn_blocking(task).await {
                warn!(error = %err, "scheduled task failed");
            }
        });
        timers.sleeping.insert(id, handle.abort_handle());
        Ok(TimerId(id))
    }

    fn cancel(&self, id: TimerId) -> bool {
        match lock_tokio_timers(&self.timers).sleeping.remove(&id.0) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

struct Entry {
    due: Duration,
    delay: Duration,
    order: u64,
    task: Task,
}

#[derive(Default)]
struct Timeline {
    now: Duration,
    next_order: u64,
    entries: Vec<Entry>,
}

impl Timeline {
    /// Remove the earliest entry due at or before `limit`.
    fn pop_due(&mut self, limit: Duration) -> Option<Entry> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due <= limit)
            .min_by_key(|(_, entry)| (entry.due, entry.order))
            .map(|(index, _)| index)?;
        let entry = self.entries.remove(index);
        self.now = self.now.max(entry.due);
        Some(entry)
    }
}

/// Virtual-time scheduler driven explicitly by the caller.
///
/// Nothing runs until [`advance`](Self::advance) or
/// [`run_next`](Self::run_next) is called. Tasks run on the calling thread,
/// in due order, with no internal lock held.
#[derive(Default)]
pub struct ManualScheduler {
    timeline: Mutex<Timeline>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.timeline().now
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.timeline().entries.len()
    }

    /// Requested delays of the waiting tasks, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let timeline = self.timeline();
        let mut entries: Vec<(u64, Duration)> = timeline
            .entries
            .iter()
            .map(|entry| (entry.order, entry.delay))
            .collect();
        entries.sort_unstable_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, delay)| delay).collect()
    }

    /// Advance virtual time by `by`, running every task that falls due,
    /// including tasks scheduled by those tasks. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let limit = self.now() + by;
        let mut ran = 0;
        loop {
            let entry = self.timeline().pop_due(limit);
            match entry {
                Some(entry) => {
                    (entry.task)();
                    ran += 1;
                }
                None => break,
            }
        }
        let mut timeline = self.timeline();
        timeline.now = timeline.now.max(limit);
        ran
    }

    /// Jump to the earliest waiting task and run it alone.
    ///
    /// Returns the delay it was scheduled with.
    pub fn run_next(&self) -> Option<Duration> {
        let entry = self.timeline().pop_due(Duration::MAX)?;
        let delay = entry.delay;
        (entry.task)();
        Some(delay)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TimerId, ScheduleError> {
        let mut timeline = self.timeline();
        let order = timeline.next_order;
        timeline.next_order += 1;
        let due = timeline.now.saturating_add(delay);
        timeline.entries.push(Entry {
            due,
            delay,
            order,
            task,
        });
        Ok(TimerId(order))
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut timeline = self.timeline();
        let before = timeline.entries.len();
        timeline.entries.retain(|entry| entry.order != id.0);
        timeline.entries.len() != before
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timeline = self.timeline();
        f.debug_struct("ManualScheduler")
            .field("now", &timeline.now)
            .field("pending", &timeline.entries.len())
            .finish()
    }
}
