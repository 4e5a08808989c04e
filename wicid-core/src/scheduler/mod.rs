//! Cooperative single-threaded task scheduler
//!
//! Tasks are async bodies produced by a factory closure. The scheduler keeps
//! them in a min-heap keyed on `(next_run_time, effective_priority, id)`,
//! launches the earliest ready one each round and polls every in-flight task
//! until it completes. Tasks give up control only at [`sleep`] and
//! [`yield_control`], so between those points a task has the device to
//! itself.
//!
//! ```ignore
//! let scheduler = Scheduler::new(Rc::new(SystemClock::new()));
//! scheduler.schedule_periodic(|| async { blink().await; Ok(()) },
//!     Duration::from_millis(40), 0, "LED");
//! scheduler.run_forever()?;
//! ```

mod task;
mod timer;

pub use task::{TaskError, TaskFuture, TaskHandle, TaskKind, TaskSnapshot};
pub use timer::{sleep, yield_control, Sleep, YieldNow};

use crate::clock::Clock;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use task::{QueueKey, Task, TaskFactory};

// Lag thresholds for a periodic task that fell behind its cadence
const BEHIND_DEBUG: Duration = Duration::from_secs(30);
const BEHIND_INFO: Duration = Duration::from_secs(120);
const BEHIND_WARN: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a task may sit ready in the queue before it gets a boost
    pub max_starvation: Duration,
    /// Priority points removed per starvation round
    pub starvation_boost: u8,
    pub starvation_check_interval: Duration,
    /// Runs longer than this are logged
    pub slow_task_threshold: Duration,
    /// Upper bound on a single idle so the loop stays responsive
    pub max_idle: Duration,
    /// Tasks launched per round
    pub launch_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_starvation: Duration::from_secs(60),
            starvation_boost: 30,
            starvation_check_interval: Duration::from_secs(10),
            slow_task_threshold: Duration::from_millis(100),
            max_idle: Duration::from_millis(100),
            launch_budget: 1,
        }
    }
}

#[derive(Debug)]
pub enum SchedulerError {
    /// A task returned [`TaskError::Fatal`]
    TaskFatal { task: String, error: anyhow::Error },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::TaskFatal { task, error } => {
                write!(f, "fatal error in task '{}': {:#}", task, error)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub executed: u64,
    pub failed: u64,
    pub starvation_boosts: u64,
}

/// Diagnostic dump of the scheduler, ordered by next run time
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub now: Duration,
    pub stats: SchedulerStats,
    pub tasks: Vec<TaskSnapshot>,
}

impl SchedulerSnapshot {
    pub fn task(&self, handle: TaskHandle) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.handle == handle)
    }

    pub fn find(&self, name: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

impl fmt::Display for SchedulerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Scheduler: {} tasks, {} scheduled, {} executed, {} failed",
            self.tasks.len(),
            self.stats.scheduled,
            self.stats.executed,
            self.stats.failed
        )?;
        for task in &self.tasks {
            let state = if task.cancelled {
                "cancelled".to_string()
            } else if task.running {
                "running".to_string()
            } else if task.next_run_time <= self.now {
                "ready".to_string()
            } else {
                format!("in {:.1}s", (task.next_run_time - self.now).as_secs_f32())
            };
            writeln!(
                f,
                "  [{}] {} ({}) priority {}/{}: {}, {} runs",
                task.handle.id(),
                task.name,
                task.kind.as_str(),
                task.effective_priority,
                task.priority,
                state,
                task.execution_count
            )?;
        }
        Ok(())
    }
}

struct State {
    queue: BinaryHeap<Reverse<QueueKey>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    stats: SchedulerStats,
    fatal: Option<SchedulerError>,
    last_starvation_check: Duration,
}

struct Running {
    id: u64,
    name: String,
    started: Duration,
    future: TaskFuture,
}

/// Cloneable handle to the scheduler. Clones share one task registry, so a
/// task body can hold a clone and schedule further work.
#[derive(Clone)]
pub struct Scheduler {
    clock: Rc<dyn Clock>,
    config: Rc<SchedulerConfig>,
    state: Rc<RefCell<State>>,
    active: Rc<RefCell<Vec<Running>>>,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    pub fn with_config(clock: Rc<dyn Clock>, config: SchedulerConfig) -> Self {
        let last_starvation_check = clock.now();
        Self {
            clock,
            config: Rc::new(config),
            state: Rc::new(RefCell::new(State {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 1,
                stats: SchedulerStats::default(),
                fatal: None,
                last_starvation_check,
            })),
            active: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Run `factory`'s future once after `delay`
    pub fn schedule_once<F, Fut>(
        &self,
        factory: F,
        delay: Duration,
        priority: u8,
        name: &str,
    ) -> TaskHandle
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let first_run = self.clock.now() + delay;
        self.register(name, priority, TaskKind::OneShot, delay, first_run, boxed(factory))
    }

    /// Run immediately, then every `period` measured from each scheduled start
    pub fn schedule_periodic<F, Fut>(
        &self,
        factory: F,
        period: Duration,
        priority: u8,
        name: &str,
    ) -> TaskHandle
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let first_run = self.clock.now();
        self.register(name, priority, TaskKind::Periodic, period, first_run, boxed(factory))
    }

    /// Run immediately, then `interval` after each completion
    pub fn schedule_recurring<F, Fut>(
        &self,
        factory: F,
        interval: Duration,
        priority: u8,
        name: &str,
    ) -> TaskHandle
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let first_run = self.clock.now();
        self.register(name, priority, TaskKind::Recurring, interval, first_run, boxed(factory))
    }

    /// Run once as soon as possible
    pub fn schedule_now<F, Fut>(&self, factory: F, priority: u8, name: &str) -> TaskHandle
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let first_run = self.clock.now();
        self.register(name, priority, TaskKind::Immediate, Duration::ZERO, first_run, boxed(factory))
    }

    fn register(
        &self,
        name: &str,
        priority: u8,
        kind: TaskKind,
        timing: Duration,
        first_run: Duration,
        factory: TaskFactory,
    ) -> TaskHandle {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;

        let task = Task {
            id,
            name: name.to_string(),
            priority,
            effective_priority: priority,
            factory,
            kind,
            timing,
            next_run_time: first_run,
            last_scheduled_time: first_run,
            ready_since: None,
            starved_rounds: 0,
            execution_count: 0,
            total_runtime: Duration::ZERO,
            cancelled: false,
            running: false,
        };
        state.queue.push(Reverse(task.queue_key()));
        state.tasks.insert(id, task);
        state.stats.scheduled += 1;

        debug!(
            "Scheduled {} task '{}' ({}) priority {} timing {:?}",
            kind.as_str(),
            name,
            id,
            priority,
            timing
        );
        TaskHandle(id)
    }

    /// Cancel a task. Returns true only the first time for a live task.
    ///
    /// A run already in flight finishes its current step; the task is simply
    /// never queued again.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let mut state = self.state.borrow_mut();
        match state.tasks.get_mut(&handle.0) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                debug!("Cancelled task '{}' ({})", task.name, task.id);
                true
            }
            _ => false,
        }
    }

    /// True while the task is queued or running and not cancelled
    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.state
            .borrow()
            .tasks
            .get(&handle.0)
            .map(|t| !t.cancelled)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state.borrow().stats
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.borrow();
        let mut tasks: Vec<TaskSnapshot> = state.tasks.values().map(TaskSnapshot::of).collect();
        tasks.sort_by_key(|t| (t.next_run_time, t.effective_priority, t.handle));
        SchedulerSnapshot {
            now: self.clock.now(),
            stats: state.stats,
            tasks,
        }
    }

    /// Drive tasks until one fails fatally. Never returns `Ok` on its own.
    pub fn run_forever(&self) -> Result<(), SchedulerError> {
        info!("Scheduler started with {} tasks", self.state.borrow().tasks.len());
        loop {
            self.tick()?;
            self.idle(None);
        }
    }

    /// Drive tasks for `duration` of clock time
    pub fn run_for(&self, duration: Duration) -> Result<(), SchedulerError> {
        let deadline = self.clock.now() + duration;
        while self.clock.now() < deadline {
            self.tick()?;
            self.idle(Some(deadline));
        }
        Ok(())
    }

    /// One scheduling round: starvation sweep, launch ready work, poll everything in flight
    pub fn tick(&self) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        timer::enter(now);

        self.sweep_starvation(now);
        self.launch_ready(now);
        self.poll_active();

        match self.state.borrow_mut().fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn idle(&self, limit: Option<Duration>) {
        let now = self.clock.now();
        let queued = self.state.borrow().queue.peek().map(|Reverse(k)| k.next_run);
        let wake = match (timer::take_next_wake(), queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut delay = match wake {
            Some(at) => at.saturating_sub(now).min(self.config.max_idle),
            None => self.config.max_idle,
        };
        if let Some(limit) = limit {
            delay = delay.min(limit.saturating_sub(now));
        }
        if !delay.is_zero() {
            self.clock.idle(delay);
        }
    }

    fn launch_ready(&self, now: Duration) {
        let mut launched = 0;
        while launched < self.config.launch_budget {
            let (id, name, factory) = {
                let mut guard = self.state.borrow_mut();
                let state = &mut *guard;
                let Some(Reverse(key)) = state.queue.peek().copied() else {
                    break;
                };
                if key.next_run > now {
                    break;
                }
                state.queue.pop();

                let Some(task) = state.tasks.get_mut(&key.id) else {
                    continue;
                };
                if task.cancelled {
                    debug!("Dropping cancelled task '{}' ({})", task.name, task.id);
                    state.tasks.remove(&key.id);
                    continue;
                }
                task.running = true;
                task.reset_priority();
                (task.id, task.name.clone(), task.factory.clone())
            };

            // The factory may schedule more work, so no borrow is held here
            let future = factory();
            self.active.borrow_mut().push(Running {
                id,
                name,
                started: now,
                future,
            });
            launched += 1;
        }
    }

    fn poll_active(&self) {
        let mut cx = Context::from_waker(Waker::noop());
        let mut active = std::mem::take(&mut *self.active.borrow_mut());

        let mut fatal = false;
        active.retain_mut(|run| {
            if fatal {
                return true;
            }
            timer::set_now(self.clock.now());
            match run.future.as_mut().poll(&mut cx) {
                Poll::Pending => true,
                Poll::Ready(result) => {
                    fatal = self.finish(run.id, &run.name, run.started, result);
                    false
                }
            }
        });

        // Anything launched while polling was appended to the emptied list
        let mut slot = self.active.borrow_mut();
        active.append(&mut slot);
        *slot = active;
    }

    /// Record a completed run and re-queue or retire the task. Returns true on a fatal error.
    fn finish(
        &self,
        id: u64,
        name: &str,
        started: Duration,
        result: Result<(), TaskError>,
    ) -> bool {
        let now = self.clock.now();
        let runtime = now.saturating_sub(started);
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        match result {
            Ok(()) => {
                state.stats.executed += 1;
                if runtime > self.config.slow_task_threshold {
                    debug!("Task '{}' ran for {}ms", name, runtime.as_millis());
                }
            }
            Err(TaskError::NonFatal(e)) => {
                state.stats.failed += 1;
                error!("Task '{}' failed: {:#}", name, e);
            }
            Err(TaskError::Fatal(e)) => {
                state.stats.failed += 1;
                error!("Task '{}' failed fatally: {:#}", name, e);
                state.tasks.remove(&id);
                state.fatal = Some(SchedulerError::TaskFatal {
                    task: name.to_string(),
                    error: e,
                });
                return true;
            }
        }

        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        task.running = false;
        task.execution_count += 1;
        task.total_runtime += runtime;

        if task.cancelled || !task.kind.repeats() {
            state.tasks.remove(&id);
            return false;
        }

        reschedule(task, now);
        state.queue.push(Reverse(task.queue_key()));
        false
    }

    fn sweep_starvation(&self, now: Duration) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if now.saturating_sub(state.last_starvation_check) < self.config.starvation_check_interval {
            return;
        }
        state.last_starvation_check = now;

        let mut boosted_any = false;
        for task in state.tasks.values_mut() {
            if task.running || task.cancelled || task.next_run_time > now {
                continue;
            }
            let since = *task.ready_since.get_or_insert(now);
            if now - since <= self.config.max_starvation {
                continue;
            }

            task.starved_rounds += 1;
            let boost = u32::from(self.config.starvation_boost).saturating_mul(task.starved_rounds);
            let boosted = u32::from(task.priority).saturating_sub(boost) as u8;
            if boosted != task.effective_priority {
                info!(
                    "Task '{}' starved for {}s, priority {} -> {}",
                    task.name,
                    (now - since).as_secs(),
                    task.effective_priority,
                    boosted
                );
                task.effective_priority = boosted;
                state.stats.starvation_boosts += 1;
                boosted_any = true;
            }
        }

        if boosted_any {
            state.queue = state
                .tasks
                .values()
                .filter(|t| !t.running)
                .map(|t| Reverse(t.queue_key()))
                .collect();
        }
    }
}

fn boxed<F, Fut>(factory: F) -> TaskFactory
where
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    Rc::new(move || Box::pin(factory()) as TaskFuture)
}

fn reschedule(task: &mut Task, now: Duration) {
    match task.kind {
        TaskKind::Periodic => {
            let next = task.last_scheduled_time + task.timing;
            if next < now {
                let lag = now - next;
                if lag > BEHIND_WARN {
                    warn!("Task '{}' is {}s behind schedule", task.name, lag.as_secs());
                } else if lag > BEHIND_INFO {
                    info!("Task '{}' is {}s behind schedule", task.name, lag.as_secs());
                } else if lag > BEHIND_DEBUG {
                    debug!("Task '{}' is {}s behind schedule", task.name, lag.as_secs());
                }
                task.next_run_time = now;
                task.last_scheduled_time = now;
            } else {
                task.next_run_time = next;
                task.last_scheduled_time = next;
            }
        }
        TaskKind::Recurring => {
            task.next_run_time = now + task.timing;
            task.last_scheduled_time = now;
        }
        TaskKind::OneShot | TaskKind::Immediate => {}
    }
    task.reset_priority();
}

/// Drive a single future to completion on the calling thread, honouring
/// [`sleep`] and [`yield_control`] the same way the scheduler does.
pub fn block_on<F: Future>(clock: &dyn Clock, future: F) -> F::Output {
    let mut cx = Context::from_waker(Waker::noop());
    let mut future = pin!(future);
    let max_idle = SchedulerConfig::default().max_idle;

    loop {
        timer::enter(clock.now());
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        let delay = match timer::take_next_wake() {
            Some(at) => at.saturating_sub(clock.now()).min(max_idle),
            None => max_idle,
        };
        if !delay.is_zero() {
            clock.idle(delay);
        }
    }
}
