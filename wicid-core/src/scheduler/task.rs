use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

/// A boxed task body. Each run of a task gets a fresh future from its factory.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>>>>;

pub(crate) type TaskFactory = Rc<dyn Fn() -> TaskFuture>;

/// Opaque identifier for a scheduled task. Never keeps the task alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub(crate) u64);

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs once after a delay
    OneShot,
    /// Fixed cadence measured from the scheduled start
    Periodic,
    /// Next run measured from the previous completion
    Recurring,
    /// Runs once as soon as possible
    Immediate,
}

impl TaskKind {
    pub fn repeats(&self) -> bool {
        matches!(self, TaskKind::Periodic | TaskKind::Recurring)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::OneShot => "once",
            TaskKind::Periodic => "periodic",
            TaskKind::Recurring => "recurring",
            TaskKind::Immediate => "immediate",
        }
    }
}

/// How a task run ended when it did not succeed
#[derive(Debug)]
pub enum TaskError {
    /// Logged; the task stays on its normal cadence
    NonFatal(anyhow::Error),
    /// The task is removed and the run loop stops with this error
    Fatal(anyhow::Error),
}

impl TaskError {
    pub fn non_fatal<E: Into<anyhow::Error>>(error: E) -> Self {
        TaskError::NonFatal(error.into())
    }

    pub fn fatal<E: Into<anyhow::Error>>(error: E) -> Self {
        TaskError::Fatal(error.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Fatal(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::NonFatal(error)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NonFatal(e) => write!(f, "{:#}", e),
            TaskError::Fatal(e) => write!(f, "fatal: {:#}", e),
        }
    }
}

impl std::error::Error for TaskError {}

/// Heap ordering key: earliest run time, then most urgent priority, then age
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    pub next_run: Duration,
    pub priority: u8,
    pub id: u64,
}

pub(crate) struct Task {
    pub id: u64,
    pub name: String,
    pub priority: u8,
    pub effective_priority: u8,
    pub factory: TaskFactory,
    pub kind: TaskKind,
    /// Delay, period or interval depending on kind
    pub timing: Duration,
    pub next_run_time: Duration,
    pub last_scheduled_time: Duration,
    /// First starvation sweep that saw the task ready but still queued
    pub ready_since: Option<Duration>,
    pub starved_rounds: u32,
    pub execution_count: u64,
    pub total_runtime: Duration,
    pub cancelled: bool,
    pub running: bool,
}

impl Task {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            next_run: self.next_run_time,
            priority: self.effective_priority,
            id: self.id,
        }
    }

    pub fn reset_priority(&mut self) {
        self.ready_since = None;
        self.starved_rounds = 0;
        self.effective_priority = self.priority;
    }
}

/// Point-in-time view of one task, for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub handle: TaskHandle,
    pub name: String,
    pub kind: TaskKind,
    pub priority: u8,
    pub effective_priority: u8,
    pub next_run_time: Duration,
    pub execution_count: u64,
    pub total_runtime: Duration,
    pub running: bool,
    pub cancelled: bool,
}

impl TaskSnapshot {
    pub(crate) fn of(task: &Task) -> Self {
        Self {
            handle: TaskHandle(task.id),
            name: task.name.clone(),
            kind: task.kind,
            priority: task.priority,
            effective_priority: task.effective_priority,
            next_run_time: task.next_run_time,
            execution_count: task.execution_count,
            total_runtime: task.total_runtime,
            running: task.running,
            cancelled: task.cancelled,
        }
    }
}
