//! Task records: the unit of work posted to a scheduler
//!
//! A [`Task`] wraps a boxed `FnOnce` closure together with optional
//! cancellation state. Once accepted by the ingress queue it is wrapped
//! in a [`PendingTask`] carrying the scheduling metadata (sequence
//! number, delayed run time, nestability, origin site).

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Boxed callable executed exactly once on the scheduler thread.
pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work that can be posted to a [`TaskRunner`](crate::TaskRunner).
///
/// Any `FnOnce() + Send + 'static` closure converts into a `Task` via
/// `From`, so the posting methods accept plain closures:
///
/// ```rust
/// # use sequin::TaskLoop;
/// let task_loop = TaskLoop::new();
/// task_loop.task_runner().post(|| println!("hello"));
/// ```
///
/// Tasks run to completion and are never migrated between threads. A
/// task that panics unwinds through the scheduler; under the release
/// profile's `panic = "abort"` this terminates the process.
pub struct Task {
    /// The work itself. Consumed on execution.
    run: TaskFn,
    /// Shared cancellation flag, present only for cancelable tasks.
    canceled: Option<Arc<AtomicBool>>,
}

impl Task {
    /// Create a task from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            run: Box::new(f),
            canceled: None,
        }
    }

    /// Create a cancelable task and the handle that revokes it.
    ///
    /// Cancellation is best-effort: a task already being executed is not
    /// interrupted. A canceled task that is still queued is discarded
    /// without running when the scheduler next encounters it.
    pub fn cancelable<F>(f: F) -> (Self, CancelHandle)
    where
        F: FnOnce() + Send + 'static,
    {
        let flag = Arc::new(AtomicBool::new(false));
        let task = Self {
            run: Box::new(f),
            canceled: Some(Arc::clone(&flag)),
        };
        (task, CancelHandle { flag })
    }

    pub(crate) fn into_parts(self) -> (TaskFn, Option<Arc<AtomicBool>>) {
        (self.run, self.canceled)
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Task::new(f)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("cancelable", &self.canceled.is_some())
            .finish_non_exhaustive()
    }
}

/// Revokes a cancelable task created with [`Task::cancelable`].
///
/// The handle is cheap to clone and may be used from any thread. It
/// stays valid after the task has run or been dropped; cancelling at
/// that point is a no-op.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Mark the task as canceled.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A task accepted by the ingress queue, with scheduling metadata.
///
/// This is what [task observers](crate::TaskObserver) see immediately
/// before and after a task is executed.
pub struct PendingTask {
    /// The callable. `None` once the task has been handed to execution.
    run: Option<TaskFn>,
    /// Shared cancellation flag, if the task is cancelable.
    canceled: Option<Arc<AtomicBool>>,
    /// Source location of the post call that submitted this task.
    posted_from: &'static Location<'static>,
    /// Queue-assigned sequence number; the tie-break for equal run times.
    pub(crate) sequence_num: u64,
    /// Earliest time this task may run, or `None` for immediate tasks.
    delayed_run_time: Option<Instant>,
    /// Whether this task may run inside a nested run session.
    nestable: bool,
    /// Whether this task was counted against the high-resolution timer window.
    is_high_res: bool,
}

impl PendingTask {
    pub(crate) fn new(
        task: Task,
        posted_from: &'static Location<'static>,
        delayed_run_time: Option<Instant>,
        nestable: bool,
        is_high_res: bool,
    ) -> Self {
        let (run, canceled) = task.into_parts();
        Self {
            run: Some(run),
            canceled,
            posted_from,
            sequence_num: 0,
            delayed_run_time,
            nestable,
            is_high_res,
        }
    }

    /// Source location of the post call that submitted this task.
    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// Queue-assigned sequence number, strictly increasing in post order.
    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    /// Earliest time this task may run, or `None` for immediate tasks.
    pub fn delayed_run_time(&self) -> Option<Instant> {
        self.delayed_run_time
    }

    /// Whether this task may run inside a nested run session.
    pub fn is_nestable(&self) -> bool {
        self.nestable
    }

    /// Whether this task was counted against the high-resolution timer window.
    pub fn is_high_res(&self) -> bool {
        self.is_high_res
    }

    /// Whether the task has been canceled via its [`CancelHandle`].
    pub fn is_canceled(&self) -> bool {
        self.canceled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Take the callable out for execution. Returns `None` if already taken.
    pub(crate) fn take_task(&mut self) -> Option<TaskFn> {
        self.run.take()
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("posted_from", &self.posted_from)
            .field("sequence_num", &self.sequence_num)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("nestable", &self.nestable)
            .field("is_high_res", &self.is_high_res)
            .finish_non_exhaustive()
    }
}
