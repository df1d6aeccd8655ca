//! Run sessions: entering, nesting, and quitting the scheduler
//!
//! A [`RunLoop`] is one synchronous session of driving the current
//! thread's [`TaskLoop`]. Sessions nest: a task may construct and run
//! its own `RunLoop`, which borrows the thread until it quits. Quits
//! address a specific session; quitting an outer session while an
//! inner one is active is remembered and applied the instant the inner
//! session unwinds.

use crate::task_loop::TaskLoop;
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::runner::TaskRunner;

thread_local! {
    /// One-way latch: once nesting is disallowed on a thread it stays
    /// disallowed for the thread's lifetime.
    static NESTING_ALLOWED: Cell<bool> = const { Cell::new(true) };
}

/// What a session lets the scheduler execute while it is nested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunLoopType {
    /// A nested session of this type does not execute application
    /// tasks; they queue up until control returns to the outer session.
    /// This only makes sense for pumps with their own event sources.
    #[default]
    Default,
    /// A nested session of this type executes application tasks, ending
    /// the run-to-completion guarantee of the task that started it.
    NestableTasksAllowed,
}

/// Session state shared between a [`RunLoop`], its [`QuitHandle`]s, and
/// the scheduler's session stack.
pub(crate) struct RunLoopShared {
    /// Runner of the loop this session belongs to; also the re-posting
    /// path for cross-thread quits.
    runner: TaskRunner,
    /// Set by `quit`. On a non-topmost session this is the deferred
    /// quit bit, honored when the session above it unwinds.
    quit_called: AtomicBool,
    /// Set by `quit_when_idle`; checked each time the session idles.
    quit_when_idle: AtomicBool,
    /// True between session start and session end.
    running: AtomicBool,
}

impl RunLoopShared {
    fn new(runner: TaskRunner) -> Arc<Self> {
        Arc::new(Self {
            runner,
            quit_called: AtomicBool::new(false),
            quit_when_idle: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub(crate) fn quit_called(&self) -> bool {
        self.quit_called.load(Ordering::Acquire)
    }

    pub(crate) fn quit_when_idle_requested(&self) -> bool {
        self.quit_when_idle.load(Ordering::Acquire)
    }

    /// Quit on the session's owning thread: mark the session, and stop
    /// the pump now if the session is the active topmost one.
    fn apply_quit(shared: &Arc<Self>) {
        shared.quit_called.store(true, Ordering::Release);
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        if let Some(task_loop) = TaskLoop::current() {
            let is_topmost = task_loop
                .top_run_loop()
                .is_some_and(|top| Arc::ptr_eq(&top, shared));
            if is_topmost {
                trace!("quitting topmost run session");
                task_loop.quit_pump();
            }
        }
    }

    fn apply_quit_when_idle(&self) {
        self.quit_when_idle.store(true, Ordering::Release);
    }
}

/// Stops a [`RunLoop`] session from anywhere.
///
/// If a quit is requested from a thread other than the session's own,
/// the request is posted to that thread and applied there, keeping all
/// session state single-threaded. A handle whose scheduler is already
/// gone quits nothing and is silently inert.
#[derive(Clone)]
pub struct QuitHandle {
    shared: Arc<RunLoopShared>,
}

impl QuitHandle {
    /// End the session. Synchronous when called on the owning thread
    /// against the topmost session; otherwise takes effect when the
    /// session becomes topmost (or, cross-thread, when the posted
    /// request runs).
    pub fn quit(&self) {
        if self.shared.runner.runs_tasks_in_current_sequence() {
            RunLoopShared::apply_quit(&self.shared);
        } else {
            let shared = Arc::clone(&self.shared);
            let _ = self.shared.runner.post(move || {
                RunLoopShared::apply_quit(&shared);
            });
        }
    }

    /// End the session the next time it runs out of immediate work.
    pub fn quit_when_idle(&self) {
        if self.shared.runner.runs_tasks_in_current_sequence() {
            self.shared.apply_quit_when_idle();
        } else {
            let shared = Arc::clone(&self.shared);
            let _ = self.shared.runner.post(move || {
                shared.apply_quit_when_idle();
            });
        }
    }
}

/// One session of running the current thread's scheduler.
///
/// Constructing a `RunLoop` requires a bound [`TaskLoop`]; the session
/// is pinned to that scheduler and cannot move to another thread.
/// [`run`](Self::run) drives it until the session is quit. Each
/// `RunLoop` runs at most once.
pub struct RunLoop {
    shared: Arc<RunLoopShared>,
    /// Scheduler this session was created against; `run` refuses any
    /// other. Also what keeps the session off foreign threads.
    task_loop: Weak<TaskLoop>,
    run_type: RunLoopType,
    run_called: bool,
}

impl RunLoop {
    /// Create a session of the default type on the current thread.
    ///
    /// Panics if the thread has no bound `TaskLoop`.
    pub fn new() -> Self {
        Self::with_type(RunLoopType::default())
    }

    /// Create a session of the given type on the current thread.
    ///
    /// Panics if the thread has no bound `TaskLoop`.
    pub fn with_type(run_type: RunLoopType) -> Self {
        let task_loop =
            TaskLoop::current().expect("RunLoop requires a TaskLoop bound to the current thread");
        Self {
            shared: RunLoopShared::new(task_loop.task_runner()),
            task_loop: Rc::downgrade(&task_loop),
            run_type,
            run_called: false,
        }
    }

    /// Drive the scheduler until this session is quit.
    ///
    /// Returns immediately if [`quit`](Self::quit) was already called.
    /// Panics if called twice, if this would nest on a thread where
    /// nesting has been disallowed, or if the thread's scheduler is no
    /// longer the one the session was created for.
    pub fn run(&mut self) {
        assert!(!self.run_called, "a RunLoop session may only run once");
        self.run_called = true;

        let task_loop =
            TaskLoop::current().expect("RunLoop requires a TaskLoop bound to the current thread");
        assert!(
            self.task_loop
                .upgrade()
                .is_some_and(|created_on| Rc::ptr_eq(&created_on, &task_loop)),
            "run session driving a different task loop than the one it was created for"
        );

        let Some(depth) = self.before_run(&task_loop) else {
            return;
        };

        // Only a nested session of the nestable type re-allows
        // application tasks; the topmost session always allows them.
        let allow_application_tasks =
            self.run_type == RunLoopType::NestableTasksAllowed || depth == 1;
        task_loop.run_pump(allow_application_tasks);

        self.after_run(&task_loop);
    }

    /// Run until the scheduler has no immediate work left.
    pub fn run_until_idle(&mut self) {
        self.shared.apply_quit_when_idle();
        self.run();
    }

    /// End this session; see [`QuitHandle::quit`].
    pub fn quit(&self) {
        self.quit_handle().quit();
    }

    /// End this session once idle; see [`QuitHandle::quit_when_idle`].
    pub fn quit_when_idle(&self) {
        self.quit_handle().quit_when_idle();
    }

    /// A cloneable, any-thread handle that quits this session.
    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether this session is currently between start and end.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Permanently forbid nested sessions on the calling thread.
    /// Starting one afterwards is a fatal usage error.
    pub fn disallow_nesting_on_current_thread() {
        NESTING_ALLOWED.set(false);
    }

    /// Whether nested sessions are still allowed on the calling thread.
    pub fn is_nesting_allowed_on_current_thread() -> bool {
        NESTING_ALLOWED.get()
    }

    /// Push this session onto the stack. Returns the session depth, or
    /// `None` if the session was quit before it started.
    fn before_run(&self, task_loop: &Rc<TaskLoop>) -> Option<usize> {
        if self.shared.quit_called() {
            return None;
        }
        let depth = task_loop.push_run_loop(Arc::clone(&self.shared));
        if depth > 1 {
            assert!(
                NESTING_ALLOWED.get(),
                "nested run session on a thread where nesting is disallowed"
            );
            trace!(depth, "entering nested run session");
        }
        self.shared.running.store(true, Ordering::Release);
        Some(depth)
    }

    /// Pop this session and apply a deferred quit to the session it
    /// uncovers.
    fn after_run(&self, task_loop: &Rc<TaskLoop>) {
        self.shared.running.store(false, Ordering::Release);

        let popped = task_loop.pop_run_loop();
        assert!(
            popped.is_some_and(|popped| Arc::ptr_eq(&popped, &self.shared)),
            "run session stack mismatch at session end"
        );

        if let Some(uncovered) = task_loop.top_run_loop() {
            if uncovered.quit_called() {
                task_loop.quit_pump();
            }
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_loop::TaskLoop;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_run_until_idle_runs_queued_tasks() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = Arc::clone(&count);
            runner.post(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        RunLoop::new().run_until_idle();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_quit_before_run_never_starts_the_session() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let ran = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&ran);
        runner.post(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });

        let mut run_loop = RunLoop::new();
        run_loop.quit();
        run_loop.run();
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        // The task is still queued; a fresh session picks it up.
        RunLoop::new().run_until_idle();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_quit_inside_task_stops_promptly() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut run_loop = RunLoop::new();
        let quit_handle = run_loop.quit_handle();

        let first = Arc::clone(&log);
        runner.post(move || {
            first.lock().push("first");
            quit_handle.quit();
        });
        let second = Arc::clone(&log);
        runner.post(move || {
            second.lock().push("second");
        });

        run_loop.run();
        assert_eq!(*log.lock(), vec!["first"]);

        // The unstarted task stayed queued rather than being dropped.
        RunLoop::new().run_until_idle();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_quit_when_idle_runs_exactly_the_backlog() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            runner.post(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        let mut run_loop = RunLoop::new();
        run_loop.quit_when_idle();
        run_loop.run();
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_is_running_observed_from_inside_a_task() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let observed = Arc::new(AtomicUsize::new(0));

        assert!(!task_loop.is_running());
        let seen = Arc::clone(&observed);
        runner.post(move || {
            let current = TaskLoop::current().unwrap();
            if current.is_running() && !current.is_nested() {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });

        RunLoop::new().run_until_idle();
        assert_eq!(observed.load(Ordering::Relaxed), 1);
        assert!(!task_loop.is_running());
    }

    #[test]
    #[should_panic(expected = "only run once")]
    fn test_second_run_panics() {
        let _task_loop = TaskLoop::new();
        let mut run_loop = RunLoop::new();
        run_loop.run_until_idle();
        run_loop.run();
    }

    #[test]
    #[should_panic(expected = "requires a TaskLoop")]
    fn test_run_loop_without_task_loop_panics() {
        let _run_loop = RunLoop::new();
    }

    #[test]
    #[should_panic(expected = "different task loop")]
    fn test_run_refuses_a_replacement_task_loop() {
        let first = TaskLoop::new();
        let mut run_loop = RunLoop::new();
        drop(first);

        // Same thread, new scheduler: the stale session quits to the
        // old runner and must not be allowed to drive this one.
        let _second = TaskLoop::new();
        run_loop.run();
    }

    #[test]
    fn test_nesting_allowed_is_the_default() {
        assert!(RunLoop::is_nesting_allowed_on_current_thread());
    }

    #[test]
    #[should_panic(expected = "nesting is disallowed")]
    fn test_nested_session_panics_once_disallowed() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();

        RunLoop::disallow_nesting_on_current_thread();
        assert!(!RunLoop::is_nesting_allowed_on_current_thread());

        runner.post(|| {
            RunLoop::with_type(RunLoopType::NestableTasksAllowed).run_until_idle();
        });
        RunLoop::new().run_until_idle();
    }

    #[test]
    fn test_quit_handle_outlives_the_session() {
        let task_loop = TaskLoop::new();
        let handle = {
            let mut run_loop = RunLoop::new();
            run_loop.run_until_idle();
            run_loop.quit_handle()
        };
        // The session is over; quitting again must be harmless.
        handle.quit();
        handle.quit_when_idle();
        drop(task_loop);
        handle.quit();
    }

    #[test]
    fn test_delayed_task_fires_through_a_full_run() {
        let task_loop = TaskLoop::new();
        let runner = task_loop.task_runner();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut run_loop = RunLoop::new();
        let quit_handle = run_loop.quit_handle();

        let delayed = Arc::clone(&log);
        runner.post_delayed(
            move || {
                delayed.lock().push("delayed");
                quit_handle.quit();
            },
            Duration::from_millis(30),
        );
        let immediate = Arc::clone(&log);
        runner.post(move || {
            immediate.lock().push("immediate");
        });

        let started = std::time::Instant::now();
        run_loop.run();

        assert_eq!(*log.lock(), vec!["immediate", "delayed"]);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
