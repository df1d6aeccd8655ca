//! The per-thread scheduler core
//!
//! A [`TaskLoop`] owns the ready, delayed, and deferred task queues of
//! one thread and implements the [`PumpDelegate`] side of the drive
//! contract. Construction binds the loop to the calling thread for the
//! rest of its life; the handle is an `Rc`, so it cannot leave that
//! thread, and cross-thread access goes through [`TaskRunner`] handles
//! backed by the shared ingress queue.

use crate::ingress::IngressQueue;
use crate::observer::{DestructionObserver, TaskObserver};
use crate::pump::{Pump, PumpDefault, PumpDelegate, TimerSlack};
use crate::run_loop::RunLoopShared;
use crate::runner::TaskRunner;
use crate::task::PendingTask;
use crate::time;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::mem;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

thread_local! {
    /// The scheduler bound to this thread, if any. Weak so that
    /// dropping the owning handle actually tears the scheduler down.
    static CURRENT_LOOP: RefCell<Weak<TaskLoop>> = RefCell::new(Weak::new());
}

/// Entry in the delayed-task min-heap.
struct DelayedEntry {
    /// When the task becomes eligible to run.
    run_time: Instant,
    /// Post-order tie-break for identical run times.
    sequence_num: u64,
    /// The record itself.
    task: PendingTask,
}

impl DelayedEntry {
    fn new(run_time: Instant, task: PendingTask) -> Self {
        let sequence_num = task.sequence_num();
        Self {
            run_time,
            sequence_num,
            task,
        }
    }
}

// Reverse ordering for min-heap (earliest run time first); the
// sequence number breaks ties so equal deadlines pop in post order.
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_time
            .cmp(&self.run_time)
            .then_with(|| other.sequence_num.cmp(&self.sequence_num))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_time == other.run_time && self.sequence_num == other.sequence_num
    }
}

impl Eq for DelayedEntry {}

/// Consumer-side queues and flags. Only ever touched by the bound
/// thread, so a `RefCell` suffices; no borrow is held while a task
/// body, observer hook, or task destructor runs.
struct LoopState {
    /// Tasks claimed from the ingress queue, awaiting execution.
    work_queue: VecDeque<PendingTask>,
    /// Tasks whose run time has not yet arrived, earliest first.
    delayed_work_queue: BinaryHeap<DelayedEntry>,
    /// Non-nestable tasks parked while a nested session was active.
    deferred_non_nestable_work_queue: VecDeque<PendingTask>,
    /// Reentrancy guard: false while a task is executing, unless a
    /// nested session explicitly re-allows application tasks.
    nestable_tasks_allowed: bool,
    /// Stack of active run sessions, innermost last.
    run_loops: Vec<Arc<RunLoopShared>>,
    /// Origin of the task currently being executed, for diagnostics.
    current_task_origin: Option<&'static Location<'static>>,
    /// Cached clock reading; batches due-checks while catching up.
    recent_time: Option<Instant>,
    /// Claimed delayed tasks inside the high-resolution window.
    pending_high_res_tasks: usize,
    /// Whether this scheduler currently holds a high-res timer claim.
    in_high_res_mode: bool,
    task_observers: Vec<Rc<dyn TaskObserver>>,
    destruction_observers: Vec<Rc<dyn DestructionObserver>>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            work_queue: VecDeque::new(),
            delayed_work_queue: BinaryHeap::new(),
            deferred_non_nestable_work_queue: VecDeque::new(),
            nestable_tasks_allowed: true,
            run_loops: Vec::new(),
            current_task_origin: None,
            recent_time: None,
            pending_high_res_tasks: 0,
            in_high_res_mode: false,
            task_observers: Vec::new(),
            destruction_observers: Vec::new(),
        }
    }
}

/// A per-thread cooperative scheduler.
///
/// Exactly one `TaskLoop` may be bound to a thread at a time; the
/// constructors bind to the calling thread and panic on a double bind.
/// Tasks always run to completion on that thread, one at a time, in
/// the order described on [`TaskRunner`].
///
/// The loop only makes progress while a [`RunLoop`](crate::RunLoop)
/// session drives it. Dropping the last `Rc` tears the scheduler down:
/// still-queued tasks are destroyed without running and the ingress
/// queue stops accepting posts.
pub struct TaskLoop {
    ingress: Arc<IngressQueue>,
    pump: Arc<dyn Pump>,
    state: RefCell<LoopState>,
}

impl TaskLoop {
    /// Create a scheduler driven by [`PumpDefault`] and bind it to the
    /// calling thread.
    ///
    /// Panics if the thread already has a `TaskLoop`.
    pub fn new() -> Rc<Self> {
        Self::with_pump(PumpDefault::new())
    }

    /// Create a scheduler driven by a custom pump and bind it to the
    /// calling thread.
    ///
    /// Panics if the thread already has a `TaskLoop`.
    pub fn with_pump<P: Pump + 'static>(pump: P) -> Rc<Self> {
        Self::bind(Arc::new(IngressQueue::new()), Arc::new(pump))
    }

    /// Bind a scheduler for an already-shared ingress queue. Used when
    /// the queue must exist before the scheduler thread starts.
    pub(crate) fn bind(ingress: Arc<IngressQueue>, pump: Arc<dyn Pump>) -> Rc<Self> {
        let task_loop = Rc::new(Self {
            ingress,
            pump,
            state: RefCell::new(LoopState::new()),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.upgrade().is_none(),
                "a TaskLoop is already bound to this thread"
            );
            *current = Rc::downgrade(&task_loop);
        });

        // Producers may already have queued work; arrange the first wake.
        task_loop.ingress.attach_pump(Arc::clone(&task_loop.pump));
        debug!("task loop bound to current thread");
        task_loop
    }

    /// The scheduler bound to the calling thread, if any.
    pub fn current() -> Option<Rc<Self>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    /// A cloneable handle for posting tasks to this scheduler from any
    /// thread.
    pub fn task_runner(&self) -> TaskRunner {
        TaskRunner::new(Arc::clone(&self.ingress))
    }

    /// Whether a run session is currently driving this scheduler.
    pub fn is_running(&self) -> bool {
        !self.state.borrow().run_loops.is_empty()
    }

    /// Whether more than one run session is active, i.e. a task started
    /// a session of its own.
    pub fn is_nested(&self) -> bool {
        self.state.borrow().run_loops.len() > 1
    }

    /// Origin of the task currently being executed, if one is running.
    pub fn current_task_origin(&self) -> Option<&'static Location<'static>> {
        self.state.borrow().current_task_origin
    }

    /// Forward a timer coalescing hint to the pump.
    pub fn set_timer_slack(&self, slack: TimerSlack) {
        self.pump.set_timer_slack(slack);
    }

    /// Register an observer for every task this scheduler executes.
    pub fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.state.borrow_mut().task_observers.push(observer);
    }

    /// Unregister a task observer by identity. Takes effect from the
    /// next task onward.
    pub fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.state
            .borrow_mut()
            .task_observers
            .retain(|registered| !Rc::ptr_eq(registered, observer));
    }

    /// Register an observer notified when this scheduler is destroyed.
    pub fn add_destruction_observer(&self, observer: Rc<dyn DestructionObserver>) {
        self.state.borrow_mut().destruction_observers.push(observer);
    }

    /// Unregister a destruction observer by identity.
    pub fn remove_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.state
            .borrow_mut()
            .destruction_observers
            .retain(|registered| !Rc::ptr_eq(registered, observer));
    }

    // ========================================================================
    // Run-session plumbing
    // ========================================================================

    /// Push a session frame; returns the resulting nesting depth.
    pub(crate) fn push_run_loop(&self, shared: Arc<RunLoopShared>) -> usize {
        let mut state = self.state.borrow_mut();
        state.run_loops.push(shared);
        state.run_loops.len()
    }

    pub(crate) fn pop_run_loop(&self) -> Option<Arc<RunLoopShared>> {
        self.state.borrow_mut().run_loops.pop()
    }

    pub(crate) fn top_run_loop(&self) -> Option<Arc<RunLoopShared>> {
        self.state.borrow().run_loops.last().cloned()
    }

    /// Ask the pump to end its innermost run.
    pub(crate) fn quit_pump(&self) {
        self.pump.quit();
    }

    /// Enter the pump, optionally lifting the reentrancy guard so the
    /// nested session may execute application tasks.
    pub(crate) fn run_pump(&self, allow_application_tasks: bool) {
        let lifted = {
            let mut state = self.state.borrow_mut();
            if allow_application_tasks && !state.nestable_tasks_allowed {
                state.nestable_tasks_allowed = true;
                true
            } else {
                false
            }
        };
        self.pump.run(self);
        if lifted {
            self.state.borrow_mut().nestable_tasks_allowed = false;
        }
    }

    // ========================================================================
    // Queue management
    // ========================================================================

    /// Claim the ingress backlog, but only once the ready queue is
    /// empty; that amortizes the lock over whole bursts.
    fn reload_work_queue(&self) {
        let mut state = self.state.borrow_mut();
        if state.work_queue.is_empty() {
            let claimed_high_res = self.ingress.reload_work_queue(&mut state.work_queue);
            state.pending_high_res_tasks += claimed_high_res;
        }
    }

    /// Run `pending` now if it may run in the current session, else
    /// park it on the deferred queue. Returns whether it ran.
    fn defer_or_run_pending_task(&self, pending: PendingTask) -> bool {
        let nested = self.is_nested();
        if pending.is_nestable() || !nested {
            self.run_task(pending);
            true
        } else {
            self.state
                .borrow_mut()
                .deferred_non_nestable_work_queue
                .push_back(pending);
            false
        }
    }

    /// Execute one task with the reentrancy guard held and observers
    /// notified around it.
    fn run_task(&self, mut pending: PendingTask) {
        let observers = {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.nestable_tasks_allowed);
            if pending.is_high_res() {
                state.pending_high_res_tasks -= 1;
            }
            // Assume the task is not reentrant until it proves otherwise
            // by starting a nested session that allows application tasks.
            state.nestable_tasks_allowed = false;
            state.current_task_origin = Some(pending.posted_from());
            state.task_observers.clone()
        };

        for observer in &observers {
            observer.will_process_task(&pending);
        }
        if let Some(task) = pending.take_task() {
            task();
        }
        for observer in &observers {
            observer.did_process_task(&pending);
        }

        let mut state = self.state.borrow_mut();
        state.current_task_origin = None;
        state.nestable_tasks_allowed = true;
    }

    /// Run one deferred non-nestable task if nesting has unwound.
    fn process_next_deferred_task(&self) -> bool {
        loop {
            let pending = {
                let mut state = self.state.borrow_mut();
                if state.run_loops.len() > 1 {
                    return false;
                }
                state.deferred_non_nestable_work_queue.pop_front()
            };
            match pending {
                None => return false,
                Some(pending) if pending.is_canceled() => {
                    if pending.is_high_res() {
                        self.state.borrow_mut().pending_high_res_tasks -= 1;
                    }
                    // Dropped with no borrow held; the destructor is
                    // user code.
                    drop(pending);
                }
                Some(pending) => {
                    self.run_task(pending);
                    return true;
                }
            }
        }
    }

    /// Find the earliest due delayed task, pruning canceled entries off
    /// the front. Canceled entries land in `canceled` so the caller can
    /// drop them once the state borrow is released.
    fn pick_due_delayed_task(
        &self,
        state: &mut LoopState,
        canceled: &mut Vec<DelayedEntry>,
        next_delayed_work_time: &mut Option<Instant>,
    ) -> Option<PendingTask> {
        if !state.nestable_tasks_allowed {
            state.recent_time = None;
            *next_delayed_work_time = None;
            return None;
        }

        while state
            .delayed_work_queue
            .peek()
            .is_some_and(|entry| entry.task.is_canceled())
        {
            if let Some(entry) = state.delayed_work_queue.pop() {
                if entry.task.is_high_res() {
                    state.pending_high_res_tasks -= 1;
                }
                canceled.push(entry);
            }
        }

        let next_run_time = match state.delayed_work_queue.peek() {
            Some(front) => front.run_time,
            None => {
                state.recent_time = None;
                *next_delayed_work_time = None;
                return None;
            }
        };

        // Consult the cached clock first and re-sample only when it says
        // nothing is due. While the loop is catching up after falling
        // behind, whole batches of due tasks run against one clock read.
        if state
            .recent_time
            .map_or(true, |recent| next_run_time > recent)
        {
            let now = Instant::now();
            state.recent_time = Some(now);
            if next_run_time > now {
                *next_delayed_work_time = Some(next_run_time);
                return None;
            }
        }

        let entry = state.delayed_work_queue.pop()?;
        if let Some(front) = state.delayed_work_queue.peek() {
            *next_delayed_work_time = Some(front.run_time);
        }
        Some(entry.task)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Discard every queued task. Returns whether anything was dropped.
    fn delete_pending_tasks(&self) -> bool {
        let (ready, delayed, deferred) = {
            let mut state = self.state.borrow_mut();
            (
                mem::take(&mut state.work_queue),
                mem::take(&mut state.delayed_work_queue),
                mem::take(&mut state.deferred_non_nestable_work_queue),
            )
        };
        let did_work = !ready.is_empty() || !delayed.is_empty() || !deferred.is_empty();

        if did_work {
            let discarded_high_res = ready
                .iter()
                .chain(deferred.iter())
                .filter(|task| task.is_high_res())
                .count()
                + delayed.iter().filter(|entry| entry.task.is_high_res()).count();
            self.state.borrow_mut().pending_high_res_tasks -= discarded_high_res;
        }

        // Destructors run after every borrow is released; destroying a
        // task can post more tasks or touch the loop.
        drop((ready, delayed, deferred));
        did_work
    }
}

impl PumpDelegate for TaskLoop {
    fn do_work(&self) -> bool {
        if !self.state.borrow().nestable_tasks_allowed {
            return false;
        }

        loop {
            self.reload_work_queue();
            let Some(pending) = self.state.borrow_mut().work_queue.pop_front() else {
                return false;
            };

            if pending.is_canceled() {
                if pending.is_high_res() {
                    self.state.borrow_mut().pending_high_res_tasks -= 1;
                }
                // Dropped with no borrow held; the destructor is user code.
                drop(pending);
                continue;
            }

            if let Some(run_time) = pending.delayed_run_time() {
                let sequence_num = pending.sequence_num();
                let reschedule = {
                    let mut state = self.state.borrow_mut();
                    state
                        .delayed_work_queue
                        .push(DelayedEntry::new(run_time, pending));
                    // Only a new earliest entry moves the wake deadline.
                    state
                        .delayed_work_queue
                        .peek()
                        .is_some_and(|front| front.sequence_num == sequence_num)
                };
                if reschedule {
                    self.pump.schedule_delayed_work(run_time);
                }
                continue;
            }

            // Execute-or-defer; either way this pass made progress.
            self.defer_or_run_pending_task(pending);
            return true;
        }
    }

    fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
        let mut canceled: Vec<DelayedEntry> = Vec::new();
        let due = {
            let mut state = self.state.borrow_mut();
            self.pick_due_delayed_task(&mut state, &mut canceled, next_delayed_work_time)
        };
        // Canceled entries carry user destructors; drop them with no
        // borrow held.
        drop(canceled);

        match due {
            Some(pending) => {
                self.defer_or_run_pending_task(pending);
                true
            }
            None => false,
        }
    }

    fn do_idle_work(&self) -> bool {
        if self.process_next_deferred_task() {
            return true;
        }

        let quit_requested = self
            .top_run_loop()
            .is_some_and(|top| top.quit_when_idle_requested());
        if quit_requested {
            self.pump.quit();
        }

        // About to block; reconcile the process-wide high-res timer
        // claim with what is actually queued.
        let toggle = {
            let mut state = self.state.borrow_mut();
            let high_res = state.pending_high_res_tasks > 0;
            if high_res != state.in_high_res_mode {
                state.in_high_res_mode = high_res;
                Some(high_res)
            } else {
                None
            }
        };
        if let Some(activating) = toggle {
            time::activate_high_resolution_timer(activating);
        }
        false
    }
}

impl Drop for TaskLoop {
    fn drop(&mut self) {
        // Skip the usage assert while unwinding; a second panic here
        // would turn a clean test failure into an abort.
        if !std::thread::panicking() {
            assert!(
                self.state.borrow().run_loops.is_empty(),
                "task loop destroyed while a run session is active"
            );
        }

        // Destroying a task can post more tasks, so deletion runs in
        // passes. A fixed pass limit keeps a pathological cascade from
        // hanging teardown; whatever it leaves behind is abandoned in
        // the ingress queue.
        let mut did_work = false;
        for _ in 0..100 {
            self.delete_pending_tasks();
            self.reload_work_queue();
            did_work = self.delete_pending_tasks();
            if !did_work {
                break;
            }
        }
        if did_work {
            debug_assert!(false, "task destructors kept spawning tasks all through teardown");
            warn!("teardown pass limit hit with tasks still arriving, abandoning the rest");
        }

        // Interested parties get one last notification before the
        // ingress queue closes. The loop goes by reference because the
        // thread-local lookup no longer resolves while the owner drops.
        let destruction_observers = mem::take(&mut self.state.borrow_mut().destruction_observers);
        for observer in &destruction_observers {
            observer.will_destroy_current_task_loop(self);
        }

        self.ingress.shutdown();

        let release_high_res = {
            let mut state = self.state.borrow_mut();
            mem::take(&mut state.in_high_res_mode)
        };
        if release_high_res {
            time::activate_high_resolution_timer(false);
        }

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            // A loop that lost the bind race unwinds through here while
            // the slot still belongs to the established loop.
            if std::ptr::eq(current.as_ptr(), self) {
                *current = Weak::new();
            }
        });
        debug!("task loop unbound from current thread");
    }
}
