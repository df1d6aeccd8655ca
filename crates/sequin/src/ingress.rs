//! Cross-thread ingress queue
//!
//! Producers on any thread enqueue task records here under a single
//! lock; the scheduler thread drains the whole backlog in one swap.
//! The queue outlives the scheduler it feeds: every
//! [`TaskRunner`](crate::TaskRunner) holds a reference, and posts made
//! after the scheduler is gone fail cleanly instead of dangling.

use crate::pump::Pump;
use crate::task::{PendingTask, Task};
use crate::time;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::panic::Location;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Shared mailbox between task runners and one scheduler.
pub(crate) struct IngressQueue {
    state: Mutex<IngressState>,
}

struct IngressState {
    /// Task records posted but not yet claimed by the scheduler thread.
    queue: VecDeque<PendingTask>,
    /// Next sequence number to assign; increases monotonically.
    next_sequence_num: u64,
    /// False once the scheduler has shut down; posts then fail.
    accept_new_tasks: bool,
    /// True while a wake has been issued but the backlog not yet drained.
    pump_scheduled: bool,
    /// Queued delayed tasks short enough to need the high-res timer.
    high_res_task_count: usize,
    /// Wake target; `None` until a scheduler attaches, and again after
    /// shutdown. Doubles as the liveness flag for the consumer side.
    pump: Option<Arc<dyn Pump>>,
    /// Thread the attached scheduler runs on. Survives shutdown so
    /// thread-affinity queries stay answerable.
    bound_thread: Option<ThreadId>,
}

impl IngressQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(IngressState {
                queue: VecDeque::new(),
                next_sequence_num: 0,
                accept_new_tasks: true,
                pump_scheduled: false,
                high_res_task_count: 0,
                pump: None,
                bound_thread: None,
            }),
        }
    }

    /// Enqueue a task, waking the pump if the consumer may be asleep.
    ///
    /// Returns false if the scheduler has shut down; the task is then
    /// dropped without running. A wake is issued only when the backlog
    /// was empty and no earlier wake is still outstanding, so a burst
    /// of posts costs a single wake.
    pub(crate) fn post_task(
        &self,
        task: Task,
        posted_from: &'static Location<'static>,
        delay: Option<Duration>,
        nestable: bool,
    ) -> bool {
        let delayed_run_time = delay
            .filter(|delay| !delay.is_zero())
            .map(|delay| Instant::now() + delay);
        let is_high_res = time::requires_high_res_timer(delay);
        let mut pending = PendingTask::new(task, posted_from, delayed_run_time, nestable, is_high_res);

        let mut state = self.state.lock();
        if !state.accept_new_tasks {
            drop(state);
            // `pending` drops here, outside the lock: its destructor is
            // user code and may post again.
            debug!(posted_from = %posted_from, "post rejected, scheduler has shut down");
            return false;
        }

        pending.sequence_num = state.next_sequence_num;
        state.next_sequence_num += 1;
        if is_high_res {
            state.high_res_task_count += 1;
        }

        let was_empty = state.queue.is_empty();
        state.queue.push_back(pending);

        let wake = if was_empty && !state.pump_scheduled {
            let pump = state.pump.clone();
            if pump.is_some() {
                state.pump_scheduled = true;
            }
            pump
        } else {
            None
        };
        drop(state);

        if let Some(pump) = wake {
            trace!("waking pump for new backlog");
            pump.schedule_work();
        }
        true
    }

    /// Bind the consumer side: record the scheduler thread and the pump
    /// to wake. Wakes immediately if posts arrived before the attach.
    pub(crate) fn attach_pump(&self, pump: Arc<dyn Pump>) {
        let wake = {
            let mut state = self.state.lock();
            assert!(
                state.pump.is_none(),
                "ingress queue is already attached to a scheduler"
            );
            state.bound_thread = Some(thread::current().id());
            state.pump = Some(Arc::clone(&pump));
            if !state.queue.is_empty() && !state.pump_scheduled {
                state.pump_scheduled = true;
                true
            } else {
                false
            }
        };
        if wake {
            pump.schedule_work();
        }
    }

    /// Swap the entire backlog into `work_queue` and clear the wake
    /// latch. Returns how many of the claimed tasks were counted as
    /// high-resolution. Consumer-only; `work_queue` must be empty.
    pub(crate) fn reload_work_queue(&self, work_queue: &mut VecDeque<PendingTask>) -> usize {
        debug_assert!(work_queue.is_empty());
        let mut state = self.state.lock();
        mem::swap(&mut state.queue, work_queue);
        state.pump_scheduled = false;
        mem::take(&mut state.high_res_task_count)
    }

    /// Stop accepting tasks and destroy whatever is still queued.
    /// Consumer-only, called once at scheduler teardown.
    pub(crate) fn shutdown(&self) {
        let orphaned = {
            let mut state = self.state.lock();
            state.accept_new_tasks = false;
            state.pump = None;
            state.pump_scheduled = false;
            state.high_res_task_count = 0;
            mem::take(&mut state.queue)
        };
        if !orphaned.is_empty() {
            debug!(count = orphaned.len(), "dropping unclaimed tasks at shutdown");
        }
        // Destructors run outside the lock; they may post, and the post
        // must fail cleanly rather than deadlock.
        drop(orphaned);
    }

    /// Whether the calling thread is the one the scheduler runs on.
    pub(crate) fn runs_tasks_in_current_sequence(&self) -> bool {
        self.state.lock().bound_thread == Some(thread::current().id())
    }
}
