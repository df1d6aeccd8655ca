//! Observer traits for task execution and scheduler teardown

use crate::task::PendingTask;
use crate::task_loop::TaskLoop;

/// Observes every task executed by the scheduler it is registered on.
///
/// Both hooks run on the scheduler thread, outside any internal
/// borrows, so an observer may post tasks or adjust the observer list.
/// Changes to the list take effect from the next task onward.
pub trait TaskObserver {
    /// Called immediately before `pending` is executed.
    fn will_process_task(&self, pending: &PendingTask);

    /// Called immediately after `pending` finished executing.
    fn did_process_task(&self, pending: &PendingTask);
}

/// Notified when the scheduler on the current thread is being destroyed.
///
/// The hook runs on the scheduler thread during teardown, after queued
/// tasks have been dropped but before the ingress queue shuts down.
/// The dying scheduler is handed in by reference; the thread-local
/// [`TaskLoop::current`] lookup already reports no scheduler at this
/// point, because the owning handle is mid-drop. Posting new work from
/// the hook is futile: the post is accepted but the task is destroyed
/// unrun moments later.
pub trait DestructionObserver {
    /// Called once as `task_loop`, the current thread's scheduler,
    /// shuts down.
    fn will_destroy_current_task_loop(&self, task_loop: &TaskLoop);
}
