//! Posting handle shared across threads

use crate::ingress::IngressQueue;
use crate::task::Task;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

/// Posts tasks to one scheduler from any thread.
///
/// Handles are cheap to clone and may outlive the scheduler they feed;
/// posts made after the scheduler has shut down return false and the
/// task is dropped without running.
///
/// Every post captures its call site, which observers can read back
/// from [`PendingTask::posted_from`](crate::PendingTask::posted_from).
#[derive(Clone)]
pub struct TaskRunner {
    ingress: Arc<IngressQueue>,
}

impl TaskRunner {
    pub(crate) fn new(ingress: Arc<IngressQueue>) -> Self {
        Self { ingress }
    }

    /// Post a task for FIFO execution.
    #[track_caller]
    pub fn post(&self, task: impl Into<Task>) -> bool {
        self.ingress
            .post_task(task.into(), Location::caller(), None, true)
    }

    /// Post a task to run no earlier than `delay` from now.
    #[track_caller]
    pub fn post_delayed(&self, task: impl Into<Task>, delay: Duration) -> bool {
        self.ingress
            .post_task(task.into(), Location::caller(), Some(delay), true)
    }

    /// Post a task that must not run inside a nested run session.
    #[track_caller]
    pub fn post_non_nestable(&self, task: impl Into<Task>) -> bool {
        self.ingress
            .post_task(task.into(), Location::caller(), None, false)
    }

    /// Post a delayed task that must not run inside a nested run session.
    #[track_caller]
    pub fn post_non_nestable_delayed(&self, task: impl Into<Task>, delay: Duration) -> bool {
        self.ingress
            .post_task(task.into(), Location::caller(), Some(delay), false)
    }

    /// Whether the calling thread is the one this runner's tasks run on.
    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        self.ingress.runs_tasks_in_current_sequence()
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn runner_pair() -> (TaskRunner, Arc<IngressQueue>) {
        let ingress = Arc::new(IngressQueue::new());
        (TaskRunner::new(Arc::clone(&ingress)), ingress)
    }

    #[test]
    fn test_post_variants_set_metadata() {
        let (runner, ingress) = runner_pair();

        assert!(runner.post(|| {}));
        assert!(runner.post_delayed(|| {}, Duration::from_millis(50)));
        assert!(runner.post_non_nestable(|| {}));
        assert!(runner.post_non_nestable_delayed(|| {}, Duration::from_millis(50)));

        let mut claimed = VecDeque::new();
        ingress.reload_work_queue(&mut claimed);
        assert_eq!(claimed.len(), 4);

        assert!(claimed[0].is_nestable());
        assert_eq!(claimed[0].delayed_run_time(), None);

        assert!(claimed[1].is_nestable());
        assert!(claimed[1].delayed_run_time().is_some());

        assert!(!claimed[2].is_nestable());
        assert_eq!(claimed[2].delayed_run_time(), None);

        assert!(!claimed[3].is_nestable());
        assert!(claimed[3].delayed_run_time().is_some());
    }

    #[test]
    fn test_post_captures_the_call_site() {
        let (runner, ingress) = runner_pair();
        runner.post(|| {});

        let mut claimed = VecDeque::new();
        ingress.reload_work_queue(&mut claimed);
        let posted_from = claimed[0].posted_from();
        assert!(posted_from.file().ends_with("runner.rs"));
        assert!(posted_from.line() > 0);
    }

    #[test]
    fn test_clones_feed_the_same_queue() {
        let (runner, ingress) = runner_pair();
        let other = runner.clone();

        runner.post(|| {});
        other.post(|| {});

        let mut claimed = VecDeque::new();
        ingress.reload_work_queue(&mut claimed);
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].sequence_num(), 0);
        assert_eq!(claimed[1].sequence_num(), 1);
    }

    #[test]
    fn test_post_fails_after_shutdown() {
        let (runner, ingress) = runner_pair();
        ingress.shutdown();
        assert!(!runner.post(|| {}));
        assert!(!runner.post_delayed(|| {}, Duration::from_millis(1)));
    }
}
