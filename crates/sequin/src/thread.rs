//! Owned scheduler threads
//!
//! [`LoopThread`] spawns a thread, binds a [`TaskLoop`] to it, and runs
//! it until asked to stop. The parent gets a [`TaskRunner`] that is
//! valid immediately, even before the thread has finished starting.

use crate::ingress::IngressQueue;
use crate::pump::PumpDefault;
use crate::run_loop::{QuitHandle, RunLoop};
use crate::runner::TaskRunner;
use crate::task_loop::TaskLoop;
use crossbeam::channel;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from starting a scheduler thread.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to create the thread.
    #[error("failed to spawn scheduler thread: {0}")]
    Io(#[from] io::Error),

    /// The thread exited before its scheduler came up.
    #[error("scheduler thread {name:?} exited before becoming ready")]
    Handshake {
        /// Name the thread was being started with.
        name: String,
    },
}

/// A thread whose sole job is running a [`TaskLoop`].
///
/// Work posted through [`task_runner`](Self::task_runner) executes on
/// the owned thread in posting order. Dropping the `LoopThread` stops
/// the scheduler once its immediate backlog is drained and joins the
/// thread; delayed tasks that have not come due are dropped unrun.
pub struct LoopThread {
    name: String,
    runner: TaskRunner,
    quit: QuitHandle,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn a named scheduler thread and wait until it is accepting
    /// work.
    pub fn spawn(name: impl Into<String>) -> Result<Self, SpawnError> {
        let name = name.into();

        // The ingress queue exists before the thread does, so the
        // returned runner can accept posts during startup.
        let ingress = Arc::new(IngressQueue::new());
        let runner = TaskRunner::new(Arc::clone(&ingress));
        let (ready_tx, ready_rx) = channel::bounded(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let task_loop = TaskLoop::bind(ingress, Arc::new(PumpDefault::new()));
                let mut run_loop = RunLoop::new();
                let _ = ready_tx.send(run_loop.quit_handle());
                run_loop.run();
                // Teardown happens here, on the scheduler thread.
                drop(task_loop);
            })?;

        match ready_rx.recv() {
            Ok(quit) => {
                debug!(name = %name, "scheduler thread started");
                Ok(Self {
                    name,
                    runner,
                    quit,
                    handle: Some(handle),
                })
            }
            Err(_) => {
                let _ = handle.join();
                Err(SpawnError::Handshake { name })
            }
        }
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle for posting work to this thread.
    pub fn task_runner(&self) -> TaskRunner {
        self.runner.clone()
    }

    /// Whether the thread has not been stopped yet.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Drain the immediate backlog, stop the scheduler, and join the
    /// thread. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.quit.quit_when_idle();
            if handle.join().is_err() {
                warn!(name = %self.name, "scheduler thread panicked before joining");
            } else {
                debug!(name = %self.name, "scheduler thread stopped");
            }
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_spawn_runs_posted_tasks() {
        let mut loop_thread = LoopThread::spawn("sequin-test").unwrap();
        assert!(loop_thread.is_running());
        assert_eq!(loop_thread.name(), "sequin-test");

        let (tx, rx) = channel::bounded(1);
        loop_thread.task_runner().post(move || {
            let on_named_thread = thread::current().name() == Some("sequin-test");
            tx.send(on_named_thread).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        loop_thread.stop();
        assert!(!loop_thread.is_running());
    }

    #[test]
    fn test_runner_reports_thread_affinity() {
        let loop_thread = LoopThread::spawn("sequin-affinity").unwrap();
        let runner = loop_thread.task_runner();
        assert!(!runner.runs_tasks_in_current_sequence());

        let (tx, rx) = channel::bounded(1);
        let remote = runner.clone();
        runner.post(move || {
            tx.send(remote.runs_tasks_in_current_sequence()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_stop_drains_the_immediate_backlog_first() {
        let mut loop_thread = LoopThread::spawn("sequin-drain").unwrap();
        let runner = loop_thread.task_runner();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..25 {
            let count = Arc::clone(&count);
            runner.post(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        // The stop request queues behind the 25 tasks.
        loop_thread.stop();
        assert_eq!(count.load(Ordering::Relaxed), 25);
        assert!(!runner.post(|| {}));
    }

    #[test]
    fn test_stop_does_not_wait_for_far_delayed_tasks() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let mut loop_thread = LoopThread::spawn("sequin-delayed").unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));

        let flag = DropFlag(Arc::clone(&dropped));
        let ran_flag = Arc::clone(&ran);
        loop_thread.task_runner().post_delayed(
            move || {
                let _keep = &flag;
                ran_flag.store(true, Ordering::Release);
            },
            Duration::from_secs(60),
        );

        let started = Instant::now();
        loop_thread.stop();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(dropped.load(Ordering::Acquire));
        assert!(!ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let mut loop_thread = LoopThread::spawn("sequin-stop-twice").unwrap();
        loop_thread.stop();
        loop_thread.stop();
        assert!(!loop_thread.is_running());
    }

    #[test]
    fn test_drop_stops_the_thread() {
        let runner = {
            let loop_thread = LoopThread::spawn("sequin-dropped").unwrap();
            loop_thread.task_runner()
        };
        // The loop is gone with its thread; posting now fails cleanly.
        assert!(!runner.post(|| {}));
    }
}
