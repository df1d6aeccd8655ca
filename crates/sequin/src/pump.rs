//! Pump traits and the default thread-blocking pump
//!
//! A pump owns the blocking primitive of a scheduler thread. It drives
//! the scheduler through three callback points (`do_work`,
//! `do_delayed_work`, `do_idle_work`) and sleeps when all three report
//! nothing to do. Custom pumps integrate foreign event sources by
//! implementing [`Pump`] and interleaving their own events between the
//! callback points; [`PumpDefault`] is the plain condvar pump used when
//! there is nothing to integrate.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// How much a pump may defer timer wakeups to coalesce them.
///
/// A hint only; pumps without a coalescing wait primitive ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerSlack {
    /// Fire timers at their scheduled time.
    #[default]
    None,
    /// Allow the platform to delay timers up to its coalescing limit.
    Maximum,
}

/// The scheduler side of the drive contract.
///
/// A pump calls these in order on its run thread. Each returns whether
/// it performed work; the pump sleeps only after all three decline.
pub trait PumpDelegate {
    /// Run one ready task if allowed. Returns true if work was done,
    /// including moving a delayed task into the timer queue.
    fn do_work(&self) -> bool;

    /// Run one due delayed task. `next_delayed_work_time` carries the
    /// pump's current wake deadline in and the revised one out.
    fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool;

    /// Run one unit of idle-time work. Returns true if any was done.
    fn do_idle_work(&self) -> bool;
}

/// Blocking primitive of a scheduler thread.
///
/// `run` and `quit` are called only on the thread being pumped;
/// `schedule_work` may be called from any thread and is the sole
/// cross-thread wakeup path.
pub trait Pump: Send + Sync {
    /// Drive `delegate` until [`quit`](Self::quit) is called. Reentrant:
    /// a task may start a nested `run` on the same pump, and `quit` ends
    /// the innermost one.
    fn run(&self, delegate: &dyn PumpDelegate);

    /// End the innermost active `run`. Must be called on the run thread,
    /// from inside a delegate callback.
    fn quit(&self);

    /// Wake the pump so it re-enters `do_work` soon. Callable from any
    /// thread; redundant calls are collapsed.
    fn schedule_work(&self);

    /// Set the next timer wakeup. Only called on the run thread, so it
    /// never races a blocked wait.
    fn schedule_delayed_work(&self, next_run_time: Instant);

    /// Apply a timer coalescing hint. Pumps without such a knob ignore it.
    fn set_timer_slack(&self, slack: TimerSlack) {
        let _ = slack;
    }
}

// ============================================================================
// Default pump
// ============================================================================

struct PumpDefaultState {
    /// False after `quit`; reset to true when the ended `run` returns.
    keep_running: bool,
    /// Pending cross-thread wakeup, consumed by the next wait.
    event_signaled: bool,
    /// Deadline of the earliest delayed task, if any.
    delayed_work_time: Option<Instant>,
}

/// Condvar-based pump for threads with no foreign event source.
///
/// Sleeps indefinitely when no work is pending, or until the earliest
/// delayed task is due. [`schedule_work`](Pump::schedule_work) behaves
/// like signaling an auto-reset event: the signal persists until one
/// wait consumes it, and duplicate signals collapse.
pub struct PumpDefault {
    state: Mutex<PumpDefaultState>,
    event: Condvar,
}

impl PumpDefault {
    /// Create a pump with no pending signal and no timer armed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PumpDefaultState {
                keep_running: true,
                event_signaled: false,
                delayed_work_time: None,
            }),
            event: Condvar::new(),
        }
    }

    fn keep_running(&self) -> bool {
        self.state.lock().keep_running
    }

    /// Block until signaled or until the armed timer deadline passes.
    fn wait_for_work(&self) {
        let mut state = self.state.lock();
        loop {
            if state.event_signaled {
                state.event_signaled = false;
                return;
            }
            match state.delayed_work_time {
                None => self.event.wait(&mut state),
                Some(deadline) => {
                    if self.event.wait_until(&mut state, deadline).timed_out() {
                        // Timer fired; clear it so the delegate re-derives
                        // the next deadline from its own queue.
                        state.delayed_work_time = None;
                        return;
                    }
                }
            }
        }
    }
}

impl Default for PumpDefault {
    fn default() -> Self {
        Self::new()
    }
}

impl Pump for PumpDefault {
    fn run(&self, delegate: &dyn PumpDelegate) {
        debug_assert!(
            self.state.lock().keep_running,
            "quit called outside an active run"
        );

        loop {
            let mut did_work = delegate.do_work();
            if !self.keep_running() {
                break;
            }

            let mut next_delayed_work_time = self.state.lock().delayed_work_time;
            did_work |= delegate.do_delayed_work(&mut next_delayed_work_time);
            self.state.lock().delayed_work_time = next_delayed_work_time;
            if !self.keep_running() {
                break;
            }
            if did_work {
                continue;
            }

            did_work = delegate.do_idle_work();
            if !self.keep_running() {
                break;
            }
            if did_work {
                continue;
            }

            self.wait_for_work();
        }

        // Re-arm so an enclosing run (or a later one) keeps going; quit
        // only ever ends the innermost run.
        self.state.lock().keep_running = true;
    }

    fn quit(&self) {
        self.state.lock().keep_running = false;
    }

    fn schedule_work(&self) {
        let mut state = self.state.lock();
        if state.event_signaled {
            return;
        }
        state.event_signaled = true;
        self.event.notify_one();
    }

    fn schedule_delayed_work(&self, next_run_time: Instant) {
        // Run-thread only, so the pump cannot be blocked in
        // wait_for_work right now; recording the deadline is enough.
        self.state.lock().delayed_work_time = Some(next_run_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Delegate that reports work `remaining` times, then quits.
    struct CountdownDelegate<'a> {
        pump: &'a PumpDefault,
        remaining: Cell<u32>,
        work_calls: Cell<u32>,
    }

    impl PumpDelegate for CountdownDelegate<'_> {
        fn do_work(&self) -> bool {
            self.work_calls.set(self.work_calls.get() + 1);
            if self.remaining.get() > 0 {
                self.remaining.set(self.remaining.get() - 1);
                true
            } else {
                self.pump.quit();
                false
            }
        }

        fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
            *next_delayed_work_time = None;
            false
        }

        fn do_idle_work(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_run_exits_on_quit() {
        let pump = PumpDefault::new();
        let delegate = CountdownDelegate {
            pump: &pump,
            remaining: Cell::new(3),
            work_calls: Cell::new(0),
        };
        pump.run(&delegate);
        assert_eq!(delegate.work_calls.get(), 4);
    }

    #[test]
    fn test_quit_rearms_for_the_next_run() {
        let pump = PumpDefault::new();
        for _ in 0..2 {
            let delegate = CountdownDelegate {
                pump: &pump,
                remaining: Cell::new(1),
                work_calls: Cell::new(0),
            };
            pump.run(&delegate);
            assert_eq!(delegate.work_calls.get(), 2);
        }
    }

    /// Delegate that sleeps until an external flag is raised.
    struct WaitForFlagDelegate<'a> {
        pump: &'a PumpDefault,
        flag: Arc<AtomicBool>,
    }

    impl PumpDelegate for WaitForFlagDelegate<'_> {
        fn do_work(&self) -> bool {
            if self.flag.load(Ordering::Acquire) {
                self.pump.quit();
            }
            false
        }

        fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
            *next_delayed_work_time = None;
            false
        }

        fn do_idle_work(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_schedule_work_wakes_a_sleeping_pump() {
        let pump = Arc::new(PumpDefault::new());
        let flag = Arc::new(AtomicBool::new(false));

        let remote_pump = Arc::clone(&pump);
        let remote_flag = Arc::clone(&flag);
        let waker = thread::Builder::new()
            .name("pump-waker".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_millis(30));
                remote_flag.store(true, Ordering::Release);
                remote_pump.schedule_work();
            })
            .unwrap();

        let started = Instant::now();
        let delegate = WaitForFlagDelegate {
            pump: &pump,
            flag,
        };
        pump.run(&delegate);

        assert!(started.elapsed() >= Duration::from_millis(20));
        waker.join().unwrap();
    }

    /// Delegate that declines work once, forcing a single wait, then quits.
    struct WaitOnceDelegate<'a> {
        pump: &'a PumpDefault,
        passes: Cell<u32>,
    }

    impl PumpDelegate for WaitOnceDelegate<'_> {
        fn do_work(&self) -> bool {
            self.passes.set(self.passes.get() + 1);
            if self.passes.get() >= 2 {
                self.pump.quit();
            }
            false
        }

        fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
            *next_delayed_work_time = None;
            false
        }

        fn do_idle_work(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_signal_before_wait_is_not_lost() {
        let pump = PumpDefault::new();

        // Signaled while nothing is waiting; the wait between the two
        // work passes must consume it instead of blocking forever.
        pump.schedule_work();
        pump.schedule_work();

        let delegate = WaitOnceDelegate {
            pump: &pump,
            passes: Cell::new(0),
        };
        pump.run(&delegate);
        assert_eq!(delegate.passes.get(), 2);
    }

    /// Delegate whose only delayed task is due at `deadline`.
    struct DeadlineDelegate<'a> {
        pump: &'a PumpDefault,
        deadline: Instant,
    }

    impl PumpDelegate for DeadlineDelegate<'_> {
        fn do_work(&self) -> bool {
            false
        }

        fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
            if Instant::now() >= self.deadline {
                self.pump.quit();
                *next_delayed_work_time = None;
                true
            } else {
                *next_delayed_work_time = Some(self.deadline);
                false
            }
        }

        fn do_idle_work(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_timed_wait_fires_at_the_deadline() {
        let pump = PumpDefault::new();
        let started = Instant::now();
        let delegate = DeadlineDelegate {
            pump: &pump,
            deadline: started + Duration::from_millis(40),
        };
        pump.run(&delegate);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(35), "woke early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "woke far too late: {elapsed:?}");
    }
}
