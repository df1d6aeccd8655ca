//! High-resolution timer accounting
//!
//! Short delays need a finer clock than the default timer granularity.
//! Schedulers count how many queued delayed tasks fall inside the
//! high-resolution window and raise a process-wide activation refcount
//! while that count is non-zero at idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Granularity of the default low-resolution timer tick.
pub(crate) const LOW_RESOLUTION_TIMER_PERIOD: Duration = Duration::from_millis(16);

/// Process-wide count of schedulers currently requesting high resolution.
static HIGH_RES_TIMER_USERS: AtomicUsize = AtomicUsize::new(0);

/// Whether a delay is short enough to need the high-resolution timer.
///
/// Delays of zero (immediate tasks) never do; delays of at least twice
/// the low-resolution period are served well enough by the coarse tick.
pub(crate) fn requires_high_res_timer(delay: Option<Duration>) -> bool {
    match delay {
        Some(delay) => !delay.is_zero() && delay < LOW_RESOLUTION_TIMER_PERIOD * 2,
        None => false,
    }
}

/// Raise or lower this scheduler's claim on the high-resolution timer.
pub(crate) fn activate_high_resolution_timer(activating: bool) {
    if activating {
        HIGH_RES_TIMER_USERS.fetch_add(1, Ordering::AcqRel);
    } else {
        HIGH_RES_TIMER_USERS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether any scheduler in the process currently holds the
/// high-resolution timer active.
pub fn high_resolution_timer_in_use() -> bool {
    HIGH_RES_TIMER_USERS.load(Ordering::Acquire) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_delay_is_low_res() {
        assert!(!requires_high_res_timer(None));
        assert!(!requires_high_res_timer(Some(Duration::ZERO)));
    }

    #[test]
    fn test_short_delay_is_high_res() {
        assert!(requires_high_res_timer(Some(Duration::from_millis(1))));
        assert!(requires_high_res_timer(Some(Duration::from_millis(31))));
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        assert!(!requires_high_res_timer(Some(Duration::from_millis(32))));
        assert!(!requires_high_res_timer(Some(Duration::from_secs(1))));
    }
}
