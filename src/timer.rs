//! A single scheduled callback, plus the opaque handle used to cancel it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Timers below this interval are clamped up to it; matches the
/// documented minimum resolution of the reactor's timer service.
pub const MIN_RESOLUTION: Duration = Duration::from_micros(100);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned by `TimerQueue::add_timer`, comparable for
/// cancellation but carrying no ownership of the timer itself.
///
/// Collapses the source's `(timer-pointer, sequence)` pair into a single
/// monotonically-issued 64-bit identity: Rust timers are never heap
/// addresses that get reused across allocations the way a pointer-keyed
/// scheme assumes, and the same counter value also breaks same-deadline
/// ties in insertion order, so no separate sequence field is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn value(self) -> u64 {
        self.0
    }
}

pub(crate) struct Timer {
    pub callback: Box<dyn FnMut() + Send>,
    pub deadline: Instant,
    pub interval: Option<Duration>,
}

impl Timer {
    pub fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    pub fn restart(&mut self, now: Instant) {
        let interval = self.interval.unwrap_or(Duration::from_secs(0)).max(MIN_RESOLUTION);
        self.deadline = now + interval;
    }
}

pub(crate) fn clamp_interval(interval: Duration) -> Duration {
    if interval < MIN_RESOLUTION {
        MIN_RESOLUTION
    } else {
        interval
    }
}
