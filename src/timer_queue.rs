//! Keeps every scheduled [`crate::timer::Timer`] registered on a loop behind
//! a single `timerfd`, so the loop only ever has one extra fd to poll no
//! matter how many timers are outstanding.
//!
//! Two views over the same timers: `by_deadline` orders them for "what
//! fires next", `by_id` answers "is this id still live" in O(1) for
//! `cancel`. A `cancelling` set absorbs cancellations that arrive while a
//! batch of expired timers is being processed, so a repeating timer
//! cancelled from inside its own callback does not get re-armed a moment
//! later in the same `handle_read`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use log::trace;

use crate::sys::timerfd::{Clock, SetTimeFlags, TimerFd, TimerSpec, TFD_CLOEXEC, TFD_NONBLOCK};
use crate::timer::{clamp_interval, Timer, TimerId};

pub struct TimerQueue {
    timer_fd: TimerFd,
    by_deadline: BTreeSet<(Instant, u64)>,
    by_id: HashMap<u64, Timer>,
    cancelling: HashSet<u64>,
    calling_expired_timers: bool,
}

impl TimerQueue {
    pub fn new() -> io::Result<TimerQueue> {
        let timer_fd = TimerFd::create(Clock::Monotonic, TFD_CLOEXEC | TFD_NONBLOCK)?;
        Ok(TimerQueue {
            timer_fd,
            by_deadline: BTreeSet::new(),
            by_id: HashMap::new(),
            cancelling: HashSet::new(),
            calling_expired_timers: false,
        })
    }

    pub fn timer_fd(&self) -> &TimerFd {
        &self.timer_fd
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Schedules `callback` to run at `deadline`, repeating every `interval`
    /// if given. Returns the id used to `cancel` it later.
    pub fn add_timer(
        &mut self,
        callback: impl FnMut() + Send + 'static,
        deadline: Instant,
        interval: Option<Duration>,
    ) -> io::Result<TimerId> {
        let id = TimerId::next();
        let interval = interval.map(clamp_interval);
        let timer = Timer {
            callback: Box::new(callback),
            deadline,
            interval,
        };

        let earliest_changed = self
            .by_deadline
            .iter()
            .next()
            .map(|(d, _)| deadline < *d)
            .unwrap_or(true);

        self.by_deadline.insert((deadline, id.value()));
        self.by_id.insert(id.value(), timer);

        if earliest_changed {
            self.rearm()?;
        }

        Ok(id)
    }

    /// Cancels a previously scheduled timer. A no-op if it already fired
    /// (one-shot) or was already cancelled. Safe to call from inside the
    /// timer's own callback, mid-batch.
    pub fn cancel(&mut self, id: TimerId) -> io::Result<()> {
        if let Some(timer) = self.by_id.remove(&id.value()) {
            self.by_deadline.remove(&(timer.deadline, id.value()));
        } else if self.calling_expired_timers {
            self.cancelling.insert(id.value());
        }
        Ok(())
    }

    /// Drains the `timerfd`'s expiration count and runs every timer whose
    /// deadline has passed, re-arming repeaters that were not cancelled
    /// from within the batch. Call this only after the poller reports the
    /// timer channel readable.
    pub fn handle_read(&mut self, now: Instant) -> io::Result<()> {
        match self.timer_fd.read() {
            Ok(_expirations) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let expired = self.pop_expired(now);
        if expired.is_empty() {
            return Ok(());
        }
        trace!("timer queue firing {} expired timer(s)", expired.len());

        self.calling_expired_timers = true;
        self.cancelling.clear();

        let mut fired: Vec<(u64, Timer)> = expired;
        for (_id, timer) in &mut fired {
            // Every timer that made it into this batch fires, even one a
            // sibling callback cancels moments before its own turn comes up
            // in this same loop — `cancelling` only gates the re-arm pass
            // below. Matches the source: `run()` is unconditional, only
            // `reset()`'s repeat-and-reschedule check consults `cancelingTimers_`.
            (timer.callback)();
        }

        self.calling_expired_timers = false;

        for (id, mut timer) in fired {
            if self.cancelling.contains(&id) {
                continue;
            }
            if timer.repeats() {
                timer.restart(now);
                self.by_deadline.insert((timer.deadline, id));
                self.by_id.insert(id, timer);
            }
        }

        self.rearm()
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<(u64, Timer)> {
        let sentinel = (now, u64::MAX);
        let ready: Vec<(Instant, u64)> = self
            .by_deadline
            .range(..=sentinel)
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(ready.len());
        for key in ready {
            self.by_deadline.remove(&key);
            if let Some(timer) = self.by_id.remove(&key.1) {
                out.push((key.1, timer));
            }
        }
        out
    }

    /// Points the single `timerfd` at the earliest outstanding deadline.
    /// Uses a one-shot relative value — we re-arm by hand on every
    /// `handle_read` rather than trusting the kernel's own `it_interval`,
    /// since that interval is shared by every timer on the queue, not just
    /// one.
    fn rearm(&self) -> io::Result<()> {
        let value = match self.by_deadline.iter().next() {
            Some((deadline, _)) => deadline.saturating_duration_since(Instant::now()).max(Duration::from_nanos(1)),
            None => Duration::from_secs(0),
        };

        self.timer_fd.settime(
            TimerSpec {
                interval: Duration::from_secs(0),
                value,
            },
            SetTimeFlags::Default,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn orders_timers_by_deadline() {
        let mut tq = TimerQueue::new().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Instant::now();

        let o1 = order.clone();
        tq.add_timer(move || o1.lock().unwrap().push('B'), now + Duration::from_millis(20), None)
            .unwrap();
        let o2 = order.clone();
        tq.add_timer(move || o2.lock().unwrap().push('A'), now + Duration::from_millis(10), None)
            .unwrap();

        let mut expired = tq.pop_expired(now + Duration::from_millis(30));
        assert_eq!(expired.len(), 2);
        for (_, timer) in &mut expired {
            (timer.callback)();
        }
        assert_eq!(*order.lock().unwrap(), vec!['A', 'B']);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut tq = TimerQueue::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = tq
            .add_timer(move || { f.fetch_add(1, Ordering::SeqCst); }, Instant::now() + Duration::from_secs(60), None)
            .unwrap();
        assert_eq!(tq.len(), 1);
        tq.cancel(id).unwrap();
        assert_eq!(tq.len(), 0);
    }

    #[test]
    fn repeating_timer_is_rescheduled_after_firing() {
        let mut tq = TimerQueue::new().unwrap();
        let now = Instant::now();
        tq.add_timer(|| {}, now, Some(Duration::from_millis(5))).unwrap();
        let expired = tq.pop_expired(now);
        assert_eq!(expired.len(), 1);
        // simulate what handle_read does once a batch has run
        for (id, mut timer) in expired {
            timer.restart(now);
            tq.by_deadline.insert((timer.deadline, id));
            tq.by_id.insert(id, timer);
        }
        assert_eq!(tq.len(), 1);
    }
}
