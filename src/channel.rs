//! Binds one file descriptor to one loop: tracks the interest/ready bitmasks
//! for that fd and dispatches a ready event to the callback registered for
//! the fired condition.
//!
//! A `Channel` never talks to the [`crate::poller::Poller`] on its own —
//! registration changes are applied by whichever code changed `events()`,
//! which always runs on the owning loop's thread (see `EventLoop::update_channel`).
//! This keeps `Channel` a plain, non-reentrant struct instead of one that
//! holds a back-pointer to its loop.
//!
//! Callbacks receive `&mut Channel` rather than closing over one: a write
//! callback that drains its output buffer needs to disable writing on
//! itself, and a close callback needs to disable everything, both while
//! `handle_event` is still on the stack. Lending the reference in means
//! that mutation never has to re-enter the poller's channel map to reach
//! the channel it is already inside.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{error, warn};

use crate::epoll::Ready;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(&mut Channel, Instant)>;
type EventCallback = Box<dyn FnMut(&mut Channel)>;

pub struct Channel {
    fd: RawFd,
    events: Ready,
    revents: Ready,
    state: ChannelState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,

    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("revents", &self.revents)
            .field("state", &self.state)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            events: Ready::empty(),
            revents: Ready::empty(),
            state: ChannelState::New,
            tie: None,
            event_handling: false,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Ready {
        self.events
    }

    pub(crate) fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub fn is_none_event(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.events.is_writable()
    }

    pub fn enable_reading(&mut self) {
        self.events |= Ready::readable();
    }

    pub fn disable_reading(&mut self) {
        self.events = self.events - Ready::readable();
    }

    pub fn enable_writing(&mut self) {
        self.events |= Ready::writable();
    }

    pub fn disable_writing(&mut self) {
        self.events = self.events - Ready::writable();
    }

    pub fn disable_all(&mut self) {
        self.events = Ready::empty();
    }

    pub fn is_event_handling(&self) -> bool {
        self.event_handling
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(&mut Channel, Instant) + 'static) {
        self.read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut(&mut Channel) + 'static) {
        self.write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut(&mut Channel) + 'static) {
        self.close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut(&mut Channel) + 'static) {
        self.error_callback = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime to `owner`: during `handle_event`, a
    /// strong reference to `owner` is held so the owner cannot be freed
    /// part-way through its own callback even if every other strong
    /// reference to it is dropped during that same callback.
    pub fn tie<T: Any + Send + Sync + 'static>(&mut self, owner: &Arc<T>) {
        self.tie = Some(Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>);
    }

    pub(crate) fn handle_event(&mut self, receive_time: Instant) {
        let _guard = self.tie.as_ref().and_then(Weak::upgrade);

        self.event_handling = true;
        self.handle_event_guarded(receive_time);
        self.event_handling = false;
    }

    fn handle_event_guarded(&mut self, receive_time: Instant) {
        if self.revents.is_hup() && !self.revents.is_readable() {
            self.invoke_close();
            return;
        }

        if self.revents.is_empty() {
            self.warn_invalid();
            return;
        }

        if self.revents.is_error() {
            self.invoke_error();
        }

        if self.revents.is_readable() || self.revents.is_hup() {
            self.invoke_read(receive_time);
        }

        if self.revents.is_writable() {
            self.invoke_write();
        }
    }

    /// Each `invoke_*` takes its callback out of `self` so the callback can
    /// receive `&mut self` without aliasing the slot it came from, then
    /// puts it back once the call (and its `catch_unwind` guard) returns.
    fn invoke_read(&mut self, receive_time: Instant) {
        if let Some(mut cb) = self.read_callback.take() {
            let fd = self.fd;
            let result = catch_unwind(AssertUnwindSafe(|| cb(self, receive_time)));
            if result.is_err() {
                error!("channel fd={} panicked in read callback", fd);
            }
            self.read_callback = Some(cb);
        }
    }

    fn invoke_write(&mut self) {
        if let Some(mut cb) = self.write_callback.take() {
            let fd = self.fd;
            let result = catch_unwind(AssertUnwindSafe(|| cb(self)));
            if result.is_err() {
                error!("channel fd={} panicked in write callback", fd);
            }
            self.write_callback = Some(cb);
        }
    }

    fn invoke_close(&mut self) {
        if let Some(mut cb) = self.close_callback.take() {
            let fd = self.fd;
            let result = catch_unwind(AssertUnwindSafe(|| cb(self)));
            if result.is_err() {
                error!("channel fd={} panicked in close callback", fd);
            }
            self.close_callback = Some(cb);
        }
    }

    fn invoke_error(&mut self) {
        if let Some(mut cb) = self.error_callback.take() {
            let fd = self.fd;
            let result = catch_unwind(AssertUnwindSafe(|| cb(self)));
            if result.is_err() {
                error!("channel fd={} panicked in error callback", fd);
            }
            self.error_callback = Some(cb);
        }
    }

    pub(crate) fn warn_invalid(&self) {
        warn!("channel fd={} has no events set, revents={:?}", self.fd, self.revents);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatches_to_read_callback_on_readable() {
        let mut ch = Channel::new(3);
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        ch.set_read_callback(move |_, _| *seen2.borrow_mut() = true);
        ch.set_revents(Ready::readable());
        ch.handle_event(Instant::now());
        assert!(*seen.borrow());
    }

    #[test]
    fn hup_without_readable_fires_close_not_read() {
        let mut ch = Channel::new(3);
        let read_fired = Rc::new(RefCell::new(false));
        let close_fired = Rc::new(RefCell::new(false));
        let r2 = read_fired.clone();
        let c2 = close_fired.clone();
        ch.set_read_callback(move |_, _| *r2.borrow_mut() = true);
        ch.set_close_callback(move |_| *c2.borrow_mut() = true);
        ch.set_revents(Ready::hup());
        ch.handle_event(Instant::now());
        assert!(!*read_fired.borrow());
        assert!(*close_fired.borrow());
    }

    #[test]
    fn panicking_callback_does_not_propagate() {
        let mut ch = Channel::new(3);
        ch.set_read_callback(|_, _| panic!("boom"));
        ch.set_revents(Ready::readable());
        ch.handle_event(Instant::now());
    }

    #[test]
    fn enable_disable_reading_toggles_interest() {
        let mut ch = Channel::new(3);
        assert!(ch.is_none_event());
        ch.enable_reading();
        assert!(ch.is_reading());
        ch.disable_reading();
        assert!(ch.is_none_event());
    }

    #[test]
    fn write_callback_can_disable_its_own_writing() {
        let mut ch = Channel::new(3);
        ch.enable_writing();
        ch.set_write_callback(|ch| ch.disable_writing());
        ch.set_revents(Ready::writable());
        ch.handle_event(Instant::now());
        assert!(!ch.is_writing());
    }
}
