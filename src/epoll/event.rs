use crate::epoll::{Ready, Token};
use crate::sys;

/// A single readiness notification: which kind(s) of readiness fired, for
/// which registered [`Token`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub(crate) fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub fn readiness(&self) -> Ready {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// Storage for a batch of events returned by one [`super::Epoll::wait`] call.
pub struct Events {
    pub(crate) inner: sys::Events,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::Events::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { events: self, pos: 0 }
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Borrowing iterator over an [`Events`] batch.
pub struct Iter<'a> {
    events: &'a Events,
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let ev = self.events.get(self.pos);
        if ev.is_some() {
            self.pos += 1;
        }
        ev
    }
}

/// Owning iterator over an [`Events`] batch.
pub struct IntoIter {
    events: Events,
    pos: usize,
}

impl Iterator for IntoIter {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let ev = self.events.get(self.pos);
        if ev.is_some() {
            self.pos += 1;
        }
        ev
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = IntoIter;

    fn into_iter(self) -> IntoIter {
        IntoIter { events: self, pos: 0 }
    }
}
