//! Wraps the OS readiness primitive and owns the `{fd → Channel}` registry.
//!
//! Channels live here, not inside the objects (`Connection`, `Acceptor`,
//! `Connector`) that logically own them — those objects only ever hold the
//! raw fd and reach their channel back through `EventLoop`. This mirrors the
//! teacher's own fd-keyed registries (`indexmap::IndexMap`) and keeps channel
//! dispatch a single map lookup away from the epoll wait result.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::trace;

use crate::channel::{Channel, ChannelState};
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};

pub struct Poller {
    epoll: Epoll,
    channels: IndexMap<RawFd, Channel>,
    events: Events,
}

const INITIAL_EVENT_CAPACITY: usize = 16;

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            channels: IndexMap::new(),
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
        })
    }

    /// Blocks at most `timeout`, then dispatches every channel that fired to
    /// its `handle_event`. Returns the instant observed right after the wait
    /// returns, threaded through to callbacks as the poll-return time.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Instant> {
        let n = self.epoll.wait(&mut self.events, timeout)?;
        let now = Instant::now();

        if n == 0 {
            return Ok(now);
        }

        trace!("poller woke with {} active channel(s)", n);

        // Snapshot the ready set into an owned Vec first: `self.events.iter()`
        // borrows `self.events` immutably for its whole lifetime, and the loop
        // body below needs `&mut self` (via `update_channel`), so the borrow
        // must end before iteration starts.
        let ready: Vec<(RawFd, Ready)> = self
            .events
            .iter()
            .map(|e| (e.token().0 as RawFd, e.readiness()))
            .collect();

        for (fd, readiness) in ready {
            if let Some(channel) = self.channels.get_mut(&fd) {
                channel.set_revents(readiness);
                channel.handle_event(now);
            } else {
                continue;
            }

            // The callback just run may have toggled this channel's own
            // interest (e.g. a write callback disabling writing once its
            // buffer drained) or left it with no interest (a close
            // callback disabling everything). Push that change to the
            // kernel now that the callback's borrow of the channel has
            // ended; removing the channel entirely is left to its owner,
            // deferred through the loop's pending-task queue.
            let _ = self.update_channel(fd);
        }

        Ok(now)
    }

    /// Registers a fresh channel for `fd`. Its interest starts empty; the
    /// caller enables reading/writing through the returned channel and then
    /// calls `update_channel` to push that interest to the kernel.
    pub fn new_channel(&mut self, fd: RawFd) -> &mut Channel {
        self.channels.entry(fd).or_insert_with(|| Channel::new(fd))
    }

    pub fn channel_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.channels.get_mut(&fd)
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Applies a channel's current interest set to the kernel registration.
    /// `New → Added` on first non-empty interest, `Added → Deleted` when
    /// interest becomes empty, `Deleted → Added` on re-enable. A no-op if
    /// the channel's interest has not changed since the last call.
    pub fn update_channel(&mut self, fd: RawFd) -> io::Result<()> {
        let channel = match self.channels.get_mut(&fd) {
            Some(c) => c,
            None => return Ok(()),
        };

        let token = Token(fd as usize);
        let interest = channel.events();

        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                if !interest.is_empty() {
                    self.epoll.add(&fd, token, interest, EpollOpt::level())?;
                    channel.set_state(ChannelState::Added);
                }
            }
            ChannelState::Added => {
                if interest.is_empty() {
                    self.epoll.delete(&fd)?;
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.epoll.modify(&fd, token, interest, EpollOpt::level())?;
                }
            }
        }

        Ok(())
    }

    /// Removes `fd` from the registry. Requires the channel's interest to
    /// already be empty (deregistered) — mirrors the Poller contract that a
    /// channel with pending interest cannot simply be dropped.
    pub fn remove_channel(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(channel) = self.channels.get(&fd) {
            assert!(
                channel.is_none_event(),
                "removing channel fd={} with non-empty interest",
                fd
            );
            if channel.state() == ChannelState::Added {
                self.epoll.delete(&fd)?;
            }
        }
        self.channels.shift_remove(&fd);
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_poller_has_no_channels() {
        let poller = Poller::new().unwrap();
        assert_eq!(poller.channel_count(), 0);
    }

    #[test]
    fn new_channel_starts_with_no_interest() {
        let mut poller = Poller::new().unwrap();
        let ch = poller.new_channel(7);
        assert!(ch.is_none_event());
    }
}
