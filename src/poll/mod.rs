//! The `Poller` capability: represented as a concrete epoll wrapper
//! rather than a trait, since this crate targets Linux only. A trait seam
//! (`Source`) separates the two epoll-aware kernel objects (`EventFd`,
//! `TimerFd`) and plain socket fds from the poller itself, favoring
//! composition over an inheritance hierarchy without the cost of a second
//! backend nobody builds.

mod ready;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::clock::Timestamp;
use crate::sys::epoll::{Epoll, Events};

pub use ready::Ready;

/// Index into the owning `EventLoop`'s channel slab. Opaque outside this
/// crate; stored in `epoll_event.data` so a fired event can be routed back
/// to its `Channel` without the poller owning it — a Channel does not
/// own the fd. The generational-index approach used for the slab-backed
/// `Channel` tie (see `channel.rs`) is reused here for the registration
/// index too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

impl From<Token> for u64 {
    fn from(t: Token) -> u64 {
        t.0 as u64
    }
}

impl From<u64> for Token {
    fn from(v: u64) -> Token {
        Token(v as usize)
    }
}

/// One readiness record surfaced by a `wait()` call.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    token: Token,
    readiness: Ready,
}

impl Event {
    pub(crate) fn new(readiness: Ready, token: Token) -> Event {
        Event { token, readiness }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn readiness(&self) -> Ready {
        self.readiness
    }
}

/// Edge-aware readiness multiplexer over a set of registered fds.
/// Assumes level-triggered semantics for reads, so a partially drained
/// socket is re-reported.
pub struct Poller {
    epoll: Epoll,
    events: Events,
}

const INITIAL_EVENTS: usize = 128;

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            events: Events::with_capacity(INITIAL_EVENTS),
        })
    }

    /// Blocks up to `timeout`, returns the current time and the set of
    /// ready channels via `active`. Doubles its internal event buffer
    /// whenever a wait comes back full, bounding epoll_wait calls under
    /// sustained load.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Event>,
    ) -> io::Result<Timestamp> {
        active.clear();

        self.epoll.wait(&mut self.events, timeout)?;
        let now = Timestamp::now();

        for i in 0..self.events.len() {
            if let Some(raw) = self.events.get(i) {
                active.push(raw);
            }
        }

        if self.events.len() == self.events.capacity() {
            let new_cap = self.events.capacity() * 2;
            self.events = Events::with_capacity(new_cap);
        }

        Ok(now)
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.epoll.add(fd, token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.epoll.modify(fd, token, interest)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(fd)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
