//! Channel: binds one fd to its interest set and event callbacks. Grounded
//! in `original_source/include/Channel.h` / `src/Channel.cpp`.
//!
//! The lifetime-safety "tie" between a fired event and the object it
//! belongs to is realized structurally rather than as a field on `Channel`
//! itself: `Channel`s live in the owning `EventLoop`'s generational slab
//! (see `event_loop::ChannelId`), and dispatch always goes through a
//! `(slot, generation)` lookup. Once a `TcpConnection` (or `Acceptor`, or
//! the loop's own wakeup channel) calls `remove()`, the slot is freed and
//! any event still in the current poll batch for that generation silently
//! misses the lookup — the generational-index option, generalized to
//! every `Channel`, not only the connection owner.

use std::os::unix::io::RawFd;

use crate::clock::Timestamp;
use crate::poll::Ready;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    New,
    Added,
    Deleted,
}

pub(crate) type ReadCallback = Box<dyn FnMut(Timestamp)>;
pub(crate) type WriteCallback = Box<dyn FnMut()>;
pub(crate) type CloseCallback = Box<dyn FnMut()>;
pub(crate) type ErrorCallback = Box<dyn FnMut()>;

pub(crate) struct Channel {
    fd: RawFd,
    interested: Ready,
    returned: Ready,
    state: ChannelState,
    read_cb: Option<ReadCallback>,
    write_cb: Option<WriteCallback>,
    close_cb: Option<CloseCallback>,
    error_cb: Option<ErrorCallback>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interested: Ready::empty(),
            returned: Ready::empty(),
            state: ChannelState::New,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interested(&self) -> Ready {
        self.interested
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interested.is_writable()
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.interested.is_readable()
    }

    pub(crate) fn set_interest(&mut self, interest: Ready) {
        self.interested = interest;
    }

    pub(crate) fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    pub(crate) fn set_write_callback(&mut self, cb: WriteCallback) {
        self.write_cb = Some(cb);
    }

    pub(crate) fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }

    pub(crate) fn set_error_callback(&mut self, cb: ErrorCallback) {
        self.error_cb = Some(cb);
    }

    /// Records the kernel-reported readiness ahead of dispatch.
    pub(crate) fn set_returned(&mut self, ready: Ready) {
        self.returned = ready;
    }

    /// Dispatch order: close takes precedence over a final readable
    /// payload; error is surfaced before data.
    pub(crate) fn handle_event(&mut self, receive_time: Timestamp) {
        let returned = self.returned;

        if returned.is_hup() && !returned.is_readable() {
            if let Some(cb) = self.close_cb.as_mut() {
                cb();
            }
        }

        if returned.is_error() {
            if let Some(cb) = self.error_cb.as_mut() {
                cb();
            }
        }

        if returned.is_readable() {
            if let Some(cb) = self.read_cb.as_mut() {
                cb(receive_time);
            }
        }

        if returned.is_writable() {
            if let Some(cb) = self.write_cb.as_mut() {
                cb();
            }
        }

        self.returned = Ready::empty();
    }
}
