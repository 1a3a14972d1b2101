use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, io};

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::poll::{Ready, Token};

/// Thin `epoll_create1`/`epoll_ctl`/`epoll_wait` wrapper. `Poller` (in
/// `crate::poll`) is the safe, spec-shaped layer built on top of this.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let n = syscall!(epoll_wait(
            self.epfd,
            events.raw.as_mut_ptr(),
            events.raw.capacity() as i32,
            timeout_ms
        ))?;

        unsafe { events.raw.set_len(n as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: u64::from(token),
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: u64::from(token),
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

/// epoll is always armed level-triggered and without one-shot: level-triggered
/// semantics for reads guarantee drain-on-return.
fn ioevent_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind |= EPOLLRDHUP;

    let _ = (EPOLLET, EPOLLONESHOT);
    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    raw: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(n: usize) -> Events {
        Events { raw: Vec::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    pub fn get(&self, idx: usize) -> Option<crate::poll::Event> {
        self.raw.get(idx).map(|raw| {
            let bits = raw.events as i32;
            let mut ready = Ready::empty();

            if bits & EPOLLIN != 0 || bits & EPOLLPRI != 0 {
                ready = ready | Ready::readable();
            }
            if bits & EPOLLOUT != 0 {
                ready = ready | Ready::writable();
            }
            if bits & EPOLLERR != 0 {
                ready = ready | Ready::error();
            }
            if bits & EPOLLRDHUP != 0 || bits & EPOLLHUP != 0 {
                ready = ready | Ready::hup();
            }

            crate::poll::Event::new(ready, Token(raw.u64 as usize))
        })
    }
}
