use std::os::unix::io::{RawFd, AsRawFd, FromRawFd, IntoRawFd};
use std::time::Duration;
use std::mem;
use std::io::{self, Read};
use std::convert::TryInto;

use super::fd::FileDesc;

const TFD_CLOEXEC: i32 = libc::TFD_CLOEXEC;
const TFD_NONBLOCK: i32 = libc::TFD_NONBLOCK;

/// The single kernel timer fd backing `TimerQueue`. Always
/// `CLOCK_MONOTONIC` — the queue only ever deals in `Timestamp`s derived
/// from a monotonic clock.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    /// <http://man7.org/linux/man-pages/man2/timerfd_create.2.html>
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            TFD_CLOEXEC | TFD_NONBLOCK
        ))?;
        Ok(TimerFd { inner: unsafe { FileDesc::new(fd) } })
    }

    /// Arms a relative (`it_value` measured from now, flags `0`) expiration
    /// with no repeat interval of its own — `TimerQueue` re-arms on every
    /// fire instead of relying on the kernel's interval field, since the
    /// next expiration is only known after re-examining the ordered set.
    /// `TimerQueue` only ever computes a delay-from-now, never a true
    /// `CLOCK_MONOTONIC` absolute instant, so relative arming is what its
    /// callers actually need.
    pub fn arm(&self, delay: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(delay),
        };
        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// Reads and discards the 8-byte expiration counter; returns the number
    /// of expirations observed since the last read.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().try_into().unwrap_or(i64::MAX),
        tv_nsec: duration.subsec_nanos() as _,
    }
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd { inner: FileDesc::new(fd) }
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
