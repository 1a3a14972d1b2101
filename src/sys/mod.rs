//! Raw OS bindings: fd wrapper, epoll, eventfd, timerfd, socket option calls.

macro_rules! syscall {
    ($fn:ident($($arg:expr),* $(,)*)) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod fd;
pub mod epoll;
pub mod eventfd;
pub mod timerfd;
pub mod socket;

pub use fd::FileDesc;
pub use socket::Socket;
