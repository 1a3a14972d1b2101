//! Thin raw-fd socket wrapper: creation, socket options, accept/connect.
//! Bind/listen/accept and plain stream I/O are folded into one `Socket`
//! type rather than split across separate listener/stream types: there is
//! no public `TcpStream`/`TcpListener` type here, only `Acceptor` and
//! `TcpConnection`, so one raw `Socket` type serves both.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{c_int, c_void, socklen_t};

use super::fd::FileDesc;

pub struct Socket(FileDesc);

impl Socket {
    fn new_raw(family: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(family, ty | libc::SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(family, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    /// A fresh, non-blocking TCP socket in `addr`'s address family.
    pub fn new_tcp(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let socket = Self::new_raw(family, libc::SOCK_STREAM)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Binds and starts listening: `SO_REUSEADDR` always set,
    /// `SO_REUSEPORT` only when asked.
    pub fn bind_and_listen(addr: &SocketAddr, reuse_port: bool, backlog: i32) -> io::Result<Socket> {
        let socket = Self::new_tcp(addr)?;
        socket.set_reuseaddr(true)?;
        if reuse_port {
            socket.set_reuseport(true)?;
        }

        let (addr_ptr, len) = socket_addr_to_raw(addr);
        syscall!(bind(socket.0.raw(), addr_ptr, len))?;
        syscall!(listen(socket.0.raw(), backlog))?;

        Ok(socket)
    }

    pub fn connect(addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Self::new_tcp(addr)?;
        let (addr_ptr, len) = socket_addr_to_raw(addr);
        match syscall!(connect(socket.0.raw(), addr_ptr, len)) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(socket)
    }

    /// Accepts one pending connection, non-blocking. `Ok(None)` on
    /// `EAGAIN`/`EWOULDBLOCK`; `EMFILE`/`ENFILE` are surfaced as an `Err` so
    /// the caller can apply its overload policy.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.0.raw(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(libc::EAGAIN) =>
                {
                    return Ok(None)
                }
                other => break other?,
            };
        };

        let peer = sockaddr_to_addr(&storage, len as usize)?;
        Ok(Some((Socket(unsafe { FileDesc::new(fd) }), peer)))
    }

    pub fn as_raw(&self) -> RawFd {
        self.0.raw()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(self.0.raw(), buf.as_mut_ptr() as *mut c_void, buf.len(), 0))?;
        Ok(n as usize)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.0.read_vectored(bufs)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(self.0.raw(), buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL))?;
        Ok(n as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.0.write_vectored(bufs)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.0.raw(), how))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut flag = nonblocking as c_int;
        syscall!(ioctl(self.0.raw(), libc::FIONBIO, &mut flag))?;
        Ok(())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    pub fn set_reuseport(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_REUSEPORT, reuse as c_int)
    }

    pub fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, keepalive as c_int)
    }

    /// Clears and returns the socket's pending error (`getsockopt`
    /// `SO_ERROR`), used for error-channel detection.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| unsafe { libc::getsockname(self.0.raw(), storage, len) })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| unsafe { libc::getpeername(self.0.raw(), storage, len) })
    }
}

/// `getsockname` on a raw, not-yet-wrapped fd — used for a freshly
/// accepted connection's local-address lookup before ownership transfers
/// to the eventual `Socket`.
pub fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    sockname(|storage, len| unsafe { libc::getsockname(fd, storage, len) })
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: T) -> io::Result<()> {
    let payload = &value as *const T as *const c_void;
    syscall!(setsockopt(fd, level, name, payload, mem::size_of::<T>() as socklen_t))?;
    Ok(())
}

fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(fd, level, name, &mut slot as *mut _ as *mut c_void, &mut len))?;
    Ok(slot)
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (*const libc::sockaddr, socklen_t) {
    match addr {
        SocketAddr::V4(a) => (a as *const _ as *const libc::sockaddr, mem::size_of_val(a) as socklen_t),
        SocketAddr::V6(a) => (a as *const _ as *const libc::sockaddr, mem::size_of_val(a) as socklen_t),
    }
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut libc::sockaddr, *mut socklen_t) -> c_int,
{
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let ret = f(&mut storage as *mut _ as *mut libc::sockaddr, &mut len);
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage, len as usize)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(addr.sin_addr.s_addr);
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = addr.sin6_addr.s6_addr;
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, addr.sin6_flowinfo, addr.sin6_scope_id)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}
