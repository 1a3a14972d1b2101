//! Acceptor: a non-blocking listening socket plus its Channel. Grounded
//! in `original_source/include/Acceptor.h` / `src/Acceptor.cpp`.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::rc::Rc;

use crate::event_loop::{ChannelId, EventLoop};
use crate::log_sink::{log_sink, Severity};
use crate::poll::Ready;
use crate::sys::socket::Socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(std::os::unix::io::RawFd, SocketAddr)>;

/// Lives entirely on the main/acceptor loop; never crosses threads.
pub(crate) struct Acceptor {
    loop_: Rc<EventLoop>,
    socket: Socket,
    channel: ChannelId,
    listening: bool,
    new_connection_cb: Option<NewConnectionCallback>,
}

impl Acceptor {
    pub(crate) fn new(loop_: Rc<EventLoop>, addr: SocketAddr, reuse_port: bool) -> std::io::Result<Acceptor> {
        let socket = Socket::bind_and_listen(&addr, reuse_port, 128)?;
        let channel = loop_.add_channel(socket.as_raw_fd());

        Ok(Acceptor { loop_, socket, channel, listening: false, new_connection_cb: None })
    }

    pub(crate) fn set_new_connection_callback(&mut self, cb: NewConnectionCallback) {
        self.new_connection_cb = Some(cb);
    }

    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// `start()` schedules this onto the main loop.
    pub(crate) fn listen(self_: Rc<std::cell::RefCell<Acceptor>>) {
        let mut acceptor = self_.borrow_mut();
        if acceptor.listening {
            return;
        }
        acceptor.listening = true;

        let loop_for_cb = acceptor.loop_.clone();
        let channel = acceptor.channel;
        let self_for_read = self_.clone();
        loop_for_cb.set_read_callback(
            channel,
            Box::new(move |_now| {
                Self::handle_read(&self_for_read);
            }),
        );
        loop_for_cb.update_channel_interest(channel, Ready::readable());
    }

    /// Repeatedly accept while the listener keeps returning connections;
    /// one `EMFILE`/`ENFILE` is logged and swallowed so the socket keeps
    /// accepting on the next readable event.
    fn handle_read(self_: &Rc<std::cell::RefCell<Acceptor>>) {
        loop {
            let accepted = self_.borrow().socket.accept();
            match accepted {
                Ok(Some((peer_socket, peer_addr))) => {
                    let mut acceptor = self_.borrow_mut();
                    let fd = peer_socket.into_raw_fd();
                    match acceptor.new_connection_cb.as_mut() {
                        Some(cb) => cb(fd, peer_addr),
                        None => {
                            let _ = unsafe { crate::sys::FileDesc::new(fd) };
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let acceptor = self_.borrow();
                    if e.raw_os_error() == Some(libc::EMFILE) || e.raw_os_error() == Some(libc::ENFILE) {
                        log_sink!(acceptor.loop_.log_sink(), Severity::Error, "Acceptor: fd limit hit accepting: {}", e);
                    } else {
                        log_sink!(acceptor.loop_.log_sink(), Severity::Error, "Acceptor::accept: {}", e);
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening {
            self.loop_.update_channel_interest(self.channel, Ready::empty());
        }
        self.loop_.remove_channel(self.channel);
    }
}
