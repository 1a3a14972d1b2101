//! TcpConnection: the per-connection state machine.
//! Grounded in `original_source/include/TcpConnection.h` /
//! `src/TcpConnection.cpp`.
//!
//! There are two lifetime-safety options for tying a callback to its owner:
//! (a) a reference-counted connection with weak-upgrade on callback entry,
//! or (b) a generational slotmap index. `Channel`/`EventLoop` already use
//! (b) for the Channel-registration tie (see `event_loop::ChannelId`).
//! `TcpConnection` itself uses (a), but with `Arc<Mutex<_>>` rather than
//! `Rc<RefCell<_>>`: cross-thread `send()` means a `TcpConnectionHandle`
//! must be freely cloned and dropped from *any* application thread, not
//! just handed back and forth between one worker thread and itself. An
//! `Rc`'s non-atomic refcount cannot be mutated concurrently from two
//! threads without synchronization, and a general-purpose handle that
//! escapes to arbitrary caller threads cannot promise that won't happen —
//! so the refcount itself must be atomic. The `Mutex` is uncontended on
//! the hot path in the common case (one thread owns the connection's
//! traffic); this is the acknowledged cost of option (a) relative to the
//! slab-index hot-path optimization preferred for Channel dispatch.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::clock::Timestamp;
use crate::event_loop::{ChannelId, EventLoop, EventLoopHandle};
use crate::log_sink::{log_sink, LogSink, Severity};
use crate::poll::Ready;
use crate::sys::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Box<dyn FnMut(&TcpConnectionHandle) + Send>;
pub type MessageCallback = Box<dyn FnMut(&TcpConnectionHandle, &mut Buffer, Timestamp) + Send>;
pub type WriteCompleteCallback = Box<dyn FnMut(&TcpConnectionHandle) + Send>;
pub type HighWaterMarkCallback = Box<dyn FnMut(&TcpConnectionHandle, usize) + Send>;
pub type CloseCallback = Box<dyn FnMut(&TcpConnectionHandle) + Send>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub(crate) struct TcpConnection {
    loop_handle: EventLoopHandle,
    log_sink: Arc<dyn LogSink>,
    name: Arc<str>,
    socket: Socket,
    channel: ChannelId,
    state: ConnectionState,
    writing: bool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Buffer,
    output_buffer: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
}

/// The public, `Clone + Send + Sync` handle. Metadata fields are plain
/// immutable copies; all mutation hops through `loop_handle`.
#[derive(Clone)]
pub struct TcpConnectionHandle {
    loop_handle: EventLoopHandle,
    name: Arc<str>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    inner: Arc<Mutex<TcpConnection>>,
}

impl TcpConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.loop_handle.is_in_loop_thread()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().state == ConnectionState::Connected
    }

    /// Cross-thread send: direct call on-loop, queued copy
    /// otherwise. FIFO of the loop's inbox preserves per-thread send order.
    pub fn send(&self, data: &[u8]) {
        let handle = self.clone();
        if self.loop_handle.is_in_loop_thread() {
            self.inner.lock().unwrap().send_in_loop(&handle, data);
        } else {
            let data = data.to_vec();
            let inner = self.inner.clone();
            self.loop_handle.run_in_loop(move |_loop| {
                inner.lock().unwrap().send_in_loop(&handle, &data);
            });
        }
    }

    pub fn shutdown(&self) {
        if self.loop_handle.is_in_loop_thread() {
            self.inner.lock().unwrap().shutdown_in_loop();
        } else {
            let inner = self.inner.clone();
            self.loop_handle.run_in_loop(move |_loop| {
                inner.lock().unwrap().shutdown_in_loop();
            });
        }
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.inner.lock().unwrap().high_water_mark = mark;
    }
}

impl TcpConnection {
    /// Construction happens on the worker loop (scheduled via
    /// `run_in_loop`/`queue_in_loop` from the main loop's `newConnection`).
    pub(crate) fn new(
        loop_: &EventLoop,
        name: Arc<str>,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Mutex<TcpConnection>> {
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let _ = socket.set_nodelay(true);
        let _ = socket.set_keepalive(true);
        let channel = loop_.add_channel(fd);

        Arc::new(Mutex::new(TcpConnection {
            loop_handle: loop_.handle(),
            log_sink: loop_.log_sink(),
            name,
            socket,
            channel,
            state: ConnectionState::Connecting,
            writing: false,
            local_addr,
            peer_addr,
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
        }))
    }

    pub(crate) fn handle(self_: &Arc<Mutex<TcpConnection>>) -> TcpConnectionHandle {
        let conn = self_.lock().unwrap();
        TcpConnectionHandle {
            loop_handle: conn.loop_handle.clone(),
            name: conn.name.clone(),
            local_addr: conn.local_addr,
            peer_addr: conn.peer_addr,
            inner: self_.clone(),
        }
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn loop_handle(self_: &Arc<Mutex<TcpConnection>>) -> EventLoopHandle {
        self_.lock().unwrap().loop_handle.clone()
    }

    pub(crate) fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = Some(cb);
    }

    pub(crate) fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_cb = Some(cb);
    }

    pub(crate) fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark_cb = Some(cb);
        self.high_water_mark = mark;
    }

    /// Installed by `TcpServer::newConnection`; routes back to
    /// `removeConnection`.
    pub(crate) fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// `connectEstablished`. Must run on the owning loop.
    pub(crate) fn connect_established(self_: &Arc<Mutex<TcpConnection>>) {
        Self::install_channel_callbacks(self_);

        let (loop_handle, channel, handle) = {
            let mut conn = self_.lock().unwrap();
            debug_assert_eq!(conn.state, ConnectionState::Connecting);
            conn.state = ConnectionState::Connected;
            (conn.loop_handle.clone(), conn.channel, Self::handle(self_))
        };

        loop_handle.run_in_loop(move |event_loop| {
            event_loop.update_channel_interest(channel, Ready::readable());
        });

        let mut conn = self_.lock().unwrap();
        if let Some(cb) = conn.connection_cb.as_mut() {
            cb(&handle);
        }
    }

    fn install_channel_callbacks(self_: &Arc<Mutex<TcpConnection>>) {
        let (loop_handle, channel) = {
            let conn = self_.lock().unwrap();
            (conn.loop_handle.clone(), conn.channel)
        };

        let read_conn = self_.clone();
        let write_conn = self_.clone();
        let error_conn = self_.clone();
        let close_conn = self_.clone();

        loop_handle.run_in_loop(move |event_loop| {
            event_loop.set_read_callback(
                channel,
                Box::new(move |now| TcpConnection::handle_read(&read_conn, now)),
            );
            event_loop.set_write_callback(
                channel,
                Box::new(move || TcpConnection::handle_write(&write_conn)),
            );
            event_loop.set_error_callback(
                channel,
                Box::new(move || TcpConnection::handle_error(&error_conn)),
            );
            event_loop.set_close_callback(
                channel,
                Box::new(move || TcpConnection::handle_close(&close_conn)),
            );
        });
    }

    /// Read path.
    fn handle_read(self_: &Arc<Mutex<TcpConnection>>, receive_time: Timestamp) {
        let n = {
            let mut conn = self_.lock().unwrap();
            let fd = conn.socket.as_raw_fd();
            conn.input_buffer.read_fd(fd)
        };

        match n {
            Ok(n) if n > 0 => {
                let handle = Self::handle(self_);
                let mut conn = self_.lock().unwrap();
                if conn.message_cb.is_some() {
                    let TcpConnection { message_cb, input_buffer, .. } = &mut *conn;
                    (message_cb.as_mut().unwrap())(&handle, input_buffer, receive_time);
                }
            }
            Ok(0) => Self::handle_close(self_),
            Ok(_) => {
                // read_fd's -1 sentinel: would-block, nothing to do.
            }
            Err(e) => {
                let conn = self_.lock().unwrap();
                log_sink!(conn.log_sink, Severity::Error, "TcpConnection [{}] read error: {}", conn.name, e);
            }
        }
    }

    /// Write-drain path.
    fn handle_write(self_: &Arc<Mutex<TcpConnection>>) {
        let write_result = {
            let mut conn = self_.lock().unwrap();
            if !conn.writing {
                return;
            }
            let pending = conn.output_buffer.peek().to_vec();
            let result = conn.socket.write(&pending);
            match result {
                Ok(n) => {
                    conn.output_buffer.retrieve(n);
                    Some(conn.output_buffer.readable() == 0)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(false),
                Err(e) => {
                    log_sink!(conn.log_sink, Severity::Error, "TcpConnection [{}] handleWrite: {}", conn.name, e);
                    None
                }
            }
        };

        let emptied = match write_result {
            Some(emptied) => emptied,
            None => return,
        };

        if emptied {
            let (loop_handle, channel) = {
                let mut conn = self_.lock().unwrap();
                conn.writing = false;
                (conn.loop_handle.clone(), conn.channel)
            };
            loop_handle.run_in_loop(move |event_loop| {
                event_loop.update_channel_interest(channel, Ready::readable());
            });

            let handle = Self::handle(self_);
            let should_shutdown = {
                let mut conn = self_.lock().unwrap();
                if let Some(cb) = conn.write_complete_cb.as_mut() {
                    cb(&handle);
                }
                conn.state == ConnectionState::Disconnecting
            };
            if should_shutdown {
                self_.lock().unwrap().do_shutdown_write();
            }
        }
    }

    fn handle_error(self_: &Arc<Mutex<TcpConnection>>) {
        let conn = self_.lock().unwrap();
        match conn.socket.take_error() {
            Ok(Some(e)) => {
                log_sink!(conn.log_sink, Severity::Error, "TcpConnection [{}] SO_ERROR: {}", conn.name, e);
            }
            Ok(None) => {
                log_sink!(conn.log_sink, Severity::Warn, "TcpConnection [{}] spurious error event", conn.name);
            }
            Err(e) => {
                log_sink!(conn.log_sink, Severity::Error, "TcpConnection [{}] take_error failed: {}", conn.name, e);
            }
        }
    }

    /// `handleClose`: holds a strong handle across the user
    /// callbacks so the connection survives its own removal.
    fn handle_close(self_: &Arc<Mutex<TcpConnection>>) {
        let handle = Self::handle(self_);
        let (loop_handle, channel, was_connected) = {
            let mut conn = self_.lock().unwrap();
            let was_connected = conn.state == ConnectionState::Connected;
            conn.state = ConnectionState::Disconnected;
            (conn.loop_handle.clone(), conn.channel, was_connected)
        };

        loop_handle.run_in_loop(move |event_loop| {
            event_loop.update_channel_interest(channel, Ready::empty());
        });

        if was_connected {
            let mut conn = self_.lock().unwrap();
            if let Some(cb) = conn.connection_cb.as_mut() {
                cb(&handle);
            }
        }

        let mut conn = self_.lock().unwrap();
        if let Some(cb) = conn.close_cb.as_mut() {
            cb(&handle);
        }
    }

    /// `connectDestroyed`, called from the server's remove
    /// path once the connection object has already left `ConnectionMap`.
    pub(crate) fn connect_destroyed(self_: &Arc<Mutex<TcpConnection>>) {
        let handle = Self::handle(self_);
        let (loop_handle, channel, was_connected) = {
            let mut conn = self_.lock().unwrap();
            let was_connected = conn.state == ConnectionState::Connected;
            conn.state = ConnectionState::Disconnected;
            (conn.loop_handle.clone(), conn.channel, was_connected)
        };

        if was_connected {
            let mut conn = self_.lock().unwrap();
            if let Some(cb) = conn.connection_cb.as_mut() {
                cb(&handle);
            }
        }

        loop_handle.run_in_loop(move |event_loop| {
            event_loop.update_channel_interest(channel, Ready::empty());
            event_loop.remove_channel(channel);
        });
    }

    fn shutdown_in_loop(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnecting;
            if !self.writing {
                self.do_shutdown_write();
            }
        }
    }

    fn do_shutdown_write(&mut self) {
        if let Err(e) = self.socket.shutdown(std::net::Shutdown::Write) {
            log_sink!(self.log_sink, Severity::Error, "TcpConnection [{}] shutdown(WR): {}", self.name, e);
        }
    }

    /// `sendInLoop`.
    fn send_in_loop(&mut self, handle: &TcpConnectionHandle, data: &[u8]) {
        if self.state == ConnectionState::Disconnected {
            log_sink!(self.log_sink, Severity::Warn, "TcpConnection [{}] send after disconnect, discarded", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if !self.writing && self.output_buffer.readable() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    nwrote = 0;
                }
                Err(e) => {
                    let raw = e.raw_os_error();
                    if raw == Some(libc::EPIPE) || raw == Some(libc::ECONNRESET) {
                        fault = true;
                    }
                    log_sink!(self.log_sink, Severity::Error, "TcpConnection [{}] write: {}", self.name, e);
                }
            }
        }

        if fault {
            return;
        }

        if remaining == 0 {
            // The direct write above took the whole payload in one shot:
            // queue the write-complete callback onto the loop rather than
            // calling it inline, mirroring the original's
            // `loop_->queueInLoop(...)` so it runs after the current stack
            // (possibly a cross-thread `send()`) unwinds.
            if self.write_complete_cb.is_some() {
                let inner = handle.inner.clone();
                let handle_for_cb = handle.clone();
                self.loop_handle.queue_in_loop(move |_loop| {
                    let mut conn = inner.lock().unwrap();
                    if let Some(cb) = conn.write_complete_cb.as_mut() {
                        cb(&handle_for_cb);
                    }
                });
            }
            return;
        }

        let old_len = self.output_buffer.readable();
        if old_len < self.high_water_mark && old_len + remaining >= self.high_water_mark {
            if let Some(cb) = self.high_water_mark_cb.as_mut() {
                cb(handle, old_len + remaining);
            }
        }
        self.output_buffer.append(&data[nwrote..]);

        if !self.writing {
            self.writing = true;
            let (loop_handle, channel) = (self.loop_handle.clone(), self.channel);
            loop_handle.run_in_loop(move |event_loop| {
                event_loop.update_channel_interest(channel, Ready::readable() | Ready::writable());
            });
        }
    }

    /// `sendFileInLoop`: per this crate's Open Question
    /// resolution, progress on a short send is driven by `handleWrite` via
    /// write-interest rather than by self-requeuing, so this simply routes
    /// through the same buffered path as `send_in_loop` once the whole
    /// region has been read into memory. A dedicated zero-copy `sendfile`
    /// fast path is left to a future transport-level addition; the
    /// observable contract (full `count` bytes transmitted, completion
    /// callback on success) already holds through the buffered route.
    pub(crate) fn send_file_in_loop(
        self_: &Arc<Mutex<TcpConnection>>,
        handle: &TcpConnectionHandle,
        fd: RawFd,
        offset: i64,
        count: usize,
    ) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = unsafe { std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(fd)) };
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut data = vec![0u8; count];
        file.read_exact(&mut data)?;

        self_.lock().unwrap().send_in_loop(handle, &data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TcpConnectionHandle>();
    }
}
