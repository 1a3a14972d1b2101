//! TcpServer: wires one `Acceptor` to an `EventLoopThreadPool`, assigning
//! each accepted connection to a worker loop and tracking it until close.
//! Grounded in `original_source/include/TcpServer.h` /
//! `src/TcpServer.cpp`.
//!
//! `Acceptor` and the main loop never leave the thread that constructs the
//! `TcpServer` — both are held as plain `Rc`-rooted fields. The genuinely
//! shared state (`ConnectionMap`, user callbacks, thread-pool dispatch) is
//! `Arc<Mutex<Inner>>`; in practice it is only ever touched from the main
//! loop thread (every access is reached through `main_loop.run_in_loop`),
//! but the lock lets it live inside `Send` closures that may be *queued*
//! from a worker thread (e.g. a connection's close callback) without
//! resorting to `unsafe impl Send`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::clock::Timestamp;
use crate::connection::{TcpConnection, TcpConnectionHandle};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::sys::socket::local_addr_of;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionHandle) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionHandle, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionHandle) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionHandle, usize) + Send + Sync>;

/// Construction parameters.
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    pub name: String,
    pub num_threads: usize,
    pub reuse_port: bool,
}

impl ServerOptions {
    pub fn new(listen_addr: SocketAddr, name: impl Into<String>) -> ServerOptions {
        ServerOptions { listen_addr, name: name.into(), num_threads: 0, reuse_port: false }
    }
}

struct Inner {
    name: String,
    ip_port: String,
    main_loop: crate::event_loop::EventLoopHandle,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<Mutex<TcpConnection>>>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<(HighWaterMarkCallback, usize)>>,
}

pub struct TcpServer {
    main_loop: Rc<EventLoop>,
    acceptor: Rc<RefCell<Acceptor>>,
    thread_pool: Rc<RefCell<EventLoopThreadPool>>,
    thread_init_cb: RefCell<Option<ThreadInitCallback>>,
    started: AtomicBool,
    inner: Arc<Inner>,
}

impl TcpServer {
    pub fn new(main_loop: Rc<EventLoop>, options: ServerOptions) -> Result<TcpServer> {
        let acceptor = Acceptor::new(main_loop.clone(), options.listen_addr, options.reuse_port)
            .map_err(crate::error::ReactorError::ListenerCreation)?;
        let acceptor = Rc::new(RefCell::new(acceptor));

        let thread_pool = Rc::new(RefCell::new(EventLoopThreadPool::new(
            &main_loop,
            options.name.clone(),
            options.num_threads,
        )));

        let inner = Arc::new(Inner {
            ip_port: options.listen_addr.to_string(),
            name: options.name,
            main_loop: main_loop.handle(),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
        });

        let server = TcpServer {
            main_loop,
            acceptor,
            thread_pool,
            thread_init_cb: RefCell::new(None),
            started: AtomicBool::new(false),
            inner,
        };

        server.install_new_connection_callback();
        Ok(server)
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.borrow_mut() = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.inner.high_water_mark_cb.lock().unwrap() = Some((cb, mark));
    }

    fn install_new_connection_callback(&self) {
        let inner = self.inner.clone();
        let thread_pool = self.thread_pool.clone();

        self.acceptor.borrow_mut().set_new_connection_callback(Box::new(move |fd, peer_addr| {
            Inner::new_connection(&inner, &thread_pool, fd, peer_addr);
        }));
    }

    /// Idempotent: starts the worker pool, then
    /// schedules `Acceptor::listen` onto the main loop.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let init_cb = self.thread_init_cb.borrow().clone();
        self.thread_pool.borrow_mut().start(&self.main_loop, init_cb)?;

        let acceptor = self.acceptor.clone();
        self.main_loop.handle().run_in_loop(move |_loop| {
            Acceptor::listen(acceptor.clone());
        });

        Ok(())
    }

    pub fn get_all_loops(&self) -> Vec<crate::event_loop::EventLoopHandle> {
        self.thread_pool.borrow().get_all_loops()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.borrow().local_addr()
    }
}

impl Inner {
    /// Runs on the main loop thread (the
    /// `Acceptor`'s read callback). Picks a worker loop by consistent hash
    /// on the peer address, constructs the `TcpConnection` there, and hops
    /// back to that same worker loop to run `connectEstablished`.
    fn new_connection(self_: &Arc<Inner>, thread_pool: &Rc<RefCell<EventLoopThreadPool>>, fd: RawFd, peer_addr: SocketAddr) {
        let io_loop = thread_pool.borrow().get_next_loop(&peer_addr.to_string());

        let conn_id = self_.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name: Arc<str> = Arc::from(format!("{}-{}#{}", self_.name, self_.ip_port, conn_id));

        let local_addr = match local_addr_of(fd) {
            Ok(addr) => addr,
            Err(_) => peer_addr,
        };

        let self_for_established = self_.clone();
        let name_for_established = conn_name.clone();
        io_loop.run_in_loop(move |event_loop| {
            let conn = TcpConnection::new(event_loop, name_for_established.clone(), fd, local_addr, peer_addr);
            Inner::install_connection_callbacks(&self_for_established, &conn);

            self_for_established
                .connections
                .lock()
                .unwrap()
                .insert(name_for_established.to_string(), conn.clone());

            TcpConnection::connect_established(&conn);
        });
    }

    fn install_connection_callbacks(self_: &Arc<Inner>, conn: &Arc<Mutex<TcpConnection>>) {
        let mut guard = conn.lock().unwrap();

        if let Some(cb) = self_.connection_cb.lock().unwrap().clone() {
            guard.set_connection_callback(Box::new(move |h| cb(h)));
        }
        if let Some(cb) = self_.message_cb.lock().unwrap().clone() {
            guard.set_message_callback(Box::new(move |h, buf, t| cb(h, buf, t)));
        }
        if let Some(cb) = self_.write_complete_cb.lock().unwrap().clone() {
            guard.set_write_complete_callback(Box::new(move |h| cb(h)));
        }
        if let Some((cb, mark)) = self_.high_water_mark_cb.lock().unwrap().clone() {
            guard.set_high_water_mark_callback(Box::new(move |h, n| cb(h, n)), mark);
        }

        let self_for_close = self_.clone();
        guard.set_close_callback(Box::new(move |h| Inner::remove_connection(&self_for_close, h)));
    }

    /// Hops to the main loop to erase the
    /// connection map entry, then hops back to the owning worker loop to
    /// run `connectDestroyed` (`queueInLoop`, so it runs after the current
    /// dispatch of this very callback finishes).
    fn remove_connection(self_: &Arc<Inner>, handle: &TcpConnectionHandle) {
        let name = handle.name().to_string();
        let self_for_remove = self_.clone();

        self_.main_loop.run_in_loop(move |_loop| {
            Inner::remove_connection_in_loop(&self_for_remove, &name);
        });
    }

    fn remove_connection_in_loop(self_: &Arc<Inner>, name: &str) {
        let conn = self_.connections.lock().unwrap().remove(name);
        if let Some(conn) = conn {
            let conn_loop = TcpConnection::loop_handle(&conn);
            conn_loop.queue_in_loop(move |_loop| {
                TcpConnection::connect_destroyed(&conn);
            });
        }
    }
}
