//! Echo server: accepts connections, logs connect/disconnect, and writes
//! back whatever it reads. Grounded in
//! `original_source/examples/echoserver.cpp`; `AsyncLogger`/`Logger` setup
//! is replaced with `env_logger`, matching this crate's `LogCrateSink`.

use std::rc::Rc;
use std::sync::Arc;

use reactor::{EventLoop, ServerOptions, TcpServer};

fn main() {
    env_logger::init();

    let main_loop = Rc::new(EventLoop::new().expect("failed to create main EventLoop"));

    let addr = "0.0.0.0:8080".parse().expect("valid listen address");
    let mut options = ServerOptions::new(addr, "EchoServer");
    options.num_threads = 4;

    let server = TcpServer::new(main_loop.clone(), options).expect("failed to bind listener");

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            log::info!("new connection [{}] from {}", conn.name(), conn.peer_addr());
        } else {
            log::info!("connection [{}] is down", conn.name());
        }
    }));

    server.set_message_callback(Arc::new(|conn, buf, time| {
        let msg = buf.retrieve_all_as_vec();
        log::info!("connection [{}] recv {} bytes at {}", conn.name(), msg.len(), time);
        conn.send(&msg);
    }));

    server.start().expect("failed to start server");
    main_loop.run();
}
