//! A client that writes a large payload then half-closes its write side:
//! the server must drain every byte through the message callback before
//! observing the connection go down.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use reactor::{EventLoop, ServerOptions, TcpServer};

const PAYLOAD_LEN: usize = 10 * 1024 * 1024;

#[test]
fn drains_all_bytes_before_closing() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    thread::spawn(move || {
        let main_loop = Rc::new(EventLoop::new().unwrap());
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut options = ServerOptions::new(addr, "half-close-test");
        options.num_threads = 1;

        let server = TcpServer::new(main_loop.clone(), options).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received_for_message = received.clone();
        server.set_message_callback(Arc::new(move |_conn, buf, _time| {
            let n = buf.readable();
            buf.retrieve_all();
            received_for_message.fetch_add(n, Ordering::SeqCst);
        }));

        let done_tx = done_tx.clone();
        let received_for_close = received.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                let _ = done_tx.send(received_for_close.load(Ordering::SeqCst));
            }
        }));

        server.start().unwrap();
        addr_tx.send(server.local_addr().unwrap()).unwrap();
        main_loop.run();
    });

    let addr = addr_rx.recv().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();

    let chunk = vec![0xABu8; 64 * 1024];
    let mut sent = 0usize;
    while sent < PAYLOAD_LEN {
        client.write_all(&chunk).unwrap();
        sent += chunk.len();
    }
    client.shutdown(Shutdown::Write).unwrap();

    let mut trailing = [0u8; 1];
    let _ = client.read(&mut trailing);

    let total_received = done_rx.recv().unwrap();
    assert_eq!(total_received, PAYLOAD_LEN);
}
