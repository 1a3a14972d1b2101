//! Two `send()` calls issued back-to-back from the same off-loop thread
//! preserve FIFO order on the wire: "A" then "B", never "BA".

use std::io::Read;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor::{EventLoop, ServerOptions, TcpConnectionHandle, TcpServer};

#[test]
fn sends_from_another_thread_arrive_in_order() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let connected: Arc<Mutex<Option<TcpConnectionHandle>>> = Arc::new(Mutex::new(None));
    let connected_for_server = connected.clone();

    thread::spawn(move || {
        let main_loop = Rc::new(EventLoop::new().unwrap());
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut options = ServerOptions::new(addr, "cross-thread-test");
        options.num_threads = 1;

        let server = TcpServer::new(main_loop.clone(), options).unwrap();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *connected_for_server.lock().unwrap() = Some(conn.clone());
            }
        }));

        server.start().unwrap();
        addr_tx.send(server.local_addr().unwrap()).unwrap();
        main_loop.run();
    });

    let addr = addr_rx.recv().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();

    let handle = loop {
        if let Some(h) = connected.lock().unwrap().clone() {
            break h;
        }
        thread::sleep(Duration::from_millis(10));
    };

    assert!(!handle.is_in_loop_thread());
    handle.send(b"A");
    handle.send(b"B");

    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"AB");
}
