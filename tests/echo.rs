//! Echo round-trip: a client write comes back unchanged on the same
//! connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use reactor::{EventLoop, ServerOptions, TcpServer};

#[test]
fn echoes_back_what_the_client_sends() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let main_loop = Rc::new(EventLoop::new().unwrap());
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut options = ServerOptions::new(addr, "echo-test");
        options.num_threads = 2;

        let server = TcpServer::new(main_loop.clone(), options).unwrap();
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let msg = buf.retrieve_all_as_vec();
            conn.send(&msg);
        }));
        server.start().unwrap();

        addr_tx.send(server.local_addr().unwrap()).unwrap();
        main_loop.run();
    });

    let addr = addr_rx.recv().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello reactor");

    drop(client);
    drop(server_thread);
}
