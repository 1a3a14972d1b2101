//! High-water mark fires exactly once per upward crossing, not once per
//! `send()` call while already above the threshold.

use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor::{EventLoop, ServerOptions, TcpServer};

const HIGH_WATER_MARK: usize = 1024 * 1024;
const CHUNK: usize = 700 * 1024;

fn shrink_rcvbuf(stream: &TcpStream) {
    let fd = stream.as_raw_fd();
    let size: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[test]
fn fires_exactly_once_on_upward_crossing() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count_for_server = fire_count.clone();

    thread::spawn(move || {
        let main_loop = Rc::new(EventLoop::new().unwrap());
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut options = ServerOptions::new(addr, "hwm-test");
        options.num_threads = 1;

        let server = TcpServer::new(main_loop.clone(), options).unwrap();
        server.set_high_water_mark_callback(
            Arc::new(move |_conn, _queued| {
                fire_count_for_server.fetch_add(1, Ordering::SeqCst);
            }),
            HIGH_WATER_MARK,
        );

        let connected = Arc::new(std::sync::Mutex::new(None::<reactor::TcpConnectionHandle>));
        let connected_for_cb = connected.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *connected_for_cb.lock().unwrap() = Some(conn.clone());
            }
        }));

        server.start().unwrap();
        addr_tx.send(server.local_addr().unwrap()).unwrap();

        let send_loop = main_loop.handle();
        let connected_for_timer = connected.clone();
        main_loop.run_after(0.2, move || {
            if let Some(conn) = connected_for_timer.lock().unwrap().clone() {
                conn.send(&vec![0xCDu8; CHUNK]);
                conn.send(&vec![0xCDu8; CHUNK]);
            }
            send_loop.quit();
        });

        main_loop.run();
    });

    let addr = addr_rx.recv().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    shrink_rcvbuf(&client);

    thread::sleep(Duration::from_millis(500));

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    drop(client);
}
