//! `Connection::shutdown()` half-closes the write side only after any
//! pending output has drained, and the peer sees a clean EOF rather than
//! a reset.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopio::{Address, EventLoop, TcpServer};

#[test]
fn shutdown_drains_pending_output_before_half_closing() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let server = TcpServer::new(handle.clone(), Address::loopback(0), "shutdown-server", false).unwrap();
    let write_completed = Arc::new(AtomicBool::new(false));
    let write_completed2 = write_completed.clone();

    server.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"draining this first".to_vec());
            conn.shutdown();
        }
    });
    server.set_write_complete_callback(move |_conn| {
        write_completed2.store(true, Ordering::SeqCst);
    });
    server.start().unwrap();
    let addr = server.addr().as_socket_addr();

    let client = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        // A clean half-close delivers the queued bytes then EOF (read returns 0),
        // rather than an abrupt reset.
        stream.read_to_end(&mut received).unwrap();
        received
    });

    let quit_handle = handle.clone();
    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(500), move || quit_handle.quit());
    });

    loop_.run();

    let received = client.join().unwrap();
    assert_eq!(&received, b"draining this first");
    assert!(write_completed.load(Ordering::SeqCst));
}
