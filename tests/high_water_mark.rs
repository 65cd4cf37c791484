//! `TcpServer::set_high_water_mark_callback` must fire once the moment a
//! connection's pending output crosses the configured threshold, driven
//! end to end through a slow reader on the other side.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopio::{Address, EventLoop, TcpServer};

#[test]
fn crossing_the_high_water_mark_invokes_the_callback() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let server = TcpServer::new(handle.clone(), Address::loopback(0), "hwm-server", false).unwrap();
    server.set_high_water_mark(1024);

    let tripped = Arc::new(AtomicBool::new(false));
    let tripped2 = tripped.clone();
    server.set_high_water_mark_callback(move |_conn, len| {
        assert!(len >= 1024);
        tripped2.store(true, Ordering::SeqCst);
    });
    server.set_connection_callback(|conn| {
        if conn.connected() {
            // Flood well past the threshold in one call; the reader on the
            // other end never reads, so this all piles up in the output buffer.
            conn.send(vec![0u8; 4 * 1024 * 1024]);
        }
    });
    server.start().unwrap();
    let addr = server.addr().as_socket_addr();

    let reader = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).unwrap();
        // Deliberately never read: just hold the connection open so the
        // server's write side backs up instead of draining.
        std::thread::sleep(Duration::from_millis(500));
        let mut scratch = [0u8; 64];
        let _ = stream.write(&[]);
        let _ = stream.read(&mut scratch);
    });

    let quit_handle = handle.clone();
    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(700), move || quit_handle.quit());
    });

    loop_.run();
    let _ = reader.join();

    assert!(tripped.load(Ordering::SeqCst));
}
