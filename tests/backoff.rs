//! A `TcpClient` with retry enabled, pointed at a port nothing is
//! listening on yet, must back off and keep retrying until a server
//! shows up on that same address.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopio::{Address, EventLoop, TcpClient, TcpServer};

#[test]
fn client_reconnects_once_a_listener_appears() {
    // Reserve a free port, then immediately release it: nothing answers
    // there until the server below binds the same address.
    let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = Address::new(reserved.local_addr().unwrap());
    drop(reserved);

    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let connects = Arc::new(AtomicU32::new(0));
    let connects2 = connects.clone();

    let client = TcpClient::new(handle.clone(), addr, "backoff-client");
    client.enable_retry();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            connects2.fetch_add(1, Ordering::SeqCst);
        }
    });
    client.connect();

    let server_handle = handle.clone();
    let server_addr = addr;
    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(700), move || {
            let server = TcpServer::new(server_handle.clone(), server_addr, "backoff-server", false).unwrap();
            server.start().unwrap();
            // Leak it for the remainder of the test: dropping would force-close
            // every connection it owns, including the one we're about to accept.
            std::mem::forget(server);
        });
    });

    let quit_handle = handle.clone();
    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(2500), move || quit_handle.quit());
    });

    loop_.run();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
}
