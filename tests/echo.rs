//! Loopback echo through `TcpServer`/`TcpClient`, both running worker-free
//! (thread_num 0) against the same base loop as the client.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopio::{Address, EventLoop, TcpClient, TcpServer};

#[test]
fn client_sends_and_receives_an_echo() {
    let mut loop_ = EventLoop::new().unwrap();
    let handle = loop_.handle();

    let server = TcpServer::new(handle.clone(), Address::loopback(0), "echo-server", false).unwrap();
    server.set_message_callback(|conn, buf| {
        let data = buf.retrieve_all_as_vec();
        conn.send(data);
    });
    server.start().unwrap();
    let addr = server.addr();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let connects = Arc::new(AtomicU32::new(0));
    let connects2 = connects.clone();

    let client = TcpClient::new(handle.clone(), addr, "echo-client");
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            connects2.fetch_add(1, Ordering::SeqCst);
            conn.send(b"hello reactor".to_vec());
        }
    });
    client.set_message_callback(move |_conn, buf| {
        received2.lock().unwrap().extend_from_slice(&buf.retrieve_all_as_vec());
    });
    client.connect();

    let quit_handle = handle.clone();
    handle.queue_in_loop(move |loop_| {
        let _ = loop_.run_after(Duration::from_millis(500), move || quit_handle.quit());
    });

    loop_.run();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(&received.lock().unwrap()[..], b"hello reactor");
}
