//! Owns one [`Connector`] and at most one live [`Connection`] at a time,
//! reconnecting through the connector's backoff when retry is enabled.
//!
//! Grounded on muduo's `TcpClient.cc`, including its `detail::removeConnection`
//! indirection: a connection's close callback can still be running after
//! every external handle to the owning `TcpClient` has been dropped, so the
//! callback only ever holds a `Weak` reference back in here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::buffer::Buffer;
use crate::event_loop::EventLoopHandle;
use crate::net::address::Address;
use crate::net::connection::{
    Connection, ConnectionCallback, ConnectionCallbacks, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::net::connector::Connector;
use crate::sys::socket::Socket;

struct Inner {
    name: String,
    loop_handle: EventLoopHandle,
    connector: Connector,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicUsize,
    high_water_mark: AtomicUsize,
    connection: Mutex<Option<Connection>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
}

/// One outbound connection under management. Cheap to clone; every clone
/// shares the same connector and current connection.
#[derive(Clone)]
pub struct TcpClient(Arc<Inner>);

impl TcpClient {
    pub fn new(loop_handle: EventLoopHandle, server_addr: Address, name: impl Into<String>) -> TcpClient {
        let connector = Connector::new(loop_handle.clone(), server_addr);

        let client = TcpClient(Arc::new(Inner {
            name: name.into(),
            loop_handle,
            connector: connector.clone(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicUsize::new(1),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection: Mutex::new(None),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
        }));

        let weak = Arc::downgrade(&client.0);
        connector.set_new_connection_callback(move |socket| {
            if let Some(inner) = weak.upgrade() {
                TcpClient(inner).new_connection(socket);
            }
        });

        client
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn server_addr(&self) -> Address {
        self.0.connector.server_addr()
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Connection) + Send + Sync + 'static) {
        *self.0.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&Connection, &mut Buffer) + Send + Sync + 'static) {
        *self.0.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Connection) + Send + Sync + 'static) {
        *self.0.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(&self, cb: impl Fn(&Connection, usize) + Send + Sync + 'static) {
        *self.0.high_water_mark_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.0.high_water_mark.store(bytes, Ordering::SeqCst);
    }

    /// Reconnect automatically (through the connector's backoff) whenever
    /// the current connection drops while still wanted.
    pub fn enable_retry(&self) {
        self.0.retry.store(true, Ordering::SeqCst);
    }

    pub fn connection(&self) -> Option<Connection> {
        self.0.connection.lock().unwrap().clone()
    }

    pub fn connect(&self) {
        self.0.connect.store(true, Ordering::SeqCst);
        info!("TcpClient {} connecting to {}", self.0.name, self.0.connector.server_addr());
        self.0.connector.start();
    }

    /// Gracefully half-closes the current connection, if any, without
    /// touching the connector.
    pub fn disconnect(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Cancels the connector outright (including a pending retry). Does not
    /// touch an already-established connection.
    pub fn stop(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        self.0.connector.stop();
    }

    fn new_connection(&self, socket: Socket) {
        let peer_addr = match socket.peer_addr() {
            Ok(a) => Address::new(a),
            Err(e) => {
                warn!("TcpClient {} could not read peer addr: {}", self.0.name, e);
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(a) => Address::new(a),
            Err(e) => {
                warn!("TcpClient {} could not read local addr: {}", self.0.name, e);
                return;
            }
        };

        let conn_id = self.0.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.0.name, peer_addr.to_ip_port(), conn_id);
        info!("TcpClient {} - connected as {}", self.0.name, conn_name);

        let weak = Arc::downgrade(&self.0);
        let callbacks = ConnectionCallbacks {
            connection_cb: self.0.connection_cb.lock().unwrap().clone(),
            message_cb: self.0.message_cb.lock().unwrap().clone(),
            write_complete_cb: self.0.write_complete_cb.lock().unwrap().clone(),
            high_water_mark_cb: self.0.high_water_mark_cb.lock().unwrap().clone(),
            close_cb: Some(Arc::new(move |conn: &Connection| {
                if let Some(inner) = weak.upgrade() {
                    TcpClient(inner).remove_connection(conn);
                }
            })),
            high_water_mark: self.0.high_water_mark.load(Ordering::SeqCst),
        };

        let conn = Connection::new(conn_name, socket, local_addr, peer_addr, self.0.loop_handle.clone(), callbacks);
        *self.0.connection.lock().unwrap() = Some(conn.clone());

        let loop_handle = conn.loop_handle();
        loop_handle.queue_in_loop(move |loop_| conn.connect_established(loop_));
    }

    fn remove_connection(&self, conn: &Connection) {
        info!("TcpClient {} - connection {} closed", self.0.name, conn.name());
        {
            let mut slot = self.0.connection.lock().unwrap();
            if slot.as_ref().map(|c| c.name() == conn.name()).unwrap_or(false) {
                *slot = None;
            }
        }

        let conn = conn.clone();
        conn.loop_handle().queue_in_loop(move |loop_| conn.connect_destroyed(loop_));

        if self.0.retry.load(Ordering::SeqCst) && self.0.connect.load(Ordering::SeqCst) {
            info!("TcpClient {} - reconnecting to {}", self.0.name, self.0.connector.server_addr());
            self.0.connector.restart();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connector.stop();
        if let Some(conn) = self.connection.lock().unwrap().take() {
            conn.force_close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn connects_and_fires_connection_callback() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();

        let listener = Socket::new(&"127.0.0.1:0".parse().unwrap(), libc::SOCK_STREAM).unwrap();
        listener.set_reuseaddr(true).unwrap();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let addr = Address::new(listener.local_addr().unwrap());

        let connects = Arc::new(AtomicU32::new(0));
        let connects2 = connects.clone();

        let client = TcpClient::new(handle.clone(), addr, "test-client");
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                connects2.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.connect();

        let quit_handle = handle.clone();
        handle.queue_in_loop(move |loop_| {
            let _ = loop_.run_after(Duration::from_millis(200), move || quit_handle.quit());
        });

        loop_.run();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(client.connection().is_some());
    }
}
