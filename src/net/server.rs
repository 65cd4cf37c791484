//! Owns a listening socket on a base loop plus a [`LoopPool`] of I/O
//! workers: every accepted connection is named, handed to the next worker
//! round-robin, and tracked until its close callback removes it.
//!
//! Grounded on muduo's `TcpServer.cc`: connection naming
//! (`name-ip:port#n`), the idempotent `start()`, and the
//! accept → assign-worker → construct → `connectEstablished` pipeline.
//! The close callback only ever holds a `Weak` back into this server —
//! mirroring `detail::removeConnection` in the source, which exists
//! precisely because a connection's last close-related call can still be
//! in flight after every external handle to the server has been dropped.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::buffer::Buffer;
use crate::event_loop::EventLoopHandle;
use crate::loop_pool::LoopPool;
use crate::net::acceptor::Acceptor;
use crate::net::address::Address;
use crate::net::connection::{
    Connection, ConnectionCallback, ConnectionCallbacks, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::sys::socket::Socket;

struct Inner {
    name: String,
    addr: Address,
    base_handle: EventLoopHandle,
    thread_num: AtomicUsize,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    acceptor: Mutex<Option<Acceptor>>,
    pool: Mutex<Option<LoopPool>>,
    connections: Mutex<HashMap<String, Connection>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    high_water_mark: AtomicUsize,
}

/// A TCP listener plus the pool of loops its connections run on. Cheap to
/// clone; every clone shares the same acceptor, connection map and pool.
#[derive(Clone)]
pub struct TcpServer(Arc<Inner>);

impl TcpServer {
    pub fn new(
        base_handle: EventLoopHandle,
        addr: Address,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(addr, reuse_port)?;
        let bound_addr = acceptor.local_addr()?;
        Ok(TcpServer(Arc::new(Inner {
            name: name.into(),
            addr: bound_addr,
            base_handle,
            thread_num: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            acceptor: Mutex::new(Some(acceptor)),
            pool: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn addr(&self) -> Address {
        self.0.addr
    }

    /// Must be called before `start()`; panics otherwise, same as the
    /// source (changing the worker count after `start()` has no sane
    /// meaning — existing connections already picked a loop).
    pub fn set_thread_num(&self, n: usize) {
        assert!(!self.0.started.load(Ordering::SeqCst), "set_thread_num called after start()");
        self.0.thread_num.store(n, Ordering::SeqCst);
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.0.high_water_mark.store(bytes, Ordering::SeqCst);
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

    pub fn connection_count(&self) -> usize {
        self.0.connections.lock().unwrap().len()
    }

    /// Spawns the worker pool and starts accepting on the base loop.
    /// Idempotent: calling this again after the first successful call is a
    /// no-op.
    pub fn start(&self) -> io::Result<()> {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pool = LoopPool::new(self.0.base_handle.clone());
        pool.start(self.0.thread_num.load(Ordering::SeqCst), None)?;
        *self.0.pool.lock().unwrap() = Some(pool);

        let acceptor = self
            .0
            .acceptor
            .lock()
            .unwrap()
            .take()
            .expect("TcpServer::start called twice");

        let server = self.clone();
        self.0.base_handle.queue_in_loop(move |loop_| {
            let mut acceptor = acceptor;
            let cb_server = server.clone();
            match acceptor.listen(loop_, move |socket, peer_addr| {
                cb_server.new_connection(socket, peer_addr);
            }) {
                Ok(()) => *server.0.acceptor.lock().unwrap() = Some(acceptor),
                Err(e) => error!("TcpServer {} failed to listen on {}: {}", server.0.name, server.0.addr, e),
            }
        });

        info!("TcpServer {} starting on {}", self.0.name, self.0.addr);
        Ok(())
    }

    fn new_connection(&self, socket: Socket, peer_addr: Address) {
        let loop_handle = {
            let pool = self.0.pool.lock().unwrap();
            pool.as_ref()
                .expect("connections only arrive after start()")
                .next_loop()
        };

        let local_addr = match socket.local_addr() {
            Ok(a) => Address::new(a),
            Err(e) => {
                warn!("TcpServer {} could not read local addr for new connection: {}", self.0.name, e);
                return;
            }
        };

        let conn_id = self.0.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.0.name, peer_addr.to_ip_port(), conn_id);
        info!("TcpServer {} - new connection {} from {}", self.0.name, conn_name, peer_addr);

        let weak = Arc::downgrade(&self.0);
        let callbacks = ConnectionCallbacks {
            connection_cb: self.0.connection_cb.lock().unwrap().clone(),
            message_cb: self.0.message_cb.lock().unwrap().clone(),
            write_complete_cb: self.0.write_complete_cb.lock().unwrap().clone(),
            high_water_mark_cb: self.0.high_water_mark_cb.lock().unwrap().clone(),
            close_cb: Some(Arc::new(move |conn: &Connection| {
                if let Some(inner) = weak.upgrade() {
                    TcpServer(inner).remove_connection(conn);
                }
            })),
            high_water_mark: self.0.high_water_mark.load(Ordering::SeqCst),
        };

        let conn = Connection::new(conn_name.clone(), socket, local_addr, peer_addr, loop_handle.clone(), callbacks);
        self.0.connections.lock().unwrap().insert(conn_name, conn.clone());

        loop_handle.queue_in_loop(move |loop_| conn.connect_established(loop_));
    }

    fn remove_connection(&self, conn: &Connection) {
        info!("TcpServer {} - removing connection {}", self.0.name, conn.name());
        self.0.connections.lock().unwrap().remove(conn.name());

        let conn = conn.clone();
        conn.loop_handle().queue_in_loop(move |loop_| conn.connect_destroyed(loop_));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let conns: Vec<Connection> = self.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.force_close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn echoes_received_bytes_back_to_the_client() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();

        let server = TcpServer::new(handle.clone(), Address::any_v4(0), "echo-test", false).unwrap();
        server.set_message_callback(|conn, buf| {
            let data = buf.retrieve_all_as_vec();
            conn.send(data);
        });
        server.start().unwrap();
        let addr = server.addr().as_socket_addr();

        let client = std::thread::spawn(move || {
            // Give the base loop a moment to finish registering the acceptor.
            std::thread::sleep(Duration::from_millis(50));
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let quit_handle = handle.clone();
        handle.queue_in_loop(move |loop_| {
            let _ = loop_.run_after(Duration::from_millis(500), move || quit_handle.quit());
        });

        loop_.run();

        assert_eq!(&client.join().unwrap(), b"ping");
    }
}
