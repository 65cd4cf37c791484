//! A single established TCP connection, shared by every piece of code
//! (the Poller's channel callbacks, the owning `TcpServer`/`TcpClient`,
//! user code holding a clone) that needs to touch it.
//!
//! Grounded on muduo's `TcpConnection`: same state machine, same
//! `connectEstablished`/`connectDestroyed` one-shot lifecycle calls, same
//! high-water-mark and half-close behavior. `shared_ptr<TcpConnection>`
//! becomes `Connection(Arc<ConnectionInner>)`; the mutable core (state,
//! buffers, byte counters, user context) sits behind one `Mutex` rather
//! than muduo's implicit "only ever touched on the owning loop" discipline,
//! because Rust has no way to assert that discipline at compile time the
//! way a single-threaded C++ reactor can informally rely on it.

use std::any::Any;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::net::address::Address;
use crate::sys::socket::Socket;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Connection, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Connection, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Connections below this many pending output bytes never trip the
/// high-water-mark callback; matches the 64MiB muduo historically shipped
/// as a sane server-side default. `TcpServer`/`TcpClient` may override it.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

struct Mutable {
    state: State,
    input: Buffer,
    output: Buffer,
    context: Option<Box<dyn Any + Send + Sync>>,
}

struct ConnectionInner {
    name: String,
    socket: Socket,
    local_addr: Address,
    peer_addr: Address,
    creation_time: Instant,
    loop_handle: EventLoopHandle,
    high_water_mark: usize,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    mutable: Mutex<Mutable>,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
}

#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

pub struct ConnectionCallbacks {
    pub connection_cb: Option<ConnectionCallback>,
    pub message_cb: Option<MessageCallback>,
    pub write_complete_cb: Option<WriteCompleteCallback>,
    pub high_water_mark_cb: Option<HighWaterMarkCallback>,
    pub close_cb: Option<CloseCallback>,
    pub high_water_mark: usize,
}

impl Default for ConnectionCallbacks {
    fn default() -> Self {
        ConnectionCallbacks {
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl Connection {
    pub fn new(
        name: String,
        socket: Socket,
        local_addr: Address,
        peer_addr: Address,
        loop_handle: EventLoopHandle,
        callbacks: ConnectionCallbacks,
    ) -> Connection {
        let _ = socket.set_nodelay(true);
        Connection(Arc::new(ConnectionInner {
            name,
            socket,
            local_addr,
            peer_addr,
            creation_time: Instant::now(),
            loop_handle,
            high_water_mark: callbacks.high_water_mark,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            mutable: Mutex::new(Mutable {
                state: State::Connecting,
                input: Buffer::new(),
                output: Buffer::new(),
                context: None,
            }),
            connection_cb: callbacks.connection_cb,
            message_cb: callbacks.message_cb,
            write_complete_cb: callbacks.write_complete_cb,
            high_water_mark_cb: callbacks.high_water_mark_cb,
            close_cb: callbacks.close_cb,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn local_addr(&self) -> Address {
        self.0.local_addr
    }

    pub fn peer_addr(&self) -> Address {
        self.0.peer_addr
    }

    pub fn creation_time(&self) -> Instant {
        self.0.creation_time
    }

    pub fn bytes_received(&self) -> u64 {
        self.0.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.0.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> State {
        self.0.mutable.lock().unwrap().state
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn set_context(&self, ctx: Box<dyn Any + Send + Sync>) {
        self.0.mutable.lock().unwrap().context = Some(ctx);
    }

    pub fn with_context<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.0.mutable.lock().unwrap();
        f(guard.context.as_deref())
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.0.socket.set_nodelay(on)
    }

    /// The loop this connection was constructed on — where `connect_established`
    /// and `connect_destroyed` must run. `TcpServer`/`TcpClient` use this to
    /// queue teardown on the right thread rather than the base loop.
    pub fn loop_handle(&self) -> EventLoopHandle {
        self.0.loop_handle.clone()
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        self.0.socket.as_raw_fd()
    }

    /// Registers this connection's channel with `loop_` and fires the
    /// connection callback. Called exactly once, on the owning loop's
    /// thread, right after the connection is accepted or completes
    /// connecting.
    pub fn connect_established(&self, loop_: &mut EventLoop) {
        {
            let mut m = self.0.mutable.lock().unwrap();
            assert_eq!(m.state, State::Connecting);
            m.state = State::Connected;
        }

        let fd = self.fd();
        let channel = loop_.new_channel(fd);
        channel.tie(&self.0);

        let read_self = self.clone();
        channel.set_read_callback(move |channel, now| read_self.handle_read(channel, now));

        let write_self = self.clone();
        channel.set_write_callback(move |channel| write_self.handle_write(channel));

        let close_self = self.clone();
        channel.set_close_callback(move |channel| close_self.handle_close(channel));

        let error_self = self.clone();
        channel.set_error_callback(move |_channel| error_self.handle_error());

        channel.enable_reading();
        let _ = loop_.update_channel(fd);

        if let Some(cb) = &self.0.connection_cb {
            cb(self);
        }
    }

    /// Tears down this connection's channel. Called exactly once, after
    /// `handle_close` has already run (or, for a connection that never
    /// finished connecting, directly) — always deferred through the
    /// owning loop's task queue so it never runs while that same channel
    /// is still mid-dispatch.
    pub fn connect_destroyed(&self, loop_: &mut EventLoop) {
        let was_connected = {
            let mut m = self.0.mutable.lock().unwrap();
            let was = m.state == State::Connected;
            m.state = State::Disconnected;
            was
        };

        let fd = self.fd();
        if let Some(channel) = loop_.channel_mut(fd) {
            channel.disable_all();
        }
        let _ = loop_.update_channel(fd);
        let _ = loop_.remove_channel(fd);

        if was_connected {
            if let Some(cb) = &self.0.connection_cb {
                cb(self);
            }
        }
    }

    fn handle_read(&self, channel: &mut Channel, _receive_time: Instant) {
        let n = {
            let mut m = self.0.mutable.lock().unwrap();
            m.input.read_fd(&self.0.socket)
        };

        match n {
            Ok(0) => self.handle_close(channel),
            Ok(n) => {
                self.0.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                if let Some(cb) = &self.0.message_cb {
                    // Lend the input buffer to the callback with the lock
                    // released: `onMessage` implementations routinely call
                    // back into `conn` (send(), state(), with_context()),
                    // and the mutex guarding `Mutable` is not reentrant.
                    let mut input = std::mem::take(&mut self.0.mutable.lock().unwrap().input);
                    cb(self, &mut input);
                    self.0.mutable.lock().unwrap().input = input;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("connection {} read error: {}", self.0.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self, channel: &mut Channel) {
        if !channel.is_writing() {
            trace!("connection {} fd={} is down, no more writing", self.0.name, channel.fd());
            return;
        }

        let (written, now_empty, should_shutdown) = {
            let mut m = self.0.mutable.lock().unwrap();
            let data = m.output.peek().to_vec();
            match self.0.socket.write(&data) {
                Ok(n) => {
                    m.output.retrieve(n);
                    let empty = m.output.is_empty();
                    (n, empty, empty && m.state == State::Disconnecting)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => (0, false, false),
                Err(e) => {
                    warn!("connection {} write error: {}", self.0.name, e);
                    (0, false, false)
                }
            }
        };

        if written > 0 {
            self.0.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        }

        if now_empty {
            channel.disable_writing();
            if let Some(cb) = &self.0.write_complete_cb {
                cb(self);
            }
        }

        if should_shutdown {
            let _ = self.0.socket.shutdown(Shutdown::Write);
        }
    }

    fn handle_close(&self, channel: &mut Channel) {
        {
            let m = self.0.mutable.lock().unwrap();
            debug_assert!(m.state == State::Connected || m.state == State::Disconnecting);
        }
        channel.disable_all();

        if let Some(cb) = &self.0.close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        if let Ok(Some(e)) = self.0.socket.take_error() {
            error!("connection {} error: {}", self.0.name, e);
        }
    }

    /// Queues `data` for writing. Always goes through the task queue, even
    /// when called from the owning loop's own thread — `send_in_loop`
    /// needs a live `&mut EventLoop` to look up this connection's channel,
    /// and nothing here holds one; the next drained task supplies it.
    pub fn send(&self, data: Vec<u8>) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.send_in_loop(&data, loop_));
    }

    fn send_in_loop(&self, data: &[u8], loop_: &mut EventLoop) {
        let mut m = self.0.mutable.lock().unwrap();
        if m.state != State::Connected {
            warn!("connection {} send called after disconnect, dropping", self.0.name);
            return;
        }

        let fd = self.fd();
        let currently_writing = loop_.channel_mut(fd).map(|c| c.is_writing()).unwrap_or(false);

        let mut remaining = data;
        let mut written = 0usize;
        if !currently_writing && m.output.is_empty() {
            match self.0.socket.write(data) {
                Ok(n) => {
                    written = n;
                    remaining = &data[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("connection {} send error: {}", self.0.name, e);
                    return;
                }
            }
            if written == data.len() {
                drop(m);
                if let Some(cb) = &self.0.write_complete_cb {
                    cb(self);
                }
                return;
            }
        }

        let mut crossed_high_water_mark = None;
        if !remaining.is_empty() {
            let old_len = m.output.readable_bytes();
            m.output.append(remaining);
            let new_len = m.output.readable_bytes();
            if new_len >= self.0.high_water_mark && old_len < self.0.high_water_mark {
                crossed_high_water_mark = Some(new_len);
            }
            if let Some(channel) = loop_.channel_mut(fd) {
                if !channel.is_writing() {
                    channel.enable_writing();
                }
            }
            let _ = loop_.update_channel(fd);
        }
        // Drop the lock before calling out to user code below.
        drop(m);

        if written > 0 {
            self.0.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        }

        if let Some(new_len) = crossed_high_water_mark {
            if let Some(cb) = &self.0.high_water_mark_cb {
                cb(self, new_len);
            }
        }
    }

    /// Half-closes the write side once any pending output has drained.
    pub fn shutdown(&self) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.shutdown_in_loop(loop_));
    }

    fn shutdown_in_loop(&self, loop_: &mut EventLoop) {
        let mut m = self.0.mutable.lock().unwrap();
        if m.state != State::Connected {
            return;
        }
        m.state = State::Disconnecting;

        let fd = self.fd();
        let writing = loop_.channel_mut(fd).map(|c| c.is_writing()).unwrap_or(false);
        if !writing {
            let _ = self.0.socket.shutdown(Shutdown::Write);
        }
    }

    /// Closes the connection immediately regardless of pending output.
    pub fn force_close(&self) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.force_close_in_loop(loop_));
    }

    pub fn force_close_with_delay(&self, delay: Duration) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| {
            let inner = this.clone();
            let _ = loop_.run_after(delay, move || inner.force_close());
        });
    }

    fn force_close_in_loop(&self, loop_: &mut EventLoop) {
        let should_close = {
            let m = self.0.mutable.lock().unwrap();
            m.state == State::Connected || m.state == State::Disconnecting
        };
        if !should_close {
            return;
        }
        let fd = self.fd();
        if let Some(channel) = loop_.channel_mut(fd) {
            self.handle_close(channel);
        }
    }

    pub fn start_read(&self) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| {
            let fd = this.fd();
            if let Some(channel) = loop_.channel_mut(fd) {
                channel.enable_reading();
            }
            let _ = loop_.update_channel(fd);
        });
    }

    pub fn stop_read(&self) {
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| {
            let fd = this.fd();
            if let Some(channel) = loop_.channel_mut(fd) {
                channel.disable_reading();
            }
            let _ = loop_.update_channel(fd);
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Socket, Socket) {
        Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap()
    }

    #[test]
    fn new_connection_starts_in_connecting_state() {
        let (a, _b) = pair();
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let conn = Connection::new(
            "test".into(),
            a,
            Address::loopback(0),
            Address::loopback(0),
            handle,
            ConnectionCallbacks::default(),
        );
        assert_eq!(conn.state(), State::Connecting);
        conn.connect_established(&mut loop_);
        assert_eq!(conn.state(), State::Connected);
    }

    #[test]
    fn high_water_mark_fires_once_on_crossing() {
        let (a, _b) = pair();
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let crossed = Arc::new(AtomicU64::new(0));
        let c2 = crossed.clone();
        let callbacks = ConnectionCallbacks {
            high_water_mark: 16,
            high_water_mark_cb: Some(Arc::new(move |_: &Connection, _len: usize| {
                c2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let conn = Connection::new(
            "test".into(),
            a,
            Address::loopback(0),
            Address::loopback(0),
            handle,
            callbacks,
        );
        conn.connect_established(&mut loop_);
        conn.send_in_loop(&[0u8; 64], &mut loop_);
        assert_eq!(crossed.load(Ordering::SeqCst), 1);
    }
}
