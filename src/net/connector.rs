//! Drives a non-blocking `connect()` to completion, or retries it with
//! exponential backoff, then hands the connected socket off to the caller.
//!
//! Grounded on muduo's `Connector.cc`: same `{Disconnected, Connecting,
//! Connected}` state machine, same errno triage on the first `connect()`
//! call, and the same write-readiness-means-check-SO_ERROR trick to learn
//! whether a non-blocking connect actually succeeded. The channel used
//! while connecting is deliberately *not* tied the way `Connection`'s is:
//! nothing else can reach this fd while we're still negotiating it, so
//! there's no use-after-free window to close.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::net::address::Address;
use crate::sys::socket::Socket;
use crate::timer::TimerId;

pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Mutable {
    state: State,
    socket: Option<Socket>,
    retry_delay: Duration,
    retry_timer: Option<TimerId>,
}

struct Inner {
    server_addr: Address,
    loop_handle: EventLoopHandle,
    connect: AtomicBool,
    mutable: Mutex<Mutable>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

/// Cheap, cloneable handle around the connector's shared state; every
/// callback below is a clone of the original held by whoever owns it
/// (normally a [`crate::net::client::TcpClient`]).
#[derive(Clone)]
pub struct Connector(Arc<Inner>);

impl Connector {
    pub fn new(loop_handle: EventLoopHandle, server_addr: Address) -> Connector {
        Connector(Arc::new(Inner {
            server_addr,
            loop_handle,
            connect: AtomicBool::new(false),
            mutable: Mutex::new(Mutable {
                state: State::Disconnected,
                socket: None,
                retry_delay: INIT_RETRY_DELAY,
                retry_timer: None,
            }),
            new_connection_cb: Mutex::new(None),
        }))
    }

    pub fn server_addr(&self) -> Address {
        self.0.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(Socket) + Send + Sync + 'static) {
        *self.0.new_connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    fn state(&self) -> State {
        self.0.mutable.lock().unwrap().state
    }

    /// Thread-safe; arms the connector and posts the actual connect attempt
    /// onto its loop. Safe to call again after `stop()`.
    pub fn start(&self) {
        self.0.connect.store(true, Ordering::SeqCst);
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.start_in_loop(loop_));
    }

    /// Resets the backoff to its initial value and reconnects. Used by
    /// `TcpClient` when a connection with retry enabled drops.
    pub fn restart(&self) {
        {
            let mut m = self.0.mutable.lock().unwrap();
            m.state = State::Disconnected;
            m.retry_delay = INIT_RETRY_DELAY;
        }
        self.start();
    }

    /// Cancels any pending retry timer and the in-flight connect, if any,
    /// closing the underlying fd.
    pub fn stop(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.stop_in_loop(loop_));
    }

    fn start_in_loop(&self, loop_: &mut EventLoop) {
        if !self.0.connect.load(Ordering::SeqCst) {
            return;
        }
        self.connect_once(loop_);
    }

    fn connect_once(&self, loop_: &mut EventLoop) {
        let addr = self.0.server_addr.as_socket_addr();
        let socket = match Socket::new(&addr, libc::SOCK_STREAM) {
            Ok(s) => s,
            Err(e) => {
                error!("connector: failed to create socket for {}: {}", self.0.server_addr, e);
                return;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            error!("connector: failed to set nonblocking for {}: {}", self.0.server_addr, e);
            return;
        }

        match socket.connect(&addr) {
            Ok(()) => self.connecting(socket, loop_),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket, loop_)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => {
                    warn!("connector: retryable connect error to {}: {}", self.0.server_addr, e);
                    drop(socket);
                    self.retry(loop_);
                }
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    error!("connector: fatal connect error to {}: {}", self.0.server_addr, e);
                    drop(socket);
                }
                _ => {
                    error!("connector: unexpected connect error to {}: {}", self.0.server_addr, e);
                    drop(socket);
                }
            },
        }
    }

    fn connecting(&self, socket: Socket, loop_: &mut EventLoop) {
        let fd = socket.as_raw_fd();
        {
            let mut m = self.0.mutable.lock().unwrap();
            m.state = State::Connecting;
            m.socket = Some(socket);
        }

        let channel = loop_.new_channel(fd);
        let write_self = self.clone();
        channel.set_write_callback(move |channel| write_self.handle_write(channel));
        let error_self = self.clone();
        channel.set_error_callback(move |channel| error_self.handle_error(channel));
        channel.enable_writing();
        let _ = loop_.update_channel(fd);
    }

    fn handle_write(&self, channel: &mut crate::channel::Channel) {
        if self.state() != State::Connecting {
            return;
        }
        channel.disable_all();
        let fd = channel.fd();
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.finish_connecting(fd, loop_));
    }

    fn handle_error(&self, channel: &mut crate::channel::Channel) {
        if self.state() != State::Connecting {
            return;
        }
        warn!("connector: error event while connecting to {}", self.0.server_addr);
        channel.disable_all();
        let fd = channel.fd();
        let this = self.clone();
        self.0.loop_handle.queue_in_loop(move |loop_| this.finish_connecting(fd, loop_));
    }

    /// Runs once the connecting channel has gone write-ready or errored.
    /// Removes the channel, then decides whether the connect actually
    /// succeeded by checking `SO_ERROR` and, as a last check, that the
    /// kernel didn't loop the connect straight back to one of our own
    /// listening sockets (self-connect, a known hazard on loopback).
    fn finish_connecting(&self, fd: RawFd, loop_: &mut EventLoop) {
        let _ = loop_.remove_channel(fd);

        let socket = match self.0.mutable.lock().unwrap().socket.take() {
            Some(s) => s,
            None => return,
        };

        match socket.take_error() {
            Ok(Some(e)) => {
                warn!("connector: connect to {} failed: {}", self.0.server_addr, e);
                drop(socket);
                self.retry(loop_);
                return;
            }
            Err(e) => {
                warn!("connector: failed to query SO_ERROR for {}: {}", self.0.server_addr, e);
                drop(socket);
                self.retry(loop_);
                return;
            }
            Ok(None) => {}
        }

        match (socket.local_addr(), socket.peer_addr()) {
            (Ok(local), Ok(peer)) if local == peer => {
                warn!("connector: self-connect detected on {}, retrying", self.0.server_addr);
                drop(socket);
                self.retry(loop_);
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("connector: failed to read socket addresses for {}: {}", self.0.server_addr, e);
                drop(socket);
                self.retry(loop_);
                return;
            }
            _ => {}
        }

        self.0.mutable.lock().unwrap().state = State::Connected;
        info!("connector: connected to {}", self.0.server_addr);

        if let Some(cb) = self.0.new_connection_cb.lock().unwrap().clone() {
            cb(socket);
        }
    }

    fn retry(&self, loop_: &mut EventLoop) {
        self.0.mutable.lock().unwrap().state = State::Disconnected;

        if !self.0.connect.load(Ordering::SeqCst) {
            info!("connector: stopped, not retrying {}", self.0.server_addr);
            return;
        }

        let delay = self.0.mutable.lock().unwrap().retry_delay;
        info!("connector: retrying {} in {:?}", self.0.server_addr, delay);

        let this = self.clone();
        match loop_.run_after(delay, move || this.start()) {
            Ok(id) => {
                let mut m = self.0.mutable.lock().unwrap();
                m.retry_timer = Some(id);
                m.retry_delay = (m.retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(e) => error!("connector: failed to schedule retry for {}: {}", self.0.server_addr, e),
        }
    }

    fn stop_in_loop(&self, loop_: &mut EventLoop) {
        let (timer, fd, state) = {
            let mut m = self.0.mutable.lock().unwrap();
            (m.retry_timer.take(), m.socket.as_ref().map(|s| s.as_raw_fd()), m.state)
        };

        if let Some(id) = timer {
            let _ = loop_.cancel(id);
        }

        if state == State::Connecting {
            if let Some(fd) = fd {
                if let Some(channel) = loop_.channel_mut(fd) {
                    channel.disable_all();
                }
                let _ = loop_.update_channel(fd);
                let _ = loop_.remove_channel(fd);
            }
            let mut m = self.0.mutable.lock().unwrap();
            m.socket = None;
            m.state = State::Disconnected;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn connects_to_a_listening_socket() {
        let mut loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();

        let listener = Socket::new(&"127.0.0.1:0".parse().unwrap(), libc::SOCK_STREAM).unwrap();
        listener.set_reuseaddr(true).unwrap();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let addr = Address::new(listener.local_addr().unwrap());

        let (tx, rx) = mpsc::channel();
        let connector = Connector::new(handle.clone(), addr);
        connector.set_new_connection_callback(move |socket| {
            let _ = tx.send(socket);
        });
        connector.start();

        let quit_handle = handle.clone();
        handle.queue_in_loop(move |loop_| {
            let _ = loop_.run_after(Duration::from_millis(200), move || quit_handle.quit());
        });

        loop_.run();

        let socket = rx.try_recv().expect("expected a connected socket");
        assert!(socket.peer_addr().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = INIT_RETRY_DELAY;
        for _ in 0..10 {
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
        assert_eq!(delay, MAX_RETRY_DELAY);
    }
}
