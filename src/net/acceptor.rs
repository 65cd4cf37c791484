//! Owns the listening socket on a `TcpServer`'s base loop and turns
//! incoming connections into `(Socket, Address)` pairs for the caller to
//! hand off to a worker loop.
//!
//! Grounded on muduo's `Acceptor.cc`, including its one well-known trick:
//! keep one spare fd open to `/dev/null` so that when the process is out
//! of file descriptors (`EMFILE`), `accept4` still returns a connection we
//! can immediately drop — without that spare fd, a listening socket stuck
//! at the front of the ready queue behind a connection we can't accept
//! would spin `epoll_wait` at 100% CPU forever.
//!
//! `on_new_connection` runs on the base loop's own thread but never needs
//! `&mut EventLoop` itself: handing a fresh connection to whichever worker
//! loop owns it is the caller's job, done through that worker's `Send`
//! handle (see `net::server::TcpServer`), not through this loop directly.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use log::{error, warn};

use crate::event_loop::EventLoop;
use crate::net::address::Address;
use crate::sys::socket::Socket;

pub struct Acceptor {
    socket: Socket,
    idle_fd: Option<File>,
    listening: bool,
}

impl Acceptor {
    pub fn new(addr: Address, reuse_port: bool) -> io::Result<Acceptor> {
        let socket = Socket::new(&addr.as_socket_addr(), libc::SOCK_STREAM)?;
        socket.set_nonblocking(true)?;
        socket.set_reuseaddr(true)?;
        if reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(&addr.as_socket_addr())?;

        Ok(Acceptor {
            socket,
            idle_fd: Some(File::open("/dev/null")?),
            listening: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        self.socket.local_addr().map(Address::new)
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Registers the listening socket's channel on `loop_` and starts
    /// listening. `on_new_connection` fires once per accepted connection,
    /// with the accepted socket already set non-blocking.
    pub fn listen(
        &mut self,
        loop_: &mut EventLoop,
        mut on_new_connection: impl FnMut(Socket, Address) + 'static,
    ) -> io::Result<()> {
        self.listening = true;
        self.socket.listen(libc::SOMAXCONN)?;

        let fd = self.socket.as_raw_fd();
        let accept_socket = self.socket.duplicate()?;
        let mut idle_fd = self.idle_fd.take();

        let channel = loop_.new_channel(fd);
        channel.set_read_callback(move |_channel, _now| loop {
            match accept_socket.accept() {
                Ok((conn_socket, peer)) => on_new_connection(conn_socket, Address::new(peer)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("acceptor out of file descriptors, dropping one pending connection");
                    idle_fd = None;
                    if let Ok((extra, _)) = accept_socket.accept() {
                        drop(extra);
                    }
                    idle_fd = File::open("/dev/null").ok();
                    break;
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        });

        channel.enable_reading();
        loop_.update_channel(fd)
    }
}
