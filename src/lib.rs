//! A non-blocking, multi-reactor TCP networking core in the
//! one-loop-per-thread style: every [`EventLoop`] is pinned to the OS
//! thread that created it, drives an epoll-backed [`poller::Poller`], and
//! dispatches readiness to [`Channel`]s. [`net::server::TcpServer`] and
//! [`net::client::TcpClient`] are the façades most applications actually
//! reach for; everything else in this crate is what they're built from.
//!
//! # Example
//!
//! ```no_run
//! use loopio::{Address, EventLoop, TcpServer};
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! let handle = event_loop.handle();
//!
//! let server = TcpServer::new(handle, Address::any_v4(9000), "echo", false).unwrap();
//! server.set_message_callback(|conn, buf| {
//!     let data = buf.retrieve_all_as_vec();
//!     conn.send(data);
//! });
//! server.start().unwrap();
//!
//! event_loop.run();
//! ```

mod buffer;
mod channel;
pub mod epoll;
mod event_loop;
mod loop_pool;
pub mod net;
mod poller;
mod queue;
mod sys;
mod task_queue;
mod timer;
mod timer_queue;
mod waker;

pub use buffer::Buffer;
pub use channel::{Channel, ChannelState};
pub use epoll::{Event, Events, Ready};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use loop_pool::LoopPool;
pub use net::acceptor::Acceptor;
pub use net::address::Address;
pub use net::client::TcpClient;
pub use net::connection::{Connection, ConnectionCallbacks};
pub use net::connector::Connector;
pub use net::server::TcpServer;
pub use sys::socket::Socket;
pub use timer::TimerId;
