//! Everything TCP: addresses, the listening side ([`acceptor`]), the
//! connecting side ([`connector`]), the shared connection type, and the
//! two façades built on top of them ([`server::TcpServer`],
//! [`client::TcpClient`]).

pub mod acceptor;
pub mod address;
pub mod client;
pub mod connection;
pub mod connector;
pub mod server;
