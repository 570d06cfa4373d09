//! SOCKS5 (RFC 1928) handshake protocol engine.
//!
//! The core of this crate is sans-io: [`ClientHandshake`] and
//! [`ServerHandshake`] are pure state machines fed byte chunks by the
//! surrounding transport, tolerant of arbitrary fragmentation, with all
//! waiting expressed as return values. The [`proto`] module holds the
//! message model and a resumable wire codec; [`tcp`] layers thin tokio
//! adapters on top for callers that just want a proxied stream.
//!
//! ```no_run
//! use socks5_engine::{Address, Socks5Stream};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> std::io::Result<()> {
//! let mut stream = Socks5Stream::connect(
//!     Address::DomainName("example.com".to_owned()),
//!     80,
//!     "127.0.0.1:1080",
//! )
//! .await?;
//! stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

pub use self::{
    client::{ClientHandshake, ClientStep},
    error::Error,
    proto::{Address, AuthMethod, Command, Greeting, MethodSelection, Reply, Request, Response},
    server::{ServerHandshake, ServerPolicy, ServerStep},
    tcp::{Socks5Acceptor, Socks5Incoming, Socks5Stream},
};

pub mod client;
pub mod error;
pub mod proto;
pub mod server;
pub mod tcp;
