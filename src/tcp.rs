//! Tokio adapters driving the handshake engines over real streams.
//!
//! These are deliberately thin: every protocol decision lives in
//! [`ClientHandshake`] and [`ServerHandshake`]; this module only moves
//! bytes between a stream and a machine, then steps out of the way once
//! the handshake is established.

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use bytes::Bytes;
use log::trace;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{
    client::{ClientHandshake, ClientStep},
    proto::{Address, AuthMethod, Command, Reply},
    server::{ServerHandshake, ServerPolicy, ServerStep},
};

const READ_CHUNK_SIZE: usize = 4096;

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed during socks5 handshake")
}

/// A stream whose SOCKS5 handshake has completed.
///
/// Reads first drain any residual bytes that arrived appended to the
/// final handshake message, then pass through to the inner stream;
/// writes pass straight through.
#[derive(Debug)]
pub struct Socks5Stream<S> {
    stream: S,
    residual: Bytes,
}

impl Socks5Stream<TcpStream> {
    /// Connects to `address:port` through the SOCKS5 proxy at `proxy`.
    pub async fn connect<A, P>(address: A, port: u16, proxy: P) -> io::Result<Socks5Stream<TcpStream>>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        let stream = TcpStream::connect(proxy).await?;
        Socks5Stream::connect_with_stream(address, port, stream).await
    }
}

impl<S> Socks5Stream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the client handshake over an already-connected stream,
    /// offering only the no-authentication method.
    pub async fn connect_with_stream<A>(address: A, port: u16, mut stream: S) -> io::Result<Socks5Stream<S>>
    where
        A: Into<Address>,
    {
        let mut hs = ClientHandshake::new(
            vec![AuthMethod::None],
            Command::Connect,
            address.into(),
            port,
        );

        let greeting = hs.start()?;
        trace!("client connected, sending greeting");
        stream.write_all(&greeting).await?;

        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut step = hs.feed(&[])?;
        loop {
            match step {
                ClientStep::NeedMoreData => {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        return Err(unexpected_eof());
                    }
                    step = hs.feed(&buf[..n])?;
                }
                ClientStep::Send(bytes) => {
                    stream.write_all(&bytes).await?;
                    step = hs.feed(&[])?;
                }
                ClientStep::Established { residual } => {
                    trace!("client handshake established");
                    return Ok(Socks5Stream { stream, residual });
                }
            }
        }
    }

    /// Consume self and return the underlying stream.
    ///
    /// Any residual bytes not yet read are lost; check
    /// [`Socks5Stream::residual`] first if that matters.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Residual handshake bytes not yet drained by reads.
    pub fn residual(&self) -> &Bytes {
        &self.residual
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Socks5Stream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        if !self.residual.is_empty() {
            let n = self.residual.len().min(buf.remaining());
            buf.put_slice(&self.residual.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Socks5Stream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Accepts SOCKS5 connections on the server side.
#[derive(Clone, Debug, Default)]
pub struct Socks5Acceptor {
    policy: ServerPolicy,
}

impl Socks5Acceptor {
    pub fn new(policy: ServerPolicy) -> Socks5Acceptor {
        Socks5Acceptor { policy }
    }

    /// Drives the server handshake on an accepted connection until the
    /// client's request is known, returning it for the caller to act on.
    pub async fn accept<S>(&self, mut stream: S) -> io::Result<Socks5Incoming<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut hs = ServerHandshake::new(self.policy.clone());

        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut step = hs.feed(&[])?;
        loop {
            match step {
                ServerStep::NeedMoreData => {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        return Err(unexpected_eof());
                    }
                    step = hs.feed(&buf[..n])?;
                }
                ServerStep::Send(bytes) => {
                    stream.write_all(&bytes).await?;
                    step = hs.feed(&[])?;
                }
                ServerStep::Close { send, reason } => {
                    stream.write_all(&send).await?;
                    let _ = stream.shutdown().await;
                    return Err(reason.into());
                }
                ServerStep::ConnectionRequested { command, address, port } => {
                    trace!("incoming request: {:?} {}:{}", command, address, port);
                    return Ok(Socks5Incoming {
                        stream,
                        hs,
                        command,
                        address,
                        port,
                    });
                }
                // complete() has not been called yet
                ServerStep::Established { .. } => unreachable!("established before completion"),
            }
        }
    }
}

/// A connection whose greeting and request have been accepted, awaiting
/// the upstream outcome.
pub struct Socks5Incoming<S> {
    stream: S,
    hs: ServerHandshake,
    command: Command,
    address: Address,
    port: u16,
}

impl<S> Socks5Incoming<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends the success response with the locally bound endpoint and
    /// returns the established stream.
    pub async fn grant(mut self, bound_address: Address, bound_port: u16) -> io::Result<Socks5Stream<S>> {
        match self.hs.complete(Reply::Succeeded, bound_address, bound_port)? {
            ServerStep::Established { send, residual } => {
                self.stream.write_all(&send).await?;
                Ok(Socks5Stream {
                    stream: self.stream,
                    residual,
                })
            }
            step => unreachable!("succeeded completion yielded {step:?}"),
        }
    }

    /// Sends a failure response and closes the handshake.
    pub async fn reject(mut self, reply: Reply) -> io::Result<()> {
        debug_assert_ne!(reply, Reply::Succeeded);
        match self
            .hs
            .complete(reply, Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED), 0)?
        {
            ServerStep::Close { send, .. } => {
                self.stream.write_all(&send).await?;
                let _ = self.stream.shutdown().await;
                Ok(())
            }
            step => unreachable!("failure completion yielded {step:?}"),
        }
    }
}
