//! Client side of the SOCKS5 handshake.
//!
//! [`ClientHandshake`] is a pure state machine: it never performs I/O.
//! The surrounding transport writes whatever bytes the machine hands it
//! and feeds inbound chunks back in. Waiting for more bytes is expressed
//! as a return value, never as blocking.

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};

use crate::{
    error::Error,
    proto::{Address, AuthMethod, Command, Greeting, MethodSelection, Request, Response, Reply},
};

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
enum State {
    Idle,
    GreetingSent,
    MethodSelected,
    RequestSent,
    Established,
    Failed,
}

/// Outcome of feeding bytes to a [`ClientHandshake`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientStep {
    /// The buffered input does not yet hold a complete message. Feed
    /// again once the transport delivers the next chunk; already-fed
    /// bytes are retained.
    NeedMoreData,
    /// Write these bytes to the proxy, then feed again (an empty feed is
    /// enough to drain any already-buffered reply).
    Send(Vec<u8>),
    /// The handshake is complete. `residual` holds any bytes that
    /// arrived beyond the final handshake message; they are relay
    /// payload and must be forwarded as opaque data, never reparsed.
    Established {
        residual: Bytes,
    },
}

/// SOCKS5 client handshake state machine
///
/// Drives greeting → method selection → request → response. The target
/// of the proxied connection is fixed at construction; once the server
/// accepts an authentication method the machine encodes the request
/// itself and emits it as a [`ClientStep::Send`].
pub struct ClientHandshake {
    state: State,
    buf: BytesMut,
    offered: Vec<AuthMethod>,
    command: Command,
    address: Address,
    port: u16,
}

impl ClientHandshake {
    /// Creates a handshake for proxying `command` to `address:port`,
    /// offering `methods` for authentication.
    pub fn new(methods: Vec<AuthMethod>, command: Command, address: Address, port: u16) -> ClientHandshake {
        ClientHandshake {
            state: State::Idle,
            buf: BytesMut::new(),
            offered: methods,
            command,
            address,
            port,
        }
    }

    /// Begin the handshake, returning the greeting bytes to send.
    ///
    /// Rejects an offered-method count outside `1..=255` before any
    /// state mutation; the machine stays idle and may be started again.
    pub fn start(&mut self) -> Result<Vec<u8>, Error> {
        debug_assert_eq!(self.state, State::Idle, "handshake already started");

        if self.offered.is_empty() || self.offered.len() > u8::MAX as usize {
            return Err(Error::InvalidMethodCount(self.offered.len()));
        }

        let greeting = Greeting::new(self.offered.clone());
        let mut buf = Vec::with_capacity(greeting.serialized_len());
        greeting.write_to_buf(&mut buf);

        trace!("sending greeting, offering {} methods", self.offered.len());
        self.state = State::GreetingSent;
        Ok(buf)
    }

    /// Feed newly-arrived bytes and advance the handshake.
    ///
    /// At most one protocol message is decoded per call, chosen by the
    /// current state; in states that expect no message the bytes are
    /// buffered and [`ClientStep::NeedMoreData`] is returned. Errors are
    /// fatal: the machine moves to its failed state and the connection
    /// should be closed.
    pub fn feed(&mut self, data: &[u8]) -> Result<ClientStep, Error> {
        self.buf.extend_from_slice(data);

        match self.state {
            State::GreetingSent => match MethodSelection::decode(&self.buf) {
                Ok(None) => Ok(ClientStep::NeedMoreData),
                Ok(Some((selection, n))) => {
                    self.buf.advance(n);
                    self.handle_selection(selection)
                }
                Err(err) => Err(self.fail(err)),
            },
            State::RequestSent => match Response::decode(&self.buf) {
                Ok(None) => Ok(ClientStep::NeedMoreData),
                Ok(Some((response, n))) => {
                    self.buf.advance(n);
                    self.handle_response(response)
                }
                Err(err) => Err(self.fail(err)),
            },
            // No message is expected here; keep the bytes for later.
            State::Idle | State::MethodSelected | State::Established | State::Failed => {
                Ok(ClientStep::NeedMoreData)
            }
        }
    }

    fn handle_selection(&mut self, selection: MethodSelection) -> Result<ClientStep, Error> {
        trace!("got method selection: {}", selection.method);

        if selection.method == AuthMethod::NotAcceptable {
            return Err(self.fail(Error::NoAcceptableAuthMethod));
        }
        if !self.offered.contains(&selection.method) {
            return Err(self.fail(Error::UnexpectedMethodSelected(selection.method)));
        }
        if selection.method != AuthMethod::None {
            // Offered but requires a credential sub-negotiation this
            // engine does not implement.
            return Err(self.fail(Error::UnsupportedAuthMethod(selection.method)));
        }

        self.state = State::MethodSelected;

        let request = Request::new(self.command, self.address.clone(), self.port);
        let mut buf = Vec::with_capacity(request.serialized_len());
        request.write_to_buf(&mut buf);

        debug!("sending request {:?} {}:{}", self.command, self.address, self.port);
        self.state = State::RequestSent;
        Ok(ClientStep::Send(buf))
    }

    fn handle_response(&mut self, response: Response) -> Result<ClientStep, Error> {
        trace!("got response: {:?}", response);

        if response.reply != Reply::Succeeded {
            return Err(self.fail(Error::ServerRejected(response.reply)));
        }

        self.state = State::Established;
        let residual = self.buf.split().freeze();

        debug!(
            "handshake established, bound to {}:{}, {} residual bytes",
            response.address,
            response.port,
            residual.len()
        );
        Ok(ClientStep::Established { residual })
    }

    /// Gate application data on the handshake.
    ///
    /// Before establishment every call fails with
    /// [`Error::ProxyNotEstablished`] without affecting the handshake;
    /// afterwards the same bytes are returned for the transport to relay
    /// unmodified.
    pub fn write<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], Error> {
        if self.state == State::Established {
            Ok(data)
        } else {
            Err(Error::ProxyNotEstablished)
        }
    }

    /// True only once the handshake has completed successfully.
    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!("client handshake failed: {}", err);
        self.state = State::Failed;
        err
    }
}
