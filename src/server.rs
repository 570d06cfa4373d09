//! Server side of the SOCKS5 handshake.
//!
//! Mirrors the client with roles reversed: the machine reacts to the
//! greeting and the request, and the caller finishes the exchange with
//! [`ServerHandshake::complete`] once it has attempted the upstream
//! connect or bind.

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::{
    error::Error,
    proto::{Address, AuthMethod, Command, Greeting, MethodSelection, Reply, Request, Response},
};

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingRequest,
    AwaitingCompletion,
    Established,
    Failed,
}

/// Method-selection and command policy for a [`ServerHandshake`]
///
/// `methods` lists the authentication methods the server is willing to
/// select, in preference order; the first one present in the client's
/// offer wins. Only [`AuthMethod::None`] can carry a handshake to
/// completion — this engine implements no credential sub-negotiation —
/// so selecting anything else fails the handshake right after the
/// selection is sent.
#[derive(Clone, Debug)]
pub struct ServerPolicy {
    pub methods: Vec<AuthMethod>,
    pub commands: Vec<Command>,
}

impl Default for ServerPolicy {
    fn default() -> ServerPolicy {
        ServerPolicy {
            methods: vec![AuthMethod::None],
            commands: vec![Command::Connect],
        }
    }
}

impl ServerPolicy {
    fn select(&self, offered: &[AuthMethod]) -> AuthMethod {
        for preferred in &self.methods {
            if offered.contains(preferred) {
                return *preferred;
            }
        }
        AuthMethod::NotAcceptable
    }
}

/// Outcome of feeding bytes to a [`ServerHandshake`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStep {
    /// The buffered input does not yet hold a complete message.
    NeedMoreData,
    /// Write these bytes to the client, then feed again (an empty feed
    /// drains an already-buffered pipelined request).
    Send(Vec<u8>),
    /// Flush these bytes to the client, then close the connection;
    /// `reason` is why the handshake cannot proceed.
    Close {
        send: Vec<u8>,
        reason: Error,
    },
    /// The client asked to proxy `command` to `address:port`. Establish
    /// the upstream connection (or bind) and report the outcome through
    /// [`ServerHandshake::complete`].
    ConnectionRequested {
        command: Command,
        address: Address,
        port: u16,
    },
    /// The handshake is complete: write `send` (the success response),
    /// then relay. `residual` holds client payload that arrived beyond
    /// the request, to be forwarded upstream as opaque data.
    Established {
        send: Vec<u8>,
        residual: Bytes,
    },
}

/// SOCKS5 server handshake state machine
pub struct ServerHandshake {
    state: State,
    buf: BytesMut,
    policy: ServerPolicy,
}

impl ServerHandshake {
    pub fn new(policy: ServerPolicy) -> ServerHandshake {
        ServerHandshake {
            state: State::Idle,
            buf: BytesMut::new(),
            policy,
        }
    }

    /// Feed newly-arrived bytes and advance the handshake.
    ///
    /// Decodes at most one message per call: a [`Greeting`] while idle,
    /// a [`Request`] while awaiting one. Errors are fatal and move the
    /// machine to its failed state.
    pub fn feed(&mut self, data: &[u8]) -> Result<ServerStep, Error> {
        self.buf.extend_from_slice(data);

        match self.state {
            State::Idle => match Greeting::decode(&self.buf) {
                Ok(None) => Ok(ServerStep::NeedMoreData),
                Ok(Some((greeting, n))) => {
                    self.buf.advance(n);
                    Ok(self.handle_greeting(greeting))
                }
                Err(err) => Err(self.fail(err)),
            },
            State::AwaitingRequest => match Request::decode(&self.buf) {
                Ok(None) => Ok(ServerStep::NeedMoreData),
                Ok(Some((request, n))) => {
                    self.buf.advance(n);
                    Ok(self.handle_request(request))
                }
                // An undefined command byte still gets a proper reply
                // before the connection is torn down.
                Err(err @ Error::CommandNotSupported(..)) => Ok(self.reject(err)),
                Err(err) => Err(self.fail(err)),
            },
            State::AwaitingCompletion | State::Established | State::Failed => {
                Ok(ServerStep::NeedMoreData)
            }
        }
    }

    fn handle_greeting(&mut self, greeting: Greeting) -> ServerStep {
        trace!("got greeting offering {} methods", greeting.methods.len());

        let method = self.policy.select(&greeting.methods);
        let selection = MethodSelection::new(method);
        let mut send = Vec::with_capacity(selection.serialized_len());
        selection.write_to_buf(&mut send);

        match method {
            AuthMethod::None => {
                debug!("selected method: {}", method);
                self.state = State::AwaitingRequest;
                ServerStep::Send(send)
            }
            AuthMethod::NotAcceptable => {
                debug!("no acceptable method among {:?}", greeting.methods);
                self.state = State::Failed;
                ServerStep::Close {
                    send,
                    reason: Error::NoAcceptableAuthMethod,
                }
            }
            other => {
                // Policy picked a method we cannot sub-negotiate.
                warn!("policy selected {} but no sub-negotiation is implemented", other);
                self.state = State::Failed;
                ServerStep::Close {
                    send,
                    reason: Error::UnsupportedAuthMethod(other),
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> ServerStep {
        trace!("got request: {:?}", request);

        if !self.policy.commands.contains(&request.command) {
            return self.reject(Error::CommandNotSupported(request.command.as_u8()));
        }

        self.state = State::AwaitingCompletion;
        ServerStep::ConnectionRequested {
            command: request.command,
            address: request.address,
            port: request.port,
        }
    }

    /// Build the failure [`Response`] for `err`, flush it, close.
    fn reject(&mut self, err: Error) -> ServerStep {
        debug!("rejecting request: {}", err);

        let response = Response::new(err.as_reply(), Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        let mut send = Vec::with_capacity(response.serialized_len());
        response.write_to_buf(&mut send);

        self.state = State::Failed;
        ServerStep::Close { send, reason: err }
    }

    /// Report the outcome of the upstream connect/bind requested by a
    /// [`ServerStep::ConnectionRequested`].
    ///
    /// A `Succeeded` reply establishes the handshake; any other reply
    /// produces the response bytes to flush before closing. Calling this
    /// without a pending request is caller misuse and is rejected
    /// without state change.
    pub fn complete(&mut self, reply: Reply, bound_address: Address, bound_port: u16) -> Result<ServerStep, Error> {
        if self.state != State::AwaitingCompletion {
            return Err(Error::ProxyNotEstablished);
        }

        let response = Response::new(reply, bound_address, bound_port);
        let mut send = Vec::with_capacity(response.serialized_len());
        response.write_to_buf(&mut send);

        if reply == Reply::Succeeded {
            self.state = State::Established;
            let residual = self.buf.split().freeze();
            debug!("handshake established, {} residual bytes", residual.len());
            Ok(ServerStep::Established { send, residual })
        } else {
            debug!("completing with failure reply: {}", reply);
            self.state = State::Failed;
            Ok(ServerStep::Close {
                send,
                reason: Error::ServerRejected(reply),
            })
        }
    }

    /// Gate application data on the handshake, as on the client side.
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
        debug!("server handshake failed: {}", err);
        self.state = State::Failed;
        err
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const REQUEST: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0x5d, 0xb8, 0xd8, 0x22, 0x00, 0x50];

    fn established(hs: &mut ServerHandshake) -> ServerStep {
        hs.complete(Reply::Succeeded, Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
            .unwrap()
    }

    #[test]
    fn happy_path() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());

        let step = hs.feed(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(step, ServerStep::Send(vec![0x05, 0x00]));

        let step = hs.feed(&REQUEST).unwrap();
        assert_eq!(
            step,
            ServerStep::ConnectionRequested {
                command: Command::Connect,
                address: Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)),
                port: 80,
            }
        );

        let step = established(&mut hs);
        assert_eq!(
            step,
            ServerStep::Established {
                send: vec![0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                residual: Bytes::new(),
            }
        );
        assert!(hs.is_established());
        assert_eq!(hs.write(b"relay").unwrap(), b"relay");
    }

    #[test]
    fn fragmented_greeting() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        assert_eq!(hs.feed(&[0x05]).unwrap(), ServerStep::NeedMoreData);
        assert_eq!(hs.feed(&[0x02]).unwrap(), ServerStep::NeedMoreData);
        assert_eq!(hs.feed(&[0x00]).unwrap(), ServerStep::NeedMoreData);
        assert_eq!(hs.feed(&[0x02]).unwrap(), ServerStep::Send(vec![0x05, 0x00]));
    }

    #[test]
    fn pipelined_greeting_and_request() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());

        let mut chunk = vec![0x05, 0x01, 0x00];
        chunk.extend_from_slice(&REQUEST);
        assert_eq!(hs.feed(&chunk).unwrap(), ServerStep::Send(vec![0x05, 0x00]));

        // the buffered request is drained by an empty feed
        let step = hs.feed(&[]).unwrap();
        assert!(matches!(step, ServerStep::ConnectionRequested { .. }));
    }

    #[test]
    fn no_acceptable_method() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());

        // client offers only username/password
        let step = hs.feed(&[0x05, 0x01, 0x02]).unwrap();
        assert_eq!(
            step,
            ServerStep::Close {
                send: vec![0x05, 0xff],
                reason: Error::NoAcceptableAuthMethod,
            }
        );
        assert!(!hs.is_established());
        assert_eq!(hs.write(b"x"), Err(Error::ProxyNotEstablished));
    }

    #[test]
    fn unsupported_command_gets_reply() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();

        // BIND is a valid command byte, but not in the default policy
        let bind = [0x05, 0x02, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        let step = hs.feed(&bind).unwrap();
        assert_eq!(
            step,
            ServerStep::Close {
                send: vec![0x05, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                reason: Error::CommandNotSupported(0x02),
            }
        );
    }

    #[test]
    fn undefined_command_byte_gets_reply() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();

        let step = hs.feed(&[0x05, 0x7f]).unwrap();
        let ServerStep::Close { send, reason } = step else {
            panic!("expected close");
        };
        assert_eq!(send[..2], [0x05, 0x07]);
        assert_eq!(reason, Error::CommandNotSupported(0x7f));
    }

    #[test]
    fn policy_can_allow_more_commands() {
        let policy = ServerPolicy {
            commands: vec![Command::Connect, Command::Bind],
            ..ServerPolicy::default()
        };
        let mut hs = ServerHandshake::new(policy);
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();

        let bind = [0x05, 0x02, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        let step = hs.feed(&bind).unwrap();
        assert!(matches!(
            step,
            ServerStep::ConnectionRequested {
                command: Command::Bind,
                ..
            }
        ));
    }

    #[test]
    fn completion_failure_flushes_reply() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();
        hs.feed(&REQUEST).unwrap();

        let step = hs
            .complete(Reply::HostUnreachable, Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
            .unwrap();
        assert_eq!(
            step,
            ServerStep::Close {
                send: vec![0x05, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                reason: Error::ServerRejected(Reply::HostUnreachable),
            }
        );
        assert!(!hs.is_established());
    }

    #[test]
    fn residual_bytes_survive_establishment() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();

        let mut chunk = REQUEST.to_vec();
        chunk.extend_from_slice(b"optimistic payload");
        hs.feed(&chunk).unwrap();

        let ServerStep::Established { residual, .. } = established(&mut hs) else {
            panic!("expected establishment");
        };
        assert_eq!(residual, Bytes::from_static(b"optimistic payload"));
    }

    #[test]
    fn bad_version_is_fatal() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        assert_eq!(hs.feed(&[0x04, 0x01, 0x00]), Err(Error::InvalidProtocolVersion(0x04)));
    }

    #[test]
    fn domain_request_roundtrip() {
        let mut hs = ServerHandshake::new(ServerPolicy::default());
        hs.feed(&[0x05, 0x01, 0x00]).unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&[0x00, 0x50]);
        let step = hs.feed(&req).unwrap();
        assert_eq!(
            step,
            ServerStep::ConnectionRequested {
                command: Command::Connect,
                address: Address::DomainName("example.com".to_owned()),
                port: 80,
            }
        );
    }
}
