//! Protocol error taxonomy.
//!
//! Every failure here is fatal to the handshake: a corrupted byte stream
//! cannot be resynchronized, so the state machine that surfaces one of
//! these moves to its failed state and the connection should be closed.
//! Insufficient input is *not* an error; the decoders and state machines
//! report it as a normal "need more data" outcome instead.

use std::io::{self, ErrorKind};

use crate::proto::{AuthMethod, Reply};

/// SOCKS5 protocol error
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unsupported socks version {0:#04x}")]
    InvalidProtocolVersion(u8),
    #[error("address type {0:#04x} not supported")]
    UnsupportedAddressType(u8),
    #[error("proxy reported no acceptable authentication method")]
    NoAcceptableAuthMethod,
    #[error("proxy selected authentication method {0} that was not offered")]
    UnexpectedMethodSelected(AuthMethod),
    #[error("authentication method {0} is not supported")]
    UnsupportedAuthMethod(AuthMethod),
    #[error("proxy rejected request: {0}")]
    ServerRejected(Reply),
    #[error("command {0:#04x} not supported")]
    CommandNotSupported(u8),
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("proxy connection is not established")]
    ProxyNotEstablished,
    #[error("number of offered methods must be in 1..=255, got {0}")]
    InvalidMethodCount(usize),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(ErrorKind::Other, err)
    }
}

impl Error {
    /// Convert to `Reply` for responding
    pub fn as_reply(&self) -> Reply {
        match *self {
            Error::UnsupportedAddressType(..) => Reply::AddressTypeNotSupported,
            Error::CommandNotSupported(..) => Reply::CommandNotSupported,
            Error::ServerRejected(r) => r,
            _ => Reply::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_projection() {
        assert_eq!(Error::UnsupportedAddressType(0x02).as_reply(), Reply::AddressTypeNotSupported);
        assert_eq!(Error::CommandNotSupported(0x7f).as_reply(), Reply::CommandNotSupported);
        assert_eq!(
            Error::ServerRejected(Reply::HostUnreachable).as_reply(),
            Reply::HostUnreachable
        );
        assert_eq!(Error::InvalidProtocolVersion(0x04).as_reply(), Reply::GeneralFailure);
    }

    #[test]
    fn io_error_conversion_keeps_message() {
        let err: io::Error = Error::NoAcceptableAuthMethod.into();
        assert!(err.to_string().contains("no acceptable authentication method"));
    }
}
