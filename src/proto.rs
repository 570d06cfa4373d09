//! Socks5 wire protocol definition (RFC1928)
//!
//! Message model and codec for the four handshake messages. Encoding is
//! infallible for values built through the public constructors. Decoding
//! follows a resumable, peek-then-commit contract so that a message split
//! across any number of partial deliveries parses identically to one
//! delivered whole:
//!
//! - `Ok(Some((msg, n)))` — a complete message was parsed from the first
//!   `n` bytes of the input slice,
//! - `Ok(None)` — the input is a valid prefix but not yet a complete
//!   message; call again once more bytes have arrived,
//! - `Err(..)` — the input can never become a valid message, no matter
//!   what bytes follow.
//!
//! Decoders take `&[u8]` and never consume anything; callers advance
//! their buffer by `n` only after a successful parse.

use std::{
    fmt::{self, Debug, Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str,
};

use bytes::BufMut;

use crate::error::Error;

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_VERSION:                          u8 = 0x05;

    pub const SOCKS5_AUTH_METHOD_NONE:                 u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_GSSAPI:               u8 = 0x01;
    pub const SOCKS5_AUTH_METHOD_PASSWORD:             u8 = 0x02;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE:       u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT:                  u8 = 0x01;
    pub const SOCKS5_CMD_TCP_BIND:                     u8 = 0x02;
    pub const SOCKS5_CMD_UDP_ASSOCIATE:                u8 = 0x03;

    pub const SOCKS5_ADDR_TYPE_IPV4:                   u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:            u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:                   u8 = 0x04;

    pub const SOCKS5_REPLY_SUCCEEDED:                  u8 = 0x00;
    pub const SOCKS5_REPLY_GENERAL_FAILURE:            u8 = 0x01;
    pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED:     u8 = 0x02;
    pub const SOCKS5_REPLY_NETWORK_UNREACHABLE:        u8 = 0x03;
    pub const SOCKS5_REPLY_HOST_UNREACHABLE:           u8 = 0x04;
    pub const SOCKS5_REPLY_CONNECTION_REFUSED:         u8 = 0x05;
    pub const SOCKS5_REPLY_TTL_EXPIRED:                u8 = 0x06;
    pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED:      u8 = 0x07;
    pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 authentication method
///
/// Codes outside the assigned range are preserved as `Other`; the
/// protocol allows forward-compatible extension codes here, unlike the
/// version byte or the address type tag.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// GSSAPI authentication
    Gssapi,
    /// Username/password authentication (RFC 1929)
    Password,
    /// Sentinel reply: none of the offered methods is acceptable
    NotAcceptable,
    /// Unrecognized method code
    Other(u8),
}

impl AuthMethod {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            AuthMethod::None          => consts::SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Gssapi        => consts::SOCKS5_AUTH_METHOD_GSSAPI,
            AuthMethod::Password      => consts::SOCKS5_AUTH_METHOD_PASSWORD,
            AuthMethod::NotAcceptable => consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
            AuthMethod::Other(c)      => c,
        }
    }

    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> AuthMethod {
        match code {
            consts::SOCKS5_AUTH_METHOD_NONE           => AuthMethod::None,
            consts::SOCKS5_AUTH_METHOD_GSSAPI         => AuthMethod::Gssapi,
            consts::SOCKS5_AUTH_METHOD_PASSWORD       => AuthMethod::Password,
            consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => AuthMethod::NotAcceptable,
            _                                         => AuthMethod::Other(code),
        }
    }
}

impl Display for AuthMethod {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            AuthMethod::None          => f.write_str("no authentication"),
            AuthMethod::Gssapi        => f.write_str("GSSAPI"),
            AuthMethod::Password      => f.write_str("username/password"),
            AuthMethod::NotAcceptable => f.write_str("no acceptable methods"),
            AuthMethod::Other(c)      => write!(f, "other ({c:#04x})"),
        }
    }
}

/// SOCKS5 command
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// CONNECT command (TCP tunnel)
    Connect,
    /// BIND command
    Bind,
    /// UDP ASSOCIATE command
    UdpAssociate,
}

impl Command {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Connect      => consts::SOCKS5_CMD_TCP_CONNECT,
            Command::Bind         => consts::SOCKS5_CMD_TCP_BIND,
            Command::UdpAssociate => consts::SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Option<Command> {
        match code {
            consts::SOCKS5_CMD_TCP_CONNECT   => Some(Command::Connect),
            consts::SOCKS5_CMD_TCP_BIND      => Some(Command::Bind),
            consts::SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _                                => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,

    Other(u8),
}

impl Reply {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded               => consts::SOCKS5_REPLY_SUCCEEDED,
            Reply::GeneralFailure          => consts::SOCKS5_REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed    => consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable      => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable         => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused       => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired              => consts::SOCKS5_REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported     => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::Other(c)                => c,
        }
    }

    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Reply {
        match code {
            consts::SOCKS5_REPLY_SUCCEEDED                  => Reply::Succeeded,
            consts::SOCKS5_REPLY_GENERAL_FAILURE            => Reply::GeneralFailure,
            consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED     => Reply::ConnectionNotAllowed,
            consts::SOCKS5_REPLY_NETWORK_UNREACHABLE        => Reply::NetworkUnreachable,
            consts::SOCKS5_REPLY_HOST_UNREACHABLE           => Reply::HostUnreachable,
            consts::SOCKS5_REPLY_CONNECTION_REFUSED         => Reply::ConnectionRefused,
            consts::SOCKS5_REPLY_TTL_EXPIRED                => Reply::TtlExpired,
            consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED      => Reply::CommandNotSupported,
            consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Reply::AddressTypeNotSupported,
            _                                               => Reply::Other(code),
        }
    }
}

impl Display for Reply {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Reply::Succeeded               => write!(f, "Succeeded"),
            Reply::AddressTypeNotSupported => write!(f, "Address type not supported"),
            Reply::CommandNotSupported     => write!(f, "Command not supported"),
            Reply::ConnectionNotAllowed    => write!(f, "Connection not allowed"),
            Reply::ConnectionRefused       => write!(f, "Connection refused"),
            Reply::GeneralFailure          => write!(f, "General failure"),
            Reply::HostUnreachable         => write!(f, "Host unreachable"),
            Reply::NetworkUnreachable      => write!(f, "Network unreachable"),
            Reply::Other(u)                => write!(f, "Other reply ({u})"),
            Reply::TtlExpired              => write!(f, "TTL expired"),
        }
    }
}

/// SOCKS5 address
///
/// Host part of a target or bound endpoint; the port travels separately
/// in [`Request`] and [`Response`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name, 1 to 255 bytes, not null-terminated
    DomainName(String),
}

impl Address {
    /// Decode an address from the ATYP tag onward.
    ///
    /// The domain branch can report incomplete twice, first waiting for
    /// the length byte and then for the name bytes.
    pub fn decode(buf: &[u8]) -> Result<Option<(Address, usize)>, Error> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };

        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 {
                    return Ok(None);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                Ok(Some((Address::Ipv4(Ipv4Addr::from(octets)), 5)))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                Ok(Some((Address::Ipv6(Ipv6Addr::from(octets)), 17)))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                if len == 0 {
                    return Err(Error::MalformedMessage("zero-length domain name"));
                }
                let len = len as usize;
                if buf.len() < 2 + len {
                    return Ok(None);
                }
                let name = str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::MalformedMessage("domain name must be UTF-8 encoding"))?;
                Ok(Some((Address::DomainName(name.to_owned()), 2 + len)))
            }
            _ => Err(Error::UnsupportedAddressType(atyp)),
        }
    }

    /// Writes to buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::Ipv4(ref addr) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.octets());
            }
            Address::Ipv6(ref addr) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.octets());
            }
            Address::DomainName(ref dnaddr) => {
                assert!(
                    !dnaddr.is_empty() && dnaddr.len() <= u8::MAX as usize,
                    "domain name length must be in 1..=255"
                );
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dnaddr.len() as u8);
                buf.put_slice(dnaddr.as_bytes());
            }
        }
    }

    /// Get required buffer size for serializing
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::Ipv4(..) => 1 + 4,
            Address::Ipv6(..) => 1 + 16,
            Address::DomainName(ref dmname) => 1 + 1 + dmname.len(),
        }
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::Ipv4(ref addr) => write!(f, "{addr}"),
            Address::Ipv6(ref addr) => write!(f, "{addr}"),
            Address::DomainName(ref addr) => write!(f, "{addr}"),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(a: Ipv4Addr) -> Address {
        Address::Ipv4(a)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(a: Ipv6Addr) -> Address {
        Address::Ipv6(a)
    }
}

impl From<IpAddr> for Address {
    fn from(a: IpAddr) -> Address {
        match a {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

/// SOCKS5 greeting, the first client message
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 5  |    1     | 1 to 255 |
/// +----+----------+----------|
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    /// Offered methods, in the order the client listed them
    pub methods: Vec<AuthMethod>,
}

impl Greeting {
    /// Creates a greeting. The method count must fit a single unsigned
    /// byte; [`crate::client::ClientHandshake::start`] rejects violations
    /// before constructing one.
    pub fn new(methods: Vec<AuthMethod>) -> Greeting {
        debug_assert!(!methods.is_empty() && methods.len() <= u8::MAX as usize);
        Greeting { methods }
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Greeting, usize)>, Error> {
        let Some(&ver) = buf.first() else {
            return Ok(None);
        };
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::InvalidProtocolVersion(ver));
        }

        let Some(&nmet) = buf.get(1) else {
            return Ok(None);
        };
        if nmet == 0 {
            return Err(Error::MalformedMessage("greeting offers no methods"));
        }

        let nmet = nmet as usize;
        if buf.len() < 2 + nmet {
            return Ok(None);
        }

        let methods = buf[2..2 + nmet].iter().copied().map(AuthMethod::from_u8).collect();
        Ok(Some((Greeting { methods }, 2 + nmet)))
    }

    /// Write to buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        assert!(
            !self.methods.is_empty() && self.methods.len() <= u8::MAX as usize,
            "number of offered methods must be in 1..=255"
        );
        buf.put_slice(&[consts::SOCKS5_VERSION, self.methods.len() as u8]);
        for m in &self.methods {
            buf.put_u8(m.as_u8());
        }
    }

    /// Get length of bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        2 + self.methods.len()
    }
}

/// SOCKS5 method selection, the server's answer to a [`Greeting`]
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub struct MethodSelection {
    pub method: AuthMethod,
}

impl MethodSelection {
    pub fn new(method: AuthMethod) -> MethodSelection {
        MethodSelection { method }
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(MethodSelection, usize)>, Error> {
        let Some(&ver) = buf.first() else {
            return Ok(None);
        };
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::InvalidProtocolVersion(ver));
        }

        match buf.get(1) {
            Some(&met) => Ok(Some((MethodSelection::new(AuthMethod::from_u8(met)), 2))),
            None => Ok(None),
        }
    }

    /// Write to buffer
    pub fn write_to_buf<B: BufMut>(self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.method.as_u8()]);
    }

    /// Length in bytes
    #[inline]
    pub fn serialized_len(self) -> usize {
        2
    }
}

/// SOCKS5 request
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// SOCKS5 command
    pub command: Command,
    /// Target address
    pub address: Address,
    /// Target port
    pub port: u16,
}

impl Request {
    /// Creates a request
    pub fn new(command: Command, address: Address, port: u16) -> Request {
        Request {
            command,
            address,
            port,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
        let Some(&ver) = buf.first() else {
            return Ok(None);
        };
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::InvalidProtocolVersion(ver));
        }

        let Some(&cmd) = buf.get(1) else {
            return Ok(None);
        };
        let command = Command::from_u8(cmd).ok_or(Error::CommandNotSupported(cmd))?;

        let Some(&rsv) = buf.get(2) else {
            return Ok(None);
        };
        if rsv != 0 {
            return Err(Error::MalformedMessage("non-zero reserved byte"));
        }

        let Some((address, addr_len)) = Address::decode(&buf[3..])? else {
            return Ok(None);
        };

        let end = 3 + addr_len;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        let port = u16::from_be_bytes([buf[end], buf[end + 1]]);

        Ok(Some((Request { command, address, port }, end + 2)))
    }

    /// Writes to buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.command.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
        buf.put_u16(self.port);
    }

    /// Length in bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len() + 2
    }
}

/// SOCKS5 response
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// SOCKS5 reply
    pub reply: Reply,
    /// Bound address
    pub address: Address,
    /// Bound port
    pub port: u16,
}

impl Response {
    /// Creates a response
    pub fn new(reply: Reply, address: Address, port: u16) -> Response {
        Response { reply, address, port }
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Response, usize)>, Error> {
        let Some(&ver) = buf.first() else {
            return Ok(None);
        };
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::InvalidProtocolVersion(ver));
        }

        let Some(&rep) = buf.get(1) else {
            return Ok(None);
        };
        let reply = Reply::from_u8(rep);

        let Some(&rsv) = buf.get(2) else {
            return Ok(None);
        };
        if rsv != 0 {
            return Err(Error::MalformedMessage("non-zero reserved byte"));
        }

        let Some((address, addr_len)) = Address::decode(&buf[3..])? else {
            return Ok(None);
        };

        let end = 3 + addr_len;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        let port = u16::from_be_bytes([buf[end], buf[end + 1]]);

        Ok(Some((Response { reply, address, port }, end + 2)))
    }

    /// Writes to buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.reply.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
        buf.put_u16(self.port);
    }

    /// Length in bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len() + 2
    }
}
