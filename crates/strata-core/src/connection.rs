//! Connection endpoints as seen by layers.
//!
//! A [`Connection`] never owns a socket. The driver owns the socket and keeps
//! the state bits in sync; layers hold a [`ConnectionRef`] and consult or
//! update the flags of connections they are negotiating.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Readable/writable bits of a connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionState(u8);

impl ConnectionState {
    pub const CLOSED: Self = Self(0);
    pub const CAN_READ: Self = Self(1);
    pub const CAN_WRITE: Self = Self(2);
    pub const OPEN: Self = Self(3);

    /// Returns true if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_closed(self) -> bool {
        self.0 == 0
    }
}

impl BitAnd for ConnectionState {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for ConnectionState {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Not for ConnectionState {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::OPEN.0)
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "CLOSED",
            1 => "CAN_READ",
            2 => "CAN_WRITE",
            _ => "OPEN",
        };
        f.write_str(name)
    }
}

/// A `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| format!("invalid address: {}", s))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| format!("missing port: {}", s))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| format!("missing port: {}", s))?
        };
        if host.is_empty() {
            return Err(format!("empty host: {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port: {}", s))?;
        Ok(Self::new(host, port))
    }
}

/// Scheme of a proxy or reverse target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A `scheme://host[:port]` server specification used by upstream and
/// reverse modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerSpec {
    pub scheme: Scheme,
    pub address: Address,
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.address)
    }
}

impl FromStr for ServerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some(("http", rest)) => (Scheme::Http, rest),
            Some(("https", rest)) => (Scheme::Https, rest),
            Some((other, _)) => return Err(format!("unsupported scheme: {}", other)),
            None => (Scheme::Https, s),
        };
        let rest = rest.trim_end_matches('/');
        let address = match rest.parse::<Address>() {
            Ok(address) => address,
            Err(_) if !rest.is_empty() && !rest.contains('/') => {
                Address::new(rest, scheme.default_port())
            }
            Err(e) => return Err(e),
        };
        Ok(Self { scheme, address })
    }
}

/// Identity of a connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the proxy a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Client,
    Server,
}

/// One endpoint of a logical TCP/TLS session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    pub peername: Option<SocketAddr>,
    pub sockname: Option<SocketAddr>,
    /// Destination of a server connection. Unset until a layer decides.
    pub address: Option<Address>,
    /// Upstream proxy this server connection is tunnelled through.
    pub via: Option<ServerSpec>,
    pub error: Option<String>,

    pub tls: bool,
    pub tls_established: bool,
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
    pub alpn_offers: Vec<Vec<u8>>,
    pub cipher: Option<String>,
    pub cipher_list: Vec<String>,
    pub tls_version: Option<String>,
    /// Peer certificate chain, DER encoded, leaf first.
    pub certificate_list: Vec<Vec<u8>>,

    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub timestamp_tls_setup: Option<DateTime<Utc>>,
}

impl Connection {
    fn new(kind: ConnectionKind, state: ConnectionState) -> Self {
        Self {
            kind,
            state,
            peername: None,
            sockname: None,
            address: None,
            via: None,
            error: None,
            tls: false,
            tls_established: false,
            sni: None,
            alpn: None,
            alpn_offers: Vec::new(),
            cipher: None,
            cipher_list: Vec::new(),
            tls_version: None,
            certificate_list: Vec::new(),
            timestamp_start: None,
            timestamp_end: None,
            timestamp_tls_setup: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.state.contains(ConnectionState::CAN_WRITE)
            || self.state.contains(ConnectionState::CAN_READ)
    }
}

/// Shared handle to a [`Connection`]. Equality is identity.
#[derive(Clone)]
pub struct ConnectionRef {
    id: ConnectionId,
    inner: Arc<RwLock<Connection>>,
}

impl ConnectionRef {
    /// A client connection: open from the start.
    pub fn client(peername: Option<SocketAddr>, sockname: Option<SocketAddr>) -> Self {
        let mut conn = Connection::new(ConnectionKind::Client, ConnectionState::OPEN);
        conn.peername = peername;
        conn.sockname = sockname;
        conn.timestamp_start = Some(Utc::now());
        Self::wrap(conn)
    }

    /// A server connection: closed until a driver opens it.
    pub fn server(address: Option<Address>) -> Self {
        let mut conn = Connection::new(ConnectionKind::Server, ConnectionState::CLOSED);
        conn.address = address;
        Self::wrap(conn)
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            id: ConnectionId::next(),
            inner: Arc::new(RwLock::new(conn)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Connection> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Connection> {
        self.inner.write()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.read().kind
    }

    pub fn is_client(&self) -> bool {
        self.kind() == ConnectionKind::Client
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.write().state = state;
    }

    /// Clears `bits` from the state.
    pub fn clear_state(&self, bits: ConnectionState) {
        let mut conn = self.inner.write();
        conn.state = conn.state & !bits;
    }

    pub fn connected(&self) -> bool {
        self.inner.read().connected()
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.read().address.clone()
    }

    pub fn tls(&self) -> bool {
        self.inner.read().tls
    }

    pub fn tls_established(&self) -> bool {
        self.inner.read().tls_established
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.inner.read().alpn.clone()
    }
}

impl PartialEq for ConnectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionRef {}

impl Hash for ConnectionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conn = self.inner.read();
        let kind = match conn.kind {
            ConnectionKind::Client => "Client",
            ConnectionKind::Server => "Server",
        };
        match &conn.address {
            Some(address) => write!(f, "{}({}, {}, {:?})", kind, self.id, address, conn.state),
            None => write!(f, "{}({}, {:?})", kind, self.id, conn.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_starts_open_server_starts_closed() {
        let client = ConnectionRef::client(None, None);
        let server = ConnectionRef::server(Some(Address::new("example.com", 80)));
        assert_eq!(client.state(), ConnectionState::OPEN);
        assert!(server.state().is_closed());
        assert!(!server.connected());
    }

    #[test]
    fn clearing_read_keeps_write() {
        let client = ConnectionRef::client(None, None);
        client.clear_state(ConnectionState::CAN_READ);
        assert_eq!(client.state(), ConnectionState::CAN_WRITE);
        assert!(client.connected());
        client.clear_state(ConnectionState::CAN_WRITE);
        assert!(client.state().is_closed());
    }

    #[test]
    fn equality_is_identity() {
        let a = ConnectionRef::server(None);
        let b = ConnectionRef::server(None);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::new("example.com", 443)
        );
        assert_eq!(
            "[::1]:8080".parse::<Address>().unwrap(),
            Address::new("::1", 8080)
        );
        assert!("example.com".parse::<Address>().is_err());
    }

    #[test]
    fn parses_server_specs() {
        let spec: ServerSpec = "http://proxy.local:3128".parse().unwrap();
        assert_eq!(spec.scheme, Scheme::Http);
        assert_eq!(spec.address, Address::new("proxy.local", 3128));

        let spec: ServerSpec = "https://example.com".parse().unwrap();
        assert_eq!(spec.address.port, 443);
        assert_eq!(spec.to_string(), "https://example.com:443");
    }
}
