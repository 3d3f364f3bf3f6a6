//! Commands: requests from a layer to the outer world.
//!
//! Commands that block suspend the issuing layer until a
//! [`CommandCompleted`](crate::events::CommandCompleted) with the same
//! [`CommandId`] arrives. The HTTP variants never leave the HTTP layer; they
//! only travel through the tunnel layers that sit between an HTTP connection
//! handler and the HTTP layer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tracing::Level;

use crate::connection::{Address, ConnectionRef, ServerSpec};
use crate::hooks::Hook;
use crate::layer::LayerId;
use crate::layers::http::{HttpEvent, StreamId};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation key of a command and its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    pub fn next() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Blocking state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// Fire and forget.
    No,
    /// The issuing layer must pause.
    Yes,
    /// Blocking, and already owned by the paused layer. Relaying layers
    /// pass it on without pausing.
    Owned(LayerId),
}

/// Ask the HTTP layer for a connection to `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHttpConnection {
    pub address: Address,
    pub tls: bool,
    pub via: Option<ServerSpec>,
}

impl GetHttpConnection {
    /// True if `connection` can serve this request.
    pub fn matches(&self, connection: &ConnectionRef) -> bool {
        let conn = connection.read();
        conn.address.as_ref() == Some(&self.address) && conn.tls == self.tls && conn.via == self.via
    }
}

/// What a command asks for.
#[derive(Debug)]
pub enum CommandKind {
    SendData {
        connection: ConnectionRef,
        data: Bytes,
    },
    /// Blocking. Replied with `Reply::OpenConnection`.
    OpenConnection {
        connection: ConnectionRef,
    },
    CloseConnection {
        connection: ConnectionRef,
        /// Only shut down our write side.
        half_close: bool,
    },
    /// Replied with `Reply::Wakeup` after `delay`.
    RequestWakeup {
        delay: Duration,
    },
    /// Blocking. Replied with `Reply::Hook` carrying the payload back.
    Hook(Hook),
    Log {
        message: String,
        level: Level,
    },
    /// Blocking. Replied with `Reply::GetSocket`.
    GetSocket {
        connection: ConnectionRef,
    },
    /// Blocking. Replied with `Reply::EstablishServerTls`.
    EstablishServerTls {
        connection: ConnectionRef,
    },
    /// An HTTP event produced by a connection handler.
    ReceiveHttp(HttpEvent),
    /// An HTTP event to be serialized onto `connection`.
    SendHttp {
        event: HttpEvent,
        connection: ConnectionRef,
    },
    /// Blocking. Replied with `Reply::HttpConnection`.
    GetHttpConnection(GetHttpConnection),
    /// A client-side connection handler finished opening (or failed).
    RegisterHttpConnection {
        connection: ConnectionRef,
        err: Option<String>,
    },
    /// The stream is finished and can be forgotten.
    DropStream(StreamId),
}

impl CommandKind {
    fn blocks(&self) -> bool {
        matches!(
            self,
            CommandKind::OpenConnection { .. }
                | CommandKind::Hook(_)
                | CommandKind::GetSocket { .. }
                | CommandKind::EstablishServerTls { .. }
                | CommandKind::GetHttpConnection(_)
        )
    }
}

/// A command with its identity and blocking state.
pub struct Command {
    pub id: CommandId,
    pub blocking: Blocking,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        let blocking = if kind.blocks() {
            Blocking::Yes
        } else {
            Blocking::No
        };
        Self {
            id: CommandId::next(),
            blocking,
            kind,
        }
    }

    pub fn send_data(connection: &ConnectionRef, data: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::SendData {
            connection: connection.clone(),
            data: data.into(),
        })
    }

    pub fn open_connection(connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::OpenConnection {
            connection: connection.clone(),
        })
    }

    pub fn close_connection(connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::CloseConnection {
            connection: connection.clone(),
            half_close: false,
        })
    }

    pub fn half_close(connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::CloseConnection {
            connection: connection.clone(),
            half_close: true,
        })
    }

    pub fn request_wakeup(delay: Duration) -> Self {
        Self::new(CommandKind::RequestWakeup { delay })
    }

    pub fn hook(hook: Hook) -> Self {
        Self::new(CommandKind::Hook(hook))
    }

    pub fn log(message: impl Into<String>, level: Level) -> Self {
        Self::new(CommandKind::Log {
            message: message.into(),
            level,
        })
    }

    pub fn get_socket(connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::GetSocket {
            connection: connection.clone(),
        })
    }

    pub fn establish_server_tls(connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::EstablishServerTls {
            connection: connection.clone(),
        })
    }

    pub fn receive_http(event: HttpEvent) -> Self {
        Self::new(CommandKind::ReceiveHttp(event))
    }

    pub fn send_http(event: HttpEvent, connection: &ConnectionRef) -> Self {
        Self::new(CommandKind::SendHttp {
            event,
            connection: connection.clone(),
        })
    }

    pub fn get_http_connection(request: GetHttpConnection) -> Self {
        Self::new(CommandKind::GetHttpConnection(request))
    }

    pub fn register_http_connection(connection: &ConnectionRef, err: Option<String>) -> Self {
        Self::new(CommandKind::RegisterHttpConnection {
            connection: connection.clone(),
            err,
        })
    }

    pub fn drop_stream(stream_id: StreamId) -> Self {
        Self::new(CommandKind::DropStream(stream_id))
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking != Blocking::No
    }

    /// The connection a connection-level command targets.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match &self.kind {
            CommandKind::SendData { connection, .. }
            | CommandKind::OpenConnection { connection }
            | CommandKind::CloseConnection { connection, .. }
            | CommandKind::GetSocket { connection }
            | CommandKind::EstablishServerTls { connection } => Some(connection),
            _ => None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.blocking {
            Blocking::No => "",
            Blocking::Yes => " [blocking]",
            Blocking::Owned(_) => " [owned]",
        };
        match &self.kind {
            CommandKind::SendData { connection, data } => {
                write!(f, "SendData({:?}, {} bytes)", connection, data.len())?
            }
            CommandKind::Log { message, level } => write!(f, "Log({}, {:?})", level, message)?,
            kind => write!(f, "{:?}", kind)?,
        }
        f.write_str(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_defaults_follow_kind() {
        let conn = ConnectionRef::server(None);
        assert_eq!(Command::send_data(&conn, "x").blocking, Blocking::No);
        assert_eq!(Command::open_connection(&conn).blocking, Blocking::Yes);
        assert_eq!(Command::close_connection(&conn).blocking, Blocking::No);
        assert_eq!(Command::get_socket(&conn).blocking, Blocking::Yes);
        assert_eq!(
            Command::request_wakeup(Duration::from_secs(1)).blocking,
            Blocking::No
        );
    }

    #[test]
    fn command_ids_are_unique() {
        let conn = ConnectionRef::server(None);
        let a = Command::open_connection(&conn);
        let b = Command::open_connection(&conn);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn http_connection_matching_checks_tls_and_via() {
        let conn = ConnectionRef::server(Some(Address::new("example.com", 443)));
        conn.write().tls = true;
        let mut request = GetHttpConnection {
            address: Address::new("example.com", 443),
            tls: true,
            via: None,
        };
        assert!(request.matches(&conn));
        request.tls = false;
        assert!(!request.matches(&conn));
    }
}
