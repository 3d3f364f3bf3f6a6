//! Events: occurrences fed into a layer.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::commands::CommandId;
use crate::connection::ConnectionRef;
use crate::flow::{TcpMessage, WebSocketMessage};
use crate::hooks::Hook;
use crate::layers::http::HttpEvent;

/// Opaque platform socket handle returned for `GetSocket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub i64);

/// Result payload of a completed blocking command.
#[derive(Debug)]
pub enum Reply {
    /// `None` on success, else the error message.
    OpenConnection(Option<String>),
    /// `None` on success, else the error message.
    EstablishServerTls(Option<String>),
    /// The hook payload, possibly mutated.
    Hook(Hook),
    GetSocket(Option<SocketHandle>),
    Wakeup,
    HttpConnection(Result<ConnectionRef, String>),
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::OpenConnection(_) => "OpenConnection",
            Reply::EstablishServerTls(_) => "EstablishServerTls",
            Reply::Hook(_) => "Hook",
            Reply::GetSocket(_) => "GetSocket",
            Reply::Wakeup => "Wakeup",
            Reply::HttpConnection(_) => "HttpConnection",
        }
    }
}

/// Completion of the command with id `command`.
#[derive(Debug)]
pub struct CommandCompleted {
    pub command: CommandId,
    pub reply: Reply,
}

/// A message injected from outside, handled as if it had been received.
#[derive(Debug, Clone)]
pub enum InjectedMessage {
    Tcp { flow: Uuid, message: TcpMessage },
    WebSocket { flow: Uuid, message: WebSocketMessage },
}

impl InjectedMessage {
    pub fn flow_id(&self) -> Uuid {
        match self {
            InjectedMessage::Tcp { flow, .. } | InjectedMessage::WebSocket { flow, .. } => *flow,
        }
    }
}

/// An incoming occurrence.
pub enum Event {
    /// Always the first event a layer sees.
    Start,
    DataReceived {
        connection: ConnectionRef,
        data: Bytes,
    },
    /// The peer closed its write side (or the connection died).
    ConnectionClosed {
        connection: ConnectionRef,
    },
    CommandCompleted(CommandCompleted),
    MessageInjected(InjectedMessage),
    /// HTTP-internal event addressed at a connection handler or stream.
    Http(HttpEvent),
}

impl Event {
    pub fn data_received(connection: &ConnectionRef, data: impl Into<Bytes>) -> Self {
        Event::DataReceived {
            connection: connection.clone(),
            data: data.into(),
        }
    }

    pub fn connection_closed(connection: &ConnectionRef) -> Self {
        Event::ConnectionClosed {
            connection: connection.clone(),
        }
    }

    pub fn completed(command: CommandId, reply: Reply) -> Self {
        Event::CommandCompleted(CommandCompleted { command, reply })
    }

    /// The connection of a connection-level event.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match self {
            Event::DataReceived { connection, .. } | Event::ConnectionClosed { connection } => {
                Some(connection)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start => f.write_str("Start"),
            Event::DataReceived { connection, data } => {
                write!(f, "DataReceived({:?}, {} bytes)", connection, data.len())
            }
            Event::ConnectionClosed { connection } => write!(f, "ConnectionClosed({:?})", connection),
            Event::CommandCompleted(c) => write!(f, "{}Completed({:?})", c.reply.name(), c.command),
            Event::MessageInjected(m) => write!(f, "MessageInjected({})", m.flow_id()),
            Event::Http(e) => write!(f, "{:?}", e),
        }
    }
}
