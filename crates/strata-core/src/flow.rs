//! Flows: the user-visible record of one protocol exchange.
//!
//! Flows are created by the layer that represents the exchange and handed to
//! hooks as shared handles. Hooks mutate them in place.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::ConnectionRef;
use crate::message::{Request, Response};

/// Shared, hook-mutable flow handle.
pub type Shared<T> = Arc<RwLock<T>>;

/// Error recorded on a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

impl FlowError {
    /// Message recorded when a hook kills a flow.
    pub const KILLED_MESSAGE: &'static str = "Connection killed.";

    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn killed() -> Self {
        Self::new(Self::KILLED_MESSAGE)
    }

    pub fn is_kill(&self) -> bool {
        self.msg == Self::KILLED_MESSAGE
    }
}

/// One directional chunk of a TCP stream.
#[derive(Debug, Clone)]
pub struct TcpMessage {
    pub from_client: bool,
    pub content: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl TcpMessage {
    pub fn new(from_client: bool, content: impl Into<Bytes>) -> Self {
        Self {
            from_client,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A raw TCP session.
#[derive(Debug)]
pub struct TcpFlow {
    pub id: Uuid,
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub messages: Vec<TcpMessage>,
    pub error: Option<FlowError>,
    pub live: bool,
}

impl TcpFlow {
    pub fn new(client: ConnectionRef, server: ConnectionRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            server,
            messages: Vec::new(),
            error: None,
            live: true,
        }
    }

    pub fn shared(self) -> Shared<Self> {
        Arc::new(RwLock::new(self))
    }

    pub fn kill(&mut self) {
        self.error = Some(FlowError::killed());
        self.live = false;
    }
}

/// Payload type of a WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// One complete WebSocket message.
#[derive(Debug, Clone)]
pub struct WebSocketMessage {
    pub kind: MessageKind,
    pub from_client: bool,
    pub content: Bytes,
    pub timestamp: DateTime<Utc>,
    /// Set by a hook to stop the message from being forwarded.
    pub dropped: bool,
    pub injected: bool,
}

impl WebSocketMessage {
    pub fn new(kind: MessageKind, from_client: bool, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            from_client,
            content: content.into(),
            timestamp: Utc::now(),
            dropped: false,
            injected: false,
        }
    }

    pub fn drop_message(&mut self) {
        self.dropped = true;
    }
}

/// WebSocket session data attached to the HTTP flow that upgraded.
#[derive(Debug, Clone, Default)]
pub struct WebSocketData {
    pub messages: Vec<WebSocketMessage>,
    pub closed_by_client: Option<bool>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

/// One HTTP request/response exchange.
#[derive(Debug)]
pub struct HttpFlow {
    pub id: Uuid,
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub request: Request,
    pub response: Option<Response>,
    pub error: Option<FlowError>,
    pub websocket: Option<WebSocketData>,
    pub live: bool,
}

impl HttpFlow {
    pub fn new(client: ConnectionRef, server: ConnectionRef, request: Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            server,
            request,
            response: None,
            error: None,
            websocket: None,
            live: true,
        }
    }

    pub fn shared(self) -> Shared<Self> {
        Arc::new(RwLock::new(self))
    }

    /// Marks the flow as killed. The layer closes the client connection at
    /// its next decision point.
    pub fn kill(&mut self) {
        self.error = Some(FlowError::killed());
        self.live = false;
    }

    pub fn killed(&self) -> bool {
        self.error.as_ref().map(FlowError::is_kill).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn kill_marks_error() {
        let client = ConnectionRef::client(None, None);
        let server = ConnectionRef::server(None);
        let mut flow = HttpFlow::new(client, server, Request::new(Method::GET, "/", "HTTP/1.1"));
        assert!(!flow.killed());
        flow.kill();
        assert!(flow.killed());
        assert!(!flow.live);
    }

    #[test]
    fn flows_get_unique_ids() {
        let client = ConnectionRef::client(None, None);
        let server = ConnectionRef::server(None);
        let a = TcpFlow::new(client.clone(), server.clone());
        let b = TcpFlow::new(client, server);
        assert_ne!(a.id, b.id);
    }
}
