//! Hooks: the named, blocking extension points offered to addons.
//!
//! A hook command carries a payload; the driver hands it to addon code and
//! returns it (possibly mutated) in `Reply::Hook`. Flow payloads are shared
//! handles and are mutated in place. The small data holders below are moved
//! out and back.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionRef;
use crate::context::Context;
use crate::flow::{HttpFlow, Shared, TcpFlow};
use crate::layer::{Layer, LayerKind};
use crate::layers::tls::{ClientHello, TlsEngine};

/// Name of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    TcpStart,
    TcpMessage,
    TcpEnd,
    TcpError,
    TlsStart,
    TlsClienthello,
    NextLayer,
    HttpConnect,
    Requestheaders,
    Request,
    Responseheaders,
    Response,
    Error,
    WebsocketStart,
    WebsocketMessage,
    WebsocketEnd,
}

impl HookName {
    /// Returns the hook name as addons know it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpStart => "tcp_start",
            Self::TcpMessage => "tcp_message",
            Self::TcpEnd => "tcp_end",
            Self::TcpError => "tcp_error",
            Self::TlsStart => "tls_start",
            Self::TlsClienthello => "tls_clienthello",
            Self::NextLayer => "next_layer",
            Self::HttpConnect => "http_connect",
            Self::Requestheaders => "requestheaders",
            Self::Request => "request",
            Self::Responseheaders => "responseheaders",
            Self::Response => "response",
            Self::Error => "error",
            Self::WebsocketStart => "websocket_start",
            Self::WebsocketMessage => "websocket_message",
            Self::WebsocketEnd => "websocket_end",
        }
    }

    /// Returns all hook names.
    pub fn all() -> &'static [HookName] {
        &[
            Self::TcpStart,
            Self::TcpMessage,
            Self::TcpEnd,
            Self::TcpError,
            Self::TlsStart,
            Self::TlsClienthello,
            Self::NextLayer,
            Self::HttpConnect,
            Self::Requestheaders,
            Self::Request,
            Self::Responseheaders,
            Self::Response,
            Self::Error,
            Self::WebsocketStart,
            Self::WebsocketMessage,
            Self::WebsocketEnd,
        ]
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `next_layer`: what has been seen so far, and the decision.
pub struct NextLayerData {
    /// Context the chosen layer must be built with.
    pub context: Context,
    pub data_client: Bytes,
    pub data_server: Bytes,
    /// Set by the decision maker. `None` means "ask again on more data".
    pub layer: Option<Box<dyn Layer>>,
}

impl NextLayerData {
    /// Kinds of the layers already stacked above the undecided one.
    pub fn stack(&self) -> &[LayerKind] {
        self.context.layers()
    }
}

impl fmt::Debug for NextLayerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextLayerData")
            .field("stack", &self.context.layers())
            .field("data_client", &self.data_client.len())
            .field("data_server", &self.data_server.len())
            .field("layer", &self.layer.as_ref().map(|l| l.kind()))
            .finish()
    }
}

/// Payload of `tls_start`: the addon supplies a TLS engine for `conn`.
pub struct TlsStartData {
    pub context: Context,
    pub conn: ConnectionRef,
    pub engine: Option<Box<dyn TlsEngine>>,
}

impl fmt::Debug for TlsStartData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStartData")
            .field("conn", &self.conn)
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

/// Payload of `tls_clienthello`.
#[derive(Debug)]
pub struct ClientHelloData {
    pub context: Context,
    pub client_hello: ClientHello,
    /// Complete the server-side handshake before answering the client.
    pub establish_server_tls_first: bool,
}

/// A hook invocation.
#[derive(Debug)]
pub enum Hook {
    NextLayer(NextLayerData),
    TlsStart(TlsStartData),
    TlsClienthello(ClientHelloData),
    Tcp(HookName, Shared<TcpFlow>),
    Http(HookName, Shared<HttpFlow>),
}

impl Hook {
    pub fn name(&self) -> HookName {
        match self {
            Hook::NextLayer(_) => HookName::NextLayer,
            Hook::TlsStart(_) => HookName::TlsStart,
            Hook::TlsClienthello(_) => HookName::TlsClienthello,
            Hook::Tcp(name, _) | Hook::Http(name, _) => *name,
        }
    }
}

/// Accumulates bytes for `NextLayerData`.
pub(crate) fn concat(chunks: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_names_are_unique() {
        let mut names: Vec<_> = HookName::all().iter().map(|h| h.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), HookName::all().len());
    }

    #[test]
    fn serde_names_match_as_str() {
        for hook in HookName::all() {
            let json = serde_json::to_string(hook).unwrap();
            assert_eq!(json, format!("\"{}\"", hook.as_str()));
        }
    }
}
