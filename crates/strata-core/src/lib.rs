//! Strata core - the sans-I/O layer stack of an intercepting proxy.
//!
//! Nothing in this crate touches a socket. A driver feeds [`Event`]s into the
//! root [`Layer`] of a connection and executes the [`Command`]s that come
//! back: open and close connections, send bytes, run hooks, reply.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────── driver (strata-server) ────────────┐
//!   socket ──▶ │ DataReceived / ConnectionClosed / Completed    │
//!              └──────────────────────┬─────────────────────────┘
//!                                     ▼
//!                 NextLayer ─▶ ServerTls ─▶ NextLayer ─▶ ClientTls
//!                                                           │
//!                                          NextLayer ◀──────┘
//!                                              │
//!                          ┌───────────────────┼──────────────┐
//!                          ▼                   ▼              ▼
//!                      HttpLayer            TcpLayer     (passthrough)
//!                   (HTTP/1, HTTP/2)
//!                          │ 101
//!                          ▼
//!                   WebSocketLayer
//! ```
//!
//! Which protocol sits at each [`NextLayer`](layers::NextLayer) is decided
//! by the `next_layer` hook. The driver answers it; the layers only offer
//! their defaults.

pub mod commands;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod flow;
pub mod hooks;
pub mod layer;
pub mod layers;
pub mod message;
pub mod options;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use commands::{Blocking, Command, CommandId, CommandKind};
pub use connection::{Address, ConnectionId, ConnectionKind, ConnectionRef, ConnectionState, Scheme, ServerSpec};
pub use context::Context;
pub use error::{LayerError, Result, TlsError};
pub use events::{CommandCompleted, Event, InjectedMessage, Reply, SocketHandle};
pub use flow::{FlowError, HttpFlow, MessageKind, Shared, TcpFlow, TcpMessage, WebSocketData, WebSocketMessage};
pub use hooks::{Hook, HookName};
pub use layer::{Engine, Handler, Layer, LayerKind};
pub use message::{Headers, Request, Response};
pub use options::{ConnectionStrategy, Options, ProxyMode};

/// Default listen port of the proxy.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
