//! The protocol layers. Each one is a [`Handler`](crate::layer::Handler)
//! that the engine wraps; children are nested by `NextLayer`.

pub mod http;
pub mod next_layer;
pub mod tcp;
pub mod tls;
pub mod tunnel;
pub mod websocket;

pub use http::HttpLayer;
pub use next_layer::NextLayer;
pub use tcp::TcpLayer;
pub use tls::TlsLayer;
pub use tunnel::TunnelLayer;
pub use websocket::WebSocketLayer;
