//! Strata Server - tokio driver for the Strata layer stack.
//!
//! Accepts client connections, owns their sockets and the server sockets
//! opened for them, and answers the hooks the layer stack raises through an
//! [`AddonChain`].
//!
//! ## Example
//!
//! ```no_run
//! use strata_server::{ProxyServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ProxyServer::new(ServerConfig::new().with_port(8080)).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod addons;
pub mod ca;
pub mod error;
pub mod handler;
pub mod policy;
pub mod server;

pub use addons::{Addon, AddonChain, NextLayerAddon, TlsConfig};
pub use ca::{CertificateAuthority, LeafCert};
pub use error::{CaError, Result, ServerError};
pub use handler::ConnectionHandler;
pub use policy::NextLayerPolicy;
pub use server::{ProxyHandle, ProxyServer, ServerConfig};
