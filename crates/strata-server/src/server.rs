//! Proxy server: accept loop and lifecycle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::RootCertStore;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use strata_core::connection::{Address, ConnectionRef};
use strata_core::context::Context;
use strata_core::options::{Options, ProxyMode};
use strata_core::DEFAULT_PROXY_PORT;

use crate::addons::{Addon, AddonChain, NextLayerAddon, TlsConfig};
use crate::ca::CertificateAuthority;
use crate::error::{Result, ServerError};
use crate::handler::ConnectionHandler;
use crate::policy::NextLayerPolicy;

const LISTEN_BACKLOG: i32 = 128;

/// Proxy server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    pub options: Options,
    /// CA for intercepted TLS. `None` uses the platform data directory.
    pub ca: Option<CertificateAuthority>,
    /// Roots for verifying upstream certificates.
    pub upstream_roots: Option<RootCertStore>,
    /// User addons. They run before the built-in ones.
    pub addons: Vec<Arc<dyn Addon>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("options", &self.options)
            .field("ca", &self.ca)
            .field("upstream_roots", &self.upstream_roots.as_ref().map(RootCertStore::len))
            .field("addons", &self.addons.iter().map(|a| a.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Listens on 127.0.0.1 at the default port.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            options: Options::default(),
            ca: None,
            upstream_roots: None,
            addons: Vec::new(),
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Keeps the CA in `dir` instead of the platform data directory.
    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca = Some(CertificateAuthority::new(dir.into()));
        self
    }

    pub fn with_upstream_roots(mut self, roots: RootCertStore) -> Self {
        self.upstream_roots = Some(roots);
        self
    }

    /// Appends a user addon.
    pub fn with_addon(mut self, addon: Arc<dyn Addon>) -> Self {
        self.addons.push(addon);
        self
    }
}

/// Binds with SO_REUSEADDR so a restarted proxy does not trip over
/// lingering sockets.
fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket.bind(&addr.into()).map_err(|e| ServerError::Bind(addr, e))?;
    socket.listen(LISTEN_BACKLOG).map_err(|e| ServerError::Bind(addr, e))?;
    socket.set_nonblocking(true).map_err(|e| ServerError::Bind(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| ServerError::Bind(addr, e))
}

/// The intercepting proxy.
#[derive(Debug)]
pub struct ProxyServer {
    addr: SocketAddr,
    options: Arc<Options>,
    ca: CertificateAuthority,
    addons: Arc<AddonChain>,
}

impl ProxyServer {
    /// Validates the configuration and makes sure the CA exists.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let policy = NextLayerPolicy::from_options(&config.options)?;
        let ca = match config.ca {
            Some(ca) => ca,
            None => CertificateAuthority::with_default_dir()?,
        };
        ca.ensure_ca()?;

        let mut tls = TlsConfig::new(ca.clone());
        if let Some(roots) = config.upstream_roots {
            tls = tls.with_upstream_roots(roots);
        }

        let mut addons = AddonChain::new();
        for addon in config.addons {
            addons.push(addon);
        }
        addons.push(Arc::new(NextLayerAddon::new(policy)));
        addons.push(Arc::new(tls));

        Ok(Self {
            addr: config.addr,
            options: Arc::new(config.options),
            ca,
            addons: Arc::new(addons),
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca.cert_path()
    }

    /// Runs the proxy until the accept loop fails.
    pub async fn run(self) -> Result<()> {
        let listener = bind(self.addr)?;
        info!("Starting proxy on {} ({})", listener.local_addr()?, self.options.mode);
        info!("CA certificate: {:?}", self.ca_cert_path());
        loop {
            let (stream, peer) = listener.accept().await?;
            self.spawn_connection(stream, peer);
        }
    }

    /// Starts the proxy in the background.
    ///
    /// Returns a handle that can be used to stop the server. Must be called
    /// from within a tokio runtime.
    pub fn start(self) -> Result<ProxyHandle> {
        let listener = bind(self.addr)?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        info!("Starting proxy on {} ({})", addr, self.options.mode);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!("accept failed: {}", e);
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Proxy shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }

    /// The context of a freshly accepted client, with the server target the
    /// proxy mode implies.
    fn context(&self, stream: &TcpStream, peer: SocketAddr) -> Context {
        let local = stream.local_addr().ok();
        let client = ConnectionRef::client(Some(peer), local);
        let ctx = Context::new(client, self.options.clone());
        match &self.options.mode {
            ProxyMode::Reverse(spec) => ctx.with_server(ConnectionRef::server(Some(spec.address.clone()))),
            // Without OS-specific lookups the original destination is the
            // address the client connected to.
            ProxyMode::Transparent => match local {
                Some(local) => {
                    ctx.with_server(ConnectionRef::server(Some(Address::new(local.ip().to_string(), local.port()))))
                }
                None => ctx,
            },
            ProxyMode::Regular | ProxyMode::Upstream(_) => ctx,
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = self.context(&stream, peer);
        let handler = ConnectionHandler::new(ctx, self.addons.clone());
        tokio::spawn(async move {
            match handler.run(stream).await {
                Ok(()) => debug!(client = %peer, "connection done"),
                Err(ServerError::Layer(e)) => warn!(client = %peer, "connection torn down: {}", e),
                Err(e) => warn!(client = %peer, "connection failed: {}", e),
            }
        });
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
