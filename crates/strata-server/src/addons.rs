//! Addons: async code behind the hooks.
//!
//! The driver hands every hook payload to an [`AddonChain`]. Each addon may
//! inspect or mutate it; the built-in addons run last and only fill in what
//! earlier addons left undecided.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::RootCertStore;
use tracing::warn;

use strata_core::connection::ConnectionRef;
use strata_core::flow::{HttpFlow, Shared, TcpFlow};
use strata_core::hooks::{ClientHelloData, Hook, HookName, NextLayerData, TlsStartData};
use strata_core::layers::tls::{client_config, server_config, RustlsEngine, TlsEngine, HTTP1_ALPNS, HTTP2_ALPN};
use strata_core::options::{ConnectionStrategy, Options};
use strata_core::TlsError;

use crate::ca::CertificateAuthority;
use crate::policy::NextLayerPolicy;

/// Hook callbacks. All methods default to doing nothing.
#[async_trait]
pub trait Addon: Send + Sync {
    fn name(&self) -> &str;

    async fn next_layer(&self, _data: &mut NextLayerData) {}

    async fn tls_clienthello(&self, _data: &mut ClientHelloData) {}

    async fn tls_start(&self, _data: &mut TlsStartData) {}

    /// `tcp_start`, `tcp_message`, `tcp_end` and `tcp_error`.
    async fn tcp(&self, _hook: HookName, _flow: &Shared<TcpFlow>) {}

    /// The HTTP and WebSocket hooks.
    async fn http(&self, _hook: HookName, _flow: &Shared<HttpFlow>) {}
}

/// Addons in invocation order.
#[derive(Clone, Default)]
pub struct AddonChain {
    addons: Vec<Arc<dyn Addon>>,
}

impl std::fmt::Debug for AddonChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.addons.iter().map(|a| a.name())).finish()
    }
}

impl AddonChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, addon: Arc<dyn Addon>) -> Self {
        self.addons.push(addon);
        self
    }

    pub fn push(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Runs every addon on `hook`, in order.
    pub async fn invoke(&self, hook: &mut Hook) {
        for addon in &self.addons {
            match hook {
                Hook::NextLayer(data) => addon.next_layer(data).await,
                Hook::TlsClienthello(data) => addon.tls_clienthello(data).await,
                Hook::TlsStart(data) => addon.tls_start(data).await,
                Hook::Tcp(name, flow) => addon.tcp(*name, flow).await,
                Hook::Http(name, flow) => addon.http(*name, flow).await,
            }
        }
    }
}

/// Built-in `next_layer` addon.
#[derive(Debug)]
pub struct NextLayerAddon {
    policy: NextLayerPolicy,
}

impl NextLayerAddon {
    pub fn new(policy: NextLayerPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Addon for NextLayerAddon {
    fn name(&self) -> &str {
        "next_layer"
    }

    async fn next_layer(&self, data: &mut NextLayerData) {
        if data.layer.is_none() {
            data.layer = self.policy.decide(data);
        }
    }
}

/// ALPN values we can speak, in order of preference.
fn supported_alpns(options: &Options) -> Vec<&'static [u8]> {
    let mut alpns = Vec::new();
    if options.http2 {
        alpns.push(HTTP2_ALPN);
    }
    alpns.extend_from_slice(&HTTP1_ALPNS);
    alpns
}

/// Built-in TLS addon: leaf certificates from the CA towards clients,
/// rustls clients towards servers.
#[derive(Debug)]
pub struct TlsConfig {
    ca: CertificateAuthority,
    /// Upstream certificates are not verified without roots.
    upstream_roots: Option<RootCertStore>,
}

impl TlsConfig {
    pub fn new(ca: CertificateAuthority) -> Self {
        Self {
            ca,
            upstream_roots: None,
        }
    }

    pub fn with_upstream_roots(mut self, roots: RootCertStore) -> Self {
        self.upstream_roots = Some(roots);
        self
    }

    /// ALPN protocols to offer a client: mirror the server's choice if the
    /// server handshake is already done, else what both sides support.
    fn client_alpn(options: &Options, client: &ConnectionRef, server: &ConnectionRef) -> Vec<Vec<u8>> {
        if server.tls_established() {
            return server.alpn().into_iter().collect();
        }
        let offers = client.read().alpn_offers.clone();
        supported_alpns(options)
            .into_iter()
            .filter(|alpn| offers.iter().any(|o| o.as_slice() == *alpn))
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// ALPN protocols to offer a server: the client's offers we support, or
    /// HTTP/1.1 if the client offered nothing.
    fn server_alpn(options: &Options, client: &ConnectionRef) -> Vec<Vec<u8>> {
        let offers = client.read().alpn_offers.clone();
        if offers.is_empty() {
            return vec![b"http/1.1".to_vec()];
        }
        let supported = supported_alpns(options);
        offers
            .into_iter()
            .filter(|o| supported.contains(&o.as_slice()))
            .collect()
    }

    fn engine_for(&self, data: &TlsStartData) -> Result<Box<dyn TlsEngine>, TlsError> {
        let ctx = &data.context;
        if data.conn.is_client() {
            let host = data
                .conn
                .read()
                .sni
                .clone()
                .or_else(|| ctx.server.address().map(|a| a.host))
                .unwrap_or_else(|| "localhost".to_string());
            let leaf = self.ca.leaf(&host).map_err(|e| TlsError::Other(e.to_string()))?;
            let alpn = Self::client_alpn(&ctx.options, &data.conn, &ctx.server);
            let config = server_config(vec![leaf.cert.clone()], leaf.key(), alpn)?;
            Ok(Box::new(RustlsEngine::server(config)?))
        } else {
            let sni = {
                let conn = data.conn.read();
                conn.sni
                    .clone()
                    .or_else(|| ctx.client.read().sni.clone())
                    .or_else(|| conn.address.as_ref().map(|a| a.host.clone()))
            }
            .ok_or_else(|| TlsError::Other("no server name for TLS".to_string()))?;
            let alpn = Self::server_alpn(&ctx.options, &ctx.client);
            let config = client_config(self.upstream_roots.clone(), alpn)?;
            Ok(Box::new(RustlsEngine::client(config, &sni)?))
        }
    }
}

#[async_trait]
impl Addon for TlsConfig {
    fn name(&self) -> &str {
        "tls_config"
    }

    async fn tls_clienthello(&self, data: &mut ClientHelloData) {
        let server = &data.context.server;
        data.establish_server_tls_first = server.read().tls
            && server.address().is_some()
            && data.context.options.connection_strategy == ConnectionStrategy::Eager;
    }

    async fn tls_start(&self, data: &mut TlsStartData) {
        if data.engine.is_some() {
            return;
        }
        match self.engine_for(data) {
            Ok(engine) => data.engine = Some(engine),
            Err(e) => warn!(conn = ?data.conn, "cannot set up TLS: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strata_core::flow::HttpFlow;
    use strata_core::message::Request;
    use strata_core::testing::{context, context_to};
    use tempfile::TempDir;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Addon for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn http(&self, _hook: HookName, flow: &Shared<HttpFlow>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            flow.write().request.headers.insert("x-seen", "1");
        }
    }

    #[tokio::test]
    async fn chain_runs_addons_in_order() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let chain = AddonChain::new().with(counter.clone()).with(counter.clone());
        let ctx = context();
        let flow = HttpFlow::new(ctx.client.clone(), ctx.server.clone(), Request::new(http::Method::GET, "/", "HTTP/1.1")).shared();
        let mut hook = Hook::Http(HookName::Request, flow.clone());
        chain.invoke(&mut hook).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(flow.read().request.headers.get("x-seen"), Some("1"));
    }

    #[test]
    fn alpn_selection() {
        let ctx = context_to("example.com", 443);
        let options = Options::default();
        ctx.client.write().alpn_offers = vec![b"h2".to_vec(), b"spdy/3".to_vec(), b"http/1.1".to_vec()];
        assert_eq!(
            TlsConfig::client_alpn(&options, &ctx.client, &ctx.server),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(
            TlsConfig::server_alpn(&options.clone().with_http2(false), &ctx.client),
            vec![b"http/1.1".to_vec()]
        );
        ctx.client.write().alpn_offers.clear();
        assert_eq!(TlsConfig::server_alpn(&options, &ctx.client), vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn tls_start_supplies_engines() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(temp_dir.path().join("ca"));
        ca.ensure_ca().unwrap();
        let tls = TlsConfig::new(ca);
        let ctx = context_to("example.com", 443);

        let mut hook = Hook::TlsStart(TlsStartData {
            context: ctx.clone(),
            conn: ctx.client.clone(),
            engine: None,
        });
        AddonChain::new().with(Arc::new(tls)).invoke(&mut hook).await;
        let Hook::TlsStart(data) = hook else { panic!("hook changed kind") };
        assert!(data.engine.is_some());
    }
}
