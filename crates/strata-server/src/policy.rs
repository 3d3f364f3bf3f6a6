//! Default protocol decisions for the `next_layer` hook.
//!
//! Decides from the stack built so far, the proxy mode, host patterns and
//! the first bytes of the connection:
//!
//! ```text
//! ignored host?          ─▶ TcpLayer (passthrough)
//! TLS ClientHello?       ─▶ ServerTls (then ClientTls beneath it)
//! regular/upstream root  ─▶ HttpLayer(regular/upstream)
//! rawtcp and not HTTP?   ─▶ TcpLayer
//! otherwise              ─▶ HttpLayer(transparent)
//! ```

use regex::{Regex, RegexBuilder};
use tracing::debug;

use strata_core::connection::Scheme;
use strata_core::hooks::NextLayerData;
use strata_core::layer::{Handler, Layer, LayerKind};
use strata_core::layers::http::{HttpLayer, HttpMode};
use strata_core::layers::tcp::TcpLayer;
use strata_core::layers::tls::{client_tls, parse_client_hello, server_tls, starts_like_tls_record, HTTP1_ALPNS, HTTP2_ALPN};
use strata_core::options::{Options, ProxyMode};

use crate::error::ServerError;

/// Compiles a host pattern. `*` matches any run of characters; everything
/// else is literal. Matching is anchored and case-insensitive.
pub fn host_pattern(pattern: &str) -> Result<Regex, ServerError> {
    let escaped = regex::escape(pattern.trim()).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{}$", escaped))
        .case_insensitive(true)
        .build()
        .map_err(|e| ServerError::Config(format!("invalid host pattern {:?}: {}", pattern, e)))
}

/// The built-in `next_layer` decision maker.
#[derive(Debug, Clone)]
pub struct NextLayerPolicy {
    allow: Vec<Regex>,
    ignore: Vec<Regex>,
}

impl NextLayerPolicy {
    pub fn from_options(options: &Options) -> Result<Self, ServerError> {
        if !options.allow_hosts.is_empty() && !options.ignore_hosts.is_empty() {
            return Err(ServerError::Config(
                "allow_hosts and ignore_hosts are mutually exclusive".to_string(),
            ));
        }
        Ok(Self {
            allow: options.allow_hosts.iter().map(|p| host_pattern(p)).collect::<Result<_, _>>()?,
            ignore: options.ignore_hosts.iter().map(|p| host_pattern(p)).collect::<Result<_, _>>()?,
        })
    }

    /// True if traffic to any of `hosts` should be passed through untouched.
    pub fn ignored<'a>(&self, mut hosts: impl Iterator<Item = &'a str>) -> bool {
        if !self.allow.is_empty() {
            let hosts: Vec<&str> = hosts.collect();
            !hosts.is_empty() && !hosts.iter().any(|h| self.allow.iter().any(|p| p.is_match(h)))
        } else {
            hosts.any(|h| self.ignore.iter().any(|p| p.is_match(h)))
        }
    }

    fn has_patterns(&self) -> bool {
        !self.allow.is_empty() || !self.ignore.is_empty()
    }

    /// Picks the layer for `data`, or `None` to wait for more bytes.
    pub fn decide(&self, data: &NextLayerData) -> Option<Box<dyn Layer>> {
        let ctx = &data.context;
        let options = &ctx.options;
        let stack = ctx.layers();

        if stack.is_empty() {
            if let ProxyMode::Reverse(spec) = &options.mode {
                if matches!(spec.scheme, Scheme::Https) {
                    return Some(server_tls(ctx).boxed(ctx));
                }
            }
        }

        let client = &data.data_client;
        if client.len() < 3 && data.data_server.is_empty() {
            return None;
        }

        let client_tls_data = starts_like_tls_record(client);
        let sni = if client_tls_data {
            match parse_client_hello(client) {
                Ok(Some(hello)) => hello.sni,
                Ok(None) => return None,
                Err(e) => {
                    debug!("unparseable ClientHello: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if self.has_patterns() {
            let mut hosts = Vec::new();
            if let Some(address) = ctx.server.address() {
                hosts.push(address.host.clone());
                hosts.push(address.to_string());
                if let Some(sni) = &sni {
                    hosts.push(format!("{}:{}", sni, address.port));
                }
            }
            if let Some(sni) = &sni {
                hosts.push(sni.clone());
            }
            if self.ignored(hosts.iter().map(String::as_str)) {
                debug!(hosts = ?hosts, "passing connection through");
                return Some(TcpLayer::new(ctx.clone(), true).boxed(ctx));
            }
        }

        if client_tls_data {
            if ctx.parent_kind() == Some(LayerKind::ServerTls) {
                if let Ok(layer) = client_tls(ctx) {
                    return Some(layer.boxed(ctx));
                }
            }
            if stack.is_empty() && matches!(options.mode, ProxyMode::Reverse(_)) {
                // Plain-HTTP upstream; the client's TLS cannot be terminated
                // without a server TLS parent, so pass it through.
                return Some(TcpLayer::new(ctx.clone(), true).boxed(ctx));
            }
            return Some(server_tls(ctx).boxed(ctx));
        }

        if !stack.contains(&LayerKind::Http) {
            match options.mode {
                ProxyMode::Regular => return Some(HttpLayer::new(ctx.clone(), HttpMode::Regular).boxed(ctx)),
                ProxyMode::Upstream(_) => return Some(HttpLayer::new(ctx.clone(), HttpMode::Upstream).boxed(ctx)),
                _ => {}
            }
        }

        let alpn = ctx.client.alpn();
        let very_likely_http = alpn
            .as_deref()
            .map(|a| a == HTTP2_ALPN || HTTP1_ALPNS.contains(&a))
            .unwrap_or(false);
        let probably_no_http = !very_likely_http
            && (!client.iter().take(3).all(u8::is_ascii_alphabetic) || !data.data_server.is_empty());
        if options.rawtcp && probably_no_http {
            return Some(TcpLayer::new(ctx.clone(), false).boxed(ctx));
        }

        Some(HttpLayer::new(ctx.clone(), HttpMode::Transparent).boxed(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use strata_core::connection::ServerSpec;
    use strata_core::context::Context;
    use strata_core::layers::tls::build_client_hello;
    use strata_core::testing::{context_to, context_with};

    fn data(ctx: Context, client: &[u8]) -> NextLayerData {
        NextLayerData {
            context: ctx,
            data_client: Bytes::copy_from_slice(client),
            data_server: Bytes::new(),
            layer: None,
        }
    }

    fn kind(policy: &NextLayerPolicy, data: &NextLayerData) -> Option<LayerKind> {
        policy.decide(data).map(|l| l.kind())
    }

    #[test]
    fn wildcard_patterns() {
        let p = host_pattern("*.example.com").unwrap();
        assert!(p.is_match("api.example.com"));
        assert!(p.is_match("API.Example.com"));
        assert!(!p.is_match("example.com"));
        assert!(!p.is_match("example.com.evil"));
        let p = host_pattern("example.com:443").unwrap();
        assert!(p.is_match("example.com:443"));
        assert!(!p.is_match("example.com:4433"));
    }

    #[test]
    fn allow_and_ignore_are_exclusive() {
        let options = Options {
            allow_hosts: vec!["a".into()],
            ignore_hosts: vec!["b".into()],
            ..Options::default()
        };
        assert!(NextLayerPolicy::from_options(&options).is_err());
    }

    #[test]
    fn waits_for_three_bytes() {
        let policy = NextLayerPolicy::from_options(&Options::default()).unwrap();
        assert_eq!(kind(&policy, &data(context_with(Options::default()), b"GE")), None);
    }

    #[test]
    fn regular_mode_starts_with_http() {
        let policy = NextLayerPolicy::from_options(&Options::default()).unwrap();
        let d = data(context_with(Options::default()), b"GET http://example.com/ HTTP/1.1\r\n");
        assert_eq!(kind(&policy, &d), Some(LayerKind::Http));
    }

    #[test]
    fn tls_waits_for_complete_client_hello() {
        let policy = NextLayerPolicy::from_options(&Options::default()).unwrap();
        let hello = build_client_hello(Some("example.com"), &[&b"h2"[..]]);
        let ctx = context_to("example.com", 443);
        assert_eq!(kind(&policy, &data(ctx.clone(), &hello[..hello.len() - 1])), None);
        assert_eq!(kind(&policy, &data(ctx, &hello)), Some(LayerKind::ServerTls));
    }

    #[test]
    fn client_tls_beneath_server_tls() {
        let policy = NextLayerPolicy::from_options(&Options::default()).unwrap();
        let hello = build_client_hello(Some("example.com"), &[]);
        let ctx = context_to("example.com", 443).enter(LayerKind::ServerTls);
        assert_eq!(kind(&policy, &data(ctx, &hello)), Some(LayerKind::ClientTls));
    }

    #[test]
    fn ignored_hosts_pass_through() {
        let options = Options {
            ignore_hosts: vec!["*.bank.example".into()],
            ..Options::default()
        };
        let policy = NextLayerPolicy::from_options(&options).unwrap();
        let hello = build_client_hello(Some("www.bank.example"), &[]);
        let ctx = context_to("10.0.0.1", 443).enter(LayerKind::Http);
        assert_eq!(kind(&policy, &data(ctx.clone(), &hello)), Some(LayerKind::Tcp));

        let hello = build_client_hello(Some("news.example"), &[]);
        assert_eq!(kind(&policy, &data(ctx, &hello)), Some(LayerKind::ServerTls));
    }

    #[test]
    fn allow_hosts_pass_everything_else_through() {
        let options = Options {
            allow_hosts: vec!["api.example.com".into()],
            ..Options::default()
        };
        let policy = NextLayerPolicy::from_options(&options).unwrap();
        let ctx = context_to("other.example", 80).enter(LayerKind::Http);
        assert_eq!(kind(&policy, &data(ctx, b"GET / HTTP/1.1\r\n")), Some(LayerKind::Tcp));
        let ctx = context_to("api.example.com", 80).enter(LayerKind::Http);
        assert_eq!(kind(&policy, &data(ctx, b"GET / HTTP/1.1\r\n")), Some(LayerKind::Http));
    }

    #[test]
    fn rawtcp_for_non_http_bytes() {
        let options = Options::default().with_rawtcp(true);
        let policy = NextLayerPolicy::from_options(&options).unwrap();
        let ctx = context_with(options.clone()).enter(LayerKind::Http);
        assert_eq!(kind(&policy, &data(ctx.clone(), b"\x00\x01\x02binary")), Some(LayerKind::Tcp));
        assert_eq!(kind(&policy, &data(ctx, b"GET / HTTP/1.1\r\n")), Some(LayerKind::Http));
    }

    #[test]
    fn reverse_https_wraps_server_tls_first() {
        let spec: ServerSpec = "https://example.com".parse().unwrap();
        let options = Options::default().with_mode(ProxyMode::Reverse(spec));
        let policy = NextLayerPolicy::from_options(&options).unwrap();
        assert_eq!(kind(&policy, &data(context_with(options), b"")), Some(LayerKind::ServerTls));
    }
}
