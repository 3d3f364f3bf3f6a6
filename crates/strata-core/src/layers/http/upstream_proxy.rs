//! Talking to a server through another HTTP proxy.
//!
//! The tunnel connection is the upstream proxy, the connection the child
//! sees is the real destination. With `send_connect` the handshake is an
//! HTTP `CONNECT`; without it (plain HTTP in upstream mode) requests are
//! written in absolute form straight onto the proxy connection.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use http::Method;
use tracing::Level;

use crate::commands::Command;
use crate::connection::{ConnectionRef, Scheme};
use crate::context::Context;
use crate::error::Result;
use crate::layer::{Handler, Layer, LayerKind};
use crate::layers::tls::{server_tls_over, HTTP1_ALPNS};
use crate::layers::tunnel::{Handshake, Steps, TunnelInfo, TunnelLayer, TunnelProtocol};
use crate::message::{Headers, Request};
use crate::options::Options;

use super::http1::{assemble_request_head, read_response_head};

/// `Proxy-Authorization` value for the configured upstream credentials.
pub fn proxy_authorization(options: &Options) -> Option<String> {
    options
        .upstream_auth
        .as_ref()
        .map(|auth| format!("Basic {}", STANDARD.encode(auth.as_bytes())))
}

/// The CONNECT handshake towards an upstream proxy.
#[derive(Debug)]
pub struct UpstreamProxy {
    send_connect: bool,
    buf: BytesMut,
}

impl UpstreamProxy {
    pub fn new(send_connect: bool) -> Self {
        Self {
            send_connect,
            buf: BytesMut::new(),
        }
    }

    fn connect_request(t: &TunnelInfo) -> Request {
        let (host, port) = t
            .conn
            .address()
            .map(|a| (a.host, a.port))
            .unwrap_or_default();
        let mut request = Request::new(Method::CONNECT, "", "HTTP/1.1");
        request.scheme = String::new();
        request.authority = format!("{}:{}", host, port);
        request.host = host;
        request.port = port;
        request.content = Some(Bytes::new());
        if let Some(auth) = proxy_authorization(&t.ctx.options) {
            request.headers = Headers::from_pairs([("Proxy-Authorization", auth)]);
        }
        request
    }

    fn proxy_name(t: &TunnelInfo) -> String {
        t.tunnel_connection
            .address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "upstream proxy".to_string())
    }
}

impl TunnelProtocol for UpstreamProxy {
    fn kind(&self) -> LayerKind {
        LayerKind::HttpUpstreamProxy
    }

    fn start_handshake(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<Handshake> {
        if !self.send_connect {
            return Ok(Handshake::Done);
        }
        let request = Self::connect_request(t);
        steps.emit(Command::send_data(&t.tunnel_connection, assemble_request_head(&request)));
        Ok(Handshake::Pending)
    }

    fn receive_handshake_data(
        &mut self,
        t: &TunnelInfo,
        data: Bytes,
        steps: &mut Steps,
    ) -> Result<Handshake> {
        if !self.send_connect {
            return Ok(Handshake::Done);
        }
        self.buf.extend_from_slice(&data);
        let proxy = Self::proxy_name(t);
        match read_response_head(&self.buf) {
            Ok(None) => Ok(Handshake::Pending),
            Err(e) => {
                steps.log(format!("{}: {}", proxy, e), Level::INFO);
                Ok(Handshake::Failed(format!("Error connecting to {}: {}", proxy, e)))
            }
            Ok(Some((response, len))) if (200..300).contains(&response.status_code) => {
                let _ = self.buf.split_to(len);
                if !self.buf.is_empty() {
                    let rest = self.buf.split().freeze();
                    self.receive_data(t, rest, steps)?;
                }
                Ok(Handshake::Done)
            }
            Ok(Some((response, len))) => {
                steps.log(
                    format!("{}: {:?}", proxy, String::from_utf8_lossy(&self.buf[..len])),
                    Level::DEBUG,
                );
                Ok(Handshake::Failed(format!(
                    "Upstream proxy {} refused HTTP CONNECT request: {} {}",
                    proxy, response.status_code, response.reason
                )))
            }
        }
    }
}

/// Wraps `child` so that everything it sends to `ctx.server` travels through
/// the proxy named in `ctx.server.via`. An `https://` proxy gets its own TLS
/// layer outside the tunnel.
pub fn make(
    ctx: &Context,
    send_connect: bool,
    child: impl FnOnce(Context) -> Box<dyn Layer>,
) -> Box<dyn Layer> {
    let via = ctx.server.read().via.clone();
    let Some(via) = via else {
        return child(ctx.clone());
    };
    let proxy = ConnectionRef::server(Some(via.address.clone()));
    let tunnel = |outer: Context, proxy: ConnectionRef| -> Box<dyn Layer> {
        let inner = outer.enter(LayerKind::HttpUpstreamProxy);
        let server = outer.server.clone();
        let layer = TunnelLayer::new(
            outer.clone(),
            proxy,
            server,
            UpstreamProxy::new(send_connect),
            child(inner),
        );
        layer.boxed(&outer)
    };
    if via.scheme == Scheme::Https {
        {
            let mut conn = proxy.write();
            conn.alpn_offers = HTTP1_ALPNS.iter().map(|a| a.to_vec()).collect();
            conn.sni = Some(via.address.host.clone());
        }
        let tls_proxy = proxy.clone();
        server_tls_over(ctx, tls_proxy, move |inner| tunnel(inner, proxy)).boxed(ctx)
    } else {
        tunnel(ctx.clone(), proxy)
    }
}
