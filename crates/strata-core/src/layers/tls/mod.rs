//! TLS termination towards the client and origination towards the server.
//!
//! Both directions are [`TunnelLayer`]s over the same connection they
//! encrypt. The engine is not built here: a `tls_start` hook hands one in.
//!
//! ```text
//! ServerTls(server) ─▶ NextLayer ─▶ ClientTls(client) ─▶ NextLayer ─▶ ...
//! ```
//!
//! A client handshake first waits for a complete ClientHello, reports it
//! through `tls_clienthello` and may ask the parent to finish the server
//! handshake first (to mirror the server's ALPN choice, for example).

mod client_hello;
mod engine;

pub use client_hello::{
    get_client_hello, parse_client_hello, starts_like_tls_record, ClientHello, ClientHelloError,
};
#[cfg(any(test, feature = "test-util"))]
pub use client_hello::build_client_hello;
pub use engine::{client_config, provider, server_config, Plaintext, RustlsEngine, SessionInfo, TlsEngine};

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::Level;

use crate::commands::Command;
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{CommandCompleted, Event, Reply};
use crate::hooks::{ClientHelloData, Hook, TlsStartData};
use crate::layer::{Handler, Layer, LayerKind};
use crate::layers::next_layer::NextLayer;
use crate::layers::tunnel::{Handshake, Steps, TunnelInfo, TunnelLayer, TunnelProtocol, CLOSED_DURING_HANDSHAKE};

/// ALPN ids of the HTTP versions this proxy speaks.
pub const HTTP1_ALPNS: [&[u8]; 3] = [b"http/1.1", b"http/1.0", b"http/0.9"];
pub const HTTP2_ALPN: &[u8] = b"h2";

const CLOSED_EARLY: &str = "connection closed early";

/// A TLS layer; see [`server_tls`] and [`client_tls`].
pub type TlsLayer = TunnelLayer<TlsProtocol>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug)]
enum Pending {
    TlsStart,
    ClientHello,
    EstablishServer,
}

/// TLS over one connection, as a tunnel protocol.
pub struct TlsProtocol {
    side: Side,
    engine: Option<Box<dyn TlsEngine>>,
    /// Peer bytes held back until the ClientHello is complete or an engine
    /// exists.
    recv_buffer: BytesMut,
    /// Plaintext the child wrote before an engine existed.
    send_buffer: BytesMut,
    client_hello_parsed: bool,
    wait_for_clienthello: bool,
    close_notify_received: bool,
    pending: Option<Pending>,
}

impl TlsProtocol {
    fn new(side: Side) -> Self {
        Self {
            side,
            engine: None,
            recv_buffer: BytesMut::new(),
            send_buffer: BytesMut::new(),
            client_hello_parsed: false,
            wait_for_clienthello: false,
            close_notify_received: false,
            pending: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Asks the `tls_start` hook for an engine.
    fn start_tls(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Handshake {
        let hook = Hook::TlsStart(TlsStartData {
            context: t.ctx.clone(),
            conn: t.conn.clone(),
            engine: None,
        });
        self.pending = Some(Pending::TlsStart);
        steps.emit(Command::hook(hook));
        Handshake::Blocked
    }


    fn flush(&mut self, t: &TunnelInfo, steps: &mut Steps) {
        if let Some(engine) = self.engine.as_mut() {
            let out = engine.take_outgoing();
            if !out.is_empty() {
                steps.emit(Command::send_data(&t.tunnel_connection, out));
            }
        }
    }

    /// Feeds handshake bytes and reports where the handshake stands.
    fn negotiate(&mut self, t: &TunnelInfo, data: &[u8], steps: &mut Steps) -> Result<Handshake> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(Handshake::Failed("No TLS context was provided".to_string()));
        };
        let fed = engine.feed(data);
        let handshaking = engine.is_handshaking();
        let info = engine.session_info();
        self.flush(t, steps);
        if let Err(err) = fed {
            return Ok(Handshake::Failed(err.to_string()));
        }
        if handshaking {
            return Ok(Handshake::Pending);
        }

        {
            let mut conn = t.conn.write();
            conn.tls_established = true;
            conn.timestamp_tls_setup = Some(chrono::Utc::now());
            conn.alpn = info.alpn;
            if info.sni.is_some() {
                conn.sni = info.sni;
            }
            conn.cipher = info.cipher;
            conn.tls_version = info.tls_version;
            conn.certificate_list = info.peer_certificates;
        }
        steps.log(format!("TLS established: {:?}", t.conn), Level::DEBUG);
        self.receive_data(t, Bytes::new(), steps)?;
        Ok(Handshake::Done)
    }

    fn on_client_hello(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<Handshake> {
        let hello = match parse_client_hello(&self.recv_buffer) {
            Ok(Some(hello)) => hello,
            Ok(None) => return Ok(Handshake::Pending),
            Err(_) => {
                return Ok(Handshake::Failed(format!(
                    "Cannot parse ClientHello: {}",
                    hex(&self.recv_buffer)
                )))
            }
        };
        self.client_hello_parsed = true;
        {
            let mut conn = t.conn.write();
            conn.sni = hello.sni.clone();
            conn.alpn_offers = hello.alpn_protocols.clone();
            conn.cipher_list = hello
                .cipher_suites
                .iter()
                .map(|suite| format!("{:#06x}", suite))
                .collect();
        }
        let hook = Hook::TlsClienthello(ClientHelloData {
            context: t.ctx.clone(),
            client_hello: hello,
            establish_server_tls_first: false,
        });
        self.pending = Some(Pending::ClientHello);
        steps.emit(Command::hook(hook));
        Ok(Handshake::Blocked)
    }

    fn client_error_message(&self, t: &TunnelInfo, err: &str) -> (Option<String>, Level) {
        let dest = t
            .conn
            .read()
            .sni
            .clone()
            .or_else(|| t.ctx.server.address().map(|a| a.to_string()))
            .unwrap_or_else(|| "unknown destination".to_string());
        if err.starts_with("Cannot parse ClientHello") {
            (Some(err.to_string()), Level::WARN)
        } else if err == CLOSED_EARLY {
            (None, Level::WARN)
        } else if err == CLOSED_DURING_HANDSHAKE {
            (
                Some(format!(
                    "The client disconnected during the handshake. If this happens consistently for {}, \
                     this may indicate that the client does not trust the proxy's certificate.",
                    dest
                )),
                Level::INFO,
            )
        } else if ["unknown ca", "bad certificate", "certificate unknown"]
            .iter()
            .any(|needle| err.contains(needle))
        {
            (
                Some(format!("The client does not trust the proxy's certificate for {} ({})", dest, err)),
                Level::WARN,
            )
        } else {
            (
                Some(format!("The client may not trust the proxy's certificate for {} ({})", dest, err)),
                Level::WARN,
            )
        }
    }
}

impl TunnelProtocol for TlsProtocol {
    fn kind(&self) -> LayerKind {
        match self.side {
            Side::Client => LayerKind::ClientTls,
            Side::Server => LayerKind::ServerTls,
        }
    }

    fn start_handshake(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<Handshake> {
        match self.side {
            Side::Client => Ok(Handshake::Pending),
            Side::Server => Ok(self.start_tls(t, steps)),
        }
    }

    fn receive_handshake_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<Handshake> {
        if self.side == Side::Client && !self.client_hello_parsed {
            self.recv_buffer.extend_from_slice(&data);
            return self.on_client_hello(t, steps);
        }
        if self.engine.is_none() {
            // Still waiting for an engine; keep the bytes for later.
            self.recv_buffer.extend_from_slice(&data);
            return Ok(Handshake::Pending);
        }
        self.negotiate(t, &data, steps)
    }

    fn resume(&mut self, t: &TunnelInfo, completed: CommandCompleted, steps: &mut Steps) -> Result<Handshake> {
        match (self.pending.take(), completed.reply) {
            (Some(Pending::ClientHello), Reply::Hook(Hook::TlsClienthello(data))) => {
                if data.establish_server_tls_first && !t.ctx.server.tls_established() {
                    self.pending = Some(Pending::EstablishServer);
                    steps.emit(Command::establish_server_tls(&t.ctx.server));
                    return Ok(Handshake::Blocked);
                }
                Ok(self.start_tls(t, steps))
            }
            (Some(Pending::EstablishServer), Reply::EstablishServerTls(err)) => {
                if let Some(err) = err {
                    steps.log(
                        format!(
                            "Unable to establish TLS connection with server ({}). \
                             Trying to establish TLS with client anyway. If you plan to redirect \
                             requests away from this server, consider setting `connection_strategy` \
                             to `lazy` to suppress early connections.",
                            err
                        ),
                        Level::WARN,
                    );
                }
                Ok(self.start_tls(t, steps))
            }
            (Some(Pending::TlsStart), Reply::Hook(Hook::TlsStart(data))) => {
                self.engine = data.engine;
                if self.engine.is_none() {
                    steps.log("No TLS context was provided, failing connection.", Level::ERROR);
                    return Ok(Handshake::Failed("No TLS context was provided".to_string()));
                }
                if self.side == Side::Client && !t.conn.connected() {
                    return Ok(Handshake::Failed(CLOSED_EARLY.to_string()));
                }
                if !self.send_buffer.is_empty() {
                    let early = self.send_buffer.split().freeze();
                    if let Some(Err(err)) = self.engine.as_mut().map(|e| e.write_plaintext(&early)) {
                        return Ok(Handshake::Failed(err.to_string()));
                    }
                }
                let buffered = self.recv_buffer.split().freeze();
                self.negotiate(t, &buffered, steps)
            }
            (_, reply) => Err(LayerError::UnexpectedReply {
                layer: self.kind(),
                expected: "tls hook or EstablishServerTls",
                reply: reply.name().to_string(),
            }),
        }
    }

    fn on_handshake_error(&mut self, t: &TunnelInfo, err: &str, steps: &mut Steps) -> Result<()> {
        let message = match self.side {
            Side::Server => {
                steps.log(format!("Server TLS handshake failed. {}", err), Level::WARN);
                err.to_string()
            }
            Side::Client => {
                let (message, level) = self.client_error_message(t, err);
                if let Some(message) = &message {
                    steps.log(format!("Client TLS handshake failed. {}", message), level);
                }
                message.unwrap_or_else(|| err.to_string())
            }
        };
        t.conn.write().error = Some(message);
        steps.emit(Command::close_connection(&t.tunnel_connection));
        Ok(())
    }

    fn receive_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<()> {
        // Only an inactive tunnel gets here without an engine. The bytes wait
        // for the handshake and never reach the child in the clear.
        let Some(engine) = self.engine.as_mut() else {
            self.recv_buffer.extend_from_slice(&data);
            return Ok(());
        };
        if let Err(err) = engine.feed(&data) {
            steps.log(format!("TLS Error: {}", err), Level::WARN);
        }
        let plaintext = engine.read_plaintext();
        self.flush(t, steps);

        match plaintext {
            Ok(plaintext) => {
                if !plaintext.data.is_empty() {
                    steps.to_child(Event::data_received(&t.conn, plaintext.data));
                }
                if plaintext.closed && !self.close_notify_received {
                    self.close_notify_received = true;
                    t.conn.clear_state(ConnectionState::CAN_READ);
                    steps.log(format!("close_notify {:?}", t.conn), Level::DEBUG);
                    steps.to_child(Event::connection_closed(&t.conn));
                }
            }
            Err(err) => steps.log(format!("TLS Error: {}", err), Level::WARN),
        }
        Ok(())
    }

    fn receive_close(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<()> {
        if !self.close_notify_received {
            steps.to_child(Event::connection_closed(&t.conn));
        }
        Ok(())
    }

    fn send_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            self.send_buffer.extend_from_slice(&data);
            return Ok(());
        };
        let written = engine.write_plaintext(&data);
        self.flush(t, steps);
        if let Err(err) = written {
            steps.log(format!("TLS Error: {}, dropping {} bytes.", err, data.len()), Level::WARN);
            steps.emit(Command::close_connection(&t.tunnel_connection));
        }
        Ok(())
    }

    fn send_close(&mut self, t: &TunnelInfo, half_close: bool, steps: &mut Steps) -> Result<()> {
        if let Some(engine) = self.engine.as_mut() {
            engine.send_close_notify();
            self.flush(t, steps);
        }
        steps.emit(if half_close {
            Command::half_close(&t.tunnel_connection)
        } else {
            Command::close_connection(&t.tunnel_connection)
        });
        Ok(())
    }

    fn established(&self, _t: &TunnelInfo) -> bool {
        self.engine.as_ref().is_some_and(|e| !e.is_handshaking())
    }

    fn prepare_establish(&mut self, t: &TunnelInfo) {
        t.conn.write().tls = true;
    }

    fn handshake_on_start(&self) -> bool {
        !self.wait_for_clienthello
    }
}

impl fmt::Debug for TlsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProtocol")
            .field("side", &self.side)
            .field("engine", &self.engine.is_some())
            .field("client_hello_parsed", &self.client_hello_parsed)
            .field("pending", &self.pending)
            .finish()
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// TLS towards `ctx.server` with protocol detection beneath. If the server
/// is already connected, the handshake waits until the layers below ask for
/// the connection, so that a client's ClientHello can shape it.
pub fn server_tls(ctx: &Context) -> TlsLayer {
    let inner = ctx.enter(LayerKind::ServerTls);
    let child = NextLayer::new(inner.clone()).boxed(&inner);
    let mut proto = TlsProtocol::new(Side::Server);
    proto.wait_for_clienthello = true;
    ctx.server.write().tls = true;
    TunnelLayer::new(ctx.clone(), ctx.server.clone(), ctx.server.clone(), proto, child)
}

/// TLS towards `conn`, wrapping a child built for the inner context.
pub fn server_tls_over(
    ctx: &Context,
    conn: ConnectionRef,
    child: impl FnOnce(Context) -> Box<dyn Layer>,
) -> TlsLayer {
    let inner = ctx.enter(LayerKind::ServerTls);
    conn.write().tls = true;
    TunnelLayer::new(ctx.clone(), conn.clone(), conn, TlsProtocol::new(Side::Server), child(inner))
}

/// TLS termination for the client. Must sit directly beneath a server TLS
/// layer.
pub fn client_tls(ctx: &Context) -> Result<TlsLayer> {
    if ctx.parent_kind() != Some(LayerKind::ServerTls) {
        return Err(LayerError::MissingParent {
            layer: LayerKind::ClientTls,
            required: LayerKind::ServerTls,
            found: ctx.parent_kind(),
        });
    }
    {
        let mut client = ctx.client.write();
        if client.tls {
            // TLS over TLS: only the inner session is kept.
            client.alpn = None;
            client.cipher = None;
            client.sni = None;
            client.timestamp_tls_setup = None;
            client.tls_version = None;
            client.certificate_list.clear();
            client.alpn_offers.clear();
            client.cipher_list.clear();
            client.tls_established = false;
        }
        client.tls = true;
    }
    let inner = ctx.enter(LayerKind::ClientTls);
    let child = NextLayer::new(inner.clone()).boxed(&inner);
    Ok(TunnelLayer::new(
        ctx.clone(),
        ctx.client.clone(),
        ctx.client.clone(),
        TlsProtocol::new(Side::Client),
        child,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::error::TlsError;
    use crate::layer::Engine;
    use crate::layers::tunnel::TunnelState;
    use crate::testing::*;
    use std::sync::Arc;

    fn client_stack() -> (Engine<TlsLayer>, Context) {
        let ctx = context_to("example.com", 443).enter(LayerKind::ServerTls);
        let layer = client_tls(&ctx).unwrap();
        (Engine::new(layer, &ctx), ctx)
    }

    fn supply_engine(command: Command, engine: Box<dyn TlsEngine>) -> Event {
        reply_hook_with(command, |hook| match hook {
            Hook::TlsStart(data) => data.engine = Some(engine),
            other => panic!("expected tls_start, got {:?}", other.name()),
        })
    }

    #[test]
    fn client_tls_requires_server_tls_parent() {
        let ctx = context();
        assert!(matches!(
            client_tls(&ctx),
            Err(LayerError::MissingParent { layer: LayerKind::ClientTls, .. })
        ));
    }

    #[test]
    fn garbage_instead_of_clienthello_closes_client() {
        let (mut layer, ctx) = client_stack();
        feed(&mut layer, Event::Start);
        let commands = feed(&mut layer, Event::data_received(&ctx.client, "GET / HTTP/1.1\r\n\r\n"));
        assert!(closes(&commands, &ctx.client));
        assert!(ctx.client.read().error.as_deref().unwrap().starts_with("Cannot parse ClientHello"));
        assert_eq!(layer.handler().state(), TunnelState::Closed);
    }

    #[test]
    fn clienthello_is_reported_then_engine_requested() {
        let (mut layer, ctx) = client_stack();
        feed(&mut layer, Event::Start);

        let hello = build_client_hello(Some("example.com"), &[b"h2"]);
        let (a, b) = hello.split_at(10);
        assert!(feed(&mut layer, Event::data_received(&ctx.client, a.to_vec())).is_empty());
        let mut commands = feed(&mut layer, Event::data_received(&ctx.client, b.to_vec()));
        let hook = take_blocking(&mut commands);
        assert!(matches!(&hook.kind, CommandKind::Hook(Hook::TlsClienthello(d)) if d.client_hello.sni.as_deref() == Some("example.com")));
        assert_eq!(ctx.client.read().alpn_offers, vec![b"h2".to_vec()]);

        let mut commands = feed(&mut layer, reply_hook(hook));
        let start = take_blocking(&mut commands);
        assert!(matches!(&start.kind, CommandKind::Hook(Hook::TlsStart(d)) if d.conn == ctx.client));

        // Declining to supply an engine fails the connection.
        let commands = feed(&mut layer, reply_hook(start));
        assert!(closes(&commands, &ctx.client));
    }

    #[test]
    fn establish_server_first_asks_parent() {
        let (mut layer, ctx) = client_stack();
        feed(&mut layer, Event::Start);
        let hello = build_client_hello(Some("example.com"), &[]);
        let mut commands = feed(&mut layer, Event::data_received(&ctx.client, hello));
        let hook = take_blocking(&mut commands);
        let mut commands = feed(
            &mut layer,
            reply_hook_with(hook, |h| {
                if let Hook::TlsClienthello(d) = h {
                    d.establish_server_tls_first = true;
                }
            }),
        );
        let establish = take_blocking(&mut commands);
        assert!(matches!(&establish.kind, CommandKind::EstablishServerTls { connection } if *connection == ctx.server));

        // A failure is logged, not fatal.
        let mut commands = feed(
            &mut layer,
            Event::completed(establish.id, Reply::EstablishServerTls(Some("refused".into()))),
        );
        let start = take_blocking(&mut commands);
        assert!(matches!(&start.kind, CommandKind::Hook(Hook::TlsStart(_))));
    }

    #[test]
    fn full_client_handshake_with_rustls() {
        let (server_cfg, client_cfg) = engine::tests::configs("example.com", &[b"http/1.1"]);
        let (mut layer, ctx) = client_stack();
        feed(&mut layer, Event::Start);

        let mut peer = RustlsEngine::client(client_cfg, "example.com").unwrap();
        let hello = peer.take_outgoing();
        let mut commands = feed(&mut layer, Event::data_received(&ctx.client, hello));
        let hook = take_blocking(&mut commands);
        let mut commands = feed(&mut layer, reply_hook(hook));
        let start = take_blocking(&mut commands);
        let engine = RustlsEngine::server(Arc::clone(&server_cfg)).unwrap();
        let mut commands = feed(&mut layer, supply_engine(start, Box::new(engine)));

        // Shuttle bytes until both sides are done.
        for _ in 0..4 {
            let flight = sent(&commands, &ctx.client);
            if flight.is_empty() {
                break;
            }
            peer.feed(&flight).unwrap();
            let answer = peer.take_outgoing();
            if answer.is_empty() {
                break;
            }
            commands = feed(&mut layer, Event::data_received(&ctx.client, answer));
        }
        assert!(!peer.is_handshaking());
        assert_eq!(layer.handler().state(), TunnelState::Open);
        let client = ctx.client.read();
        assert!(client.tls_established);
        assert_eq!(client.sni.as_deref(), Some("example.com"));
        assert_eq!(client.alpn.as_deref(), Some(&b"http/1.1"[..]));
    }

    #[test]
    fn server_tls_over_opens_then_handshakes() {
        let ctx = context_to("example.com", 443);
        let server = ctx.server.clone();
        let child_ctx = ctx.clone();
        let mut layer = Engine::new(
            server_tls_over(&ctx, server.clone(), move |inner| {
                crate::layers::tcp::TcpLayer::new(inner, true).boxed(&child_ctx)
            }),
            &ctx,
        );
        let mut commands = feed(&mut layer, Event::Start);
        let open = take_blocking(&mut commands);
        assert!(matches!(&open.kind, CommandKind::OpenConnection { connection } if *connection == server));
        let mut commands = feed(&mut layer, reply_open(&open, None));
        let start = take_blocking(&mut commands);
        assert!(matches!(&start.kind, CommandKind::Hook(Hook::TlsStart(d)) if d.conn == server));
        assert!(server.tls());
    }

    #[derive(Default)]
    struct Wire {
        fed: Vec<u8>,
        outgoing: Vec<u8>,
        refuse_writes: bool,
    }

    /// Stands in for a finished TLS session; "encrypts" by upper-casing.
    struct Scripted(Arc<parking_lot::Mutex<Wire>>);

    impl TlsEngine for Scripted {
        fn feed(&mut self, ciphertext: &[u8]) -> std::result::Result<(), TlsError> {
            self.0.lock().fed.extend_from_slice(ciphertext);
            Ok(())
        }

        fn is_handshaking(&self) -> bool {
            false
        }

        fn take_outgoing(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.0.lock().outgoing)
        }

        fn read_plaintext(&mut self) -> std::result::Result<Plaintext, TlsError> {
            Ok(Plaintext::default())
        }

        fn write_plaintext(&mut self, data: &[u8]) -> std::result::Result<(), TlsError> {
            let mut wire = self.0.lock();
            if wire.refuse_writes {
                return Err(TlsError::Other("connection reset".to_string()));
            }
            wire.outgoing.extend(data.iter().map(u8::to_ascii_uppercase));
            Ok(())
        }

        fn send_close_notify(&mut self) {}

        fn session_info(&self) -> SessionInfo {
            SessionInfo::default()
        }
    }

    /// Writes to the server on start. The first client bytes ask for server
    /// TLS, later ones are relayed to the server.
    #[derive(Debug)]
    struct EagerWriter {
        ctx: Context,
        asked: bool,
    }

    impl Handler for EagerWriter {
        fn kind(&self) -> LayerKind {
            LayerKind::Tcp
        }

        fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
            match event {
                Event::Start => out.push(Command::send_data(&self.ctx.server, "secret")),
                Event::DataReceived { connection, data } if connection == self.ctx.client => {
                    if self.asked {
                        out.push(Command::send_data(&self.ctx.server, data));
                    } else {
                        self.asked = true;
                        out.push(Command::establish_server_tls(&self.ctx.server));
                    }
                }
                Event::DataReceived { data, .. } => out.push(Command::send_data(&self.ctx.client, data)),
                _ => {}
            }
            Ok(())
        }
    }

    fn eager_stack() -> (Engine<TlsLayer>, Context) {
        let ctx = context_to("example.com", 443);
        ctx.server.set_state(ConnectionState::OPEN);
        let inner = ctx.enter(LayerKind::ServerTls);
        let mut proto = TlsProtocol::new(Side::Server);
        proto.wait_for_clienthello = true;
        let child = EagerWriter {
            ctx: inner.clone(),
            asked: false,
        }
        .boxed(&inner);
        let layer = TunnelLayer::new(ctx.clone(), ctx.server.clone(), ctx.server.clone(), proto, child);
        (Engine::new(layer, &ctx), ctx)
    }

    /// Runs the handshake of [`eager_stack`] against a [`Scripted`] engine.
    fn establish(layer: &mut Engine<TlsLayer>, ctx: &Context, wire: &Arc<parking_lot::Mutex<Wire>>) -> Vec<Command> {
        let mut commands = feed(layer, Event::data_received(&ctx.client, "go"));
        let start = take_blocking(&mut commands);
        assert!(matches!(&start.kind, CommandKind::Hook(Hook::TlsStart(d)) if d.conn == ctx.server));
        feed(layer, supply_engine(start, Box::new(Scripted(Arc::clone(wire)))))
    }

    #[test]
    fn nothing_crosses_in_the_clear_before_an_engine_exists() {
        let (mut layer, ctx) = eager_stack();
        let commands = feed(&mut layer, Event::Start);
        assert!(sent(&commands, &ctx.server).is_empty());
        let commands = feed(&mut layer, Event::data_received(&ctx.server, "plain"));
        assert!(sent(&commands, &ctx.client).is_empty());
        assert_eq!(layer.handler().state(), TunnelState::Inactive);

        let wire = Arc::new(parking_lot::Mutex::new(Wire::default()));
        let commands = establish(&mut layer, &ctx, &wire);
        assert_eq!(sent(&commands, &ctx.server), b"SECRET");
        assert_eq!(wire.lock().fed, b"plain");
        assert_eq!(layer.handler().state(), TunnelState::Open);
        assert!(ctx.server.tls_established());
    }

    #[test]
    fn failed_encrypted_write_closes_the_connection() {
        let (mut layer, ctx) = eager_stack();
        feed(&mut layer, Event::Start);
        let wire = Arc::new(parking_lot::Mutex::new(Wire::default()));
        establish(&mut layer, &ctx, &wire);

        wire.lock().refuse_writes = true;
        let commands = feed(&mut layer, Event::data_received(&ctx.client, "more"));
        assert!(sent(&commands, &ctx.server).is_empty());
        assert!(closes(&commands, &ctx.server));
    }
}
