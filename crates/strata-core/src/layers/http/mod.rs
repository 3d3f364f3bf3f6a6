//! HTTP/1 and HTTP/2 proxying.
//!
//! ## Architecture
//!
//! ```text
//!  DataReceived ─▶ connection handler ─ReceiveHttp─▶ HttpStream ─SendHttp─▶ connection handler ─▶ SendData
//!  (client)        (Http1/Http2 server)               (one per        (HttpClient ▸ Http1/Http2
//!                                                     exchange)        client, maybe tunnelled)
//! ```
//!
//! [`HttpLayer`] owns one handler per connection and one [`HttpStream`] per
//! exchange, and routes between them. Handlers only translate bytes into
//! [`HttpEvent`]s and back; all proxy semantics live in the stream.
//! Commands a child emits are either routed internally (HTTP commands) or
//! passed out; blocking ones are remembered so that their completion finds
//! its way back.

pub mod events;
pub mod http1;
pub mod http2;
pub mod upstream_proxy;

mod client;
mod stream;

pub use client::HttpClient;
pub use events::{ErrorCode, HttpEvent, StreamId, NO_RESPONSE};
pub use http1::Http1Connection;
pub use http2::Http2Connection;
pub use stream::HttpStream;

use std::collections::HashMap;

use crate::commands::{Command, CommandId, CommandKind, GetHttpConnection};
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{Event, Reply};
use crate::layer::{unexpected, Engine, Handler, Layer, LayerKind};
use crate::layers::tls::{server_tls_over, HTTP2_ALPN};
use crate::message::Request;
use crate::options::{Options, ProxyMode};

/// How requests find their destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    /// Absolute-form and CONNECT requests from a client configured to use us.
    Regular,
    /// The destination is already known from the surrounding context.
    Transparent,
    /// Like `Regular`, but every server is reached through another proxy.
    Upstream,
}

impl HttpMode {
    pub fn from_options(options: &Options) -> Self {
        match options.mode {
            ProxyMode::Regular => HttpMode::Regular,
            ProxyMode::Upstream(_) => HttpMode::Upstream,
            ProxyMode::Transparent | ProxyMode::Reverse(_) => HttpMode::Transparent,
        }
    }
}

/// Checks that a request makes sense in `mode`. Returns the reason if not.
pub fn validate_request(mode: HttpMode, request: &Request, check_headers: bool) -> Option<String> {
    if !matches!(request.scheme.as_str(), "http" | "https" | "") {
        return Some(format!("Invalid request scheme: {}", request.scheme));
    }
    if mode == HttpMode::Transparent && request.is_connect() {
        return Some(
            "received an HTTP CONNECT request even though it is not running in regular/upstream mode. \
             This usually indicates a misconfiguration of the proxy mode."
                .to_string(),
        );
    }
    if check_headers {
        return http1::validate_headers(&request.headers).err();
    }
    None
}

/// `host` or `host:port`, leaving out the scheme's default port.
pub fn hostport(scheme: &str, host: &str, port: u16) -> String {
    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };
    if port == default_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Who receives events for a connection or a command completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Handler(usize),
    Stream(StreamId),
}

type Waiters = Vec<(CommandId, GetHttpConnection)>;

/// Multiplexes HTTP exchanges over client and server connections.
#[derive(Debug)]
pub struct HttpLayer {
    ctx: Context,
    mode: HttpMode,
    handlers: Vec<Box<dyn Layer>>,
    connections: Vec<(ConnectionRef, Route)>,
    streams: HashMap<StreamId, Engine<HttpStream>>,
    command_sources: HashMap<CommandId, Route>,
    waiting_for_establishment: Vec<(ConnectionRef, Waiters)>,
}

impl HttpLayer {
    pub fn new(ctx: Context, mode: HttpMode) -> Self {
        Self {
            ctx,
            mode,
            handlers: Vec::new(),
            connections: Vec::new(),
            streams: HashMap::new(),
            command_sources: HashMap::new(),
            waiting_for_establishment: Vec::new(),
        }
    }

    pub fn mode(&self) -> HttpMode {
        self.mode
    }

    /// Number of exchanges still in progress.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn child_ctx(&self) -> Context {
        self.ctx.enter(LayerKind::Http)
    }

    fn route_of(&self, conn: &ConnectionRef) -> Option<Route> {
        self.connections
            .iter()
            .find(|(c, _)| c == conn)
            .map(|(_, route)| *route)
    }

    fn set_route(&mut self, conn: ConnectionRef, route: Route) {
        match self.connections.iter_mut().find(|(c, _)| *c == conn) {
            Some(entry) => entry.1 = route,
            None => self.connections.push((conn, route)),
        }
    }

    fn add_handler(&mut self, conn: ConnectionRef, handler: Box<dyn Layer>) -> Route {
        let route = Route::Handler(self.handlers.len());
        self.handlers.push(handler);
        self.set_route(conn, route);
        route
    }

    fn client_speaks_h2(&self) -> bool {
        self.ctx.client.alpn().as_deref() == Some(HTTP2_ALPN)
    }

    fn event_to_child(&mut self, route: Route, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let commands = match route {
            Route::Handler(index) => match self.handlers.get_mut(index) {
                Some(handler) => handler.handle_event(event)?,
                None => return Ok(()),
            },
            Route::Stream(stream_id) => match self.streams.get_mut(&stream_id) {
                Some(stream) => {
                    if stream.is_paused() {
                        if let Event::Http(HttpEvent::RequestProtocolError { message, .. }) = &event {
                            stream.handler_mut().note_remote_error(message.clone());
                        }
                    }
                    stream.handle_event(event)?
                }
                // Late data or errors for a finished exchange.
                None => return Ok(()),
            },
        };

        for command in commands {
            if command.is_blocking() || matches!(command.kind, CommandKind::RequestWakeup { .. }) {
                self.command_sources.insert(command.id, route);
            }
            let Command { id, blocking, kind } = command;
            match kind {
                CommandKind::ReceiveHttp(event) => {
                    if let HttpEvent::RequestHeaders { stream_id, request, .. } = &event {
                        self.make_stream(*stream_id, request.clone(), out)?;
                    }
                    let stream_id = event.stream_id();
                    if self.streams.contains_key(&stream_id) {
                        self.event_to_child(Route::Stream(stream_id), Event::Http(event), out)?;
                    }
                }
                CommandKind::SendHttp { event, connection } => match self.route_of(&connection) {
                    Some(target) => self.event_to_child(target, Event::Http(event), out)?,
                    None => {
                        return Err(unexpected(LayerKind::Http, "send_http", &Event::Http(event)));
                    }
                },
                CommandKind::DropStream(stream_id) => {
                    self.streams.remove(&stream_id);
                }
                CommandKind::GetHttpConnection(request) => {
                    self.get_connection(id, request, true, out)?;
                }
                CommandKind::RegisterHttpConnection { connection, err } => {
                    self.register_connection(connection, err, out)?;
                }
                CommandKind::OpenConnection { connection } => {
                    self.set_route(connection.clone(), route);
                    out.push(Command {
                        id,
                        blocking,
                        kind: CommandKind::OpenConnection { connection },
                    });
                }
                kind => out.push(Command { id, blocking, kind }),
            }
        }
        Ok(())
    }

    fn make_stream(&mut self, stream_id: StreamId, request: Request, out: &mut Vec<Command>) -> Result<()> {
        let ctx = self.child_ctx();
        let stream = HttpStream::new(ctx.clone(), stream_id, self.mode, request);
        self.streams.insert(stream_id, Engine::new(stream, &ctx));
        self.event_to_child(Route::Stream(stream_id), Event::Start, out)
    }

    fn reply_connection(
        &mut self,
        id: CommandId,
        result: std::result::Result<ConnectionRef, String>,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match self.command_sources.remove(&id) {
            Some(route) => self.event_to_child(route, Event::completed(id, Reply::HttpConnection(result)), out),
            None => Err(LayerError::UnexpectedReply {
                layer: LayerKind::Http,
                expected: "a pending GetHttpConnection",
                reply: "HttpConnection".to_string(),
            }),
        }
    }

    fn get_connection(
        &mut self,
        id: CommandId,
        request: GetHttpConnection,
        reuse: bool,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        if reuse {
            let candidates: Vec<ConnectionRef> = self
                .connections
                .iter()
                .map(|(conn, _)| conn.clone())
                .filter(|conn| request.matches(conn))
                .collect();
            for conn in candidates {
                if let Some((_, waiters)) = self
                    .waiting_for_establishment
                    .iter_mut()
                    .find(|(c, _)| *c == conn)
                {
                    waiters.push((id, request));
                    return Ok(());
                }
                let error = conn.read().error.clone();
                if let Some(err) = error {
                    return self.reply_connection(id, Err(err), out);
                }
                if conn.state() == ConnectionState::OPEN {
                    // HTTP/1 servers may answer with read-until-EOF bodies, so
                    // they cannot carry multiplexed HTTP/2 exchanges.
                    let h2_to_h1 = self.client_speaks_h2() && conn.alpn().as_deref() != Some(HTTP2_ALPN);
                    if !h2_to_h1 {
                        return self.reply_connection(id, Ok(conn), out);
                    }
                }
            }
        }

        let context_matches = self.route_of(&self.ctx.server).is_none() && request.matches(&self.ctx.server);
        if context_matches {
            let error = self.ctx.server.read().error.clone();
            if let Some(err) = error {
                return self.reply_connection(id, Err(err), out);
            }
        }
        let can_use_context = context_matches && self.ctx.server.state() == ConnectionState::OPEN;

        let mut ctx = self.child_ctx();
        let handler = if can_use_context {
            HttpClient::new(ctx.clone()).boxed(&ctx)
        } else {
            let server = ConnectionRef::server(Some(request.address.clone()));
            {
                let mut conn = server.write();
                conn.via = request.via.clone();
                if request.tls {
                    conn.sni = Some(self.upstream_sni(&request));
                }
            }
            ctx = ctx.with_server(server);
            let tls = request.tls;
            let inner = move |ctx: Context| -> Box<dyn Layer> {
                if tls {
                    let conn = ctx.server.clone();
                    server_tls_over(&ctx, conn, |inner| HttpClient::new(inner.clone()).boxed(&inner)).boxed(&ctx)
                } else {
                    HttpClient::new(ctx.clone()).boxed(&ctx)
                }
            };
            if request.via.is_some() {
                // Plain requests in upstream mode go in absolute form, everything
                // else needs a CONNECT first.
                let send_connect = tls || self.mode != HttpMode::Upstream;
                upstream_proxy::make(&ctx, send_connect, inner)
            } else {
                inner(ctx.clone())
            }
        };

        let server = ctx.server.clone();
        let route = self.add_handler(server.clone(), handler);
        self.waiting_for_establishment.push((server, vec![(id, request)]));
        self.event_to_child(route, Event::Start, out)
    }

    /// SNI for a new TLS server connection.
    fn upstream_sni(&self, request: &GetHttpConnection) -> String {
        if self.mode == HttpMode::Transparent && self.ctx.server.address().as_ref() == Some(&request.address) {
            // Transparent connections only know the IP; prefer a name.
            let server_sni = self.ctx.server.read().sni.clone();
            let client_sni = self.ctx.client.read().sni.clone();
            server_sni
                .or(client_sni)
                .unwrap_or_else(|| request.address.host.clone())
        } else {
            request.address.host.clone()
        }
    }

    fn register_connection(
        &mut self,
        connection: ConnectionRef,
        err: Option<String>,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        let Some(pos) = self
            .waiting_for_establishment
            .iter()
            .position(|(c, _)| *c == connection)
        else {
            return Ok(());
        };
        let (_, waiters) = self.waiting_for_establishment.remove(pos);
        let h2_to_h1 = err.is_none()
            && self.client_speaks_h2()
            && connection.alpn().as_deref() != Some(HTTP2_ALPN);
        let reply = match err {
            Some(e) => Err(e),
            None => Ok(connection),
        };

        let mut waiters = waiters.into_iter();
        if h2_to_h1 {
            // One exchange per HTTP/1 connection; the others get their own.
            if let Some((id, _)) = waiters.next() {
                self.reply_connection(id, reply, out)?;
            }
            for (id, request) in waiters {
                self.get_connection(id, request, false, out)?;
            }
        } else {
            for (id, _) in waiters {
                self.reply_connection(id, reply.clone(), out)?;
            }
        }
        Ok(())
    }

    fn start(&mut self, out: &mut Vec<Command>) -> Result<()> {
        let ctx = self.child_ctx();
        let client = self.ctx.client.clone();
        let route = match self.route_of(&client) {
            Some(route) => route,
            None => {
                let handler = if self.client_speaks_h2() {
                    Http2Connection::server(ctx.clone()).boxed(&ctx)
                } else {
                    Http1Connection::server(ctx.clone()).boxed(&ctx)
                };
                self.add_handler(client, handler)
            }
        };
        self.event_to_child(route, Event::Start, out)?;
        if let ProxyMode::Upstream(spec) = &self.ctx.options.mode {
            self.ctx.server.write().via = Some(spec.clone());
        }
        Ok(())
    }

    /// First data from a server nobody asked for yet, e.g. an HTTP/2
    /// SETTINGS frame right after the handshake.
    fn adopt_context_server(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let ctx = self.child_ctx();
        let handler = if self.ctx.server.alpn().as_deref() == Some(HTTP2_ALPN) {
            Http2Connection::client(ctx.clone()).boxed(&ctx)
        } else {
            Http1Connection::client(ctx.clone()).boxed(&ctx)
        };
        let route = self.add_handler(self.ctx.server.clone(), handler);
        self.event_to_child(route, Event::Start, out)?;
        self.event_to_child(route, event, out)
    }
}

impl Handler for HttpLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Http
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        match event {
            Event::Start => self.start(out),
            Event::CommandCompleted(completed) => match self.command_sources.remove(&completed.command) {
                Some(route) => self.event_to_child(route, Event::CommandCompleted(completed), out),
                None => Err(unexpected(LayerKind::Http, "route", &Event::CommandCompleted(completed))),
            },
            Event::MessageInjected(message) => {
                let flow_id = message.flow_id();
                let owner = self
                    .streams
                    .iter()
                    .find(|(_, s)| s.handler().flow().read().id == flow_id)
                    .map(|(id, _)| *id);
                match owner {
                    Some(stream_id) => {
                        self.event_to_child(Route::Stream(stream_id), Event::MessageInjected(message), out)
                    }
                    None => {
                        // TCP flows inside a CONNECT tunnel have their own ids;
                        // each upgraded stream checks the id itself.
                        let mut upgraded: Vec<StreamId> = self
                            .streams
                            .iter()
                            .filter(|(_, s)| s.handler().has_child())
                            .map(|(id, _)| *id)
                            .collect();
                        upgraded.sort_unstable();
                        for stream_id in upgraded {
                            self.event_to_child(Route::Stream(stream_id), Event::MessageInjected(message.clone()), out)?;
                        }
                        Ok(())
                    }
                }
            }
            event @ (Event::DataReceived { .. } | Event::ConnectionClosed { .. }) => {
                let Some(conn) = event.connection().cloned() else {
                    return Ok(());
                };
                match self.route_of(&conn) {
                    Some(route) => self.event_to_child(route, event, out),
                    None if conn == self.ctx.server => match event {
                        Event::ConnectionClosed { .. } => {
                            out.push(Command::close_connection(&conn));
                            Ok(())
                        }
                        event => self.adopt_context_server(event, out),
                    },
                    None => Err(unexpected(LayerKind::Http, "route", &event)),
                }
            }
            other => Err(unexpected(LayerKind::Http, "route", &other)),
        }
    }
}
