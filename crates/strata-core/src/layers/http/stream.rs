//! One request/response exchange, from the request head to the upgrade or
//! the last response byte.
//!
//! The stream never touches the wire. It receives [`HttpEvent`]s from the
//! connection handler of the client, asks the HTTP layer for a server
//! connection, and emits `SendHttp` commands for both sides. Every hook is a
//! blocking command; the step that follows it is stored in `waiting`.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::Method;
use tracing::Level;

use crate::commands::{Command, CommandId, CommandKind, GetHttpConnection};
use crate::connection::{Address, ConnectionRef};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{Event, Reply};
use crate::flow::{FlowError, HttpFlow, Shared, WebSocketData};
use crate::hooks::{Hook, HookName};
use crate::layer::{unexpected, Handler, Layer, LayerKind};
use crate::layers::next_layer::NextLayer;
use crate::layers::tcp::TcpLayer;
use crate::layers::websocket::WebSocketLayer;
use crate::message::{Headers, Request, Response};
use crate::options::{ConnectionStrategy, ProxyMode};

use super::events::{ErrorCode, HttpEvent, StreamId};
use super::http1::{expected_body_size, parse_authority, validate_headers, BodySize, SERVER_CLOSED};
use super::{hostport, upstream_proxy, validate_request, HttpMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Start,
    WaitForRequestHeaders,
    StreamRequestBody,
    ConsumeRequestBody,
    Done,
    Errored,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Start => "start",
            ClientState::WaitForRequestHeaders => "wait_for_request_headers",
            ClientState::StreamRequestBody => "stream_request_body",
            ClientState::ConsumeRequestBody => "consume_request_body",
            ClientState::Done => "done",
            ClientState::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Start,
    WaitForResponseHeaders,
    StreamResponseBody,
    ConsumeResponseBody,
    Done,
    Errored,
}

impl ServerState {
    fn name(&self) -> &'static str {
        match self {
            ServerState::Start => "start",
            ServerState::WaitForResponseHeaders => "wait_for_response_headers",
            ServerState::StreamResponseBody => "stream_response_body",
            ServerState::ConsumeResponseBody => "consume_response_body",
            ServerState::Done => "done",
            ServerState::Errored => "errored",
        }
    }
}

/// What to send once the server connection is known.
#[derive(Debug)]
enum AfterConnect {
    /// The request head; the body follows as it arrives.
    StreamRequest,
    /// Like `StreamRequest`, with part of the body already buffered.
    StreamBuffered(Bytes),
    /// The complete request.
    SendRequest,
}

/// How the exchange ends once the error hook returns.
#[derive(Debug)]
enum AfterError {
    Reject {
        message: String,
        code: ErrorCode,
        notify_server: bool,
    },
    Killed,
    ProtocolError {
        event: HttpEvent,
        client_errored: bool,
    },
}

#[derive(Debug)]
enum Next {
    /// A headers hook that must precede the error hook.
    HeadersThenError(AfterError),
    RequestHeaders { end_stream: bool },
    Request,
    StreamedRequest,
    /// `responseheaders` for a response a hook supplied.
    SyntheticResponseHeaders,
    ResponseHeaders { end_stream: bool },
    Response { already_streamed: bool },
    Connect,
    ConnectOpen,
    Connection(AfterConnect),
    Error(AfterError),
}

/// Runs one [`HttpFlow`].
#[derive(Debug)]
pub struct HttpStream {
    ctx: Context,
    stream_id: StreamId,
    mode: HttpMode,
    flow: Shared<HttpFlow>,
    client_state: ClientState,
    server_state: ServerState,
    request_body: BytesMut,
    response_body: BytesMut,
    waiting: Option<(CommandId, Next)>,
    /// Set once the exchange became a tunnel or an upgraded connection.
    child: Option<Box<dyn Layer>>,
    killed_by_remote: Option<String>,
    error_hook_fired: bool,
    retried: bool,
}

impl HttpStream {
    pub fn new(ctx: Context, stream_id: StreamId, mode: HttpMode, request: Request) -> Self {
        let flow = HttpFlow::new(ctx.client.clone(), ctx.server.clone(), request).shared();
        Self {
            ctx,
            stream_id,
            mode,
            flow,
            client_state: ClientState::Start,
            server_state: ServerState::Start,
            request_body: BytesMut::new(),
            response_body: BytesMut::new(),
            waiting: None,
            child: None,
            killed_by_remote: None,
            error_hook_fired: false,
            retried: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn flow(&self) -> &Shared<HttpFlow> {
        &self.flow
    }

    /// True once the exchange turned into a tunnel or an upgraded connection.
    pub(crate) fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// The client gave up while a hook was running.
    pub(crate) fn note_remote_error(&mut self, message: String) {
        self.killed_by_remote.get_or_insert(message);
    }

    fn to_client(&self, event: HttpEvent) -> Command {
        Command::send_http(event, &self.ctx.client)
    }

    fn to_server(&self, event: HttpEvent) -> Command {
        Command::send_http(event, &self.ctx.server)
    }

    fn block(&mut self, command: Command, next: Next, out: &mut Vec<Command>) {
        self.waiting = Some((command.id, next));
        out.push(command);
    }

    fn hook(&mut self, name: HookName, next: Next, out: &mut Vec<Command>) {
        let command = Command::hook(Hook::Http(name, self.flow.clone()));
        self.block(command, next, out);
    }

    fn error_hook(&mut self, then: AfterError, out: &mut Vec<Command>) {
        self.error_hook_fired = true;
        self.hook(HookName::Error, Next::Error(then), out);
    }

    fn set_error(&self, message: &str) {
        let mut flow = self.flow.write();
        if !flow.killed() {
            flow.error = Some(FlowError::new(message));
        }
    }

    fn resume(&mut self, next: Next, reply: Reply, out: &mut Vec<Command>) -> Result<()> {
        match (next, reply) {
            (Next::Connection(after), Reply::HttpConnection(result)) => self.connected(after, result, out),
            (Next::ConnectOpen, Reply::OpenConnection(err)) => self.connect_opened(err, out),
            (Next::Connection(_) | Next::ConnectOpen, reply) => Err(LayerError::UnexpectedReply {
                layer: LayerKind::HttpStream,
                expected: "OpenConnection or HttpConnection",
                reply: reply.name().to_string(),
            }),
            (next, Reply::Hook(_)) => self.after_hook(next, out),
            (_, reply) => Err(LayerError::UnexpectedReply {
                layer: LayerKind::HttpStream,
                expected: "Hook",
                reply: reply.name().to_string(),
            }),
        }
    }

    fn after_hook(&mut self, next: Next, out: &mut Vec<Command>) -> Result<()> {
        match next {
            Next::HeadersThenError(then) => self.error_hook(then, out),
            Next::RequestHeaders { end_stream } => self.after_request_headers(end_stream, out),
            Next::Request => self.after_request(out),
            Next::StreamedRequest => self.after_streamed_request(out)?,
            Next::SyntheticResponseHeaders => {
                if !self.check_killed(out) {
                    self.send_response(false, out);
                }
            }
            Next::ResponseHeaders { end_stream } => self.after_response_headers(end_stream, out),
            Next::Response { already_streamed } => self.after_response(already_streamed, out)?,
            Next::Connect => self.after_connect(out)?,
            Next::Error(then) => match then {
                AfterError::Reject {
                    message,
                    code,
                    notify_server,
                } => self.reject(message, code, notify_server, out),
                AfterError::Killed => self.send_kill(out),
                AfterError::ProtocolError {
                    event,
                    client_errored,
                } => self.finish_protocol_error(event, client_errored, out),
            },
            Next::ConnectOpen | Next::Connection(_) => {
                return Err(LayerError::UnexpectedReply {
                    layer: LayerKind::HttpStream,
                    expected: "OpenConnection or HttpConnection",
                    reply: "Hook".to_string(),
                })
            }
        }
        Ok(())
    }

    // Client side.

    fn client_event(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match (self.client_state, event) {
            (
                ClientState::WaitForRequestHeaders,
                HttpEvent::RequestHeaders {
                    request, end_stream, ..
                },
            ) => self.request_headers(request, end_stream, out),
            (ClientState::StreamRequestBody, event) => self.stream_request_body(event, out),
            (ClientState::ConsumeRequestBody, event) => self.consume_request_body(event, out),
            (ClientState::Errored, _) => Ok(()),
            (state, event) => Err(unexpected(LayerKind::HttpStream, state.name(), &Event::Http(event))),
        }
    }

    fn request_headers(&mut self, request: Request, end_stream: bool, out: &mut Vec<Command>) -> Result<()> {
        {
            let mut flow = self.flow.write();
            flow.request = request;
            flow.live = true;
        }
        if self.check_invalid(true, out) {
            return Ok(());
        }
        if self.flow.read().request.is_connect() {
            self.client_state = ClientState::Done;
            self.hook(HookName::HttpConnect, Next::Connect, out);
            return Ok(());
        }
        if !self.resolve_destination(out) {
            return Ok(());
        }
        {
            let options = &self.ctx.options;
            let mut flow = self.flow.write();
            let request = &mut flow.request;
            if self.mode == HttpMode::Regular && !request.is_http2() {
                // Origin form for HTTP/1; not every server accepts absolute form.
                request.authority.clear();
            }
            if matches!(options.mode, ProxyMode::Reverse(_)) && !options.keep_host_header {
                let host = hostport(&request.scheme, &request.host, request.port);
                request.set_host_header(host);
            }
            if self.mode == HttpMode::Upstream && request.scheme == "http" {
                // Plain requests go to the upstream proxy without a CONNECT.
                if let Some(auth) = upstream_proxy::proxy_authorization(options) {
                    request.headers.insert("Proxy-Authorization", auth);
                }
            }
        }
        if !end_stream && self.check_body_size(true, out) {
            return Ok(());
        }
        self.hook(HookName::Requestheaders, Next::RequestHeaders { end_stream }, out);
        Ok(())
    }

    /// Fills in host, port and scheme. Returns false if the request was
    /// rejected.
    fn resolve_destination(&mut self, out: &mut Vec<Command>) -> bool {
        if self.mode == HttpMode::Transparent {
            let (address, tls) = {
                let server = self.ctx.server.read();
                (server.address.clone(), server.tls)
            };
            return match address {
                Some(address) => {
                    let mut flow = self.flow.write();
                    flow.request.host = address.host;
                    flow.request.port = address.port;
                    flow.request.scheme = if tls { "https" } else { "http" }.to_string();
                    true
                }
                None => {
                    self.destination_unknown(out);
                    false
                }
            };
        }
        if !self.flow.read().request.host.is_empty() {
            return true;
        }
        let authority = self.flow.read().request.host_header().map(parse_authority);
        match authority {
            Some(Ok((host, port))) => {
                let tls = self.ctx.client.tls();
                let mut flow = self.flow.write();
                flow.request.host = host;
                flow.request.port = port.unwrap_or(if tls { 443 } else { 80 });
                flow.request.scheme = if tls { "https" } else { "http" }.to_string();
                true
            }
            _ => {
                self.destination_unknown(out);
                false
            }
        }
    }

    fn destination_unknown(&mut self, out: &mut Vec<Command>) {
        out.push(self.to_client(HttpEvent::ResponseProtocolError {
            stream_id: self.stream_id,
            message: "HTTP request has no host header, destination unknown.".to_string(),
            code: ErrorCode::DestinationUnknown,
        }));
        self.client_state = ClientState::Errored;
    }

    fn after_request_headers(&mut self, end_stream: bool, out: &mut Vec<Command>) {
        if self.check_killed(out) {
            return;
        }
        let expects_continue = {
            let mut flow = self.flow.write();
            let expects = flow
                .request
                .headers
                .get("expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);
            if expects {
                flow.request.headers.remove("expect");
            }
            expects.then(|| flow.request.http_version.clone())
        };
        if let Some(version) = expects_continue {
            out.push(self.to_client(HttpEvent::ResponseHeaders {
                stream_id: self.stream_id,
                response: Response::new(version, 100, "Continue"),
                end_stream: false,
            }));
        }
        if self.flow.read().request.stream && !end_stream {
            self.make_server_connection(AfterConnect::StreamRequest, out);
        } else {
            self.client_state = ClientState::ConsumeRequestBody;
            self.server_state = ServerState::WaitForResponseHeaders;
        }
    }

    fn stream_request_body(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match event {
            HttpEvent::RequestData { data, .. } => out.push(self.to_server(HttpEvent::RequestData {
                stream_id: self.stream_id,
                data,
            })),
            HttpEvent::RequestTrailers { trailers, .. } => self.flow.write().request.trailers = Some(trailers),
            HttpEvent::RequestEndOfMessage { .. } => {
                self.flow.write().request.timestamp_end = Some(Utc::now());
                self.hook(HookName::Request, Next::StreamedRequest, out);
            }
            other => {
                return Err(unexpected(
                    LayerKind::HttpStream,
                    self.client_state.name(),
                    &Event::Http(other),
                ))
            }
        }
        Ok(())
    }

    fn after_streamed_request(&mut self, out: &mut Vec<Command>) -> Result<()> {
        if self.check_killed(out) {
            return Ok(());
        }
        self.client_state = ClientState::Done;
        let trailers = self.flow.read().request.trailers.clone();
        if let Some(trailers) = trailers {
            out.push(self.to_server(HttpEvent::RequestTrailers {
                stream_id: self.stream_id,
                trailers,
            }));
        }
        out.push(self.to_server(HttpEvent::RequestEndOfMessage {
            stream_id: self.stream_id,
        }));
        if self.server_state == ServerState::Done {
            self.flow_done(out)?;
        }
        Ok(())
    }

    fn consume_request_body(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match event {
            HttpEvent::RequestData { data, .. } => {
                self.request_body.extend_from_slice(&data);
                self.check_body_size(true, out);
            }
            HttpEvent::RequestTrailers { trailers, .. } => self.flow.write().request.trailers = Some(trailers),
            HttpEvent::RequestEndOfMessage { .. } => {
                {
                    let mut flow = self.flow.write();
                    flow.request.timestamp_end = Some(Utc::now());
                    flow.request.content = Some(self.request_body.split().freeze());
                }
                self.client_state = ClientState::Done;
                self.hook(HookName::Request, Next::Request, out);
            }
            other => {
                return Err(unexpected(
                    LayerKind::HttpStream,
                    self.client_state.name(),
                    &Event::Http(other),
                ))
            }
        }
        Ok(())
    }

    fn after_request(&mut self, out: &mut Vec<Command>) {
        if self.check_killed(out) {
            return;
        }
        let answered = {
            let mut flow = self.flow.write();
            match flow.response.as_mut() {
                Some(response) => {
                    response.timestamp_start = Utc::now();
                    true
                }
                None => false,
            }
        };
        if answered {
            self.hook(HookName::Responseheaders, Next::SyntheticResponseHeaders, out);
        } else if !self.check_rewritten_request(out) {
            self.make_server_connection(AfterConnect::SendRequest, out);
        }
    }

    /// The `request` hook may rewrite the request; check it again before it
    /// goes upstream. Returns true if the request was rejected.
    fn check_rewritten_request(&mut self, out: &mut Vec<Command>) -> bool {
        let err = validate_request(self.mode, &self.flow.read().request, false);
        let Some(message) = err else {
            return false;
        };
        self.set_error(&message);
        let then = AfterError::Reject {
            message,
            code: ErrorCode::RequestValidationFailed,
            notify_server: false,
        };
        self.error_hook(then, out);
        true
    }

    fn make_server_connection(&mut self, after: AfterConnect, out: &mut Vec<Command>) {
        let request = {
            let flow = self.flow.read();
            let via = flow.server.read().via.clone();
            GetHttpConnection {
                address: Address::new(flow.request.host.clone(), flow.request.port),
                tls: flow.request.scheme == "https",
                via,
            }
        };
        self.block(Command::get_http_connection(request), Next::Connection(after), out);
    }

    fn connected(
        &mut self,
        after: AfterConnect,
        result: std::result::Result<ConnectionRef, String>,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match result {
            Ok(conn) => {
                self.ctx.server = conn.clone();
                self.flow.write().server = conn;
                match after {
                    AfterConnect::StreamRequest => self.start_request_stream(out),
                    AfterConnect::StreamBuffered(data) => {
                        self.start_request_stream(out);
                        self.stream_request_body(
                            HttpEvent::RequestData {
                                stream_id: self.stream_id,
                                data,
                            },
                            out,
                        )?;
                    }
                    AfterConnect::SendRequest => self.send_request(out),
                }
                Ok(())
            }
            Err(message) => {
                let client_errored = !matches!(after, AfterConnect::SendRequest);
                let event = HttpEvent::ResponseProtocolError {
                    stream_id: self.stream_id,
                    message,
                    code: ErrorCode::ConnectFailed,
                };
                self.protocol_error(event, client_errored, out);
                Ok(())
            }
        }
    }

    fn start_request_stream(&mut self, out: &mut Vec<Command>) {
        let request = self.flow.read().request.clone();
        let host = request.host.clone();
        out.push(self.to_server(HttpEvent::RequestHeaders {
            stream_id: self.stream_id,
            request,
            end_stream: false,
        }));
        out.push(Command::log(format!("Streaming request to {}.", host), Level::INFO));
        self.client_state = ClientState::StreamRequestBody;
        self.server_state = ServerState::WaitForResponseHeaders;
    }

    fn send_request(&mut self, out: &mut Vec<Command>) {
        let request = self.flow.read().request.clone();
        let content = request.content.clone().unwrap_or_default();
        let trailers = request.trailers.clone();
        out.push(self.to_server(HttpEvent::RequestHeaders {
            stream_id: self.stream_id,
            end_stream: content.is_empty() && trailers.is_none(),
            request,
        }));
        if !content.is_empty() {
            out.push(self.to_server(HttpEvent::RequestData {
                stream_id: self.stream_id,
                data: content,
            }));
        }
        if let Some(trailers) = trailers {
            out.push(self.to_server(HttpEvent::RequestTrailers {
                stream_id: self.stream_id,
                trailers,
            }));
        }
        out.push(self.to_server(HttpEvent::RequestEndOfMessage {
            stream_id: self.stream_id,
        }));
    }

    // Server side.

    fn server_event(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match (self.server_state, event) {
            (
                ServerState::WaitForResponseHeaders,
                HttpEvent::ResponseHeaders {
                    response, end_stream, ..
                },
            ) => {
                self.flow.write().response = Some(response);
                if !end_stream && self.check_body_size(false, out) {
                    return Ok(());
                }
                if self.check_invalid(false, out) {
                    return Ok(());
                }
                self.hook(HookName::Responseheaders, Next::ResponseHeaders { end_stream }, out);
                Ok(())
            }
            (ServerState::StreamResponseBody, event) => {
                match event {
                    HttpEvent::ResponseData { data, .. } => out.push(self.to_client(HttpEvent::ResponseData {
                        stream_id: self.stream_id,
                        data,
                    })),
                    HttpEvent::ResponseTrailers { trailers, .. } => self.set_response_trailers(trailers),
                    HttpEvent::ResponseEndOfMessage { .. } => self.send_response(true, out),
                    other => {
                        return Err(unexpected(
                            LayerKind::HttpStream,
                            self.server_state.name(),
                            &Event::Http(other),
                        ))
                    }
                }
                Ok(())
            }
            (ServerState::ConsumeResponseBody, event) => {
                match event {
                    HttpEvent::ResponseData { data, .. } => {
                        self.response_body.extend_from_slice(&data);
                        self.check_body_size(false, out);
                    }
                    HttpEvent::ResponseTrailers { trailers, .. } => self.set_response_trailers(trailers),
                    HttpEvent::ResponseEndOfMessage { .. } => {
                        let body = self.response_body.split().freeze();
                        if let Some(response) = self.flow.write().response.as_mut() {
                            response.content = Some(body);
                        }
                        self.send_response(false, out);
                    }
                    other => {
                        return Err(unexpected(
                            LayerKind::HttpStream,
                            self.server_state.name(),
                            &Event::Http(other),
                        ))
                    }
                }
                Ok(())
            }
            (ServerState::Errored, _) => Ok(()),
            (state, event) => Err(unexpected(LayerKind::HttpStream, state.name(), &Event::Http(event))),
        }
    }

    fn set_response_trailers(&self, trailers: Headers) {
        if let Some(response) = self.flow.write().response.as_mut() {
            response.trailers = Some(trailers);
        }
    }

    fn after_response_headers(&mut self, end_stream: bool, out: &mut Vec<Command>) {
        if self.check_killed(out) {
            return;
        }
        let stream = self.flow.read().response.as_ref().map(|r| r.stream).unwrap_or(false);
        if stream && !end_stream {
            self.start_response_stream(out);
        } else {
            self.server_state = ServerState::ConsumeResponseBody;
        }
    }

    fn start_response_stream(&mut self, out: &mut Vec<Command>) {
        let (response, host) = {
            let flow = self.flow.read();
            (flow.response.clone(), flow.request.host.clone())
        };
        if let Some(response) = response {
            out.push(self.to_client(HttpEvent::ResponseHeaders {
                stream_id: self.stream_id,
                response,
                end_stream: false,
            }));
            out.push(Command::log(format!("Streaming response from {}.", host), Level::INFO));
        }
        self.server_state = ServerState::StreamResponseBody;
    }

    fn send_response(&mut self, already_streamed: bool, out: &mut Vec<Command>) {
        {
            let websocket_enabled = self.ctx.options.websocket;
            let mut flow = self.flow.write();
            let version_13 = flow.request.headers.get("sec-websocket-version") == Some("13");
            let upgrade = match flow.response.as_mut() {
                Some(response) => {
                    response.timestamp_end = Some(Utc::now());
                    response.status_code == 101
                        && response
                            .headers
                            .get("upgrade")
                            .map(|u| u.eq_ignore_ascii_case("websocket"))
                            .unwrap_or(false)
                }
                None => false,
            };
            if upgrade && version_13 && websocket_enabled {
                flow.websocket = Some(WebSocketData::default());
            }
        }
        self.hook(HookName::Response, Next::Response { already_streamed }, out);
    }

    fn after_response(&mut self, already_streamed: bool, out: &mut Vec<Command>) -> Result<()> {
        self.server_state = ServerState::Done;
        if self.check_killed(out) {
            return Ok(());
        }
        let Some(response) = self.flow.read().response.clone() else {
            return Ok(());
        };
        if !already_streamed {
            let content = response.content.clone().unwrap_or_default();
            out.push(self.to_client(HttpEvent::ResponseHeaders {
                stream_id: self.stream_id,
                end_stream: content.is_empty() && response.trailers.is_none(),
                response: response.clone(),
            }));
            if !content.is_empty() {
                out.push(self.to_client(HttpEvent::ResponseData {
                    stream_id: self.stream_id,
                    data: content,
                }));
            }
        }
        if let Some(trailers) = response.trailers {
            out.push(self.to_client(HttpEvent::ResponseTrailers {
                stream_id: self.stream_id,
                trailers,
            }));
        }
        if self.client_state == ClientState::Done {
            self.flow_done(out)?;
        }
        Ok(())
    }

    fn flow_done(&mut self, out: &mut Vec<Command>) -> Result<()> {
        let (status, websocket) = {
            let mut flow = self.flow.write();
            if flow.websocket.is_none() {
                flow.live = false;
            }
            (flow.response.as_ref().map(|r| r.status_code), flow.websocket.is_some())
        };
        if status == Some(101) {
            // The pipe must exist before the child's start hook blocks.
            out.push(self.to_client(HttpEvent::ResponseEndOfMessage {
                stream_id: self.stream_id,
            }));
            let ctx = self.ctx.enter(LayerKind::HttpStream);
            let child = if websocket {
                WebSocketLayer::new(ctx.clone(), self.flow.clone()).boxed(&ctx)
            } else if self.ctx.options.rawtcp {
                TcpLayer::new(ctx.clone(), false).boxed(&ctx)
            } else {
                out.push(Command::log(
                    "Sent HTTP 101 response, but no protocol is enabled to upgrade to.",
                    Level::WARN,
                ));
                out.push(Command::close_connection(&self.ctx.client));
                self.client_state = ClientState::Errored;
                self.server_state = ServerState::Errored;
                return Ok(());
            };
            return self.start_child(child, out);
        }
        out.push(Command::drop_stream(self.stream_id));
        out.push(self.to_client(HttpEvent::ResponseEndOfMessage {
            stream_id: self.stream_id,
        }));
        Ok(())
    }

    // CONNECT.

    fn after_connect(&mut self, out: &mut Vec<Command>) -> Result<()> {
        if self.check_killed(out) {
            return Ok(());
        }
        let (address, answered) = {
            let flow = self.flow.read();
            (
                Address::new(flow.request.host.clone(), flow.request.port),
                flow.response.is_some(),
            )
        };
        self.ctx.server.write().address = Some(address);
        match self.mode {
            HttpMode::Upstream => {
                let ctx = self.ctx.enter(LayerKind::HttpStream);
                let child = upstream_proxy::make(&ctx, true, |inner| NextLayer::new(inner.clone()).boxed(&inner));
                self.finish_connect(child, out)
            }
            HttpMode::Regular | HttpMode::Transparent => {
                if !answered && self.ctx.options.connection_strategy == ConnectionStrategy::Eager {
                    let command = Command::open_connection(&self.ctx.server);
                    self.block(command, Next::ConnectOpen, out);
                    return Ok(());
                }
                self.finish_regular_connect(out)
            }
        }
    }

    fn connect_opened(&mut self, err: Option<String>, out: &mut Vec<Command>) -> Result<()> {
        if let Some(err) = err {
            let address = self
                .ctx
                .server
                .address()
                .map(|a| a.to_string())
                .unwrap_or_default();
            let message = format!(
                "Cannot connect to {}: {} If you plan to redirect requests away from this server, \
                 consider setting `connection_strategy` to `lazy` to suppress early connections.",
                address, err
            );
            self.flow.write().response = Some(Response::make(502, message, Headers::new()));
        }
        self.finish_regular_connect(out)
    }

    fn finish_regular_connect(&mut self, out: &mut Vec<Command>) -> Result<()> {
        let ctx = self.ctx.enter(LayerKind::HttpStream);
        let child = NextLayer::new(ctx.clone()).boxed(&ctx);
        self.finish_connect(child, out)
    }

    fn finish_connect(&mut self, child: Box<dyn Layer>, out: &mut Vec<Command>) -> Result<()> {
        let response = {
            let mut flow = self.flow.write();
            let version = flow.request.http_version.clone();
            flow.response
                .get_or_insert_with(|| {
                    let mut response = Response::new(version, 200, "Connection established");
                    response.content = Some(Bytes::new());
                    response
                })
                .clone()
        };
        if (200..300).contains(&response.status_code) {
            self.start_child(child, out)?;
        } else {
            self.client_state = ClientState::Errored;
            self.flow.write().live = false;
        }
        let content = response.content.clone().unwrap_or_default();
        out.push(self.to_client(HttpEvent::ResponseHeaders {
            stream_id: self.stream_id,
            end_stream: content.is_empty() && response.trailers.is_none(),
            response: response.clone(),
        }));
        if !content.is_empty() {
            out.push(self.to_client(HttpEvent::ResponseData {
                stream_id: self.stream_id,
                data: content,
            }));
        }
        if let Some(trailers) = response.trailers {
            out.push(self.to_client(HttpEvent::ResponseTrailers {
                stream_id: self.stream_id,
                trailers,
            }));
        }
        out.push(self.to_client(HttpEvent::ResponseEndOfMessage {
            stream_id: self.stream_id,
        }));
        Ok(())
    }

    // Tunnels and upgrades.

    fn start_child(&mut self, mut child: Box<dyn Layer>, out: &mut Vec<Command>) -> Result<()> {
        let commands = child.handle_event(Event::Start)?;
        self.child = Some(child);
        self.forward_child(commands, out);
        Ok(())
    }

    fn passthrough(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let event = match event {
            Event::Http(http) => match http {
                HttpEvent::RequestData { data, .. } => Event::data_received(&self.ctx.client, data),
                HttpEvent::ResponseData { data, .. } => Event::data_received(&self.ctx.server, data),
                HttpEvent::RequestEndOfMessage { .. } | HttpEvent::RequestProtocolError { .. } => {
                    Event::connection_closed(&self.ctx.client)
                }
                HttpEvent::ResponseEndOfMessage { .. } | HttpEvent::ResponseProtocolError { .. } => {
                    Event::connection_closed(&self.ctx.server)
                }
                // Heads and trailers mean nothing on a pipe.
                _ => return Ok(()),
            },
            other => other,
        };
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let commands = child.handle_event(event)?;
        self.forward_child(commands, out);
        Ok(())
    }

    /// Maps the child's connection commands onto this stream.
    fn forward_child(&self, commands: Vec<Command>, out: &mut Vec<Command>) {
        let upgraded = self
            .flow
            .read()
            .response
            .as_ref()
            .map(|r| r.status_code == 101)
            .unwrap_or(false);
        let stream_id = self.stream_id;
        for command in commands {
            let Command { id, blocking, kind } = command;
            match kind {
                CommandKind::SendData { connection, data } if connection == self.ctx.client => {
                    out.push(self.to_client(HttpEvent::ResponseData { stream_id, data }))
                }
                CommandKind::SendData { connection, data } if upgraded && connection == self.ctx.server => {
                    out.push(self.to_server(HttpEvent::RequestData { stream_id, data }))
                }
                CommandKind::CloseConnection { connection, .. } if connection == self.ctx.client => {
                    out.push(self.to_client(HttpEvent::ResponseProtocolError {
                        stream_id,
                        message: "EOF".to_string(),
                        code: ErrorCode::PassthroughClose,
                    }))
                }
                CommandKind::CloseConnection { connection, .. } if upgraded && connection == self.ctx.server => {
                    out.push(self.to_server(HttpEvent::RequestProtocolError {
                        stream_id,
                        message: "EOF".to_string(),
                        code: ErrorCode::PassthroughClose,
                    }))
                }
                CommandKind::CloseConnection {
                    connection,
                    half_close: true,
                } => out.push(Command::close_connection(&connection)),
                kind => out.push(Command { id, blocking, kind }),
            }
        }
    }

    // Failure paths.

    /// Returns true if the exchange ended because the flow was killed.
    fn check_killed(&mut self, out: &mut Vec<Command>) -> bool {
        let remote = self.killed_by_remote.take();
        let killed = {
            let mut flow = self.flow.write();
            if let Some(message) = &remote {
                if flow.error.is_none() {
                    flow.error = Some(FlowError::new(message.clone()));
                }
            }
            flow.killed() || remote.is_some()
        };
        if !killed {
            return false;
        }
        if self.error_hook_fired {
            self.send_kill(out);
        } else {
            self.error_hook(AfterError::Killed, out);
        }
        true
    }

    fn send_kill(&mut self, out: &mut Vec<Command>) {
        out.push(self.to_client(HttpEvent::ResponseProtocolError {
            stream_id: self.stream_id,
            message: "killed".to_string(),
            code: ErrorCode::Kill,
        }));
        // A half-read response leaves the server connection unusable.
        if matches!(
            self.server_state,
            ServerState::WaitForResponseHeaders | ServerState::StreamResponseBody | ServerState::ConsumeResponseBody
        ) {
            out.push(self.to_server(HttpEvent::RequestProtocolError {
                stream_id: self.stream_id,
                message: "killed".to_string(),
                code: ErrorCode::Kill,
            }));
        }
        self.flow.write().live = false;
        self.client_state = ClientState::Errored;
        self.server_state = ServerState::Errored;
        out.push(Command::drop_stream(self.stream_id));
    }

    /// Validates the request, or the response headers. Returns true if the
    /// message was rejected.
    fn check_invalid(&mut self, request: bool, out: &mut Vec<Command>) -> bool {
        let validate = self.ctx.options.validate_inbound_headers;
        let err = {
            let flow = self.flow.read();
            if request {
                validate_request(self.mode, &flow.request, validate)
            } else if validate {
                flow.response
                    .as_ref()
                    .and_then(|r| validate_headers(&r.headers).err())
            } else {
                None
            }
        };
        let Some(message) = err else {
            return false;
        };
        self.set_error(&message);
        if request {
            let then = AfterError::Reject {
                message,
                code: ErrorCode::RequestValidationFailed,
                notify_server: false,
            };
            self.hook(HookName::Requestheaders, Next::HeadersThenError(then), out);
        } else {
            out.push(Command::close_connection(&self.ctx.server));
            let then = AfterError::Reject {
                message,
                code: ErrorCode::ResponseValidationFailed,
                notify_server: false,
            };
            self.error_hook(then, out);
        }
        true
    }

    /// Enforces `body_size_limit` and switches to streaming above
    /// `stream_large_bodies`. Returns true if processing must stop here.
    fn check_body_size(&mut self, request: bool, out: &mut Vec<Command>) -> bool {
        let limit = self.ctx.options.body_size_limit;
        let threshold = self.ctx.options.stream_large_bodies;
        if limit.is_none() && threshold.is_none() {
            return false;
        }
        let buffered = if request {
            self.request_body.len()
        } else {
            self.response_body.len()
        };
        let expected = if buffered > 0 {
            Some(buffered as u64)
        } else {
            let flow = self.flow.read();
            let size = if request {
                expected_body_size(&flow.request, None)
            } else {
                match flow.response.as_ref() {
                    Some(response) => expected_body_size(&flow.request, Some(response)),
                    None => return false,
                }
            };
            match size {
                Ok(BodySize::Known(n)) => Some(n),
                _ => None,
            }
        };
        let Some(expected) = expected.filter(|n| *n > 0) else {
            return false;
        };

        if limit.is_some_and(|l| expected > l as u64) {
            let (what, code) = if request {
                ("Request", ErrorCode::RequestTooLarge)
            } else {
                ("Response", ErrorCode::ResponseTooLarge)
            };
            let message = format!("{} body exceeds the configured body_size_limit.", what);
            self.set_error(&message);
            let then = AfterError::Reject {
                message,
                code,
                notify_server: !request,
            };
            if buffered == 0 {
                let name = if request {
                    HookName::Requestheaders
                } else {
                    HookName::Responseheaders
                };
                self.hook(name, Next::HeadersThenError(then), out);
            } else {
                self.error_hook(then, out);
            }
            return true;
        }

        if threshold.is_some_and(|t| expected > t as u64) {
            if request {
                self.flow.write().request.stream = true;
                if buffered > 0 {
                    let data = self.request_body.split().freeze();
                    self.make_server_connection(AfterConnect::StreamBuffered(data), out);
                    return true;
                }
            } else {
                if let Some(response) = self.flow.write().response.as_mut() {
                    response.stream = true;
                }
                if buffered > 0 {
                    let data = self.response_body.split().freeze();
                    self.start_response_stream(out);
                    out.push(self.to_client(HttpEvent::ResponseData {
                        stream_id: self.stream_id,
                        data,
                    }));
                }
            }
        }
        false
    }

    fn reject(&mut self, message: String, code: ErrorCode, notify_server: bool, out: &mut Vec<Command>) {
        out.push(self.to_client(HttpEvent::ResponseProtocolError {
            stream_id: self.stream_id,
            message: message.clone(),
            code,
        }));
        if notify_server {
            out.push(self.to_server(HttpEvent::RequestProtocolError {
                stream_id: self.stream_id,
                message,
                code,
            }));
        }
        self.client_state = ClientState::Errored;
        self.server_state = ServerState::Errored;
        self.flow.write().live = false;
        out.push(Command::drop_stream(self.stream_id));
    }

    /// A request that never reached the server may be sent once more over
    /// a fresh connection.
    fn should_retry(&self, event: &HttpEvent) -> bool {
        let HttpEvent::ResponseProtocolError { message, code, .. } = event else {
            return false;
        };
        if self.retried || *code != ErrorCode::GenericServerError || message != SERVER_CLOSED {
            return false;
        }
        let flow = self.flow.read();
        self.client_state == ClientState::Done
            && self.server_state == ServerState::WaitForResponseHeaders
            && !flow.request.stream
            && flow.response.is_none()
            && is_idempotent(&flow.request.method)
    }

    fn protocol_error(&mut self, mut event: HttpEvent, client_errored: bool, out: &mut Vec<Command>) {
        if self.should_retry(&event) {
            self.retried = true;
            let url = self.flow.read().request.url();
            out.push(Command::log(
                format!("Server closed the connection before responding, retrying {}", url),
                Level::INFO,
            ));
            self.make_server_connection(AfterConnect::SendRequest, out);
            return;
        }
        let mut client_errored = client_errored;
        if let HttpEvent::ResponseProtocolError { code, .. } = &mut event {
            if self.client_state == ClientState::StreamRequestBody && *code == ErrorCode::GenericServerError {
                *code = ErrorCode::RequestTimeout;
                client_errored = true;
            }
        }

        let talking_upstream = matches!(event, HttpEvent::RequestProtocolError { .. })
            && matches!(self.client_state, ClientState::StreamRequestBody | ClientState::Done)
            && !matches!(self.server_state, ServerState::Done | ServerState::Errored);
        let need_error_hook = !(self.client_state == ClientState::Errored
            || matches!(self.server_state, ServerState::Done | ServerState::Errored)
            || self.error_hook_fired);

        if talking_upstream {
            out.push(self.to_server(event.clone()));
            self.client_state = ClientState::Errored;
        }
        if need_error_hook {
            if let HttpEvent::RequestProtocolError { message, .. }
            | HttpEvent::ResponseProtocolError { message, .. } = &event
            {
                self.set_error(message);
            }
            self.error_hook(
                AfterError::ProtocolError {
                    event,
                    client_errored,
                },
                out,
            );
            return;
        }
        self.finish_protocol_error(event, client_errored, out);
    }

    fn finish_protocol_error(&mut self, event: HttpEvent, client_errored: bool, out: &mut Vec<Command>) {
        if self.check_killed(out) {
            return;
        }
        if let HttpEvent::ResponseProtocolError { .. } = event {
            if self.client_state != ClientState::Errored {
                out.push(self.to_client(event));
            }
            self.server_state = ServerState::Errored;
        }
        if client_errored {
            self.client_state = ClientState::Errored;
        }
        self.flow.write().live = false;
        out.push(Command::drop_stream(self.stream_id));
    }
}

fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
        Method::PUT,
        Method::DELETE,
    ]
    .contains(method)
}

impl Handler for HttpStream {
    fn kind(&self) -> LayerKind {
        LayerKind::HttpStream
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        if self.child.is_some() {
            return self.passthrough(event, out);
        }
        match event {
            Event::Start if self.client_state == ClientState::Start => {
                self.client_state = ClientState::WaitForRequestHeaders;
                Ok(())
            }
            Event::CommandCompleted(completed) => match self.waiting.take() {
                Some((id, next)) if id == completed.command => self.resume(next, completed.reply, out),
                waiting => {
                    self.waiting = waiting;
                    Err(unexpected(
                        LayerKind::HttpStream,
                        self.client_state.name(),
                        &Event::CommandCompleted(completed),
                    ))
                }
            },
            Event::Http(event) if event.is_protocol_error() => {
                self.protocol_error(event, false, out);
                Ok(())
            }
            Event::Http(event) if event.is_request() => self.client_event(event, out),
            Event::Http(event) => self.server_event(event, out),
            // Nothing to inject into before the exchange upgrades.
            Event::MessageInjected(_) => Ok(()),
            other => Err(unexpected(LayerKind::HttpStream, self.client_state.name(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Engine;
    use crate::options::Options;
    use crate::testing::*;

    fn sent_http(commands: &[Command]) -> Vec<(HttpEvent, ConnectionRef)> {
        commands
            .iter()
            .filter_map(|c| match &c.kind {
                CommandKind::SendHttp { event, connection } => Some((event.clone(), connection.clone())),
                _ => None,
            })
            .collect()
    }

    fn get_request(host: &str) -> Request {
        let mut request = Request::new(Method::GET, "/", "HTTP/1.1");
        request.headers = Headers::from_pairs([("Host", host)]);
        request
    }

    fn start(ctx: &Context, mode: HttpMode, request: Request, end_stream: bool) -> (Engine<HttpStream>, Vec<Command>) {
        let mut stream = Engine::new(HttpStream::new(ctx.clone(), 1, mode, request.clone()), ctx);
        assert!(feed(&mut stream, Event::Start).is_empty());
        let commands = feed(
            &mut stream,
            Event::Http(HttpEvent::RequestHeaders {
                stream_id: 1,
                request,
                end_stream,
            }),
        );
        (stream, commands)
    }

    #[test]
    fn host_header_sets_destination() {
        let ctx = context();
        let (stream, mut commands) = start(&ctx, HttpMode::Regular, get_request("example.com:8080"), true);
        assert_eq!(hook_names(&commands), vec![HookName::Requestheaders]);
        take_blocking(&mut commands);
        let flow = stream.handler().flow().read();
        assert_eq!((flow.request.host.as_str(), flow.request.port), ("example.com", 8080));
        assert_eq!(flow.request.scheme, "http");
    }

    #[test]
    fn missing_host_is_rejected() {
        let ctx = context();
        let (_, commands) = start(&ctx, HttpMode::Regular, Request::new(Method::GET, "/", "HTTP/1.1"), true);
        let sent = sent_http(&commands);
        assert!(matches!(
            &sent[0].0,
            HttpEvent::ResponseProtocolError { code: ErrorCode::DestinationUnknown, .. }
        ));
        assert!(sent[0].1 == ctx.client);
    }

    #[test]
    fn kill_at_requestheaders_fires_error_hook_once() {
        let ctx = context();
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, get_request("example.com"), true);
        let hook = take_blocking(&mut commands);
        stream.handler().flow().write().kill();

        let mut commands = feed(&mut stream, reply_hook(hook));
        assert_eq!(hook_names(&commands), vec![HookName::Error]);
        let error = take_blocking(&mut commands);

        let commands = feed(&mut stream, reply_hook(error));
        assert!(hook_names(&commands).is_empty());
        assert!(matches!(
            &sent_http(&commands)[0].0,
            HttpEvent::ResponseProtocolError { code: ErrorCode::Kill, .. }
        ));
        assert!(!stream.handler().flow().read().live);
    }

    #[test]
    fn announced_oversized_request_gets_413() {
        let ctx = context_with(Options::default().with_body_size_limit(10));
        let mut request = get_request("example.com");
        request.method = Method::POST;
        request.headers.insert("Content-Length", "100");
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, request, false);

        assert_eq!(hook_names(&commands), vec![HookName::Requestheaders]);
        let hook = take_blocking(&mut commands);
        let mut commands = feed(&mut stream, reply_hook(hook));
        assert_eq!(hook_names(&commands), vec![HookName::Error]);
        let hook = take_blocking(&mut commands);
        let commands = feed(&mut stream, reply_hook(hook));
        assert!(matches!(
            &sent_http(&commands)[0].0,
            HttpEvent::ResponseProtocolError { code: ErrorCode::RequestTooLarge, .. }
        ));
        assert!(stream.handler().flow().read().error.is_some());
    }

    #[test]
    fn complete_exchange_over_supplied_connection() {
        let ctx = context();
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, get_request("example.com"), true);
        let hook = take_blocking(&mut commands);
        assert!(feed(&mut stream, reply_hook(hook)).is_empty());

        let mut commands = feed(&mut stream, Event::Http(HttpEvent::RequestEndOfMessage { stream_id: 1 }));
        assert_eq!(hook_names(&commands), vec![HookName::Request]);
        let hook = take_blocking(&mut commands);
        let mut commands = feed(&mut stream, reply_hook(hook));
        let get = take_blocking(&mut commands);
        match &get.kind {
            CommandKind::GetHttpConnection(request) => {
                assert_eq!(request.address, Address::new("example.com", 80));
                assert!(!request.tls);
            }
            other => panic!("expected GetHttpConnection, got {:?}", other),
        }

        let server = ConnectionRef::server(Some(Address::new("example.com", 80)));
        let commands = feed(&mut stream, Event::completed(get.id, Reply::HttpConnection(Ok(server.clone()))));
        let sent = sent_http(&commands);
        assert!(matches!(&sent[0].0, HttpEvent::RequestHeaders { end_stream: true, .. }));
        assert!(matches!(&sent[1].0, HttpEvent::RequestEndOfMessage { .. }));
        assert!(sent.iter().all(|(_, conn)| *conn == server));

        let response = Response::make(200, "hi", Headers::new());
        let mut commands = feed(
            &mut stream,
            Event::Http(HttpEvent::ResponseHeaders {
                stream_id: 1,
                response,
                end_stream: false,
            }),
        );
        let hook = take_blocking(&mut commands);
        assert!(feed(&mut stream, reply_hook(hook)).is_empty());
        feed(
            &mut stream,
            Event::Http(HttpEvent::ResponseData {
                stream_id: 1,
                data: Bytes::from_static(b"hi"),
            }),
        );
        let mut commands = feed(&mut stream, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 }));
        assert_eq!(hook_names(&commands), vec![HookName::Response]);
        let hook = take_blocking(&mut commands);
        let commands = feed(&mut stream, reply_hook(hook));
        let sent = sent_http(&commands);
        assert!(matches!(&sent[0].0, HttpEvent::ResponseHeaders { .. }));
        assert!(matches!(&sent[1].0, HttpEvent::ResponseData { data, .. } if &data[..] == b"hi"));
        assert!(matches!(&sent[2].0, HttpEvent::ResponseEndOfMessage { .. }));
        assert!(commands.iter().any(|c| matches!(c.kind, CommandKind::DropStream(1))));
        assert!(!stream.handler().flow().read().live);
    }

    #[test]
    fn server_hangup_before_response_is_retried_once() {
        let ctx = context();
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, get_request("example.com"), true);
        let hook = take_blocking(&mut commands);
        feed(&mut stream, reply_hook(hook));
        let mut commands = feed(&mut stream, Event::Http(HttpEvent::RequestEndOfMessage { stream_id: 1 }));
        let hook = take_blocking(&mut commands);
        let mut commands = feed(&mut stream, reply_hook(hook));
        let get = take_blocking(&mut commands);
        let server = ConnectionRef::server(Some(Address::new("example.com", 80)));
        feed(&mut stream, Event::completed(get.id, Reply::HttpConnection(Ok(server))));

        let hangup = || {
            Event::Http(HttpEvent::ResponseProtocolError {
                stream_id: 1,
                message: SERVER_CLOSED.to_string(),
                code: ErrorCode::GenericServerError,
            })
        };
        let mut commands = feed(&mut stream, hangup());
        let retry = take_blocking(&mut commands);
        assert!(matches!(retry.kind, CommandKind::GetHttpConnection(_)));
        let fresh = ConnectionRef::server(Some(Address::new("example.com", 80)));
        feed(&mut stream, Event::completed(retry.id, Reply::HttpConnection(Ok(fresh))));

        // The second hangup is reported.
        let mut commands = feed(&mut stream, hangup());
        assert_eq!(hook_names(&commands), vec![HookName::Error]);
        let hook = take_blocking(&mut commands);
        let commands = feed(&mut stream, reply_hook(hook));
        let sent = sent_http(&commands);
        assert!(matches!(
            &sent[0].0,
            HttpEvent::ResponseProtocolError { code: ErrorCode::GenericServerError, .. }
        ));
        assert!(sent[0].1 == ctx.client);
    }

    #[test]
    fn lazy_connect_answers_200_and_becomes_a_tunnel() {
        let options = Options::default().with_connection_strategy(ConnectionStrategy::Lazy);
        let ctx = context_with(options);
        let mut request = Request::new(Method::CONNECT, "example.com:443", "HTTP/1.1");
        request.host = "example.com".to_string();
        request.port = 443;
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, request, true);
        assert_eq!(hook_names(&commands), vec![HookName::HttpConnect]);
        let hook = take_blocking(&mut commands);

        let commands = feed(&mut stream, reply_hook(hook));
        let sent = sent_http(&commands);
        match &sent[0].0 {
            HttpEvent::ResponseHeaders { response, .. } => {
                assert_eq!(response.status_code, 200);
                assert_eq!(response.reason, "Connection established");
            }
            other => panic!("expected response headers, got {:?}", other),
        }
        assert_eq!(ctx.server.address(), Some(Address::new("example.com", 443)));

        // Client bytes now go to protocol detection.
        let mut commands = feed(
            &mut stream,
            Event::Http(HttpEvent::RequestData {
                stream_id: 1,
                data: Bytes::from_static(b"\x16\x03\x01"),
            }),
        );
        assert_eq!(hook_names(&commands), vec![HookName::NextLayer]);
        take_blocking(&mut commands);
    }

    #[test]
    fn eager_connect_failure_becomes_502() {
        let ctx = context();
        let mut request = Request::new(Method::CONNECT, "example.com:443", "HTTP/1.1");
        request.host = "example.com".to_string();
        request.port = 443;
        let (mut stream, mut commands) = start(&ctx, HttpMode::Regular, request, true);
        let hook = take_blocking(&mut commands);
        let mut commands = feed(&mut stream, reply_hook(hook));
        let open = take_blocking(&mut commands);
        let commands = feed(&mut stream, reply_open(&open, Some("refused")));
        match &sent_http(&commands)[0].0 {
            HttpEvent::ResponseHeaders { response, .. } => {
                assert_eq!(response.status_code, 502);
                let body = response.content.clone().unwrap_or_default();
                assert!(String::from_utf8_lossy(&body).contains("Cannot connect to example.com:443: refused"));
            }
            other => panic!("expected response headers, got {:?}", other),
        }
    }

    #[test]
    fn transparent_mode_rejects_connect() {
        let ctx = context_to("example.com", 443);
        let mut request = Request::new(Method::CONNECT, "example.com:443", "HTTP/1.1");
        request.host = "example.com".to_string();
        request.port = 443;
        let (_, commands) = start(&ctx, HttpMode::Transparent, request, true);
        assert_eq!(hook_names(&commands), vec![HookName::Requestheaders]);
    }

    /// Drives a bodiless GET up to its pending `request` hook.
    fn at_request_hook(ctx: &Context) -> (Engine<HttpStream>, Command) {
        let (mut stream, mut commands) = start(ctx, HttpMode::Regular, get_request("example.com"), true);
        let hook = take_blocking(&mut commands);
        assert!(feed(&mut stream, reply_hook(hook)).is_empty());
        let mut commands = feed(&mut stream, Event::Http(HttpEvent::RequestEndOfMessage { stream_id: 1 }));
        assert_eq!(hook_names(&commands), vec![HookName::Request]);
        (stream, take_blocking(&mut commands))
    }

    fn connect(stream: &mut Engine<HttpStream>, hook: Command) -> ConnectionRef {
        let mut commands = feed(stream, reply_hook(hook));
        let get = take_blocking(&mut commands);
        assert!(matches!(get.kind, CommandKind::GetHttpConnection(_)));
        let server = ConnectionRef::server(Some(Address::new("example.com", 80)));
        feed(stream, Event::completed(get.id, Reply::HttpConnection(Ok(server.clone()))));
        server
    }

    fn response_headers(stream: &mut Engine<HttpStream>) -> Command {
        let mut commands = feed(
            stream,
            Event::Http(HttpEvent::ResponseHeaders {
                stream_id: 1,
                response: Response::make(200, "", Headers::from_pairs([("Content-Length", "2")])),
                end_stream: false,
            }),
        );
        assert_eq!(hook_names(&commands), vec![HookName::Responseheaders]);
        take_blocking(&mut commands)
    }

    /// Kills the flow while `hook` is pending and answers the `error` hook.
    fn kill_during(ctx: &Context, stream: &mut Engine<HttpStream>, hook: Command) -> Vec<Command> {
        stream.handler().flow().write().kill();
        let mut commands = feed(stream, reply_hook(hook));
        assert_eq!(hook_names(&commands), vec![HookName::Error]);
        let error = take_blocking(&mut commands);
        let commands = feed(stream, reply_hook(error));
        assert!(hook_names(&commands).is_empty());
        assert!(matches!(
            sent_http(&commands).first(),
            Some((HttpEvent::ResponseProtocolError { code: ErrorCode::Kill, .. }, conn)) if *conn == ctx.client
        ));
        assert!(commands.iter().any(|c| matches!(c.kind, CommandKind::DropStream(1))));
        assert!(!stream.handler().flow().read().live);
        commands
    }

    fn notifies(commands: &[Command], server: &ConnectionRef) -> bool {
        sent_http(commands).iter().any(|(event, conn)| {
            conn == server && matches!(event, HttpEvent::RequestProtocolError { code: ErrorCode::Kill, .. })
        })
    }

    #[test]
    fn request_rewritten_to_bad_scheme_is_rejected() {
        let ctx = context();
        let (mut stream, hook) = at_request_hook(&ctx);
        let edited = reply_hook_with(hook, |h| {
            if let Hook::Http(_, flow) = h {
                flow.write().request.scheme = "ftp".to_string();
            }
        });
        let mut commands = feed(&mut stream, edited);
        assert_eq!(hook_names(&commands), vec![HookName::Error]);
        let error = take_blocking(&mut commands);
        let commands = feed(&mut stream, reply_hook(error));
        assert!(!commands.iter().any(|c| matches!(c.kind, CommandKind::GetHttpConnection(_))));
        match &sent_http(&commands)[0] {
            (HttpEvent::ResponseProtocolError { message, code, .. }, conn) => {
                assert_eq!(*code, ErrorCode::RequestValidationFailed);
                assert_eq!(code.http_status_code(), Some(400));
                assert_eq!(message, "Invalid request scheme: ftp");
                assert!(*conn == ctx.client);
            }
            other => panic!("expected a protocol error, got {:?}", other.0),
        }
        assert!(stream.handler().flow().read().error.is_some());
    }

    #[test]
    fn kill_at_request_never_connects() {
        let ctx = context();
        let (mut stream, hook) = at_request_hook(&ctx);
        let commands = kill_during(&ctx, &mut stream, hook);
        assert!(!commands.iter().any(|c| matches!(c.kind, CommandKind::GetHttpConnection(_))));
    }

    #[test]
    fn kill_at_responseheaders_drops_the_server_connection() {
        let ctx = context();
        let (mut stream, hook) = at_request_hook(&ctx);
        let server = connect(&mut stream, hook);
        let hook = response_headers(&mut stream);
        let commands = kill_during(&ctx, &mut stream, hook);
        assert!(notifies(&commands, &server));

        // The rest of the response is swallowed.
        let commands = feed(
            &mut stream,
            Event::Http(HttpEvent::ResponseData {
                stream_id: 1,
                data: Bytes::from_static(b"hi"),
            }),
        );
        assert!(commands.is_empty());
    }

    #[test]
    fn kill_at_response_sends_nothing_of_the_response() {
        let ctx = context();
        let (mut stream, hook) = at_request_hook(&ctx);
        let server = connect(&mut stream, hook);
        let hook = response_headers(&mut stream);
        assert!(feed(&mut stream, reply_hook(hook)).is_empty());
        feed(
            &mut stream,
            Event::Http(HttpEvent::ResponseData {
                stream_id: 1,
                data: Bytes::from_static(b"hi"),
            }),
        );
        let mut commands = feed(&mut stream, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 }));
        assert_eq!(hook_names(&commands), vec![HookName::Response]);
        let hook = take_blocking(&mut commands);

        let commands = kill_during(&ctx, &mut stream, hook);
        assert!(!sent_http(&commands)
            .iter()
            .any(|(event, _)| matches!(event, HttpEvent::ResponseHeaders { .. } | HttpEvent::ResponseData { .. })));
        // The response was read in full, so the server sees nothing more.
        assert!(!notifies(&commands, &server));
    }
}
