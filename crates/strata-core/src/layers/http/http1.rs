//! HTTP/1.x connection handlers and wire helpers.
//!
//! One exchange at a time, no pipelining: after a request has been read the
//! server side waits for the response to go out before it parses the next
//! head, since the exchange may still upgrade to WebSocket or raw TCP.

use bytes::{Buf, Bytes, BytesMut};
use tracing::Level;

use crate::commands::Command;
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::Result;
use crate::events::Event;
use crate::layer::{unexpected, Handler, LayerKind};
use crate::message::{
    canonical_reason, latin1_decode, latin1_encode, make_error_response, Headers, Request, Response,
};

use super::events::{ErrorCode, HttpEvent, StreamId};

const MAX_HEADERS: usize = 256;
const MAX_HEAD_SIZE: usize = 256 * 1024;

/// Message of the error raised when a server hangs up before responding.
pub(crate) const SERVER_CLOSED: &str = "server closed connection";

/// How the length of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    Known(u64),
    Chunked,
    UntilEof,
}

/// Body length of `request`, or of `response` to it.
pub fn expected_body_size(request: &Request, response: Option<&Response>) -> std::result::Result<BodySize, String> {
    let headers = match response {
        None => &request.headers,
        Some(response) => {
            if request.method == http::Method::HEAD
                || (100..200).contains(&response.status_code)
                || response.status_code == 204
                || response.status_code == 304
            {
                return Ok(BodySize::Known(0));
            }
            if (200..300).contains(&response.status_code) && request.is_connect() {
                return Ok(BodySize::Known(0));
            }
            &response.headers
        }
    };

    if let Some(te) = headers.get("transfer-encoding") {
        if !te.is_ascii() {
            return Err(format!("Invalid transfer encoding: {:?}", te));
        }
        let normalized: Vec<String> = te
            .split(',')
            .map(|t| t.trim_matches(|c| c == ' ' || c == '\t').to_ascii_lowercase())
            .collect();
        let normalized = normalized.join(",");
        return match normalized.as_str() {
            "chunked" | "compress,chunked" | "deflate,chunked" | "gzip,chunked" => Ok(BodySize::Chunked),
            "compress" | "deflate" | "gzip" | "identity" => {
                if response.is_some() {
                    Ok(BodySize::UntilEof)
                } else {
                    Err("Invalid request transfer encoding, message body cannot be determined reliably.".to_string())
                }
            }
            _ => Err(format!("Unknown transfer encoding: {:?}", te)),
        };
    }

    let sizes: Vec<&str> = headers.get_all("content-length").collect();
    if let Some(first) = sizes.first() {
        if sizes.iter().any(|s| s != first) {
            return Err(format!("Conflicting Content-Length headers: {:?}", sizes));
        }
        return first
            .trim()
            .parse::<u64>()
            .map(BodySize::Known)
            .map_err(|_| format!("Invalid Content-Length header: {:?}", first));
    }

    if response.is_none() {
        Ok(BodySize::Known(0))
    } else {
        Ok(BodySize::UntilEof)
    }
}

/// Rejects header sets that invite request smuggling.
pub fn validate_headers(headers: &Headers) -> std::result::Result<(), String> {
    let mut te_found = false;
    let mut cl_found = false;
    for (name, _) in headers.iter() {
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(format!(
                "Received an invalid header name: {:?}. Invalid header names may introduce \
                 request smuggling vulnerabilities. Disable the validate_inbound_headers option \
                 to skip this security check.",
                name
            ));
        }
        te_found |= name.eq_ignore_ascii_case("transfer-encoding");
        cl_found |= name.eq_ignore_ascii_case("content-length");
    }
    if te_found && cl_found {
        return Err("Received both a Transfer-Encoding and a Content-Length header, \
                    refusing as recommended in RFC 7230 Section 3.3.3. \
                    Disable the validate_inbound_headers option to skip this security check."
            .to_string());
    }
    Ok(())
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// True if the connection must close after this message.
pub fn connection_close(http_version: &str, headers: &Headers) -> bool {
    if headers.contains("connection") {
        if headers.has_token("connection", "close") {
            return true;
        }
        if headers.has_token("connection", "keep-alive") {
            return false;
        }
    }
    !matches!(http_version, "HTTP/1.1" | "HTTP/2.0")
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn parse_authority(authority: &str) -> std::result::Result<(String, Option<u16>), String> {
    let invalid = || format!("Invalid authority: {:?}", authority);
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        match rest.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if rest.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => Some(port.parse::<u16>().map_err(|_| invalid())?),
        None => None,
    };
    Ok((host.to_ascii_lowercase(), port))
}

fn http_version(version: Option<u8>) -> String {
    match version {
        Some(0) => "HTTP/1.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    Headers::from_pairs(
        raw.iter()
            .map(|h| (h.name.to_string(), latin1_decode(h.value))),
    )
}

/// Parses a request head. Returns the request and the head length, or
/// `None` if more bytes are needed.
pub fn read_request_head(buf: &[u8]) -> std::result::Result<Option<(Request, usize)>, String> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut raw);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            return Err("Request head too large".to_string())
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(format!("Bad HTTP request: {}", e)),
    };
    let (Some(method), Some(target)) = (parsed.method, parsed.path) else {
        return Err("Bad HTTP request line".to_string());
    };
    let method = http::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("Bad HTTP request line: invalid method {:?}", method))?;
    let mut request = Request::new(method, "", http_version(parsed.version));
    request.headers = collect_headers(parsed.headers);

    let bad_line = || format!("Bad HTTP request line: {:?}", target);
    if target == "*" || target.starts_with('/') {
        request.scheme = String::new();
        request.port = 0;
        request.path = target.to_string();
    } else if request.is_connect() {
        let (host, port) = parse_authority(target).map_err(|_| bad_line())?;
        request.scheme = String::new();
        request.host = host;
        request.port = port.ok_or_else(bad_line)?;
        request.authority = target.to_string();
    } else {
        let (scheme, rest) = target.split_once("://").ok_or_else(bad_line)?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = parse_authority(authority).map_err(|_| bad_line())?;
        let default_port = match scheme {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        request.scheme = scheme.to_ascii_lowercase();
        request.host = host;
        request.port = port.or(default_port).ok_or_else(bad_line)?;
        request.authority = authority.to_string();
        request.path = path.to_string();
    }
    Ok(Some((request, len)))
}

/// Parses a response head, see [`read_request_head`].
pub fn read_response_head(buf: &[u8]) -> std::result::Result<Option<(Response, usize)>, String> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut raw);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            return Err("Response head too large".to_string())
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(format!("Bad HTTP response: {}", e)),
    };
    let code = parsed.code.ok_or_else(|| "Bad HTTP response line".to_string())?;
    let mut response = Response::new(
        http_version(parsed.version),
        code,
        parsed.reason.unwrap_or_default(),
    );
    response.headers = collect_headers(parsed.headers);
    Ok(Some((response, len)))
}

/// Serializes a request line and headers.
pub fn assemble_request_head(request: &Request) -> Vec<u8> {
    let target = if request.is_connect() {
        request.authority.clone()
    } else if !request.authority.is_empty() {
        format!("{}://{}{}", request.scheme, request.authority, request.path)
    } else {
        request.path.clone()
    };
    let mut out = latin1_encode(&format!(
        "{} {} {}\r\n",
        request.method, target, request.http_version
    ));
    request.headers.write_http1(&mut out);
    out
}

/// Serializes a status line and headers.
pub fn assemble_response_head(response: &Response) -> Vec<u8> {
    let mut out = latin1_encode(&format!(
        "{} {} {}\r\n",
        response.http_version, response.status_code, response.reason
    ));
    response.headers.write_http1(&mut out);
    out
}

/// Head and body of a complete response.
pub fn assemble_response(response: &Response) -> Vec<u8> {
    let mut out = assemble_response_head(response);
    if let Some(content) = &response.content {
        out.extend_from_slice(content);
    }
    out
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get("transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn last_chunk(trailers: Option<&Headers>) -> Vec<u8> {
    let mut out = b"0\r\n".to_vec();
    match trailers {
        Some(trailers) => trailers.write_http1(&mut out),
        None => out.extend_from_slice(b"\r\n"),
    }
    out
}

/// Output of a body reader.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyEvent {
    Data(Bytes),
    End(Option<Headers>),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Incremental message body decoder.
#[derive(Debug)]
pub enum BodyReader {
    ContentLength { remaining: u64, expected: u64 },
    Chunked { state: ChunkState },
    UntilEof,
}

impl BodyReader {
    pub fn new(size: BodySize) -> Self {
        match size {
            BodySize::Known(n) => BodyReader::ContentLength {
                remaining: n,
                expected: n,
            },
            BodySize::Chunked => BodyReader::Chunked {
                state: ChunkState::Size,
            },
            BodySize::UntilEof => BodyReader::UntilEof,
        }
    }

    /// Next event from `buf`, consuming what it used. `Ok(None)` means more
    /// bytes are needed.
    pub fn read(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<BodyEvent>, String> {
        match self {
            BodyReader::ContentLength { remaining, .. } => {
                if *remaining == 0 {
                    return Ok(Some(BodyEvent::End(None)));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(Some(BodyEvent::Data(buf.split_to(n).freeze())))
            }
            BodyReader::UntilEof => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(BodyEvent::Data(buf.split().freeze())))
                }
            }
            BodyReader::Chunked { state } => read_chunked(state, buf),
        }
    }

    /// The peer closed the connection.
    pub fn read_eof(&mut self) -> std::result::Result<BodyEvent, String> {
        match self {
            BodyReader::UntilEof => Ok(BodyEvent::End(None)),
            BodyReader::ContentLength { remaining, expected } => Err(format!(
                "peer closed connection without sending complete message body: \
                 received {} bytes, expected {}",
                *expected - *remaining,
                expected
            )),
            BodyReader::Chunked { .. } => Err(
                "peer closed connection without sending complete message body: incomplete chunked read"
                    .to_string(),
            ),
        }
    }
}

fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Some(line)
}

fn read_chunked(state: &mut ChunkState, buf: &mut BytesMut) -> std::result::Result<Option<BodyEvent>, String> {
    loop {
        match state {
            ChunkState::Size => {
                let Some(line) = take_line(buf) else {
                    if buf.len() > 1024 {
                        return Err("chunk size line too long".to_string());
                    }
                    return Ok(None);
                };
                let line = String::from_utf8_lossy(&line);
                let size = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16)
                    .map_err(|_| format!("illegal chunk size: {:?}", size))?;
                *state = if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data(size)
                };
            }
            ChunkState::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                let data = buf.split_to(n).freeze();
                if *remaining == 0 {
                    *state = ChunkState::DataEnd;
                }
                return Ok(Some(BodyEvent::Data(data)));
            }
            ChunkState::DataEnd => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                if &buf[..2] != b"\r\n" {
                    return Err("missing CRLF after chunk data".to_string());
                }
                buf.advance(2);
                *state = ChunkState::Size;
            }
            ChunkState::Trailers => {
                let Some(end) = find_blank_line(buf) else {
                    return Ok(None);
                };
                let block = buf.split_to(end);
                let mut trailers = Headers::new();
                let text = latin1_decode(&block);
                for line in text.split("\r\n").filter(|l| !l.is_empty()) {
                    let (name, value) = line
                        .split_once(':')
                        .ok_or_else(|| format!("Invalid trailer line: {:?}", line))?;
                    trailers.append(name.trim(), value.trim());
                }
                *state = ChunkState::Size;
                let trailers = (!trailers.is_empty()).then_some(trailers);
                return Ok(Some(BodyEvent::End(trailers)));
            }
        }
    }
}

/// Length up to and including the empty line ending a trailer block.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2);
    }
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// True if the connection becomes a raw tunnel after this exchange.
pub fn should_make_pipe(request: &Request, response: &Response) -> bool {
    response.status_code == 101 || (response.status_code == 200 && request.is_connect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    ReadHeaders,
    ReadBody,
    /// Request read, response not yet sent.
    Wait,
    Passthrough,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::ReadHeaders => "read_headers",
            State::ReadBody => "read_body",
            State::Wait => "wait",
            State::Passthrough => "passthrough",
            State::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Input {
    Data,
    Closed,
}

/// An HTTP/1 connection towards the client (`server`) or towards a server
/// (`client`).
#[derive(Debug)]
pub struct Http1Connection {
    ctx: Context,
    conn: ConnectionRef,
    role: Role,
    stream_id: Option<StreamId>,
    request: Option<Request>,
    response: Option<Response>,
    outgoing_trailers: Option<Headers>,
    request_done: bool,
    response_done: bool,
    state: State,
    buf: BytesMut,
    body_reader: Option<BodyReader>,
}

impl Http1Connection {
    /// Reads requests from `ctx.client`. Stream ids start at 1 and grow by 2.
    pub fn server(ctx: Context) -> Self {
        let conn = ctx.client.clone();
        Self::new(ctx, conn, Role::Server, Some(1))
    }

    /// Writes requests to `ctx.server`.
    pub fn client(ctx: Context) -> Self {
        let conn = ctx.server.clone();
        Self::new(ctx, conn, Role::Client, None)
    }

    fn new(ctx: Context, conn: ConnectionRef, role: Role, stream_id: Option<StreamId>) -> Self {
        Self {
            ctx,
            conn,
            role,
            stream_id,
            request: None,
            response: None,
            outgoing_trailers: None,
            request_done: false,
            response_done: false,
            state: State::Start,
            buf: BytesMut::new(),
            body_reader: None,
        }
    }

    /// The stream currently being read or written.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    fn sid(&self) -> StreamId {
        self.stream_id.unwrap_or_default()
    }

    fn receive_protocol_error(&self, message: String) -> HttpEvent {
        let stream_id = self.sid();
        match self.role {
            Role::Server => HttpEvent::RequestProtocolError {
                stream_id,
                message,
                code: ErrorCode::GenericClientError,
            },
            Role::Client => HttpEvent::ResponseProtocolError {
                stream_id,
                message,
                code: ErrorCode::GenericServerError,
            },
        }
    }

    fn receive_data(&self, data: Bytes) -> HttpEvent {
        let stream_id = self.sid();
        match self.role {
            Role::Server => HttpEvent::RequestData { stream_id, data },
            Role::Client => HttpEvent::ResponseData { stream_id, data },
        }
    }

    fn receive_trailers(&self, trailers: Headers) -> HttpEvent {
        let stream_id = self.sid();
        match self.role {
            Role::Server => HttpEvent::RequestTrailers { stream_id, trailers },
            Role::Client => HttpEvent::ResponseTrailers { stream_id, trailers },
        }
    }

    fn receive_end_of_message(&self) -> HttpEvent {
        let stream_id = self.sid();
        match self.role {
            Role::Server => HttpEvent::RequestEndOfMessage { stream_id },
            Role::Client => HttpEvent::ResponseEndOfMessage { stream_id },
        }
    }

    fn dispatch(&mut self, input: Input, data: Bytes, out: &mut Vec<Command>) -> Result<()> {
        match self.state {
            State::ReadHeaders => match self.role {
                Role::Server => self.read_request_headers(input, out),
                Role::Client => self.read_response_headers(input, out),
            },
            State::ReadBody => self.read_body(input, out),
            State::Wait => {
                self.wait(input, out);
                Ok(())
            }
            State::Passthrough => {
                self.passthrough(input, data, out);
                Ok(())
            }
            State::Done => Ok(()),
            State::Start => {
                let event = match input {
                    Input::Data => Event::data_received(&self.conn, data),
                    Input::Closed => Event::connection_closed(&self.conn),
                };
                Err(unexpected(self.kind(), self.state.name(), &event))
            }
        }
    }

    fn read_body(&mut self, input: Input, out: &mut Vec<Command>) -> Result<()> {
        let Some(mut reader) = self.body_reader.take() else {
            return Ok(());
        };
        loop {
            let event = match input {
                Input::Data => reader.read(&mut self.buf),
                Input::Closed => reader.read_eof().map(Some),
            };
            match event {
                Err(e) => {
                    out.push(Command::close_connection(&self.conn));
                    out.push(Command::receive_http(
                        self.receive_protocol_error(format!("HTTP/1 protocol error: {}", e)),
                    ));
                    return Ok(());
                }
                Ok(None) => break,
                Ok(Some(BodyEvent::Data(data))) => {
                    if !data.is_empty() {
                        out.push(Command::receive_http(self.receive_data(data)));
                    }
                }
                Ok(Some(BodyEvent::End(trailers))) => {
                    if let Some(trailers) = trailers {
                        out.push(Command::receive_http(self.receive_trailers(trailers)));
                    }
                    let connect = self.request.as_ref().map(Request::is_connect).unwrap_or(false);
                    if !connect {
                        out.push(Command::receive_http(self.receive_end_of_message()));
                    }
                    let is_request = self.role == Role::Server;
                    return self.mark_done(is_request, !is_request, out);
                }
            }
            if matches!(input, Input::Closed) {
                break;
            }
        }
        self.body_reader = Some(reader);
        Ok(())
    }

    fn wait(&mut self, input: Input, out: &mut Vec<Command>) {
        if let Input::Closed = input {
            // A peer that sent FIN is not interested in more data from us.
            if !self.conn.state().is_closed() {
                out.push(Command::close_connection(&self.conn));
            }
            out.push(Command::receive_http(HttpEvent::RequestProtocolError {
                stream_id: self.sid(),
                message: "Client disconnected.".to_string(),
                code: ErrorCode::ClientDisconnected,
            }));
        }
    }

    fn make_pipe(&mut self, out: &mut Vec<Command>) {
        self.state = State::Passthrough;
        if !self.buf.is_empty() {
            let buffered = self.buf.split().freeze();
            // Some clients send superfluous newlines after CONNECT.
            let start = buffered
                .iter()
                .position(|b| *b != b'\r' && *b != b'\n')
                .unwrap_or(buffered.len());
            let rest = buffered.slice(start..);
            if !rest.is_empty() {
                self.passthrough(Input::Data, rest, out);
            }
        }
    }

    fn passthrough(&mut self, input: Input, data: Bytes, out: &mut Vec<Command>) {
        match input {
            Input::Data => out.push(Command::receive_http(self.receive_data(data))),
            Input::Closed => {
                let stream_id = self.sid();
                let event = match self.role {
                    Role::Server => HttpEvent::RequestEndOfMessage { stream_id },
                    Role::Client => HttpEvent::ResponseEndOfMessage { stream_id },
                };
                out.push(Command::receive_http(event));
            }
        }
    }

    fn mark_done(&mut self, request: bool, response: bool, out: &mut Vec<Command>) -> Result<()> {
        self.request_done |= request;
        self.response_done |= response;
        if self.request_done && self.response_done {
            let (Some(req), Some(resp)) = (self.request.as_ref(), self.response.as_ref()) else {
                return Ok(());
            };
            if should_make_pipe(req, resp) {
                self.make_pipe(out);
                return Ok(());
            }
            let read_until_eof = expected_body_size(req, Some(resp)) == Ok(BodySize::UntilEof);
            let connection_done = read_until_eof
                || connection_close(&req.http_version, &req.headers)
                || connection_close(&resp.http_version, &resp.headers)
                // HTTP/2 requests get a fresh upstream HTTP/1 connection each.
                || (req.is_http2() && self.role == Role::Client);
            if connection_done {
                out.push(Command::close_connection(&self.conn));
                self.state = State::Done;
                return Ok(());
            }
            self.request_done = false;
            self.response_done = false;
            self.request = None;
            self.response = None;
            self.stream_id = match self.role {
                Role::Server => Some(self.sid() + 2),
                Role::Client => None,
            };
            self.state = State::ReadHeaders;
            if !self.buf.is_empty() {
                self.dispatch(Input::Data, Bytes::new(), out)?;
            }
        } else if self.role == Role::Server && self.request_done {
            self.state = State::Wait;
        }
        Ok(())
    }

    fn read_request_headers(&mut self, input: Input, out: &mut Vec<Command>) -> Result<()> {
        match input {
            Input::Data => {
                let head = read_request_head(&self.buf).and_then(|parsed| match parsed {
                    Some((request, len)) => {
                        if self.ctx.options.validate_inbound_headers {
                            validate_headers(&request.headers)?;
                        }
                        let size = expected_body_size(&request, None)?;
                        Ok(Some((request, len, size)))
                    }
                    None => Ok(None),
                });
                match head {
                    Ok(Some((request, len, size))) => {
                        self.buf.advance(len);
                        let stream_id = self.sid();
                        out.push(Command::receive_http(HttpEvent::RequestHeaders {
                            stream_id,
                            request: request.clone(),
                            end_stream: size == BodySize::Known(0),
                        }));
                        self.request = Some(request);
                        self.body_reader = Some(BodyReader::new(size));
                        self.state = State::ReadBody;
                        self.read_body(Input::Data, out)?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let response = make_error_response(400, &e);
                        out.push(Command::send_data(&self.conn, assemble_response(&response)));
                        out.push(Command::close_connection(&self.conn));
                        let peer = self
                            .conn
                            .read()
                            .peername
                            .map(|p| p.to_string())
                            .unwrap_or_default();
                        out.push(Command::log(format!("{}: {}", peer, e), Level::INFO));
                        self.state = State::Done;
                    }
                }
            }
            Input::Closed => {
                if self.buf.iter().any(|b| !b.is_ascii_whitespace()) {
                    out.push(Command::log(
                        format!(
                            "Client closed connection before completing request headers: {:?}",
                            latin1_decode(&self.buf)
                        ),
                        Level::INFO,
                    ));
                }
                out.push(Command::close_connection(&self.conn));
            }
        }
        Ok(())
    }

    fn read_response_headers(&mut self, input: Input, out: &mut Vec<Command>) -> Result<()> {
        match input {
            Input::Data => {
                let Some(request) = self.request.as_ref() else {
                    out.push(Command::log(
                        format!("Unexpected data from server: {:?}", latin1_decode(&self.buf)),
                        Level::INFO,
                    ));
                    out.push(Command::close_connection(&self.conn));
                    return Ok(());
                };
                let head = read_response_head(&self.buf).and_then(|parsed| match parsed {
                    Some((response, len)) => {
                        if self.ctx.options.validate_inbound_headers {
                            validate_headers(&response.headers)?;
                        }
                        let size = expected_body_size(request, Some(&response))?;
                        Ok(Some((response, len, size)))
                    }
                    None => Ok(None),
                });
                match head {
                    Ok(Some((response, len, size))) => {
                        self.buf.advance(len);
                        out.push(Command::receive_http(HttpEvent::ResponseHeaders {
                            stream_id: self.sid(),
                            response: response.clone(),
                            end_stream: size == BodySize::Known(0),
                        }));
                        self.response = Some(response);
                        self.body_reader = Some(BodyReader::new(size));
                        self.state = State::ReadBody;
                        self.read_body(Input::Data, out)?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        out.push(Command::close_connection(&self.conn));
                        out.push(Command::receive_http(HttpEvent::ResponseProtocolError {
                            stream_id: self.sid(),
                            message: format!("Cannot parse HTTP response: {}", e),
                            code: ErrorCode::GenericServerError,
                        }));
                    }
                }
            }
            Input::Closed => {
                if self.conn.state().contains(ConnectionState::CAN_WRITE) {
                    out.push(Command::close_connection(&self.conn));
                }
                if let Some(stream_id) = self.stream_id {
                    let message = if self.buf.is_empty() {
                        SERVER_CLOSED.to_string()
                    } else {
                        format!("unexpected server response: {:?}", latin1_decode(&self.buf))
                    };
                    out.push(Command::receive_http(HttpEvent::ResponseProtocolError {
                        stream_id,
                        message,
                        code: ErrorCode::GenericServerError,
                    }));
                }
            }
        }
        Ok(())
    }

    /// Serializes an event of the half this side writes.
    fn send(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match self.role {
            Role::Server => self.send_response_event(event, out),
            Role::Client => self.send_request_event(event, out),
        }
    }

    fn send_response_event(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        match event {
            HttpEvent::ResponseHeaders { mut response, .. } => {
                if response.is_http2() {
                    response.http_version = "HTTP/1.1".to_string();
                    response.reason = canonical_reason(response.status_code).to_string();
                }
                out.push(Command::send_data(&self.conn, assemble_response_head(&response)));
                // Interim responses such as 100 Continue precede the real one.
                if response.status_code >= 200 || response.status_code == 101 {
                    self.response = Some(response);
                }
            }
            HttpEvent::ResponseData { data, .. } => {
                let chunked = self.response.as_ref().map(|r| is_chunked(&r.headers)).unwrap_or(false);
                let raw = if chunked { chunk(&data) } else { data.to_vec() };
                if !data.is_empty() {
                    out.push(Command::send_data(&self.conn, raw));
                }
            }
            HttpEvent::ResponseTrailers { trailers, .. } => self.outgoing_trailers = Some(trailers),
            HttpEvent::ResponseEndOfMessage { .. } => {
                let head_request = self
                    .request
                    .as_ref()
                    .map(|r| r.method == http::Method::HEAD)
                    .unwrap_or(false);
                let chunked = self.response.as_ref().map(|r| is_chunked(&r.headers)).unwrap_or(false);
                if !head_request && chunked {
                    let trailers = self.outgoing_trailers.take();
                    out.push(Command::send_data(&self.conn, last_chunk(trailers.as_ref())));
                }
                self.mark_done(false, true, out)?;
            }
            HttpEvent::ResponseProtocolError { message, code, .. } => {
                if self.response.is_none() {
                    if let Some(status) = code.http_status_code() {
                        let response = make_error_response(status, &message);
                        out.push(Command::send_data(&self.conn, assemble_response(&response)));
                    }
                }
                if self.conn.state().contains(ConnectionState::CAN_WRITE) {
                    out.push(Command::close_connection(&self.conn));
                }
            }
            other => return Err(unexpected(self.kind(), "send", &Event::Http(other))),
        }
        Ok(())
    }

    fn send_request_event(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        if let HttpEvent::RequestProtocolError { .. } = event {
            out.push(Command::close_connection(&self.conn));
            return Ok(());
        }
        if self.stream_id.is_none() {
            match &event {
                HttpEvent::RequestHeaders { stream_id, request, .. } => {
                    self.stream_id = Some(*stream_id);
                    self.request = Some(request.clone());
                }
                _ => return Err(unexpected(self.kind(), "send", &Event::Http(event))),
            }
        }
        match event {
            HttpEvent::RequestHeaders { mut request, .. } => {
                if request.is_http2() {
                    request.http_version = "HTTP/1.1".to_string();
                    if !request.headers.contains("host") && !request.authority.is_empty() {
                        let mut headers = Headers::from_pairs([("Host", request.authority.clone())]);
                        for (name, value) in request.headers.iter() {
                            headers.append(name, value);
                        }
                        request.headers = headers;
                    }
                    request.authority.clear();
                    let cookies: Vec<String> = request.headers.get_all("cookie").map(str::to_string).collect();
                    if cookies.len() > 1 {
                        // Only HTTP/2 allows multiple cookie headers.
                        request.headers.insert("Cookie", cookies.join("; "));
                    }
                }
                out.push(Command::send_data(&self.conn, assemble_request_head(&request)));
            }
            HttpEvent::RequestData { data, .. } => {
                let chunked = self.request.as_ref().map(|r| is_chunked(&r.headers)).unwrap_or(false);
                if !data.is_empty() {
                    let raw = if chunked { chunk(&data) } else { data.to_vec() };
                    out.push(Command::send_data(&self.conn, raw));
                }
            }
            HttpEvent::RequestTrailers { trailers, .. } => self.outgoing_trailers = Some(trailers),
            HttpEvent::RequestEndOfMessage { .. } => {
                if let Some(request) = self.request.as_ref() {
                    if is_chunked(&request.headers) {
                        let trailers = self.outgoing_trailers.take();
                        out.push(Command::send_data(&self.conn, last_chunk(trailers.as_ref())));
                    } else if expected_body_size(request, self.response.as_ref()) == Ok(BodySize::UntilEof) {
                        out.push(Command::half_close(&self.conn));
                    }
                }
                self.mark_done(true, false, out)?;
            }
            other => return Err(unexpected(self.kind(), "send", &Event::Http(other))),
        }
        Ok(())
    }
}

impl Handler for Http1Connection {
    fn kind(&self) -> LayerKind {
        match self.role {
            Role::Server => LayerKind::Http1Server,
            Role::Client => LayerKind::Http1Client,
        }
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        match event {
            Event::Http(event) => self.send(event, out),
            Event::Start if self.state == State::Start => {
                self.state = State::ReadHeaders;
                Ok(())
            }
            Event::DataReceived { data, .. } => {
                if self.state == State::Passthrough {
                    self.dispatch(Input::Data, data, out)
                } else {
                    self.buf.extend_from_slice(&data);
                    self.dispatch(Input::Data, Bytes::new(), out)
                }
            }
            Event::ConnectionClosed { .. } => self.dispatch(Input::Closed, Bytes::new(), out),
            other => Err(unexpected(self.kind(), self.state.name(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::layer::Engine;
    use crate::testing::*;

    fn received(commands: &[Command]) -> Vec<&HttpEvent> {
        commands
            .iter()
            .filter_map(|c| match &c.kind {
                CommandKind::ReceiveHttp(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parses_absolute_form_request() {
        let (request, len) = read_request_head(b"GET http://example.com:8080/a?b HTTP/1.1\r\nHost: example.com\r\n\r\nrest")
            .unwrap()
            .unwrap();
        assert_eq!(len, 60);
        assert_eq!(request.scheme, "http");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 8080);
        assert_eq!(request.authority, "example.com:8080");
        assert_eq!(request.path, "/a?b");
    }

    #[test]
    fn parses_connect_and_relative_targets() {
        let (connect, _) = read_request_head(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!((connect.host.as_str(), connect.port), ("example.com", 443));
        assert_eq!(assemble_request_head(&connect), b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");

        let (relative, _) = read_request_head(b"GET /index HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(relative.path, "/index");
        assert!(relative.host.is_empty());
        assert_eq!(relative.http_version, "HTTP/1.0");

        assert!(read_request_head(b"CONNECT example.com HTTP/1.1\r\n\r\n").is_err());
        assert_eq!(read_request_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().map(|r| r.1), None);
    }

    #[test]
    fn body_size_rules() {
        let (mut request, _) = read_request_head(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap().unwrap();
        assert_eq!(expected_body_size(&request, None), Ok(BodySize::Known(5)));

        request.headers = Headers::from_pairs([("Transfer-Encoding", "gzip, chunked")]);
        assert_eq!(expected_body_size(&request, None), Ok(BodySize::Chunked));
        request.headers = Headers::from_pairs([("Transfer-Encoding", "gzip")]);
        assert!(expected_body_size(&request, None).is_err());

        request.headers = Headers::new();
        let response = Response::new("HTTP/1.1", 200, "OK");
        assert_eq!(expected_body_size(&request, Some(&response)), Ok(BodySize::UntilEof));
        let no_content = Response::new("HTTP/1.1", 204, "No Content");
        assert_eq!(expected_body_size(&request, Some(&no_content)), Ok(BodySize::Known(0)));
    }

    #[test]
    fn smuggling_headers_are_rejected() {
        let headers = Headers::from_pairs([("Content-Length", "42"), ("Transfer-Encoding", "chunked")]);
        assert!(validate_headers(&headers).unwrap_err().contains("Transfer-Encoding and a Content-Length"));
        let headers = Headers::from_pairs([("Bad Name", "x")]);
        assert!(validate_headers(&headers).is_err());
    }

    #[test]
    fn chunked_reader_handles_split_input_and_trailers() {
        let mut reader = BodyReader::new(BodySize::Chunked);
        let mut buf = BytesMut::from(&b"5\r\nhel"[..]);
        assert_eq!(reader.read(&mut buf), Ok(Some(BodyEvent::Data(Bytes::from_static(b"hel")))));
        assert_eq!(reader.read(&mut buf), Ok(None));
        buf.extend_from_slice(b"lo\r\n0\r\nX-Sum: 1\r\n\r\n");
        assert_eq!(reader.read(&mut buf), Ok(Some(BodyEvent::Data(Bytes::from_static(b"lo")))));
        match reader.read(&mut buf) {
            Ok(Some(BodyEvent::End(Some(trailers)))) => assert_eq!(trailers.get("x-sum"), Some("1")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn content_length_reader_reports_short_body() {
        let mut reader = BodyReader::new(BodySize::Known(10));
        let mut buf = BytesMut::from(&b"abc"[..]);
        reader.read(&mut buf).unwrap();
        assert!(reader.read_eof().unwrap_err().contains("received 3 bytes, expected 10"));
    }

    #[test]
    fn server_reads_request_and_pipelines_next() {
        let ctx = context();
        let client = ctx.client.clone();
        let mut server = Engine::new(Http1Connection::server(ctx.clone()), &ctx);
        feed(&mut server, Event::Start);

        let commands = feed(
            &mut server,
            Event::data_received(&client, "POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n"),
        );
        let events = received(&commands);
        assert!(matches!(events[0], HttpEvent::RequestHeaders { stream_id: 1, end_stream: false, .. }));
        assert!(matches!(events[1], HttpEvent::RequestData { data, .. } if &data[..] == b"abc"));
        assert!(matches!(events[2], HttpEvent::RequestEndOfMessage { stream_id: 1 }));
        assert_eq!(events.len(), 3);

        let response = Response::make(200, "ok", Headers::new());
        feed(&mut server, Event::Http(HttpEvent::ResponseHeaders { stream_id: 1, response, end_stream: false }));
        let commands = feed(&mut server, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 }));
        let events = received(&commands);
        assert!(matches!(events[0], HttpEvent::RequestHeaders { stream_id: 3, end_stream: true, .. }));
    }

    #[test]
    fn malformed_pipelined_request_gets_400() {
        let ctx = context();
        let client = ctx.client.clone();
        let mut server = Engine::new(Http1Connection::server(ctx.clone()), &ctx);
        feed(&mut server, Event::Start);
        feed(
            &mut server,
            Event::data_received(&client, "GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nContent-Length: x\r\n\r\n"),
        );

        let response = Response::make(200, "ok", Headers::new());
        feed(&mut server, Event::Http(HttpEvent::ResponseHeaders { stream_id: 1, response, end_stream: false }));
        let commands = feed(&mut server, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 }));
        let wire = String::from_utf8(sent(&commands, &client)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(closes(&commands, &client));
        assert!(received(&commands).is_empty());
    }

    #[test]
    fn connection_close_ends_keepalive() {
        let ctx = context();
        let client = ctx.client.clone();
        let mut server = Engine::new(Http1Connection::server(ctx.clone()), &ctx);
        feed(&mut server, Event::Start);
        feed(&mut server, Event::data_received(&client, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n"));
        let response = Response::make(204, "", Headers::new());
        feed(&mut server, Event::Http(HttpEvent::ResponseHeaders { stream_id: 1, response, end_stream: true }));
        let commands = feed(&mut server, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 }));
        assert!(closes(&commands, &client));
    }

    #[test]
    fn conflicting_lengths_get_400_without_stream() {
        let ctx = context();
        let client = ctx.client.clone();
        let mut server = Engine::new(Http1Connection::server(ctx.clone()), &ctx);
        feed(&mut server, Event::Start);
        let commands = feed(
            &mut server,
            Event::data_received(
                &client,
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 42\r\nTransfer-Encoding: chunked\r\n\r\n",
            ),
        );
        let wire = String::from_utf8(sent(&commands, &client)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(wire.contains("Transfer-Encoding and a Content-Length"));
        assert!(closes(&commands, &client));
        assert!(received(&commands).is_empty());
    }

    #[test]
    fn client_writes_chunked_and_reads_until_eof() {
        let ctx = context_to("example.com", 80);
        let server_conn = ctx.server.clone();
        server_conn.set_state(ConnectionState::OPEN);
        let mut client = Engine::new(Http1Connection::client(ctx.clone()), &ctx);
        feed(&mut client, Event::Start);

        let mut request = Request::new(http::Method::POST, "/up", "HTTP/1.1");
        request.headers = Headers::from_pairs([("Transfer-Encoding", "chunked")]);
        let mut commands = feed(&mut client, Event::Http(HttpEvent::RequestHeaders { stream_id: 5, request, end_stream: false }));
        commands.extend(feed(&mut client, Event::Http(HttpEvent::RequestData { stream_id: 5, data: Bytes::from_static(b"hey") })));
        commands.extend(feed(&mut client, Event::Http(HttpEvent::RequestEndOfMessage { stream_id: 5 })));
        assert_eq!(
            sent(&commands, &server_conn),
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nhey\r\n0\r\n\r\n"
        );

        let commands = feed(&mut client, Event::data_received(&server_conn, "HTTP/1.0 200 OK\r\n\r\nbody"));
        let events = received(&commands);
        assert!(matches!(events[0], HttpEvent::ResponseHeaders { stream_id: 5, .. }));
        assert!(matches!(events[1], HttpEvent::ResponseData { data, .. } if &data[..] == b"body"));

        let commands = feed(&mut client, peer_closed(&server_conn));
        assert!(matches!(received(&commands)[0], HttpEvent::ResponseEndOfMessage { stream_id: 5 }));
        assert!(closes(&commands, &server_conn));
    }

    #[test]
    fn http2_request_is_downgraded() {
        let ctx = context_to("example.com", 443);
        let server_conn = ctx.server.clone();
        let mut client = Engine::new(Http1Connection::client(ctx.clone()), &ctx);
        feed(&mut client, Event::Start);
        let mut request = Request::new(http::Method::GET, "/", "HTTP/2.0");
        request.scheme = "https".to_string();
        request.authority = "example.com".to_string();
        request.headers = Headers::from_pairs([("cookie", "a=1"), ("cookie", "b=2")]);
        let commands = feed(&mut client, Event::Http(HttpEvent::RequestHeaders { stream_id: 1, request, end_stream: true }));
        assert_eq!(
            sent(&commands, &server_conn),
            b"GET / HTTP/1.1\r\nHost: example.com\r\ncookie: a=1; b=2\r\n\r\n"
        );
    }
}
