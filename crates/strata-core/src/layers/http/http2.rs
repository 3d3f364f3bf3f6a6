//! HTTP/2 connection handlers.
//!
//! A small sans-I/O frame codec with HPACK from the `hpack` crate. We keep
//! just enough protocol state to multiplex exchanges: stream bookkeeping,
//! send-side flow control, SETTINGS, PING and GOAWAY. Received DATA is
//! acknowledged immediately, the HTTP layer applies its own backpressure.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use thiserror::Error;
use tracing::Level;

use crate::commands::{Command, CommandId};
use crate::connection::ConnectionRef;
use crate::context::Context;
use crate::error::Result;
use crate::events::{Event, Reply};
use crate::layer::{unexpected, Handler, LayerKind};
use crate::message::{latin1_decode, latin1_encode, make_error_response, Headers, Request, Response};

use super::events::{ErrorCode, HttpEvent, StreamId};
use super::http1::parse_authority;

/// Sent by the client before any frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const MAX_ALLOWED_FRAME_SIZE: usize = (1 << 24) - 1;
const DEFAULT_WINDOW: i64 = 65_535;
const MAX_WINDOW: i64 = (1 << 31) - 1;
/// Concurrency assumed for our requests until the server's SETTINGS arrive.
const PROVISIONAL_MAX_CONCURRENT: usize = 10;
const OUR_MAX_CONCURRENT: u32 = 100;

pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// RFC 9113 error codes, as carried by RST_STREAM and GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl Reason {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0 => Reason::NoError,
            0x1 => Reason::ProtocolError,
            0x2 => Reason::InternalError,
            0x3 => Reason::FlowControlError,
            0x4 => Reason::SettingsTimeout,
            0x5 => Reason::StreamClosed,
            0x6 => Reason::FrameSizeError,
            0x7 => Reason::RefusedStream,
            0x8 => Reason::Cancel,
            0x9 => Reason::CompressionError,
            0xa => Reason::ConnectError,
            0xb => Reason::EnhanceYourCalm,
            0xc => Reason::InadequateSecurity,
            0xd => Reason::Http11Required,
            other => Reason::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Reason::NoError => 0x0,
            Reason::ProtocolError => 0x1,
            Reason::InternalError => 0x2,
            Reason::FlowControlError => 0x3,
            Reason::SettingsTimeout => 0x4,
            Reason::StreamClosed => 0x5,
            Reason::FrameSizeError => 0x6,
            Reason::RefusedStream => 0x7,
            Reason::Cancel => 0x8,
            Reason::CompressionError => 0x9,
            Reason::ConnectError => 0xa,
            Reason::EnhanceYourCalm => 0xb,
            Reason::InadequateSecurity => 0xc,
            Reason::Http11Required => 0xd,
            Reason::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::NoError => "NO_ERROR",
            Reason::ProtocolError => "PROTOCOL_ERROR",
            Reason::InternalError => "INTERNAL_ERROR",
            Reason::FlowControlError => "FLOW_CONTROL_ERROR",
            Reason::SettingsTimeout => "SETTINGS_TIMEOUT",
            Reason::StreamClosed => "STREAM_CLOSED",
            Reason::FrameSizeError => "FRAME_SIZE_ERROR",
            Reason::RefusedStream => "REFUSED_STREAM",
            Reason::Cancel => "CANCEL",
            Reason::CompressionError => "COMPRESSION_ERROR",
            Reason::ConnectError => "CONNECT_ERROR",
            Reason::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Reason::InadequateSecurity => "INADEQUATE_SECURITY",
            Reason::Http11Required => "HTTP_1_1_REQUIRED",
            Reason::Unknown(code) => return write!(f, "{}", code),
        };
        f.write_str(name)
    }
}

/// A connection-level protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FrameError {
    pub reason: Reason,
    pub message: String,
}

impl FrameError {
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            reason: Reason::ProtocolError,
            message: message.into(),
        }
    }

    fn frame_size(message: impl Into<String>) -> Self {
        Self {
            reason: Reason::FrameSizeError,
            message: message.into(),
        }
    }
}

/// The fixed nine-byte prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            kind: buf[3],
            flags: buf[4],
            stream_id,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let id = (self.stream_id & 0x7fff_ffff).to_be_bytes();
        [len[1], len[2], len[3], self.kind, self.flags, id[0], id[1], id[2], id[3]]
    }
}

/// A decoded frame. Header blocks are left HPACK-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload length including padding, which counts against flow control.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        reason: Reason,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        reason: Reason,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

fn strip_padding(header: &FrameHeader, mut payload: Bytes) -> std::result::Result<Bytes, FrameError> {
    if header.flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameError::protocol("padded frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(FrameError::protocol("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

fn read_u32(payload: &[u8]) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

fn require_stream(header: &FrameHeader, name: &str) -> std::result::Result<(), FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::protocol(format!("{} frame on stream 0", name)));
    }
    Ok(())
}

fn require_connection(header: &FrameHeader, name: &str) -> std::result::Result<(), FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::protocol(format!("{} frame on stream {}", name, header.stream_id)));
    }
    Ok(())
}

/// Takes one complete frame off the front of `buf`. `Ok(None)` means more
/// bytes are needed.
pub fn decode_frame(buf: &mut BytesMut, max_frame_size: usize) -> std::result::Result<Option<Frame>, FrameError> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };
    let length = header.length as usize;
    if length > max_frame_size {
        return Err(FrameError::frame_size(format!(
            "frame of {} bytes exceeds maximum of {}",
            length, max_frame_size
        )));
    }
    if buf.len() < FRAME_HEADER_LEN + length {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(length).freeze();
    let stream_id = header.stream_id;

    let frame = match header.kind {
        kind::DATA => {
            require_stream(&header, "DATA")?;
            Frame::Data {
                stream_id,
                data: strip_padding(&header, payload)?,
                end_stream: header.flags & flags::END_STREAM != 0,
                flow_len: header.length,
            }
        }
        kind::HEADERS => {
            require_stream(&header, "HEADERS")?;
            let mut block = strip_padding(&header, payload)?;
            if header.flags & flags::PRIORITY != 0 {
                if block.len() < 5 {
                    return Err(FrameError::frame_size("HEADERS priority fields truncated"));
                }
                block.advance(5);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream: header.flags & flags::END_STREAM != 0,
                end_headers: header.flags & flags::END_HEADERS != 0,
            }
        }
        kind::PRIORITY => {
            require_stream(&header, "PRIORITY")?;
            if length != 5 {
                return Err(FrameError::frame_size("PRIORITY frame must be 5 bytes"));
            }
            Frame::Priority { stream_id }
        }
        kind::RST_STREAM => {
            require_stream(&header, "RST_STREAM")?;
            if length != 4 {
                return Err(FrameError::frame_size("RST_STREAM frame must be 4 bytes"));
            }
            Frame::RstStream {
                stream_id,
                reason: Reason::from_code(read_u32(&payload)),
            }
        }
        kind::SETTINGS => {
            require_connection(&header, "SETTINGS")?;
            let ack = header.flags & flags::ACK != 0;
            if ack && length != 0 {
                return Err(FrameError::frame_size("SETTINGS ack with payload"));
            }
            if length % 6 != 0 {
                return Err(FrameError::frame_size("SETTINGS payload is not a multiple of 6"));
            }
            let values = payload
                .chunks_exact(6)
                .map(|c| (u16::from_be_bytes([c[0], c[1]]), read_u32(&c[2..])))
                .collect();
            Frame::Settings { ack, values }
        }
        kind::PUSH_PROMISE => {
            require_stream(&header, "PUSH_PROMISE")?;
            let block = strip_padding(&header, payload)?;
            if block.len() < 4 {
                return Err(FrameError::frame_size("PUSH_PROMISE frame truncated"));
            }
            Frame::PushPromise {
                stream_id,
                promised_id: read_u32(&block) & 0x7fff_ffff,
            }
        }
        kind::PING => {
            require_connection(&header, "PING")?;
            if length != 8 {
                return Err(FrameError::frame_size("PING frame must be 8 bytes"));
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                ack: header.flags & flags::ACK != 0,
                payload: data,
            }
        }
        kind::GOAWAY => {
            require_connection(&header, "GOAWAY")?;
            if length < 8 {
                return Err(FrameError::frame_size("GOAWAY frame truncated"));
            }
            Frame::GoAway {
                last_stream_id: read_u32(&payload) & 0x7fff_ffff,
                reason: Reason::from_code(read_u32(&payload[4..])),
                debug: payload.slice(8..),
            }
        }
        kind::WINDOW_UPDATE => {
            if length != 4 {
                return Err(FrameError::frame_size("WINDOW_UPDATE frame must be 4 bytes"));
            }
            let increment = read_u32(&payload) & 0x7fff_ffff;
            if increment == 0 {
                return Err(FrameError::protocol("WINDOW_UPDATE with zero increment"));
            }
            Frame::WindowUpdate { stream_id, increment }
        }
        kind::CONTINUATION => {
            require_stream(&header, "CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: header.flags & flags::END_HEADERS != 0,
            }
        }
        other => Frame::Unknown { kind: other, stream_id },
    };
    Ok(Some(frame))
}

/// Appends one frame to `out`.
pub fn encode_frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8], out: &mut Vec<u8>) {
    let header = FrameHeader {
        length: payload.len() as u32,
        kind,
        flags,
        stream_id,
    };
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
}

fn encode_settings(values: &[(u16, u32)], out: &mut Vec<u8>) {
    let mut payload = Vec::with_capacity(values.len() * 6);
    for (id, value) in values {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    encode_frame(kind::SETTINGS, 0, 0, &payload, out);
}

/// HPACK state for both directions.
struct Hpack {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl fmt::Debug for Hpack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hpack")
    }
}

type Fields = Vec<(Vec<u8>, Vec<u8>)>;

/// Headers that only mean something on an HTTP/1 connection.
const CONNECTION_SPECIFIC: &[&str] = &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// Lowercases names and, for messages that came from HTTP/1, drops the
/// hop-by-hop headers HTTP/2 forbids.
fn normalize_fields(headers: &Headers, from_http1: bool, fields: &mut Fields) {
    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if from_http1 {
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            if name == "te" && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
        }
        fields.push((name.into_bytes(), latin1_encode(value)));
    }
}

fn split_pseudo_headers(fields: Fields) -> std::result::Result<(HashMap<String, String>, Headers), String> {
    let mut pseudo: HashMap<String, String> = HashMap::new();
    let mut headers = Headers::new();
    let mut regular_seen = false;
    for (name, value) in fields {
        let name = latin1_decode(&name);
        let value = latin1_decode(&value);
        if name.starts_with(':') {
            if regular_seen {
                return Err(format!("Pseudo header {} after regular headers", name));
            }
            if pseudo.contains_key(&name) {
                return Err(format!("Duplicate HTTP/2 pseudo header: {}", name));
            }
            pseudo.insert(name, value);
        } else {
            regular_seen = true;
            headers.append(name, value);
        }
    }
    Ok((pseudo, headers))
}

fn take_pseudo(pseudo: &mut HashMap<String, String>, name: &str) -> std::result::Result<String, String> {
    pseudo
        .remove(name)
        .ok_or_else(|| format!("Required pseudo header is missing: {}", name))
}

fn reject_unknown_pseudo(pseudo: HashMap<String, String>) -> std::result::Result<(), String> {
    if pseudo.is_empty() {
        return Ok(());
    }
    let mut names: Vec<String> = pseudo.into_keys().collect();
    names.sort();
    Err(format!("Unknown pseudo headers: {}", names.join(", ")))
}

/// Builds a request from a decoded HEADERS block.
pub fn parse_request_fields(fields: Fields) -> std::result::Result<Request, String> {
    let (mut pseudo, headers) = split_pseudo_headers(fields)?;
    let method = take_pseudo(&mut pseudo, ":method")?;
    // Extended CONNECT is not supported, so a CONNECT fails here for lack of :scheme.
    let scheme = take_pseudo(&mut pseudo, ":scheme")?;
    let path = take_pseudo(&mut pseudo, ":path")?;
    let authority = pseudo.remove(":authority").unwrap_or_default();
    reject_unknown_pseudo(pseudo)?;

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| format!("Invalid HTTP/2 method: {}", method))?;
    let mut request = Request::new(method, path, "HTTP/2.0");
    if authority.is_empty() {
        request.host = String::new();
        request.port = 0;
    } else {
        let (host, port) = parse_authority(&authority)?;
        request.host = host;
        request.port = port.unwrap_or(if scheme == "http" { 80 } else { 443 });
    }
    request.scheme = scheme;
    request.authority = authority;
    request.headers = headers;
    Ok(request)
}

/// Builds a response from a decoded HEADERS block.
pub fn parse_response_fields(fields: Fields) -> std::result::Result<Response, String> {
    let (mut pseudo, headers) = split_pseudo_headers(fields)?;
    let status = take_pseudo(&mut pseudo, ":status")?;
    reject_unknown_pseudo(pseudo)?;
    let status_code = status
        .parse::<u16>()
        .map_err(|_| format!("Invalid HTTP/2 status code: {}", status))?;
    let mut response = Response::new("HTTP/2.0", status_code, "");
    response.headers = headers;
    Ok(response)
}

fn request_fields(request: &Request) -> Fields {
    let mut fields: Fields = vec![
        (b":method".to_vec(), request.method.as_str().as_bytes().to_vec()),
        (b":scheme".to_vec(), request.scheme.as_bytes().to_vec()),
        (b":path".to_vec(), latin1_encode(&request.path)),
    ];
    let mut headers = request.headers.clone();
    if !request.authority.is_empty() {
        fields.push((b":authority".to_vec(), latin1_encode(&request.authority)));
    } else if !request.is_http2() {
        if let Some(host) = headers.get("host").map(str::to_string) {
            fields.push((b":authority".to_vec(), latin1_encode(&host)));
            headers.remove("host");
        }
    }
    normalize_fields(&headers, !request.is_http2(), &mut fields);
    fields
}

fn response_fields(response: &Response) -> Fields {
    let mut fields: Fields = vec![(b":status".to_vec(), response.status_code.to_string().into_bytes())];
    normalize_fields(&response.headers, !response.is_http2(), &mut fields);
    fields
}

fn trailer_fields(trailers: &Headers) -> Fields {
    let mut fields = Fields::new();
    normalize_fields(trailers, false, &mut fields);
    fields
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Open,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::Open => "open",
            State::Done => "done",
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Data(Bytes),
    Trailers(Headers),
    End,
}

#[derive(Debug)]
struct Stream {
    /// The id the HTTP layer knows this exchange by.
    outer: StreamId,
    /// Still waiting for the peer's (final) header block.
    expecting_headers: bool,
    recv_open: bool,
    send_open: bool,
    /// We have sent a final header block on this stream.
    headers_sent: bool,
    send_window: i64,
    pending: VecDeque<Outgoing>,
}

impl Stream {
    fn new(outer: StreamId, send_window: i64) -> Self {
        Self {
            outer,
            expecting_headers: true,
            recv_open: true,
            send_open: true,
            headers_sent: false,
            send_window,
            pending: VecDeque::new(),
        }
    }

    fn finished(&self) -> bool {
        !self.recv_open && !self.send_open
    }
}

/// A header block spread over HEADERS and CONTINUATION frames.
#[derive(Debug)]
struct PartialHeaders {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

#[derive(Debug)]
struct PeerSettings {
    max_concurrent_streams: Option<u32>,
    max_frame_size: usize,
    initial_window: i64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            initial_window: DEFAULT_WINDOW,
        }
    }
}

/// An HTTP/2 connection towards the client (`server`) or a server (`client`).
#[derive(Debug)]
pub struct Http2Connection {
    ctx: Context,
    conn: ConnectionRef,
    role: Role,
    state: State,
    buf: BytesMut,
    preface_seen: bool,
    hpack: Hpack,
    /// Keyed by the id on the wire.
    streams: BTreeMap<u32, Stream>,
    /// Outer stream id to wire id, for streams we opened.
    wire_ids: HashMap<StreamId, u32>,
    next_stream_id: u32,
    /// Highest stream id the peer has opened.
    last_peer_stream: u32,
    partial: Option<PartialHeaders>,
    peer: PeerSettings,
    settings_received: bool,
    send_window: i64,
    /// Requests waiting for a free concurrency slot, oldest first.
    queued: VecDeque<(StreamId, Vec<HttpEvent>)>,
    wakeup: Option<CommandId>,
    active_since_wakeup: bool,
    output: Vec<u8>,
}

impl Http2Connection {
    /// Reads requests from `ctx.client`.
    pub fn server(ctx: Context) -> Self {
        let conn = ctx.client.clone();
        Self::new(ctx, conn, Role::Server)
    }

    /// Sends requests to `ctx.server`.
    pub fn client(ctx: Context) -> Self {
        let conn = ctx.server.clone();
        Self::new(ctx, conn, Role::Client)
    }

    fn new(ctx: Context, conn: ConnectionRef, role: Role) -> Self {
        Self {
            ctx,
            conn,
            role,
            state: State::Start,
            buf: BytesMut::new(),
            preface_seen: role == Role::Client,
            hpack: Hpack {
                encoder: hpack::Encoder::new(),
                decoder: hpack::Decoder::new(),
            },
            streams: BTreeMap::new(),
            wire_ids: HashMap::new(),
            next_stream_id: 1,
            last_peer_stream: 0,
            partial: None,
            peer: PeerSettings::default(),
            settings_received: false,
            send_window: DEFAULT_WINDOW,
            queued: VecDeque::new(),
            wakeup: None,
            active_since_wakeup: false,
            output: Vec::new(),
        }
    }

    /// Streams currently open on the wire.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    fn peer_name(&self) -> &'static str {
        match self.role {
            Role::Server => "client",
            Role::Client => "server",
        }
    }

    fn flush_output(&mut self, out: &mut Vec<Command>) {
        if !self.output.is_empty() {
            let data = std::mem::take(&mut self.output);
            out.push(Command::send_data(&self.conn, data));
        }
    }

    fn receive_protocol_error(&self, stream_id: StreamId, message: String, code: Option<ErrorCode>) -> HttpEvent {
        match self.role {
            Role::Server => HttpEvent::RequestProtocolError {
                stream_id,
                message,
                code: code.unwrap_or(ErrorCode::GenericClientError),
            },
            Role::Client => HttpEvent::ResponseProtocolError {
                stream_id,
                message,
                code: code.unwrap_or(ErrorCode::GenericServerError),
            },
        }
    }

    fn receive_data(&self, stream_id: StreamId, data: Bytes) -> HttpEvent {
        match self.role {
            Role::Server => HttpEvent::RequestData { stream_id, data },
            Role::Client => HttpEvent::ResponseData { stream_id, data },
        }
    }

    fn receive_trailers(&self, stream_id: StreamId, trailers: Headers) -> HttpEvent {
        match self.role {
            Role::Server => HttpEvent::RequestTrailers { stream_id, trailers },
            Role::Client => HttpEvent::ResponseTrailers { stream_id, trailers },
        }
    }

    fn receive_end_of_message(&self, stream_id: StreamId) -> HttpEvent {
        match self.role {
            Role::Server => HttpEvent::RequestEndOfMessage { stream_id },
            Role::Client => HttpEvent::ResponseEndOfMessage { stream_id },
        }
    }

    fn start(&mut self, out: &mut Vec<Command>) {
        self.state = State::Open;
        match self.role {
            Role::Server => {
                encode_settings(&[(setting::MAX_CONCURRENT_STREAMS, OUR_MAX_CONCURRENT)], &mut self.output);
            }
            Role::Client => {
                self.output.extend_from_slice(PREFACE);
                encode_settings(
                    &[
                        (setting::ENABLE_PUSH, 0),
                        (setting::MAX_CONCURRENT_STREAMS, OUR_MAX_CONCURRENT),
                    ],
                    &mut self.output,
                );
                self.flush_output(out);
                self.request_wakeup(out);
            }
        }
        self.flush_output(out);
    }

    fn request_wakeup(&mut self, out: &mut Vec<Command>) {
        if let Some(delay) = self.ctx.options.keepalive_interval() {
            let command = Command::request_wakeup(delay);
            self.wakeup = Some(command.id);
            out.push(command);
        }
    }

    /// Pings an idle server so middleboxes keep the connection around.
    fn keepalive(&mut self, out: &mut Vec<Command>) {
        self.wakeup = None;
        if self.state != State::Open {
            return;
        }
        if !self.active_since_wakeup {
            encode_frame(kind::PING, 0, 0, b"00000000", &mut self.output);
            self.flush_output(out);
        }
        self.active_since_wakeup = false;
        self.request_wakeup(out);
    }

    /// Sends GOAWAY and tears the connection down.
    fn protocol_error(&mut self, error: FrameError, out: &mut Vec<Command>) {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.last_peer_stream.to_be_bytes());
        payload.extend_from_slice(&error.reason.code().to_be_bytes());
        encode_frame(kind::GOAWAY, 0, 0, &payload, &mut self.output);
        out.push(Command::log(
            format!("HTTP/2 protocol error: {}", error.message),
            Level::INFO,
        ));
        self.close_connection(error.message, out);
    }

    /// Closes the connection and fails every exchange still on it.
    fn close_connection(&mut self, message: String, out: &mut Vec<Command>) {
        self.flush_output(out);
        out.push(Command::close_connection(&self.conn));
        let streams = std::mem::take(&mut self.streams);
        for stream in streams.into_values() {
            let event = self.receive_protocol_error(stream.outer, message.clone(), None);
            out.push(Command::receive_http(event));
        }
        for (outer, _) in std::mem::take(&mut self.queued) {
            let event = self.receive_protocol_error(outer, message.clone(), None);
            out.push(Command::receive_http(event));
        }
        self.wire_ids.clear();
        self.partial = None;
        self.state = State::Done;
    }

    fn data_received(&mut self, data: Bytes, out: &mut Vec<Command>) {
        self.active_since_wakeup = true;
        self.buf.extend_from_slice(&data);
        if !self.preface_seen {
            let n = self.buf.len().min(PREFACE.len());
            if self.buf[..n] != PREFACE[..n] {
                self.protocol_error(FrameError::protocol("Invalid HTTP/2 connection preface"), out);
                return;
            }
            if n < PREFACE.len() {
                return;
            }
            self.buf.advance(PREFACE.len());
            self.preface_seen = true;
        }
        while self.state == State::Open {
            match decode_frame(&mut self.buf, DEFAULT_MAX_FRAME_SIZE) {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_frame(frame, out) {
                        self.protocol_error(e, out);
                    }
                }
                Ok(None) => break,
                Err(e) => self.protocol_error(e, out),
            }
        }
        self.flush_output(out);
    }

    fn handle_frame(&mut self, frame: Frame, out: &mut Vec<Command>) -> std::result::Result<(), FrameError> {
        if let Some(partial) = self.partial.as_ref() {
            let continues = matches!(&frame, Frame::Continuation { stream_id, .. } if *stream_id == partial.stream_id);
            if !continues {
                return Err(FrameError::protocol("Expected CONTINUATION frame"));
            }
        }
        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => self.handle_data(stream_id, data, end_stream, flow_len, out),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.handle_headers(stream_id, &block, end_stream, out)
                } else {
                    self.partial = Some(PartialHeaders {
                        stream_id,
                        block: BytesMut::from(&block[..]),
                        end_stream,
                    });
                    Ok(())
                }
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let Some(mut partial) = self.partial.take() else {
                    return Err(FrameError::protocol("Unexpected CONTINUATION frame"));
                };
                partial.block.extend_from_slice(&block);
                if end_headers {
                    self.handle_headers(stream_id, &partial.block, partial.end_stream, out)
                } else {
                    self.partial = Some(partial);
                    Ok(())
                }
            }
            Frame::Settings { ack: true, .. } => Ok(()),
            Frame::Settings { ack: false, values } => self.handle_settings(values, out),
            Frame::Ping { ack: false, payload } => {
                encode_frame(kind::PING, flags::ACK, 0, &payload, &mut self.output);
                Ok(())
            }
            Frame::Ping { ack: true, .. } => Ok(()),
            Frame::GoAway { reason, .. } => {
                self.close_connection(format!("HTTP/2 connection closed: {}", reason), out);
                Ok(())
            }
            Frame::WindowUpdate { stream_id: 0, increment } => {
                self.send_window += i64::from(increment);
                if self.send_window > MAX_WINDOW {
                    return Err(FrameError {
                        reason: Reason::FlowControlError,
                        message: "connection flow-control window overflow".to_string(),
                    });
                }
                let ids: Vec<u32> = self.streams.keys().copied().collect();
                for id in ids {
                    self.flush_stream(id, out);
                }
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window += i64::from(increment);
                    self.flush_stream(stream_id, out);
                }
                Ok(())
            }
            Frame::RstStream { stream_id, reason } => {
                self.handle_reset(stream_id, reason, out);
                Ok(())
            }
            Frame::Priority { .. } => Ok(()),
            Frame::PushPromise { .. } => {
                out.push(Command::log(
                    "Received HTTP/2 push promise, even though we signalled no support.",
                    Level::ERROR,
                ));
                Ok(())
            }
            Frame::Unknown { kind, .. } => {
                out.push(Command::log(
                    format!("Ignoring unknown HTTP/2 frame type: {:#x}", kind),
                    Level::DEBUG,
                ));
                Ok(())
            }
        }
    }

    fn handle_settings(&mut self, values: Vec<(u16, u32)>, out: &mut Vec<Command>) -> std::result::Result<(), FrameError> {
        for (id, value) in values {
            match id {
                setting::MAX_CONCURRENT_STREAMS => self.peer.max_concurrent_streams = Some(value),
                setting::INITIAL_WINDOW_SIZE => {
                    let value = i64::from(value);
                    if value > MAX_WINDOW {
                        return Err(FrameError {
                            reason: Reason::FlowControlError,
                            message: "initial window size too large".to_string(),
                        });
                    }
                    let delta = value - self.peer.initial_window;
                    self.peer.initial_window = value;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                setting::MAX_FRAME_SIZE => {
                    let size = value as usize;
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&size) {
                        return Err(FrameError::protocol(format!("invalid max frame size: {}", size)));
                    }
                    self.peer.max_frame_size = size;
                }
                setting::ENABLE_PUSH if value > 1 => {
                    return Err(FrameError::protocol("invalid ENABLE_PUSH value"));
                }
                // HEADER_TABLE_SIZE and MAX_HEADER_LIST_SIZE are advisory for us.
                _ => {}
            }
        }
        self.settings_received = true;
        encode_frame(kind::SETTINGS, flags::ACK, 0, &[], &mut self.output);
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.flush_stream(id, out);
        }
        self.dequeue(out);
        Ok(())
    }

    fn handle_headers(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        out: &mut Vec<Command>,
    ) -> std::result::Result<(), FrameError> {
        let fields = self.hpack.decoder.decode(block).map_err(|e| FrameError {
            reason: Reason::CompressionError,
            message: format!("Invalid HPACK block: {:?}", e),
        })?;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return match self.role {
                Role::Server => self.new_request(stream_id, fields, end_stream, out),
                Role::Client if stream_id < self.next_stream_id => Ok(()),
                Role::Client => Err(FrameError::protocol(format!(
                    "Received HEADERS for unknown stream {}",
                    stream_id
                ))),
            };
        };
        if !stream.recv_open {
            return Err(FrameError {
                reason: Reason::StreamClosed,
                message: format!("Received HEADERS on closed stream {}", stream_id),
            });
        }
        let outer = stream.outer;
        if stream.expecting_headers {
            // Only the client side waits for headers on a known stream.
            let response = match parse_response_fields(fields) {
                Ok(response) => response,
                Err(e) => {
                    self.reset_stream(stream_id, Reason::ProtocolError);
                    let event = self.receive_protocol_error(outer, format!("Invalid HTTP/2 response: {}", e), None);
                    out.push(Command::receive_http(event));
                    return Ok(());
                }
            };
            if (100..200).contains(&response.status_code) && response.status_code != 101 {
                out.push(Command::log(
                    format!("Swallowing HTTP/2 informational response: {}", response.status_code),
                    Level::INFO,
                ));
                return Ok(());
            }
            stream.expecting_headers = false;
            out.push(Command::receive_http(HttpEvent::ResponseHeaders {
                stream_id: outer,
                response,
                end_stream,
            }));
        } else {
            let (_, trailers) = split_pseudo_headers(fields).map_err(FrameError::protocol)?;
            out.push(Command::receive_http(self.receive_trailers(outer, trailers)));
        }
        if end_stream {
            self.end_received(stream_id, out);
        }
        Ok(())
    }

    fn new_request(
        &mut self,
        stream_id: u32,
        fields: Fields,
        end_stream: bool,
        out: &mut Vec<Command>,
    ) -> std::result::Result<(), FrameError> {
        if stream_id % 2 == 0 || stream_id <= self.last_peer_stream {
            return Err(FrameError::protocol(format!("Invalid stream id {} for new request", stream_id)));
        }
        self.last_peer_stream = stream_id;
        let request = match parse_request_fields(fields) {
            Ok(request) => request,
            Err(e) => {
                let peer = self
                    .conn
                    .read()
                    .peername
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                out.push(Command::log(format!("{}: {}", peer, e), Level::INFO));
                encode_frame(
                    kind::RST_STREAM,
                    0,
                    stream_id,
                    &Reason::ProtocolError.code().to_be_bytes(),
                    &mut self.output,
                );
                return Ok(());
            }
        };
        let mut stream = Stream::new(stream_id, self.peer.initial_window);
        stream.expecting_headers = false;
        self.streams.insert(stream_id, stream);
        out.push(Command::receive_http(HttpEvent::RequestHeaders {
            stream_id,
            request,
            end_stream,
        }));
        if end_stream {
            self.end_received(stream_id, out);
        }
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
        out: &mut Vec<Command>,
    ) -> std::result::Result<(), FrameError> {
        if flow_len > 0 {
            // Acknowledge right away; buffering is the HTTP layer's concern.
            let increment = flow_len.to_be_bytes();
            encode_frame(kind::WINDOW_UPDATE, 0, 0, &increment, &mut self.output);
            if !end_stream && self.streams.contains_key(&stream_id) {
                encode_frame(kind::WINDOW_UPDATE, 0, stream_id, &increment, &mut self.output);
            }
        }
        let Some(stream) = self.streams.get(&stream_id) else {
            return Ok(());
        };
        if stream.expecting_headers {
            return Err(FrameError::protocol("Received HTTP/2 data frame, expected headers."));
        }
        if !stream.recv_open {
            return Err(FrameError {
                reason: Reason::StreamClosed,
                message: format!("Received DATA on closed stream {}", stream_id),
            });
        }
        let outer = stream.outer;
        if !data.is_empty() {
            out.push(Command::receive_http(self.receive_data(outer, data)));
        }
        if end_stream {
            self.end_received(stream_id, out);
        }
        Ok(())
    }

    fn end_received(&mut self, stream_id: u32, out: &mut Vec<Command>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        stream.recv_open = false;
        let outer = stream.outer;
        out.push(Command::receive_http(self.receive_end_of_message(outer)));
        self.reap(stream_id, out);
    }

    fn handle_reset(&mut self, stream_id: u32, reason: Reason, out: &mut Vec<Command>) {
        let Some(stream) = self.streams.remove(&stream_id) else {
            return;
        };
        self.wire_ids.remove(&stream.outer);
        let code = match reason {
            Reason::Cancel => Some(ErrorCode::Cancel),
            Reason::Http11Required => Some(ErrorCode::Http11Required),
            _ => None,
        };
        let message = format!("stream reset by {} ({})", self.peer_name(), reason);
        out.push(Command::receive_http(self.receive_protocol_error(stream.outer, message, code)));
        self.dequeue(out);
    }

    fn reset_stream(&mut self, stream_id: u32, reason: Reason) {
        encode_frame(kind::RST_STREAM, 0, stream_id, &reason.code().to_be_bytes(), &mut self.output);
        if let Some(stream) = self.streams.remove(&stream_id) {
            self.wire_ids.remove(&stream.outer);
        }
    }

    /// Forgets a stream once both directions are done.
    fn reap(&mut self, stream_id: u32, out: &mut Vec<Command>) {
        let finished = self.streams.get(&stream_id).map(Stream::finished).unwrap_or(false);
        if finished {
            if let Some(stream) = self.streams.remove(&stream_id) {
                self.wire_ids.remove(&stream.outer);
            }
            self.dequeue(out);
        }
    }

    fn send_headers(&mut self, stream_id: u32, fields: &Fields, end_stream: bool) {
        let block = self
            .hpack
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        let max = self.peer.max_frame_size;
        let mut chunks = block.chunks(max).peekable();
        let first = chunks.next().unwrap_or(&[]);
        let mut flags = if end_stream { flags::END_STREAM } else { 0 };
        if chunks.peek().is_none() {
            flags |= flags::END_HEADERS;
        }
        encode_frame(kind::HEADERS, flags, stream_id, first, &mut self.output);
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() { flags::END_HEADERS } else { 0 };
            encode_frame(kind::CONTINUATION, flags, stream_id, chunk, &mut self.output);
        }
    }

    /// Writes as much queued output for a stream as the windows allow.
    fn flush_stream(&mut self, stream_id: u32, out: &mut Vec<Command>) {
        let Some(mut stream) = self.streams.remove(&stream_id) else {
            return;
        };
        while let Some(item) = stream.pending.pop_front() {
            match item {
                Outgoing::Data(data) if data.is_empty() => {}
                Outgoing::Data(mut data) => {
                    let allowed = self
                        .send_window
                        .min(stream.send_window)
                        .min(self.peer.max_frame_size as i64);
                    if allowed <= 0 {
                        stream.pending.push_front(Outgoing::Data(data));
                        break;
                    }
                    let n = data.len().min(allowed as usize);
                    let chunk = data.split_to(n);
                    encode_frame(kind::DATA, 0, stream_id, &chunk, &mut self.output);
                    self.send_window -= n as i64;
                    stream.send_window -= n as i64;
                    if !data.is_empty() {
                        stream.pending.push_front(Outgoing::Data(data));
                    }
                }
                Outgoing::Trailers(trailers) => {
                    let fields = trailer_fields(&trailers);
                    self.send_headers(stream_id, &fields, true);
                    stream.send_open = false;
                    stream.pending.clear();
                }
                Outgoing::End => {
                    encode_frame(kind::DATA, flags::END_STREAM, stream_id, &[], &mut self.output);
                    stream.send_open = false;
                    stream.pending.clear();
                }
            }
        }
        self.streams.insert(stream_id, stream);
        self.reap(stream_id, out);
    }

    fn can_open_stream(&self) -> bool {
        let limit = match self.peer.max_concurrent_streams {
            Some(limit) => limit as usize,
            None if self.settings_received => usize::MAX,
            None => PROVISIONAL_MAX_CONCURRENT,
        };
        self.streams.len() < limit
    }

    /// Opens queued requests while slots are free.
    fn dequeue(&mut self, out: &mut Vec<Command>) {
        while self.state == State::Open && self.can_open_stream() {
            let Some((_, events)) = self.queued.pop_front() else {
                break;
            };
            for event in events {
                self.send_request_event(event, out);
            }
        }
    }

    fn send(&mut self, event: HttpEvent, out: &mut Vec<Command>) -> Result<()> {
        self.active_since_wakeup = true;
        match (self.role, event.is_request()) {
            (Role::Server, false) => self.send_response_event(event),
            (Role::Client, true) => self.send_request_event(event, out),
            (_, _) => return Err(unexpected(self.kind(), "send", &Event::Http(event))),
        }
        self.flush_output(out);
        Ok(())
    }

    fn send_response_event(&mut self, event: HttpEvent) {
        let stream_id = event.stream_id();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.send_open {
            return;
        }
        match event {
            HttpEvent::ResponseHeaders {
                response, end_stream, ..
            } => {
                if response.status_code >= 200 {
                    stream.headers_sent = true;
                }
                if end_stream {
                    stream.send_open = false;
                }
                let fields = response_fields(&response);
                self.send_headers(stream_id, &fields, end_stream);
                let mut ignored = Vec::new();
                self.reap(stream_id, &mut ignored);
            }
            HttpEvent::ResponseData { data, .. } => self.queue(stream_id, Outgoing::Data(data)),
            HttpEvent::ResponseTrailers { trailers, .. } => self.queue(stream_id, Outgoing::Trailers(trailers)),
            HttpEvent::ResponseEndOfMessage { .. } => self.queue(stream_id, Outgoing::End),
            HttpEvent::ResponseProtocolError { message, code, .. } => {
                let status = code.http_status_code();
                match status {
                    Some(status) if !stream.headers_sent => {
                        let response = make_error_response(status, &message);
                        stream.headers_sent = true;
                        stream.pending.clear();
                        let fields = response_fields(&response);
                        let body = response.content.unwrap_or_default();
                        self.send_headers(stream_id, &fields, false);
                        self.queue(stream_id, Outgoing::Data(body));
                        self.queue(stream_id, Outgoing::End);
                        // Nothing more will be read for this exchange.
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.recv_open = false;
                        }
                        let mut ignored = Vec::new();
                        self.reap(stream_id, &mut ignored);
                    }
                    _ => self.reset_stream(stream_id, reset_reason(code)),
                }
            }
            _ => {}
        }
    }

    fn queue(&mut self, stream_id: u32, item: Outgoing) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.pending.push_back(item);
        }
        let mut ignored = Vec::new();
        self.flush_stream(stream_id, &mut ignored);
    }

    fn send_request_event(&mut self, event: HttpEvent, out: &mut Vec<Command>) {
        let outer = event.stream_id();
        if let Some((_, events)) = self.queued.iter_mut().find(|(id, _)| *id == outer) {
            if let HttpEvent::RequestProtocolError { .. } = event {
                self.queued.retain(|(id, _)| *id != outer);
            } else {
                events.push(event);
            }
            return;
        }
        if let HttpEvent::RequestHeaders {
            request, end_stream, ..
        } = &event
        {
            if self.state == State::Done {
                out.push(Command::receive_http(HttpEvent::ResponseProtocolError {
                    stream_id: outer,
                    message: "HTTP/2 connection closed".to_string(),
                    code: ErrorCode::GenericServerError,
                }));
                return;
            }
            if !self.can_open_stream() {
                self.queued.push_back((outer, vec![event]));
                return;
            }
            let wire = self.next_stream_id;
            self.next_stream_id += 2;
            self.wire_ids.insert(outer, wire);
            let mut stream = Stream::new(outer, self.peer.initial_window);
            if *end_stream {
                stream.send_open = false;
            }
            stream.headers_sent = true;
            self.streams.insert(wire, stream);
            let fields = request_fields(request);
            self.send_headers(wire, &fields, *end_stream);
            return;
        }
        let Some(wire) = self.wire_ids.get(&outer).copied() else {
            return;
        };
        if !self.streams.get(&wire).map(|s| s.send_open).unwrap_or(false) {
            return;
        }
        match event {
            HttpEvent::RequestData { data, .. } => self.queue(wire, Outgoing::Data(data)),
            HttpEvent::RequestTrailers { trailers, .. } => self.queue(wire, Outgoing::Trailers(trailers)),
            HttpEvent::RequestEndOfMessage { .. } => self.queue(wire, Outgoing::End),
            HttpEvent::RequestProtocolError { code, .. } => self.reset_stream(wire, reset_reason(code)),
            _ => {}
        }
    }
}

/// RST_STREAM code for an exchange we abort.
fn reset_reason(code: ErrorCode) -> Reason {
    match code {
        ErrorCode::Cancel | ErrorCode::ClientDisconnected | ErrorCode::PassthroughClose => Reason::Cancel,
        ErrorCode::Http11Required => Reason::Http11Required,
        _ => Reason::InternalError,
    }
}

impl Handler for Http2Connection {
    fn kind(&self) -> LayerKind {
        match self.role {
            Role::Server => LayerKind::Http2Server,
            Role::Client => LayerKind::Http2Client,
        }
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        match event {
            Event::Start if self.state == State::Start => {
                self.start(out);
                Ok(())
            }
            Event::Http(event) => self.send(event, out),
            Event::DataReceived { data, .. } if self.state == State::Open => {
                self.data_received(data, out);
                Ok(())
            }
            // Late bytes after we gave up on the connection.
            Event::DataReceived { .. } if self.state == State::Done => Ok(()),
            Event::ConnectionClosed { .. } => {
                if self.state == State::Open {
                    self.close_connection("peer closed connection".to_string(), out);
                }
                Ok(())
            }
            Event::CommandCompleted(completed) if Some(completed.command) == self.wakeup => {
                match completed.reply {
                    Reply::Wakeup => {
                        self.keepalive(out);
                        Ok(())
                    }
                    other => Err(crate::error::LayerError::UnexpectedReply {
                        layer: self.kind(),
                        expected: "Wakeup",
                        reply: other.name().to_string(),
                    }),
                }
            }
            other => Err(unexpected(self.kind(), self.state.name(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::layer::Engine;
    use crate::options::Options;
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

    fn frames(bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        if buf.starts_with(PREFACE) {
            buf.advance(PREFACE.len());
        }
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut buf, MAX_ALLOWED_FRAME_SIZE).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "trailing bytes: {:?}", buf);
        frames
    }

    fn headers_frame(encoder: &mut hpack::Encoder<'static>, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) -> Vec<u8> {
        let block = encoder.encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        let mut out = Vec::new();
        let flags = flags::END_HEADERS | if end_stream { flags::END_STREAM } else { 0 };
        encode_frame(kind::HEADERS, flags, stream_id, &block, &mut out);
        out
    }

    fn client_hello() -> Vec<u8> {
        let mut out = PREFACE.to_vec();
        encode_settings(&[], &mut out);
        out
    }

    const GET: &[(&str, &str)] = &[
        (":method", "GET"),
        (":scheme", "https"),
        (":path", "/index.html"),
        (":authority", "example.com"),
        ("accept", "*/*"),
    ];

    fn started_server() -> (Context, Engine<Http2Connection>, hpack::Encoder<'static>) {
        let ctx = context();
        let mut server = Engine::new(Http2Connection::server(ctx.clone()), &ctx);
        let commands = feed(&mut server, Event::Start);
        assert!(matches!(frames(&sent(&commands, &ctx.client))[..], [Frame::Settings { ack: false, .. }]));
        (ctx, server, hpack::Encoder::new())
    }

    #[test]
    fn frame_header_layout() {
        let header = FrameHeader {
            length: 0x01_02_03,
            kind: kind::HEADERS,
            flags: flags::END_HEADERS,
            stream_id: 7,
        };
        assert_eq!(header.encode(), [1, 2, 3, 1, 4, 0, 0, 0, 7]);
        assert_eq!(FrameHeader::parse(&header.encode()), Some(header));
        assert_eq!(FrameHeader::parse(&[0; 8]), None);
    }

    #[test]
    fn padded_data_is_stripped() {
        let mut raw = Vec::new();
        encode_frame(kind::DATA, flags::PADDED | flags::END_STREAM, 1, &[2, b'h', b'i', 0, 0], &mut raw);
        let mut buf = BytesMut::from(&raw[..]);
        assert_eq!(
            decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"hi"),
                end_stream: true,
                flow_len: 5,
            })
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let header = FrameHeader {
            length: DEFAULT_MAX_FRAME_SIZE as u32 + 1,
            kind: kind::DATA,
            flags: 0,
            stream_id: 1,
        };
        let mut buf = BytesMut::from(&header.encode()[..]);
        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(err.reason, Reason::FrameSizeError);
    }

    #[test]
    fn request_pseudo_headers() {
        let fields = |pairs: &[(&str, &str)]| -> Fields {
            pairs
                .iter()
                .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect()
        };
        let request = parse_request_fields(fields(GET)).unwrap();
        assert_eq!((request.host.as_str(), request.port), ("example.com", 443));
        assert_eq!(request.authority, "example.com");
        assert!(request.is_http2());

        let err = parse_request_fields(fields(&[(":method", "GET"), (":path", "/")])).unwrap_err();
        assert!(err.contains(":scheme"), "{}", err);
        let err = parse_request_fields(fields(&[
            (":method", "GET"),
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/"),
        ]))
        .unwrap_err();
        assert!(err.contains("Duplicate"), "{}", err);
        let err = parse_request_fields(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":foo", "bar"),
        ]))
        .unwrap_err();
        assert!(err.contains("Unknown pseudo headers"), "{}", err);
    }

    #[test]
    fn http1_request_is_translated() {
        let mut request = Request::new(Method::POST, "/submit", "HTTP/1.1");
        request.headers = Headers::from_pairs([
            ("Host", "example.com"),
            ("Connection", "keep-alive"),
            ("Transfer-Encoding", "chunked"),
            ("TE", "trailers"),
            ("X-Custom", "1"),
        ]);
        let names: Vec<String> = request_fields(&request)
            .into_iter()
            .map(|(n, _)| String::from_utf8(n).unwrap())
            .collect();
        assert_eq!(names, vec![":method", ":scheme", ":path", ":authority", "te", "x-custom"]);
    }

    #[test]
    fn server_reads_request_and_writes_response() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, GET, true));
        let commands = feed(&mut server, Event::data_received(&ctx.client, input));
        let events = received(&commands);
        assert_eq!(events.len(), 2);
        match events[0] {
            HttpEvent::RequestHeaders {
                stream_id: 1,
                request,
                end_stream: true,
            } => {
                assert_eq!(request.path, "/index.html");
                assert_eq!(request.headers.get("accept"), Some("*/*"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[1], HttpEvent::RequestEndOfMessage { stream_id: 1 }));
        assert!(frames(&sent(&commands, &ctx.client)).contains(&Frame::Settings { ack: true, values: vec![] }));

        let mut response = Response::new("HTTP/1.1", 200, "OK");
        response.headers = Headers::from_pairs([("Content-Type", "text/plain"), ("Connection", "close")]);
        let mut commands = feed(
            &mut server,
            Event::Http(HttpEvent::ResponseHeaders {
                stream_id: 1,
                response,
                end_stream: false,
            }),
        );
        commands.extend(feed(
            &mut server,
            Event::Http(HttpEvent::ResponseData {
                stream_id: 1,
                data: Bytes::from_static(b"hello"),
            }),
        ));
        commands.extend(feed(&mut server, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 })));
        let out = frames(&sent(&commands, &ctx.client));
        let mut decoder = hpack::Decoder::new();
        match &out[0] {
            Frame::Headers { stream_id: 1, block, end_stream: false, end_headers: true } => {
                let fields = decoder.decode(block).unwrap();
                assert_eq!(
                    fields,
                    vec![
                        (b":status".to_vec(), b"200".to_vec()),
                        (b"content-type".to_vec(), b"text/plain".to_vec()),
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&out[1], Frame::Data { data, end_stream: false, .. } if &data[..] == b"hello"));
        assert!(matches!(&out[2], Frame::Data { data, end_stream: true, .. } if data.is_empty()));
        assert_eq!(server.handler().open_streams(), 0);
    }

    #[test]
    fn invalid_preface_is_a_protocol_error() {
        let (ctx, mut server, _) = started_server();
        let commands = feed(&mut server, Event::data_received(&ctx.client, "GET / HTTP/1.1\r\n\r\n"));
        assert!(closes(&commands, &ctx.client));
        assert!(matches!(
            frames(&sent(&commands, &ctx.client))[..],
            [Frame::GoAway { reason: Reason::ProtocolError, .. }]
        ));
    }

    #[test]
    fn malformed_request_resets_only_that_stream() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, &[(":method", "GET"), (":path", "/")], true));
        input.extend(headers_frame(&mut encoder, 3, GET, true));
        let commands = feed(&mut server, Event::data_received(&ctx.client, input));
        assert!(frames(&sent(&commands, &ctx.client)).contains(&Frame::RstStream {
            stream_id: 1,
            reason: Reason::ProtocolError,
        }));
        assert!(matches!(received(&commands)[0], HttpEvent::RequestHeaders { stream_id: 3, .. }));
        assert!(!closes(&commands, &ctx.client));
    }

    #[test]
    fn error_before_response_becomes_error_page() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, GET, true));
        feed(&mut server, Event::data_received(&ctx.client, input));
        let commands = feed(
            &mut server,
            Event::Http(HttpEvent::ResponseProtocolError {
                stream_id: 1,
                message: "Connection refused".to_string(),
                code: ErrorCode::ConnectFailed,
            }),
        );
        let out = frames(&sent(&commands, &ctx.client));
        let mut decoder = hpack::Decoder::new();
        match &out[0] {
            Frame::Headers { block, .. } => {
                let fields = decoder.decode(block).unwrap();
                assert_eq!(fields[0], (b":status".to_vec(), b"502".to_vec()));
                assert!(!fields.iter().any(|(n, _)| n == b"connection"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&out[1], Frame::Data { data, .. } if String::from_utf8_lossy(data).contains("Connection refused")));
        assert!(matches!(out.last(), Some(Frame::Data { end_stream: true, .. })));
    }

    #[test]
    fn error_after_response_resets_stream() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, GET, true));
        feed(&mut server, Event::data_received(&ctx.client, input));
        feed(
            &mut server,
            Event::Http(HttpEvent::ResponseHeaders {
                stream_id: 1,
                response: Response::new("HTTP/2.0", 200, ""),
                end_stream: false,
            }),
        );
        let commands = feed(
            &mut server,
            Event::Http(HttpEvent::ResponseProtocolError {
                stream_id: 1,
                message: "killed".to_string(),
                code: ErrorCode::Kill,
            }),
        );
        assert_eq!(
            frames(&sent(&commands, &ctx.client)),
            vec![Frame::RstStream {
                stream_id: 1,
                reason: Reason::InternalError,
            }]
        );
    }

    #[test]
    fn client_reset_is_reported() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, GET, false));
        feed(&mut server, Event::data_received(&ctx.client, input));
        let mut reset = Vec::new();
        encode_frame(kind::RST_STREAM, 0, 1, &Reason::Cancel.code().to_be_bytes(), &mut reset);
        let commands = feed(&mut server, Event::data_received(&ctx.client, reset));
        match received(&commands)[..] {
            [HttpEvent::RequestProtocolError { stream_id: 1, message, code }] => {
                assert_eq!(message, "stream reset by client (CANCEL)");
                assert_eq!(*code, ErrorCode::Cancel);
            }
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn data_while_expecting_headers_is_a_protocol_error() {
        let ctx = context_to("example.com", 443);
        let mut client = Engine::new(Http2Connection::client(ctx.clone()), &ctx);
        feed(&mut client, Event::Start);
        feed(
            &mut client,
            Event::Http(HttpEvent::RequestHeaders {
                stream_id: 1,
                request: parse_request_fields(
                    GET.iter().map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec())).collect(),
                )
                .unwrap(),
                end_stream: true,
            }),
        );
        let mut data = Vec::new();
        encode_frame(kind::DATA, 0, 1, b"x", &mut data);
        let commands = feed(&mut client, Event::data_received(&ctx.server, data));
        assert!(closes(&commands, &ctx.server));
        match received(&commands)[..] {
            [HttpEvent::ResponseProtocolError { stream_id: 1, message, .. }] => {
                assert_eq!(message, "Received HTTP/2 data frame, expected headers.")
            }
            ref other => panic!("unexpected {:?}", other),
        }
    }

    fn h2_get(stream_id: StreamId) -> Event {
        let request = parse_request_fields(GET.iter().map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec())).collect())
            .unwrap();
        Event::Http(HttpEvent::RequestHeaders {
            stream_id,
            request,
            end_stream: true,
        })
    }

    #[test]
    fn client_maps_ids_and_queues_over_the_limit() {
        let ctx = context_to("example.com", 443);
        let mut client = Engine::new(Http2Connection::client(ctx.clone()), &ctx);
        let commands = feed(&mut client, Event::Start);
        assert!(sent(&commands, &ctx.server).starts_with(PREFACE));

        let mut settings = Vec::new();
        encode_settings(&[(setting::MAX_CONCURRENT_STREAMS, 1)], &mut settings);
        feed(&mut client, Event::data_received(&ctx.server, settings));

        // Outer ids from the client connection are not wire ids.
        let first = feed(&mut client, h2_get(5));
        assert!(matches!(frames(&sent(&first, &ctx.server))[..], [Frame::Headers { stream_id: 1, .. }]));
        let second = feed(&mut client, h2_get(7));
        assert!(sent(&second, &ctx.server).is_empty());

        let mut encoder = hpack::Encoder::new();
        let response = headers_frame(&mut encoder, 1, &[(":status", "204")], true);
        let commands = feed(&mut client, Event::data_received(&ctx.server, response));
        let events = received(&commands);
        assert!(matches!(events[0], HttpEvent::ResponseHeaders { stream_id: 5, response, end_stream: true } if response.status_code == 204));
        assert!(matches!(events[1], HttpEvent::ResponseEndOfMessage { stream_id: 5 }));
        assert!(frames(&sent(&commands, &ctx.server)).iter().any(|f| matches!(f, Frame::Headers { stream_id: 3, .. })));
    }

    #[test]
    fn informational_responses_are_swallowed() {
        let ctx = context_to("example.com", 443);
        let mut client = Engine::new(Http2Connection::client(ctx.clone()), &ctx);
        feed(&mut client, Event::Start);
        feed(&mut client, h2_get(1));
        let mut encoder = hpack::Encoder::new();
        let mut input = headers_frame(&mut encoder, 1, &[(":status", "100")], false);
        input.extend(headers_frame(&mut encoder, 1, &[(":status", "200")], false));
        let commands = feed(&mut client, Event::data_received(&ctx.server, input));
        match received(&commands)[..] {
            [HttpEvent::ResponseHeaders { response, .. }] => assert_eq!(response.status_code, 200),
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn peer_close_fails_open_streams() {
        let ctx = context_to("example.com", 443);
        let mut client = Engine::new(Http2Connection::client(ctx.clone()), &ctx);
        feed(&mut client, Event::Start);
        feed(&mut client, h2_get(1));
        let commands = feed(&mut client, peer_closed(&ctx.server));
        assert!(closes(&commands, &ctx.server));
        match received(&commands)[..] {
            [HttpEvent::ResponseProtocolError { stream_id: 1, message, .. }] => {
                assert_eq!(message, "peer closed connection")
            }
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn data_waits_for_window_update() {
        let (ctx, mut server, mut encoder) = started_server();
        let mut input = client_hello();
        input.extend(headers_frame(&mut encoder, 1, GET, true));
        feed(&mut server, Event::data_received(&ctx.client, input));
        let mut settings = Vec::new();
        encode_settings(&[(setting::INITIAL_WINDOW_SIZE, 4)], &mut settings);
        feed(&mut server, Event::data_received(&ctx.client, settings));
        feed(
            &mut server,
            Event::Http(HttpEvent::ResponseHeaders {
                stream_id: 1,
                response: Response::new("HTTP/2.0", 200, ""),
                end_stream: false,
            }),
        );
        let mut commands = feed(
            &mut server,
            Event::Http(HttpEvent::ResponseData {
                stream_id: 1,
                data: Bytes::from_static(b"abcdef"),
            }),
        );
        commands.extend(feed(&mut server, Event::Http(HttpEvent::ResponseEndOfMessage { stream_id: 1 })));
        let out = frames(&sent(&commands, &ctx.client));
        assert!(matches!(&out[..], [Frame::Data { data, end_stream: false, .. }] if &data[..] == b"abcd"));

        let mut update = Vec::new();
        encode_frame(kind::WINDOW_UPDATE, 0, 1, &10u32.to_be_bytes(), &mut update);
        let commands = feed(&mut server, Event::data_received(&ctx.client, update));
        let out = frames(&sent(&commands, &ctx.client));
        assert!(matches!(&out[0], Frame::Data { data, end_stream: false, .. } if &data[..] == b"ef"));
        assert!(matches!(&out[1], Frame::Data { end_stream: true, .. }));
    }

    #[test]
    fn idle_client_pings_on_wakeup() {
        let ctx = context_with(Options::default().with_http2_ping_keepalive(10));
        let server = ConnectionRef::server(Some(crate::connection::Address::new("example.com", 443)));
        let ctx = ctx.with_server(server);
        let mut client = Engine::new(Http2Connection::client(ctx.clone()), &ctx);
        let commands = feed(&mut client, Event::Start);
        let wakeup = commands
            .iter()
            .find(|c| matches!(c.kind, CommandKind::RequestWakeup { .. }))
            .unwrap()
            .id;
        let commands = feed(&mut client, Event::completed(wakeup, Reply::Wakeup));
        assert_eq!(
            frames(&sent(&commands, &ctx.server)),
            vec![Frame::Ping {
                ack: false,
                payload: *b"00000000",
            }]
        );
        assert!(commands.iter().any(|c| matches!(c.kind, CommandKind::RequestWakeup { .. })));
    }

    #[test]
    fn ping_is_acknowledged() {
        let (ctx, mut server, _) = started_server();
        let mut input = client_hello();
        encode_frame(kind::PING, 0, 0, b"abcdefgh", &mut input);
        let commands = feed(&mut server, Event::data_received(&ctx.client, input));
        assert!(frames(&sent(&commands, &ctx.client)).contains(&Frame::Ping {
            ack: true,
            payload: *b"abcdefgh",
        }));
    }
}
