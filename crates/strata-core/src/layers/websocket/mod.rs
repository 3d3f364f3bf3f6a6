//! WebSocket relay on top of an upgraded HTTP/1 exchange.
//!
//! Each direction is parsed independently. Data frames are reassembled into
//! messages that go through the `websocket_message` hook and are then
//! refragmented for the other side.

pub mod frame;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::Level;

use crate::commands::{Command, CommandId};
use crate::connection::ConnectionRef;
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{CommandCompleted, Event, InjectedMessage, Reply};
use crate::flow::{FlowError, HttpFlow, MessageKind, Shared, WebSocketData, WebSocketMessage};
use crate::hooks::{Hook, HookName};
use crate::layer::{unexpected, Handler, LayerKind};

use self::frame::{Frame, Opcode, ABNORMAL_CLOSURE, INVALID_PAYLOAD, PROTOCOL_ERROR};

/// Chunk size for messages whose length changed, a bit below 4 KiB to
/// leave room for frame headers.
pub const FRAGMENT_SIZE: usize = 4000;

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Negotiated `permessage-deflate` parameters (RFC 7692).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
        }
    }
}

impl DeflateParams {
    fn parse<'a>(params: impl Iterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        for param in params {
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (param.trim(), None),
            };
            let bits = value.and_then(|v| v.parse::<u8>().ok()).unwrap_or(15);
            match name {
                "server_no_context_takeover" => out.server_no_context_takeover = true,
                "client_no_context_takeover" => out.client_no_context_takeover = true,
                "server_max_window_bits" => out.server_max_window_bits = bits,
                "client_max_window_bits" => out.client_max_window_bits = bits,
                _ => {}
            }
        }
        out
    }
}

/// Splits a `Sec-WebSocket-Extensions` value into the deflate parameters, if
/// negotiated, and the names of extensions we do not support.
pub fn parse_extensions(header: &str) -> (Option<DeflateParams>, Vec<String>) {
    let mut deflate = None;
    let mut ignored = Vec::new();
    for ext in header.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = ext.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name == "permessage-deflate" && deflate.is_none() {
            deflate = Some(DeflateParams::parse(parts));
        } else {
            ignored.push(name.to_string());
        }
    }
    (deflate, ignored)
}

/// Inflates one frame's worth of a compressed message.
fn inflate(inflater: &mut Decompress, payload: &[u8], last: bool) -> std::result::Result<Vec<u8>, String> {
    let mut input = payload.to_vec();
    if last {
        input.extend_from_slice(&DEFLATE_TAIL);
    }
    let mut out = Vec::with_capacity(input.len() * 2 + 64);
    let start = inflater.total_in();
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let consumed = (inflater.total_in() - start) as usize;
        let before = (consumed, out.len());
        let status = inflater
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| e.to_string())?;
        let consumed = (inflater.total_in() - start) as usize;
        let done = consumed == input.len() && out.len() < out.capacity();
        let stalled = before == (consumed, out.len());
        if done || status == Status::StreamEnd || (stalled && out.len() < out.capacity()) {
            break;
        }
    }
    Ok(out)
}

/// Deflates one fragment, dropping the sync marker on the last one.
fn deflate(compressor: &mut Compress, data: &[u8], last: bool) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(data.len() + 64);
    let start = compressor.total_in();
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let consumed = (compressor.total_in() - start) as usize;
        compressor
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| e.to_string())?;
        let consumed = (compressor.total_in() - start) as usize;
        if consumed == data.len() && out.len() < out.capacity() {
            break;
        }
    }
    if last && out.ends_with(&DEFLATE_TAIL) {
        out.truncate(out.len() - DEFLATE_TAIL.len());
    }
    Ok(out)
}

#[derive(Debug)]
struct Deflate {
    inflater: Decompress,
    /// `None` when the peer's window is smaller than ours; such messages go
    /// out uncompressed.
    compressor: Option<Compress>,
    reset_after_message: bool,
}

impl Deflate {
    /// `send_bits`/`send_reset` are the limits for what we send to this side.
    fn new(send_bits: u8, send_reset: bool) -> Self {
        Self {
            inflater: Decompress::new(false),
            compressor: (send_bits >= 15).then(|| Compress::new(Compression::default(), false)),
            reset_after_message: send_reset,
        }
    }
}

/// One end of the relay.
#[derive(Debug)]
struct Side {
    conn: ConnectionRef,
    /// This end is the client; its frames arrive masked.
    is_client: bool,
    buf: BytesMut,
    /// Decoded payload of each frame of the message in progress.
    fragments: Vec<Bytes>,
    kind: Option<MessageKind>,
    compressed: bool,
    deflate: Option<Deflate>,
    /// The connection went away without a close frame.
    gone: bool,
}

impl Side {
    fn new(conn: ConnectionRef, is_client: bool, deflate: Option<Deflate>) -> Self {
        Self {
            conn,
            is_client,
            buf: BytesMut::new(),
            fragments: Vec::new(),
            kind: None,
            compressed: false,
            deflate,
            gone: false,
        }
    }

    fn name(&self) -> &'static str {
        if self.is_client {
            "client"
        } else {
            "server"
        }
    }

    /// Serializes frames for this side, masking towards servers.
    fn encode(&self, frame: &Frame) -> Vec<u8> {
        let mask = (!self.is_client).then(rand::random::<[u8; 4]>);
        frame::encode(frame, mask)
    }

    fn send(&self, frame: &Frame, out: &mut Vec<Command>) {
        out.push(Command::send_data(&self.conn, self.encode(frame)));
    }
}

/// Splits message content for sending. The original frame boundaries are
/// kept if the length is unchanged.
pub fn fragmentize(content: &Bytes, lengths: &[usize]) -> Vec<Bytes> {
    if !lengths.is_empty() && lengths.iter().sum::<usize>() == content.len() {
        let mut chunks = Vec::with_capacity(lengths.len());
        let mut offset = 0;
        for len in &lengths[..lengths.len() - 1] {
            chunks.push(content.slice(offset..offset + len));
            offset += len;
        }
        chunks.push(content.slice(offset..));
        return chunks;
    }
    let mut chunks = Vec::new();
    let mut offset = 0;
    while content.len() > offset + FRAGMENT_SIZE {
        chunks.push(content.slice(offset..offset + FRAGMENT_SIZE));
        offset += FRAGMENT_SIZE;
    }
    chunks.push(content.slice(offset..));
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Relay,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::Relay => "relay_messages",
            State::Done => "done",
        }
    }
}

#[derive(Debug)]
enum Waiting {
    StartHook,
    /// Forward the flow's last message afterwards, then keep parsing.
    Message { from_client: bool, fragments: Vec<usize> },
    EndHook,
}

/// Relays WebSocket messages between `ctx.client` and `ctx.server`.
#[derive(Debug)]
pub struct WebSocketLayer {
    ctx: Context,
    flow: Shared<HttpFlow>,
    client: Side,
    server: Side,
    state: State,
    waiting: Option<(CommandId, Waiting)>,
}

impl WebSocketLayer {
    pub fn new(ctx: Context, flow: Shared<HttpFlow>) -> Self {
        let client = Side::new(ctx.client.clone(), true, None);
        let server = Side::new(ctx.server.clone(), false, None);
        Self {
            ctx,
            flow,
            client,
            server,
            state: State::Start,
            waiting: None,
        }
    }

    pub fn flow(&self) -> &Shared<HttpFlow> {
        &self.flow
    }

    fn side(&self, client: bool) -> &Side {
        if client {
            &self.client
        } else {
            &self.server
        }
    }

    fn side_mut(&mut self, client: bool) -> &mut Side {
        if client {
            &mut self.client
        } else {
            &mut self.server
        }
    }

    fn hook(&mut self, name: HookName, then: Waiting, out: &mut Vec<Command>) {
        let command = Command::hook(Hook::Http(name, self.flow.clone()));
        self.waiting = Some((command.id, then));
        out.push(command);
    }

    fn start(&mut self, out: &mut Vec<Command>) {
        let header = {
            let mut flow = self.flow.write();
            if flow.websocket.is_none() {
                flow.websocket = Some(WebSocketData::default());
            }
            flow.response
                .as_ref()
                .and_then(|r| r.headers.get("sec-websocket-extensions").map(str::to_string))
                .unwrap_or_default()
        };
        let (deflate, ignored) = parse_extensions(&header);
        for name in ignored {
            out.push(Command::log(format!("Ignoring unknown WebSocket extension {:?}.", name), Level::INFO));
        }
        if let Some(params) = deflate {
            // We are the server towards the client and the client towards the server.
            self.client.deflate = Some(Deflate::new(params.server_max_window_bits, params.server_no_context_takeover));
            self.server.deflate = Some(Deflate::new(params.client_max_window_bits, params.client_no_context_takeover));
        }
        self.hook(HookName::WebsocketStart, Waiting::StartHook, out);
    }

    fn max_payload(&self) -> u64 {
        self.ctx
            .options
            .body_size_limit
            .map(|limit| limit as u64)
            .unwrap_or(u64::MAX)
    }

    /// Parses buffered frames from one side until a hook blocks.
    fn pump(&mut self, from_client: bool, out: &mut Vec<Command>) {
        let max_payload = self.max_payload();
        while self.state == State::Relay && self.waiting.is_none() {
            match frame::decode(&mut self.side_mut(from_client).buf, max_payload) {
                Ok(Some(frame)) => self.on_frame(from_client, frame, out),
                Ok(None) => break,
                Err(e) => self.fail(from_client, e.close_code(), e.to_string(), out),
            }
        }
    }

    fn on_frame(&mut self, from_client: bool, frame: Frame, out: &mut Vec<Command>) {
        let side = self.side(from_client);
        if frame.masked != side.is_client {
            let what = if frame.masked { "masked" } else { "unmasked" };
            let message = format!("{} frame from {}", what, side.name());
            return self.fail(from_client, PROTOCOL_ERROR, message, out);
        }
        if frame.rsv1 && (side.deflate.is_none() || frame.opcode.is_control() || frame.opcode == Opcode::Continuation) {
            return self.fail(from_client, PROTOCOL_ERROR, "unexpected RSV1 bit".to_string(), out);
        }
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if side.kind.is_some() {
                    return self.fail(from_client, PROTOCOL_ERROR, "expected a continuation frame".to_string(), out);
                }
                let side = self.side_mut(from_client);
                side.kind = Some(if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                });
                side.compressed = frame.rsv1;
                self.data_frame(from_client, frame, out);
            }
            Opcode::Continuation => {
                if side.kind.is_none() {
                    return self.fail(from_client, PROTOCOL_ERROR, "unexpected continuation frame".to_string(), out);
                }
                self.data_frame(from_client, frame, out);
            }
            Opcode::Ping => {
                out.push(Command::log(
                    format!("Received WebSocket ping from {} (payload: {:?})", side.name(), frame.payload),
                    Level::INFO,
                ));
                side.send(&Frame::new(Opcode::Pong, true, frame.payload.clone()), out);
                self.side(!from_client).send(&Frame::new(Opcode::Ping, true, frame.payload), out);
            }
            Opcode::Pong => {
                out.push(Command::log(
                    format!("Received WebSocket pong from {} (payload: {:?})", side.name(), frame.payload),
                    Level::INFO,
                ));
            }
            Opcode::Close => {
                let (code, reason) = frame::parse_close(&frame.payload);
                self.close(from_client, code, reason, out);
            }
        }
    }

    fn data_frame(&mut self, from_client: bool, frame: Frame, out: &mut Vec<Command>) {
        let side = self.side_mut(from_client);
        let payload = match (side.compressed, side.deflate.as_mut()) {
            (true, Some(deflate)) => match inflate(&mut deflate.inflater, &frame.payload, frame.fin) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    return self.fail(from_client, PROTOCOL_ERROR, format!("invalid compressed data: {}", e), out);
                }
            },
            _ => frame.payload,
        };
        side.fragments.push(payload);
        if frame.fin {
            self.message_finished(from_client, out);
        }
    }

    fn message_finished(&mut self, from_client: bool, out: &mut Vec<Command>) {
        let side = self.side_mut(from_client);
        let fragments = std::mem::take(&mut side.fragments);
        let kind = side.kind.take().unwrap_or(MessageKind::Binary);
        side.compressed = false;
        let lengths: Vec<usize> = fragments.iter().map(Bytes::len).collect();
        let mut content = BytesMut::with_capacity(lengths.iter().sum());
        for fragment in &fragments {
            content.extend_from_slice(fragment);
        }
        if kind == MessageKind::Text && std::str::from_utf8(&content).is_err() {
            return self.fail(from_client, INVALID_PAYLOAD, "invalid UTF-8 in text message".to_string(), out);
        }
        let message = WebSocketMessage::new(kind, from_client, content.freeze());
        self.record(message);
        self.hook(
            HookName::WebsocketMessage,
            Waiting::Message {
                from_client,
                fragments: lengths,
            },
            out,
        );
    }

    fn record(&self, message: WebSocketMessage) {
        let mut flow = self.flow.write();
        flow.websocket.get_or_insert_with(WebSocketData::default).messages.push(message);
    }

    /// Sends the flow's last message on, unless a hook dropped it.
    fn forward_last_message(&mut self, fragments: &[usize], out: &mut Vec<Command>) {
        let last = self
            .flow
            .read()
            .websocket
            .as_ref()
            .and_then(|ws| ws.messages.last().cloned());
        let Some(message) = last else {
            return;
        };
        if message.dropped {
            return;
        }
        let opcode = match message.kind {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        };
        let chunks = fragmentize(&message.content, fragments);
        let count = chunks.len();
        let dst = self.side_mut(!message.from_client);
        let mut wire = Vec::new();
        let mut failed = None;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let fin = i + 1 == count;
            let mut frame = Frame::new(if i == 0 { opcode } else { Opcode::Continuation }, fin, chunk);
            if let Some(compressor) = dst.deflate.as_mut().and_then(|d| d.compressor.as_mut()) {
                match deflate(compressor, &frame.payload, fin) {
                    Ok(data) => {
                        frame.payload = Bytes::from(data);
                        frame.rsv1 = i == 0;
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            wire.extend(dst.encode(&frame));
        }
        if let Some(deflate) = dst.deflate.as_mut() {
            if deflate.reset_after_message {
                if let Some(compressor) = deflate.compressor.as_mut() {
                    compressor.reset();
                }
            }
        }
        if let Some(e) = failed {
            out.push(Command::log(format!("WebSocket compression failed: {}", e), Level::ERROR));
            return;
        }
        out.push(Command::send_data(&dst.conn, wire));
    }

    fn inject(&mut self, mut message: WebSocketMessage, out: &mut Vec<Command>) {
        let from_client = message.from_client;
        message.injected = true;
        self.record(message);
        self.hook(
            HookName::WebsocketMessage,
            Waiting::Message {
                from_client,
                fragments: Vec::new(),
            },
            out,
        );
    }

    /// Ends the session: close frames where possible, then both connections.
    fn close(&mut self, from_client: bool, code: u16, reason: String, out: &mut Vec<Command>) {
        {
            let mut flow = self.flow.write();
            flow.live = false;
            let ws = flow.websocket.get_or_insert_with(WebSocketData::default);
            ws.closed_by_client = Some(from_client);
            ws.close_code = Some(code);
            ws.close_reason = Some(reason.clone());
            ws.timestamp_end = Some(Utc::now());
        }
        let close = Frame::close(code, &reason);
        for side in [&self.server, &self.client] {
            if !side.gone {
                side.send(&close, out);
            }
            out.push(Command::close_connection(&side.conn));
        }
        self.state = State::Done;
        self.hook(HookName::WebsocketEnd, Waiting::EndHook, out);
    }

    fn fail(&mut self, from_client: bool, code: u16, message: String, out: &mut Vec<Command>) {
        let who = self.side(from_client).name();
        out.push(Command::log(format!("WebSocket protocol error from {}: {}", who, message), Level::INFO));
        self.flow.write().error = Some(FlowError::new(format!("WebSocket protocol error from {}: {}", who, message)));
        self.close(from_client, code, message, out);
    }

    fn connection_closed(&mut self, from_client: bool, out: &mut Vec<Command>) {
        let side = self.side_mut(from_client);
        side.gone = true;
        let who = side.name();
        self.flow.write().error = Some(FlowError::new(format!("WebSocket connection closed unexpectedly by {}", who)));
        self.close(from_client, ABNORMAL_CLOSURE, String::new(), out);
    }

    fn resume(&mut self, completed: CommandCompleted, then: Waiting, out: &mut Vec<Command>) -> Result<()> {
        let Reply::Hook(_) = completed.reply else {
            return Err(LayerError::UnexpectedReply {
                layer: LayerKind::WebSocket,
                expected: "websocket hook",
                reply: completed.reply.name().to_string(),
            });
        };
        match then {
            Waiting::StartHook => {
                self.state = State::Relay;
                self.pump(true, out);
                self.pump(false, out);
            }
            Waiting::Message { from_client, fragments } => {
                self.forward_last_message(&fragments, out);
                self.pump(from_client, out);
                self.pump(!from_client, out);
            }
            Waiting::EndHook => {}
        }
        Ok(())
    }
}

impl Handler for WebSocketLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::WebSocket
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let waiting_for = self.waiting.as_ref().map(|(id, _)| *id);
        match event {
            Event::CommandCompleted(completed) if Some(completed.command) == waiting_for => {
                match self.waiting.take() {
                    Some((_, then)) => self.resume(completed, then, out),
                    None => Ok(()),
                }
            }
            Event::Start if self.state == State::Start => {
                self.start(out);
                Ok(())
            }
            Event::DataReceived { connection, data } if self.state == State::Relay => {
                let from_client = connection == self.ctx.client;
                self.side_mut(from_client).buf.extend_from_slice(&data);
                self.pump(from_client, out);
                Ok(())
            }
            Event::ConnectionClosed { connection } if self.state == State::Relay => {
                let from_client = connection == self.ctx.client;
                self.connection_closed(from_client, out);
                Ok(())
            }
            Event::MessageInjected(InjectedMessage::WebSocket { flow, message }) if self.state == State::Relay => {
                if self.flow.read().id == flow {
                    self.inject(message, out);
                }
                Ok(())
            }
            Event::MessageInjected(_) | Event::CommandCompleted(_) => Ok(()),
            Event::DataReceived { .. } | Event::ConnectionClosed { .. } if self.state == State::Done => Ok(()),
            other => Err(unexpected(LayerKind::WebSocket, self.state.name(), &other)),
        }
    }
}
