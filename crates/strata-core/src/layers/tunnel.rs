//! Tunnels: a handshake over an outer connection, then a plain byte stream
//! for an inner child layer.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────── TunnelLayer<P> ─────────────┐
//!  tunnel ──▶│ INACTIVE ─▶ ESTABLISHING ─▶ OPEN         │──▶ child (sees `conn`)
//!  conn      │                 │              │        │
//!            │                 └──▶ CLOSED ◀──┘        │
//!            └─────────────────────────────────────────┘
//! ```
//!
//! A [`TunnelProtocol`] supplies the handshake and record translation. Its
//! methods never call into the child directly; they describe [`Step`]s which
//! the layer executes in order. When a step blocks the layer (an own
//! `OpenConnection` or a protocol hook), the remaining work stays queued and
//! continues after the reply, exactly where it stopped.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::Level;

use crate::commands::{Blocking, Command, CommandId, CommandKind};
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{CommandCompleted, Event, Reply};
use crate::layer::{Handler, Layer, LayerKind};

/// Message for a tunnel connection that closes mid-handshake.
pub const CLOSED_DURING_HANDSHAKE: &str = "connection closed without notice";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Inactive,
    Establishing,
    Open,
    Closed,
}

/// Result of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Needs more data.
    Pending,
    /// The last step is a blocking command; `resume` gets its reply.
    Blocked,
    Done,
    Failed(String),
}

/// Something a protocol wants done.
#[derive(Debug)]
pub enum Step {
    Emit(Command),
    ToChild(Event),
}

/// Ordered output of a protocol method.
#[derive(Debug, Default)]
pub struct Steps(Vec<Step>);

impl Steps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, command: Command) {
        self.0.push(Step::Emit(command));
    }

    pub fn to_child(&mut self, event: Event) {
        self.0.push(Step::ToChild(event));
    }

    pub fn log(&mut self, message: impl Into<String>, level: Level) {
        self.emit(Command::log(message, level));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Connections a tunnel works with.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub ctx: Context,
    /// Carries the handshake and the wrapped records.
    pub tunnel_connection: ConnectionRef,
    /// The connection the child believes it talks to.
    pub conn: ConnectionRef,
}

impl TunnelInfo {
    pub fn is_nested(&self) -> bool {
        self.conn != self.tunnel_connection
    }
}

/// The overridable parts of a tunnel.
pub trait TunnelProtocol: Send + fmt::Debug {
    fn kind(&self) -> LayerKind;

    fn start_handshake(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<Handshake> {
        self.receive_handshake_data(t, Bytes::new(), steps)
    }

    fn receive_handshake_data(
        &mut self,
        t: &TunnelInfo,
        data: Bytes,
        steps: &mut Steps,
    ) -> Result<Handshake>;

    /// Completion of a blocking command the protocol emitted.
    fn resume(
        &mut self,
        _t: &TunnelInfo,
        completed: CommandCompleted,
        _steps: &mut Steps,
    ) -> Result<Handshake> {
        Err(LayerError::UnexpectedReply {
            layer: self.kind(),
            expected: "no protocol command",
            reply: completed.reply.name().to_string(),
        })
    }

    fn on_handshake_error(&mut self, t: &TunnelInfo, _err: &str, steps: &mut Steps) -> Result<()> {
        steps.emit(Command::close_connection(&t.tunnel_connection));
        Ok(())
    }

    fn receive_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<()> {
        steps.to_child(Event::data_received(&t.conn, data));
        Ok(())
    }

    fn receive_close(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<()> {
        steps.to_child(Event::connection_closed(&t.conn));
        Ok(())
    }

    fn send_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<()> {
        steps.emit(Command::send_data(&t.tunnel_connection, data));
        Ok(())
    }

    fn send_close(&mut self, t: &TunnelInfo, half_close: bool, steps: &mut Steps) -> Result<()> {
        let command = if half_close {
            Command::half_close(&t.tunnel_connection)
        } else {
            Command::close_connection(&t.tunnel_connection)
        };
        steps.emit(command);
        Ok(())
    }

    /// True once an open tunnel carries the protocol (not a plain passthrough).
    fn established(&self, _t: &TunnelInfo) -> bool {
        true
    }

    /// Called before a handshake explicitly requested by the child.
    fn prepare_establish(&mut self, _t: &TunnelInfo) {}

    /// Whether an already open tunnel connection handshakes on `Start`, or
    /// waits for the child to ask for the connection.
    fn handshake_on_start(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    Open,
    EstablishTls,
}

#[derive(Debug, Clone, Copy)]
enum Own {
    OpenTunnel(CommandId),
    Protocol(CommandId),
}

impl Own {
    fn id(&self) -> CommandId {
        match self {
            Own::OpenTunnel(id) | Own::Protocol(id) => *id,
        }
    }
}

#[derive(Debug)]
enum Work {
    Emit(Command),
    ToChild(Event),
    ChildCommand(Command),
    StartHandshake,
    OpenTunnel,
    Outcome(Handshake),
    Finished(Option<String>),
}

/// A layer that runs protocol `P` over a tunnel connection.
pub struct TunnelLayer<P> {
    info: TunnelInfo,
    state: TunnelState,
    proto: P,
    child: Box<dyn Layer>,
    waiting: Vec<(CommandId, ReplyKind)>,
    own: Option<Own>,
    work: VecDeque<Work>,
}

impl<P: TunnelProtocol> TunnelLayer<P> {
    pub fn new(
        ctx: Context,
        tunnel_connection: ConnectionRef,
        conn: ConnectionRef,
        proto: P,
        child: Box<dyn Layer>,
    ) -> Self {
        Self {
            info: TunnelInfo {
                ctx,
                tunnel_connection,
                conn,
            },
            state: TunnelState::Inactive,
            proto,
            child,
            waiting: Vec::new(),
            own: None,
            work: VecDeque::new(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn protocol(&self) -> &P {
        &self.proto
    }

    fn schedule_front(&mut self, steps: Steps, then: Option<Work>) {
        if let Some(then) = then {
            self.work.push_front(then);
        }
        for step in steps.0.into_iter().rev() {
            self.work.push_front(match step {
                Step::Emit(command) => Work::Emit(command),
                Step::ToChild(event) => Work::ToChild(event),
            });
        }
    }

    fn drain(&mut self, out: &mut Vec<Command>) -> Result<()> {
        while self.own.is_none() {
            let Some(work) = self.work.pop_front() else {
                break;
            };
            match work {
                Work::Emit(command) => {
                    if command.blocking == Blocking::Yes {
                        self.own = Some(Own::Protocol(command.id));
                    }
                    out.push(command);
                }
                Work::ToChild(event) => {
                    let commands = self.child.handle_event(event)?;
                    for command in commands.into_iter().rev() {
                        self.work.push_front(Work::ChildCommand(command));
                    }
                }
                Work::ChildCommand(command) => self.handle_child_command(command, out)?,
                Work::StartHandshake => {
                    let mut steps = Steps::new();
                    let outcome = self.proto.start_handshake(&self.info, &mut steps)?;
                    self.schedule_front(steps, Some(Work::Outcome(outcome)));
                }
                Work::OpenTunnel => {
                    let command = Command::open_connection(&self.info.tunnel_connection);
                    self.own = Some(Own::OpenTunnel(command.id));
                    out.push(command);
                }
                Work::Outcome(outcome) => self.apply_outcome(outcome)?,
                Work::Finished(err) => self.handshake_finished(err),
            }
        }
        Ok(())
    }

    fn apply_outcome(&mut self, outcome: Handshake) -> Result<()> {
        match outcome {
            Handshake::Pending | Handshake::Blocked => {}
            Handshake::Done => {
                if self.info.is_nested() {
                    let mut conn = self.info.conn.write();
                    conn.state = ConnectionState::OPEN;
                    conn.timestamp_start = Some(chrono::Utc::now());
                }
                self.work.push_front(Work::Finished(None));
            }
            Handshake::Failed(err) => {
                if self.info.is_nested() {
                    self.info.conn.set_state(ConnectionState::CLOSED);
                }
                let mut steps = Steps::new();
                self.proto.on_handshake_error(&self.info, &err, &mut steps)?;
                self.schedule_front(steps, Some(Work::Finished(Some(err))));
            }
        }
        Ok(())
    }

    fn handshake_finished(&mut self, err: Option<String>) {
        self.state = if err.is_some() {
            TunnelState::Closed
        } else {
            TunnelState::Open
        };
        for (id, kind) in self.waiting.drain(..).rev() {
            let reply = match kind {
                ReplyKind::Open => Reply::OpenConnection(err.clone()),
                ReplyKind::EstablishTls => Reply::EstablishServerTls(err.clone()),
            };
            self.work.push_front(Work::ToChild(Event::completed(id, reply)));
        }
    }

    /// Opens the tunnel connection if needed, then handshakes.
    fn establish(&mut self) {
        self.state = TunnelState::Establishing;
        if self.info.tunnel_connection.connected() {
            self.work.push_front(Work::StartHandshake);
        } else {
            self.work.push_front(Work::OpenTunnel);
        }
    }

    fn reply_now(&mut self, id: CommandId, reply: Reply) {
        self.work.push_front(Work::ToChild(Event::completed(id, reply)));
    }

    fn handle_child_command(&mut self, command: Command, out: &mut Vec<Command>) -> Result<()> {
        if command.connection() != Some(&self.info.conn) {
            out.push(command);
            return Ok(());
        }
        let id = command.id;
        match command.kind {
            CommandKind::SendData { data, .. } => {
                let mut steps = Steps::new();
                self.proto.send_data(&self.info, data, &mut steps)?;
                self.schedule_front(steps, None);
            }
            CommandKind::CloseConnection { half_close, .. } => {
                if self.info.is_nested() {
                    if half_close {
                        self.info.conn.clear_state(ConnectionState::CAN_WRITE);
                    } else {
                        self.info.conn.set_state(ConnectionState::CLOSED);
                    }
                }
                let mut steps = Steps::new();
                self.proto.send_close(&self.info, half_close, &mut steps)?;
                self.schedule_front(steps, None);
            }
            CommandKind::OpenConnection { .. } => match self.state {
                TunnelState::Open if self.info.tunnel_connection.connected() => {
                    self.reply_now(id, Reply::OpenConnection(None));
                }
                TunnelState::Establishing => self.waiting.push((id, ReplyKind::Open)),
                _ => {
                    self.waiting.push((id, ReplyKind::Open));
                    self.establish();
                }
            },
            CommandKind::EstablishServerTls { .. } => {
                if self.state == TunnelState::Open && self.proto.established(&self.info) {
                    self.reply_now(id, Reply::EstablishServerTls(None));
                } else {
                    self.waiting.push((id, ReplyKind::EstablishTls));
                    if self.state != TunnelState::Establishing {
                        self.proto.prepare_establish(&self.info);
                        self.establish();
                    }
                }
            }
            kind => out.push(Command {
                id,
                blocking: command.blocking,
                kind,
            }),
        }
        Ok(())
    }

    fn handle_tunnel_event(&mut self, event: Event) -> Result<()> {
        let mut steps = Steps::new();
        match event {
            Event::DataReceived { data, .. } => match self.state {
                TunnelState::Establishing => {
                    let outcome = self.proto.receive_handshake_data(&self.info, data, &mut steps)?;
                    self.schedule_front(steps, Some(Work::Outcome(outcome)));
                }
                TunnelState::Open | TunnelState::Inactive => {
                    self.proto.receive_data(&self.info, data, &mut steps)?;
                    self.schedule_front(steps, None);
                }
                TunnelState::Closed => {}
            },
            Event::ConnectionClosed { .. } => {
                if self.info.is_nested() {
                    let mut conn = self.info.conn.write();
                    conn.state = conn.state & !ConnectionState::CAN_READ;
                    conn.timestamp_end = Some(chrono::Utc::now());
                }
                match self.state {
                    TunnelState::Open | TunnelState::Inactive => {
                        self.proto.receive_close(&self.info, &mut steps)?;
                        self.schedule_front(steps, None);
                    }
                    TunnelState::Establishing => {
                        let err = CLOSED_DURING_HANDSHAKE.to_string();
                        self.proto.on_handshake_error(&self.info, &err, &mut steps)?;
                        self.schedule_front(steps, Some(Work::Finished(Some(err))));
                    }
                    TunnelState::Closed => {}
                }
                self.state = TunnelState::Closed;
            }
            other => return Err(crate::layer::unexpected(self.proto.kind(), "tunnel", &other)),
        }
        Ok(())
    }
}

impl<P: TunnelProtocol> Handler for TunnelLayer<P> {
    fn kind(&self) -> LayerKind {
        self.proto.kind()
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        match event {
            Event::Start => {
                if !self.info.tunnel_connection.state().is_closed()
                    && self.proto.handshake_on_start()
                {
                    self.state = TunnelState::Establishing;
                    self.work.push_back(Work::StartHandshake);
                }
                self.work.push_back(Work::ToChild(Event::Start));
            }
            Event::CommandCompleted(completed)
                if self.own.map(|o| o.id()) == Some(completed.command) =>
            {
                match self.own.take() {
                    Some(Own::OpenTunnel(_)) => match completed.reply {
                        Reply::OpenConnection(None) => self.work.push_front(Work::StartHandshake),
                        Reply::OpenConnection(Some(err)) => {
                            self.work.push_front(Work::Finished(Some(err)));
                        }
                        other => {
                            return Err(LayerError::UnexpectedReply {
                                layer: self.proto.kind(),
                                expected: "OpenConnection",
                                reply: other.name().to_string(),
                            })
                        }
                    },
                    _ => {
                        let mut steps = Steps::new();
                        let outcome = self.proto.resume(&self.info, completed, &mut steps)?;
                        self.schedule_front(steps, Some(Work::Outcome(outcome)));
                    }
                }
            }
            event
                if event.connection() == Some(&self.info.tunnel_connection)
                    && !matches!(event, Event::CommandCompleted(_)) =>
            {
                self.handle_tunnel_event(event)?;
            }
            other => self.work.push_back(Work::ToChild(other)),
        }
        self.drain(out)
    }
}

impl<P: fmt::Debug> fmt::Debug for TunnelLayer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelLayer")
            .field("proto", &self.proto)
            .field("state", &self.state)
            .field("tunnel_connection", &self.info.tunnel_connection)
            .field("conn", &self.info.conn)
            .field("child", &self.child.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Address;
    use crate::layer::Engine;
    use crate::testing::*;

    /// Expects the peer to answer "OK" or "NO"; frames data as `[len]data`.
    #[derive(Debug, Default)]
    struct Greeting {
        buf: Vec<u8>,
    }

    impl TunnelProtocol for Greeting {
        fn kind(&self) -> LayerKind {
            LayerKind::Tunnel
        }

        fn start_handshake(&mut self, t: &TunnelInfo, steps: &mut Steps) -> Result<Handshake> {
            steps.emit(Command::send_data(&t.tunnel_connection, "HELLO"));
            Ok(Handshake::Pending)
        }

        fn receive_handshake_data(
            &mut self,
            _t: &TunnelInfo,
            data: Bytes,
            _steps: &mut Steps,
        ) -> Result<Handshake> {
            self.buf.extend_from_slice(&data);
            Ok(match &self.buf[..] {
                b"OK" => Handshake::Done,
                b"NO" => Handshake::Failed("refused".to_string()),
                _ => Handshake::Pending,
            })
        }

        fn send_data(&mut self, t: &TunnelInfo, data: Bytes, steps: &mut Steps) -> Result<()> {
            let mut framed = vec![data.len() as u8];
            framed.extend_from_slice(&data);
            steps.emit(Command::send_data(&t.tunnel_connection, framed));
            Ok(())
        }
    }

    /// Opens the inner connection on start, then greets.
    #[derive(Debug)]
    struct Opener {
        conn: ConnectionRef,
        open: Option<CommandId>,
        result: Option<Option<String>>,
    }

    impl Handler for Opener {
        fn kind(&self) -> LayerKind {
            LayerKind::Tcp
        }

        fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
            match event {
                Event::Start => {
                    let command = Command::open_connection(&self.conn);
                    self.open = Some(command.id);
                    out.push(command);
                }
                Event::CommandCompleted(CommandCompleted {
                    command,
                    reply: Reply::OpenConnection(err),
                }) if Some(command) == self.open => {
                    if err.is_none() {
                        out.push(Command::send_data(&self.conn, "hi"));
                    }
                    self.result = Some(err);
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn tunnel(
        nested: bool,
    ) -> (
        Engine<TunnelLayer<Greeting>>,
        ConnectionRef,
        ConnectionRef,
    ) {
        let ctx = context();
        let outer = ConnectionRef::server(Some(Address::new("proxy", 8080)));
        let inner = if nested {
            ConnectionRef::server(Some(Address::new("example.com", 443)))
        } else {
            outer.clone()
        };
        let child = Opener {
            conn: inner.clone(),
            open: None,
            result: None,
        }
        .boxed(&ctx);
        let layer = TunnelLayer::new(ctx.clone(), outer.clone(), inner.clone(), Greeting::default(), child);
        (Engine::new(layer, &ctx), outer, inner)
    }

    #[test]
    fn child_open_resolves_only_after_handshake() {
        let (mut layer, outer, inner) = tunnel(true);

        let mut commands = feed(&mut layer, Event::Start);
        let open = take_blocking(&mut commands);
        assert!(matches!(&open.kind, CommandKind::OpenConnection { connection } if *connection == outer));
        assert_eq!(layer.handler().state(), TunnelState::Establishing);

        let commands = feed(&mut layer, reply_open(&open, None));
        assert_eq!(sent(&commands, &outer), b"HELLO");
        assert!(!inner.connected());

        let commands = feed(&mut layer, Event::data_received(&outer, "O"));
        assert!(commands.is_empty());

        let commands = feed(&mut layer, Event::data_received(&outer, "K"));
        assert_eq!(layer.handler().state(), TunnelState::Open);
        assert!(inner.connected());
        // The child's greeting is framed by the tunnel.
        assert_eq!(sent(&commands, &outer), b"\x02hi");
    }

    #[test]
    fn handshake_error_is_reported_verbatim() {
        let (mut layer, outer, _) = tunnel(true);
        let mut commands = feed(&mut layer, Event::Start);
        let open = take_blocking(&mut commands);
        feed(&mut layer, reply_open(&open, None));

        let commands = feed(&mut layer, Event::data_received(&outer, "NO"));
        assert!(closes(&commands, &outer));
        assert_eq!(layer.handler().state(), TunnelState::Closed);
    }

    #[test]
    fn open_failure_is_forwarded_to_child() {
        let (mut layer, _, _) = tunnel(true);
        let mut commands = feed(&mut layer, Event::Start);
        let open = take_blocking(&mut commands);
        let commands = feed(&mut layer, reply_open(&open, Some("connection refused")));
        assert!(commands.is_empty());
        assert_eq!(layer.handler().state(), TunnelState::Closed);
    }

    #[test]
    fn close_during_handshake_is_a_handshake_error() {
        let (mut layer, outer, _) = tunnel(true);
        let mut commands = feed(&mut layer, Event::Start);
        let open = take_blocking(&mut commands);
        feed(&mut layer, reply_open(&open, None));

        let commands = feed(&mut layer, peer_closed(&outer));
        assert!(closes(&commands, &outer));
        assert_eq!(layer.handler().state(), TunnelState::Closed);

        // Terminal: further events are absorbed.
        assert!(feed(&mut layer, Event::data_received(&outer, "late")).is_empty());
    }

    #[test]
    fn open_tunnel_at_start_handshakes_immediately() {
        let (mut layer, outer, _) = tunnel(false);
        outer.set_state(ConnectionState::OPEN);
        let commands = feed(&mut layer, Event::Start);
        assert_eq!(sent(&commands, &outer), b"HELLO");
        assert_eq!(layer.handler().state(), TunnelState::Establishing);

        // The child asked to open the (already open) connection meanwhile.
        let commands = feed(&mut layer, Event::data_received(&outer, "OK"));
        assert_eq!(sent(&commands, &outer), b"\x02hi");
    }
}
