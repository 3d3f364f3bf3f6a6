//! Raw TCP relay with interceptable messages.

use bytes::Bytes;
use tracing::Level;

use crate::commands::{Command, CommandId};
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{CommandCompleted, Event, InjectedMessage, Reply};
use crate::flow::{FlowError, Shared, TcpFlow, TcpMessage};
use crate::hooks::{Hook, HookName};
use crate::layer::{unexpected, Handler, LayerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Relay,
    Done,
}

/// What to do when the outstanding command completes.
#[derive(Debug)]
enum Waiting {
    StartHook,
    Open,
    /// The message hook; forward the (edited) last message afterwards.
    Message,
    /// `tcp_error` after a failed open; the client gets closed afterwards.
    ErrorHook,
    EndHook,
}

/// Relays bytes between client and server.
#[derive(Debug)]
pub struct TcpLayer {
    ctx: Context,
    flow: Option<Shared<TcpFlow>>,
    state: State,
    waiting: Option<(CommandId, Waiting)>,
}

impl TcpLayer {
    /// With `ignore` set no flow is created and no hooks fire.
    pub fn new(ctx: Context, ignore: bool) -> Self {
        let flow = (!ignore).then(|| TcpFlow::new(ctx.client.clone(), ctx.server.clone()).shared());
        Self {
            ctx,
            flow,
            state: State::Start,
            waiting: None,
        }
    }

    pub fn flow(&self) -> Option<&Shared<TcpFlow>> {
        self.flow.as_ref()
    }

    fn hook(&mut self, name: HookName, then: Waiting, out: &mut Vec<Command>) -> bool {
        match &self.flow {
            Some(flow) => {
                let command = Command::hook(Hook::Tcp(name, flow.clone()));
                self.waiting = Some((command.id, then));
                out.push(command);
                true
            }
            None => false,
        }
    }

    fn peer(&self, conn: &ConnectionRef) -> ConnectionRef {
        if *conn == self.ctx.client {
            self.ctx.server.clone()
        } else {
            self.ctx.client.clone()
        }
    }

    fn open_server(&mut self, out: &mut Vec<Command>) {
        if self.ctx.server.connected() {
            self.state = State::Relay;
        } else {
            let command = Command::open_connection(&self.ctx.server);
            self.waiting = Some((command.id, Waiting::Open));
            out.push(command);
        }
    }

    fn receive(&mut self, from_client: bool, data: Bytes, out: &mut Vec<Command>) {
        let message = TcpMessage::new(from_client, data.clone());
        match &self.flow {
            Some(flow) => {
                flow.write().messages.push(message);
                self.hook(HookName::TcpMessage, Waiting::Message, out);
            }
            None => self.forward(from_client, data, out),
        }
    }

    fn forward(&self, from_client: bool, data: Bytes, out: &mut Vec<Command>) {
        let target = if from_client {
            &self.ctx.server
        } else {
            &self.ctx.client
        };
        if !data.is_empty() {
            out.push(Command::send_data(target, data));
        }
    }

    fn forward_last_message(&self, out: &mut Vec<Command>) {
        let last = self
            .flow
            .as_ref()
            .and_then(|f| f.read().messages.last().map(|m| (m.from_client, m.content.clone())));
        if let Some((from_client, content)) = last {
            self.forward(from_client, content, out);
        }
    }

    fn finish(&mut self, out: &mut Vec<Command>) {
        self.state = State::Done;
        if let Some(flow) = &self.flow {
            flow.write().live = false;
        }
        self.hook(HookName::TcpEnd, Waiting::EndHook, out);
    }

    fn on_closed(&mut self, conn: ConnectionRef, out: &mut Vec<Command>) {
        let peer = self.peer(&conn);
        let both_done = !conn.state().contains(ConnectionState::CAN_READ)
            && !peer.state().contains(ConnectionState::CAN_READ);
        if both_done {
            if !conn.state().is_closed() {
                out.push(Command::close_connection(&conn));
            }
            if !peer.state().is_closed() {
                out.push(Command::close_connection(&peer));
            }
            self.finish(out);
        } else {
            out.push(Command::half_close(&peer));
        }
    }

    fn resume(&mut self, completed: CommandCompleted, then: Waiting, out: &mut Vec<Command>) -> Result<()> {
        match (then, completed.reply) {
            (Waiting::StartHook, Reply::Hook(_)) => self.open_server(out),
            (Waiting::Open, Reply::OpenConnection(None)) => self.state = State::Relay,
            (Waiting::Open, Reply::OpenConnection(Some(err))) => {
                out.push(Command::log(format!("server connection failed: {}", err), Level::INFO));
                self.state = State::Done;
                match &self.flow {
                    Some(flow) => {
                        {
                            let mut flow = flow.write();
                            flow.error = Some(FlowError::new(err));
                            flow.live = false;
                        }
                        self.hook(HookName::TcpError, Waiting::ErrorHook, out);
                    }
                    None => out.push(Command::close_connection(&self.ctx.client)),
                }
            }
            (Waiting::ErrorHook, Reply::Hook(_)) => {
                out.push(Command::close_connection(&self.ctx.client));
            }
            (Waiting::Message, Reply::Hook(_)) => self.forward_last_message(out),
            (Waiting::EndHook, Reply::Hook(_)) => {}
            (_, reply) => {
                return Err(LayerError::UnexpectedReply {
                    layer: LayerKind::Tcp,
                    expected: "tcp hook or OpenConnection",
                    reply: reply.name().to_string(),
                })
            }
        }
        Ok(())
    }
}

impl Handler for TcpLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Tcp
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let waiting_for = self.waiting.as_ref().map(|(id, _)| *id);
        let event = match event {
            Event::CommandCompleted(completed) if Some(completed.command) == waiting_for => {
                if let Some((_, then)) = self.waiting.take() {
                    return self.resume(completed, then, out);
                }
                Event::CommandCompleted(completed)
            }
            other => other,
        };

        match (self.state, event) {
            (State::Start, Event::Start) => {
                if !self.hook(HookName::TcpStart, Waiting::StartHook, out) {
                    self.open_server(out);
                }
            }
            (State::Relay, Event::DataReceived { connection, data }) => {
                let from_client = connection == self.ctx.client;
                self.receive(from_client, data, out);
            }
            (State::Relay, Event::ConnectionClosed { connection }) => self.on_closed(connection, out),
            (State::Relay, Event::MessageInjected(InjectedMessage::Tcp { flow, message })) => {
                if self.flow.as_ref().map(|f| f.read().id) == Some(flow) {
                    self.receive(message.from_client, message.content, out);
                }
            }
            (_, Event::MessageInjected(_)) | (_, Event::CommandCompleted(_)) => {}
            (State::Done, Event::DataReceived { .. } | Event::ConnectionClosed { .. }) => {}
            (state, event) => {
                let name = match state {
                    State::Start => "start",
                    State::Relay => "relay_messages",
                    State::Done => "done",
                };
                return Err(unexpected(LayerKind::Tcp, name, &event));
            }
        }
        Ok(())
    }
}
