//! Protocol detection: buffer, ask, replay.
//!
//! The layer itself knows nothing about protocols. It records every event,
//! asks the `next_layer` hook whenever client or server data arrives, and
//! once the hook names a child replays the recorded events into it in their
//! original order. From then on it is a transparent pass-through.

use bytes::Bytes;
use tracing::Level;

use crate::commands::{Command, CommandId};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{Event, Reply};
use crate::hooks::{concat, Hook, NextLayerData};
use crate::layer::{Handler, Layer, LayerKind};

/// Defers the choice of protocol layer to the `next_layer` hook.
#[derive(Debug)]
pub struct NextLayer {
    ctx: Context,
    events: Vec<Event>,
    layer: Option<Box<dyn Layer>>,
    ask_on_start: bool,
    pending: Option<CommandId>,
}

impl NextLayer {
    /// `ctx` is the context of the parent; detection is not recorded as an
    /// ancestor, so the chosen layer sees the parent as its own.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            events: Vec::new(),
            layer: None,
            ask_on_start: false,
            pending: None,
        }
    }

    /// Also asks on `Start`, for stacks that must decide before any data.
    pub fn ask_on_start(mut self) -> Self {
        self.ask_on_start = true;
        self
    }

    /// Client bytes seen before a decision.
    pub fn data_client(&self) -> Bytes {
        self.data(true)
    }

    /// Server bytes seen before a decision.
    pub fn data_server(&self) -> Bytes {
        self.data(false)
    }

    pub fn decided(&self) -> Option<LayerKind> {
        self.layer.as_ref().map(|l| l.kind())
    }

    fn data(&self, client: bool) -> Bytes {
        let target = if client {
            &self.ctx.client
        } else {
            &self.ctx.server
        };
        let chunks: Vec<Bytes> = self
            .events
            .iter()
            .filter_map(|e| match e {
                Event::DataReceived { connection, data } if connection == target => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect();
        concat(&chunks)
    }

    fn ask(&mut self, out: &mut Vec<Command>) {
        let hook = Hook::NextLayer(NextLayerData {
            context: self.ctx.clone(),
            data_client: self.data_client(),
            data_server: self.data_server(),
            layer: None,
        });
        let command = Command::hook(hook);
        self.pending = Some(command.id);
        out.push(command);
    }

    fn decide(&mut self, mut layer: Box<dyn Layer>, out: &mut Vec<Command>) -> Result<()> {
        out.push(Command::log(
            format!("[nextlayer] {}", layer.kind()),
            Level::DEBUG,
        ));
        for event in self.events.drain(..) {
            out.extend(layer.handle_event(event)?);
        }
        self.layer = Some(layer);
        Ok(())
    }
}

impl Handler for NextLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::NextLayer
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        if let Some(layer) = self.layer.as_mut() {
            out.extend(layer.handle_event(event)?);
            return Ok(());
        }

        match event {
            Event::CommandCompleted(completed) if Some(completed.command) == self.pending => {
                self.pending = None;
                match completed.reply {
                    Reply::Hook(Hook::NextLayer(data)) => {
                        if let Some(layer) = data.layer {
                            self.decide(layer, out)?;
                        }
                        Ok(())
                    }
                    other => Err(LayerError::UnexpectedReply {
                        layer: LayerKind::NextLayer,
                        expected: "next_layer hook",
                        reply: other.name().to_string(),
                    }),
                }
            }
            event => {
                let ask = match &event {
                    Event::Start => self.ask_on_start,
                    Event::DataReceived { .. } => true,
                    _ => false,
                };
                let client_closed =
                    matches!(&event, Event::ConnectionClosed { connection } if *connection == self.ctx.client);
                self.events.push(event);

                if client_closed {
                    out.push(Command::close_connection(&self.ctx.client));
                    if self.ctx.server.connected() {
                        out.push(Command::close_connection(&self.ctx.server));
                    }
                } else if ask {
                    self.ask(out);
                }
                Ok(())
            }
        }
    }
}
