//! The layer abstraction and its suspend/resume engine.
//!
//! ## Architecture
//!
//! ```text
//!   driver ──Event──▶ Engine<H> ──running──▶ H::handle ──▶ Vec<Command>
//!                        │                        │
//!                        │ paused on C            └─ blocking command last?
//!                        ▼                              mark Owned, pause
//!                   FIFO queue ──(reply to C)──▶ resume, then replay queue
//! ```
//!
//! A [`Handler`] is an explicit state machine. Wherever it needs a reply
//! before it can continue it records a continuation state, pushes the
//! blocking command last and returns. The [`Engine`] then queues everything
//! except the matching completion, so the handler's next invocation is
//! exactly the reply it is waiting for.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::Level;

use crate::commands::{Blocking, Command, CommandId};
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::Event;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u64);

impl LayerId {
    pub fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Concrete layer type, used in place of runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    NextLayer,
    Tunnel,
    Tcp,
    ServerTls,
    ClientTls,
    Http,
    HttpStream,
    HttpClient,
    Http1Server,
    Http1Client,
    Http2Server,
    Http2Client,
    HttpUpstreamProxy,
    WebSocket,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextLayer => "NextLayer",
            Self::Tunnel => "TunnelLayer",
            Self::Tcp => "TcpLayer",
            Self::ServerTls => "ServerTlsLayer",
            Self::ClientTls => "ClientTlsLayer",
            Self::Http => "HttpLayer",
            Self::HttpStream => "HttpStream",
            Self::HttpClient => "HttpClient",
            Self::Http1Server => "Http1Server",
            Self::Http1Client => "Http1Client",
            Self::Http2Server => "Http2Server",
            Self::Http2Client => "Http2Client",
            Self::HttpUpstreamProxy => "HttpUpstreamProxy",
            Self::WebSocket => "WebSocketLayer",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol layer as seen by its parent or the driver.
pub trait Layer: Send + fmt::Debug {
    fn kind(&self) -> LayerKind;

    /// Feeds exactly one event and returns the commands it caused, in order.
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>>;
}

/// The state machine inside an [`Engine`].
pub trait Handler: Send + fmt::Debug {
    fn kind(&self) -> LayerKind;

    /// Processes one event. A command with `Blocking::Yes` must be the last
    /// one pushed; the next call will then be its completion.
    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()>;

    /// Wraps the handler in an [`Engine`] and boxes it.
    fn boxed(self, ctx: &Context) -> Box<dyn Layer>
    where
        Self: Sized + 'static,
    {
        Box::new(Engine::new(self, ctx))
    }
}

/// Runs a [`Handler`] with pause/resume semantics.
pub struct Engine<H> {
    id: LayerId,
    handler: H,
    paused: Option<CommandId>,
    queue: VecDeque<Event>,
    trace_depth: Option<usize>,
    /// Last debug trace line, for collapsing repeats.
    last_trace: String,
}

impl<H: Handler> Engine<H> {
    pub fn new(handler: H, ctx: &Context) -> Self {
        Self {
            id: LayerId::next(),
            handler,
            paused: None,
            queue: VecDeque::new(),
            trace_depth: ctx.options.proxy_debug.then(|| ctx.depth()),
            last_trace: String::new(),
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Events waiting for the current pause to end.
    pub fn queued(&self) -> impl Iterator<Item = &Event> {
        self.queue.iter()
    }

    fn run(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        let mut produced = Vec::new();
        self.handler.handle(event, &mut produced)?;

        let count = produced.len();
        for (index, mut command) in produced.into_iter().enumerate() {
            if command.blocking == Blocking::Yes {
                if index + 1 != count {
                    return Err(LayerError::BlockingNotLast(self.handler.kind()));
                }
                command.blocking = Blocking::Owned(self.id);
                self.paused = Some(command.id);
            }
            if let Some(depth) = self.trace_depth {
                self.trace(out, depth, format!("<< {:?}", command));
            }
            out.push(command);
        }
        Ok(())
    }

    fn trace(&mut self, out: &mut Vec<Command>, depth: usize, message: String) {
        let line = format!(
            "{}[{}] {}",
            "  ".repeat(depth),
            self.handler.kind(),
            message
        );
        if self.last_trace != line {
            self.last_trace = line.clone();
            out.push(Command::log(line, Level::DEBUG));
        }
    }
}

impl<H: Handler> Layer for Engine<H> {
    fn kind(&self) -> LayerKind {
        self.handler.kind()
    }

    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
        let mut out = Vec::new();
        if let Some(depth) = self.trace_depth {
            self.trace(&mut out, depth, format!(">> {:?}", event));
        }

        match self.paused {
            Some(pending) => {
                let resumes =
                    matches!(&event, Event::CommandCompleted(c) if c.command == pending);
                if !resumes {
                    self.queue.push_back(event);
                    return Ok(out);
                }
                self.paused = None;
                self.run(event, &mut out)?;
                while self.paused.is_none() {
                    match self.queue.pop_front() {
                        Some(queued) => self.run(queued, &mut out)?,
                        None => break,
                    }
                }
            }
            None => self.run(event, &mut out)?,
        }
        Ok(out)
    }
}

impl<H: Handler> fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handler", &self.handler)
            .field("paused", &self.paused)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Builds the contract-violation error for an event a state cannot accept.
pub(crate) fn unexpected(kind: LayerKind, state: &'static str, event: &Event) -> LayerError {
    LayerError::UnexpectedEvent {
        layer: kind,
        state,
        event: format!("{:?}", event),
    }
}
