//! Opens a server connection on behalf of the HTTP layer, then hands it to
//! the matching HTTP/1 or HTTP/2 client.

use crate::commands::{Command, CommandId};
use crate::connection::ConnectionState;
use crate::context::Context;
use crate::error::{LayerError, Result};
use crate::events::{Event, Reply};
use crate::layer::{unexpected, Handler, Layer, LayerKind};
use crate::layers::tls::HTTP2_ALPN;

use super::http1::Http1Connection;
use super::http2::Http2Connection;

#[derive(Debug)]
pub struct HttpClient {
    ctx: Context,
    opening: Option<CommandId>,
    child: Option<Box<dyn Layer>>,
    failed: bool,
}

impl HttpClient {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            opening: None,
            child: None,
            failed: false,
        }
    }

    fn connected(&mut self, err: Option<String>, out: &mut Vec<Command>) -> Result<()> {
        match &err {
            None => {
                let ctx = self.ctx.enter(LayerKind::HttpClient);
                let mut child = if self.ctx.server.alpn().as_deref() == Some(HTTP2_ALPN) {
                    Http2Connection::client(ctx.clone()).boxed(&ctx)
                } else {
                    Http1Connection::client(ctx.clone()).boxed(&ctx)
                };
                out.extend(child.handle_event(Event::Start)?);
                self.child = Some(child);
            }
            Some(e) => {
                self.ctx.server.write().error = Some(e.clone());
                self.failed = true;
            }
        }
        out.push(Command::register_http_connection(&self.ctx.server, err));
        Ok(())
    }
}

impl Handler for HttpClient {
    fn kind(&self) -> LayerKind {
        LayerKind::HttpClient
    }

    fn handle(&mut self, event: Event, out: &mut Vec<Command>) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            out.extend(child.handle_event(event)?);
            return Ok(());
        }
        match event {
            Event::Start if self.opening.is_none() => {
                if self.ctx.server.state() == ConnectionState::OPEN {
                    return self.connected(None, out);
                }
                let command = Command::open_connection(&self.ctx.server);
                self.opening = Some(command.id);
                out.push(command);
                Ok(())
            }
            Event::CommandCompleted(completed) if Some(completed.command) == self.opening => {
                self.opening = None;
                match completed.reply {
                    Reply::OpenConnection(err) => self.connected(err, out),
                    other => Err(LayerError::UnexpectedReply {
                        layer: LayerKind::HttpClient,
                        expected: "OpenConnection",
                        reply: other.name().to_string(),
                    }),
                }
            }
            // The connection never came up; late events have nowhere to go.
            _ if self.failed => Ok(()),
            other => Err(unexpected(LayerKind::HttpClient, "start", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::layer::Engine;
    use crate::testing::*;

    fn registered(commands: &[Command]) -> Option<Option<String>> {
        commands.iter().find_map(|c| match &c.kind {
            CommandKind::RegisterHttpConnection { err, .. } => Some(err.clone()),
            _ => None,
        })
    }

    #[test]
    fn opens_then_registers() {
        let ctx = context_to("example.com", 80);
        let mut client = Engine::new(HttpClient::new(ctx.clone()), &ctx);
        let mut commands = feed(&mut client, Event::Start);
        let open = take_blocking(&mut commands);
        let commands = feed(&mut client, reply_open(&open, None));
        assert_eq!(registered(&commands), Some(None));
        assert_eq!(client.handler().child.as_ref().map(|c| c.kind()), Some(LayerKind::Http1Client));
    }

    #[test]
    fn open_connection_is_reused() {
        let ctx = context_to("example.com", 443);
        ctx.server.set_state(ConnectionState::OPEN);
        ctx.server.write().alpn = Some(HTTP2_ALPN.to_vec());
        let mut client = Engine::new(HttpClient::new(ctx.clone()), &ctx);
        let commands = feed(&mut client, Event::Start);
        assert_eq!(registered(&commands), Some(None));
        assert_eq!(client.handler().child.as_ref().map(|c| c.kind()), Some(LayerKind::Http2Client));
    }

    #[test]
    fn failure_is_recorded_on_the_connection() {
        let ctx = context_to("example.com", 80);
        let mut client = Engine::new(HttpClient::new(ctx.clone()), &ctx);
        let mut commands = feed(&mut client, Event::Start);
        let open = take_blocking(&mut commands);
        let commands = feed(&mut client, reply_open(&open, Some("refused")));
        assert_eq!(registered(&commands), Some(Some("refused".to_string())));
        assert_eq!(ctx.server.read().error.as_deref(), Some("refused"));
        assert!(feed(&mut client, Event::connection_closed(&ctx.server)).is_empty());
    }
}
