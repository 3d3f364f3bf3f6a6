//! Playbook helpers for driving layers in tests.
//!
//! These stand in for the driver: they answer blocking commands and keep
//! connection state bits in sync the way a real driver would.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::commands::{Command, CommandKind};
use crate::connection::{Address, ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::events::{Event, Reply};
use crate::hooks::{Hook, HookName};
use crate::layer::Layer;
use crate::options::Options;

pub fn context() -> Context {
    context_with(Options::default())
}

pub fn context_with(options: Options) -> Context {
    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    Context::new(ConnectionRef::client(Some(peer), Some(local)), Arc::new(options))
}

/// A context whose server target is already known.
pub fn context_to(host: &str, port: u16) -> Context {
    let ctx = context();
    let server = ConnectionRef::server(Some(Address::new(host, port)));
    ctx.with_server(server)
}

/// Feeds one event, panicking on contract violations, and drops log output.
pub fn feed(layer: &mut dyn Layer, event: Event) -> Vec<Command> {
    layer
        .handle_event(event)
        .unwrap()
        .into_iter()
        .filter(|c| !matches!(c.kind, CommandKind::Log { .. }))
        .collect()
}

/// Concatenated payload of all `SendData` commands for `conn`.
pub fn sent(commands: &[Command], conn: &ConnectionRef) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for command in commands {
        if let CommandKind::SendData { connection, data } = &command.kind {
            if connection == conn {
                buf.extend_from_slice(data);
            }
        }
    }
    buf.to_vec()
}

/// True if a full (not half) close of `conn` was issued.
pub fn closes(commands: &[Command], conn: &ConnectionRef) -> bool {
    commands.iter().any(|c| {
        matches!(&c.kind, CommandKind::CloseConnection { connection, half_close: false } if connection == conn)
    })
}

pub fn half_closes(commands: &[Command], conn: &ConnectionRef) -> bool {
    commands.iter().any(|c| {
        matches!(&c.kind, CommandKind::CloseConnection { connection, half_close: true } if connection == conn)
    })
}

pub fn hook_names(commands: &[Command]) -> Vec<HookName> {
    commands
        .iter()
        .filter_map(|c| match &c.kind {
            CommandKind::Hook(hook) => Some(hook.name()),
            _ => None,
        })
        .collect()
}

/// Removes and returns the last command, which must be a blocking one.
pub fn take_blocking(commands: &mut Vec<Command>) -> Command {
    let command = commands.pop().expect("no commands");
    assert!(command.is_blocking(), "not blocking: {:?}", command);
    command
}

/// Completes a hook command, handing the payload back unchanged.
pub fn reply_hook(command: Command) -> Event {
    match command.kind {
        CommandKind::Hook(hook) => Event::completed(command.id, Reply::Hook(hook)),
        other => panic!("not a hook: {:?}", other),
    }
}

/// Completes a hook command after letting `f` edit the payload.
pub fn reply_hook_with(command: Command, f: impl FnOnce(&mut Hook)) -> Event {
    match command.kind {
        CommandKind::Hook(mut hook) => {
            f(&mut hook);
            Event::completed(command.id, Reply::Hook(hook))
        }
        other => panic!("not a hook: {:?}", other),
    }
}

/// Completes an `OpenConnection`, opening the connection on success.
pub fn reply_open(command: &Command, err: Option<&str>) -> Event {
    match &command.kind {
        CommandKind::OpenConnection { connection } => {
            if err.is_none() {
                connection.set_state(ConnectionState::OPEN);
            }
            Event::completed(command.id, Reply::OpenConnection(err.map(str::to_string)))
        }
        other => panic!("not an open: {:?}", other),
    }
}

/// Delivers a peer close the way a driver does: clear the read bit first.
pub fn peer_closed(conn: &ConnectionRef) -> Event {
    conn.clear_state(ConnectionState::CAN_READ);
    Event::connection_closed(conn)
}

/// Applies close commands to connection state like a driver would.
pub fn apply_closes(commands: &[Command]) {
    for command in commands {
        if let CommandKind::CloseConnection {
            connection,
            half_close,
        } = &command.kind
        {
            if *half_close {
                connection.clear_state(ConnectionState::CAN_WRITE);
            } else {
                connection.set_state(ConnectionState::CLOSED);
            }
        }
    }
}
