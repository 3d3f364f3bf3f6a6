//! The I/O side of one client connection.
//!
//! A [`ConnectionHandler`] owns the sockets of a client connection and the
//! server connections opened on its behalf. It feeds the layer stack one
//! event at a time and carries out the commands that come back:
//!
//! ```text
//! reader tasks ──┐
//! connect tasks ─┼─▶ Signal channel ─▶ layer.handle_event ─▶ commands
//! hook tasks ────┘                                            │
//!        ▲                                                    │
//!        └──────────── spawn / write / close ◀────────────────┘
//! ```
//!
//! Everything that can take a while (connecting, addons, timers) runs in its
//! own task and reports back through the channel, so the stack itself is
//! only ever touched from the handler's loop.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Level};

use strata_core::commands::{Command, CommandId, CommandKind};
use strata_core::connection::{ConnectionId, ConnectionRef, ConnectionState};
use strata_core::context::Context;
use strata_core::events::{Event, Reply, SocketHandle};
use strata_core::hooks::Hook;
use strata_core::layer::{Handler, Layer};
use strata_core::layers::next_layer::NextLayer;

use crate::addons::AddonChain;
use crate::error::Result;

const READ_SIZE: usize = 64 * 1024;

/// Time allowed for a server connection to be established.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What the tasks of a connection report back.
enum Signal {
    Event(Event),
    Opened {
        command: CommandId,
        conn: ConnectionRef,
        result: io::Result<TcpStream>,
    },
    /// EOF or read error.
    ReadClosed(ConnectionRef),
    HookDone {
        command: CommandId,
        hook: Hook,
    },
}

struct Transport {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Drives the layer stack of a single client connection.
pub struct ConnectionHandler {
    ctx: Context,
    layer: Box<dyn Layer>,
    addons: Arc<AddonChain>,
    transports: HashMap<ConnectionId, Transport>,
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
    /// Connects and hooks still owed a completion.
    inflight: usize,
    peer: String,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("peer", &self.peer)
            .field("layer", &self.layer)
            .field("transports", &self.transports.len())
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl ConnectionHandler {
    /// A handler whose stack starts with protocol detection.
    pub fn new(ctx: Context, addons: Arc<AddonChain>) -> Self {
        let layer = NextLayer::new(ctx.clone()).boxed(&ctx);
        Self::with_layer(ctx, layer, addons)
    }

    /// A handler with a custom root layer.
    pub fn with_layer(ctx: Context, layer: Box<dyn Layer>, addons: Arc<AddonChain>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = ctx
            .client
            .read()
            .peername
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            ctx,
            layer,
            addons,
            transports: HashMap::new(),
            tx,
            rx,
            inflight: 0,
            peer,
        }
    }

    /// Serves `stream` as the client connection until every connection is
    /// closed and no hook or connect is outstanding.
    pub async fn run(mut self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        self.ctx.client.set_state(ConnectionState::OPEN);
        let client = self.ctx.client.clone();
        self.attach(&client, stream);
        debug!(client = %self.peer, "client connected");

        let result = self.serve().await;
        self.shutdown().await;
        debug!(client = %self.peer, "client disconnected");
        result
    }

    async fn serve(&mut self) -> Result<()> {
        self.feed(Event::Start).await?;
        while !self.transports.is_empty() || self.inflight > 0 {
            let Some(signal) = self.rx.recv().await else {
                break;
            };
            match signal {
                Signal::Event(event) => self.feed(event).await?,
                Signal::Opened { command, conn, result } => {
                    self.inflight -= 1;
                    self.opened(command, conn, result).await?;
                }
                Signal::ReadClosed(conn) => {
                    if !self.transports.contains_key(&conn.id()) {
                        continue;
                    }
                    conn.clear_state(ConnectionState::CAN_READ);
                    if conn.state().is_closed() {
                        self.detach(&conn);
                    }
                    self.feed(Event::connection_closed(&conn)).await?;
                }
                Signal::HookDone { command, hook } => {
                    self.inflight -= 1;
                    self.feed(Event::completed(command, Reply::Hook(hook))).await?;
                }
            }
        }
        Ok(())
    }

    async fn feed(&mut self, event: Event) -> Result<()> {
        let commands = match self.layer.handle_event(event) {
            Ok(commands) => commands,
            Err(e) => {
                error!(client = %self.peer, "layer stack failed: {}", e);
                return Err(e.into());
            }
        };
        for command in commands {
            self.execute(command).await;
        }
        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        let id = command.id;
        match command.kind {
            CommandKind::SendData { connection, data } => self.send(&connection, &data).await,
            CommandKind::OpenConnection { connection } => self.open(id, connection),
            CommandKind::CloseConnection {
                connection,
                half_close,
            } => self.close(&connection, half_close).await,
            CommandKind::RequestWakeup { delay } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Signal::Event(Event::completed(id, Reply::Wakeup)));
                });
            }
            CommandKind::Hook(hook) => self.hook(id, hook),
            CommandKind::Log { message, level } => self.log(level, &message),
            CommandKind::GetSocket { connection } => {
                let handle = self.socket_handle(&connection);
                self.complete(id, Reply::GetSocket(handle));
            }
            CommandKind::EstablishServerTls { .. } => {
                self.complete(id, Reply::EstablishServerTls(Some("no TLS layer to establish".to_string())));
            }
            CommandKind::GetHttpConnection(_) => {
                self.complete(id, Reply::HttpConnection(Err("no HTTP layer to connect".to_string())));
            }
            other => warn!(client = %self.peer, "unhandled command: {:?}", other),
        }
    }

    /// Queues a completion for the next loop iteration.
    fn complete(&self, command: CommandId, reply: Reply) {
        let _ = self.tx.send(Signal::Event(Event::completed(command, reply)));
    }

    fn attach(&mut self, conn: &ConnectionRef, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let reader = spawn_reader(conn.clone(), reader, self.tx.clone());
        self.transports.insert(conn.id(), Transport { writer, reader });
    }

    fn detach(&mut self, conn: &ConnectionRef) -> Option<Transport> {
        let transport = self.transports.remove(&conn.id());
        conn.write().timestamp_end = Some(Utc::now());
        transport
    }

    async fn send(&mut self, conn: &ConnectionRef, data: &Bytes) {
        let Some(transport) = self.transports.get_mut(&conn.id()) else {
            debug!(client = %self.peer, "dropping {} bytes for closed connection {:?}", data.len(), conn);
            return;
        };
        if let Err(e) = transport.writer.write_all(data).await {
            // The reader sees the failure too and reports the close.
            debug!(client = %self.peer, "write to {:?} failed: {}", conn, e);
        }
    }

    fn open(&mut self, command: CommandId, conn: ConnectionRef) {
        let target = {
            let c = conn.read();
            c.via.as_ref().map(|v| v.address.clone()).or_else(|| c.address.clone())
        };
        let Some(address) = target else {
            self.complete(command, Reply::OpenConnection(Some("no server address".to_string())));
            return;
        };
        if self.transports.contains_key(&conn.id()) {
            self.complete(command, Reply::OpenConnection(Some("connection already open".to_string())));
            return;
        }

        self.inflight += 1;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let connect = TcpStream::connect((address.host.as_str(), address.port));
            let result = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out")),
            };
            let _ = tx.send(Signal::Opened { command, conn, result });
        });
    }

    async fn opened(&mut self, command: CommandId, conn: ConnectionRef, result: io::Result<TcpStream>) -> Result<()> {
        let reply = match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                {
                    let mut c = conn.write();
                    c.peername = stream.peer_addr().ok();
                    c.sockname = stream.local_addr().ok();
                    c.timestamp_start = Some(Utc::now());
                    c.state = ConnectionState::OPEN;
                    c.error = None;
                }
                info!(client = %self.peer, server = ?conn.address(), "server connected");
                self.attach(&conn, stream);
                None
            }
            Err(e) => {
                warn!(client = %self.peer, server = ?conn.address(), "server connect failed: {}", e);
                conn.write().error = Some(e.to_string());
                Some(e.to_string())
            }
        };
        self.feed(Event::completed(command, Reply::OpenConnection(reply))).await
    }

    async fn close(&mut self, conn: &ConnectionRef, half_close: bool) {
        if half_close {
            conn.clear_state(ConnectionState::CAN_WRITE);
            if let Some(transport) = self.transports.get_mut(&conn.id()) {
                let _ = transport.writer.shutdown().await;
            }
            if conn.state().is_closed() {
                self.detach(conn);
            }
            return;
        }
        conn.set_state(ConnectionState::CLOSED);
        if let Some(mut transport) = self.detach(conn) {
            let _ = transport.writer.shutdown().await;
            transport.reader.abort();
        }
    }

    fn hook(&mut self, command: CommandId, mut hook: Hook) {
        trace!(client = %self.peer, hook = %hook.name(), "hook");
        self.inflight += 1;
        let addons = self.addons.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            addons.invoke(&mut hook).await;
            let _ = tx.send(Signal::HookDone { command, hook });
        });
    }

    fn log(&self, level: Level, message: &str) {
        let peer = &self.peer;
        if level == Level::ERROR {
            error!(client = %peer, "{}", message);
        } else if level == Level::WARN {
            warn!(client = %peer, "{}", message);
        } else if level == Level::INFO {
            info!(client = %peer, "{}", message);
        } else if level == Level::DEBUG {
            debug!(client = %peer, "{}", message);
        } else {
            trace!(client = %peer, "{}", message);
        }
    }

    #[cfg(unix)]
    fn socket_handle(&self, conn: &ConnectionRef) -> Option<SocketHandle> {
        use std::os::unix::io::AsRawFd;
        self.transports
            .get(&conn.id())
            .map(|t| SocketHandle(i64::from(t.writer.as_ref().as_raw_fd())))
    }

    #[cfg(not(unix))]
    fn socket_handle(&self, _conn: &ConnectionRef) -> Option<SocketHandle> {
        None
    }

    /// Closes whatever is still open.
    async fn shutdown(&mut self) {
        for (_, mut transport) in self.transports.drain() {
            let _ = transport.writer.shutdown().await;
            transport.reader.abort();
        }
    }
}

fn spawn_reader(conn: ConnectionRef, mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Signal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = Event::data_received(&conn, Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Signal::Event(event)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    conn.write().error = Some(e.to_string());
                    break;
                }
            }
        }
        let _ = tx.send(Signal::ReadClosed(conn));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    use strata_core::options::Options;
    use strata_core::testing::context_with;

    use crate::addons::NextLayerAddon;
    use crate::policy::NextLayerPolicy;

    async fn origin(response: &'static [u8]) -> (std::net::SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response).await.unwrap();
            received
        });
        (addr, task)
    }

    async fn proxy(options: Options) -> (std::net::SocketAddr, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let policy = NextLayerPolicy::from_options(&options).unwrap();
        let addons = Arc::new(AddonChain::new().with(Arc::new(NextLayerAddon::new(policy))));
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ctx = context_with(options);
            ConnectionHandler::new(ctx, addons).run(stream).await
        });
        (addr, task)
    }

    async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn forwards_a_proxied_request() {
        let (origin_addr, origin_task) = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nHello World!").await;
        let (proxy_addr, proxy_task) = proxy(Options::default()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
            port = origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(b"Hello World!"));

        let received = origin_task.await.unwrap();
        assert!(received.starts_with(b"GET / HTTP/1.1\r\n"));
        drop(client);
        proxy_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_host_is_answered_locally() {
        let (proxy_addr, proxy_task) = proxy(Options::default()).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 400"));
        proxy_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_gives_502() {
        // Bind and drop to get a port nobody listens on.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (proxy_addr, proxy_task) = proxy(Options::default()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = closed.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 502"));
        drop(client);
        proxy_task.await.unwrap().unwrap();
    }
}
