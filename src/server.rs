// Event loop / connection multiplexer

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::codec::{Inbound, WireCodec};
use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::envelope::{Envelope, EnvelopeKind, Outbound, Reply};
use crate::events::{self, RegistryEvent};
use crate::handshake::{self, AuthChallenge, AuthState, RejectReason};
use crate::registry::{ConnId, Session, SessionRegistry};
use crate::router::{Disposition, Router};

/// How many connection events are drained per loop iteration.
const EVENT_BATCH: usize = 64;

/// How long shutdown waits for each connection pump to flush and exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Commands accepted by a running server.
#[derive(Debug)]
pub enum ServerCommand {
    /// Send a service notice to every live session.
    Broadcast(String),
    /// Stop accepting, notify sessions, close all sockets, return.
    Shutdown,
}

/// Handle for steering a running server from outside its task.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerHandle {
    pub fn broadcast(&self, notice: &str) -> Result<()> {
        self.tx
            .send(ServerCommand::Broadcast(notice.to_string()))
            .context("server is not running")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ServerCommand::Shutdown)
            .context("server is not running")
    }
}

/// Why a connection pump stopped.
#[derive(Debug)]
enum CloseReason {
    /// Orderly close: EOF on a frame boundary, or the server let go.
    Clean,
    /// Reset, broken pipe, or EOF mid-record.
    Reset(String),
}

/// What a connection pump reports back to the event loop.
#[derive(Debug)]
enum ConnEvent {
    Frame { conn: ConnId, envelope: Envelope },
    Malformed { conn: ConnId, error: String },
    Closed { conn: ConnId, reason: CloseReason },
}

/// One open socket, authenticated or not.
struct Connection {
    addr: SocketAddr,
    auth: AuthState,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Queue a frame; a dead pump surfaces as a close event, not here.
    fn send(&self, frame: Outbound) {
        let _ = self.outbound.send(frame);
    }
}

/// The chat server: one listener, one event-loop task that owns all state.
///
/// The connection table and the session registry are mutated only from
/// [`run`](Self::run); connection pumps and external callers reach the loop
/// exclusively through channels.
pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    directory: Arc<dyn Directory>,
    registry: SessionRegistry,
    router: Router,
    connections: HashMap<ConnId, Connection>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    command_tx: mpsc::UnboundedSender<ServerCommand>,
    command_rx: mpsc::UnboundedReceiver<ServerCommand>,
    events_rx: Option<mpsc::Receiver<RegistryEvent>>,
}

impl ChatServer {
    /// Bind the listening socket. Failure here is fatal and reported to the
    /// caller; everything after startup is isolated per connection.
    pub async fn bind(config: ServerConfig, directory: Arc<dyn Directory>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?;
        tracing::info!(%local_addr, max_connections = config.max_connections, "listening");

        let (event_queue, events_rx) = events::channel(config.event_queue_capacity);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Ok(Self {
            registry: SessionRegistry::new(directory.clone(), event_queue),
            router: Router::new(directory.clone()),
            config,
            listener,
            local_addr,
            directory,
            connections: HashMap::new(),
            conn_tx,
            conn_rx,
            command_tx,
            command_rx,
            events_rx: Some(events_rx),
        })
    }

    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Receiver for registry-change events. Yields `None` after the first
    /// call — there is one observer queue.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RegistryEvent>> {
        self.events_rx.take()
    }

    /// Drive the server until a shutdown command arrives.
    pub async fn run(mut self) -> Result<()> {
        let mut housekeeping = tokio::time::interval(self.config.poll_timeout);
        let mut pending: Vec<ConnEvent> = Vec::with_capacity(EVENT_BATCH);

        loop {
            tokio::select! {
                accepted = self.listener.accept(),
                    if self.connections.len() < self.config.max_connections =>
                {
                    match accepted {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => tracing::warn!("accept failed: {e}"),
                    }
                }
                _ = self.conn_rx.recv_many(&mut pending, EVENT_BATCH) => {
                    // The pending queue is fully drained every iteration, in
                    // the order the pumps reported.
                    for event in pending.drain(..) {
                        self.dispatch(event);
                    }
                }
                command = self.command_rx.recv() => match command {
                    Some(ServerCommand::Broadcast(notice)) => self.broadcast(&notice),
                    Some(ServerCommand::Shutdown) | None => break,
                },
                _ = housekeeping.tick() => self.expire_stale_handshakes(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn = ConnId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(conn, stream, outbound_rx, self.conn_tx.clone()));

        self.connections.insert(
            conn,
            Connection {
                addr,
                auth: AuthState::Connected,
                outbound: outbound_tx,
                task,
            },
        );
        tracing::info!(%conn, %addr, "connection accepted");

        if self.connections.len() >= self.config.max_connections {
            tracing::warn!(
                limit = self.config.max_connections,
                "connection capacity reached; further clients wait in the accept backlog"
            );
        }
    }

    fn dispatch(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame { conn, envelope } => self.handle_frame(conn, envelope),
            ConnEvent::Malformed { conn, error } => {
                tracing::debug!(%conn, "malformed envelope: {error}");
                let mid_handshake = matches!(
                    self.connections.get(&conn).map(|c| &c.auth),
                    Some(AuthState::ChallengeSent(_))
                );
                if mid_handshake {
                    // A garbled challenge reply rejects the login outright.
                    self.reject(conn, "malformed challenge reply");
                } else {
                    // Protocol error: answer and keep the connection open.
                    self.send_to(
                        conn,
                        Reply::bad_request(format!("malformed envelope: {error}")),
                    );
                }
            }
            ConnEvent::Closed { conn, reason } => self.handle_closed(conn, reason),
        }
    }

    fn handle_frame(&mut self, conn: ConnId, envelope: Envelope) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };

        if let AuthState::Verified { identity } = &connection.auth {
            let identity = identity.clone();
            if self.router.route(&mut self.registry, &identity, envelope) == Disposition::Close {
                self.close_connection(conn);
            }
        } else {
            self.advance_handshake(conn, envelope);
        }
    }

    fn advance_handshake(&mut self, conn: ConnId, envelope: Envelope) {
        let Some(state) = self
            .connections
            .get_mut(&conn)
            .map(|c| std::mem::replace(&mut c.auth, AuthState::Connected))
        else {
            return;
        };

        match (state, envelope.kind) {
            (AuthState::Connected, EnvelopeKind::Login) => {
                self.start_handshake(conn, envelope);
            }
            (AuthState::ChallengeSent(challenge), EnvelopeKind::ChallengeReply) => {
                self.finish_handshake(conn, challenge, envelope);
            }
            (AuthState::ChallengeSent(_), _) => {
                // Anything but a digest mid-handshake counts as a malformed
                // reply; the challenge is consumed.
                self.reject(conn, "malformed challenge reply");
            }
            (AuthState::Connected, _) => {
                self.send_to(conn, Reply::bad_request("authenticate first"));
            }
            (state @ AuthState::Verified { .. }, _) => {
                self.set_auth(conn, state);
            }
        }
    }

    /// `Connected → ChallengeSent`, or rejection.
    fn start_handshake(&mut self, conn: ConnId, envelope: Envelope) {
        let identity = envelope.sender;
        let public_key = envelope.payload;

        match self.check_login(&identity) {
            Err(reason) => self.reject(conn, &reason),
            Ok(secret) => {
                let (challenge, nonce) =
                    handshake::issue_challenge(self.config.digest, &identity, public_key, &secret);
                self.set_auth(conn, AuthState::ChallengeSent(challenge));
                self.send_to(conn, Reply::Challenge { nonce });
                tracing::debug!(%conn, %identity, "challenge issued");
            }
        }
    }

    /// Login guards: known identity, not already live, secret available.
    fn check_login(&self, identity: &str) -> std::result::Result<Vec<u8>, String> {
        match self.directory.user_exists(identity) {
            Ok(true) => {}
            Ok(false) => return Err(RejectReason::UnknownUser.to_string()),
            Err(e) => {
                tracing::error!("directory failure during login: {e}");
                return Err("directory unavailable".to_string());
            }
        }

        if self.registry.contains(identity) {
            return Err(RejectReason::IdentityInUse.to_string());
        }

        match self.directory.credential_secret(identity) {
            Ok(secret) => Ok(secret),
            Err(e) => {
                tracing::error!("directory failure during login: {e}");
                Err("directory unavailable".to_string())
            }
        }
    }

    /// `ChallengeSent → Verified`, or rejection. The challenge is consumed
    /// either way.
    fn finish_handshake(&mut self, conn: ConnId, challenge: AuthChallenge, envelope: Envelope) {
        if !challenge.verify(&envelope.payload) {
            self.reject(conn, &RejectReason::WrongCredentials.to_string());
            return;
        }

        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        let addr = connection.addr;
        let outbound = connection.outbound.clone();
        let identity = challenge.identity;
        let public_key = challenge.public_key;

        let session = Session::new(conn, identity.clone(), addr, public_key.clone(), outbound);
        if self.registry.register(session).is_err() {
            // Two handshakes raced for the same identity; the first one won.
            self.reject(conn, &RejectReason::IdentityInUse.to_string());
            return;
        }

        if let Err(e) = self.directory.record_login(&identity, addr, &public_key) {
            tracing::warn!(%identity, "failed to record login: {e}");
        }

        self.set_auth(
            conn,
            AuthState::Verified {
                identity: identity.clone(),
            },
        );
        self.send_to(conn, Reply::success());
        tracing::info!(%conn, %identity, "session verified");
    }

    /// Authentication failure: explicit reply, then the connection closes.
    fn reject(&mut self, conn: ConnId, reason: &str) {
        tracing::info!(%conn, %reason, "login rejected");
        self.send_to(conn, Reply::bad_request(reason));
        self.close_connection(conn);
    }

    fn handle_closed(&mut self, conn: ConnId, reason: CloseReason) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        match &reason {
            CloseReason::Clean => {
                tracing::info!(%conn, addr = %connection.addr, "connection closed")
            }
            CloseReason::Reset(e) => {
                tracing::info!(%conn, addr = %connection.addr, "connection reset: {e}")
            }
        }

        if let AuthState::Verified { identity } = connection.auth {
            // Registry removal and directory logout happen before the socket
            // is forgotten; half-open connections leave no trace.
            self.registry.unregister(&identity);
        }
    }

    /// Drop a connection. Its pump flushes queued frames, then closes the
    /// socket; the trailing close event finds nothing left to do.
    fn close_connection(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            if let AuthState::Verified { identity } = &connection.auth {
                self.registry.unregister(identity);
            }
        }
    }

    fn broadcast(&mut self, notice: &str) {
        for conn in self.registry.broadcast(notice) {
            self.close_connection(conn);
        }
    }

    fn expire_stale_handshakes(&mut self) {
        let timeout = self.config.handshake_timeout;
        let stale: Vec<ConnId> = self
            .connections
            .iter()
            .filter_map(|(id, connection)| match &connection.auth {
                AuthState::ChallengeSent(challenge) if challenge.expired(timeout) => Some(*id),
                _ => None,
            })
            .collect();

        for conn in stale {
            self.reject(conn, "handshake timed out");
        }
    }

    fn set_auth(&mut self, conn: ConnId, auth: AuthState) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.auth = auth;
        }
    }

    fn send_to(&self, conn: ConnId, reply: Reply) {
        if let Some(connection) = self.connections.get(&conn) {
            connection.send(Outbound::Reply(reply));
        }
    }

    /// Stop accepting, drain in-flight events, notify sessions, close all.
    async fn shutdown(mut self) {
        tracing::info!("shutting down");

        while let Ok(event) = self.conn_rx.try_recv() {
            self.dispatch(event);
        }

        self.registry.broadcast("server shutting down");
        for identity in self.registry.identities() {
            self.registry.unregister(&identity);
        }

        let connections: Vec<Connection> =
            self.connections.drain().map(|(_, c)| c).collect();
        let mut tasks = Vec::with_capacity(connections.len());
        for connection in connections {
            let Connection { outbound, task, .. } = connection;
            drop(outbound);
            tasks.push(task);
        }
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("connection pump did not exit promptly");
            }
        }

        tracing::info!("shutdown complete");
    }
}

/// Per-connection pump: shuttles frames between one socket and the event
/// loop. Owns the socket; all protocol decisions live in the loop task.
async fn run_connection(
    conn: ConnId,
    stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut framed = Framed::new(stream, WireCodec::default());

    let reason = loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        break CloseReason::Reset(e.to_string());
                    }
                }
                // The server let go of this connection; everything queued
                // before that has been sent and flushed.
                None => break CloseReason::Clean,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(Inbound::Envelope(envelope))) => {
                    if events.send(ConnEvent::Frame { conn, envelope }).is_err() {
                        break CloseReason::Clean;
                    }
                }
                Some(Ok(Inbound::Malformed { error })) => {
                    if events.send(ConnEvent::Malformed { conn, error }).is_err() {
                        break CloseReason::Clean;
                    }
                }
                Some(Err(e)) => break CloseReason::Reset(e.to_string()),
                None => break CloseReason::Clean,
            },
        }
    };

    let _ = events.send(ConnEvent::Closed { conn, reason });
}
