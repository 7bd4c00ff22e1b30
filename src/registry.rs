// Session registry: the single source of truth for identity → live connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::directory::Directory;
use crate::envelope::{Outbound, Reply};
use crate::events::{EventQueue, RegistryEvent};

/// Registry failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("identity '{0}' already has a live session")]
    IdentityInUse(String),
    #[error("session for '{0}' is no longer reachable")]
    SessionClosed(String),
}

/// Opaque id for one accepted connection, assigned before authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-side state for one authenticated, connected client.
#[derive(Debug)]
pub struct Session {
    pub conn: ConnId,
    pub identity: String,
    pub addr: SocketAddr,
    pub public_key: Vec<u8>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(
        conn: ConnId,
        identity: String,
        addr: SocketAddr,
        public_key: Vec<u8>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            conn,
            identity,
            addr,
            public_key,
            outbound,
        }
    }

    /// Queue a frame for this session's writer.
    pub fn send(&self, frame: Outbound) -> Result<(), RegistryError> {
        self.outbound
            .send(frame)
            .map_err(|_| RegistryError::SessionClosed(self.identity.clone()))
    }
}

/// Maps authenticated identities to live sessions.
///
/// Mutated only from the server's event-loop task; observers learn about
/// changes through the [`EventQueue`].
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    directory: Arc<dyn Directory>,
    events: EventQueue,
}

impl SessionRegistry {
    pub fn new(directory: Arc<dyn Directory>, events: EventQueue) -> Self {
        Self {
            sessions: HashMap::new(),
            directory,
            events,
        }
    }

    /// Admit an authenticated session. Fails if the identity is taken.
    pub fn register(&mut self, session: Session) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&session.identity) {
            return Err(RegistryError::IdentityInUse(session.identity.clone()));
        }

        let identity = session.identity.clone();
        tracing::info!(%identity, addr = %session.addr, "session registered");
        self.sessions.insert(identity.clone(), session);
        self.events.publish(RegistryEvent::ClientConnected { identity });
        Ok(())
    }

    /// Remove a session, notify the directory, and report the change.
    ///
    /// Returns the removed session so the caller can tear down the
    /// connection; `None` if the identity was not registered.
    pub fn unregister(&mut self, identity: &str) -> Option<Session> {
        let session = self.sessions.remove(identity)?;
        tracing::info!(%identity, "session unregistered");

        if let Err(e) = self.directory.record_logout(identity) {
            tracing::warn!(%identity, "failed to record logout: {e}");
        }
        self.events.publish(RegistryEvent::ClientDisconnected {
            identity: identity.to_string(),
        });
        Some(session)
    }

    pub fn lookup(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Best-effort service notice to every live session.
    ///
    /// A session whose send fails is removed, but the broadcast continues.
    /// Returns the connection ids of removed sessions so the event loop can
    /// drop their connections.
    pub fn broadcast(&mut self, notice: &str) -> Vec<ConnId> {
        let mut failed = Vec::new();
        for session in self.sessions.values() {
            if session
                .send(Outbound::Reply(Reply::notice(notice)))
                .is_err()
            {
                failed.push((session.identity.clone(), session.conn));
            }
        }

        let mut removed = Vec::new();
        for (identity, conn) in failed {
            tracing::warn!(%identity, "broadcast failed, removing session");
            self.unregister(&identity);
            removed.push(conn);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::events;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn session(identity: &str) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(ConnId::new(), identity.to_string(), addr(), Vec::new(), tx),
            rx,
        )
    }

    fn registry(
        directory: Arc<MemoryDirectory>,
    ) -> (SessionRegistry, mpsc::Receiver<RegistryEvent>) {
        let (queue, rx) = events::channel(16);
        (SessionRegistry::new(directory, queue), rx)
    }

    #[test]
    fn at_most_one_session_per_identity() {
        let directory = Arc::new(MemoryDirectory::new().with_user("alice", b"s"));
        let (mut registry, _events) = registry(directory);

        let (first, _rx1) = session("alice");
        let (second, _rx2) = session("alice");

        registry.register(first).unwrap();
        assert!(matches!(
            registry.register(second),
            Err(RegistryError::IdentityInUse(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_records_logout_exactly_once() {
        let directory = Arc::new(MemoryDirectory::new().with_user("alice", b"s"));
        let (mut registry, mut events) = registry(directory.clone());

        let (alice, _rx) = session("alice");
        registry.register(alice).unwrap();

        assert!(registry.unregister("alice").is_some());
        assert!(registry.unregister("alice").is_none());

        assert_eq!(directory.logout_count("alice"), 1);
        assert!(!registry.contains("alice"));

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ClientConnected {
                identity: "alice".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ClientDisconnected {
                identity: "alice".into()
            }
        );
    }

    #[test]
    fn lookup_finds_registered_sessions() {
        let directory = Arc::new(MemoryDirectory::new().with_user("alice", b"s"));
        let (mut registry, _events) = registry(directory);

        let (alice, mut rx) = session("alice");
        registry.register(alice).unwrap();

        let found = registry.lookup("alice").unwrap();
        found
            .send(Outbound::Reply(Reply::success()))
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Reply(Reply::Success { .. })
        ));

        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn broadcast_sweeps_dead_sessions_without_aborting() {
        let directory = Arc::new(
            MemoryDirectory::new()
                .with_user("alice", b"s")
                .with_user("bob", b"s"),
        );
        let (mut registry, _events) = registry(directory.clone());

        let (alice, mut alice_rx) = session("alice");
        let (bob, bob_rx) = session("bob");
        let bob_conn = bob.conn;
        registry.register(alice).unwrap();
        registry.register(bob).unwrap();

        // Bob's connection is gone.
        drop(bob_rx);

        let removed = registry.broadcast("directory changed");
        assert_eq!(removed, vec![bob_conn]);
        assert!(!registry.contains("bob"));
        assert_eq!(directory.logout_count("bob"), 1);

        // Alice still got the notice.
        match alice_rx.try_recv().unwrap() {
            Outbound::Reply(Reply::ServiceNotice { notice }) => {
                assert_eq!(notice, "directory changed")
            }
            other => panic!("expected notice, got {other:?}"),
        }
    }
}
