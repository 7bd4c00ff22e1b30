// Contact & directory façade over the external user/contact store

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::envelope::now_timestamp;

/// Directory failure, surfaced to the requesting client as a reply.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("user '{0}' already exists")]
    UserExists(String),
    #[error("directory storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Narrow interface to the user/contact store.
///
/// The server consumes the directory only through this trait; the concrete
/// store (SQLite here, anything elsewhere) is an external collaborator.
pub trait Directory: Send + Sync {
    fn user_exists(&self, identity: &str) -> Result<bool, DirectoryError>;

    /// Opaque credential secret used as the HMAC key for this identity.
    fn credential_secret(&self, identity: &str) -> Result<Vec<u8>, DirectoryError>;

    /// Record a successful login: address and (possibly changed) public key.
    fn record_login(
        &self,
        identity: &str,
        address: SocketAddr,
        public_key: &[u8],
    ) -> Result<(), DirectoryError>;

    fn record_logout(&self, identity: &str) -> Result<(), DirectoryError>;

    fn get_contacts(&self, identity: &str) -> Result<Vec<String>, DirectoryError>;

    fn add_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError>;

    fn remove_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError>;

    fn list_identities(&self) -> Result<Vec<String>, DirectoryError>;

    /// Bookkeeping for a relayed message between two identities.
    fn record_message(&self, sender: &str, destination: &str) -> Result<(), DirectoryError>;

    /// Stored public key, if the user has published one.
    fn public_key(&self, identity: &str) -> Result<Option<Vec<u8>>, DirectoryError>;
}

/// Derive the stored credential secret from an identity and password.
///
/// Clients must apply the same derivation before answering a challenge.
pub fn derive_credential_secret(identity: &str, password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// SQLite-backed directory.
pub struct SqliteDirectory {
    db_path: PathBuf,
}

impl SqliteDirectory {
    /// Open (or create) the directory database at `path`.
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        let directory = Self {
            db_path: path.to_path_buf(),
        };
        directory.initialize_db()?;
        Ok(directory)
    }

    fn get_connection(&self) -> Result<Connection, DirectoryError> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn initialize_db(&self) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                identity TEXT PRIMARY KEY,
                secret BLOB NOT NULL,
                public_key BLOB,
                last_address TEXT,
                last_login_at INTEGER,
                last_logout_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS login_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                address TEXT NOT NULL,
                logged_in_at INTEGER NOT NULL,
                FOREIGN KEY (identity) REFERENCES users(identity) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS contacts (
                identity TEXT NOT NULL,
                contact TEXT NOT NULL,
                PRIMARY KEY (identity, contact)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS message_stats (
                identity TEXT PRIMARY KEY,
                sent INTEGER NOT NULL DEFAULT 0,
                received INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_login_history_identity
             ON login_history(identity)",
            [],
        )?;

        Ok(())
    }

    /// Provision a user with an opaque credential secret.
    pub fn register_user(&self, identity: &str, secret: &[u8]) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;

        if self.user_exists(identity)? {
            return Err(DirectoryError::UserExists(identity.to_string()));
        }

        conn.execute(
            "INSERT INTO users (identity, secret) VALUES (?1, ?2)",
            params![identity, secret],
        )?;
        Ok(())
    }

    fn require_user(&self, conn: &Connection, identity: &str) -> Result<(), DirectoryError> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DirectoryError::UnknownUser(identity.to_string()));
        }
        Ok(())
    }
}

impl Directory for SqliteDirectory {
    fn user_exists(&self, identity: &str) -> Result<bool, DirectoryError> {
        let conn = self.get_connection()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn credential_secret(&self, identity: &str) -> Result<Vec<u8>, DirectoryError> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT secret FROM users WHERE identity = ?1",
            params![identity],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| DirectoryError::UnknownUser(identity.to_string()))
    }

    fn record_login(
        &self,
        identity: &str,
        address: SocketAddr,
        public_key: &[u8],
    ) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;

        let now = now_timestamp() as i64;
        let address = address.to_string();

        conn.execute(
            "UPDATE users
             SET public_key = ?1, last_address = ?2, last_login_at = ?3
             WHERE identity = ?4",
            params![public_key, address, now, identity],
        )?;
        conn.execute(
            "INSERT INTO login_history (identity, address, logged_in_at)
             VALUES (?1, ?2, ?3)",
            params![identity, address, now],
        )?;
        Ok(())
    }

    fn record_logout(&self, identity: &str) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;

        conn.execute(
            "UPDATE users SET last_logout_at = ?1 WHERE identity = ?2",
            params![now_timestamp() as i64, identity],
        )?;
        Ok(())
    }

    fn get_contacts(&self, identity: &str) -> Result<Vec<String>, DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;

        let mut stmt = conn.prepare(
            "SELECT contact FROM contacts WHERE identity = ?1 ORDER BY contact",
        )?;
        let contacts = stmt
            .query_map(params![identity], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(contacts)
    }

    fn add_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;
        self.require_user(&conn, other)?;

        conn.execute(
            "INSERT OR IGNORE INTO contacts (identity, contact) VALUES (?1, ?2)",
            params![identity, other],
        )?;
        Ok(())
    }

    fn remove_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;

        conn.execute(
            "DELETE FROM contacts WHERE identity = ?1 AND contact = ?2",
            params![identity, other],
        )?;
        Ok(())
    }

    fn list_identities(&self) -> Result<Vec<String>, DirectoryError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("SELECT identity FROM users ORDER BY identity")?;
        let identities = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(identities)
    }

    fn record_message(&self, sender: &str, destination: &str) -> Result<(), DirectoryError> {
        let conn = self.get_connection()?;

        conn.execute(
            "INSERT INTO message_stats (identity, sent, received) VALUES (?1, 1, 0)
             ON CONFLICT(identity) DO UPDATE SET sent = sent + 1",
            params![sender],
        )?;
        conn.execute(
            "INSERT INTO message_stats (identity, sent, received) VALUES (?1, 0, 1)
             ON CONFLICT(identity) DO UPDATE SET received = received + 1",
            params![destination],
        )?;
        Ok(())
    }

    fn public_key(&self, identity: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let conn = self.get_connection()?;
        self.require_user(&conn, identity)?;

        let key: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT public_key FROM users WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key.flatten().filter(|k| !k.is_empty()))
    }
}

#[derive(Default)]
struct MemoryUser {
    secret: Vec<u8>,
    public_key: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, MemoryUser>,
    contacts: HashMap<String, BTreeSet<String>>,
    logins: Vec<(String, SocketAddr)>,
    logouts: Vec<String>,
    messages: Vec<(String, String)>,
}

/// In-memory directory for tests and embedded use.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<MemoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provision a user with an opaque credential secret.
    pub fn register_user(&self, identity: &str, secret: &[u8]) -> Result<(), DirectoryError> {
        let mut state = self.state();
        if state.users.contains_key(identity) {
            return Err(DirectoryError::UserExists(identity.to_string()));
        }
        state.users.insert(
            identity.to_string(),
            MemoryUser {
                secret: secret.to_vec(),
                public_key: Vec::new(),
            },
        );
        Ok(())
    }

    /// Builder form of [`register_user`](Self::register_user) for fixtures.
    pub fn with_user(self, identity: &str, secret: &[u8]) -> Self {
        self.register_user(identity, secret)
            .unwrap_or_else(|_| panic!("duplicate fixture user '{identity}'"));
        self
    }

    /// Number of recorded logouts for `identity`.
    pub fn logout_count(&self, identity: &str) -> usize {
        self.state().logouts.iter().filter(|i| *i == identity).count()
    }

    /// Number of recorded logins for `identity`.
    pub fn login_count(&self, identity: &str) -> usize {
        self.state()
            .logins
            .iter()
            .filter(|(i, _)| i == identity)
            .count()
    }

    /// Recorded (sender, destination) pairs, in order.
    pub fn recorded_messages(&self) -> Vec<(String, String)> {
        self.state().messages.clone()
    }
}

impl Directory for MemoryDirectory {
    fn user_exists(&self, identity: &str) -> Result<bool, DirectoryError> {
        Ok(self.state().users.contains_key(identity))
    }

    fn credential_secret(&self, identity: &str) -> Result<Vec<u8>, DirectoryError> {
        self.state()
            .users
            .get(identity)
            .map(|u| u.secret.clone())
            .ok_or_else(|| DirectoryError::UnknownUser(identity.to_string()))
    }

    fn record_login(
        &self,
        identity: &str,
        address: SocketAddr,
        public_key: &[u8],
    ) -> Result<(), DirectoryError> {
        let mut state = self.state();
        let user = state
            .users
            .get_mut(identity)
            .ok_or_else(|| DirectoryError::UnknownUser(identity.to_string()))?;
        user.public_key = public_key.to_vec();
        state.logins.push((identity.to_string(), address));
        Ok(())
    }

    fn record_logout(&self, identity: &str) -> Result<(), DirectoryError> {
        let mut state = self.state();
        if !state.users.contains_key(identity) {
            return Err(DirectoryError::UnknownUser(identity.to_string()));
        }
        state.logouts.push(identity.to_string());
        Ok(())
    }

    fn get_contacts(&self, identity: &str) -> Result<Vec<String>, DirectoryError> {
        let state = self.state();
        if !state.users.contains_key(identity) {
            return Err(DirectoryError::UnknownUser(identity.to_string()));
        }
        Ok(state
            .contacts
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn add_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError> {
        let mut state = self.state();
        if !state.users.contains_key(identity) {
            return Err(DirectoryError::UnknownUser(identity.to_string()));
        }
        if !state.users.contains_key(other) {
            return Err(DirectoryError::UnknownUser(other.to_string()));
        }
        state
            .contacts
            .entry(identity.to_string())
            .or_default()
            .insert(other.to_string());
        Ok(())
    }

    fn remove_contact(&self, identity: &str, other: &str) -> Result<(), DirectoryError> {
        let mut state = self.state();
        if !state.users.contains_key(identity) {
            return Err(DirectoryError::UnknownUser(identity.to_string()));
        }
        if let Some(set) = state.contacts.get_mut(identity) {
            set.remove(other);
        }
        Ok(())
    }

    fn list_identities(&self) -> Result<Vec<String>, DirectoryError> {
        let mut identities: Vec<String> = self.state().users.keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }

    fn record_message(&self, sender: &str, destination: &str) -> Result<(), DirectoryError> {
        self.state()
            .messages
            .push((sender.to_string(), destination.to_string()));
        Ok(())
    }

    fn public_key(&self, identity: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let state = self.state();
        let user = state
            .users
            .get(identity)
            .ok_or_else(|| DirectoryError::UnknownUser(identity.to_string()))?;
        Ok((!user.public_key.is_empty()).then(|| user.public_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn sqlite_user_lifecycle() {
        let dir = tempdir().unwrap();
        let directory = SqliteDirectory::open(&dir.path().join("directory.db")).unwrap();

        assert!(!directory.user_exists("alice").unwrap());
        directory.register_user("alice", b"alice-secret").unwrap();
        assert!(directory.user_exists("alice").unwrap());

        assert_eq!(directory.credential_secret("alice").unwrap(), b"alice-secret");
        assert!(matches!(
            directory.credential_secret("mallory"),
            Err(DirectoryError::UnknownUser(_))
        ));

        assert!(matches!(
            directory.register_user("alice", b"other"),
            Err(DirectoryError::UserExists(_))
        ));
    }

    #[test]
    fn sqlite_login_records_address_and_public_key() {
        let dir = tempdir().unwrap();
        let directory = SqliteDirectory::open(&dir.path().join("directory.db")).unwrap();
        directory.register_user("alice", b"s").unwrap();

        assert_eq!(directory.public_key("alice").unwrap(), None);

        directory.record_login("alice", addr(), b"alice-key").unwrap();
        assert_eq!(
            directory.public_key("alice").unwrap(),
            Some(b"alice-key".to_vec())
        );

        // Key is replaced on the next login.
        directory.record_login("alice", addr(), b"new-key").unwrap();
        assert_eq!(
            directory.public_key("alice").unwrap(),
            Some(b"new-key".to_vec())
        );

        directory.record_logout("alice").unwrap();
        assert!(matches!(
            directory.record_logout("nobody"),
            Err(DirectoryError::UnknownUser(_))
        ));
    }

    #[test]
    fn sqlite_contacts_round_trip() {
        let dir = tempdir().unwrap();
        let directory = SqliteDirectory::open(&dir.path().join("directory.db")).unwrap();
        for user in ["alice", "bob", "carol"] {
            directory.register_user(user, b"s").unwrap();
        }

        directory.add_contact("alice", "bob").unwrap();
        directory.add_contact("alice", "carol").unwrap();
        // Duplicates are idempotent.
        directory.add_contact("alice", "bob").unwrap();

        assert_eq!(directory.get_contacts("alice").unwrap(), vec!["bob", "carol"]);

        directory.remove_contact("alice", "bob").unwrap();
        assert_eq!(directory.get_contacts("alice").unwrap(), vec!["carol"]);

        assert!(matches!(
            directory.add_contact("alice", "nobody"),
            Err(DirectoryError::UnknownUser(_))
        ));
    }

    #[test]
    fn sqlite_lists_identities_and_counts_messages() {
        let dir = tempdir().unwrap();
        let directory = SqliteDirectory::open(&dir.path().join("directory.db")).unwrap();
        directory.register_user("bob", b"s").unwrap();
        directory.register_user("alice", b"s").unwrap();

        assert_eq!(directory.list_identities().unwrap(), vec!["alice", "bob"]);

        directory.record_message("alice", "bob").unwrap();
        directory.record_message("alice", "bob").unwrap();

        let conn = directory.get_connection().unwrap();
        let sent: i64 = conn
            .query_row(
                "SELECT sent FROM message_stats WHERE identity = 'alice'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let received: i64 = conn
            .query_row(
                "SELECT received FROM message_stats WHERE identity = 'bob'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!((sent, received), (2, 2));
    }

    #[test]
    fn sqlite_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("directory.db");

        let directory = SqliteDirectory::open(&db_path).unwrap();
        directory.register_user("alice", b"alice-secret").unwrap();
        drop(directory);

        let reopened = SqliteDirectory::open(&db_path).unwrap();
        assert!(reopened.user_exists("alice").unwrap());
        assert_eq!(reopened.credential_secret("alice").unwrap(), b"alice-secret");
    }

    #[test]
    fn memory_directory_tracks_logins_and_logouts() {
        let directory = MemoryDirectory::new().with_user("alice", b"s");

        directory.record_login("alice", addr(), b"key").unwrap();
        directory.record_logout("alice").unwrap();
        directory.record_logout("alice").unwrap();

        assert_eq!(directory.login_count("alice"), 1);
        assert_eq!(directory.logout_count("alice"), 2);
        assert_eq!(directory.public_key("alice").unwrap(), Some(b"key".to_vec()));
    }

    #[test]
    fn derived_secrets_differ_per_identity() {
        let a = derive_credential_secret("alice", "hunter2");
        let b = derive_credential_secret("bob", "hunter2");
        assert_ne!(a, b);
        assert_eq!(a, derive_credential_secret("alice", "hunter2"));
    }
}
