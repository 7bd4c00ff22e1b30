//! skiff - a small chat/messaging server
//!
//! One listener, one event-loop task. Clients authenticate with an HMAC
//! challenge-response handshake and exchange newline-delimited JSON envelopes;
//! the router relays chat messages between live sessions and answers
//! directory queries through a narrow storage façade.

pub mod codec;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod events;
pub mod handshake;
pub mod registry;
pub mod router;
pub mod server;

pub use codec::{Inbound, WireCodec};
pub use config::{ConfigError, DigestAlgorithm, ServerConfig};
pub use directory::{Directory, DirectoryError, MemoryDirectory, SqliteDirectory};
pub use envelope::{Envelope, EnvelopeKind, Outbound, Reply};
pub use events::RegistryEvent;
pub use handshake::{AuthChallenge, AuthState};
pub use registry::{ConnId, Session, SessionRegistry};
pub use router::{Disposition, Router};
pub use server::{ChatServer, ServerHandle};
