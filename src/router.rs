// Message router: interprets envelopes from authenticated sessions

use std::sync::Arc;

use crate::directory::{Directory, DirectoryError};
use crate::envelope::{Envelope, EnvelopeKind, Outbound, Reply};
use crate::registry::SessionRegistry;

/// What should happen to the sending connection after routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

/// Routes envelopes between sessions and the directory.
///
/// One envelope in, zero or more outbound frames, plus a disposition for the
/// sender's connection. All failures stay scoped to the envelope that caused
/// them.
pub struct Router {
    directory: Arc<dyn Directory>,
}

impl Router {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Handle one envelope from the session authenticated as `identity`.
    pub fn route(
        &self,
        registry: &mut SessionRegistry,
        identity: &str,
        envelope: Envelope,
    ) -> Disposition {
        if envelope.sender != identity {
            tracing::warn!(
                %identity,
                claimed = %envelope.sender,
                "envelope sender does not match session identity"
            );
            self.reply(
                registry,
                identity,
                Reply::bad_request("sender does not match authenticated identity"),
            );
            return Disposition::Keep;
        }

        match envelope.kind {
            EnvelopeKind::ChatMessage => return self.route_chat(registry, identity, envelope),
            EnvelopeKind::Logout => {
                registry.unregister(identity);
                return Disposition::Close;
            }
            EnvelopeKind::GetContacts => {
                let reply = match self.directory.get_contacts(identity) {
                    Ok(data) => Reply::Accepted { data },
                    Err(e) => directory_failure(e),
                };
                self.reply(registry, identity, reply);
            }
            EnvelopeKind::AddContact => {
                let reply = match envelope.destination.as_deref() {
                    Some(other) => match self.directory.add_contact(identity, other) {
                        Ok(()) => Reply::success(),
                        Err(e) => directory_failure(e),
                    },
                    None => Reply::bad_request("add_contact requires a destination"),
                };
                self.reply(registry, identity, reply);
            }
            EnvelopeKind::RemoveContact => {
                let reply = match envelope.destination.as_deref() {
                    Some(other) => match self.directory.remove_contact(identity, other) {
                        Ok(()) => Reply::success(),
                        Err(e) => directory_failure(e),
                    },
                    None => Reply::bad_request("remove_contact requires a destination"),
                };
                self.reply(registry, identity, reply);
            }
            EnvelopeKind::DirectoryRequest => {
                let reply = match self.directory.list_identities() {
                    Ok(data) => Reply::Accepted { data },
                    Err(e) => directory_failure(e),
                };
                self.reply(registry, identity, reply);
            }
            EnvelopeKind::PublicKeyRequest => {
                let reply = match envelope.destination.as_deref() {
                    Some(of) => match self.directory.public_key(of) {
                        Ok(Some(key)) => Reply::Accepted {
                            data: vec![hex::encode(key)],
                        },
                        Ok(None) => Reply::bad_request(format!("no public key for '{of}'")),
                        Err(e) => directory_failure(e),
                    },
                    None => Reply::bad_request("public_key_request requires a destination"),
                };
                self.reply(registry, identity, reply);
            }
            // Handshake envelopes are out of state once authenticated.
            EnvelopeKind::Login | EnvelopeKind::ChallengeReply => {
                self.reply(registry, identity, Reply::bad_request("already authenticated"));
            }
        }
        Disposition::Keep
    }

    /// Forward a chat envelope verbatim, or explain to the sender why not.
    fn route_chat(
        &self,
        registry: &mut SessionRegistry,
        identity: &str,
        envelope: Envelope,
    ) -> Disposition {
        let Some(destination) = envelope.destination.clone() else {
            self.reply(
                registry,
                identity,
                Reply::bad_request("chat_message requires a destination"),
            );
            return Disposition::Keep;
        };

        let delivered = match registry.lookup(&destination) {
            Some(session) => session.send(Outbound::Forward(envelope)).is_ok(),
            None => false,
        };

        let reply = if delivered {
            if let Err(e) = self.directory.record_message(identity, &destination) {
                tracing::warn!("failed to record message: {e}");
            }
            tracing::debug!(from = %identity, to = %destination, "message forwarded");
            Reply::success()
        } else {
            // The destination's channel being gone counts as offline; the
            // dead session is swept here rather than waiting for its close
            // event.
            if registry.contains(&destination) {
                registry.unregister(&destination);
            }
            match self.directory.user_exists(&destination) {
                Ok(false) => Reply::bad_request(format!("no such user: {destination}")),
                Ok(true) => Reply::bad_request(format!("{destination} is not connected")),
                Err(e) => directory_failure(e),
            }
        };

        self.reply(registry, identity, reply);
        Disposition::Keep
    }

    fn reply(&self, registry: &SessionRegistry, identity: &str, reply: Reply) {
        let Some(session) = registry.lookup(identity) else {
            return;
        };
        if session.send(Outbound::Reply(reply)).is_err() {
            tracing::debug!(%identity, "could not deliver reply, session closing");
        }
    }
}

fn directory_failure(error: DirectoryError) -> Reply {
    match error {
        DirectoryError::Storage(e) => {
            tracing::error!("directory storage failure: {e}");
            Reply::bad_request("directory unavailable")
        }
        other => Reply::bad_request(other.to_string()),
    }
}
