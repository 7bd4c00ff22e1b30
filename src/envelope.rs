// Wire records exchanged between clients and the server

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// What a client is asking the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Announce an identity and start the authentication handshake.
    /// The payload carries the client's public key bytes (may be empty).
    Login,
    /// Answer an issued challenge. The payload carries the HMAC digest.
    ChallengeReply,
    /// Relay the payload to `destination`.
    ChatMessage,
    /// Leave the server gracefully.
    Logout,
    /// Fetch the sender's contact list.
    GetContacts,
    /// Add `destination` to the sender's contacts.
    AddContact,
    /// Remove `destination` from the sender's contacts.
    RemoveContact,
    /// Fetch every identity known to the directory.
    DirectoryRequest,
    /// Fetch the stored public key of `destination`.
    PublicKeyRequest,
}

/// A single protocol message from a client.
///
/// Envelopes are immutable once constructed; the router either forwards them
/// verbatim or discards them after producing a reply. Field names are part of
/// the wire format and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Opaque bytes, base64 on the wire so arbitrary payloads survive JSON.
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

impl Envelope {
    fn new(kind: EnvelopeKind, sender: &str, destination: Option<&str>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sender: sender.to_string(),
            destination: destination.map(str::to_string),
            payload,
            timestamp: now_timestamp(),
        }
    }

    /// Login request carrying the client's public key bytes.
    pub fn login(sender: &str, public_key: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::Login, sender, None, public_key)
    }

    /// Challenge answer carrying the client-computed digest.
    pub fn challenge_reply(sender: &str, digest: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::ChallengeReply, sender, None, digest)
    }

    /// Chat message addressed to another identity.
    pub fn chat(sender: &str, destination: &str, payload: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::ChatMessage, sender, Some(destination), payload)
    }

    pub fn logout(sender: &str) -> Self {
        Self::new(EnvelopeKind::Logout, sender, None, Vec::new())
    }

    pub fn get_contacts(sender: &str) -> Self {
        Self::new(EnvelopeKind::GetContacts, sender, None, Vec::new())
    }

    pub fn add_contact(sender: &str, other: &str) -> Self {
        Self::new(EnvelopeKind::AddContact, sender, Some(other), Vec::new())
    }

    pub fn remove_contact(sender: &str, other: &str) -> Self {
        Self::new(EnvelopeKind::RemoveContact, sender, Some(other), Vec::new())
    }

    pub fn directory_request(sender: &str) -> Self {
        Self::new(EnvelopeKind::DirectoryRequest, sender, None, Vec::new())
    }

    pub fn public_key_request(sender: &str, of: &str) -> Self {
        Self::new(EnvelopeKind::PublicKeyRequest, sender, Some(of), Vec::new())
    }
}

/// A server response to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Reply {
    /// The request was carried out.
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// The request was carried out and produced a result set.
    Accepted { data: Vec<String> },
    /// Unsolicited notice (directory changed, server shutting down).
    ServiceNotice { notice: String },
    /// The request was rejected; `reason` is human-readable.
    BadRequest { reason: String },
    /// Handshake step: prove knowledge of the shared secret over this nonce.
    Challenge {
        #[serde(with = "base64_bytes")]
        nonce: Vec<u8>,
    },
}

impl Reply {
    pub fn success() -> Self {
        Reply::Success { detail: None }
    }

    pub fn success_with(detail: &str) -> Self {
        Reply::Success {
            detail: Some(detail.to_string()),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Reply::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn notice(notice: impl Into<String>) -> Self {
        Reply::ServiceNotice {
            notice: notice.into(),
        }
    }
}

/// One frame on its way out to a client: either a direct reply or a chat
/// envelope forwarded verbatim from another session.
///
/// Serialized untagged — the two shapes are distinguished by their own tag
/// fields (`code` for replies, `kind` for envelopes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Reply(Reply),
    Forward(Envelope),
}

/// Seconds since the Unix epoch.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
