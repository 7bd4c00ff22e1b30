// Challenge-response authentication handshake

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Sha256, Sha512};
use std::time::{Duration, Instant};

use crate::config::DigestAlgorithm;

/// Nonce size in bytes for a fresh challenge.
pub const NONCE_LEN: usize = 64;

/// Why a login attempt was turned away. The message text is what the client
/// sees in the rejection reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("unknown user")]
    UnknownUser,
    #[error("identity in use")]
    IdentityInUse,
    #[error("wrong credentials")]
    WrongCredentials,
}

/// Authentication progress of one connection.
///
/// `Connected → ChallengeSent → Verified`; rejection at any step destroys the
/// connection instead of producing a state.
#[derive(Debug)]
pub enum AuthState {
    /// Socket accepted, nothing heard yet.
    Connected,
    /// Challenge issued, waiting for the digest.
    ChallengeSent(AuthChallenge),
    /// Promoted into the session registry under `identity`.
    Verified { identity: String },
}

impl AuthState {
    pub fn is_verified(&self) -> bool {
        matches!(self, AuthState::Verified { .. })
    }
}

/// An outstanding challenge: consumed by the first reply, success or failure.
#[derive(Debug)]
pub struct AuthChallenge {
    pub identity: String,
    /// Public key bytes announced at login, recorded on success.
    pub public_key: Vec<u8>,
    expected: Vec<u8>,
    issued_at: Instant,
}

impl AuthChallenge {
    /// Constant-time comparison of the client digest against the expected one.
    pub fn verify(&self, reply_digest: &[u8]) -> bool {
        if reply_digest.len() != self.expected.len() {
            return false;
        }
        reply_digest
            .iter()
            .zip(&self.expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn expired(&self, timeout: Duration) -> bool {
        self.issued_at.elapsed() >= timeout
    }
}

/// Issue a fresh challenge for `identity`. Returns the retained server-side
/// state and the nonce to send to the client.
pub fn issue_challenge(
    algorithm: DigestAlgorithm,
    identity: &str,
    public_key: Vec<u8>,
    secret: &[u8],
) -> (AuthChallenge, Vec<u8>) {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let challenge = AuthChallenge {
        identity: identity.to_string(),
        public_key,
        expected: keyed_digest(algorithm, secret, &nonce),
        issued_at: Instant::now(),
    };
    (challenge, nonce)
}

/// `HMAC_<algorithm>(secret, nonce)` — both sides of the handshake compute it.
pub fn keyed_digest(algorithm: DigestAlgorithm, secret: &[u8], nonce: &[u8]) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC key");
            mac.update(nonce);
            mac.finalize().into_bytes().to_vec()
        }
        DigestAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("HMAC key");
            mac.update(nonce);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_digest_verifies() {
        let (challenge, nonce) =
            issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"secret");

        let digest = keyed_digest(DigestAlgorithm::Sha256, b"secret", &nonce);
        assert!(challenge.verify(&digest));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (challenge, nonce) =
            issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"secret");

        let digest = keyed_digest(DigestAlgorithm::Sha256, b"not-the-secret", &nonce);
        assert!(!challenge.verify(&digest));
    }

    #[test]
    fn malformed_reply_is_rejected() {
        let (challenge, _) =
            issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"secret");

        assert!(!challenge.verify(b""));
        assert!(!challenge.verify(b"short"));
    }

    #[test]
    fn nonces_are_fresh_per_challenge() {
        let (_, first) = issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"s");
        let (_, second) = issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"s");

        assert_eq!(first.len(), NONCE_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn digest_depends_on_algorithm() {
        let nonce = [7u8; NONCE_LEN];
        let sha256 = keyed_digest(DigestAlgorithm::Sha256, b"secret", &nonce);
        let sha512 = keyed_digest(DigestAlgorithm::Sha512, b"secret", &nonce);

        assert_eq!(sha256.len(), 32);
        assert_eq!(sha512.len(), 64);
    }

    #[test]
    fn challenge_expiry() {
        let (challenge, _) =
            issue_challenge(DigestAlgorithm::Sha256, "alice", Vec::new(), b"secret");

        assert!(!challenge.expired(Duration::from_secs(60)));
        assert!(challenge.expired(Duration::ZERO));
    }
}
