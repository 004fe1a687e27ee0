// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ephemeral peer identity.
//!
//! Each process mints a fresh ed25519 keypair at startup; the public
//! identifier is the lowercase hex of the verifying key. Nothing is
//! ever persisted. The identity also owns the x25519 static secret used
//! for end-to-end key agreement in the relay mesh.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Public identifier of a peer: lowercase hex of its ed25519 verifying
/// key. Fixed length, so byte-wise lexicographic comparison is total
/// and strictly antisymmetric for distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a peer identity received from the wire. Accepts exactly 64
    /// lowercase hex characters (an ed25519 public key).
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IdentityError::MalformedIdentity(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Recover the verifying key for signature checks.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes: [u8; 32] = hex::decode(&self.0)
            .map_err(|_| IdentityError::MalformedIdentity(self.0.clone()))?
            .try_into()
            .map_err(|_| IdentityError::MalformedIdentity(self.0.clone()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| IdentityError::MalformedIdentity(self.0.clone()))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; the full value is 64 chars
        if self.0.len() >= 8 {
            write!(f, "{}…", &self.0[..8])
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed peer identity: {0:?}")]
    MalformedIdentity(String),
    #[error("signature verification failed")]
    BadSignature,
}

/// The local process identity: signing keypair plus the x25519 static
/// secret for mesh key agreement. Minted at process start, never
/// persisted, dropped with the process.
pub struct LocalIdentity {
    signing: SigningKey,
    exchange: x25519_dalek::StaticSecret,
    id: PeerIdentity,
}

impl LocalIdentity {
    /// Mint a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let exchange = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let id = PeerIdentity(hex::encode(signing.verifying_key().as_bytes()));
        tracing::debug!(peer = %id, "minted local identity");
        Self { signing, exchange, id }
    }

    pub fn peer_id(&self) -> &PeerIdentity {
        &self.id
    }

    /// Public half of the key-exchange pair, shared with peers.
    pub fn exchange_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.exchange)
    }

    /// Raw ECDH against a peer's exchange key.
    pub fn diffie_hellman(&self, theirs: &x25519_dalek::PublicKey) -> x25519_dalek::SharedSecret {
        self.exchange.diffie_hellman(theirs)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

/// Verify `signature` over `message` by the holder of `author`.
pub fn verify(
    author: &PeerIdentity,
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    author
        .verifying_key()?
        .verify(message, signature)
        .map_err(|_| IdentityError::BadSignature)
}

/// Initiator tie-break for two peers that matched each other: the
/// lexicographically lower identity initiates. Symmetric and
/// collision-free with no extra round trip.
pub fn initiates(local: &PeerIdentity, remote: &PeerIdentity) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_hex_and_parseable() {
        let id = LocalIdentity::generate();
        let s = id.peer_id().as_str();
        assert_eq!(s.len(), 64);
        assert_eq!(PeerIdentity::parse(s).unwrap(), *id.peer_id());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(PeerIdentity::parse("not-hex").is_err());
        assert!(PeerIdentity::parse(&"A".repeat(64)).is_err()); // uppercase
        assert!(PeerIdentity::parse(&"a".repeat(63)).is_err());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let id = LocalIdentity::generate();
        let sig = id.sign(b"seek:1v1");
        verify(id.peer_id(), b"seek:1v1", &sig).unwrap();
        assert_eq!(
            verify(id.peer_id(), b"tampered", &sig),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn tie_break_is_antisymmetric() {
        let a = LocalIdentity::generate();
        let b = LocalIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_ne!(
            initiates(a.peer_id(), b.peer_id()),
            initiates(b.peer_id(), a.peer_id())
        );
    }
}
