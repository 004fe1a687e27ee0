// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end payload encryption for relayed traffic.
//!
//! The two endpoints of a multi-hop route agree on a key via x25519;
//! the payload is sealed with AES-256-GCM before the first hop, so
//! intermediates only ever observe ciphertext plus routing metadata.
//! Key derivation folds a domain label into SHA-256 so mesh keys can
//! never collide with keys derived for another purpose.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain label folded into every mesh key derivation.
const KDF_LABEL: &[u8] = b"phalanx-mesh-v1";

/// AES-GCM nonce length in bytes, prepended to every sealed payload.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("payload encryption failed")]
    SealFailed,
    /// Wrong key, tampered ciphertext, or truncated payload
    #[error("payload decryption failed")]
    OpenFailed,
    #[error("sealed payload too short ({0} bytes)")]
    Truncated(usize),
}

/// Derive the symmetric key both endpoints arrive at independently.
pub fn derive_key(shared: &x25519_dalek::SharedSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_LABEL);
    hasher.update(shared.as_bytes());
    hasher.finalize().into()
}

/// Encrypt and authenticate `plaintext`. Output is `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse of [`seal`]. Fails on any key mismatch or tampering.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}
