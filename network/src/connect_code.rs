// SPDX-License-Identifier: MIT OR Apache-2.0

//! Copy-pasteable connection codes.
//!
//! A finalized offer or answer (SDP plus gathered ICE candidates) is
//! serialized to compact JSON, deflated, and spelled out in a 32-symbol
//! alphabet chosen to survive manual transcription: no `0`/`O` and no
//! `1`/`I` (the alphabet is uppercase-only, so `L` stays unambiguous).
//! Symbols are grouped into dash-separated chunks of four behind a
//! product prefix:
//!
//! ```text
//! PHX-Q2M4-8FJA-WZP3-...
//! ```
//!
//! Codes expire five minutes after creation; a text code has no trickle
//! channel, so ICE gathering happens up front behind a bounded wait and
//! a partial candidate list is accepted.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::signaling::now_ms;

/// Code format version. Decoders reject anything else.
pub const CODE_VERSION: u16 = 1;

/// Maximum age of a code at decode time, in milliseconds.
pub const CODE_TTL_MS: u64 = 300_000;

/// Product prefix on every connection code.
pub const CODE_PREFIX: &str = "PHX";

/// 32 transcription-safe symbols: uppercase letters minus `I`/`O`,
/// digits minus `0`/`1`.
const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Symbols per dash-separated group.
const GROUP_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Not a connection code, or damaged in transcription
    #[error("malformed connection code: {0}")]
    Malformed(String),
    /// An offer was pasted where an answer was expected, or vice versa
    #[error("wrong code role: expected {expected:?}, got {found:?}")]
    WrongRole { expected: CodeRole, found: CodeRole },
    /// The code outlived its five-minute window
    #[error("connection code expired {age_ms} ms after creation; ask for a fresh one")]
    Expired { age_ms: u64 },
    /// The code was produced by an incompatible client version
    #[error("unsupported connection code version {version}")]
    UnsupportedVersion { version: u16 },
}

/// Which side of the exchange produced a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeRole {
    Offer,
    Answer,
}

/// Optional match parameters carried in an offer code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeOptions {
    pub mode: Option<String>,
    pub map_id: Option<String>,
}

/// Decoded contents of a connection code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCodeData {
    pub version: u16,
    pub sdp: String,
    pub ice_candidates: Vec<String>,
    pub created_at_ms: u64,
    pub role: CodeRole,
    pub mode: Option<String>,
    pub map_id: Option<String>,
}

/// Compact wire form inside the code.
#[derive(Debug, Serialize, Deserialize)]
struct WirePayload {
    v: u16,
    sdp: String,
    ice: Vec<String>,
    ts: u64,
    #[serde(rename = "type")]
    role: CodeRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    map: Option<String>,
}

/// Encode a finalized local offer into a code.
pub fn encode_offer(
    sdp: &str,
    ice_candidates: Vec<String>,
    options: CodeOptions,
) -> Result<String, CodeError> {
    encode_data(&ConnectionCodeData {
        version: CODE_VERSION,
        sdp: sdp.to_string(),
        ice_candidates,
        created_at_ms: now_ms(),
        role: CodeRole::Offer,
        mode: options.mode,
        map_id: options.map_id,
    })
}

/// Encode a finalized local answer into a code.
pub fn encode_answer_data(sdp: &str, ice_candidates: Vec<String>) -> Result<String, CodeError> {
    encode_data(&ConnectionCodeData {
        version: CODE_VERSION,
        sdp: sdp.to_string(),
        ice_candidates,
        created_at_ms: now_ms(),
        role: CodeRole::Answer,
        mode: None,
        map_id: None,
    })
}

/// Encode arbitrary code data. Exposed so callers controlling the
/// timestamp (tests, replays) can build codes directly.
pub fn encode_data(data: &ConnectionCodeData) -> Result<String, CodeError> {
    let wire = WirePayload {
        v: data.version,
        sdp: data.sdp.clone(),
        ice: data.ice_candidates.clone(),
        ts: data.created_at_ms,
        role: data.role,
        mode: data.mode.clone(),
        map: data.map_id.clone(),
    };
    let json = serde_json::to_vec(&wire)
        .map_err(|e| CodeError::Malformed(format!("serialize: {e}")))?;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| {
            let symbols = base32_encode(&compressed);
            group(&symbols)
        })
        .map_err(|e| CodeError::Malformed(format!("compress: {e}")))
}

/// Decode and validate a code, enforcing shape, version, expiry and
/// role, in that order.
pub fn decode(code: &str, expected: CodeRole) -> Result<ConnectionCodeData, CodeError> {
    let data = decode_any(code)?;
    if data.role != expected {
        return Err(CodeError::WrongRole { expected, found: data.role });
    }
    Ok(data)
}

/// Decode a code without asserting its role.
pub fn decode_any(code: &str) -> Result<ConnectionCodeData, CodeError> {
    let symbols = ungroup(code)?;
    let compressed = base32_decode(&symbols)?;

    let mut json = Vec::new();
    DeflateDecoder::new(&compressed[..])
        .read_to_end(&mut json)
        .map_err(|e| CodeError::Malformed(format!("decompress: {e}")))?;
    let wire: WirePayload = serde_json::from_slice(&json)
        .map_err(|e| CodeError::Malformed(format!("payload: {e}")))?;

    if wire.v != CODE_VERSION {
        return Err(CodeError::UnsupportedVersion { version: wire.v });
    }
    check_age(wire.ts, now_ms())?;

    Ok(ConnectionCodeData {
        version: wire.v,
        sdp: wire.sdp,
        ice_candidates: wire.ice,
        created_at_ms: wire.ts,
        role: wire.role,
        mode: wire.mode,
        map_id: wire.map,
    })
}

/// Age validation, separated so the boundary is testable without a
/// clock. A code aged exactly [`CODE_TTL_MS`] still decodes.
fn check_age(created_at_ms: u64, now_ms: u64) -> Result<(), CodeError> {
    let age_ms = now_ms.saturating_sub(created_at_ms);
    if age_ms > CODE_TTL_MS {
        return Err(CodeError::Expired { age_ms });
    }
    Ok(())
}

fn group(symbols: &str) -> String {
    let mut out = String::with_capacity(symbols.len() + symbols.len() / GROUP_LEN + 4);
    out.push_str(CODE_PREFIX);
    for chunk in symbols.as_bytes().chunks(GROUP_LEN) {
        out.push('-');
        // ALPHABET is pure ASCII, chunks stay valid UTF-8
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
    }
    out
}

fn ungroup(code: &str) -> Result<String, CodeError> {
    let trimmed = code.trim();
    let rest = trimmed
        .strip_prefix(CODE_PREFIX)
        .and_then(|r| r.strip_prefix('-'))
        .ok_or_else(|| CodeError::Malformed(format!("missing {CODE_PREFIX} prefix")))?;
    let symbols: String = rest.chars().filter(|c| *c != '-').collect();
    if symbols.is_empty() {
        return Err(CodeError::Malformed("empty code body".into()));
    }
    Ok(symbols)
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(symbols: &str) -> Result<Vec<u8>, CodeError> {
    let mut out = Vec::with_capacity(symbols.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for c in symbols.chars() {
        let value = ALPHABET
            .iter()
            .position(|&a| a as char == c)
            .ok_or_else(|| CodeError::Malformed(format!("invalid symbol {c:?}")))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    // Trailing <8 bits are padding from encoding and must be zero
    if bits > 0 && (buffer & ((1 << bits) - 1)) != 0 {
        return Err(CodeError::Malformed("nonzero padding bits".into()));
    }
    Ok(out)
}

/// Errors from the offer/answer exchange around the codec.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Code(#[from] CodeError),
    #[error("sdp endpoint failure: {0}")]
    Endpoint(String),
}

/// Local WebRTC-style negotiation surface supplied by the embedding
/// application. Candidate gathering is push-based; the stream closes
/// when the endpoint has finished gathering.
#[async_trait::async_trait]
pub trait SdpEndpoint: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<String>;
    async fn create_answer(&self, remote_offer: &str) -> anyhow::Result<String>;
    async fn accept_answer(&self, remote_answer: &str) -> anyhow::Result<()>;
    /// Take the candidate stream for the current negotiation.
    fn candidates(&self) -> mpsc::UnboundedReceiver<String>;
}

/// Handle returned with a local offer code, consumed when the matching
/// answer code arrives.
#[derive(Debug)]
pub struct OfferHandle {
    pub options: CodeOptions,
    pub offered_at_ms: u64,
}

/// Drives the offer/answer code exchange against an [`SdpEndpoint`].
pub struct CodeExchange<E: SdpEndpoint> {
    endpoint: E,
    gather_timeout: Duration,
}

impl<E: SdpEndpoint> CodeExchange<E> {
    pub fn new(endpoint: E, gather_timeout: Duration) -> Self {
        Self { endpoint, gather_timeout }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Create a local offer, gather candidates within the bounded
    /// window, and encode the result.
    pub async fn offer(&self, options: CodeOptions) -> Result<(String, OfferHandle), NegotiationError> {
        let sdp = self
            .endpoint
            .create_offer()
            .await
            .map_err(|e| NegotiationError::Endpoint(e.to_string()))?;
        let ice = self.gather_candidates().await;
        tracing::debug!(candidates = ice.len(), "offer finalized");

        let code = encode_offer(&sdp, ice, options.clone())?;
        Ok((code, OfferHandle { options, offered_at_ms: now_ms() }))
    }

    /// Decode a pasted offer code, produce the local answer, and encode
    /// it. Returns the answer code plus the decoded offer for the
    /// caller's match setup (mode, map).
    pub async fn answer(
        &self,
        offer_code: &str,
    ) -> Result<(String, ConnectionCodeData), NegotiationError> {
        let offer = decode(offer_code, CodeRole::Offer)?;
        let sdp = self
            .endpoint
            .create_answer(&offer.sdp)
            .await
            .map_err(|e| NegotiationError::Endpoint(e.to_string()))?;
        let ice = self.gather_candidates().await;
        tracing::debug!(candidates = ice.len(), "answer finalized");

        let code = encode_answer_data(&sdp, ice)?;
        Ok((code, offer))
    }

    /// Apply a pasted answer code to the outstanding offer.
    pub async fn complete(
        &self,
        handle: OfferHandle,
        answer_code: &str,
    ) -> Result<ConnectionCodeData, NegotiationError> {
        let answer = decode(answer_code, CodeRole::Answer)?;
        self.endpoint
            .accept_answer(&answer.sdp)
            .await
            .map_err(|e| NegotiationError::Endpoint(e.to_string()))?;
        tracing::debug!(mode = ?handle.options.mode, "offer completed");
        Ok(answer)
    }

    /// Collect candidates until the endpoint finishes or the bounded
    /// window closes. A partial list is accepted: without a trickle
    /// channel gathering must terminate deterministically.
    async fn gather_candidates(&self) -> Vec<String> {
        let mut rx = self.endpoint.candidates();
        let deadline = Instant::now() + self.gather_timeout;
        let mut candidates = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        gathered = candidates.len(),
                        "ice gathering window closed with partial list"
                    );
                    break;
                }
            }
        }
        candidates
    }
}

/// Human lobby join code: six symbols, no expiry, used only for lobby
/// discovery. The alphabet is distinct from connection codes and avoids
/// vowels so codes never spell words.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinCode(String);

const JOIN_ALPHABET: &[u8] = b"BCDFGHJKMNPQRSTVWXZ2345679";
const JOIN_LEN: usize = 6;

impl JoinCode {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let code: String = (0..JOIN_LEN)
            .map(|_| JOIN_ALPHABET[rng.gen_range(0..JOIN_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn parse(s: &str) -> Result<Self, CodeError> {
        let upper = s.trim().to_ascii_uppercase();
        if upper.len() != JOIN_LEN || !upper.bytes().all(|b| JOIN_ALPHABET.contains(&b)) {
            return Err(CodeError::Malformed(format!("invalid join code {s:?}")));
        }
        Ok(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JoinCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
