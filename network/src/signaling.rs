// SPDX-License-Identifier: MIT OR Apache-2.0

//! Out-of-band signaling over public publish/subscribe relays.
//!
//! Matchmaking traffic rides short-lived events in a reserved ephemeral
//! kind range, tagged with the application namespace and protocol
//! version; offers and answers are additionally tagged with the
//! recipient identity. Events are signed by their author so a relay
//! cannot forge announcements.
//!
//! The actual relay protocol lives behind [`RelayClient`]; the bundled
//! [`MemoryRelay`] backs tests and local play.

use crate::identity::{self, LocalIdentity, PeerIdentity};
use async_trait::async_trait;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

/// Reserved ephemeral event kinds. Relays treat this range as
/// fire-and-forget: events are fanned out to live subscribers and never
/// stored.
pub const KIND_SEEK: u16 = 20420;
pub const KIND_OFFER: u16 = 20421;
pub const KIND_ANSWER: u16 = 20422;
pub const KIND_CANCEL: u16 = 20423;

/// Application namespace tag carried on every signaling event.
pub const NAMESPACE: &str = "phalanx";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("relay transport failure: {0}")]
    Transport(String),
    #[error("relay subscription closed")]
    Closed,
    #[error("event signature invalid")]
    BadSignature,
}

/// One signaling event as published to a relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub kind: u16,
    pub namespace: String,
    /// Lockstep protocol version of the author
    pub version: u16,
    pub author: PeerIdentity,
    /// Present on offer/answer events; relays may use it for routing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PeerIdentity>,
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    pub payload: serde_json::Value,
    /// hex ed25519 signature over the canonical signing bytes
    pub signature: String,
}

impl SignalEvent {
    /// Build and sign an event from the local identity.
    pub fn signed(
        local: &LocalIdentity,
        kind: u16,
        version: u16,
        recipient: Option<PeerIdentity>,
        payload: serde_json::Value,
    ) -> Self {
        let created_at_ms = now_ms();
        let mut event = Self {
            kind,
            namespace: NAMESPACE.to_string(),
            version,
            author: local.peer_id().clone(),
            recipient,
            created_at_ms,
            payload,
            signature: String::new(),
        };
        let sig = local.sign(&event.signing_bytes());
        event.signature = hex::encode(sig.to_bytes());
        event
    }

    /// Canonical bytes covered by the signature. Field order is fixed;
    /// the payload is folded in via its compact JSON form.
    fn signing_bytes(&self) -> Vec<u8> {
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.kind,
            self.namespace,
            self.version,
            self.author.as_str(),
            self.recipient.as_ref().map(|r| r.as_str()).unwrap_or(""),
            self.created_at_ms,
            payload,
        )
        .into_bytes()
    }

    /// Verify the author's signature.
    pub fn verify(&self) -> Result<(), SignalError> {
        let bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(SignalError::BadSignature)?;
        let sig = Signature::from_bytes(&bytes);
        identity::verify(&self.author, &self.signing_bytes(), &sig)
            .map_err(|_| SignalError::BadSignature)
    }

    /// Age relative to the local clock; zero when the clock runs behind
    /// the author's.
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.created_at_ms)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Server-side filter for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    /// Match any of these kinds; empty matches all
    pub kinds: Vec<u16>,
    pub namespace: Option<String>,
    /// Only events addressed to this identity
    pub recipient: Option<PeerIdentity>,
}

impl SignalFilter {
    pub fn matches(&self, event: &SignalEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if &event.namespace != ns {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if event.recipient.as_ref() != Some(recipient) {
                return false;
            }
        }
        true
    }
}

/// Live subscription to one relay. Dropping the receiver (or calling
/// [`Subscription::close`]) ends delivery.
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<SignalEvent>,
    id: u64,
    closer: Arc<dyn Fn(u64) + Send + Sync>,
}

impl Subscription {
    pub fn close(&self) {
        (self.closer)(self.id);
    }
}

/// Transport to one class of publish/subscribe relays.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Publish an event to one relay endpoint.
    async fn publish(&self, endpoint: &str, event: SignalEvent) -> Result<(), SignalError>;

    /// Subscribe to events matching `filter` on one relay endpoint.
    async fn subscribe(
        &self,
        endpoint: &str,
        filter: SignalFilter,
    ) -> Result<Subscription, SignalError>;
}

struct MemorySubscription {
    filter: SignalFilter,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

/// In-process relay hub. Every publish fans out to all matching
/// subscriptions on the same endpoint, including the author's own,
/// mirroring real relays, which echo your events back to you.
#[derive(Default)]
pub struct MemoryRelay {
    subs: Mutex<HashMap<String, HashMap<u64, MemorySubscription>>>,
    next_id: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn remove(&self, id: u64) {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        for endpoint_subs in subs.values_mut() {
            endpoint_subs.remove(&id);
        }
    }
}

#[async_trait]
impl RelayClient for Arc<MemoryRelay> {
    async fn publish(&self, endpoint: &str, event: SignalEvent) -> Result<(), SignalError> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoint_subs) = subs.get_mut(endpoint) {
            endpoint_subs.retain(|_, sub| {
                if !sub.filter.matches(&event) {
                    return true;
                }
                // Drop subscriptions whose receiver has gone away
                sub.tx.send(event.clone()).is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        endpoint: &str,
        filter: SignalFilter,
    ) -> Result<Subscription, SignalError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(endpoint.to_string())
            .or_default()
            .insert(id, MemorySubscription { filter, tx });

        let hub = Arc::clone(self);
        Ok(Subscription {
            events: rx,
            id,
            closer: Arc::new(move |sub_id| hub.remove(sub_id)),
        })
    }
}
