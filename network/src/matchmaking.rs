// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opponent discovery over the signaling relays.
//!
//! Seeking publishes an announcement to every directory endpoint while
//! subscribing both to other seekers and to offer/answer events
//! addressed to the local identity. Relays treat the ephemeral kinds as
//! fire-and-forget, so a seeker that spots a compatible opponent
//! re-publishes its own announcement once; the opponent may have
//! joined after our original went out.
//!
//! When two seekers match each other simultaneously, the
//! lexicographically lower identity initiates: a symmetric,
//! collision-free tie-break with no extra round trip.

use crate::config::NetworkConfig;
use crate::identity::{initiates, LocalIdentity, PeerIdentity};
use crate::relay_directory::RelayEndpoint;
use crate::signaling::{
    RelayClient, SignalError, SignalEvent, SignalFilter, KIND_ANSWER, KIND_CANCEL, KIND_OFFER,
    KIND_SEEK, NAMESPACE,
};
use phalanx_core::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A compatible seeker discovered on the relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedOpponent {
    pub identity: PeerIdentity,
    pub mode: String,
    pub skill_rating: Option<u32>,
    pub announced_at_ms: u64,
    /// Whether the local side initiates the signaling exchange
    pub initiator: bool,
}

/// Events surfaced while seeking.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    MatchFound(MatchedOpponent),
    OfferReceived {
        from: PeerIdentity,
        sdp: String,
        ice_candidates: Vec<String>,
        mode: Option<String>,
        map_id: Option<String>,
    },
    AnswerReceived {
        from: PeerIdentity,
        sdp: String,
        ice_candidates: Vec<String>,
    },
    SeekCancelled {
        peer: PeerIdentity,
    },
}

/// Body of a seek announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeekBody {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    skill: Option<u32>,
}

/// Body of an offer or answer addressed to one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignalBody {
    sdp: String,
    ice: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    map: Option<String>,
}

/// Matchmaking over a set of validated relay endpoints.
pub struct Matchmaker<R: RelayClient + Clone + 'static> {
    identity: Arc<LocalIdentity>,
    relay: R,
    endpoints: Vec<RelayEndpoint>,
    events_tx: mpsc::UnboundedSender<MatchEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Opponents already reported, so re-broadcast announcements do not
    /// fire `MatchFound` twice
    seen: Arc<Mutex<HashSet<PeerIdentity>>>,
    /// Signatures already processed; the same event arrives once per
    /// subscribed endpoint
    seen_signatures: Arc<Mutex<HashSet<String>>>,
    seek_window_ms: u64,
    max_skill_delta: u32,
}

impl<R: RelayClient + Clone + 'static> Matchmaker<R> {
    /// Build a matchmaker over already-validated relay endpoints.
    /// Returns the receiving half of the event stream.
    pub fn new(
        identity: Arc<LocalIdentity>,
        relay: R,
        endpoints: Vec<RelayEndpoint>,
        config: &NetworkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MatchEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                relay,
                endpoints,
                events_tx,
                tasks: Mutex::new(Vec::new()),
                seen: Arc::new(Mutex::new(HashSet::new())),
                seen_signatures: Arc::new(Mutex::new(HashSet::new())),
                seek_window_ms: config.seek_window_ms,
                max_skill_delta: config.max_skill_delta,
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> &PeerIdentity {
        self.identity.peer_id()
    }

    /// Start seeking a game. Publishes an announcement to every
    /// endpoint and listens for compatible opponents and direct
    /// signaling until [`Matchmaker::cancel`].
    pub async fn seek(&self, mode: &str, skill_rating: Option<u32>) -> Result<(), SignalError> {
        info!(mode, ?skill_rating, "seeking opponents");
        let published = self.publish_seek(mode, skill_rating).await;
        if published == 0 {
            return Err(SignalError::Transport("seek reached no relay".into()));
        }

        for endpoint in &self.endpoints {
            self.listen_for_seekers(endpoint, mode, skill_rating).await?;
            self.listen_for_signals(endpoint).await?;
        }
        Ok(())
    }

    async fn publish_seek(&self, mode: &str, skill_rating: Option<u32>) -> usize {
        let body = match serde_json::to_value(SeekBody {
            mode: mode.to_string(),
            skill: skill_rating,
        }) {
            Ok(body) => body,
            Err(_) => return 0,
        };
        let announcement =
            SignalEvent::signed(&self.identity, KIND_SEEK, PROTOCOL_VERSION, None, body);

        let mut published = 0usize;
        for endpoint in &self.endpoints {
            match self.relay.publish(&endpoint.url, announcement.clone()).await {
                Ok(()) => published += 1,
                Err(e) => warn!(url = %endpoint.url, error = %e, "seek publish failed"),
            }
        }
        published
    }

    async fn listen_for_seekers(
        &self,
        endpoint: &RelayEndpoint,
        mode: &str,
        skill_rating: Option<u32>,
    ) -> Result<(), SignalError> {
        let sub = self
            .relay
            .subscribe(
                &endpoint.url,
                SignalFilter {
                    kinds: vec![KIND_SEEK, KIND_CANCEL],
                    namespace: Some(NAMESPACE.to_string()),
                    recipient: None,
                },
            )
            .await?;

        let identity = Arc::clone(&self.identity);
        let relay = self.relay.clone();
        let endpoint_urls: Vec<String> = self.endpoints.iter().map(|e| e.url.clone()).collect();
        let events_tx = self.events_tx.clone();
        let seen = Arc::clone(&self.seen);
        let seen_signatures = Arc::clone(&self.seen_signatures);
        let mode = mode.to_string();
        let window_ms = self.seek_window_ms;
        let max_delta = self.max_skill_delta;

        let mut rx = sub.events;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if &event.author == identity.peer_id() {
                    continue; // our own announcement echoed back
                }
                let fresh_event = seen_signatures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(event.signature.clone());
                if !fresh_event {
                    continue;
                }

                if event.kind == KIND_CANCEL {
                    if event.verify().is_ok() {
                        seen.lock().unwrap_or_else(|e| e.into_inner()).remove(&event.author);
                        if events_tx
                            .send(MatchEvent::SeekCancelled { peer: event.author.clone() })
                            .is_err()
                        {
                            break;
                        }
                    }
                    continue;
                }

                let Some(opponent) = evaluate_seeker(
                    &event,
                    identity.peer_id(),
                    &mode,
                    skill_rating,
                    window_ms,
                    max_delta,
                ) else {
                    continue;
                };

                let fresh_peer = seen
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(opponent.identity.clone());
                if !fresh_peer {
                    continue;
                }

                // The opponent may have started seeking after our
                // announcement went out; answer with a fresh one so
                // discovery is mutual.
                let body = serde_json::to_value(SeekBody {
                    mode: mode.clone(),
                    skill: skill_rating,
                })
                .unwrap_or(serde_json::Value::Null);
                let reannounce =
                    SignalEvent::signed(&identity, KIND_SEEK, PROTOCOL_VERSION, None, body);
                for url in &endpoint_urls {
                    if let Err(e) = relay.publish(url, reannounce.clone()).await {
                        debug!(url = %url, error = %e, "re-announce failed");
                    }
                }

                info!(opponent = %opponent.identity, initiator = opponent.initiator, "match found");
                if events_tx.send(MatchEvent::MatchFound(opponent)).is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
        Ok(())
    }

    async fn listen_for_signals(&self, endpoint: &RelayEndpoint) -> Result<(), SignalError> {
        let sub = self
            .relay
            .subscribe(
                &endpoint.url,
                SignalFilter {
                    kinds: vec![KIND_OFFER, KIND_ANSWER],
                    namespace: Some(NAMESPACE.to_string()),
                    recipient: Some(self.identity.peer_id().clone()),
                },
            )
            .await?;

        let events_tx = self.events_tx.clone();
        let seen_signatures = Arc::clone(&self.seen_signatures);
        let mut rx = sub.events;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let fresh = seen_signatures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(event.signature.clone());
                if !fresh {
                    continue;
                }
                if event.verify().is_err() {
                    warn!(author = %event.author, "dropping signal with bad signature");
                    continue;
                }
                if event.version != PROTOCOL_VERSION {
                    debug!(author = %event.author, version = event.version, "dropping cross-version signal");
                    continue;
                }
                let translated = match event.kind {
                    KIND_OFFER => serde_json::from_value::<SignalBody>(event.payload.clone())
                        .ok()
                        .map(|body| MatchEvent::OfferReceived {
                            from: event.author.clone(),
                            sdp: body.sdp,
                            ice_candidates: body.ice,
                            mode: body.mode,
                            map_id: body.map,
                        }),
                    KIND_ANSWER => serde_json::from_value::<SignalBody>(event.payload.clone())
                        .ok()
                        .map(|body| MatchEvent::AnswerReceived {
                            from: event.author.clone(),
                            sdp: body.sdp,
                            ice_candidates: body.ice,
                        }),
                    _ => None,
                };
                match translated {
                    Some(ev) => {
                        if events_tx.send(ev).is_err() {
                            break;
                        }
                    }
                    None => warn!(kind = event.kind, "unparseable signal payload"),
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
        Ok(())
    }

    /// Stop seeking: close every subscription, then best-effort publish
    /// a cancellation notice so other seekers drop us promptly.
    pub async fn cancel(&self) {
        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let notice = SignalEvent::signed(
            &self.identity,
            KIND_CANCEL,
            PROTOCOL_VERSION,
            None,
            serde_json::Value::Null,
        );
        for endpoint in &self.endpoints {
            if let Err(e) = self.relay.publish(&endpoint.url, notice.clone()).await {
                debug!(url = %endpoint.url, error = %e, "cancel notice publish failed");
            }
        }
        info!("seek cancelled");
    }

    /// Send an offer to a discovered opponent over every endpoint.
    pub async fn send_offer(
        &self,
        target: &PeerIdentity,
        sdp: &str,
        ice_candidates: Vec<String>,
        mode: Option<String>,
        map_id: Option<String>,
    ) -> Result<(), SignalError> {
        self.send_signal(KIND_OFFER, target, sdp, ice_candidates, mode, map_id).await
    }

    /// Send an answer back to an offering peer over every endpoint.
    pub async fn send_answer(
        &self,
        target: &PeerIdentity,
        sdp: &str,
        ice_candidates: Vec<String>,
    ) -> Result<(), SignalError> {
        self.send_signal(KIND_ANSWER, target, sdp, ice_candidates, None, None).await
    }

    async fn send_signal(
        &self,
        kind: u16,
        target: &PeerIdentity,
        sdp: &str,
        ice: Vec<String>,
        mode: Option<String>,
        map: Option<String>,
    ) -> Result<(), SignalError> {
        let body = serde_json::to_value(SignalBody { sdp: sdp.to_string(), ice, mode, map })
            .map_err(|e| SignalError::Transport(e.to_string()))?;
        let event = SignalEvent::signed(
            &self.identity,
            kind,
            PROTOCOL_VERSION,
            Some(target.clone()),
            body,
        );

        let mut published = 0usize;
        for endpoint in &self.endpoints {
            match self.relay.publish(&endpoint.url, event.clone()).await {
                Ok(()) => published += 1,
                Err(e) => warn!(url = %endpoint.url, error = %e, "signal publish failed"),
            }
        }
        if published == 0 {
            return Err(SignalError::Transport("signal reached no relay".into()));
        }
        Ok(())
    }
}

/// Apply the compatibility filters to one seek announcement.
fn evaluate_seeker(
    event: &SignalEvent,
    local: &PeerIdentity,
    mode: &str,
    local_skill: Option<u32>,
    window_ms: u64,
    max_delta: u32,
) -> Option<MatchedOpponent> {
    if &event.author == local {
        return None;
    }
    if event.namespace != NAMESPACE {
        return None;
    }
    // Cross-version play is rejected outright
    if event.version != PROTOCOL_VERSION {
        debug!(author = %event.author, version = event.version, "ignoring cross-version seeker");
        return None;
    }
    if event.age_ms() > window_ms {
        return None;
    }
    if event.verify().is_err() {
        warn!(author = %event.author, "ignoring seek with bad signature");
        return None;
    }
    let body: SeekBody = serde_json::from_value(event.payload.clone()).ok()?;
    if body.mode != mode {
        return None;
    }
    if let (Some(ours), Some(theirs)) = (local_skill, body.skill) {
        if ours.abs_diff(theirs) > max_delta {
            debug!(author = %event.author, ours, theirs, "skill gap too wide");
            return None;
        }
    }

    Some(MatchedOpponent {
        identity: event.author.clone(),
        mode: body.mode,
        skill_rating: body.skill,
        announced_at_ms: event.created_at_ms,
        initiator: initiates(local, &event.author),
    })
}
