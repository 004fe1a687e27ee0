// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay mesh: multi-hop delivery between peers without a direct link.
//!
//! The mesh tracks directly connected peers plus everything learned
//! from "who do you know" exchanges, finds routes by breadth-first
//! search over that graph, and forwards end-to-end-encrypted payloads
//! through intermediates. Intermediates observe ciphertext and routing
//! metadata only; a missing key for a relayed destination is a hard
//! failure, never a plaintext fallback. Direct sends are exempt; no
//! intermediate observer exists.
//!
//! The peer graph and route cache are owned by the mesh alone and
//! mutated only on its own event-loop turns; route invalidation is
//! synchronous with failure detection so a stale route is never reused.

use crate::config::NetworkConfig;
use crate::crypto;
use crate::identity::{LocalIdentity, PeerIdentity};
use crate::signaling::now_ms;
use crate::transport::{ChannelState, PeerChannel};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Route discovery exhausted the known graph
    #[error("no route to peer {0}")]
    NoRoute(PeerIdentity),
    /// The first hop of the chosen route has no open channel
    #[error("first hop {0} is not connected")]
    FirstHopDown(PeerIdentity),
    /// Relayed delivery requires the destination's exchange key
    #[error("missing key material for relayed delivery to {0}")]
    MissingKeyMaterial(PeerIdentity),
    /// The channel transitioned between the state check and the send
    #[error("channel to {0} closed mid-send")]
    ChannelClosed(PeerIdentity),
    /// Bounded retries exhausted
    #[error("send to {dest} failed after {attempts} attempts")]
    SendFailed { dest: PeerIdentity, attempts: u32 },
}

/// One entry of a peer-list exchange: an identity plus its x25519
/// exchange key, so any route discovery also provisions key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: PeerIdentity,
    #[serde(rename = "exchangeKey")]
    pub exchange_key: String,
}

/// Wire messages exchanged between mesh nodes, JSON over the data
/// channel, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum MeshWire {
    RelayData {
        from: PeerIdentity,
        to: PeerIdentity,
        via: Vec<PeerIdentity>,
        payload: RelayPayload,
    },
    PeerListRequest {
        from: PeerIdentity,
        to: PeerIdentity,
    },
    PeerListResponse {
        from: PeerIdentity,
        to: PeerIdentity,
        peers: Vec<PeerEntry>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RelayPayload {
    /// Direct delivery, hex bytes
    Plain { data: String },
    /// End-to-end encrypted, hex of nonce || ciphertext
    Sealed { data: String },
}

/// Events surfaced to mesh subscribers.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Message {
        from: PeerIdentity,
        data: Vec<u8>,
        /// Whether the payload travelled through intermediates
        relayed: bool,
        /// The nodes the payload traversed, origin first
        path: Vec<PeerIdentity>,
    },
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
}

/// Per-peer delivery counters, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub delivered: u64,
    pub forwarded: u64,
    pub last_seen_ms: u64,
}

struct DirectPeer {
    channel: Arc<dyn PeerChannel>,
    /// Set right after the peer is registered; absent only during attach
    reader: Option<JoinHandle<()>>,
    stats: PeerStats,
}

impl Drop for DirectPeer {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Transitive knowledge of the network: adjacency plus exchange keys.
#[derive(Default)]
struct PeerGraph {
    edges: HashMap<PeerIdentity, HashSet<PeerIdentity>>,
    keys: HashMap<PeerIdentity, x25519_dalek::PublicKey>,
}

impl PeerGraph {
    fn add_edge(&mut self, a: &PeerIdentity, b: &PeerIdentity) {
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b.clone()).or_default().insert(a.clone());
    }

    fn remove_node(&mut self, id: &PeerIdentity) {
        self.edges.remove(id);
        for neighbors in self.edges.values_mut() {
            neighbors.remove(id);
        }
        self.keys.remove(id);
    }

    fn insert_key(&mut self, id: &PeerIdentity, key_hex: &str) {
        let Some(bytes) = hex::decode(key_hex).ok().and_then(|v| <[u8; 32]>::try_from(v).ok())
        else {
            warn!(peer = %id, "discarding malformed exchange key");
            return;
        };
        self.keys.insert(id.clone(), x25519_dalek::PublicKey::from(bytes));
    }

    /// Breadth-first search from the set of directly connected peers.
    /// Returns the hop sequence from the first intermediate (or the
    /// destination itself when direct) up to and including `dest`.
    fn bfs(&self, direct: &[PeerIdentity], dest: &PeerIdentity) -> Option<Vec<PeerIdentity>> {
        let mut visited: HashSet<PeerIdentity> = direct.iter().cloned().collect();
        let mut queue: VecDeque<Vec<PeerIdentity>> =
            direct.iter().map(|p| vec![p.clone()]).collect();

        while let Some(path) = queue.pop_front() {
            let tail = path.last().cloned()?;
            if &tail == dest {
                return Some(path);
            }
            if let Some(neighbors) = self.edges.get(&tail) {
                for next in neighbors {
                    if visited.insert(next.clone()) {
                        let mut extended = path.clone();
                        extended.push(next.clone());
                        queue.push_back(extended);
                    }
                }
            }
        }
        None
    }
}

/// The relay mesh node for the local peer.
pub struct RelayMesh {
    local: Arc<LocalIdentity>,
    peers: RwLock<HashMap<PeerIdentity, DirectPeer>>,
    graph: RwLock<PeerGraph>,
    /// Cached hop sequences per destination, dropped on any send failure
    routes: RwLock<HashMap<PeerIdentity, Vec<PeerIdentity>>>,
    /// Outstanding peer-list requests awaiting their response
    pending_lists: Mutex<HashMap<PeerIdentity, oneshot::Sender<()>>>,
    events_tx: broadcast::Sender<MeshEvent>,
    peer_list_timeout: Duration,
    send_retries: u32,
}

impl RelayMesh {
    pub fn new(local: Arc<LocalIdentity>, config: &NetworkConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            local,
            peers: RwLock::new(HashMap::new()),
            graph: RwLock::new(PeerGraph::default()),
            routes: RwLock::new(HashMap::new()),
            pending_lists: Mutex::new(HashMap::new()),
            events_tx,
            peer_list_timeout: config.peer_list_timeout(),
            send_retries: config.send_retries,
        })
    }

    pub fn local_id(&self) -> &PeerIdentity {
        self.local.peer_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    /// Attach a directly connected peer. Spawns the channel reader and
    /// immediately asks the peer who it knows, which also provisions
    /// its exchange key.
    pub async fn add_direct_peer(
        self: &Arc<Self>,
        identity: PeerIdentity,
        channel: Arc<dyn PeerChannel>,
    ) {
        let mut incoming = channel.incoming();

        // Register the peer before its reader starts so frames that were
        // buffered during signaling can already be answered over it
        self.peers.write().await.insert(
            identity.clone(),
            DirectPeer { channel, reader: None, stats: PeerStats::default() },
        );
        {
            let mut graph = self.graph.write().await;
            let local = self.local.peer_id().clone();
            graph.add_edge(&local, &identity);
        }

        let mesh = Arc::clone(self);
        let peer_id = identity.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                mesh.handle_frame(&peer_id, &frame).await;
            }
            debug!(peer = %peer_id, "channel reader finished");
            mesh.handle_disconnect(&peer_id).await;
        });
        if let Some(peer) = self.peers.write().await.get_mut(&identity) {
            peer.reader = Some(reader);
        } else {
            reader.abort();
        }
        info!(peer = %identity, "direct peer attached");
        let _ = self.events_tx.send(MeshEvent::PeerConnected(identity.clone()));

        // Learn the new peer's key and neighborhood right away
        let request = MeshWire::PeerListRequest {
            from: self.local.peer_id().clone(),
            to: identity.clone(),
        };
        if let Err(e) = self.send_wire(&identity, &request).await {
            debug!(peer = %identity, error = %e, "initial peer-list request failed");
        }
    }

    /// Detach a peer: drops its channel, removes its edges and prunes
    /// every cached route that traverses it.
    pub async fn remove_peer(&self, identity: &PeerIdentity) {
        if !self.peers.read().await.contains_key(identity) {
            return;
        }
        self.graph.write().await.remove_node(identity);
        self.routes
            .write()
            .await
            .retain(|dest, route| dest != identity && !route.contains(identity));
        info!(peer = %identity, "peer removed");
        let _ = self.events_tx.send(MeshEvent::PeerDisconnected(identity.clone()));
        // Dropped last: this aborts the peer's reader task, which may be
        // the task running this very function
        self.peers.write().await.remove(identity);
    }

    async fn handle_disconnect(&self, identity: &PeerIdentity) {
        self.remove_peer(identity).await;
    }

    /// Identities of directly connected peers.
    pub async fn direct_peers(&self) -> Vec<PeerIdentity> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_stats(&self, identity: &PeerIdentity) -> Option<PeerStats> {
        self.peers.read().await.get(identity).map(|p| p.stats.clone())
    }

    /// Cached route to `dest`, if any. Exposed for diagnostics.
    pub async fn cached_route(&self, dest: &PeerIdentity) -> Option<Vec<PeerIdentity>> {
        self.routes.read().await.get(dest).cloned()
    }

    /// Deliver `payload` to `dest`, directly when possible, otherwise
    /// through discovered intermediates. Bounded retry: each failure
    /// invalidates the cached route before the next attempt, so a
    /// retry never reuses the path that just failed.
    pub async fn send_to(&self, dest: &PeerIdentity, payload: &[u8]) -> Result<(), MeshError> {
        let mut last_err = None;
        for attempt in 0..self.send_retries {
            match self.try_send(dest, payload).await {
                Ok(()) => return Ok(()),
                // Crypto preconditions never downgrade; fail fast
                Err(MeshError::MissingKeyMaterial(peer)) => {
                    return Err(MeshError::MissingKeyMaterial(peer));
                }
                Err(e) => {
                    debug!(dest = %dest, attempt, error = %e, "send attempt failed");
                    self.invalidate_route(dest).await;
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(MeshError::NoRoute(peer)) => MeshError::NoRoute(peer),
            Some(_) | None => {
                MeshError::SendFailed { dest: dest.clone(), attempts: self.send_retries }
            }
        })
    }

    async fn try_send(&self, dest: &PeerIdentity, payload: &[u8]) -> Result<(), MeshError> {
        // Direct fast path: no intermediate observer, no sealing needed
        if self.peers.read().await.contains_key(dest) {
            let wire = MeshWire::RelayData {
                from: self.local.peer_id().clone(),
                to: dest.clone(),
                via: Vec::new(),
                payload: RelayPayload::Plain { data: hex::encode(payload) },
            };
            return self.send_wire(dest, &wire).await;
        }

        let route = match self.cached_route(dest).await {
            Some(route) => route,
            None => {
                let route = self
                    .discover_route(dest)
                    .await
                    .ok_or_else(|| MeshError::NoRoute(dest.clone()))?;
                self.routes.write().await.insert(dest.clone(), route.clone());
                debug!(dest = %dest, hops = route.len(), "route cached");
                route
            }
        };

        // End-to-end encryption is mandatory past the first hop
        let dest_key = self
            .graph
            .read()
            .await
            .keys
            .get(dest)
            .copied()
            .ok_or_else(|| MeshError::MissingKeyMaterial(dest.clone()))?;
        let key = crypto::derive_key(&self.local.diffie_hellman(&dest_key));
        let sealed = crypto::seal(&key, payload)
            .map_err(|_| MeshError::MissingKeyMaterial(dest.clone()))?;

        let first_hop = route.first().cloned().ok_or_else(|| MeshError::NoRoute(dest.clone()))?;
        let wire = MeshWire::RelayData {
            from: self.local.peer_id().clone(),
            to: dest.clone(),
            via: vec![self.local.peer_id().clone()],
            payload: RelayPayload::Sealed { data: hex::encode(sealed) },
        };
        self.send_wire(&first_hop, &wire)
            .await
            .map_err(|_| MeshError::FirstHopDown(first_hop))
    }

    /// Deliver `payload` to every directly connected peer. Returns how
    /// many sends succeeded; individual failures are logged, not fatal.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let targets = self.direct_peers().await;
        let mut delivered = 0;
        for peer in targets {
            let wire = MeshWire::RelayData {
                from: self.local.peer_id().clone(),
                to: peer.clone(),
                via: Vec::new(),
                payload: RelayPayload::Plain { data: hex::encode(payload) },
            };
            match self.send_wire(&peer, &wire).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %peer, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    /// Serialize and send one wire message to a direct peer, checking
    /// the channel state immediately before the send. A state change
    /// between check and send surfaces as [`MeshError::ChannelClosed`].
    async fn send_wire(&self, peer: &PeerIdentity, wire: &MeshWire) -> Result<(), MeshError> {
        let peers = self.peers.read().await;
        let direct = peers.get(peer).ok_or_else(|| MeshError::FirstHopDown(peer.clone()))?;
        if direct.channel.state() != ChannelState::Open {
            return Err(MeshError::ChannelClosed(peer.clone()));
        }
        let bytes = serde_json::to_vec(wire)
            .map_err(|_| MeshError::ChannelClosed(peer.clone()))?;
        direct
            .channel
            .send(&bytes)
            .await
            .map_err(|_| MeshError::ChannelClosed(peer.clone()))
    }

    /// Drop the cached route for `dest`. Called synchronously with
    /// failure detection.
    async fn invalidate_route(&self, dest: &PeerIdentity) {
        if self.routes.write().await.remove(dest).is_some() {
            debug!(dest = %dest, "route invalidated");
        }
    }

    /// Breadth-first route discovery. When the known graph does not
    /// reach `dest`, issue bounded peer-list requests hop by hop,
    /// nearest unqueried peers first, merging each response into the
    /// graph until the destination appears or the frontier is
    /// exhausted.
    async fn discover_route(&self, dest: &PeerIdentity) -> Option<Vec<PeerIdentity>> {
        let mut queried: HashSet<PeerIdentity> = HashSet::new();
        loop {
            let direct = self.direct_peers().await;
            {
                let graph = self.graph.read().await;
                if let Some(path) = graph.bfs(&direct, dest) {
                    return Some(path);
                }
            }

            let candidate = self.next_unqueried(&direct, &queried).await?;
            queried.insert(candidate.clone());
            debug!(dest = %dest, asking = %candidate, "expanding peer graph");
            self.request_peer_list(&candidate).await;
        }
    }

    /// Nearest reachable peer whose peer list we have not fetched yet,
    /// in BFS order from the direct set.
    async fn next_unqueried(
        &self,
        direct: &[PeerIdentity],
        queried: &HashSet<PeerIdentity>,
    ) -> Option<PeerIdentity> {
        let graph = self.graph.read().await;
        let mut visited: HashSet<PeerIdentity> = direct.iter().cloned().collect();
        let mut queue: VecDeque<PeerIdentity> = direct.iter().cloned().collect();
        while let Some(peer) = queue.pop_front() {
            if !queried.contains(&peer) {
                return Some(peer);
            }
            if let Some(neighbors) = graph.edges.get(&peer) {
                for next in neighbors {
                    if next != self.local.peer_id() && visited.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        None
    }

    /// Fire a peer-list request at `target` and wait (bounded) for its
    /// response to be merged by the reader task.
    async fn request_peer_list(&self, target: &PeerIdentity) {
        let (tx, rx) = oneshot::channel();
        self.pending_lists.lock().await.insert(target.clone(), tx);

        let request = MeshWire::PeerListRequest {
            from: self.local.peer_id().clone(),
            to: target.clone(),
        };
        let hop = if self.peers.read().await.contains_key(target) {
            Some(target.clone())
        } else {
            let direct = self.direct_peers().await;
            self.graph
                .read()
                .await
                .bfs(&direct, target)
                .and_then(|path| path.first().cloned())
        };
        match hop {
            Some(hop) => {
                if let Err(e) = self.send_wire(&hop, &request).await {
                    debug!(target = %target, error = %e, "peer-list request failed");
                }
            }
            None => debug!(target = %target, "peer-list request has no path"),
        }

        if tokio::time::timeout(self.peer_list_timeout, rx).await.is_err() {
            debug!(target = %target, "peer-list request timed out");
        }
        self.pending_lists.lock().await.remove(target);
    }

    async fn handle_frame(&self, sender: &PeerIdentity, frame: &[u8]) {
        let wire: MeshWire = match serde_json::from_slice(frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(peer = %sender, error = %e, "undecodable mesh frame dropped");
                return;
            }
        };
        if let Some(peer) = self.peers.write().await.get_mut(sender) {
            peer.stats.last_seen_ms = now_ms();
        }

        match wire {
            MeshWire::RelayData { from, to, via, payload } => {
                if &to == self.local.peer_id() {
                    self.deliver(sender, from, via, payload).await;
                } else {
                    self.forward(sender, from, to, via, payload).await;
                }
            }
            MeshWire::PeerListRequest { from, to } => {
                if &to == self.local.peer_id() {
                    self.answer_peer_list(&from).await;
                } else {
                    self.forward_wire(&to, MeshWire::PeerListRequest { from, to: to.clone() })
                        .await;
                }
            }
            MeshWire::PeerListResponse { from, to, peers } => {
                if &to == self.local.peer_id() {
                    self.merge_peer_list(&from, peers).await;
                } else {
                    self.forward_wire(
                        &to,
                        MeshWire::PeerListResponse { from, to: to.clone(), peers },
                    )
                    .await;
                }
            }
        }
    }

    async fn deliver(
        &self,
        sender: &PeerIdentity,
        from: PeerIdentity,
        via: Vec<PeerIdentity>,
        payload: RelayPayload,
    ) {
        let data = match payload {
            RelayPayload::Plain { data } => match hex::decode(&data) {
                Ok(bytes) => bytes,
                Err(_) => {
                    warn!(from = %from, "undecodable plain payload dropped");
                    return;
                }
            },
            RelayPayload::Sealed { data } => {
                let Some(origin_key) = self.graph.read().await.keys.get(&from).copied() else {
                    warn!(from = %from, "sealed payload from peer with no key material");
                    return;
                };
                let key = crypto::derive_key(&self.local.diffie_hellman(&origin_key));
                let Ok(sealed) = hex::decode(&data) else {
                    warn!(from = %from, "undecodable sealed payload dropped");
                    return;
                };
                match crypto::open(&key, &sealed) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(from = %from, error = %e, "sealed payload failed to open");
                        return;
                    }
                }
            }
        };

        if let Some(peer) = self.peers.write().await.get_mut(sender) {
            peer.stats.delivered += 1;
        }
        let relayed = !via.is_empty();
        debug!(from = %from, relayed, "payload delivered");
        let _ = self.events_tx.send(MeshEvent::Message { from, data, relayed, path: via });
    }

    /// Pass a relay payload along toward its destination, appending the
    /// local node to the traversal record.
    async fn forward(
        &self,
        sender: &PeerIdentity,
        from: PeerIdentity,
        to: PeerIdentity,
        mut via: Vec<PeerIdentity>,
        payload: RelayPayload,
    ) {
        if via.contains(self.local.peer_id()) {
            warn!(from = %from, to = %to, "routing loop detected, dropping");
            return;
        }
        via.push(self.local.peer_id().clone());
        if let Some(peer) = self.peers.write().await.get_mut(sender) {
            peer.stats.forwarded += 1;
        }
        self.forward_wire(&to, MeshWire::RelayData { from, to: to.clone(), via, payload }).await;
    }

    /// Send a wire message toward `to` via the best known next hop.
    async fn forward_wire(&self, to: &PeerIdentity, wire: MeshWire) {
        let hop = if self.peers.read().await.contains_key(to) {
            Some(to.clone())
        } else {
            let direct = self.direct_peers().await;
            self.graph.read().await.bfs(&direct, to).and_then(|path| path.first().cloned())
        };
        match hop {
            Some(hop) => {
                if let Err(e) = self.send_wire(&hop, &wire).await {
                    warn!(to = %to, hop = %hop, error = %e, "forward failed");
                }
            }
            None => warn!(to = %to, "no next hop, dropping"),
        }
    }

    /// Answer a peer-list request with ourselves plus our direct peers
    /// (keys included where known).
    async fn answer_peer_list(&self, requester: &PeerIdentity) {
        let mut entries = vec![PeerEntry {
            id: self.local.peer_id().clone(),
            exchange_key: hex::encode(self.local.exchange_public().as_bytes()),
        }];
        {
            let graph = self.graph.read().await;
            for peer in self.peers.read().await.keys() {
                if peer == requester {
                    continue;
                }
                if let Some(key) = graph.keys.get(peer) {
                    entries.push(PeerEntry {
                        id: peer.clone(),
                        exchange_key: hex::encode(key.as_bytes()),
                    });
                }
            }
        }
        debug!(requester = %requester, peers = entries.len(), "answering peer-list request");
        let response = MeshWire::PeerListResponse {
            from: self.local.peer_id().clone(),
            to: requester.clone(),
            peers: entries,
        };
        self.forward_wire(requester, response).await;
    }

    /// Merge a peer-list response: keys for every entry, plus an edge
    /// from the responder to each of its listed neighbors.
    async fn merge_peer_list(&self, responder: &PeerIdentity, peers: Vec<PeerEntry>) {
        {
            let mut graph = self.graph.write().await;
            for entry in &peers {
                graph.insert_key(&entry.id, &entry.exchange_key);
                if &entry.id != responder {
                    graph.add_edge(responder, &entry.id);
                }
            }
        }
        debug!(responder = %responder, entries = peers.len(), "peer list merged");
        if let Some(tx) = self.pending_lists.lock().await.remove(responder) {
            let _ = tx.send(());
        }
    }
}
