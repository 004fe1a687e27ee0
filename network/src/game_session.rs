// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lockstep session driver.
//!
//! Binds the command protocol to one peer channel: outgoing commands
//! get deterministic IDs and land in the command log, incoming
//! envelopes are sequence-checked and surfaced as typed events. The
//! session is oblivious to whether the channel underneath is a direct
//! link or a relay route.

use crate::config::NetworkConfig;
use crate::transport::{ChannelState, PeerChannel, TransportError};
use phalanx_core::{
    CommandIdGenerator, CommandKind, CommandLog, ConnectionState, ConnectionTracker, DesyncReport,
    GameCommand, GameMessage, LockstepError, MessagePayload, PlayerId, SequenceTracker,
    StateChecksum, Tick,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Lockstep(#[from] LockstepError),
    #[error("message serialization failed: {0}")]
    Serialize(String),
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),
}

/// Orders issued by the local player, before ID assignment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub entity_ids: Vec<u64>,
    pub data: serde_json::Value,
}

/// Events surfaced to the simulation layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Validated remote commands for one tick, in arrival order
    CommandsReceived { tick: Tick, commands: Vec<GameCommand> },
    /// The peer's checksum for a tick arrived (match or not)
    PeerChecksum(StateChecksum),
    /// Checksums for a tick disagree; the consumer decides what to do
    DesyncDetected(DesyncReport),
    /// A reconnection replay finished
    SyncCompleted { current_tick: Tick, replayed_ticks: usize },
    ChatReceived { from: PlayerId, text: String },
    Paused { by: PlayerId, reason: Option<String> },
    Resumed { by: PlayerId },
    Forfeited { by: PlayerId },
    PongReceived { latency_ms: u64 },
}

/// One lockstep session with one peer.
pub struct GameSession {
    local: PlayerId,
    channel: Arc<dyn PeerChannel>,
    tracker: Mutex<ConnectionTracker>,
    generator: Mutex<CommandIdGenerator>,
    log: Mutex<CommandLog>,
    sequences: Mutex<SequenceTracker>,
    next_seq: AtomicU64,
    last_acked_seq: AtomicU64,
    local_checksums: Mutex<BTreeMap<Tick, StateChecksum>>,
    remote_checksums: Mutex<BTreeMap<Tick, StateChecksum>>,
    pending_pings: Mutex<HashMap<u64, Instant>>,
    events_tx: broadcast::Sender<SessionEvent>,
    checksum_interval: u64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GameSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
    }
}

impl GameSession {
    /// Create a session over an established channel and start its
    /// reader. The command-ID generator lives inside the session, one
    /// per match.
    pub fn new(local: PlayerId, channel: Arc<dyn PeerChannel>, config: &NetworkConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let mut incoming = channel.incoming();

        let session = Arc::new(GameSession {
            local,
            channel,
            tracker: Mutex::new(ConnectionTracker::new()),
            generator: Mutex::new(CommandIdGenerator::new()),
            log: Mutex::new(CommandLog::new()),
            sequences: Mutex::new(SequenceTracker::new()),
            next_seq: AtomicU64::new(0),
            last_acked_seq: AtomicU64::new(0),
            local_checksums: Mutex::new(BTreeMap::new()),
            remote_checksums: Mutex::new(BTreeMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            events_tx,
            checksum_interval: config.checksum_interval_ticks.max(1),
            reader: Mutex::new(None),
        });

        // The reader holds only a weak handle so dropping the session
        // ends it
        let weak = Arc::downgrade(&session);
        let reader = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_frame(&frame).await;
            }
        });
        *session.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);
        session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    /// Tick sequence the peer has acknowledged up to.
    pub fn last_acked_sequence(&self) -> u64 {
        self.last_acked_seq.load(Ordering::Relaxed)
    }

    /// Drive the state machine to `connected`, waiting (bounded) for
    /// the underlying channel to open.
    pub async fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        self.transition(ConnectionState::Connecting)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.channel.state() {
                ChannelState::Open => break,
                ChannelState::Closed | ChannelState::Closing => {
                    self.transition(ConnectionState::Failed)?;
                    return Err(SessionError::Transport(TransportError::NotOpen(
                        self.channel.state(),
                    )));
                }
                ChannelState::Connecting => {
                    if Instant::now() >= deadline {
                        self.transition(ConnectionState::Failed)?;
                        return Err(SessionError::ConnectTimeout(timeout));
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
        self.transition(ConnectionState::Connected)?;
        Ok(())
    }

    fn transition(&self, next: ConnectionState) -> Result<(), SessionError> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transition(next)?;
        let _ = self.events_tx.send(SessionEvent::StateChanged(next));
        Ok(())
    }

    /// Issue local commands for `tick`: assign deterministic IDs, log
    /// them, and ship them to the peer as one input batch.
    pub async fn send_commands(
        &self,
        tick: Tick,
        specs: Vec<CommandSpec>,
    ) -> Result<Vec<GameCommand>, SessionError> {
        let commands: Vec<GameCommand> = {
            let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
            specs
                .into_iter()
                .map(|spec| {
                    generator.issue(spec.kind, &self.local, tick, spec.entity_ids, spec.data)
                })
                .collect()
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(tick, commands.clone());

        self.send_payload(tick, MessagePayload::Input { commands: commands.clone() }).await?;
        Ok(commands)
    }

    /// Record the local simulation checksum for a tick. At the
    /// configured cadence it is shipped to the peer; either side
    /// reports the mismatch when the other half is already present.
    pub async fn submit_checksum(&self, checksum: StateChecksum) -> Result<(), SessionError> {
        let tick = checksum.tick;
        let remote = {
            let mut local = self.local_checksums.lock().unwrap_or_else(|e| e.into_inner());
            local.insert(tick, checksum.clone());
            prune_old(&mut local, tick);
            self.remote_checksums
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&tick)
                .cloned()
        };

        if let Some(remote) = remote {
            self.report_if_diverged(&checksum, &remote).await?;
        }
        if tick % self.checksum_interval == 0 {
            self.send_payload(tick, MessagePayload::Checksum(checksum)).await?;
        }
        Ok(())
    }

    /// Ask the peer to replay everything after our last known tick.
    pub async fn request_resync(&self, last_tick: Tick) -> Result<(), SessionError> {
        self.transition(ConnectionState::Reconnecting)?;
        self.send_payload(last_tick, MessagePayload::SyncRequest { last_tick }).await
    }

    pub async fn send_chat(&self, text: String) -> Result<(), SessionError> {
        let tick = self.log.lock().unwrap_or_else(|e| e.into_inner()).current_tick();
        self.send_payload(tick, MessagePayload::Chat { text }).await
    }

    pub async fn pause(&self, reason: Option<String>) -> Result<(), SessionError> {
        let tick = self.log.lock().unwrap_or_else(|e| e.into_inner()).current_tick();
        self.send_payload(tick, MessagePayload::Pause { reason }).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        let tick = self.log.lock().unwrap_or_else(|e| e.into_inner()).current_tick();
        self.send_payload(tick, MessagePayload::Resume).await
    }

    pub async fn forfeit(&self) -> Result<(), SessionError> {
        let tick = self.log.lock().unwrap_or_else(|e| e.into_inner()).current_tick();
        self.send_payload(tick, MessagePayload::Forfeit).await
    }

    /// Measure round-trip latency; the result arrives as
    /// [`SessionEvent::PongReceived`].
    pub async fn ping(&self) -> Result<(), SessionError> {
        let nonce = self.next_seq.load(Ordering::Relaxed) + 1;
        self.pending_pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nonce, Instant::now());
        let tick = self.log.lock().unwrap_or_else(|e| e.into_inner()).current_tick();
        self.send_payload(tick, MessagePayload::Ping { nonce }).await
    }

    async fn send_payload(&self, tick: Tick, payload: MessagePayload) -> Result<(), SessionError> {
        let sequence = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let message = GameMessage::new(self.local.clone(), tick, sequence, payload);
        let bytes =
            serde_json::to_vec(&message).map_err(|e| SessionError::Serialize(e.to_string()))?;
        self.channel.send(&bytes).await?;
        Ok(())
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let message: GameMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable lockstep frame dropped");
                return;
            }
        };
        if let Err(e) = self
            .sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(&message.sender, message.sequence)
        {
            // A gap is evidence of loss above the transport; the
            // consumer recovers via resync, so log and keep going
            warn!(error = %e, "sequence irregularity");
        }

        match message.payload {
            MessagePayload::Input { commands } => {
                self.log
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(message.tick, commands.clone());
                let ack = MessagePayload::InputAck {
                    tick: message.tick,
                    sequence: message.sequence,
                };
                if let Err(e) = self.send_payload(message.tick, ack).await {
                    debug!(error = %e, "input ack failed");
                }
                let _ = self
                    .events_tx
                    .send(SessionEvent::CommandsReceived { tick: message.tick, commands });
            }
            MessagePayload::InputAck { sequence, .. } => {
                self.last_acked_seq.fetch_max(sequence, Ordering::Relaxed);
            }
            MessagePayload::Checksum(remote) => {
                let local = {
                    let mut remotes =
                        self.remote_checksums.lock().unwrap_or_else(|e| e.into_inner());
                    remotes.insert(remote.tick, remote.clone());
                    prune_old(&mut remotes, remote.tick);
                    self.local_checksums
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .get(&remote.tick)
                        .cloned()
                };
                let _ = self.events_tx.send(SessionEvent::PeerChecksum(remote.clone()));
                if let Some(local) = local {
                    if let Err(e) = self.report_if_diverged(&local, &remote).await {
                        debug!(error = %e, "desync report failed");
                    }
                }
            }
            MessagePayload::Desync(report) => {
                warn!(tick = report.tick, divergence = ?report.divergence, "peer reported desync");
                let _ = self.events_tx.send(SessionEvent::DesyncDetected(report));
            }
            MessagePayload::SyncRequest { last_tick } => {
                let (current_tick, ticks) = {
                    let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
                    (log.current_tick(), log.since(last_tick))
                };
                info!(peer = %message.sender, last_tick, replaying = ticks.len(), "serving resync");
                let response = MessagePayload::SyncResponse { current_tick, ticks };
                if let Err(e) = self.send_payload(current_tick, response).await {
                    warn!(error = %e, "sync response failed");
                }
            }
            MessagePayload::SyncResponse { current_tick, ticks } => {
                let replayed_ticks = ticks.len();
                {
                    let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.merge(ticks.clone());
                }
                for entry in ticks {
                    let _ = self.events_tx.send(SessionEvent::CommandsReceived {
                        tick: entry.tick,
                        commands: entry.commands,
                    });
                }
                if self.state() == ConnectionState::Reconnecting {
                    if let Err(e) = self.transition(ConnectionState::Connected) {
                        warn!(error = %e, "post-resync transition failed");
                    }
                }
                info!(current_tick, replayed_ticks, "resync complete");
                let _ = self
                    .events_tx
                    .send(SessionEvent::SyncCompleted { current_tick, replayed_ticks });
            }
            MessagePayload::Ping { nonce } => {
                if let Err(e) = self.send_payload(message.tick, MessagePayload::Pong { nonce }).await
                {
                    debug!(error = %e, "pong failed");
                }
            }
            MessagePayload::Pong { nonce } => {
                let started = self
                    .pending_pings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&nonce);
                if let Some(started) = started {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let _ = self.events_tx.send(SessionEvent::PongReceived { latency_ms });
                }
            }
            MessagePayload::Pause { reason } => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::Paused { by: message.sender, reason });
            }
            MessagePayload::Resume => {
                let _ = self.events_tx.send(SessionEvent::Resumed { by: message.sender });
            }
            MessagePayload::Forfeit => {
                let _ = self.events_tx.send(SessionEvent::Forfeited { by: message.sender });
            }
            MessagePayload::Chat { text } => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::ChatReceived { from: message.sender, text });
            }
        }
    }

    /// Build, emit and send a desync report when two checksums for the
    /// same tick disagree.
    async fn report_if_diverged(
        &self,
        local: &StateChecksum,
        remote: &StateChecksum,
    ) -> Result<(), SessionError> {
        let Some(report) = DesyncReport::new(local.clone(), remote.clone(), false) else {
            return Ok(());
        };
        warn!(tick = report.tick, divergence = ?report.divergence, "state divergence detected");
        let _ = self.events_tx.send(SessionEvent::DesyncDetected(report.clone()));
        self.send_payload(report.tick, MessagePayload::Desync(report)).await
    }
}

/// Keep checksum history bounded; anything far behind the newest tick
/// can no longer be compared.
fn prune_old(map: &mut BTreeMap<Tick, StateChecksum>, newest: Tick) {
    const KEEP: Tick = 256;
    let cutoff = newest.saturating_sub(KEEP);
    map.retain(|tick, _| *tick >= cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use phalanx_core::EntityDigest;

    fn pair() -> (Arc<GameSession>, Arc<GameSession>) {
        let config = NetworkConfig::default();
        let (ca, cb) = MemoryChannel::pair();
        let a = GameSession::new("a-player".into(), ca, &config);
        let b = GameSession::new("b-player".into(), cb, &config);
        (a, b)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<SessionEvent>,
        want: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = rx.recv().await.unwrap();
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    #[tokio::test]
    async fn commands_arrive_with_deterministic_ids() {
        let (a, b) = pair();
        let mut events_b = b.subscribe();

        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.state(), ConnectionState::Connected);

        let sent = a
            .send_commands(
                10,
                vec![CommandSpec {
                    kind: CommandKind::Move,
                    entity_ids: vec![4, 5],
                    data: serde_json::json!({"x": 12, "y": 9}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(sent[0].id, "a-player:10:1");

        let event = next_event(&mut events_b, |e| {
            matches!(e, SessionEvent::CommandsReceived { .. })
        })
        .await;
        match event {
            SessionEvent::CommandsReceived { tick, commands } => {
                assert_eq!(tick, 10);
                assert_eq!(commands[0].id, "a-player:10:1");
                assert_eq!(commands[0].kind, CommandKind::Move);
            }
            _ => unreachable!(),
        }

        // The ack flows back
        tokio::time::timeout(Duration::from_secs(1), async {
            while a.last_acked_sequence() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ack not received");
    }

    #[tokio::test]
    async fn diverging_checksums_raise_desync_on_both_sides() {
        let (a, b) = pair();
        let mut events_a = a.subscribe();
        let mut events_b = b.subscribe();
        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();

        let healthy = vec![EntityDigest { id: 1, health: 100, x: 0, y: 0 }];
        let damaged = vec![EntityDigest { id: 1, health: 70, x: 0, y: 0 }];

        // Tick 20 is on the default cadence, so both ship their digest
        a.submit_checksum(StateChecksum::compute(20, &healthy, 500)).await.unwrap();
        b.submit_checksum(StateChecksum::compute(20, &damaged, 500)).await.unwrap();

        for events in [&mut events_a, &mut events_b] {
            let event =
                next_event(events, |e| matches!(e, SessionEvent::DesyncDetected(_))).await;
            match event {
                SessionEvent::DesyncDetected(report) => {
                    assert_eq!(report.tick, 20);
                    assert_eq!(report.divergence, phalanx_core::DivergenceKind::Health);
                }
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn matching_checksums_stay_silent() {
        let (a, b) = pair();
        let mut events_a = a.subscribe();
        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();

        let state = vec![EntityDigest { id: 1, health: 100, x: 3, y: 4 }];
        a.submit_checksum(StateChecksum::compute(20, &state, 0)).await.unwrap();
        b.submit_checksum(StateChecksum::compute(20, &state, 0)).await.unwrap();

        let event = next_event(&mut events_a, |e| {
            matches!(e, SessionEvent::PeerChecksum(_) | SessionEvent::DesyncDetected(_))
        })
        .await;
        assert!(matches!(event, SessionEvent::PeerChecksum(_)));
    }

    #[tokio::test]
    async fn resync_replays_the_command_log() {
        let (a, b) = pair();
        let mut events_a = a.subscribe();
        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();

        // B accumulates history
        for tick in 1..=4u64 {
            b.send_commands(
                tick,
                vec![CommandSpec {
                    kind: CommandKind::Gather,
                    entity_ids: vec![tick],
                    data: serde_json::Value::Null,
                }],
            )
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A drops and rejoins from tick 3
        a.request_resync(3).await.unwrap();
        assert_eq!(a.state(), ConnectionState::Reconnecting);

        let event =
            next_event(&mut events_a, |e| matches!(e, SessionEvent::SyncCompleted { .. })).await;
        match event {
            SessionEvent::SyncCompleted { current_tick, replayed_ticks } => {
                assert_eq!(current_tick, 4);
                assert_eq!(replayed_ticks, 2); // ticks 3 and 4
            }
            _ => unreachable!(),
        }
        assert_eq!(a.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn ping_measures_latency() {
        let (a, b) = pair();
        let mut events_a = a.subscribe();
        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();

        a.ping().await.unwrap();
        let event =
            next_event(&mut events_a, |e| matches!(e, SessionEvent::PongReceived { .. })).await;
        assert!(matches!(event, SessionEvent::PongReceived { .. }));
    }

    #[tokio::test]
    async fn chat_pause_and_forfeit_surface_as_events() {
        let (a, b) = pair();
        let mut events_b = b.subscribe();
        a.connect(Duration::from_secs(1)).await.unwrap();
        b.connect(Duration::from_secs(1)).await.unwrap();

        a.send_chat("rush incoming".into()).await.unwrap();
        a.pause(Some("phone".into())).await.unwrap();
        a.resume().await.unwrap();
        a.forfeit().await.unwrap();

        let chat = next_event(&mut events_b, |e| matches!(e, SessionEvent::ChatReceived { .. })).await;
        match chat {
            SessionEvent::ChatReceived { from, text } => {
                assert_eq!(from, "a-player");
                assert_eq!(text, "rush incoming");
            }
            _ => unreachable!(),
        }
        next_event(&mut events_b, |e| matches!(e, SessionEvent::Paused { .. })).await;
        next_event(&mut events_b, |e| matches!(e, SessionEvent::Resumed { .. })).await;
        let forfeit =
            next_event(&mut events_b, |e| matches!(e, SessionEvent::Forfeited { .. })).await;
        assert!(matches!(forfeit, SessionEvent::Forfeited { by } if by == "a-player"));
    }
}
