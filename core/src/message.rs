// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire envelope for the lockstep exchange.
//!
//! A `GameMessage` wraps exactly one payload kind, discriminated by the
//! `type` field on the wire. Adding a payload kind is a compile-time
//! checked change: every consumer matches the union exhaustively.

use crate::checksum::{DesyncReport, StateChecksum};
use crate::command::GameCommand;
use crate::{PlayerId, Tick};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Transport envelope for one lockstep message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMessage {
    pub tick: Tick,
    #[serde(rename = "senderId")]
    pub sender: PlayerId,
    /// Per-sender monotonic sequence number for gap detection
    pub sequence: u64,
    /// Unix milliseconds at send time; informational only, never used
    /// for protocol decisions
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl GameMessage {
    pub fn new(sender: PlayerId, tick: Tick, sequence: u64, payload: MessagePayload) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self { tick, sender, sequence, timestamp, payload }
    }
}

/// Commands issued for execution at one tick, in issue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickCommands {
    pub tick: Tick,
    pub commands: Vec<GameCommand>,
}

/// The payload union riding in `GameMessage::payload`.
///
/// Serialized adjacently: the discriminant lands in the envelope's
/// `type` field, the content in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum MessagePayload {
    /// A batch of commands for the envelope's tick
    Input { commands: Vec<GameCommand> },
    /// Acknowledges receipt of an input batch
    InputAck { tick: Tick, sequence: u64 },
    /// Periodic state digest for divergence detection
    Checksum(StateChecksum),
    /// Two clients disagree about the state at a tick
    Desync(DesyncReport),
    /// A rejoining client asks for everything after its last known tick
    SyncRequest {
        #[serde(rename = "lastTick")]
        last_tick: Tick,
    },
    /// Replay of the command log from the requested tick forward.
    ///
    /// An explicit ordered list, never a keyed map, so the wire form
    /// serializes completely and deterministically.
    SyncResponse {
        #[serde(rename = "currentTick")]
        current_tick: Tick,
        ticks: Vec<TickCommands>,
    },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Pause { reason: Option<String> },
    Resume,
    Forfeit,
    Chat { text: String },
}

impl MessagePayload {
    /// Wire name of this payload kind, as it appears in `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Input { .. } => "input",
            MessagePayload::InputAck { .. } => "input-ack",
            MessagePayload::Checksum(_) => "checksum",
            MessagePayload::Desync(_) => "desync",
            MessagePayload::SyncRequest { .. } => "sync-request",
            MessagePayload::SyncResponse { .. } => "sync-response",
            MessagePayload::Ping { .. } => "ping",
            MessagePayload::Pong { .. } => "pong",
            MessagePayload::Pause { .. } => "pause",
            MessagePayload::Resume => "resume",
            MessagePayload::Forfeit => "forfeit",
            MessagePayload::Chat { .. } => "chat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandIdGenerator, CommandKind};

    #[test]
    fn envelope_wire_shape() {
        let mut gen = CommandIdGenerator::new();
        let cmd = gen.issue(CommandKind::Move, "p1", 10, vec![3], serde_json::json!({"x": 1}));
        let msg = GameMessage::new(
            "p1".into(),
            10,
            1,
            MessagePayload::Input { commands: vec![cmd] },
        );

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "input");
        assert_eq!(wire["senderId"], "p1");
        assert_eq!(wire["tick"], 10);
        assert_eq!(wire["sequence"], 1);
        assert_eq!(wire["data"]["commands"][0]["id"], "p1:10:1");

        let back: GameMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn kebab_case_discriminants() {
        let ack = GameMessage::new(
            "p2".into(),
            4,
            9,
            MessagePayload::InputAck { tick: 4, sequence: 8 },
        );
        let wire = serde_json::to_value(&ack).unwrap();
        assert_eq!(wire["type"], "input-ack");

        let req = GameMessage::new("p2".into(), 4, 10, MessagePayload::SyncRequest { last_tick: 2 });
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["type"], "sync-request");
        assert_eq!(wire["data"]["lastTick"], 2);
    }

    #[test]
    fn sync_response_is_an_ordered_list() {
        let msg = GameMessage::new(
            "p1".into(),
            8,
            2,
            MessagePayload::SyncResponse {
                current_tick: 8,
                ticks: vec![
                    TickCommands { tick: 6, commands: vec![] },
                    TickCommands { tick: 7, commands: vec![] },
                ],
            },
        );
        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire["data"]["ticks"].is_array());
        assert_eq!(wire["data"]["ticks"][0]["tick"], 6);
        assert_eq!(wire["data"]["ticks"][1]["tick"], 7);
    }

    #[test]
    fn every_kind_round_trips() {
        let checksum = StateChecksum::compute(1, &[], 0);
        let payloads = vec![
            MessagePayload::Input { commands: vec![] },
            MessagePayload::InputAck { tick: 1, sequence: 1 },
            MessagePayload::Checksum(checksum.clone()),
            MessagePayload::SyncRequest { last_tick: 1 },
            MessagePayload::SyncResponse { current_tick: 2, ticks: vec![] },
            MessagePayload::Ping { nonce: 77 },
            MessagePayload::Pong { nonce: 77 },
            MessagePayload::Pause { reason: Some("afk".into()) },
            MessagePayload::Resume,
            MessagePayload::Forfeit,
            MessagePayload::Chat { text: "gg".into() },
        ];
        for payload in payloads {
            let kind = payload.kind();
            let msg = GameMessage::new("p1".into(), 1, 1, payload);
            let wire = serde_json::to_string(&msg).unwrap();
            let back: GameMessage = serde_json::from_str(&wire).unwrap();
            assert_eq!(back.payload.kind(), kind);
            assert_eq!(back, msg);
        }
    }
}
