// SPDX-License-Identifier: MIT OR Apache-2.0

//! Game commands and deterministic command identity.
//!
//! Every client must construct byte-identical IDs for identical logical
//! commands with no coordination, so IDs are derived from
//! (player, tick, per-player-per-tick sequence) and never from
//! wall-clock time or randomness.

use crate::{PlayerId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kinds of orders a player can issue to the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Move,
    Attack,
    AttackMove,
    Patrol,
    Hold,
    Stop,
    Build,
    Train,
    Research,
    Ability,
    Transform,
    Load,
    Unload,
    Rally,
    Gather,
    Repair,
    Heal,
    Cloak,
    Cancel,
}

/// A single player order, scheduled for execution at a specific tick.
///
/// Commands are immutable value objects; they are shared freely between
/// the protocol layer and the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameCommand {
    /// Deterministic identity of the form `player:tick:sequence`
    pub id: String,
    /// What kind of order this is
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// The player who issued the command
    #[serde(rename = "playerId")]
    pub player: PlayerId,
    /// The tick the command executes at
    pub tick: Tick,
    /// Entities the command applies to
    #[serde(rename = "entityIds")]
    pub entity_ids: Vec<u64>,
    /// Kind-specific parameters (target position, build type, ...)
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Deterministic command-ID generator for one match session.
///
/// One instance is constructed per match and passed by reference to
/// whoever issues commands; its lifetime is tied to the match. Two
/// generators fed the same (player, tick) call sequence produce
/// identical IDs in the same order.
#[derive(Debug, Default)]
pub struct CommandIdGenerator {
    /// Per-player (tick, counter); the counter zeroes when the tick advances
    counters: HashMap<PlayerId, (Tick, u32)>,
}

impl CommandIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next ID for a command issued by `player` at `tick`.
    ///
    /// The per-player counter resets whenever the tick advances, so the
    /// first command of each tick is always `player:tick:1`.
    pub fn next_id(&mut self, player: &str, tick: Tick) -> String {
        let entry = self
            .counters
            .entry(player.to_string())
            .or_insert((tick, 0));
        if entry.0 != tick {
            *entry = (tick, 0);
        }
        entry.1 += 1;
        format!("{}:{}:{}", player, tick, entry.1)
    }

    /// Build a full command, assigning its deterministic ID.
    pub fn issue(
        &mut self,
        kind: CommandKind,
        player: &str,
        tick: Tick,
        entity_ids: Vec<u64>,
        data: serde_json::Value,
    ) -> GameCommand {
        GameCommand {
            id: self.next_id(player, tick),
            kind,
            player: player.to_string(),
            tick,
            entity_ids,
            data,
        }
    }
}
