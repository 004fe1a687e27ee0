// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection lifecycle, sequence tracking and the command log.
//!
//! The state machine is `disconnected -> connecting -> connected`,
//! with `connected -> reconnecting -> {connected | failed}` after a
//! drop. The command log retains every (tick, commands) pair of the
//! match so a peer can replay history to a rejoining client.

use crate::command::GameCommand;
use crate::message::TickCommands;
use crate::{LockstepError, PlayerId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lifecycle state of one lockstep connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Failed, Connecting)
        )
    }
}

/// Owns the current connection state and enforces legal transitions.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: ConnectionState,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self { state: ConnectionState::Disconnected }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, rejecting transitions the machine forbids.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), LockstepError> {
        if !self.state.can_transition_to(next) {
            return Err(LockstepError::InvalidTransition { from: self.state, to: next });
        }
        tracing::debug!(from = ?self.state, to = ?next, "connection state transition");
        self.state = next;
        Ok(())
    }
}

/// Per-sender monotonic sequence tracking for gap detection.
///
/// The transport guarantees in-order delivery within one channel; the
/// tracker catches messages lost above that guarantee, e.g. across a
/// reconnect.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<PlayerId, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` from `sender`. The first observed sequence for
    /// a sender is accepted as-is; afterwards each message must advance
    /// by exactly one.
    pub fn observe(&mut self, sender: &str, sequence: u64) -> Result<(), LockstepError> {
        match self.last_seen.get(sender) {
            None => {
                self.last_seen.insert(sender.to_string(), sequence);
                Ok(())
            }
            Some(&last) => {
                let expected = last + 1;
                if sequence == expected {
                    self.last_seen.insert(sender.to_string(), sequence);
                    Ok(())
                } else if sequence > expected {
                    // Record the jump so one gap yields one error
                    self.last_seen.insert(sender.to_string(), sequence);
                    Err(LockstepError::SequenceGap {
                        sender: sender.to_string(),
                        expected,
                        got: sequence,
                    })
                } else {
                    Err(LockstepError::StaleSequence {
                        sender: sender.to_string(),
                        expected,
                        got: sequence,
                    })
                }
            }
        }
    }

    /// Forget a sender, e.g. when it leaves the match.
    pub fn forget(&mut self, sender: &str) {
        self.last_seen.remove(sender);
    }
}

/// Full command history of one match, keyed by tick internally but
/// always emitted as an explicit ordered list.
#[derive(Debug, Default)]
pub struct CommandLog {
    ticks: BTreeMap<Tick, Vec<GameCommand>>,
    current_tick: Tick,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record commands for a tick. Repeated records for the same tick
    /// append, preserving arrival order; duplicate command IDs are
    /// dropped.
    pub fn record(&mut self, tick: Tick, commands: impl IntoIterator<Item = GameCommand>) {
        let slot = self.ticks.entry(tick).or_default();
        for cmd in commands {
            if slot.iter().any(|c| c.id == cmd.id) {
                tracing::debug!(id = %cmd.id, "duplicate command dropped");
                continue;
            }
            slot.push(cmd);
        }
        if tick > self.current_tick {
            self.current_tick = tick;
        }
    }

    /// Highest tick the log has seen commands for.
    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    /// Commands recorded for one tick, in arrival order.
    pub fn commands_at(&self, tick: Tick) -> &[GameCommand] {
        self.ticks.get(&tick).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Everything from `from_tick` (inclusive) forward, in tick order.
    /// This is the body of a sync-response to a rejoining client.
    pub fn since(&self, from_tick: Tick) -> Vec<TickCommands> {
        self.ticks
            .range(from_tick..)
            .map(|(tick, commands)| TickCommands { tick: *tick, commands: commands.clone() })
            .collect()
    }

    /// Apply a replayed history from a peer, merging it into the log.
    pub fn merge(&mut self, ticks: Vec<TickCommands>) {
        for entry in ticks {
            self.record(entry.tick, entry.commands);
        }
    }
}
