// SPDX-License-Identifier: MIT OR Apache-2.0

//! Phalanx Core - Lockstep Command Protocol
//!
//! This crate provides the deterministic protocol layer including:
//! - Game command schema with deterministic command identity
//! - Wire message envelopes for the lockstep exchange
//! - Per-tick state checksums and desync localization
//! - Connection state machine, sequence tracking and the command log
//!   used for reconnection replay
//!
//! Everything here is transport-oblivious: the same messages ride a
//! direct data channel or a multi-hop relay route unchanged.

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod checksum;
pub mod command;
pub mod message;
pub mod session;

use thiserror::Error;

/// Opaque player identifier. In practice this is the peer identity
/// minted by the network layer, but the protocol only requires that it
/// is stable for the duration of a match.
pub type PlayerId = String;

/// Simulation tick number.
pub type Tick = u64;

/// Lockstep protocol version. Cross-version play is rejected outright.
pub const PROTOCOL_VERSION: u16 = 1;

/// Errors raised by the lockstep protocol layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockstepError {
    /// A connection state transition that the state machine forbids
    #[error("invalid connection state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: session::ConnectionState,
        to: session::ConnectionState,
    },

    /// A sender skipped ahead in its sequence numbering
    #[error("sequence gap from {sender}: expected {expected}, got {got}")]
    SequenceGap {
        sender: PlayerId,
        expected: u64,
        got: u64,
    },

    /// A sender reused or rewound its sequence numbering
    #[error("stale sequence from {sender}: expected {expected}, got {got}")]
    StaleSequence {
        sender: PlayerId,
        expected: u64,
        got: u64,
    },
}

pub use checksum::{DesyncReport, DivergenceKind, EntityDigest, StateChecksum};
pub use command::{CommandIdGenerator, CommandKind, GameCommand};
pub use message::{GameMessage, MessagePayload, TickCommands};
pub use session::{CommandLog, ConnectionState, ConnectionTracker, SequenceTracker};
