// SPDX-License-Identifier: MIT OR Apache-2.0

//! Phalanx Network - serverless peer-to-peer multiplayer connectivity
//!
//! This crate provides the networking layer including:
//! - Relay directory with bounded health probes
//! - Copy-pasteable connection codes for manual signaling
//! - Matchmaking over public publish/subscribe relays
//! - Relay mesh with multi-hop routing and end-to-end encryption
//! - The lockstep session driver over whichever transport is active
//!
//! The simulation, rendering and UI live elsewhere; this crate consumes
//! local commands plus a tick clock and emits validated remote commands
//! and desync notifications.

#![deny(unsafe_code)]

pub mod config;
pub mod connect_code;
pub mod crypto;
pub mod game_session;
pub mod identity;
pub mod matchmaking;
pub mod mesh;
pub mod relay_directory;
pub mod signaling;
pub mod transport;

// Re-exports
pub use config::NetworkConfig;
pub use connect_code::{CodeError, CodeExchange, CodeOptions, CodeRole, ConnectionCodeData, JoinCode};
pub use game_session::{CommandSpec, GameSession, SessionError, SessionEvent};
pub use identity::{LocalIdentity, PeerIdentity};
pub use matchmaking::{MatchEvent, MatchedOpponent, Matchmaker};
pub use mesh::{MeshError, MeshEvent, RelayMesh};
pub use relay_directory::{DirectoryError, RelayDirectory, RelayEndpoint, RelayProbe};
pub use signaling::{RelayClient, SignalEvent, SignalFilter};
pub use transport::{ChannelState, MemoryChannel, PeerChannel};
