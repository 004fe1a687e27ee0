// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport seam for peer data channels.
//!
//! The embedding application supplies the actual channels (WebRTC data
//! channels after signaling completes); this crate only requires an
//! ordered, reliable byte channel with an observable state. The
//! in-memory implementation backs the test suites.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle state of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel is not open; carries the state observed at send time
    #[error("channel not open (state {0:?})")]
    NotOpen(ChannelState),
    /// The channel closed mid-send
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// An ordered, reliable byte channel to one peer.
///
/// `send` must observe the channel state atomically with the send
/// itself: a channel that closes between a caller's state check and the
/// send surfaces the failure from `send`, never delivers silently.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn state(&self) -> ChannelState;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Take the inbound stream. Single consumer: the first caller gets
    /// the live receiver, later callers get an already-closed one.
    fn incoming(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;

    /// Close the channel for both directions.
    fn close(&self);
}

/// In-memory channel pair with shared state, for tests and local play.
pub struct MemoryChannel {
    state: Arc<RwLock<ChannelState>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryChannel {
    /// Create two connected ends. Closing either end closes both.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ChannelState::Open));

        let a = Arc::new(Self {
            state: state.clone(),
            outbound: b_tx,
            inbound: Mutex::new(Some(a_rx)),
        });
        let b = Arc::new(Self {
            state,
            outbound: a_tx,
            inbound: Mutex::new(Some(b_rx)),
        });
        (a, b)
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn state(&self) -> ChannelState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(TransportError::NotOpen(state));
        }
        self.outbound
            .send(data.to_vec())
            .map_err(|_| TransportError::SendFailed("peer receiver dropped".into()))
    }

    fn incoming(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let taken = self.inbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        taken.unwrap_or_else(|| {
            // Hand back a closed receiver rather than panicking
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        })
    }

    fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = ChannelState::Closed;
    }
}
