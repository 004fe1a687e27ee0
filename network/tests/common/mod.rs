// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for the integration tests: a loopback SDP endpoint
//! standing in for the WebRTC stack, and a channel wrapper that taps
//! every outgoing frame so tests can observe what an intermediate node
//! actually sees on the wire.

// Each integration test binary uses a different subset of the helpers
#![allow(dead_code)]

use async_trait::async_trait;
use phalanx_network::connect_code::SdpEndpoint;
use phalanx_network::transport::{ChannelState, MemoryChannel, PeerChannel, TransportError};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// SDP endpoint that fabricates deterministic session descriptions and
/// a small fixed candidate list.
pub struct LoopbackSdp {
    name: String,
    accepted_answer: Mutex<Option<String>>,
}

impl LoopbackSdp {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), accepted_answer: Mutex::new(None) }
    }

    pub fn accepted_answer(&self) -> Option<String> {
        self.accepted_answer.lock().unwrap().clone()
    }
}

#[async_trait]
impl SdpEndpoint for LoopbackSdp {
    async fn create_offer(&self) -> anyhow::Result<String> {
        Ok(format!("v=0\r\no={} 1 1 IN IP4 0.0.0.0\r\ns=offer\r\n", self.name))
    }

    async fn create_answer(&self, remote_offer: &str) -> anyhow::Result<String> {
        anyhow::ensure!(remote_offer.contains("s=offer"), "not an offer sdp");
        Ok(format!("v=0\r\no={} 1 1 IN IP4 0.0.0.0\r\ns=answer\r\n", self.name))
    }

    async fn accept_answer(&self, remote_answer: &str) -> anyhow::Result<()> {
        anyhow::ensure!(remote_answer.contains("s=answer"), "not an answer sdp");
        *self.accepted_answer.lock().unwrap() = Some(remote_answer.to_string());
        Ok(())
    }

    fn candidates(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(format!("candidate:1 1 udp 2122260223 10.0.0.{} 9 typ host", self.name.len()));
        let _ = tx.send("candidate:2 1 udp 1686052607 84.12.9.3 9 typ srflx".to_string());
        rx
    }
}

/// Channel wrapper copying every outgoing frame to a test-side tap.
pub struct TapChannel {
    inner: Arc<MemoryChannel>,
    tap: mpsc::UnboundedSender<Vec<u8>>,
}

impl TapChannel {
    pub fn new(inner: Arc<MemoryChannel>) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tap, tapped) = mpsc::unbounded_channel();
        (Arc::new(Self { inner, tap }), tapped)
    }
}

#[async_trait]
impl PeerChannel for TapChannel {
    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let _ = self.tap.send(data.to_vec());
        self.inner.send(data).await
    }

    fn incoming(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.inner.incoming()
    }

    fn close(&self) {
        self.inner.close();
    }
}
