// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay directory: healthy signaling endpoints.
//!
//! Endpoints come from configuration; each is validated with a short
//! bounded connection attempt before use. Signaling with too few relays
//! is unreliable, so falling below the minimum is an explicit error,
//! never silent degradation.

use crate::config::NetworkConfig;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::time::Instant;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A validated relay endpoint with its measured probe latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Fewer validated relays than the configured minimum
    #[error("only {healthy} of the required {required} relays are reachable")]
    RelayUnavailable { healthy: usize, required: usize },
}

/// Performs one bounded health probe: connect, then close immediately.
#[async_trait]
pub trait RelayProbe: Send + Sync {
    async fn probe(&self, url: &str) -> anyhow::Result<()>;
}

/// Validates configured endpoints and hands out healthy subsets.
pub struct RelayDirectory<P: RelayProbe> {
    endpoints: Vec<String>,
    probe: P,
    probe_timeout: std::time::Duration,
    min_relays: usize,
}

impl<P: RelayProbe> RelayDirectory<P> {
    pub fn new(config: &NetworkConfig, probe: P) -> Self {
        Self {
            endpoints: config.relay_endpoints.clone(),
            probe,
            probe_timeout: config.relay_probe_timeout(),
            min_relays: config.min_relays,
        }
    }

    /// Return up to `count` healthy endpoints, shuffled so repeated
    /// calls spread load across the relay population.
    ///
    /// Fails with [`DirectoryError::RelayUnavailable`] when fewer than
    /// the configured minimum validate, regardless of `count`.
    pub async fn get_relays(&self, count: usize) -> Result<Vec<RelayEndpoint>, DirectoryError> {
        let probes = self.endpoints.iter().map(|url| async move {
            let started = Instant::now();
            match timeout(self.probe_timeout, self.probe.probe(url)).await {
                Ok(Ok(())) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    debug!(url = %url, latency_ms, "relay healthy");
                    Some(RelayEndpoint { url: url.clone(), latency_ms })
                }
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "relay probe failed");
                    None
                }
                Err(_) => {
                    warn!(url = %url, timeout_ms = self.probe_timeout.as_millis() as u64, "relay probe timed out");
                    None
                }
            }
        });

        let mut healthy: Vec<RelayEndpoint> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        if healthy.len() < self.min_relays {
            return Err(DirectoryError::RelayUnavailable {
                healthy: healthy.len(),
                required: self.min_relays,
            });
        }

        healthy.shuffle(&mut rand::thread_rng());
        healthy.truncate(count);
        Ok(healthy)
    }
}
