// SPDX-License-Identifier: MIT OR Apache-2.0

//! Network configuration: relay endpoints and timeout knobs.
//!
//! Every bounded wait in the crate is an independent field here, so one
//! slow peer or relay can never stall an unrelated operation.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Public publish/subscribe relay endpoints used for signaling
    pub relay_endpoints: Vec<String>,
    /// Minimum validated relays below which signaling is unreliable
    #[serde(default = "default_min_relays")]
    pub min_relays: usize,
    /// Bounded connection attempt per relay health probe
    #[serde(default = "default_relay_probe_timeout_ms")]
    pub relay_probe_timeout_ms: u64,
    /// Up-front ICE gathering window; partial lists are accepted
    #[serde(default = "default_ice_gather_timeout_ms")]
    pub ice_gather_timeout_ms: u64,
    /// Per-hop peer-list request during route discovery
    #[serde(default = "default_peer_list_timeout_ms")]
    pub peer_list_timeout_ms: u64,
    /// Overall connection establishment
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bounded retry count for mesh sends
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    /// How often checksums are exchanged, in ticks
    #[serde(default = "default_checksum_interval_ticks")]
    pub checksum_interval_ticks: u64,
    /// How far back a seek announcement still counts as live
    #[serde(default = "default_seek_window_ms")]
    pub seek_window_ms: u64,
    /// Maximum rating difference when both seekers declare one
    #[serde(default = "default_max_skill_delta")]
    pub max_skill_delta: u32,
}

fn default_min_relays() -> usize {
    3
}
fn default_relay_probe_timeout_ms() -> u64 {
    2_500
}
fn default_ice_gather_timeout_ms() -> u64 {
    3_000
}
fn default_peer_list_timeout_ms() -> u64 {
    3_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_send_retries() -> u32 {
    3
}
fn default_checksum_interval_ticks() -> u64 {
    20
}
fn default_seek_window_ms() -> u64 {
    120_000
}
fn default_max_skill_delta() -> u32 {
    500
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_endpoints: vec![
                "wss://relay1.phalanx-rts.io".to_string(),
                "wss://relay2.phalanx-rts.io".to_string(),
                "wss://relay3.phalanx-rts.io".to_string(),
                "wss://relay4.phalanx-rts.io".to_string(),
            ],
            min_relays: default_min_relays(),
            relay_probe_timeout_ms: default_relay_probe_timeout_ms(),
            ice_gather_timeout_ms: default_ice_gather_timeout_ms(),
            peer_list_timeout_ms: default_peer_list_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_retries: default_send_retries(),
            checksum_interval_ticks: default_checksum_interval_ticks(),
            seek_window_ms: default_seek_window_ms(),
            max_skill_delta: default_max_skill_delta(),
        }
    }
}

impl NetworkConfig {
    pub fn relay_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_probe_timeout_ms)
    }
    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }
    pub fn peer_list_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_list_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("io", "phalanx-rts", "phalanx")
        .context("Failed to determine config directory")?;
    Ok(proj_dirs.config_dir().join("network.toml"))
}

pub fn load_config() -> Result<NetworkConfig> {
    let config_path = get_config_path().context("Failed to determine config path")?;
    load_config_from(&config_path)
}

/// Load from an explicit path, creating a default file when absent.
pub fn load_config_from(config_path: &PathBuf) -> Result<NetworkConfig> {
    if !config_path.exists() {
        tracing::info!("Config file not found, creating default at: {}", config_path.display());

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = NetworkConfig::default();
        let toml_content =
            toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
        fs::write(config_path, toml_content).context("Failed to write default config file")?;
        return Ok(default_config);
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    toml::from_str::<NetworkConfig>(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

pub fn save_config(config: &NetworkConfig) -> Result<()> {
    let config_path = get_config_path().context("Failed to determine config path")?;
    let toml_content = toml::to_string_pretty(config).context("Failed to serialize config")?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    fs::write(&config_path, toml_content)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    tracing::info!("Saved config to: {}", config_path.display());
    Ok(())
}
