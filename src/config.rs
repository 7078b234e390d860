//! Node configuration
//!
//! Loaded from TOML. Every section is optional; missing keys take defaults.
//!
//! ```toml
//! [node]
//! display_name = "living-room"
//! start_as_leader = false
//!
//! [network]
//! listen_addr = "0.0.0.0:7400"
//! peers = ["192.168.1.20:7400"]
//!
//! [sync]
//! ping_interval_ms = 2000
//! lead_ms = 150
//! adaptive_lead = true
//!
//! [audio]
//! output = "device"
//! initial_volume = 0.8
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub audio: AudioConfig,
}

/// Identity and startup role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub display_name: String,
    pub start_as_leader: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "mesh-node".to_string(),
            start_as_leader: false,
        }
    }
}

/// Link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept inbound links on; `None` disables the listener
    pub listen_addr: Option<String>,
    /// Peers to dial and keep connected
    pub peers: Vec<String>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: Some(format!("0.0.0.0:{}", DEFAULT_MESH_PORT)),
            peers: Vec::new(),
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

/// Probing and scheduling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ping_interval_ms: u64,
    /// Fixed lead between issuing `play` and the common start time
    pub lead_ms: u64,
    /// Stretch the lead to the worst measured peer latency
    pub adaptive_lead: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            lead_ms: DEFAULT_LEAD_MS,
            adaptive_lead: true,
        }
    }
}

impl SyncConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn lead_seconds(&self) -> f64 {
        self.lead_ms as f64 / 1000.0
    }
}

/// Which audio engine drives local output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Real output device through cpal
    #[default]
    Device,
    /// Clock-only engine, no sound (headless nodes, tests)
    Simulated,
}

/// Local output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub output: OutputKind,
    /// Output device name; default device when unset
    pub device: Option<String>,
    pub initial_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output: OutputKind::Device,
            device: None,
            initial_volume: 1.0,
        }
    }
}

impl MeshConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "audio-mesh")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.audio.initial_volume) {
            return Err(Error::Config(format!(
                "audio.initial_volume must be within 0.0..=1.0, got {}",
                self.audio.initial_volume
            )));
        }
        if self.network.max_frame_bytes < 1024 {
            return Err(Error::Config("network.max_frame_bytes is too small".to_string()));
        }
        Ok(())
    }
}
