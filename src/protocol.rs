//! Wire protocol for mesh links
//!
//! Every message travels as one length-prefixed frame (see [`crate::network::framing`])
//! whose body is the bincode encoding of [`MeshMessage`]. Bincode writes the enum
//! tag as a little-endian `u32` ahead of the fields, so the first four body bytes
//! are the message `type` discriminator:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ kind: u32 LE  │ fields (bincode, fixint LE)  │
//! └──────────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! Kinds beyond the ones this build knows decode to `None` and are dropped by
//! the dispatcher, so newer peers can add messages without breaking older ones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Number of message kinds understood by this build
pub const KNOWN_KINDS: u32 = 8;

const KIND_NAMES: [&str; KNOWN_KINDS as usize] = [
    "handshake", "audio", "play", "pause", "stop", "volume", "ping", "pong",
];

/// Identity of a mesh node, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Opaque id, used as the registry key on remote nodes
    pub id: String,
    /// Human readable name shown to operators
    pub display_name: String,
}

impl NodeIdentity {
    /// Assign a fresh random id
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
        }
    }
}

/// Local role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    #[default]
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Messages exchanged between mesh nodes
///
/// Variant order is the wire discriminator; append new kinds at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Identity exchange, sent by both sides as soon as a link opens
    Handshake {
        peer_id: String,
        device_name: String,
        is_leader: bool,
        /// Sender wall clock in milliseconds
        timestamp: f64,
    },

    /// Full asset transfer in a single message
    Audio { file_name: String, raw_bytes: Vec<u8> },

    /// Start playback at `start_time` (audio clock seconds) from buffer `offset` (seconds)
    Play { start_time: f64, offset: f64 },

    /// Stop now, keep the position
    Pause,

    /// Stop now, rewind to zero
    Stop,

    /// Output gain, 0.0 to 1.0
    Volume { level: f32 },

    /// Latency probe request, sender wall clock in milliseconds
    Ping { timestamp: f64 },

    /// Latency probe reply, echoes the ping timestamp unchanged
    Pong { timestamp: f64 },
}

impl MeshMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        KIND_NAMES[self.tag() as usize]
    }

    fn tag(&self) -> u32 {
        match self {
            MeshMessage::Handshake { .. } => 0,
            MeshMessage::Audio { .. } => 1,
            MeshMessage::Play { .. } => 2,
            MeshMessage::Pause => 3,
            MeshMessage::Stop => 4,
            MeshMessage::Volume { .. } => 5,
            MeshMessage::Ping { .. } => 6,
            MeshMessage::Pong { .. } => 7,
        }
    }

    /// Whether this message is a command only a leader may originate
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            MeshMessage::Audio { .. }
                | MeshMessage::Play { .. }
                | MeshMessage::Pause
                | MeshMessage::Stop
                | MeshMessage::Volume { .. }
        )
    }

    /// Encode to a frame body
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a frame body
    ///
    /// Returns `Ok(None)` for kinds this build does not know.
    pub fn decode(body: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::Truncated(body.len()));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&body[..4]);
        let tag = u32::from_le_bytes(raw);
        if tag >= KNOWN_KINDS {
            return Ok(None);
        }

        bincode::deserialize(body)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed {
                kind: KIND_NAMES[tag as usize],
                reason: e.to_string(),
            })
    }
}
