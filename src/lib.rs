//! # Audio Mesh
//!
//! Synchronized audio playback across a mesh of independent nodes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── LEADER ────────────────────────────────┐
//! │  operator ──► MeshHandle ──► MeshNode (event loop actor)                │
//! │                               │  Role Controller   (mesh::role)         │
//! │                               │  Playback Scheduler (mesh::scheduler)   │
//! │                               │  Clock Sync Prober (mesh::sync)         │
//! │                               │  Audio Distribution (mesh::distribution)│
//! │                               ▼                                         │
//! │                  Peer Registry (mesh::registry)                         │
//! │                   │ broadcast: audio / play / pause / stop / volume     │
//! └───────────────────┼─────────────────────────────────────────────────────┘
//!                     │ TCP links, [len|bincode] frames (network::*)
//!         ┌───────────┴───────────┬─────────────────────────┐
//!         ▼                       ▼                         ▼
//!   ┌───────────┐           ┌───────────┐             ┌───────────┐
//!   │ FOLLOWER  │           │ FOLLOWER  │     ...     │ FOLLOWER  │
//!   │ dispatch  │           │ dispatch  │             │ dispatch  │
//!   │ scheduler │           │ scheduler │             │ scheduler │
//!   │ engine    │           │ engine    │             │ engine    │
//!   └───────────┘           └───────────┘             └───────────┘
//! ```
//!
//! The Leader picks a start time slightly in the future on its own audio
//! clock and broadcasts it; every Follower waits out the remaining delay, or
//! skips ahead in the buffer when the command arrived late.

pub mod audio;
pub mod config;
pub mod error;
pub mod mesh;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};
pub use mesh::node::{MeshHandle, MeshNode, NodeStatus};

/// Application-wide constants
pub mod constants {
    /// Default lead between issuing `play` and the common start time, in milliseconds
    pub const DEFAULT_LEAD_MS: u64 = 150;

    /// Default latency probe interval in milliseconds
    pub const DEFAULT_PING_INTERVAL_MS: u64 = 2000;

    /// Default TCP port for mesh links
    pub const DEFAULT_MESH_PORT: u16 = 7400;

    /// Initial reconnect backoff in milliseconds
    pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;

    /// Reconnect backoff ceiling in milliseconds
    pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

    /// Largest accepted frame; assets travel as a single frame
    pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

    /// Upper bound (exclusive) of the "excellent" latency class, in milliseconds
    pub const EXCELLENT_LATENCY_MS: f64 = 20.0;

    /// Upper bound (exclusive) of the "good" latency class, in milliseconds
    pub const GOOD_LATENCY_MS: f64 = 50.0;

    /// Interval of the end-of-asset check in milliseconds
    pub const STATUS_TICK_MS: u64 = 250;

    /// Fraction of the device clock's error against the wall clock removed per callback
    pub const CLOCK_SLEW_FACTOR: f64 = 0.01;

    /// Device clock error, in seconds, beyond which it is re-anchored outright
    pub const CLOCK_RESYNC_SECONDS: f64 = 0.1;
}
