//! Error types for the audio mesh

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("No audio track in {0}")]
    NoAudioTrack(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Link closed")]
    Closed,
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Coordination errors surfaced to the operator
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Only the leader may {0}")]
    NotLeader(&'static str),

    #[error("No audio asset loaded")]
    NoAsset,

    #[error("Play cannot be scheduled: {0}")]
    Unschedulable(String),

    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Node has shut down")]
    ShutDown,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
