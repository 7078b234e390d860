//! Coordination core: registry, roles, latency probes, playback scheduling,
//! asset distribution, and the node actor that ties them together

mod dispatch;
pub mod distribution;
pub mod node;
pub mod registry;
pub mod role;
pub mod scheduler;
pub mod sync;

pub use distribution::{AssetLoader, AssetOrigin, DecodedAsset};
pub use node::{AssetInfo, MeshHandle, MeshNode, NodeCommand, NodeCounters, NodeStatus, PeerStatus};
pub use registry::{BroadcastReport, ConnectionState, PeerRegistry, PeerSummary};
pub use role::RoleController;
pub use scheduler::{compute_start, PlaybackPhase, PlaybackScheduler, PlaybackState, StartTiming};
pub use sync::{classify, ClockSyncProber, SyncMetrics, SyncQuality};
