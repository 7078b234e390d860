//! Audio subsystem module

pub mod buffer;
pub mod decode;
pub mod device;
pub mod engine;
pub mod output;

pub use buffer::{AudioAsset, AudioBuffer};
pub use decode::SymphoniaDecoder;
pub use device::{find_output_device, list_output_devices, OutputDeviceInfo};
pub use engine::{AssetDecoder, AudioEngine, EngineCall, ManualClock, SimulatedEngine};
pub use output::DeviceEngine;
