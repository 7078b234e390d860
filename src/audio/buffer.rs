//! Decoded PCM buffers and the playback asset built on them

use std::sync::Arc;

/// Fully decoded audio, interleaved f32 samples
#[derive(Clone)]
pub struct AudioBuffer {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Silent buffer of the given length
    pub fn silence(seconds: f64, channels: u16, sample_rate: u32) -> Self {
        let frames = (seconds.max(0.0) * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames * channels.max(1) as usize], channels, sample_rate)
    }

    /// Get number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Get duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `position` seconds for output channel `channel`.
    ///
    /// Mono sources feed every output channel; extra source channels are dropped.
    /// Returns `None` past the end of the buffer.
    pub fn sample_at(&self, position: f64, channel: usize) -> Option<f32> {
        if position < 0.0 {
            return None;
        }
        let frame = (position * self.sample_rate as f64) as usize;
        if frame >= self.frames() {
            return None;
        }
        let source_channel = channel % self.channels as usize;
        Some(self.samples[frame * self.channels as usize + source_channel])
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("frames", &self.frames())
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Audio asset of the current playback session
///
/// Replaced wholesale whenever a new asset is loaded or received.
#[derive(Debug, Clone)]
pub struct AudioAsset {
    pub name: String,
    /// Size of the encoded file
    pub byte_size: usize,
    pub buffer: Arc<AudioBuffer>,
    pub duration_seconds: f64,
}

impl AudioAsset {
    pub fn new(name: impl Into<String>, byte_size: usize, buffer: AudioBuffer) -> Self {
        let duration_seconds = buffer.duration_seconds();
        Self {
            name: name.into(),
            byte_size,
            buffer: Arc::new(buffer),
            duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::silence(2.5, 2, 48000);
        assert_eq!(buffer.frames(), 120_000);
        assert!((buffer.duration_seconds() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_sample_at_maps_channels() {
        // two frames of mono
        let buffer = AudioBuffer::new(vec![0.25, 0.5], 1, 2);
        assert_eq!(buffer.sample_at(0.0, 0), Some(0.25));
        assert_eq!(buffer.sample_at(0.0, 1), Some(0.25));
        assert_eq!(buffer.sample_at(0.5, 1), Some(0.5));
        assert_eq!(buffer.sample_at(1.0, 0), None);
        assert_eq!(buffer.sample_at(-0.1, 0), None);
    }

    #[test]
    fn test_asset_takes_buffer_duration() {
        let asset = AudioAsset::new("tone.wav", 1234, AudioBuffer::silence(1.0, 1, 8000));
        assert_eq!(asset.byte_size, 1234);
        assert!((asset.duration_seconds - 1.0).abs() < 1e-9);
    }
}
