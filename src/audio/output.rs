//! Audio output through cpal
//!
//! The output stream lives on its own thread (cpal streams are not `Send`).
//! The render callback owns the audio clock: it counts frames handed to the
//! device and starts the current buffer exactly on the frame whose clock time
//! reaches the scheduled start.
//!
//! The frame count alone drifts from the wall clock with the device's crystal.
//! Every callback compares the clock with the wall-clock instant its first
//! frame will be heard (from the callback's playback timestamp) and slews the
//! anchor toward it. The first callback sets the anchor outright, so buffer
//! pre-fill does not offset the clock.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::AudioBuffer;
use crate::audio::device::find_output_device;
use crate::audio::engine::{epoch_seconds, AudioEngine};
use crate::constants::{CLOCK_RESYNC_SECONDS, CLOCK_SLEW_FACTOR};
use crate::error::AudioError;

/// What the render callback is playing
#[derive(Default)]
struct Voice {
    buffer: Option<Arc<AudioBuffer>>,
    /// Clock time of buffer position `offset`
    start_clock: f64,
    offset: f64,
}

/// State shared between the engine handle and the render callback
struct Shared {
    voice: Mutex<Voice>,
    frames_rendered: AtomicU64,
    gain_bits: AtomicU32,
    sample_rate: u32,
    channels: u16,
    /// Epoch seconds at frame zero, as f64 bits
    anchor_bits: AtomicU64,
}

impl Shared {
    fn anchor(&self) -> f64 {
        f64::from_bits(self.anchor_bits.load(Ordering::Relaxed))
    }

    fn clock_at(&self, frame: u64) -> f64 {
        self.anchor() + frame as f64 / self.sample_rate as f64
    }

    /// Pull the clock toward `heard_at`, the epoch time at which the next
    /// frame reaches the speaker
    fn discipline(&self, heard_at: f64) {
        let frame = self.frames_rendered.load(Ordering::Relaxed);
        let anchor = if frame == 0 {
            heard_at
        } else {
            let error = heard_at - self.clock_at(frame);
            if error.abs() > CLOCK_RESYNC_SECONDS {
                // Stream stalled or skipped; trust the timestamp
                self.anchor() + error
            } else {
                self.anchor() + error * CLOCK_SLEW_FACTOR
            }
        };
        if anchor.is_finite() {
            self.anchor_bits.store(anchor.to_bits(), Ordering::Relaxed);
        }
    }

    fn render(&self, data: &mut [f32]) {
        let channels = self.channels as usize;
        let first = self.frames_rendered.load(Ordering::Relaxed);
        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));

        // Never block the audio thread; a contended lock costs one silent period
        let Some(mut voice) = self.voice.try_lock() else {
            data.fill(0.0);
            self.frames_rendered
                .fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
            return;
        };

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            frame.fill(0.0);
            let Some(buffer) = voice.buffer.as_ref() else {
                continue;
            };

            let t = self.clock_at(first + i as u64);
            if t < voice.start_clock {
                continue;
            }

            let position = voice.offset + (t - voice.start_clock);
            if position >= buffer.duration_seconds() {
                voice.buffer = None;
                continue;
            }
            for (channel, sample) in frame.iter_mut().enumerate() {
                *sample = buffer.sample_at(position, channel).unwrap_or(0.0) * gain;
            }
        }

        self.frames_rendered
            .fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
    }
}

/// Audio engine backed by a cpal output device
pub struct DeviceEngine {
    shared: Arc<Shared>,

    /// Whether the stream thread should keep running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Receiver<AudioError>,

    device_name: String,
}

impl DeviceEngine {
    /// Open `device_name` (default output when `None`) and start the output stream
    pub fn open(device_name: Option<&str>) -> Result<Self, AudioError> {
        let device = find_output_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Shared {
            voice: Mutex::new(Voice::default()),
            frames_rendered: AtomicU64::new(0),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            sample_rate: config.sample_rate.0,
            channels: config.channels.max(1),
            anchor_bits: AtomicU64::new(epoch_seconds().to_bits()),
        });

        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_loop = running.clone();
        let shared_cb = shared.clone();

        let handle = thread::Builder::new()
            .name("mesh-output".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                        let stamp = info.timestamp();
                        let latency = stamp
                            .playback
                            .duration_since(&stamp.callback)
                            .map_or(0.0, |d| d.as_secs_f64());
                        shared_cb.discipline(epoch_seconds() + latency);
                        shared_cb.render(data);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::CpalError(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(std::time::Duration::from_millis(20));
                }

                // Stream is dropped here, stopping output
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("output thread exited".to_string()));
            }
        }

        tracing::info!(
            device = %name,
            sample_rate = shared.sample_rate,
            channels = shared.channels,
            "Audio output started"
        );

        Ok(Self {
            shared,
            running,
            thread_handle: Some(handle),
            error_rx,
            device_name: name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Check for stream errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    /// Stop the output stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioEngine for DeviceEngine {
    fn current_clock_time(&self) -> f64 {
        self.shared
            .clock_at(self.shared.frames_rendered.load(Ordering::Relaxed))
    }

    fn play(&mut self, buffer: Arc<AudioBuffer>, at_clock_time: f64, from_offset: f64) {
        while let Some(e) = self.check_errors() {
            tracing::error!("Output stream error: {}", e);
        }

        let mut voice = self.shared.voice.lock();
        voice.buffer = Some(buffer);
        voice.start_clock = at_clock_time;
        voice.offset = from_offset.max(0.0);
    }

    fn pause(&mut self) {
        self.shared.voice.lock().buffer = None;
    }

    fn set_gain(&mut self, level: f32) {
        self.shared
            .gain_bits
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Drop for DeviceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(sample_rate: u32, channels: u16) -> Shared {
        Shared {
            voice: Mutex::new(Voice::default()),
            frames_rendered: AtomicU64::new(0),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            sample_rate,
            channels,
            anchor_bits: AtomicU64::new(100.0f64.to_bits()),
        }
    }

    #[test]
    fn test_render_waits_for_start_frame() {
        let shared = shared(4, 1);
        {
            let mut voice = shared.voice.lock();
            voice.buffer = Some(Arc::new(AudioBuffer::new(vec![0.5; 8], 1, 4)));
            // Start two frames in
            voice.start_clock = 100.5;
            voice.offset = 0.0;
        }

        let mut out = [9.0f32; 4];
        shared.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.5, 0.5]);
        assert_eq!(shared.frames_rendered.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_render_catches_up_on_late_start() {
        let shared = shared(4, 1);
        {
            let mut voice = shared.voice.lock();
            // Frame values encode their index
            voice.buffer = Some(Arc::new(AudioBuffer::new(
                (0..8).map(|i| i as f32).collect(),
                1,
                4,
            )));
            // Started one second before the first rendered frame
            voice.start_clock = 99.0;
            voice.offset = 0.0;
        }

        let mut out = [0.0f32; 2];
        shared.render(&mut out);
        assert_eq!(out, [4.0, 5.0]);
    }

    #[test]
    fn test_render_applies_gain_and_finishes() {
        let shared = shared(2, 2);
        shared.gain_bits.store(0.5f32.to_bits(), Ordering::Relaxed);
        {
            let mut voice = shared.voice.lock();
            voice.buffer = Some(Arc::new(AudioBuffer::new(vec![1.0], 1, 2)));
            voice.start_clock = 100.0;
        }

        let mut out = [0.0f32; 4];
        shared.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        assert!(shared.voice.lock().buffer.is_none());
    }

    #[test]
    fn test_first_callback_sets_anchor() {
        let shared = shared(4, 1);
        shared.discipline(250.0);
        assert_eq!(shared.clock_at(0), 250.0);
    }

    #[test]
    fn test_small_clock_error_is_slewed() {
        let shared = shared(4, 1);
        let mut out = [0.0f32; 4];
        shared.render(&mut out);
        assert_eq!(shared.clock_at(4), 101.0);

        // Device running 10 ms slow against the wall clock
        shared.discipline(101.01);
        let anchor = shared.anchor();
        assert!(anchor > 100.0 && anchor < 100.01);
        assert!((anchor - (100.0 + 0.01 * CLOCK_SLEW_FACTOR)).abs() < 1e-12);
    }

    #[test]
    fn test_large_clock_error_resyncs() {
        let shared = shared(4, 1);
        let mut out = [0.0f32; 4];
        shared.render(&mut out);

        shared.discipline(103.0);
        assert!((shared.clock_at(4) - 103.0).abs() < 1e-12);

        shared.discipline(f64::NAN);
        assert!((shared.clock_at(4) - 103.0).abs() < 1e-12);
    }
}
