//! Local audio engine interface
//!
//! The coordination core never touches an output device directly; it drives an
//! [`AudioEngine`] and asks an [`AssetDecoder`] to turn received bytes into PCM.
//!
//! Engine clocks are *audio clocks*: monotonic, advanced by the output itself,
//! and anchored at creation to wall-clock epoch seconds. Nodes whose wall clocks
//! agree therefore share a time base for scheduled starts.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::audio::buffer::AudioBuffer;
use crate::error::AudioError;

/// Current wall clock as fractional seconds since the Unix epoch
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Playback/gain stage owned by the playback scheduler
pub trait AudioEngine: Send {
    /// Audio clock in seconds
    fn current_clock_time(&self) -> f64;

    /// Play `buffer` starting at `at_clock_time`, from buffer position `from_offset` seconds.
    ///
    /// Replaces whatever was playing. A start time already in the past begins
    /// immediately, advanced in the buffer by the lateness.
    fn play(&mut self, buffer: Arc<AudioBuffer>, at_clock_time: f64, from_offset: f64);

    /// Silence output immediately and forget the current buffer
    fn pause(&mut self);

    /// Output gain, 0.0 to 1.0
    fn set_gain(&mut self, level: f32);
}

/// Turns encoded asset bytes into PCM. Runs on a blocking worker thread.
pub trait AssetDecoder: Send + Sync {
    fn decode(&self, file_name: &str, bytes: &[u8]) -> Result<AudioBuffer, AudioError>;
}

/// Hand-advanced clock for the simulated engine
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn now(&self) -> f64 {
        *self.0.lock()
    }

    pub fn advance(&self, seconds: f64) {
        *self.0.lock() += seconds;
    }
}

/// A call received by the simulated engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Play { at_clock_time: f64, from_offset: f64 },
    Pause,
    Gain(f32),
}

/// Shared record of simulated engine calls
pub type EngineJournal = Arc<Mutex<Vec<EngineCall>>>;

enum ClockSource {
    Wall { anchor: f64, started: Instant },
    Manual(ManualClock),
}

/// Engine that keeps time and records calls but produces no sound
pub struct SimulatedEngine {
    clock: ClockSource,
    journal: EngineJournal,
    gain: f32,
}

impl SimulatedEngine {
    /// Engine whose clock follows real time
    pub fn new() -> Self {
        Self {
            clock: ClockSource::Wall {
                anchor: epoch_seconds(),
                started: Instant::now(),
            },
            journal: Arc::new(Mutex::new(Vec::new())),
            gain: 1.0,
        }
    }

    /// Engine whose clock only moves when the returned handle says so
    pub fn with_manual_clock(start: f64) -> (Self, ManualClock) {
        let clock = ManualClock(Arc::new(Mutex::new(start)));
        let engine = Self {
            clock: ClockSource::Manual(clock.clone()),
            journal: Arc::new(Mutex::new(Vec::new())),
            gain: 1.0,
        };
        (engine, clock)
    }

    pub fn journal(&self) -> EngineJournal {
        self.journal.clone()
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for SimulatedEngine {
    fn current_clock_time(&self) -> f64 {
        match &self.clock {
            ClockSource::Wall { anchor, started } => anchor + started.elapsed().as_secs_f64(),
            ClockSource::Manual(clock) => clock.now(),
        }
    }

    fn play(&mut self, buffer: Arc<AudioBuffer>, at_clock_time: f64, from_offset: f64) {
        tracing::debug!(
            at_clock_time,
            from_offset,
            duration = buffer.duration_seconds(),
            "Simulated output start"
        );
        self.journal.lock().push(EngineCall::Play {
            at_clock_time,
            from_offset,
        });
    }

    fn pause(&mut self) {
        self.journal.lock().push(EngineCall::Pause);
    }

    fn set_gain(&mut self, level: f32) {
        self.gain = level;
        self.journal.lock().push(EngineCall::Gain(level));
    }
}
