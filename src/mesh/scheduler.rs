//! Playback scheduler
//!
//! Turns `play` / `pause` / `stop` / `volume` into calls on the local audio
//! engine so that every node starts the same buffer at the same audio-clock
//! time.
//!
//! ```text
//!            play (future start)          timer fires
//!  Stopped ───────────────────► Scheduled ───────────► Playing
//!     ▲   play (start passed)                            │
//!     │ └────────────────────────────────────────────────┤
//!     │ stop / end of asset                        pause │
//!     └──────────────────── Paused ◄────────────────────┘
//!                             │ play (resume) ──► Scheduled / Playing
//! ```
//!
//! A start that is still in the future becomes a [`ScheduledStart`] the event
//! loop arms as a cancellable deferred task. Any later command supersedes it:
//! the pending start is dropped here and a stale timer firing is ignored by
//! generation.

use serde::Serialize;
use std::time::Duration;

use crate::audio::buffer::AudioAsset;
use crate::audio::engine::AudioEngine;
use crate::error::MeshError;
use crate::protocol::MeshMessage;

/// Scheduler phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    #[default]
    Stopped,
    Scheduled,
    Playing,
    Paused,
}

/// Playback state as other nodes would describe it
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    /// Local audio clock time at which the current run (re)started
    pub start_audio_clock_time: f64,
    /// Resume position; meaningful only while not playing
    pub paused_at_offset: f64,
}

/// Delay and buffer position for realizing a `play` command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartTiming {
    /// Seconds to wait before starting, never negative
    pub delay: f64,
    /// Buffer position to start from, never below the commanded offset
    pub effective_offset: f64,
}

/// Timing for `play{start_time, offset}` received at local clock `now`.
///
/// A command that arrives after its start time starts at once and skips
/// ahead in the buffer by the lateness instead of starting late.
pub fn compute_start(start_time: f64, offset: f64, now: f64) -> StartTiming {
    StartTiming {
        delay: (start_time - now).max(0.0),
        effective_offset: offset + (now - start_time).max(0.0),
    }
}

/// Deferred start the event loop must arm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledStart {
    pub generation: u64,
    pub delay: Duration,
}

/// Result of a leader-originated play
#[derive(Debug, Clone, PartialEq)]
pub struct PlayPlan {
    /// Command to broadcast
    pub message: MeshMessage,
    pub scheduled: Option<ScheduledStart>,
}

#[derive(Debug, Clone, Copy)]
struct PendingStart {
    generation: u64,
    start_time: f64,
    offset: f64,
}

/// Status view of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub phase: PlaybackPhase,
    pub state: PlaybackState,
    pub position: f64,
    pub asset: Option<String>,
    pub duration: Option<f64>,
    pub volume: f32,
}

/// Owns playback state and the engine's playback/gain stage
#[derive(Debug)]
pub struct PlaybackScheduler {
    asset: Option<AudioAsset>,
    phase: PlaybackPhase,
    state: PlaybackState,
    /// Buffer position at `state.start_audio_clock_time` while playing
    start_offset: f64,
    pending: Option<PendingStart>,
    generation: u64,
    volume: f32,
}

impl PlaybackScheduler {
    pub fn new(volume: f32) -> Self {
        Self {
            asset: None,
            phase: PlaybackPhase::Stopped,
            state: PlaybackState::default(),
            start_offset: 0.0,
            pending: None,
            generation: 0,
            volume: volume.clamp(0.0, 1.0),
        }
    }

    pub fn asset(&self) -> Option<&AudioAsset> {
        self.asset.as_ref()
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Replace the asset wholesale; any playback stops and the position resets
    pub fn load_asset(&mut self, engine: &mut dyn AudioEngine, asset: AudioAsset) {
        self.halt(engine);
        tracing::info!(
            name = %asset.name,
            bytes = asset.byte_size,
            duration = asset.duration_seconds,
            "Audio asset ready"
        );
        self.asset = Some(asset);
        self.reset_to_stopped();
    }

    /// Drop the asset, stopping playback
    pub fn clear_asset(&mut self, engine: &mut dyn AudioEngine) {
        self.halt(engine);
        self.asset = None;
        self.reset_to_stopped();
    }

    /// Leader-initiated play from the stored pause position.
    ///
    /// Returns `Ok(None)` when already playing or scheduled.
    pub fn leader_play(
        &mut self,
        engine: &mut dyn AudioEngine,
        lead_seconds: f64,
    ) -> Result<Option<PlayPlan>, MeshError> {
        if self.asset.is_none() {
            return Err(MeshError::NoAsset);
        }
        if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Scheduled) {
            return Ok(None);
        }

        let start_time = engine.current_clock_time() + lead_seconds.max(0.0);
        let offset = self.state.paused_at_offset;
        let scheduled = self.realize_play(engine, start_time, offset)?;

        Ok(Some(PlayPlan {
            message: MeshMessage::Play { start_time, offset },
            scheduled,
        }))
    }

    /// Realize `play{start_time, offset}` against the local engine.
    ///
    /// Supersedes whatever is playing or pending. Fails with
    /// [`MeshError::NoAsset`] when there is nothing to play, and with
    /// [`MeshError::Unschedulable`] when the start cannot be timed. Either
    /// way the command is dropped and current playback is left alone.
    pub fn realize_play(
        &mut self,
        engine: &mut dyn AudioEngine,
        start_time: f64,
        offset: f64,
    ) -> Result<Option<ScheduledStart>, MeshError> {
        let buffer = match &self.asset {
            Some(asset) => asset.buffer.clone(),
            None => return Err(MeshError::NoAsset),
        };

        if !start_time.is_finite() || !offset.is_finite() {
            return Err(MeshError::Unschedulable(format!(
                "start {} offset {}",
                start_time, offset
            )));
        }

        let now = engine.current_clock_time();
        let timing = compute_start(start_time, offset.max(0.0), now);
        let delay = Duration::try_from_secs_f64(timing.delay.max(0.0)).map_err(|_| {
            MeshError::Unschedulable(format!("start {} is {:.0}s away", start_time, timing.delay))
        })?;

        self.halt(engine);

        if timing.delay <= 0.0 {
            engine.play(buffer, now, timing.effective_offset);
            engine.set_gain(self.volume);
            self.start_offset = timing.effective_offset;
            self.state = PlaybackState {
                is_playing: true,
                start_audio_clock_time: now,
                paused_at_offset: 0.0,
            };
            self.phase = PlaybackPhase::Playing;
            tracing::debug!(offset = timing.effective_offset, "Playback started immediately");
            return Ok(None);
        }

        self.generation += 1;
        self.pending = Some(PendingStart {
            generation: self.generation,
            start_time,
            offset: timing.effective_offset,
        });
        self.state = PlaybackState {
            is_playing: true,
            start_audio_clock_time: start_time,
            paused_at_offset: 0.0,
        };
        self.phase = PlaybackPhase::Scheduled;
        tracing::debug!(
            delay = timing.delay,
            offset = timing.effective_offset,
            "Playback scheduled"
        );

        Ok(Some(ScheduledStart {
            generation: self.generation,
            delay,
        }))
    }

    /// Deferred start fired. Returns `false` for a superseded start.
    pub fn fire_scheduled(&mut self, engine: &mut dyn AudioEngine, generation: u64) -> bool {
        let pending = match self.pending {
            Some(pending) if pending.generation == generation => pending,
            _ => return false,
        };
        self.pending = None;

        let Some(asset) = &self.asset else {
            self.reset_to_stopped();
            return false;
        };

        // The engine catches up if the timer fired after the start time
        engine.play(asset.buffer.clone(), pending.start_time, pending.offset);
        engine.set_gain(self.volume);
        self.start_offset = pending.offset;
        self.state.start_audio_clock_time = pending.start_time;
        self.phase = PlaybackPhase::Playing;
        true
    }

    /// Stop now and remember the elapsed position. Returns whether anything changed.
    pub fn pause(&mut self, engine: &mut dyn AudioEngine) -> bool {
        if !matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Scheduled) {
            return false;
        }

        let position = self.position(engine.current_clock_time());
        self.halt(engine);
        self.state = PlaybackState {
            is_playing: false,
            start_audio_clock_time: self.state.start_audio_clock_time,
            paused_at_offset: position,
        };
        self.phase = PlaybackPhase::Paused;
        tracing::debug!(position, "Playback paused");
        true
    }

    /// Stop now and rewind to zero. Returns whether anything changed.
    pub fn stop(&mut self, engine: &mut dyn AudioEngine) -> bool {
        if self.phase == PlaybackPhase::Stopped && self.state.paused_at_offset == 0.0 {
            return false;
        }
        self.halt(engine);
        self.reset_to_stopped();
        tracing::debug!("Playback stopped");
        true
    }

    /// Apply an output gain, clamped to 0.0..=1.0
    pub fn set_volume(&mut self, engine: &mut dyn AudioEngine, level: f32) -> f32 {
        let level = if level.is_nan() { self.volume } else { level.clamp(0.0, 1.0) };
        self.volume = level;
        engine.set_gain(level);
        level
    }

    /// Transition to Stopped once playback has run past the end of the asset
    pub fn poll_finished(&mut self, engine: &mut dyn AudioEngine) -> bool {
        if self.phase != PlaybackPhase::Playing {
            return false;
        }
        let Some(duration) = self.asset.as_ref().map(|a| a.duration_seconds) else {
            return false;
        };
        if self.position(engine.current_clock_time()) < duration {
            return false;
        }

        tracing::info!("Reached end of asset");
        engine.pause();
        self.reset_to_stopped();
        true
    }

    /// Buffer position at local clock `now`
    pub fn position(&self, now: f64) -> f64 {
        let raw = match self.phase {
            PlaybackPhase::Playing => {
                self.start_offset + (now - self.state.start_audio_clock_time).max(0.0)
            }
            PlaybackPhase::Scheduled => match self.pending {
                Some(p) => p.offset + (now - p.start_time).max(0.0),
                None => self.state.paused_at_offset,
            },
            PlaybackPhase::Paused | PlaybackPhase::Stopped => self.state.paused_at_offset,
        };
        match &self.asset {
            Some(asset) => raw.min(asset.duration_seconds),
            None => raw,
        }
    }

    /// Generation of the pending start, if any
    pub fn pending_generation(&self) -> Option<u64> {
        self.pending.map(|p| p.generation)
    }

    pub fn snapshot(&self, now: f64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            phase: self.phase,
            state: self.state,
            position: self.position(now),
            asset: self.asset.as_ref().map(|a| a.name.clone()),
            duration: self.asset.as_ref().map(|a| a.duration_seconds),
            volume: self.volume,
        }
    }

    /// Cancel any pending start and silence the engine if it may be sounding
    fn halt(&mut self, engine: &mut dyn AudioEngine) {
        self.pending = None;
        if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Scheduled) {
            engine.pause();
        }
    }

    fn reset_to_stopped(&mut self) {
        self.pending = None;
        self.start_offset = 0.0;
        self.state = PlaybackState::default();
        self.phase = PlaybackPhase::Stopped;
    }
}
