//! Clock sync prober
//!
//! Round-trip latency probes. A `ping` carries the sender's wall clock in
//! milliseconds and the reply echoes it untouched, so the initiator measures
//! the full round trip with its own clock. The round trip is used as-is as the
//! delay estimate; overestimating only pushes a scheduled start later.

use serde::Serialize;
use std::collections::HashMap;

use crate::audio::engine::epoch_seconds;
use crate::constants::{EXCELLENT_LATENCY_MS, GOOD_LATENCY_MS};
use crate::protocol::MeshMessage;

/// Current wall clock in milliseconds
pub fn wall_clock_ms() -> f64 {
    epoch_seconds() * 1000.0
}

/// Link quality class derived from latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncQuality {
    Excellent,
    Good,
    Fair,
    #[default]
    Unknown,
}

/// Classify a latency sample. No hysteresis.
pub fn classify(latency_ms: f64) -> SyncQuality {
    if latency_ms.is_nan() {
        SyncQuality::Unknown
    } else if latency_ms < EXCELLENT_LATENCY_MS {
        SyncQuality::Excellent
    } else if latency_ms < GOOD_LATENCY_MS {
        SyncQuality::Good
    } else {
        SyncQuality::Fair
    }
}

/// Latest probe result
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SyncMetrics {
    pub latest_latency_ms: f64,
    pub quality: SyncQuality,
}

impl SyncMetrics {
    pub fn from_latency(latency_ms: f64) -> Self {
        Self {
            latest_latency_ms: latency_ms,
            quality: classify(latency_ms),
        }
    }
}

/// One peer's latest sample and where it came from
#[derive(Debug, Clone, Copy)]
struct PeerSample {
    metrics: SyncMetrics,
    /// Measured with our own clock at both ends, not across two clocks
    round_trip: bool,
}

/// Per-peer and node-wide latency bookkeeping
///
/// A probe that never comes back leaves the previous value in place; the
/// peer's entry goes away when its connection does. Handshake estimates are
/// shown per peer until the first round trip, but never feed the node-level
/// metrics or the adaptive lead: clock skew between the two nodes would
/// masquerade as latency.
#[derive(Debug, Default)]
pub struct ClockSyncProber {
    peers: HashMap<String, PeerSample>,
    latest: SyncMetrics,
    probes_sent: u64,
}

impl ClockSyncProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next probe
    pub fn ping(&mut self, now_ms: f64) -> MeshMessage {
        self.probes_sent += 1;
        MeshMessage::Ping { timestamp: now_ms }
    }

    /// Reply to a probe, echoing its timestamp
    pub fn reply(timestamp: f64) -> MeshMessage {
        MeshMessage::Pong { timestamp }
    }

    /// Record a completed round trip from `peer`
    pub fn record_pong(&mut self, peer: &str, timestamp: f64, now_ms: f64) -> SyncMetrics {
        let metrics = SyncMetrics::from_latency((now_ms - timestamp).max(0.0));
        self.peers.insert(
            peer.to_string(),
            PeerSample {
                metrics,
                round_trip: true,
            },
        );
        self.latest = metrics;

        tracing::debug!(
            peer = %peer,
            latency_ms = metrics.latest_latency_ms,
            quality = ?metrics.quality,
            "Latency sample"
        );
        metrics
    }

    /// Record the one-shot estimate taken from a handshake timestamp.
    ///
    /// Uses the remote's wall clock, so it is only as good as clock agreement.
    /// Kept as the peer's figure until a round trip replaces it; an existing
    /// round-trip sample is not overwritten.
    pub fn record_handshake(&mut self, peer: &str, timestamp: f64, now_ms: f64) -> SyncMetrics {
        if let Some(sample) = self.peers.get(peer).filter(|s| s.round_trip) {
            return sample.metrics;
        }

        let metrics = SyncMetrics::from_latency((now_ms - timestamp).max(0.0));
        self.peers.insert(
            peer.to_string(),
            PeerSample {
                metrics,
                round_trip: false,
            },
        );
        tracing::debug!(peer = %peer, latency_ms = metrics.latest_latency_ms, "Handshake estimate");
        metrics
    }

    /// Drop a departed peer's metrics
    pub fn forget(&mut self, peer: &str) {
        self.peers.remove(peer);
    }

    /// Node-level metrics: the most recent round trip to any peer
    pub fn latest(&self) -> SyncMetrics {
        self.latest
    }

    pub fn peer(&self, peer: &str) -> Option<SyncMetrics> {
        self.peers.get(peer).map(|sample| sample.metrics)
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    /// Highest latest round-trip latency across connected peers
    pub fn worst_latency_ms(&self) -> Option<f64> {
        self.peers
            .values()
            .filter(|sample| sample.round_trip)
            .map(|sample| sample.metrics.latest_latency_ms)
            .fold(None, |worst, l| Some(worst.map_or(l, |w: f64| w.max(l))))
    }

    /// Lead to use for a scheduled start; never below `fixed_seconds`
    pub fn lead_seconds(&self, fixed_seconds: f64, adaptive: bool) -> f64 {
        if !adaptive {
            return fixed_seconds;
        }
        match self.worst_latency_ms() {
            Some(worst) => fixed_seconds.max(worst / 1000.0),
            None => fixed_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(classify(19.0), SyncQuality::Excellent);
        assert_eq!(classify(20.0), SyncQuality::Good);
        assert_eq!(classify(49.0), SyncQuality::Good);
        assert_eq!(classify(50.0), SyncQuality::Fair);
        assert_eq!(classify(f64::NAN), SyncQuality::Unknown);
    }

    #[test]
    fn test_pong_overwrites_previous_sample() {
        let mut prober = ClockSyncProber::new();
        let ping = prober.ping(1000.0);
        let timestamp = match ping {
            MeshMessage::Ping { timestamp } => timestamp,
            other => panic!("unexpected probe: {:?}", other),
        };

        let first = prober.record_pong("a", timestamp, 1060.0);
        assert_eq!(first.quality, SyncQuality::Fair);

        let second = prober.record_pong("a", 2000.0, 2005.0);
        assert_eq!(second, SyncMetrics::from_latency(5.0));
        assert_eq!(prober.peer("a"), Some(second));
        assert_eq!(prober.latest(), second);
        assert_eq!(prober.probes_sent(), 1);
    }

    #[test]
    fn test_reply_echoes_timestamp() {
        assert_eq!(
            ClockSyncProber::reply(1234.5),
            MeshMessage::Pong { timestamp: 1234.5 }
        );
    }

    #[test]
    fn test_handshake_estimate_never_negative() {
        let mut prober = ClockSyncProber::new();
        // remote clock ahead of ours
        let metrics = prober.record_handshake("a", 5000.0, 4990.0);
        assert_eq!(metrics.latest_latency_ms, 0.0);
        assert_eq!(metrics.quality, SyncQuality::Excellent);
    }

    #[test]
    fn test_lead_stretches_to_worst_peer() {
        let mut prober = ClockSyncProber::new();
        assert_eq!(prober.lead_seconds(0.15, true), 0.15);

        prober.record_pong("a", 0.0, 40.0);
        prober.record_pong("b", 0.0, 320.0);
        assert_eq!(prober.worst_latency_ms(), Some(320.0));
        assert!((prober.lead_seconds(0.15, true) - 0.32).abs() < 1e-12);
        assert_eq!(prober.lead_seconds(0.15, false), 0.15);

        prober.forget("b");
        assert_eq!(prober.lead_seconds(0.15, true), 0.15);
    }

    #[test]
    fn test_skewed_handshake_does_not_stretch_lead() {
        let mut prober = ClockSyncProber::new();
        // remote clock five seconds behind ours
        prober.record_handshake("a", 10_000.0, 15_000.0);

        assert_eq!(prober.peer("a").unwrap().latest_latency_ms, 5000.0);
        assert_eq!(prober.worst_latency_ms(), None);
        assert_eq!(prober.lead_seconds(0.15, true), 0.15);
        assert_eq!(prober.latest(), SyncMetrics::default());

        prober.record_pong("a", 20_000.0, 20_200.0);
        assert!((prober.lead_seconds(0.15, true) - 0.2).abs() < 1e-12);
        assert_eq!(prober.latest().latest_latency_ms, 200.0);

        // a later handshake (role change) keeps the measured figure
        prober.record_handshake("a", 30_000.0, 35_000.0);
        assert_eq!(prober.peer("a").unwrap().latest_latency_ms, 200.0);
    }

    proptest! {
        #[test]
        fn test_classification_is_monotonic(a in 0.0f64..500.0, b in 0.0f64..500.0) {
            let rank = |q: SyncQuality| match q {
                SyncQuality::Excellent => 0,
                SyncQuality::Good => 1,
                SyncQuality::Fair => 2,
                SyncQuality::Unknown => 3,
            };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(classify(lo)) <= rank(classify(hi)));
        }
    }
}
