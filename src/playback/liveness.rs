//! Liveness detection
//!
//! No single decoder signal says "the picture stopped moving", so each
//! detection cycle runs four independent strategies over the sampled sink
//! state and reports the first one that fires:
//!
//! 1. no progress while playing: no liveness event for `freeze_threshold`
//! 2. stuck clock: play position has not moved over `stuck_clock_window`
//! 3. stall: readiness stuck at metadata/current-data for `stall_threshold`
//! 4. buffer exhaustion: buffered horizon nearly consumed and no data arriving
//!
//! Event-based signals keep firing on metadata-only traffic and clock-based
//! signals misfire during buffering; running all of them trades a few false
//! positives for far fewer silently frozen tiles.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::media::{PlaybackSnapshot, ReadyState};
use crate::config::PlaybackConfig;

/// Coarse class of an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyClass {
    /// Picture stopped while the session should be playing
    Freeze,
    /// Playback never reached a playable state
    Stall,
}

/// Anomaly raised by a detection cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    NoProgress { silent_ms: u64 },
    StuckClock { position: f64, window_ms: u64 },
    Stall { buffering_ms: u64 },
    BufferExhausted { headroom: f64, silent_ms: u64 },
}

impl Anomaly {
    pub fn class(&self) -> AnomalyClass {
        match self {
            Anomaly::Stall { .. } => AnomalyClass::Stall,
            _ => AnomalyClass::Freeze,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PositionSample {
    position: f64,
    observed_at: Instant,
}

/// Per-session liveness state
#[derive(Debug, Clone)]
pub struct LivenessDetector {
    freeze_threshold: Duration,
    stuck_clock_window: Duration,
    stuck_clock_min_advance: f64,
    stall_threshold: Duration,
    buffer_horizon: f64,
    buffer_silence: Duration,

    last_liveness: Instant,
    attached_at: Instant,
    position: Option<PositionSample>,
    buffering_since: Option<Instant>,
    had_data: bool,
}

impl LivenessDetector {
    pub fn new(config: &PlaybackConfig, now: Instant) -> Self {
        Self {
            freeze_threshold: config.freeze_threshold(),
            stuck_clock_window: config.stuck_clock_window(),
            stuck_clock_min_advance: config.stuck_clock_min_advance,
            stall_threshold: config.stall_threshold(),
            buffer_horizon: config.buffer_exhaustion_horizon,
            buffer_silence: config.buffer_exhaustion_silence(),
            last_liveness: now,
            attached_at: now,
            position: None,
            buffering_since: None,
            had_data: false,
        }
    }

    /// Start over for a freshly loaded source
    pub fn reset(&mut self, now: Instant) {
        self.last_liveness = now;
        self.on_attach(now);
    }

    /// A new attachment replaced the old one; liveness history is kept
    pub fn on_attach(&mut self, now: Instant) {
        self.attached_at = now;
        self.position = None;
        self.buffering_since = None;
        self.had_data = false;
    }

    pub fn record_liveness(&mut self, now: Instant) {
        self.last_liveness = now;
    }

    /// The sink reported `playing`, so enough data was available at least once
    pub fn mark_playing(&mut self) {
        self.had_data = true;
    }

    pub fn last_liveness(&self) -> Instant {
        self.last_liveness
    }

    /// Time without any signal, counting a fresh attachment as a signal
    fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_liveness.max(self.attached_at))
    }

    /// Run one detection cycle
    pub fn evaluate(&mut self, snapshot: &PlaybackSnapshot, now: Instant) -> Option<Anomaly> {
        if snapshot.ready_state >= ReadyState::HaveFutureData {
            self.had_data = true;
        }

        let active = !snapshot.paused && !snapshot.ended;
        let playing = active && self.had_data;
        let silence = self.silence(now);

        let stuck_for = self.track_position(snapshot, playing, now);

        if active && snapshot.ready_state.is_buffering() {
            self.buffering_since.get_or_insert(now);
        } else {
            self.buffering_since = None;
        }

        if playing && silence > self.freeze_threshold {
            return Some(Anomaly::NoProgress {
                silent_ms: millis(silence),
            });
        }

        if let Some(window) = stuck_for {
            return Some(Anomaly::StuckClock {
                position: snapshot.position,
                window_ms: millis(window),
            });
        }

        if let Some(since) = self.buffering_since {
            let buffering = now.saturating_duration_since(since);
            if buffering > self.stall_threshold {
                return Some(Anomaly::Stall {
                    buffering_ms: millis(buffering),
                });
            }
        }

        if playing && silence > self.buffer_silence {
            if let Some(end) = snapshot.buffered_end {
                let headroom = end - snapshot.position;
                if headroom <= self.buffer_horizon {
                    return Some(Anomaly::BufferExhausted {
                        headroom,
                        silent_ms: millis(silence),
                    });
                }
            }
        }

        None
    }

    /// Update the play-position trace; returns the observation window when
    /// the clock has not moved for at least `stuck_clock_window`.
    fn track_position(
        &mut self,
        snapshot: &PlaybackSnapshot,
        playing: bool,
        now: Instant,
    ) -> Option<Duration> {
        if !playing || snapshot.ready_state < ReadyState::HaveFutureData {
            self.position = None;
            return None;
        }

        let fresh = PositionSample {
            position: snapshot.position,
            observed_at: now,
        };

        match self.position {
            Some(sample)
                if (snapshot.position - sample.position).abs() <= self.stuck_clock_min_advance =>
            {
                let window = now.saturating_duration_since(sample.observed_at);
                (window >= self.stuck_clock_window).then_some(window)
            }
            _ => {
                self.position = Some(fresh);
                None
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(now: Instant) -> LivenessDetector {
        LivenessDetector::new(&PlaybackConfig::default(), now)
    }

    fn playing(position: f64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            paused: false,
            ended: false,
            ready_state: ReadyState::HaveEnoughData,
            position,
            buffered_end: Some(position + 10.0),
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_healthy_playback() {
        let t0 = Instant::now();
        let mut d = detector(t0);

        for i in 1..=10u64 {
            let now = t0 + secs(3 * i);
            d.record_liveness(now);
            assert_eq!(d.evaluate(&playing(3.0 * i as f64), now), None);
        }
    }

    #[test]
    fn test_no_progress_while_playing() {
        let t0 = Instant::now();
        let mut d = detector(t0);

        assert_eq!(d.evaluate(&playing(0.0), t0 + secs(3)), None);
        // Position keeps moving, so only the liveness signal can catch this
        assert_eq!(d.evaluate(&playing(3.0), t0 + secs(6)), None);
        let anomaly = d.evaluate(&playing(6.0), t0 + secs(9)).unwrap();
        assert_eq!(anomaly, Anomaly::NoProgress { silent_ms: 9_000 });
        assert_eq!(anomaly.class(), AnomalyClass::Freeze);
    }

    #[test]
    fn test_paused_is_not_frozen() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        let paused = PlaybackSnapshot {
            paused: true,
            ..playing(1.0)
        };

        assert_eq!(d.evaluate(&paused, t0 + secs(20)), None);
    }

    #[test]
    fn test_stuck_clock_with_live_events() {
        let t0 = Instant::now();
        let mut d = detector(t0);

        d.record_liveness(t0 + secs(3));
        assert_eq!(d.evaluate(&playing(12.0), t0 + secs(3)), None);
        d.record_liveness(t0 + secs(6));
        assert_eq!(d.evaluate(&playing(12.05), t0 + secs(6)), None);
        d.record_liveness(t0 + secs(9));
        let anomaly = d.evaluate(&playing(12.05), t0 + secs(9)).unwrap();
        assert!(matches!(anomaly, Anomaly::StuckClock { window_ms: 6_000, .. }));
    }

    #[test]
    fn test_clock_advancing_resets_trace() {
        let t0 = Instant::now();
        let mut d = detector(t0);

        d.record_liveness(t0 + secs(3));
        assert_eq!(d.evaluate(&playing(1.0), t0 + secs(3)), None);
        d.record_liveness(t0 + secs(6));
        assert_eq!(d.evaluate(&playing(1.05), t0 + secs(6)), None);
        d.record_liveness(t0 + secs(9));
        assert_eq!(d.evaluate(&playing(1.5), t0 + secs(9)), None);
        d.record_liveness(t0 + secs(12));
        assert_eq!(d.evaluate(&playing(1.55), t0 + secs(12)), None);
    }

    #[test]
    fn test_low_readiness_stall() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        let buffering = PlaybackSnapshot {
            paused: false,
            ended: false,
            ready_state: ReadyState::HaveMetadata,
            position: 0.0,
            buffered_end: None,
        };

        for i in 1..=3u64 {
            let now = t0 + secs(3 * i);
            d.record_liveness(now);
            assert_eq!(d.evaluate(&buffering, now), None);
        }
        // Buffering since t=3s; 12s later it is a stall
        d.record_liveness(t0 + secs(15));
        let anomaly = d.evaluate(&buffering, t0 + secs(15)).unwrap();
        assert_eq!(anomaly, Anomaly::Stall { buffering_ms: 12_000 });
        assert_eq!(anomaly.class(), AnomalyClass::Stall);
    }

    #[test]
    fn test_buffer_exhaustion() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.mark_playing();

        let draining = |position: f64| PlaybackSnapshot {
            ready_state: ReadyState::HaveCurrentData,
            buffered_end: Some(position + 0.5),
            ..playing(position)
        };

        assert_eq!(d.evaluate(&draining(1.0), t0 + secs(3)), None);
        let anomaly = d.evaluate(&draining(4.0), t0 + secs(6)).unwrap();
        assert!(matches!(anomaly, Anomaly::BufferExhausted { silent_ms: 6_000, .. }));
    }

    #[test]
    fn test_buffer_horizon_boundary() {
        let t0 = Instant::now();
        let with_headroom = |headroom: f64| PlaybackSnapshot {
            ready_state: ReadyState::HaveCurrentData,
            buffered_end: Some(4.0 + headroom),
            ..playing(4.0)
        };

        let mut d = detector(t0);
        d.mark_playing();
        assert!(matches!(
            d.evaluate(&with_headroom(1.0), t0 + secs(6)),
            Some(Anomaly::BufferExhausted { .. })
        ));

        let mut d = detector(t0);
        d.mark_playing();
        assert_eq!(d.evaluate(&with_headroom(1.5), t0 + secs(6)), None);
    }

    #[test]
    fn test_attach_grants_grace_period() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.mark_playing();

        d.on_attach(t0 + secs(20));
        assert_eq!(d.evaluate(&playing(0.0), t0 + secs(21)), None);
        assert_eq!(d.last_liveness(), t0);
    }
}
