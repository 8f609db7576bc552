//! # Quality Controller
//!
//! Closed-loop adjustment of encoder quality and in-flight encode depth.
//!
//! ## Policy
//!
//! Each encode cycle is classified as over budget (average encode time above
//! the frame budget plus 5 %, or the outbound queue above the pressure
//! threshold) or under budget. A run of consecutive over-budget cycles steps
//! quality down, by a larger amount while the queue is above the hard cap.
//! A longer run of under-budget cycles steps it back up by a smaller amount.
//! Changes are spaced by a cooldown and bounded by a floor derived from the
//! configured quality.
//!
//! In-flight depth grows while encodes run long or frames back up in the
//! inbox, and shrinks once encodes are comfortably fast. Low-latency streams
//! pin the depth.

use quanta::Instant;
use std::time::Duration;
use tracing::debug;

use crate::config::{BackpressureSettings, LatencyPreset, QualitySettings, StreamConfig};
use crate::wire::QualityFeedback;

/// Encode time above `budget × OVER_BUDGET_MARGIN` counts as over budget.
const OVER_BUDGET_MARGIN: f64 = 1.05;
/// Encode time below `budget × COMFORT_MARGIN` allows shrinking depth.
const COMFORT_MARGIN: f64 = 0.75;
/// Bits per pixel per frame at quality 1.0, for bitrate hints.
const BITS_PER_PIXEL_AT_FULL_QUALITY: f64 = 0.15;

/// One encode-cycle measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeSample {
    /// Encoder's rolling average, if it has one yet.
    pub avg_encode_time: Option<Duration>,
    pub queue_bytes: usize,
    /// Real frames waiting in the inbox.
    pub backlog: usize,
}

/// What changed after a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Adjustment {
    pub quality: Option<f32>,
    pub in_flight: Option<usize>,
}

impl Adjustment {
    pub fn is_empty(&self) -> bool {
        self.quality.is_none() && self.in_flight.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct QualityController {
    settings: QualitySettings,
    backpressure: BackpressureSettings,
    preset: LatencyPreset,
    target_fps: u32,
    frame_budget: Duration,

    ceiling: f32,
    floor: f32,
    active: f32,
    keyframe_quality: f32,
    keyframe_floor: f32,

    over_count: u32,
    under_count: u32,
    last_change: Option<Instant>,

    max_in_flight: usize,
    in_flight: usize,
    depth_over: u32,
    depth_under: u32,
}

impl QualityController {
    pub fn new(config: &StreamConfig) -> Self {
        let ceiling = config.stream.quality;
        let mut ctl = QualityController {
            settings: config.quality.clone(),
            backpressure: config.backpressure.clone(),
            preset: config.stream.latency_preset,
            target_fps: config.stream.target_fps,
            frame_budget: config.frame_budget(),
            ceiling,
            floor: ceiling * config.quality.floor_ratio,
            active: ceiling,
            keyframe_quality: config.stream.keyframe_quality,
            keyframe_floor: config.keyframe.keyframe_quality_floor,
            over_count: 0,
            under_count: 0,
            last_change: None,
            max_in_flight: config.encoder.max_in_flight,
            in_flight: 1,
            depth_over: 0,
            depth_under: 0,
        };
        ctl.in_flight = ctl.pinned_depth().unwrap_or(1);
        ctl
    }

    pub fn active_quality(&self) -> f32 {
        self.active
    }

    pub fn quality_floor(&self) -> f32 {
        self.floor
    }

    pub fn in_flight_limit(&self) -> usize {
        self.in_flight
    }

    pub fn set_target_fps(&mut self, fps: u32) {
        self.target_fps = fps;
        self.frame_budget = crate::config::frame_interval(fps);
        if let Some(pinned) = self.pinned_depth() {
            self.in_flight = pinned;
        }
    }

    /// Clear hysteresis state; quality and depth carry over.
    pub fn reset(&mut self) {
        self.over_count = 0;
        self.under_count = 0;
        self.depth_over = 0;
        self.depth_under = 0;
        self.last_change = None;
    }

    /// Feed one encode cycle.
    pub fn observe(&mut self, sample: EncodeSample, now: Instant) -> Adjustment {
        let budget = self.frame_budget.as_secs_f64();
        let encode = sample.avg_encode_time.map(|d| d.as_secs_f64());
        let slow = encode.is_some_and(|t| t > budget * OVER_BUDGET_MARGIN);
        let over = slow || sample.queue_bytes > self.backpressure.pressure_bytes;
        let high_pressure = sample.queue_bytes > self.backpressure.hard_cap_bytes;

        if over {
            self.over_count += 1;
            self.under_count = 0;
        } else {
            self.under_count += 1;
            self.over_count = 0;
        }

        let mut adjustment = Adjustment::default();
        if !self.in_cooldown(now) {
            if self.over_count >= self.settings.over_budget_samples {
                let step = if high_pressure {
                    self.settings.step_down_high_pressure
                } else {
                    self.settings.step_down
                };
                adjustment.quality = self.apply(self.active - step, now);
                self.over_count = 0;
            } else if self.under_count >= self.settings.under_budget_samples {
                adjustment.quality = self.apply(self.active + self.settings.step_up, now);
                self.under_count = 0;
            }
        }

        adjustment.in_flight = self.adapt_depth(encode, budget, sample.backlog);
        if let Some(q) = adjustment.quality {
            debug!(
                quality = q,
                over_budget = over,
                high_pressure,
                queue_bytes = sample.queue_bytes,
                "quality adjusted"
            );
        }
        adjustment
    }

    /// Client-reported loss steps quality down immediately (cooldown
    /// permitting) without waiting for the sample counters.
    pub fn apply_client_feedback(&mut self, feedback: &QualityFeedback, now: Instant) -> Option<f32> {
        if !feedback.indicates_loss() || self.in_cooldown(now) {
            return None;
        }
        let step = if feedback.buffer_health < 0.25 {
            self.settings.step_down_high_pressure
        } else {
            self.settings.step_down
        };
        self.over_count = 0;
        self.under_count = 0;
        let changed = self.apply(self.active - step, now);
        if let Some(q) = changed {
            debug!(
                quality = q,
                dropped = feedback.dropped_frames,
                buffer_health = feedback.buffer_health,
                "quality lowered on client feedback"
            );
        }
        changed
    }

    /// Quality for the next keyframe.
    pub fn keyframe_quality(&self, queue_bytes: usize, high_motion: bool) -> f32 {
        let mut q = self.active.min(self.keyframe_quality);
        if queue_bytes > self.backpressure.pressure_bytes {
            q *= 0.8;
        }
        if high_motion {
            q *= 0.85;
        }
        q.max(self.keyframe_floor)
    }

    /// Bitrate hint for rate-controlled encoders.
    pub fn target_bitrate(&self, width: u32, height: u32) -> u64 {
        let pixels = width as f64 * height as f64;
        (pixels * self.target_fps as f64 * BITS_PER_PIXEL_AT_FULL_QUALITY * self.active as f64) as u64
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_change
            .is_some_and(|t| now.saturating_duration_since(t) < self.settings.cooldown)
    }

    fn apply(&mut self, target: f32, now: Instant) -> Option<f32> {
        let next = target.clamp(self.floor, self.ceiling);
        if (next - self.active).abs() < f32::EPSILON {
            return None;
        }
        self.active = next;
        self.last_change = Some(now);
        Some(next)
    }

    fn pinned_depth(&self) -> Option<usize> {
        match self.preset {
            LatencyPreset::LowLatency if self.target_fps >= 120 => Some(2.min(self.max_in_flight)),
            LatencyPreset::LowLatency => Some(1),
            _ => None,
        }
    }

    fn adapt_depth(&mut self, encode: Option<f64>, budget: f64, backlog: usize) -> Option<usize> {
        if let Some(pinned) = self.pinned_depth() {
            if pinned != self.in_flight {
                self.in_flight = pinned;
                return Some(pinned);
            }
            return None;
        }

        let grow = encode.is_some_and(|t| t > budget) || backlog > 0;
        let shrink = !grow && encode.is_some_and(|t| t < budget * COMFORT_MARGIN);
        if grow {
            self.depth_over += 1;
            self.depth_under = 0;
        } else if shrink {
            self.depth_under += 1;
            self.depth_over = 0;
        } else {
            self.depth_over = 0;
            self.depth_under = 0;
        }

        if self.depth_over >= self.settings.over_budget_samples && self.in_flight < self.max_in_flight {
            self.in_flight += 1;
            self.depth_over = 0;
            debug!(in_flight = self.in_flight, "in-flight depth raised");
            return Some(self.in_flight);
        }
        if self.depth_under >= self.settings.under_budget_samples && self.in_flight > 1 {
            self.in_flight -= 1;
            self.depth_under = 0;
            debug!(in_flight = self.in_flight, "in-flight depth lowered");
            return Some(self.in_flight);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(&StreamConfig::default())
    }

    fn slow() -> EncodeSample {
        EncodeSample {
            avg_encode_time: Some(Duration::from_millis(25)),
            ..Default::default()
        }
    }

    fn fast() -> EncodeSample {
        EncodeSample {
            avg_encode_time: Some(Duration::from_millis(4)),
            ..Default::default()
        }
    }

    // ─── Quality ────────────────────────────────────────────────────────

    #[test]
    fn single_slow_sample_does_not_step() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut q = controller();
        assert_eq!(q.observe(slow(), clock.now()).quality, None);
        let adj = q.observe(slow(), clock.now());
        assert!((adj.quality.unwrap() - 0.76).abs() < 1e-6);
    }

    #[test]
    fn high_pressure_steps_harder() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut q = controller();
        let sample = EncodeSample {
            queue_bytes: 5 << 20,
            ..fast()
        };
        q.observe(sample, clock.now());
        let adj = q.observe(sample, clock.now());
        assert!((adj.quality.unwrap() - 0.70).abs() < 1e-6);
    }

    #[test]
    fn cooldown_spaces_changes() {
        let (clock, mock) = quanta::Clock::mock();
        let mut q = controller();
        for _ in 0..2 {
            q.observe(slow(), clock.now());
        }
        let after_first = q.active_quality();
        for _ in 0..4 {
            assert_eq!(q.observe(slow(), clock.now()).quality, None);
        }
        mock.increment(Duration::from_millis(250));
        assert!(q.observe(slow(), clock.now()).quality.unwrap() < after_first);
    }

    #[test]
    fn floor_and_ceiling_hold() {
        let (clock, mock) = quanta::Clock::mock();
        let mut q = controller();
        for _ in 0..200 {
            q.observe(slow(), clock.now());
            mock.increment(Duration::from_millis(300));
        }
        assert!((q.active_quality() - 0.8 * 0.6).abs() < 1e-6);
        for _ in 0..500 {
            q.observe(fast(), clock.now());
            mock.increment(Duration::from_millis(300));
        }
        assert!((q.active_quality() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn recovery_is_slower_than_backoff() {
        let (clock, mock) = quanta::Clock::mock();
        let mut q = controller();
        q.observe(slow(), clock.now());
        let down = 0.8 - q.observe(slow(), clock.now()).quality.unwrap();
        mock.increment(Duration::from_millis(300));
        q.observe(fast(), clock.now());
        q.observe(fast(), clock.now());
        let before = q.active_quality();
        let up = q.observe(fast(), clock.now()).quality.unwrap() - before;
        assert!(up < down);
    }

    // ─── Feedback & Keyframes ───────────────────────────────────────────

    #[test]
    fn client_loss_steps_down_immediately() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut q = controller();
        let fb = QualityFeedback {
            dropped_frames: 4,
            buffer_health: 0.9,
        };
        assert!((q.apply_client_feedback(&fb, clock.now()).unwrap() - 0.76).abs() < 1e-6);
        // Cooldown applies to feedback too.
        assert_eq!(q.apply_client_feedback(&fb, clock.now()), None);
        let healthy = QualityFeedback {
            dropped_frames: 0,
            buffer_health: 1.0,
        };
        assert_eq!(q.apply_client_feedback(&healthy, clock.now()), None);
    }

    #[test]
    fn keyframe_quality_drops_under_pressure_and_motion() {
        let q = controller();
        assert!((q.keyframe_quality(0, false) - 0.7).abs() < 1e-6);
        let stressed = q.keyframe_quality(2 << 20, true);
        assert!((stressed - 0.7 * 0.8 * 0.85).abs() < 1e-6);
        let mut cfg = StreamConfig::default();
        cfg.keyframe.keyframe_quality_floor = 0.6;
        let q = QualityController::new(&cfg);
        assert!((q.keyframe_quality(2 << 20, true) - 0.6).abs() < 1e-6);
    }

    // ─── In-Flight Depth ────────────────────────────────────────────────

    #[test]
    fn depth_grows_with_backlog_and_shrinks_when_fast() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut q = controller();
        assert_eq!(q.in_flight_limit(), 1);
        let backlog = EncodeSample {
            backlog: 1,
            ..fast()
        };
        q.observe(backlog, clock.now());
        assert_eq!(q.observe(backlog, clock.now()).in_flight, Some(2));
        for _ in 0..20 {
            q.observe(backlog, clock.now());
        }
        assert_eq!(q.in_flight_limit(), 3);
        for _ in 0..3 {
            q.observe(fast(), clock.now());
        }
        assert_eq!(q.in_flight_limit(), 2);
    }

    #[test]
    fn low_latency_pins_depth() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut cfg = StreamConfig::default();
        cfg.stream.latency_preset = LatencyPreset::LowLatency;
        let mut q = QualityController::new(&cfg);
        for _ in 0..10 {
            q.observe(slow(), clock.now());
        }
        assert_eq!(q.in_flight_limit(), 1);
        q.set_target_fps(120);
        assert_eq!(q.in_flight_limit(), 2);
    }

    #[test]
    fn bitrate_hint_follows_quality() {
        let q = controller();
        assert_eq!(q.target_bitrate(1920, 1080), (1920.0 * 1080.0 * 60.0 * 0.15 * 0.8f32 as f64) as u64);
    }
}
