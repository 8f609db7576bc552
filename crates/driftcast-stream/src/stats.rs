//! # Stream Statistics
//!
//! Metric snapshots emitted periodically by each stream, plus the small
//! smoothing/rate primitives the controllers share. Snapshots serialize to
//! JSON for observers; they are not part of the data-plane contract.

use quanta::Instant;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::EncodeRejection;

// ─── Rejection Counters ─────────────────────────────────────────────────────

/// Per-reason counts of frames the encoder declined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounters {
    pub queue_full: u64,
    pub dimension_mismatch: u64,
    pub inactive: u64,
    pub no_session: u64,
    pub failed: u64,
}

impl RejectionCounters {
    pub fn record(&mut self, rejection: &EncodeRejection) {
        match rejection {
            EncodeRejection::QueueFull => self.queue_full += 1,
            EncodeRejection::DimensionMismatch => self.dimension_mismatch += 1,
            EncodeRejection::Inactive => self.inactive += 1,
            EncodeRejection::NoSession => self.no_session += 1,
            EncodeRejection::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.queue_full + self.dimension_mismatch + self.inactive + self.no_session + self.failed
    }
}

// ─── Drop Counters ──────────────────────────────────────────────────────────

/// Where captured frames were discarded before reaching the encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    /// Evicted by inbox coalescing.
    pub coalesced: u64,
    /// Dropped by the frame-rate throttle.
    pub throttled: u64,
    /// Dropped while outbound backpressure was active.
    pub backpressure: u64,
    /// Discarded because they arrived during a reconfiguration.
    pub resizing: u64,
    /// Idle frames skipped rather than encoded.
    pub idle_skipped: u64,
}

impl DropCounters {
    /// Frames that carried content but never got encoded.
    pub fn content_dropped(&self) -> u64 {
        self.coalesced + self.throttled + self.backpressure + self.resizing
    }
}

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Packet-sender counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    pub frames_sent: u64,
    pub keyframes_sent: u64,
    pub packets_sent: u64,
    pub parity_packets_sent: u64,
    pub bytes_sent: u64,
    /// Items rejected because their generation was superseded.
    pub stale_generation_drops: u64,
    /// Keyframes older than the latest accepted keyframe.
    pub stale_keyframe_drops: u64,
    /// Differential frames dropped while a keyframe was pending.
    pub gated_drops: u64,
    /// Items cut short by a generation bump mid-send.
    pub aborted_mid_send: u64,
    pub transport_errors: u64,
}

// ─── Stream Metrics ─────────────────────────────────────────────────────────

/// Periodic per-stream snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetrics {
    pub stream_id: u16,
    pub encoded_fps: f64,
    pub idle_encoded_fps: f64,
    pub dropped_frames: u64,
    pub drops: DropCounters,
    pub active_quality: f32,
    pub target_fps: u32,
    pub in_flight_depth: usize,
    pub queue_bytes: usize,
    pub keyframes: u64,
    pub encoder_resets: u64,
    pub epoch: u16,
    pub dimension_token: u16,
    pub rejections: RejectionCounters,
    pub sender: SenderStats,
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed event counter for computing per-second rates.
#[derive(Debug, Clone)]
pub struct RateCounter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        RateCounter {
            samples: VecDeque::with_capacity(256),
            window,
        }
    }

    /// Record `value` events at `now`.
    pub fn record(&mut self, now: Instant, value: u64) {
        self.samples.push_back((now, value));
        self.expire(now);
    }

    /// Sum of values in the window ending at `now`, per second.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        let sum: u64 = self.samples.iter().map(|(_, v)| v).sum();
        sum as f64 / self.window.as_secs_f64()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Weight of the newest sample (0.0 - 1.0).
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
