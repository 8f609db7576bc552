//! # Frame-Rate Throttle
//!
//! Some capture sources deliver frames faster than the stream's target rate
//! (e.g. a 120 Hz display streamed at 60 fps). When the source is not already
//! paced to the target, excess frames are dropped before they reach the
//! inbox.
//!
//! Decisions are made on presentation timestamps, not wall-clock time, so
//! jitter in callback delivery does not cause spurious drops. The observed
//! capture interval is smoothed; the throttle only engages when the source is
//! measurably faster than the target.

use std::time::Duration;

use crate::config::frame_interval;
use crate::stats::Ewma;

/// Fraction of a frame interval a frame may arrive early and still be kept.
const EARLY_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct FrameRateThrottle {
    target_interval: Duration,
    capture_paced: bool,
    observed_interval: Ewma,
    last_pts: Option<Duration>,
    next_due: Option<Duration>,
    dropped: u64,
}

impl FrameRateThrottle {
    pub fn new(target_fps: u32, capture_paced: bool) -> Self {
        FrameRateThrottle {
            target_interval: frame_interval(target_fps),
            capture_paced,
            observed_interval: Ewma::new(0.2),
            last_pts: None,
            next_due: None,
            dropped: 0,
        }
    }

    /// Change the target rate; resets cadence tracking.
    pub fn set_target_fps(&mut self, target_fps: u32) {
        self.target_interval = frame_interval(target_fps);
        self.reset();
    }

    /// The capture source now paces itself (or stopped doing so).
    pub fn set_capture_paced(&mut self, paced: bool) {
        self.capture_paced = paced;
    }

    pub fn reset(&mut self) {
        self.observed_interval.reset();
        self.last_pts = None;
        self.next_due = None;
    }

    /// Whether the throttle is currently discarding frames.
    pub fn is_engaged(&self) -> bool {
        !self.capture_paced
            && self.observed_interval.is_initialized()
            && self.observed_interval.value()
                < self.target_interval.as_secs_f64() * (1.0 - EARLY_TOLERANCE)
    }

    /// Decide whether a frame with presentation time `pts` should be kept.
    pub fn admit(&mut self, pts: Duration) -> bool {
        if self.capture_paced {
            return true;
        }

        match self.last_pts {
            // Timestamps went backwards: the source restarted.
            Some(prev) if pts < prev => {
                self.reset();
            }
            Some(prev) => {
                self.observed_interval.update((pts - prev).as_secs_f64());
            }
            None => {}
        }
        self.last_pts = Some(pts);

        if !self.is_engaged() {
            self.next_due = Some(pts + self.target_interval);
            return true;
        }

        let tolerance = self.target_interval.mul_f64(EARLY_TOLERANCE);
        let due = self.next_due.unwrap_or(pts);
        if pts + tolerance >= due {
            // Advance from the due time, not from pts, so the kept cadence
            // does not drift; resync if we fell a whole interval behind.
            let next = due + self.target_interval;
            self.next_due = Some(if next + self.target_interval < pts {
                pts + self.target_interval
            } else {
                next
            });
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    /// Frames dropped since the last call.
    pub fn consume_dropped_count(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(throttle: &mut FrameRateThrottle, fps: u32, seconds: u32) -> usize {
        let interval = frame_interval(fps);
        (0..fps * seconds)
            .filter(|i| throttle.admit(interval * *i))
            .count()
    }

    #[test]
    fn halves_double_rate_capture() {
        let mut throttle = FrameRateThrottle::new(60, false);
        let kept = feed(&mut throttle, 120, 2);
        // ~120 kept out of 240, allowing for the warm-up frames.
        assert!((118..=126).contains(&kept), "kept {kept}");
        assert!(throttle.consume_dropped_count() > 100);
    }

    #[test]
    fn passes_capture_at_target_rate() {
        let mut throttle = FrameRateThrottle::new(60, false);
        assert_eq!(feed(&mut throttle, 60, 2), 120);
        assert_eq!(throttle.consume_dropped_count(), 0);
    }

    #[test]
    fn passes_slower_capture() {
        let mut throttle = FrameRateThrottle::new(60, false);
        assert_eq!(feed(&mut throttle, 30, 2), 60);
    }

    #[test]
    fn paced_capture_is_never_throttled() {
        let mut throttle = FrameRateThrottle::new(30, true);
        assert_eq!(feed(&mut throttle, 120, 1), 120);
        assert!(!throttle.is_engaged());
    }

    #[test]
    fn timestamp_rewind_resets() {
        let mut throttle = FrameRateThrottle::new(60, false);
        feed(&mut throttle, 120, 1);
        assert!(throttle.is_engaged());
        assert!(throttle.admit(Duration::ZERO));
        assert!(!throttle.is_engaged());
    }
}
