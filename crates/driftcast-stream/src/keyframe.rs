//! # Keyframe Scheduler
//!
//! Decides when the encoder must produce a keyframe. Requests come from
//! periodic cadence, reconfiguration, loss recovery, stall recovery and
//! client registration; at most one is pending at a time.
//!
//! ```text
//!   idle ──queue──▶ pending-settle ──deadline──▶ pending-urgent
//!    ▲                   │                            │
//!    └───── keyframe emitted ◀────────────────────────┘
//! ```
//!
//! A settling request waits for the outbound queue to drain, in-flight
//! encodes to finish and motion to subside, but never past its deadline.
//! Requests that reset the encoder, reconfigure the stream or recover from
//! loss bump the stream epoch and flag the next keyframe as a discontinuity.

use quanta::Instant;
use std::time::Duration;
use tracing::debug;

use crate::config::KeyframeSettings;
use crate::geometry::Counter16;
use crate::stats::Ewma;

// ─── Motion ─────────────────────────────────────────────────────────────────

/// Smoothed fraction of the frame that changes per frame.
#[derive(Debug, Clone)]
pub struct MotionEstimator {
    ewma: Ewma,
    threshold: f64,
}

impl MotionEstimator {
    pub fn new(threshold: f64) -> Self {
        MotionEstimator {
            ewma: Ewma::new(0.2),
            threshold,
        }
    }

    /// Feed one frame's dirty fraction (0.0–1.0).
    pub fn observe(&mut self, dirty_fraction: f64) -> f64 {
        self.ewma.update(dirty_fraction.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.ewma.value()
    }

    pub fn is_high(&self) -> bool {
        self.ewma.value() > self.threshold
    }

    pub fn reset(&mut self) {
        self.ewma.reset();
    }
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// A request for a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeRequest {
    pub reason: &'static str,
    /// Ignore the request if a keyframe was queued or forced very recently.
    pub check_in_flight: bool,
    pub requires_flush: bool,
    pub requires_reset: bool,
    /// The keyframe starts a new epoch.
    pub marks_discontinuity: bool,
    pub urgent: bool,
}

impl KeyframeRequest {
    pub const fn new(reason: &'static str) -> Self {
        KeyframeRequest {
            reason,
            check_in_flight: false,
            requires_flush: false,
            requires_reset: false,
            marks_discontinuity: false,
            urgent: false,
        }
    }

    pub const fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub const fn with_flush(mut self) -> Self {
        self.requires_flush = true;
        self
    }

    /// Reset implies flush and a discontinuity.
    pub const fn with_reset(mut self) -> Self {
        self.requires_reset = true;
        self.requires_flush = true;
        self.marks_discontinuity = true;
        self
    }

    pub const fn discontinuity(mut self) -> Self {
        self.marks_discontinuity = true;
        self
    }

    pub const fn in_flight_checked(mut self) -> Self {
        self.check_in_flight = true;
        self
    }
}

/// The single outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKeyframe {
    pub reason: &'static str,
    pub deadline: Instant,
    pub urgent: bool,
    pub requires_flush: bool,
    pub requires_reset: bool,
    /// The emitted keyframe starts a new epoch.
    pub marks_discontinuity: bool,
    pub queued_at: Instant,
    /// When the encoder was last told to produce it.
    pub forced_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeState {
    Idle,
    PendingSettle,
    PendingUrgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    Cooldown,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Queued,
    /// Merged into the pending request.
    Merged,
    Throttled(ThrottleReason),
}

/// What the pipeline must do to emit the pending keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitPlan {
    pub reason: &'static str,
    pub requires_flush: bool,
    pub requires_reset: bool,
    /// First attempt, as opposed to a retry after no keyframe came back.
    pub first_attempt: bool,
}

/// Why a scheduled keyframe was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceTrigger {
    /// Regular cadence, conditions permitting.
    Scheduled,
    /// Maximum cadence exceeded; fired regardless of motion or queue.
    Overdue,
}

/// Cadence and worst-case cadence for a keyframe interval.
pub fn cadence_for(interval_frames: u32, fps: u32) -> (Duration, Duration) {
    let nominal =
        Duration::from_nanos(u64::from(interval_frames) * 1_000_000_000 / u64::from(fps.max(1)));
    let cadence = nominal.max(Duration::from_secs(1));
    let max_cadence = (cadence * 2).max(cadence + Duration::from_secs(1));
    (cadence, max_cadence)
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KeyframeScheduler {
    settings: KeyframeSettings,
    /// Backpressure threshold the settle fraction applies to.
    pressure_bytes: usize,
    cadence: Duration,
    max_cadence: Duration,
    pending: Option<PendingKeyframe>,
    last_request: Option<Instant>,
    last_urgent_request: Option<Instant>,
    /// Last time a keyframe was queued or forced, for the in-flight window.
    last_activity: Option<Instant>,
    last_emitted: Option<Instant>,
    motion: MotionEstimator,
    epoch: Counter16,
    discontinuity_pending: bool,
    emitted: u64,
}

impl KeyframeScheduler {
    pub fn new(
        settings: KeyframeSettings,
        pressure_bytes: usize,
        interval_frames: u32,
        fps: u32,
    ) -> Self {
        let (cadence, max_cadence) = cadence_for(interval_frames, fps);
        let motion = MotionEstimator::new(settings.motion_threshold);
        KeyframeScheduler {
            settings,
            pressure_bytes,
            cadence,
            max_cadence,
            pending: None,
            last_request: None,
            last_urgent_request: None,
            last_activity: None,
            last_emitted: None,
            motion,
            epoch: Counter16::default(),
            discontinuity_pending: false,
            emitted: 0,
        }
    }

    pub fn set_cadence(&mut self, interval_frames: u32, fps: u32) {
        (self.cadence, self.max_cadence) = cadence_for(interval_frames, fps);
    }

    pub fn cadence(&self) -> (Duration, Duration) {
        (self.cadence, self.max_cadence)
    }

    pub fn motion(&self) -> &MotionEstimator {
        &self.motion
    }

    pub fn observe_motion(&mut self, dirty_fraction: f64) -> f64 {
        self.motion.observe(dirty_fraction)
    }

    pub fn epoch(&self) -> u16 {
        self.epoch.value()
    }

    pub fn discontinuity_pending(&self) -> bool {
        self.discontinuity_pending
    }

    pub fn pending(&self) -> Option<&PendingKeyframe> {
        self.pending.as_ref()
    }

    pub fn keyframes_emitted(&self) -> u64 {
        self.emitted
    }

    pub fn state(&self, now: Instant) -> KeyframeState {
        match &self.pending {
            None => KeyframeState::Idle,
            Some(p) if p.urgent || now >= p.deadline => KeyframeState::PendingUrgent,
            Some(_) => KeyframeState::PendingSettle,
        }
    }

    /// Bump the epoch and flag the next keyframe. Returns the new epoch.
    pub fn bump_epoch(&mut self) -> u16 {
        self.discontinuity_pending = true;
        self.epoch.bump()
    }

    /// Queue a request, subject to the per-class cooldown and the in-flight
    /// window.
    pub fn queue_keyframe(&mut self, request: KeyframeRequest, now: Instant) -> RequestOutcome {
        let (last, cooldown) = if request.urgent {
            (self.last_urgent_request, self.settings.urgent_cooldown)
        } else {
            (self.last_request, self.settings.cooldown)
        };
        if last.is_some_and(|t| now.saturating_duration_since(t) < cooldown) {
            debug!(reason = request.reason, urgent = request.urgent, "keyframe request in cooldown");
            return RequestOutcome::Throttled(ThrottleReason::Cooldown);
        }
        if request.check_in_flight
            && self
                .last_activity
                .is_some_and(|t| now.saturating_duration_since(t) < self.settings.in_flight_window)
        {
            debug!(reason = request.reason, "keyframe request inside in-flight window");
            return RequestOutcome::Throttled(ThrottleReason::InFlight);
        }
        self.require_keyframe(request, now)
    }

    /// Queue a request unconditionally. Used where a keyframe is mandatory:
    /// reconfiguration, client registration, overdue cadence, stall recovery.
    pub fn require_keyframe(&mut self, request: KeyframeRequest, now: Instant) -> RequestOutcome {
        if request.urgent {
            self.last_urgent_request = Some(now);
        } else {
            self.last_request = Some(now);
        }
        self.last_activity = Some(now);
        if request.marks_discontinuity {
            let epoch = self.bump_epoch();
            debug!(reason = request.reason, epoch, "epoch bumped");
        }

        let deadline = if request.urgent {
            now
        } else {
            now + self.settings.deadline
        };
        match &mut self.pending {
            Some(p) => {
                // Only ever strengthen.
                p.urgent |= request.urgent;
                p.requires_flush |= request.requires_flush;
                p.requires_reset |= request.requires_reset;
                p.marks_discontinuity |= request.marks_discontinuity;
                if deadline < p.deadline {
                    p.deadline = deadline;
                }
                if request.urgent || request.requires_flush {
                    p.reason = request.reason;
                }
                RequestOutcome::Merged
            }
            None => {
                debug!(reason = request.reason, urgent = request.urgent, "keyframe queued");
                self.pending = Some(PendingKeyframe {
                    reason: request.reason,
                    deadline,
                    urgent: request.urgent,
                    requires_flush: request.requires_flush,
                    requires_reset: request.requires_reset,
                    marks_discontinuity: request.marks_discontinuity,
                    queued_at: now,
                    forced_at: None,
                });
                RequestOutcome::Queued
            }
        }
    }

    /// Whether the pending keyframe should be forced on the next frame.
    pub fn should_emit_pending(&self, queue_bytes: usize, in_flight: usize, now: Instant) -> bool {
        let Some(p) = &self.pending else {
            return false;
        };
        // Already forced: wait for it to come back before retrying.
        if let Some(forced) = p.forced_at {
            return now.saturating_duration_since(forced) >= self.settings.in_flight_window;
        }
        if p.urgent || now >= p.deadline {
            return true;
        }
        let settled = (queue_bytes as f64) <= self.settle_threshold();
        settled && in_flight == 0 && !self.motion.is_high()
    }

    /// Mark the pending keyframe as forced. Flush/reset requirements are
    /// handed out once.
    pub fn begin_emit(&mut self, now: Instant) -> Option<EmitPlan> {
        let p = self.pending.as_mut()?;
        let plan = EmitPlan {
            reason: p.reason,
            requires_flush: p.requires_flush,
            requires_reset: p.requires_reset,
            first_attempt: p.forced_at.is_none(),
        };
        p.requires_flush = false;
        p.requires_reset = false;
        p.forced_at = Some(now);
        self.last_activity = Some(now);
        Some(plan)
    }

    /// The forced submission never reached the encoder; force again on the
    /// next frame.
    pub fn cancel_emit(&mut self) {
        if let Some(p) = self.pending.as_mut() {
            p.forced_at = None;
        }
    }

    /// A keyframe came out of the encoder. Returns whether it closed a
    /// discontinuity.
    pub fn mark_keyframe_emitted(&mut self, now: Instant) -> bool {
        if let Some(p) = self.pending.take() {
            debug!(
                reason = p.reason,
                latency_ms = now.saturating_duration_since(p.queued_at).as_millis() as u64,
                "pending keyframe emitted"
            );
        }
        self.last_emitted = Some(now);
        self.emitted += 1;
        std::mem::take(&mut self.discontinuity_pending)
    }

    /// Check periodic cadence. Queues a request when one is due and returns
    /// what triggered it.
    pub fn poll_cadence(&mut self, queue_bytes: usize, now: Instant) -> Option<CadenceTrigger> {
        let last = self.last_emitted?;
        let elapsed = now.saturating_duration_since(last);

        if elapsed >= self.max_cadence {
            if self.pending.as_ref().is_some_and(|p| p.urgent) {
                return None;
            }
            self.require_keyframe(
                KeyframeRequest::new("cadence-overdue").urgent().discontinuity(),
                now,
            );
            debug!(elapsed_ms = elapsed.as_millis() as u64, "keyframe cadence overdue");
            return Some(CadenceTrigger::Overdue);
        }

        if elapsed >= self.cadence && self.pending.is_none() {
            let backed_up = queue_bytes as f64 > self.settle_threshold();
            if self.motion.is_high() || backed_up {
                return None;
            }
            if self.queue_keyframe(KeyframeRequest::new("cadence"), now) == RequestOutcome::Queued {
                return Some(CadenceTrigger::Scheduled);
            }
        }
        None
    }

    /// Drop pending state and timers; the epoch survives.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_request = None;
        self.last_urgent_request = None;
        self.last_activity = None;
        self.motion.reset();
    }

    fn settle_threshold(&self) -> f64 {
        self.pressure_bytes as f64 * self.settings.settle_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> KeyframeScheduler {
        KeyframeScheduler::new(KeyframeSettings::default(), 1 << 20, 120, 60)
    }

    // ─── Cadence ────────────────────────────────────────────────────────

    #[test]
    fn cadence_derivation() {
        assert_eq!(
            cadence_for(120, 60),
            (Duration::from_secs(2), Duration::from_secs(4))
        );
        // Short intervals floor at one second, max cadence at +1 s.
        assert_eq!(
            cadence_for(10, 60),
            (Duration::from_secs(1), Duration::from_secs(2))
        );
        assert_eq!(
            cadence_for(600, 60),
            (Duration::from_secs(10), Duration::from_secs(20))
        );
    }

    #[test]
    fn scheduled_keyframe_waits_for_low_motion() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.mark_keyframe_emitted(clock.now());
        for _ in 0..10 {
            s.observe_motion(0.9);
        }
        mock.increment(Duration::from_millis(2500));
        assert_eq!(s.poll_cadence(0, clock.now()), None);
        for _ in 0..30 {
            s.observe_motion(0.0);
        }
        assert_eq!(s.poll_cadence(0, clock.now()), Some(CadenceTrigger::Scheduled));
        assert_eq!(s.state(clock.now()), KeyframeState::PendingSettle);
    }

    #[test]
    fn overdue_cadence_fires_under_sustained_motion() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.mark_keyframe_emitted(clock.now());
        let epoch = s.epoch();
        for _ in 0..239 {
            s.observe_motion(0.8);
            assert_eq!(s.poll_cadence(10 << 20, clock.now()), None);
            mock.increment(Duration::from_micros(16_667));
        }
        mock.increment(Duration::from_millis(20));
        assert_eq!(s.poll_cadence(10 << 20, clock.now()), Some(CadenceTrigger::Overdue));
        assert_eq!(s.epoch(), epoch.wrapping_add(1));
        assert!(s.discontinuity_pending());
        assert!(s.should_emit_pending(10 << 20, 3, clock.now()));
        assert!(s.mark_keyframe_emitted(clock.now()));
        assert!(!s.discontinuity_pending());
    }

    // ─── Requests ───────────────────────────────────────────────────────

    #[test]
    fn cooldown_per_urgency_class() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        let now = clock.now();
        assert_eq!(s.queue_keyframe(KeyframeRequest::new("a"), now), RequestOutcome::Queued);
        s.mark_keyframe_emitted(now);
        assert_eq!(
            s.queue_keyframe(KeyframeRequest::new("b"), now),
            RequestOutcome::Throttled(ThrottleReason::Cooldown)
        );
        // The urgent class has its own clock.
        assert_eq!(
            s.queue_keyframe(KeyframeRequest::new("c").urgent(), now),
            RequestOutcome::Queued
        );
        mock.increment(Duration::from_millis(1001));
        assert_eq!(
            s.queue_keyframe(KeyframeRequest::new("d"), clock.now()),
            RequestOutcome::Merged
        );
    }

    #[test]
    fn in_flight_window_blocks_checked_requests() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.queue_keyframe(KeyframeRequest::new("first").urgent(), clock.now());
        s.begin_emit(clock.now());
        mock.increment(Duration::from_millis(300));
        assert_eq!(
            s.queue_keyframe(KeyframeRequest::new("loss").in_flight_checked(), clock.now()),
            RequestOutcome::Throttled(ThrottleReason::InFlight)
        );
        assert_eq!(
            s.queue_keyframe(KeyframeRequest::new("loss"), clock.now()),
            RequestOutcome::Merged
        );
    }

    #[test]
    fn merge_never_weakens() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut s = scheduler();
        let now = clock.now();
        s.require_keyframe(KeyframeRequest::new("reset").urgent().with_reset(), now);
        s.require_keyframe(KeyframeRequest::new("soft"), now);
        let p = s.pending().unwrap();
        assert!(p.urgent);
        assert!(p.requires_reset && p.requires_flush);
        assert_eq!(p.reason, "reset");
        assert_eq!(p.deadline, now);
    }

    #[test]
    fn reset_request_bumps_epoch() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.require_keyframe(KeyframeRequest::new("stall").urgent().with_reset(), clock.now());
        assert_eq!(s.epoch(), 1);
        assert!(s.discontinuity_pending());
        assert!(s.pending().unwrap().marks_discontinuity);
    }

    #[test]
    fn discontinuity_request_bumps_epoch_without_reset() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.require_keyframe(KeyframeRequest::new("resize").urgent().discontinuity(), clock.now());
        assert_eq!(s.epoch(), 1);
        let p = s.pending().unwrap();
        assert!(p.marks_discontinuity && !p.requires_reset && !p.requires_flush);
        assert!(s.mark_keyframe_emitted(clock.now()));

        // A throttled loss request leaves the epoch alone.
        mock.increment(Duration::from_millis(100));
        let loss = KeyframeRequest::new("loss").in_flight_checked().discontinuity();
        assert_eq!(
            s.queue_keyframe(loss, clock.now()),
            RequestOutcome::Throttled(ThrottleReason::InFlight)
        );
        assert_eq!(s.epoch(), 1);
        mock.increment(Duration::from_secs(2));
        assert_eq!(s.queue_keyframe(loss, clock.now()), RequestOutcome::Queued);
        assert_eq!(s.epoch(), 2);
    }

    // ─── Emission ───────────────────────────────────────────────────────

    #[test]
    fn settle_waits_for_queue_then_deadline() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.queue_keyframe(KeyframeRequest::new("loss"), clock.now());
        let busy = 600 * 1024;
        assert!(!s.should_emit_pending(busy, 0, clock.now()));
        assert!(!s.should_emit_pending(0, 1, clock.now()));
        assert!(s.should_emit_pending(0, 0, clock.now()));
        mock.increment(Duration::from_millis(750));
        assert!(s.should_emit_pending(busy, 2, clock.now()));
        assert_eq!(s.state(clock.now()), KeyframeState::PendingUrgent);
    }

    #[test]
    fn forced_keyframe_retried_after_window() {
        let (clock, mock) = quanta::Clock::mock();
        let mut s = scheduler();
        s.require_keyframe(KeyframeRequest::new("resize").urgent().with_flush(), clock.now());
        let plan = s.begin_emit(clock.now()).unwrap();
        assert!(plan.requires_flush && plan.first_attempt);
        assert!(!s.should_emit_pending(0, 0, clock.now()));
        mock.increment(Duration::from_millis(500));
        assert!(s.should_emit_pending(0, 0, clock.now()));
        let retry = s.begin_emit(clock.now()).unwrap();
        assert!(!retry.requires_flush && !retry.first_attempt);
        s.mark_keyframe_emitted(clock.now());
        assert_eq!(s.state(clock.now()), KeyframeState::Idle);
        assert_eq!(s.keyframes_emitted(), 1);
    }

    #[test]
    fn motion_estimator_smooths() {
        let mut m = MotionEstimator::new(0.25);
        m.observe(1.0);
        assert!(m.is_high());
        for _ in 0..20 {
            m.observe(0.0);
        }
        assert!(!m.is_high());
        assert!(m.value() < 0.02);
    }
}
