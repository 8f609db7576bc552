//! # Stream Controller
//!
//! Owns one stream's lifecycle and drives the inbox → encoder hand-off.
//!
//! ```text
//!   Idle ──start──▶ Running ◀──▶ Resizing
//!                      │
//!                      └──stop──▶ Stopped
//! ```
//!
//! The controller is single threaded and clock driven: the runtime feeds it
//! encoder events, commands and ticks, and calls [`StreamController::pump`]
//! whenever frames may be waiting. Nothing here blocks except the external
//! session calls made during start and reconfiguration.
//!
//! Every reconfiguration follows the same shape: gate the capture sink, bump
//! the dimension token and the sender generation, drop all transient state,
//! re-derive geometry, restart capture and encoder sessions, then force a
//! keyframe before reopening the gate. No frame captured or encoded before
//! the bump reaches the encoder or the wire under the new state.

use crossbeam_channel::{unbounded, Receiver, Sender};
use quanta::{Clock, Instant};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{CaptureConfig, CaptureSource, CaptureTarget, FrameSink};
use crate::config::StreamConfig;
use crate::encoder::{EncodeOptions, FrameTag, VideoEncoder};
use crate::error::{EncodeRejection, StreamError, StreamResult};
use crate::frame::{CapturedFrame, Rect};
use crate::geometry::{Counter16, StreamGeometry};
use crate::inbox::FrameInbox;
use crate::keyframe::{CadenceTrigger, KeyframeRequest, KeyframeScheduler, RequestOutcome};
use crate::pipeline::emitter::{FrameEmitter, StreamEvent};
use crate::pipeline::shared::StreamShared;
use crate::quality::{Adjustment, EncodeSample, QualityController};
use crate::sender::SenderHandle;
use crate::stats::{DropCounters, RateCounter, RejectionCounters, StreamMetrics};
use crate::throttle::FrameRateThrottle;
use crate::wire::QualityFeedback;

const RATE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    Resizing,
    Stopped,
}

/// A geometry or cadence change applied to a running stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconfiguration {
    /// The capture target's native size changed.
    Resize { width: u32, height: u32 },
    /// New output scale relative to the native size.
    Scale(f64),
    /// Capture a different display or window.
    SwitchTarget(CaptureTarget),
    FrameRate(u32),
}

impl Reconfiguration {
    fn label(&self) -> &'static str {
        match self {
            Reconfiguration::Resize { .. } => "resize",
            Reconfiguration::Scale(_) => "scale",
            Reconfiguration::SwitchTarget(_) => "switch-target",
            Reconfiguration::FrameRate(_) => "frame-rate",
        }
    }
}

enum Submission {
    Submitted,
    Dropped,
    EncoderBusy,
}

/// Per-stream orchestrator.
pub struct StreamController<E, C> {
    id: u16,
    config: StreamConfig,
    clock: Clock,
    state: StreamState,

    encoder: E,
    capture: C,
    sender: SenderHandle,
    emitter: Arc<FrameEmitter>,

    inbox: Arc<FrameInbox>,
    throttle: Arc<Mutex<FrameRateThrottle>>,
    shared: Arc<StreamShared>,
    wake: Sender<()>,
    events: Receiver<StreamEvent>,

    keyframes: KeyframeScheduler,
    quality: QualityController,
    geometry: StreamGeometry,
    target: Option<CaptureTarget>,
    dimension_token: Counter16,

    /// Client registration gate.
    encoding_enabled: bool,
    in_flight: usize,
    /// Last submission into an idle encoder, completion or drain.
    last_progress: Option<Instant>,
    last_reset: Option<Instant>,
    backpressure_active: bool,

    drops: DropCounters,
    rejections: RejectionCounters,
    encoded_rate: RateCounter,
    idle_rate: RateCounter,
    encoder_resets: u64,
    last_metrics: Option<Instant>,
    metrics_observer: Option<Sender<StreamMetrics>>,
}

impl<E: VideoEncoder, C: CaptureSource> StreamController<E, C> {
    /// Build an idle controller. `wake` is signalled whenever the capture
    /// sink queues a frame.
    pub fn new(
        id: u16,
        config: StreamConfig,
        encoder: E,
        capture: C,
        sender: SenderHandle,
        clock: Clock,
        wake: Sender<()>,
    ) -> Self {
        let (events_tx, events) = unbounded();
        let shared = Arc::new(StreamShared::new(id));
        let emitter = Arc::new(FrameEmitter::new(
            shared.clone(),
            sender.clone(),
            events_tx,
            clock.clone(),
        ));
        let keyframes = KeyframeScheduler::new(
            config.keyframe.clone(),
            config.backpressure.pressure_bytes,
            config.stream.keyframe_interval_frames,
            config.stream.target_fps,
        );
        let quality = QualityController::new(&config);
        let throttle = FrameRateThrottle::new(config.stream.target_fps, false);
        StreamController {
            id,
            inbox: Arc::new(FrameInbox::new(config.inbox_capacity())),
            throttle: Arc::new(Mutex::new(throttle)),
            geometry: StreamGeometry::derive(2, 2, 1.0, config.stream.max_encoded_dimension),
            config,
            clock,
            state: StreamState::Idle,
            encoder,
            capture,
            sender,
            emitter,
            shared,
            wake,
            events,
            keyframes,
            quality,
            target: None,
            dimension_token: Counter16::default(),
            encoding_enabled: false,
            in_flight: 0,
            last_progress: None,
            last_reset: None,
            backpressure_active: false,
            drops: DropCounters::default(),
            rejections: RejectionCounters::default(),
            encoded_rate: RateCounter::new(RATE_WINDOW),
            idle_rate: RateCounter::new(RATE_WINDOW),
            encoder_resets: 0,
            last_metrics: None,
            metrics_observer: None,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn geometry(&self) -> &StreamGeometry {
        &self.geometry
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn inbox(&self) -> &Arc<FrameInbox> {
        &self.inbox
    }

    pub fn keyframes(&self) -> &KeyframeScheduler {
        &self.keyframes
    }

    pub fn quality(&self) -> &QualityController {
        &self.quality
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_encoding(&self) -> bool {
        self.encoding_enabled
    }

    pub fn backpressure_active(&self) -> bool {
        self.backpressure_active
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    /// Encoder events. The runtime selects on this alongside its commands.
    pub fn events(&self) -> &Receiver<StreamEvent> {
        &self.events
    }

    pub fn set_metrics_observer(&mut self, observer: Sender<StreamMetrics>) {
        self.metrics_observer = Some(observer);
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Create the encoder session and start capturing `target`. Encoding
    /// stays held until [`client_registered`](Self::client_registered).
    pub fn start(&mut self, target: CaptureTarget) -> StreamResult<()> {
        if self.state != StreamState::Idle {
            return Err(StreamError::InvalidState {
                from: self.state,
                action: "start",
            });
        }

        let (base_w, base_h) = self.capture.base_size(&target)?;
        self.geometry = StreamGeometry::derive(
            base_w,
            base_h,
            self.config.stream.scale,
            self.config.stream.max_encoded_dimension,
        );
        self.shared
            .set_dimension_token(self.dimension_token.bump());
        self.open_encoder_session()?;

        self.inbox.reopen(self.shared.dimension_token());
        let config = self.capture_config(&target);
        if let Err(e) = self.capture.start(&config, self.sink()) {
            self.encoder.teardown();
            return Err(e.into());
        }
        self.lock_throttle()
            .set_capture_paced(self.capture.is_paced());
        self.shared
            .set_content_rect(Rect::full(self.geometry.output_width, self.geometry.output_height));
        self.target = Some(target);
        self.state = StreamState::Running;
        self.last_metrics = Some(self.clock.now());

        info!(
            stream_id = self.id,
            width = self.geometry.output_width,
            height = self.geometry.output_height,
            fps = self.config.stream.target_fps,
            "stream started"
        );
        Ok(())
    }

    /// Stop capture and encoding and discard everything queued. Nothing from
    /// this stream reaches the wire afterwards. Idempotent.
    pub fn stop(&mut self) {
        if self.state == StreamState::Stopped {
            return;
        }
        let was_started = self.state != StreamState::Idle;
        self.state = StreamState::Stopped;
        self.shared.set_resizing(true);
        self.inbox.close();
        if was_started {
            self.capture.stop();
            self.encoder.flush();
            self.encoder.teardown();
        }
        self.sender.bump_generation();
        self.in_flight = 0;
        self.encoding_enabled = false;
        while self.events.try_recv().is_ok() {}
        info!(stream_id = self.id, "stream stopped");
    }

    /// The client has subscribed: reset frame numbering, invalidate anything
    /// queued and start encoding with a keyframe.
    pub fn client_registered(&mut self) -> StreamResult<()> {
        if !matches!(self.state, StreamState::Running | StreamState::Resizing) {
            return Err(StreamError::InvalidState {
                from: self.state,
                action: "client registration",
            });
        }
        let now = self.clock.now();
        self.shared.reset_frame_numbers();
        self.invalidate_outbound();
        self.encoding_enabled = true;
        self.keyframes
            .require_keyframe(KeyframeRequest::new("client-registered").urgent(), now);
        info!(stream_id = self.id, "client registered, encoding enabled");
        Ok(())
    }

    /// The client went away; hold encoding again.
    pub fn client_unregistered(&mut self) {
        if self.encoding_enabled {
            self.encoding_enabled = false;
            self.invalidate_outbound();
            self.inbox.clear();
            info!(stream_id = self.id, "client unregistered, encoding held");
        }
    }

    // ─── Frame Loop ─────────────────────────────────────────────────────

    /// Hand queued frames to the encoder while depth allows. Returns the
    /// number of frames submitted.
    pub fn pump(&mut self) -> usize {
        if self.state != StreamState::Running {
            return 0;
        }
        let now = self.clock.now();
        self.check_stall(now);

        if !self.encoding_enabled {
            // Pre-registration frames are of no use to anyone.
            self.inbox.clear();
            return 0;
        }

        let mut submitted = 0;
        while self.state == StreamState::Running && self.in_flight < self.quality.in_flight_limit() {
            let Some(frame) = self.inbox.take_next() else {
                break;
            };
            match self.process_frame(frame, now) {
                Submission::Submitted => submitted += 1,
                Submission::Dropped => {}
                Submission::EncoderBusy => break,
            }
        }
        submitted
    }

    fn process_frame(&mut self, frame: CapturedFrame, now: Instant) -> Submission {
        if frame.buffer.width != self.geometry.output_width
            || frame.buffer.height != self.geometry.output_height
        {
            self.drops.resizing += 1;
            debug!(
                stream_id = self.id,
                width = frame.buffer.width,
                height = frame.buffer.height,
                "frame does not match stream geometry"
            );
            return Submission::Dropped;
        }
        let dirty = if frame.is_idle() {
            0.0
        } else {
            frame.metadata.dirty_fraction()
        };
        self.keyframes.observe_motion(dirty);
        if frame.metadata.wants_keyframe {
            self.keyframes.queue_keyframe(
                KeyframeRequest::new("capture-hint").in_flight_checked(),
                now,
            );
        }

        let adjustment = self.quality.observe(
            EncodeSample {
                avg_encode_time: self.encoder.average_encode_time(),
                queue_bytes: self.sender.queued_bytes(),
                backlog: self.inbox.backlog(),
            },
            now,
        );
        self.apply_adjustment(adjustment);

        let queue_bytes = self.sender.queued_bytes();
        let force = self
            .keyframes
            .should_emit_pending(queue_bytes, self.in_flight, now);

        if self.update_backpressure(queue_bytes) && !force {
            self.drops.backpressure += 1;
            debug!(stream_id = self.id, queue_bytes, "frame dropped under backpressure");
            return Submission::Dropped;
        }

        if frame.is_idle()
            && !force
            && !(self.config.stream.maintain_idle_cadence
                && queue_bytes <= self.config.backpressure.pressure_bytes)
        {
            self.drops.idle_skipped += 1;
            return Submission::Dropped;
        }

        let mut quality = self.quality.active_quality();
        if force {
            if let Some(plan) = self.keyframes.begin_emit(now) {
                if plan.requires_reset {
                    self.reset_encoder(now, plan.reason);
                } else if plan.requires_flush {
                    self.encoder.flush();
                    self.invalidate_outbound();
                }
                debug!(
                    stream_id = self.id,
                    reason = plan.reason,
                    retry = !plan.first_attempt,
                    "forcing keyframe"
                );
            }
            self.encoder.force_keyframe();
            quality = self
                .quality
                .keyframe_quality(queue_bytes, self.keyframes.motion().is_high());
        }

        let rect = if frame.metadata.content_rect.is_empty() {
            Rect::full(self.geometry.output_width, self.geometry.output_height)
        } else {
            frame.metadata.content_rect
        };
        self.shared.set_content_rect(rect);

        let options = EncodeOptions {
            force_keyframe: force,
            quality,
            tag: FrameTag {
                generation: self.sender.generation(),
                epoch: self.keyframes.epoch(),
                submitted_at: now,
                forced_keyframe: force,
                idle: frame.is_idle(),
            },
        };
        match self.encoder.encode(&frame, options) {
            Ok(()) => {
                if self.in_flight == 0 {
                    self.last_progress = Some(now);
                }
                self.in_flight += 1;
                Submission::Submitted
            }
            Err(rejection) => {
                self.rejections.record(&rejection);
                if force {
                    self.keyframes.cancel_emit();
                }
                debug!(stream_id = self.id, %rejection, "encoder rejected frame");
                if rejection == EncodeRejection::QueueFull {
                    Submission::EncoderBusy
                } else {
                    Submission::Dropped
                }
            }
        }
    }

    /// Hysteretic backpressure: engages above the hard cap, clears only once
    /// the queue drains to the pressure threshold.
    fn update_backpressure(&mut self, queue_bytes: usize) -> bool {
        let bp = &self.config.backpressure;
        if !self.backpressure_active && queue_bytes > bp.hard_cap_bytes {
            self.backpressure_active = true;
            debug!(stream_id = self.id, queue_bytes, "backpressure engaged");
        } else if self.backpressure_active && queue_bytes <= bp.pressure_bytes {
            self.backpressure_active = false;
            debug!(stream_id = self.id, queue_bytes, "backpressure cleared");
        }
        self.backpressure_active
    }

    // ─── Encoder Events ─────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: StreamEvent) {
        let now = self.clock.now();
        let current = self.sender.generation();
        match event {
            StreamEvent::Encoded {
                is_keyframe,
                queued,
                tag,
                ..
            } => {
                if tag.generation != current {
                    return;
                }
                self.last_progress = Some(now);
                if tag.idle {
                    self.idle_rate.record(now, 1);
                } else {
                    self.encoded_rate.record(now, 1);
                }
                if is_keyframe && queued {
                    if self.keyframes.mark_keyframe_emitted(now) {
                        debug!(stream_id = self.id, epoch = self.keyframes.epoch(), "discontinuity closed");
                    }
                } else if tag.forced_keyframe && !is_keyframe {
                    debug!(stream_id = self.id, "forced submission came back as delta");
                }
            }
            StreamEvent::Drained { tag } => {
                if tag.generation == current {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.last_progress = Some(now);
                }
            }
        }
    }

    /// Drain every pending encoder event.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Periodic work: stall detection, keyframe cadence, metrics.
    pub fn tick(&mut self) -> Option<StreamMetrics> {
        if self.state != StreamState::Running {
            return None;
        }
        let now = self.clock.now();
        self.check_stall(now);

        if self.encoding_enabled {
            let trigger = self
                .keyframes
                .poll_cadence(self.sender.queued_bytes(), now);
            if trigger == Some(CadenceTrigger::Overdue) {
                warn!(
                    stream_id = self.id,
                    epoch = self.keyframes.epoch(),
                    "keyframe cadence overdue, forcing"
                );
            }
        }

        self.collect_drop_counters();
        let due = self
            .last_metrics
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.stream.metrics_interval);
        if due {
            self.last_metrics = Some(now);
            let metrics = self.metrics();
            info!(
                stream_id = self.id,
                encoded_fps = metrics.encoded_fps,
                idle_fps = metrics.idle_encoded_fps,
                dropped = metrics.dropped_frames,
                quality = metrics.active_quality,
                target_fps = metrics.target_fps,
                queue_bytes = metrics.queue_bytes,
                "stream metrics"
            );
            if let Some(observer) = &self.metrics_observer {
                let _ = observer.try_send(metrics.clone());
            }
            return Some(metrics);
        }
        None
    }

    fn check_stall(&mut self, now: Instant) {
        if self.in_flight == 0 {
            return;
        }
        let Some(since) = self.last_progress else {
            return;
        };
        let stalled_for = now.saturating_duration_since(since);
        if stalled_for < self.config.stall_timeout() {
            return;
        }
        if self
            .last_reset
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.encoder.reset_cooldown)
        {
            debug!(stream_id = self.id, "encoder stalled, reset in cooldown");
            return;
        }
        warn!(
            stream_id = self.id,
            stalled_ms = stalled_for.as_millis() as u64,
            in_flight = self.in_flight,
            "encoder stalled, resetting"
        );
        self.keyframes.require_keyframe(
            KeyframeRequest::new("encoder-stall").urgent().with_reset(),
            now,
        );
        // The reset itself happens now; the pending keyframe only needs forcing.
        if let Some(plan) = self.keyframes.begin_emit(now) {
            self.reset_encoder(now, plan.reason);
        }
        self.keyframes.cancel_emit();
    }

    fn reset_encoder(&mut self, now: Instant, reason: &'static str) {
        self.last_reset = Some(now);
        self.encoder_resets += 1;
        self.invalidate_outbound();
        if let Err(e) = self.encoder.reset() {
            warn!(stream_id = self.id, reason, error = %e, "encoder reset failed");
        }
        self.apply_encoder_settings();
    }

    // ─── External Signals ───────────────────────────────────────────────

    /// Client quality feedback.
    pub fn quality_feedback(&mut self, feedback: &QualityFeedback) {
        let now = self.clock.now();
        if let Some(q) = self.quality.apply_client_feedback(feedback, now) {
            self.encoder.update_quality(q);
            self.encoder.update_bitrate(
                self.quality
                    .target_bitrate(self.geometry.output_width, self.geometry.output_height),
            );
        }
        if feedback.indicates_loss() {
            self.shared.enter_loss_mode(now + self.config.sender.loss_mode);
            self.keyframes.queue_keyframe(
                KeyframeRequest::new("client-loss")
                    .in_flight_checked()
                    .discontinuity(),
                now,
            );
        }
    }

    /// Loss-recovery keyframe requested from outside (e.g. the client saw a
    /// gap). Enters loss mode; an accepted request starts a new epoch.
    pub fn request_keyframe(&mut self, reason: &'static str, urgent: bool) -> RequestOutcome {
        let now = self.clock.now();
        self.shared.enter_loss_mode(now + self.config.sender.loss_mode);
        let mut request = KeyframeRequest::new(reason)
            .in_flight_checked()
            .discontinuity();
        if urgent {
            request = request.urgent();
        }
        self.keyframes.queue_keyframe(request, now)
    }

    // ─── Reconfiguration ────────────────────────────────────────────────

    /// Apply a geometry or cadence change. On failure the stream is stopped
    /// and the error returned.
    pub fn reconfigure(&mut self, change: Reconfiguration) -> StreamResult<()> {
        if self.state != StreamState::Running {
            return Err(StreamError::InvalidState {
                from: self.state,
                action: change.label(),
            });
        }
        let label = change.label();
        match self.apply_reconfiguration(change) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(stream_id = self.id, change = label, error = %e, "reconfiguration failed, stopping stream");
                self.stop();
                Err(e)
            }
        }
    }

    fn apply_reconfiguration(&mut self, change: Reconfiguration) -> StreamResult<()> {
        let now = self.clock.now();
        let label = change.label();

        // Gate, token, generation.
        self.state = StreamState::Resizing;
        self.shared.set_resizing(true);
        let token = self.dimension_token.bump();
        self.shared.set_dimension_token(token);
        self.inbox.close();
        self.invalidate_outbound();

        // Transient state.
        self.keyframes.reset();
        self.quality.reset();
        self.backpressure_active = false;
        self.last_progress = None;
        self.lock_throttle().reset();

        // Geometry.
        let previous = self.geometry;
        let mut target = self.target.clone().unwrap_or(CaptureTarget::Display(0));
        let (mut base_w, mut base_h) = (previous.base_width, previous.base_height);
        match &change {
            Reconfiguration::Resize { width, height } => {
                base_w = *width;
                base_h = *height;
            }
            Reconfiguration::Scale(scale) => {
                self.config.stream.scale = if scale.is_finite() && *scale > 0.0 {
                    *scale
                } else {
                    1.0
                };
            }
            Reconfiguration::SwitchTarget(next) => {
                (base_w, base_h) = self.capture.base_size(next)?;
                target = next.clone();
            }
            Reconfiguration::FrameRate(fps) => {
                let fps = (*fps).clamp(1, 240);
                self.config.stream.target_fps = fps;
                self.lock_throttle().set_target_fps(fps);
                self.keyframes
                    .set_cadence(self.config.stream.keyframe_interval_frames, fps);
                self.quality.set_target_fps(fps);
                self.inbox.set_capacity(self.config.inbox_capacity());
            }
        }
        self.geometry = StreamGeometry::derive(
            base_w,
            base_h,
            self.config.stream.scale,
            self.config.stream.max_encoded_dimension,
        );
        let (width, height) = self.geometry.output_size();

        // Sessions.
        if let Reconfiguration::SwitchTarget(next) = &change {
            self.capture.switch_target(next)?;
        }
        if matches!(change, Reconfiguration::FrameRate(_)) {
            self.capture
                .update_frame_rate(self.config.stream.target_fps)?;
        }
        let switched = matches!(change, Reconfiguration::SwitchTarget(_));
        if switched || previous.output_size() != self.geometry.output_size() {
            self.capture.update_output_size(width, height)?;
            self.encoder.flush();
            self.encoder.teardown();
            self.open_encoder_session()?;
        } else {
            self.encoder.flush();
            self.apply_encoder_settings();
        }
        self.lock_throttle()
            .set_capture_paced(self.capture.is_paced());
        self.shared.set_content_rect(Rect::full(width, height));
        self.target = Some(target);

        // Keyframe, then reopen.
        self.keyframes
            .require_keyframe(KeyframeRequest::new(label).urgent().discontinuity(), now);
        self.drops.resizing += self.shared.consume_resizing_drops();
        self.inbox.reopen(token);
        self.shared.set_resizing(false);
        self.state = StreamState::Running;

        info!(
            stream_id = self.id,
            change = label,
            width,
            height,
            scale = self.geometry.effective_scale,
            dimension_token = token,
            fps = self.config.stream.target_fps,
            "stream reconfigured"
        );
        Ok(())
    }

    // ─── Metrics ────────────────────────────────────────────────────────

    pub fn metrics(&mut self) -> StreamMetrics {
        let now = self.clock.now();
        self.collect_drop_counters();
        StreamMetrics {
            stream_id: self.id,
            encoded_fps: self.encoded_rate.rate(now),
            idle_encoded_fps: self.idle_rate.rate(now),
            dropped_frames: self.drops.content_dropped(),
            drops: self.drops.clone(),
            active_quality: self.quality.active_quality(),
            target_fps: self.config.stream.target_fps,
            in_flight_depth: self.quality.in_flight_limit(),
            queue_bytes: self.sender.queued_bytes(),
            keyframes: self.keyframes.keyframes_emitted(),
            encoder_resets: self.encoder_resets,
            epoch: self.keyframes.epoch(),
            dimension_token: self.dimension_token.value(),
            rejections: self.rejections.clone(),
            sender: self.sender.stats(),
        }
    }

    pub fn drop_counters(&mut self) -> DropCounters {
        self.collect_drop_counters();
        self.drops.clone()
    }

    fn collect_drop_counters(&mut self) {
        self.drops.coalesced += self.inbox.consume_dropped_count();
        let throttled = self.lock_throttle().consume_dropped_count();
        self.drops.throttled += throttled;
        self.drops.resizing += self.shared.consume_resizing_drops();
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn sink(&self) -> FrameSink {
        FrameSink::new(
            self.inbox.clone(),
            self.throttle.clone(),
            self.shared.clone(),
            self.wake.clone(),
        )
    }

    fn capture_config(&self, target: &CaptureTarget) -> CaptureConfig {
        CaptureConfig {
            target: target.clone(),
            output_width: self.geometry.output_width,
            output_height: self.geometry.output_height,
            frame_rate: self.config.stream.target_fps,
        }
    }

    fn lock_throttle(&self) -> std::sync::MutexGuard<'_, FrameRateThrottle> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_encoder_session(&mut self) -> StreamResult<()> {
        let (width, height) = self.geometry.output_size();
        self.encoder
            .create_session(width, height, self.emitter.clone())?;
        if let Err(e) = self.encoder.preheat() {
            warn!(stream_id = self.id, error = %e, "encoder preheat failed");
        }
        info!(
            stream_id = self.id,
            width,
            height,
            pixel_format = ?self.encoder.active_pixel_format(),
            "encoder session ready"
        );
        self.apply_encoder_settings();
        Ok(())
    }

    fn apply_encoder_settings(&mut self) {
        self.encoder.update_quality(self.quality.active_quality());
        self.encoder.update_in_flight_limit(self.quality.in_flight_limit());
        self.encoder.update_bitrate(
            self.quality
                .target_bitrate(self.geometry.output_width, self.geometry.output_height),
        );
    }

    fn apply_adjustment(&mut self, adjustment: Adjustment) {
        if adjustment.is_empty() {
            return;
        }
        if let Some(q) = adjustment.quality {
            self.encoder.update_quality(q);
            self.encoder.update_bitrate(
                self.quality
                    .target_bitrate(self.geometry.output_width, self.geometry.output_height),
            );
        }
        if let Some(depth) = adjustment.in_flight {
            self.encoder.update_in_flight_limit(depth);
        }
    }

    /// Bump the sender generation and forget in-flight work; drains from
    /// the old generation are ignored.
    fn invalidate_outbound(&mut self) {
        self.sender.bump_generation();
        self.in_flight = 0;
    }
}

impl<E, C> Drop for StreamController<E, C> {
    fn drop(&mut self) {
        self.inbox.close();
    }
}
