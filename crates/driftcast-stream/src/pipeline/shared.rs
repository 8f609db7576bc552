//! Per-stream state read outside the stream's worker thread.
//!
//! The capture callback and the encoder's completion callback both run on
//! threads the stream does not own. The handful of fields they need live
//! here as atomics. The worker is the only writer of the geometry fields
//! (content rect, dimension token) and writes them before submitting the
//! frame they describe, so a reader on the encoder thread sees values at
//! least as new as the frame it is handling.
//!
//! The wire epoch is owned by the encoder side instead: it advances when a
//! keyframe from a newer epoch is emitted and is confirmed once such a
//! keyframe has fully reached the transport. Until then every keyframe of
//! the epoch carries the discontinuity flag.

use quanta::Instant;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::frame::Rect;
use crate::geometry::Counter16;

#[derive(Debug)]
pub struct StreamShared {
    stream_id: u16,
    dimension_token: AtomicU16,
    epoch: AtomicU16,
    confirmed_epoch: AtomicU16,
    content_rect: AtomicU64,
    next_frame_number: AtomicU32,
    next_sequence: AtomicU32,
    resizing: AtomicBool,
    resizing_drops: AtomicU64,
    loss_mode_until: Mutex<Option<Instant>>,
}

impl StreamShared {
    pub fn new(stream_id: u16) -> Self {
        StreamShared {
            stream_id,
            dimension_token: AtomicU16::new(0),
            epoch: AtomicU16::new(0),
            confirmed_epoch: AtomicU16::new(0),
            content_rect: AtomicU64::new(0),
            next_frame_number: AtomicU32::new(0),
            next_sequence: AtomicU32::new(0),
            resizing: AtomicBool::new(false),
            resizing_drops: AtomicU64::new(0),
            loss_mode_until: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    // ─── Geometry ───────────────────────────────────────────────────────

    pub fn dimension_token(&self) -> u16 {
        self.dimension_token.load(Ordering::Acquire)
    }

    pub fn set_dimension_token(&self, token: u16) {
        self.dimension_token.store(token, Ordering::Release);
    }

    pub fn content_rect(&self) -> Rect {
        Rect::unpack(self.content_rect.load(Ordering::Acquire))
    }

    pub fn set_content_rect(&self, rect: Rect) {
        self.content_rect.store(rect.pack(), Ordering::Release);
    }

    // ─── Epochs ─────────────────────────────────────────────────────────

    /// Epoch stamped on outgoing frames.
    pub fn epoch(&self) -> u16 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Epoch of the last keyframe that fully reached the transport.
    pub fn confirmed_epoch(&self) -> u16 {
        self.confirmed_epoch.load(Ordering::Acquire)
    }

    /// Open `epoch` on the wire if it is newer than the current one.
    pub fn open_epoch(&self, epoch: u16) -> bool {
        advance(&self.epoch, epoch)
    }

    /// A keyframe of `epoch` was sent in full.
    pub fn confirm_epoch(&self, epoch: u16) {
        advance(&self.confirmed_epoch, epoch);
    }

    /// The current epoch has not yet been opened by a sent keyframe.
    pub fn discontinuity_pending(&self) -> bool {
        self.epoch() != self.confirmed_epoch()
    }

    // ─── Numbering ──────────────────────────────────────────────────────

    pub fn next_frame_number(&self) -> u32 {
        self.next_frame_number.fetch_add(1, Ordering::AcqRel)
    }

    /// Reserve `count` consecutive sequence numbers; returns the first.
    pub fn reserve_sequences(&self, count: u32) -> u32 {
        self.next_sequence.fetch_add(count, Ordering::AcqRel)
    }

    pub fn reset_frame_numbers(&self) {
        self.next_frame_number.store(0, Ordering::Release);
    }

    // ─── Resizing Gate ──────────────────────────────────────────────────

    pub fn is_resizing(&self) -> bool {
        self.resizing.load(Ordering::Acquire)
    }

    pub fn set_resizing(&self, resizing: bool) {
        self.resizing.store(resizing, Ordering::Release);
    }

    pub(crate) fn record_resizing_drop(&self) {
        self.resizing_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consume_resizing_drops(&self) -> u64 {
        self.resizing_drops.swap(0, Ordering::Relaxed)
    }

    // ─── Loss Mode ──────────────────────────────────────────────────────

    /// Enter (or extend) loss mode until `until`.
    pub fn enter_loss_mode(&self, until: Instant) {
        let mut slot = self.loss_mode_until.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(match *slot {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    pub fn in_loss_mode(&self, now: Instant) -> bool {
        matches!(
            *self.loss_mode_until.lock().unwrap_or_else(|e| e.into_inner()),
            Some(until) if now < until
        )
    }

    pub fn clear_loss_mode(&self) {
        *self.loss_mode_until.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn advance(slot: &AtomicU16, epoch: u16) -> bool {
    slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Counter16::new(epoch)
            .is_newer_than(Counter16::new(current))
            .then_some(epoch)
    })
    .is_ok()
}
