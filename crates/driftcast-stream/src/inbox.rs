//! # Frame Inbox
//!
//! Decouples the capture source's production rate from the encoder's
//! consumption rate. The inbox is latest-frame biased: when it is full, a
//! newly arriving frame evicts the oldest unconsumed real frame and the
//! eviction is counted as a drop. With capacity 1 this is a pure coalescing
//! slot.
//!
//! Idle/keepalive frames sit in their own single slot. A newer idle frame
//! silently supersedes an older one, a real frame supersedes any idle frame,
//! and an idle frame never evicts real content.
//!
//! Producer (capture callback) and consumer (stream worker) run on different
//! threads; all state sits behind one mutex. The capture path stamps each
//! frame with the dimension token it observed. Close, reopen and the token
//! check share that mutex, so a frame stamped before a reconfiguration can
//! never land in the inbox after it.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::frame::CapturedFrame;

#[derive(Debug, Default)]
struct InboxState {
    frames: VecDeque<CapturedFrame>,
    idle: Option<CapturedFrame>,
    enqueued: u64,
    dropped: u64,
    closed: bool,
    /// Dimension token stamped frames must carry.
    token: u16,
    capacity: usize,
}

/// Why a stamped frame was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refused {
    Closed,
    /// Stamped with a dimension token from before the last reopen.
    StaleToken,
}

/// Bounded, latest-frame-biased frame buffer.
#[derive(Debug)]
pub struct FrameInbox {
    state: Mutex<InboxState>,
}

impl FrameInbox {
    /// Create an inbox holding at most `capacity` real frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        FrameInbox {
            state: Mutex::new(InboxState {
                capacity: capacity.max(1),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Change how many real frames may wait (minimum 1). Shrinking evicts
    /// the oldest excess frames, counted as drops.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity.max(1);
        let capacity = state.capacity;
        evict_to(&mut state, capacity);
    }

    /// Accept a frame. Returns `false` only once the inbox has been closed.
    pub fn enqueue(&self, frame: CapturedFrame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        insert(&mut state, frame);
        true
    }

    /// Accept a frame stamped with the dimension token its producer saw.
    pub fn enqueue_stamped(&self, frame: CapturedFrame, token: u16) -> Result<(), Refused> {
        let mut state = self.lock();
        if state.closed {
            return Err(Refused::Closed);
        }
        if state.token != token {
            return Err(Refused::StaleToken);
        }
        insert(&mut state, frame);
        Ok(())
    }

    /// Take the next frame to encode: oldest real frame first, then the
    /// pending idle frame. A frame is never returned twice.
    pub fn take_next(&self) -> Option<CapturedFrame> {
        let mut state = self.lock();
        match state.frames.pop_front() {
            Some(frame) => Some(frame),
            None => state.idle.take(),
        }
    }

    pub fn has_pending(&self) -> bool {
        let state = self.lock();
        !state.frames.is_empty() || state.idle.is_some()
    }

    /// Real frames waiting beyond the one about to be consumed.
    pub fn backlog(&self) -> usize {
        self.lock().frames.len().saturating_sub(1)
    }

    /// Drop everything pending without counting drops.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.idle = None;
    }

    /// Clear and refuse all further frames.
    pub fn close(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.idle = None;
        state.closed = true;
    }

    /// Re-open after [`close`](Self::close). Stamped frames must from now on
    /// carry `token`.
    pub fn reopen(&self, token: u16) {
        let mut state = self.lock();
        state.closed = false;
        state.token = token;
    }

    /// Frames accepted since the last call.
    pub fn consume_enqueued_count(&self) -> u64 {
        std::mem::take(&mut self.lock().enqueued)
    }

    /// Real frames evicted by coalescing since the last call.
    pub fn consume_dropped_count(&self) -> u64 {
        std::mem::take(&mut self.lock().dropped)
    }
}

fn insert(state: &mut InboxState, frame: CapturedFrame) {
    state.enqueued += 1;

    if frame.is_idle() {
        // Idle frames only matter when nothing real is waiting.
        if state.frames.is_empty() {
            state.idle = Some(frame);
        }
        return;
    }

    state.idle = None;
    evict_to(state, state.capacity - 1);
    state.frames.push_back(frame);
}

fn evict_to(state: &mut InboxState, len: usize) {
    while state.frames.len() > len {
        state.frames.pop_front();
        state.dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameMetadata, PixelBuffer};
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(n: u64, idle: bool) -> CapturedFrame {
        CapturedFrame::new(
            PixelBuffer::new(64, 64, Bytes::new()),
            Duration::from_millis(n),
            Duration::from_millis(16),
            FrameMetadata {
                is_idle: idle,
                ..Default::default()
            },
        )
    }

    #[test]
    fn coalesces_to_latest_frame() {
        let inbox = FrameInbox::new(1);
        for n in 0..5 {
            assert!(inbox.enqueue(frame(n, false)));
        }
        let f = inbox.take_next().unwrap();
        assert_eq!(f.pts, Duration::from_millis(4));
        assert!(inbox.take_next().is_none());
        assert_eq!(inbox.consume_dropped_count(), 4);
        assert_eq!(inbox.consume_enqueued_count(), 5);
        // Counters reset on read.
        assert_eq!(inbox.consume_dropped_count(), 0);
        assert_eq!(inbox.consume_enqueued_count(), 0);
    }

    #[test]
    fn idle_frames_never_count_as_drops() {
        let inbox = FrameInbox::new(1);
        inbox.enqueue(frame(1, false));
        inbox.enqueue(frame(2, true));
        inbox.enqueue(frame(3, true));
        assert_eq!(inbox.consume_dropped_count(), 0);
        // The real frame is still there and comes out first.
        assert_eq!(inbox.take_next().unwrap().pts, Duration::from_millis(1));
        assert!(!inbox.has_pending());
    }

    #[test]
    fn idle_frame_returned_when_nothing_real_pending() {
        let inbox = FrameInbox::new(1);
        inbox.enqueue(frame(1, true));
        inbox.enqueue(frame(2, true));
        let f = inbox.take_next().unwrap();
        assert!(f.is_idle());
        assert_eq!(f.pts, Duration::from_millis(2));
        assert!(inbox.take_next().is_none());
    }

    #[test]
    fn real_frame_supersedes_idle() {
        let inbox = FrameInbox::new(1);
        inbox.enqueue(frame(1, true));
        inbox.enqueue(frame(2, false));
        assert!(!inbox.take_next().unwrap().is_idle());
        assert!(inbox.take_next().is_none());
        assert_eq!(inbox.consume_dropped_count(), 0);
    }

    #[test]
    fn deeper_inbox_drops_oldest() {
        let inbox = FrameInbox::new(3);
        for n in 0..5 {
            inbox.enqueue(frame(n, false));
        }
        assert_eq!(inbox.backlog(), 2);
        let order: Vec<_> = std::iter::from_fn(|| inbox.take_next())
            .map(|f| f.pts.as_millis())
            .collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert_eq!(inbox.consume_dropped_count(), 2);
    }

    #[test]
    fn shrinking_capacity_evicts_oldest() {
        let inbox = FrameInbox::new(3);
        for n in 0..3 {
            inbox.enqueue(frame(n, false));
        }
        inbox.set_capacity(2);
        assert_eq!(inbox.capacity(), 2);
        assert_eq!(inbox.consume_dropped_count(), 1);
        assert_eq!(inbox.take_next().unwrap().pts, Duration::from_millis(1));

        inbox.set_capacity(0);
        assert_eq!(inbox.capacity(), 1);
        inbox.enqueue(frame(5, false));
        assert_eq!(inbox.consume_dropped_count(), 1);
        assert_eq!(inbox.take_next().unwrap().pts, Duration::from_millis(5));
    }

    #[test]
    fn closed_inbox_rejects() {
        let inbox = FrameInbox::new(1);
        inbox.enqueue(frame(1, false));
        inbox.close();
        assert!(!inbox.has_pending());
        assert!(!inbox.enqueue(frame(2, false)));
        inbox.reopen(0);
        assert!(inbox.enqueue(frame(3, false)));
    }

    #[test]
    fn frame_stamped_before_reconfiguration_is_refused() {
        let inbox = FrameInbox::new(2);
        inbox.reopen(1);
        assert_eq!(inbox.enqueue_stamped(frame(1, false), 1), Ok(()));

        // Producer saw token 1, then the stream reconfigured to token 2
        // before its enqueue landed.
        inbox.close();
        assert_eq!(inbox.enqueue_stamped(frame(2, false), 1), Err(Refused::Closed));
        inbox.reopen(2);
        assert_eq!(inbox.enqueue_stamped(frame(3, false), 1), Err(Refused::StaleToken));
        assert!(!inbox.has_pending());

        assert_eq!(inbox.enqueue_stamped(frame(4, false), 2), Ok(()));
        assert_eq!(inbox.take_next().unwrap().pts, Duration::from_millis(4));
        assert_eq!(inbox.consume_enqueued_count(), 2);
    }

    #[test]
    fn concurrent_producer_never_duplicates() {
        use std::sync::Arc;
        let inbox = Arc::new(FrameInbox::new(1));
        let producer = {
            let inbox = inbox.clone();
            std::thread::spawn(move || {
                for n in 0..2000 {
                    inbox.enqueue(frame(n, false));
                }
            })
        };
        let mut seen = Vec::new();
        while !producer.is_finished() || inbox.has_pending() {
            if let Some(f) = inbox.take_next() {
                seen.push(f.pts);
            }
        }
        producer.join().unwrap();
        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(seen, dedup, "a frame was taken twice");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "frames reordered");
        let dropped = inbox.consume_dropped_count();
        assert_eq!(seen.len() as u64 + dropped, 2000);
    }
}
