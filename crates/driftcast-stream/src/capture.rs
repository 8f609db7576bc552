//! Seam to the capture source, and the sink it pushes frames into.

use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::error::CaptureError;
use crate::frame::CapturedFrame;
use crate::inbox::{FrameInbox, Refused};
use crate::pipeline::shared::StreamShared;
use crate::throttle::FrameRateThrottle;

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CaptureTarget {
    Display(u32),
    Window(u64),
}

/// Parameters a capture session is started (or restarted) with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub target: CaptureTarget,
    pub output_width: u32,
    pub output_height: u32,
    pub frame_rate: u32,
}

/// External capture source. All calls come from the stream's worker thread;
/// frames arrive on the source's own thread through the [`FrameSink`].
pub trait CaptureSource: Send {
    /// Native size of `target` before any scaling.
    fn base_size(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError>;

    fn start(&mut self, config: &CaptureConfig, sink: FrameSink) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn update_frame_rate(&mut self, frame_rate: u32) -> Result<(), CaptureError>;

    fn update_output_size(&mut self, width: u32, height: u32) -> Result<(), CaptureError>;

    fn switch_target(&mut self, target: &CaptureTarget) -> Result<(), CaptureError>;

    /// The source itself delivers at the configured frame rate.
    fn is_paced(&self) -> bool;
}

impl<C: CaptureSource + ?Sized> CaptureSource for Box<C> {
    fn base_size(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
        (**self).base_size(target)
    }

    fn start(&mut self, config: &CaptureConfig, sink: FrameSink) -> Result<(), CaptureError> {
        (**self).start(config, sink)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn update_frame_rate(&mut self, frame_rate: u32) -> Result<(), CaptureError> {
        (**self).update_frame_rate(frame_rate)
    }

    fn update_output_size(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        (**self).update_output_size(width, height)
    }

    fn switch_target(&mut self, target: &CaptureTarget) -> Result<(), CaptureError> {
        (**self).switch_target(target)
    }

    fn is_paced(&self) -> bool {
        (**self).is_paced()
    }
}

/// Producer end of a stream's inbox, handed to the capture source.
///
/// Frames arriving while the stream is reconfiguring are discarded, frames
/// above the target rate are throttled, and the rest go into the inbox with
/// a wake-up for the stream worker.
#[derive(Clone)]
pub struct FrameSink {
    inbox: Arc<FrameInbox>,
    throttle: Arc<Mutex<FrameRateThrottle>>,
    shared: Arc<StreamShared>,
    wake: Sender<()>,
}

impl FrameSink {
    pub(crate) fn new(
        inbox: Arc<FrameInbox>,
        throttle: Arc<Mutex<FrameRateThrottle>>,
        shared: Arc<StreamShared>,
        wake: Sender<()>,
    ) -> Self {
        FrameSink {
            inbox,
            throttle,
            shared,
            wake,
        }
    }

    /// Offer a frame. Returns `true` if it reached the inbox.
    pub fn push(&self, frame: CapturedFrame) -> bool {
        // Read before the gate; the inbox refuses the frame if a
        // reconfiguration slips in between.
        let token = self.shared.dimension_token();
        if self.shared.is_resizing() {
            self.shared.record_resizing_drop();
            return false;
        }
        if !frame.is_idle() {
            let admitted = self
                .throttle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .admit(frame.pts);
            if !admitted {
                trace!(stream_id = self.shared.stream_id(), pts = ?frame.pts, "frame throttled");
                return false;
            }
        }
        match self.inbox.enqueue_stamped(frame, token) {
            Ok(()) => {}
            Err(Refused::StaleToken) => {
                self.shared.record_resizing_drop();
                return false;
            }
            Err(Refused::Closed) => return false,
        }
        // A full wake channel already has a wake-up pending.
        let _ = self.wake.try_send(());
        true
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("stream_id", &self.shared.stream_id())
            .finish_non_exhaustive()
    }
}
