//! Encoder output → sender hand-off.
//!
//! Runs on the encoder's completion thread. Each compressed frame becomes a
//! [`WorkItem`] tagged with the generation its source frame was submitted
//! under, numbered, given a block of sequence numbers, and queued on the
//! stream's sender. The stream worker hears about it through a
//! [`StreamEvent`].

use crossbeam_channel::Sender;
use quanta::Clock;
use std::sync::Arc;
use tracing::trace;

use crate::encoder::{EncodedFrame, EncodedFrameSink, FrameTag};
use crate::pipeline::shared::StreamShared;
use crate::sender::{SendOutcome, SenderHandle, WorkItem};
use crate::wire::FrameFlags;

/// Notifications from the encoder thread to the stream worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Encoded {
        frame_number: u32,
        is_keyframe: bool,
        bytes: usize,
        /// The sender accepted the item.
        queued: bool,
        tag: FrameTag,
    },
    Drained {
        tag: FrameTag,
    },
}

pub struct FrameEmitter {
    shared: Arc<StreamShared>,
    sender: SenderHandle,
    events: Sender<StreamEvent>,
    clock: Clock,
}

impl FrameEmitter {
    pub fn new(
        shared: Arc<StreamShared>,
        sender: SenderHandle,
        events: Sender<StreamEvent>,
        clock: Clock,
    ) -> Self {
        FrameEmitter {
            shared,
            sender,
            events,
            clock,
        }
    }

    fn build(&self, frame: EncodedFrame) -> WorkItem {
        let stream_id = self.shared.stream_id();
        let loss_mode = self.shared.in_loss_mode(self.clock.now());
        let plan = self
            .sender
            .plan(frame.data.len(), frame.is_keyframe, loss_mode);
        let frame_number = self.shared.next_frame_number();
        let start_sequence = self.shared.reserve_sequences(plan.packets() as u32);

        // Only a keyframe moves the wire epoch. Deltas keep the epoch of the
        // keyframe they follow, even if submitted after a newer epoch began.
        if frame.is_keyframe && self.shared.open_epoch(frame.tag.epoch) {
            trace!(stream_id, epoch = frame.tag.epoch, "epoch opened");
        }
        let epoch = self.shared.epoch();

        let mut item = WorkItem::new(frame.data, frame.is_keyframe, plan);
        item.flags
            .set(FrameFlags::PARAMETER_SET, frame.has_parameter_sets);
        if frame.is_keyframe && self.shared.discontinuity_pending() {
            item.flags.insert(FrameFlags::DISCONTINUITY);
            let shared = self.shared.clone();
            item.on_complete = Some(Box::new(move |outcome| {
                if matches!(outcome, SendOutcome::Sent { .. }) {
                    shared.confirm_epoch(epoch);
                }
            }));
        }
        item.pts = frame.pts;
        item.content_rect = self.shared.content_rect();
        item.stream_id = stream_id;
        item.frame_number = frame_number;
        item.start_sequence = start_sequence;
        item.dimension_token = self.shared.dimension_token();
        item.epoch = epoch;
        item.generation = frame.tag.generation;
        item.label = if frame.is_keyframe {
            format!("s{stream_id}#{frame_number}/key")
        } else {
            format!("s{stream_id}#{frame_number}")
        };
        item
    }
}

impl EncodedFrameSink for FrameEmitter {
    fn frame_encoded(&self, frame: EncodedFrame) {
        let tag = frame.tag;
        let is_keyframe = frame.is_keyframe;
        let bytes = frame.data.len();

        // Frames from a superseded generation never consume numbering.
        let (frame_number, queued) = if tag.generation == self.sender.generation() {
            let item = self.build(frame);
            let frame_number = item.frame_number;
            (frame_number, self.sender.enqueue(item))
        } else {
            trace!(
                stream_id = self.shared.stream_id(),
                generation = tag.generation,
                "encoded frame from stale generation"
            );
            (0, false)
        };

        let _ = self.events.send(StreamEvent::Encoded {
            frame_number,
            is_keyframe,
            bytes,
            queued,
            tag,
        });
    }

    fn frame_drained(&self, tag: FrameTag) {
        let _ = self.events.send(StreamEvent::Drained { tag });
    }
}
