//! Seam to the hardware video encoder.
//!
//! The pipeline owns one [`VideoEncoder`] per stream and never drives it from
//! two threads at once. Compressed output comes back on the encoder's own
//! thread through an [`EncodedFrameSink`] handed over at session creation.

use bytes::Bytes;
use quanta::Instant;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EncodeRejection, EncoderError};
use crate::frame::CapturedFrame;

/// Pixel layout the encoder session consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgra8,
    Nv12,
    /// 10-bit 4:2:0.
    P010,
}

/// Opaque tag that travels with a frame through the encoder and comes back
/// with its compressed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTag {
    /// Sender generation at submission.
    pub generation: u64,
    /// Stream epoch at submission. A keyframe from a newer epoch opens it on
    /// the wire.
    pub epoch: u16,
    pub submitted_at: Instant,
    /// Whether the submission forced a keyframe.
    pub forced_keyframe: bool,
    /// The source frame was an idle keepalive.
    pub idle: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub force_keyframe: bool,
    /// Quality for this frame in (0, 1]. Keyframes may use a lower value
    /// than the session's active quality.
    pub quality: f32,
    pub tag: FrameTag,
}

/// One compressed access unit.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub pts: Duration,
    /// The unit carries in-band parameter sets.
    pub has_parameter_sets: bool,
    pub tag: FrameTag,
}

/// Receives encoder output. Called from the encoder's thread.
pub trait EncodedFrameSink: Send + Sync {
    /// A compressed frame is ready.
    fn frame_encoded(&self, frame: EncodedFrame);

    /// A submitted frame has left the encoder, with or without output.
    fn frame_drained(&self, tag: FrameTag);
}

/// Hardware encoder operations used by the pipeline.
pub trait VideoEncoder: Send {
    fn create_session(
        &mut self,
        width: u32,
        height: u32,
        output: Arc<dyn EncodedFrameSink>,
    ) -> Result<(), EncoderError>;

    fn update_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncoderError>;

    fn update_quality(&mut self, quality: f32);

    /// Bitrate hint for encoders that are rate controlled. Ignored otherwise.
    fn update_bitrate(&mut self, _bits_per_second: u64) {}

    fn update_in_flight_limit(&mut self, limit: usize);

    /// Drop queued input and pending output.
    fn flush(&mut self);

    /// Tear down and recreate the session at its current dimensions.
    fn reset(&mut self) -> Result<(), EncoderError>;

    /// Make the next submitted frame a keyframe.
    fn force_keyframe(&mut self);

    /// Warm up the session so the first real frame is not slow.
    fn preheat(&mut self) -> Result<(), EncoderError> {
        Ok(())
    }

    fn active_pixel_format(&self) -> PixelFormat;

    /// Rolling average of recent encode latencies, once measured.
    fn average_encode_time(&self) -> Option<Duration>;

    fn encode(&mut self, frame: &CapturedFrame, options: EncodeOptions)
        -> Result<(), EncodeRejection>;

    fn teardown(&mut self);
}

impl<E: VideoEncoder + ?Sized> VideoEncoder for Box<E> {
    fn create_session(
        &mut self,
        width: u32,
        height: u32,
        output: Arc<dyn EncodedFrameSink>,
    ) -> Result<(), EncoderError> {
        (**self).create_session(width, height, output)
    }

    fn update_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncoderError> {
        (**self).update_dimensions(width, height)
    }

    fn update_quality(&mut self, quality: f32) {
        (**self).update_quality(quality)
    }

    fn update_bitrate(&mut self, bits_per_second: u64) {
        (**self).update_bitrate(bits_per_second)
    }

    fn update_in_flight_limit(&mut self, limit: usize) {
        (**self).update_in_flight_limit(limit)
    }

    fn flush(&mut self) {
        (**self).flush()
    }

    fn reset(&mut self) -> Result<(), EncoderError> {
        (**self).reset()
    }

    fn force_keyframe(&mut self) {
        (**self).force_keyframe()
    }

    fn preheat(&mut self) -> Result<(), EncoderError> {
        (**self).preheat()
    }

    fn active_pixel_format(&self) -> PixelFormat {
        (**self).active_pixel_format()
    }

    fn average_encode_time(&self) -> Option<Duration> {
        (**self).average_encode_time()
    }

    fn encode(
        &mut self,
        frame: &CapturedFrame,
        options: EncodeOptions,
    ) -> Result<(), EncodeRejection> {
        (**self).encode(frame, options)
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }
}
