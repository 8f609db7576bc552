//! Captured frames and their per-frame metadata.

use bytes::Bytes;
use std::time::Duration;

/// Axis-aligned rectangle in buffer pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width`×`height` buffer, saturating at
    /// `u16::MAX`.
    pub fn full(width: u32, height: u32) -> Self {
        Rect {
            x: 0,
            y: 0,
            width: width.min(u16::MAX as u32) as u16,
            height: height.min(u16::MAX as u32) as u16,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pack into a single word so the rect can live in an `AtomicU64`.
    pub fn pack(&self) -> u64 {
        (self.x as u64) << 48 | (self.y as u64) << 32 | (self.width as u64) << 16 | self.height as u64
    }

    pub fn unpack(word: u64) -> Self {
        Rect {
            x: (word >> 48) as u16,
            y: (word >> 32) as u16,
            width: (word >> 16) as u16,
            height: word as u16,
        }
    }
}

/// Opaque handle to the captured pixels. The pipeline never inspects pixel
/// data; it only hands the buffer to the encoder.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Bytes) -> Self {
        PixelBuffer {
            width,
            height,
            data,
        }
    }
}

/// Per-frame metadata reported by the capture source.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    /// Region of the buffer that holds real content.
    pub content_rect: Rect,
    pub dirty_rects: Vec<Rect>,
    /// Capture source's estimate of changed area, in percent (0–100).
    pub dirty_percentage: f32,
    /// Keepalive frame carrying no new content.
    pub is_idle: bool,
    /// The source (or encoder feedback it relays) asks for a keyframe.
    pub wants_keyframe: bool,
}

impl FrameMetadata {
    /// Dirty percentage normalised to 0.0–1.0.
    pub fn dirty_fraction(&self) -> f64 {
        (self.dirty_percentage as f64 / 100.0).clamp(0.0, 1.0)
    }
}

/// One raw frame. Immutable after creation.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub buffer: PixelBuffer,
    /// Presentation timestamp relative to capture start.
    pub pts: Duration,
    pub duration: Duration,
    pub metadata: FrameMetadata,
}

impl CapturedFrame {
    pub fn new(buffer: PixelBuffer, pts: Duration, duration: Duration, metadata: FrameMetadata) -> Self {
        CapturedFrame {
            buffer,
            pts,
            duration,
            metadata,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.metadata.is_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_pack_unpack() {
        let r = Rect::new(12, 34, 1920, 1080);
        assert_eq!(Rect::unpack(r.pack()), r);
        assert_eq!(Rect::unpack(Rect::default().pack()), Rect::default());
    }

    #[test]
    fn full_rect_saturates() {
        let r = Rect::full(100_000, 720);
        assert_eq!(r.width, u16::MAX);
        assert_eq!(r.height, 720);
    }

    #[test]
    fn dirty_fraction_clamps() {
        let m = FrameMetadata {
            dirty_percentage: 180.0,
            ..Default::default()
        };
        assert_eq!(m.dirty_fraction(), 1.0);
        let m = FrameMetadata {
            dirty_percentage: 25.0,
            ..Default::default()
        };
        assert!((m.dirty_fraction() - 0.25).abs() < 1e-9);
    }
}
