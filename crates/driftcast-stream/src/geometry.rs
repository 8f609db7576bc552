//! Capture and encode geometry.
//!
//! The base size is what the capture source produces before scaling; the
//! output size is what the encoder sees, aligned down to even pixels and
//! capped at a maximum encoded dimension. When the requested scale would
//! exceed the cap, the scale itself is reduced so the aspect ratio holds.

use tracing::warn;

/// Resolved geometry for one stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamGeometry {
    pub base_width: u32,
    pub base_height: u32,
    /// Scale that was asked for.
    pub requested_scale: f64,
    /// Scale actually applied after the resolution cap.
    pub effective_scale: f64,
    pub output_width: u32,
    pub output_height: u32,
}

impl StreamGeometry {
    /// Derive output geometry for a base size and requested scale.
    pub fn derive(base_width: u32, base_height: u32, scale: f64, max_dimension: u32) -> Self {
        let base_width = base_width.max(2);
        let base_height = base_height.max(2);
        let requested_scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };

        let longest = base_width.max(base_height) as f64;
        let cap = max_dimension.max(2) as f64;
        let effective_scale = if longest * requested_scale > cap {
            let capped = cap / longest;
            warn!(
                base_width,
                base_height,
                requested_scale,
                capped_scale = capped,
                max_dimension,
                "encoded resolution capped"
            );
            capped
        } else {
            requested_scale
        };

        StreamGeometry {
            base_width,
            base_height,
            requested_scale,
            effective_scale,
            output_width: align_even(base_width as f64 * effective_scale),
            output_height: align_even(base_height as f64 * effective_scale),
        }
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    pub fn is_capped(&self) -> bool {
        self.effective_scale < self.requested_scale
    }
}

/// Round down to an even pixel count, never below 2.
pub fn align_even(value: f64) -> u32 {
    // Absorb float error from scale division (e.g. 3840 * 5120/3840).
    let v = (value + 1e-6).floor().max(2.0) as u32;
    (v & !1).max(2)
}

/// Wrapping 16-bit counter that only moves forward.
///
/// Used for both the dimension token and the stream epoch. Comparisons use
/// serial-number arithmetic so the counter survives wrap-around.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Counter16(u16);

impl Counter16 {
    pub const fn new(value: u16) -> Self {
        Counter16(value)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// Advance and return the new value.
    pub fn bump(&mut self) -> u16 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }

    /// `true` if `self` is strictly newer than `other`.
    pub fn is_newer_than(self, other: Counter16) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < 0x8000
    }
}
