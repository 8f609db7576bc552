//! # Driftcast Wire Format
//!
//! Every packet is a fixed 48-byte header followed by one fragment payload.
//! All multi-byte fields are big endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +---------------+---------------+-------------------------------+
//! |  Version (1)  |     Flags     |           Stream ID           |
//! +---------------+---------------+-------------------------------+
//! |                        Sequence Number                        |
//! +---------------------------------------------------------------+
//! |                      Timestamp (64-bit, µs)                   |
//! |                                                               |
//! +---------------------------------------------------------------+
//! |                          Frame Number                         |
//! +-------------------------------+-------------------------------+
//! |        Fragment Index         |        Fragment Count         |
//! +-------------------------------+---------------+---------------+
//! |        Payload Length         | FEC Block Size|   Reserved    |
//! +-------------------------------+---------------+---------------+
//! |                       Frame Byte Count                        |
//! +---------------------------------------------------------------+
//! |                    CRC-32 of fragment payload                 |
//! +-------------------------------+-------------------------------+
//! |        Content Rect X         |        Content Rect Y         |
//! +-------------------------------+-------------------------------+
//! |      Content Rect Width       |      Content Rect Height      |
//! +-------------------------------+-------------------------------+
//! |        Dimension Token        |             Epoch             |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Data fragments carry their index in `0..fragment_count`. Parity fragments
//! set [`FrameFlags::FEC_PARITY`] and carry their block index instead.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::frame::Rect;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 48;

/// Largest fragment payload that keeps a packet inside a 64 KiB datagram.
pub const MAX_FRAGMENT_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

// ─── Flags ───────────────────────────────────────────────────────────────────

/// Per-packet flag bitset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const KEYFRAME: FrameFlags = FrameFlags(0x01);
    pub const END_OF_FRAME: FrameFlags = FrameFlags(0x02);
    pub const PARAMETER_SET: FrameFlags = FrameFlags(0x04);
    pub const DISCONTINUITY: FrameFlags = FrameFlags(0x08);
    pub const FEC_PARITY: FrameFlags = FrameFlags(0x10);

    const ALL: u8 = 0x1F;

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are discarded.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        FrameFlags(bits & Self::ALL)
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: FrameFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

// ─── CRC-32 ──────────────────────────────────────────────────────────────────

/// Reflected CRC-32 (IEEE 802.3, polynomial 0xEDB88320) lookup table.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc = CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

// ─── Frame Header ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub stream_id: u16,
    pub sequence: u32,
    pub timestamp_us: u64,
    pub frame_number: u32,
    pub fragment_index: u16,
    /// Number of data fragments in the frame (parity excluded).
    pub fragment_count: u16,
    pub payload_len: u16,
    /// XOR block size; 0 when the frame carries no parity.
    pub fec_block_size: u8,
    pub frame_bytes: u32,
    pub checksum: u32,
    pub content_rect: Rect,
    pub dimension_token: u16,
    pub epoch: u16,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.stream_id);
        buf.put_u32(self.sequence);
        buf.put_u64(self.timestamp_us);
        buf.put_u32(self.frame_number);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
        buf.put_u16(self.payload_len);
        buf.put_u8(self.fec_block_size);
        buf.put_u8(0);
        buf.put_u32(self.frame_bytes);
        buf.put_u32(self.checksum);
        buf.put_u16(self.content_rect.x);
        buf.put_u16(self.content_rect.y);
        buf.put_u16(self.content_rect.width);
        buf.put_u16(self.content_rect.height);
        buf.put_u16(self.dimension_token);
        buf.put_u16(self.epoch);
    }

    /// Decode the header alone. Does not look at the payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated(buf.remaining()));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::Version(version));
        }
        let flags = FrameFlags::from_bits_truncate(buf.get_u8());
        let stream_id = buf.get_u16();
        let sequence = buf.get_u32();
        let timestamp_us = buf.get_u64();
        let frame_number = buf.get_u32();
        let fragment_index = buf.get_u16();
        let fragment_count = buf.get_u16();
        let payload_len = buf.get_u16();
        let fec_block_size = buf.get_u8();
        let _reserved = buf.get_u8();
        let frame_bytes = buf.get_u32();
        let checksum = buf.get_u32();
        let content_rect = Rect {
            x: buf.get_u16(),
            y: buf.get_u16(),
            width: buf.get_u16(),
            height: buf.get_u16(),
        };
        let dimension_token = buf.get_u16();
        let epoch = buf.get_u16();

        Ok(FrameHeader {
            flags,
            stream_id,
            sequence,
            timestamp_us,
            frame_number,
            fragment_index,
            fragment_count,
            payload_len,
            fec_block_size,
            frame_bytes,
            checksum,
            content_rect,
            dimension_token,
            epoch,
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }

    pub fn is_parity(&self) -> bool {
        self.flags.contains(FrameFlags::FEC_PARITY)
    }

    pub fn is_end_of_frame(&self) -> bool {
        self.flags.contains(FrameFlags::END_OF_FRAME)
    }
}

/// Split a received packet into header and verified payload.
pub fn parse_packet(packet: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    let mut cursor = packet;
    let header = FrameHeader::decode(&mut cursor)?;
    let payload = &packet[HEADER_LEN..];
    if payload.len() != header.payload_len as usize {
        return Err(WireError::LengthMismatch {
            declared: header.payload_len as usize,
            actual: payload.len(),
        });
    }
    if crc32(payload) != header.checksum {
        return Err(WireError::Checksum);
    }
    Ok((header, payload))
}

// ─── Client Feedback ─────────────────────────────────────────────────────────

/// Quality feedback reported by the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFeedback {
    /// Frames the client failed to decode or display since the last report.
    pub dropped_frames: u32,
    /// Decoder buffer fill relative to its target (1.0 = healthy).
    pub buffer_health: f32,
}

impl QualityFeedback {
    pub const MESSAGE_TYPE: u8 = 0x81;
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(Self::MESSAGE_TYPE);
        buf.put_u32(self.dropped_frames);
        buf.put_u16((self.buffer_health.clamp(0.0, 6.5) * 10_000.0) as u16);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        if buf.get_u8() != PROTOCOL_VERSION || buf.get_u8() != Self::MESSAGE_TYPE {
            return None;
        }
        let dropped_frames = buf.get_u32();
        let buffer_health = buf.get_u16() as f32 / 10_000.0;
        Some(QualityFeedback {
            dropped_frames,
            buffer_health,
        })
    }

    pub fn indicates_loss(&self) -> bool {
        self.dropped_frames > 0 || self.buffer_health < 0.5
    }
}
