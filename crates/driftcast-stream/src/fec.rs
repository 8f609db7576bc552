//! # XOR Parity FEC
//!
//! While loss mode is active each frame's data fragments are grouped into
//! fixed-size blocks and one XOR parity fragment is emitted per block. A
//! receiver holding all but one fragment of a block can rebuild the missing
//! one from the parity.
//!
//! Parity length is the byte count from the block's first fragment to the
//! end of the frame, capped at the maximum payload size. For every block but
//! the last that is simply the payload size.

/// Block size used for keyframes under loss mode.
pub const KEYFRAME_BLOCK: u8 = 8;
/// Block size used for differential frames under loss mode.
pub const DELTA_BLOCK: u8 = 16;

/// Block size for a frame, or 0 when no parity is sent.
pub fn block_size_for(keyframe: bool, loss_mode: bool) -> u8 {
    match (loss_mode, keyframe) {
        (false, _) => 0,
        (true, true) => KEYFRAME_BLOCK,
        (true, false) => DELTA_BLOCK,
    }
}

/// Number of data fragments for `frame_bytes`. An empty frame still sends one
/// (empty) fragment so the receiver sees its end-of-frame marker.
pub fn fragment_count(frame_bytes: usize, max_payload: usize) -> usize {
    frame_bytes.div_ceil(max_payload.max(1)).max(1)
}

/// Payload length of data fragment `index`.
pub fn fragment_len(frame_bytes: usize, max_payload: usize, index: usize) -> usize {
    let start = index * max_payload;
    frame_bytes.saturating_sub(start).min(max_payload)
}

/// Number of parity fragments for `fragments` data fragments.
pub fn parity_count(fragments: usize, block_size: u8) -> usize {
    if block_size == 0 {
        0
    } else {
        fragments.div_ceil(block_size as usize)
    }
}

/// Payload length of the parity fragment for block `block`.
pub fn parity_len(frame_bytes: usize, max_payload: usize, block_size: u8, block: usize) -> usize {
    let start = block * block_size as usize * max_payload;
    frame_bytes.saturating_sub(start).min(max_payload)
}

/// XOR `src` into the front of `dst`. `src` may be shorter than `dst`.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Write the parity of block `block` of `frame` into `out`, which must be
/// `parity_len(..)` bytes long and zeroed.
pub fn encode_block_parity(
    out: &mut [u8],
    frame: &[u8],
    max_payload: usize,
    block_size: u8,
    block: usize,
) {
    let first = block * block_size as usize;
    let total = fragment_count(frame.len(), max_payload);
    let last = (first + block_size as usize).min(total);
    for index in first..last {
        let start = index * max_payload;
        let end = (start + max_payload).min(frame.len());
        if start < end {
            xor_into(out, &frame[start..end]);
        }
    }
}

/// Rebuild the single missing fragment of a block.
///
/// `received` holds the payloads of every other data fragment in the block,
/// `parity` the block's parity payload, and `missing_len` the expected length
/// of the lost fragment (known from the header's frame byte count).
pub fn recover_missing<'a, I>(received: I, parity: &[u8], missing_len: usize) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = parity.to_vec();
    out.resize(missing_len.max(parity.len()), 0);
    for fragment in received {
        xor_into(&mut out, fragment);
    }
    out.truncate(missing_len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn fragments(frame: &[u8], max_payload: usize) -> Vec<&[u8]> {
        frame.chunks(max_payload).collect()
    }

    #[test]
    fn block_sizes() {
        assert_eq!(block_size_for(true, false), 0);
        assert_eq!(block_size_for(false, false), 0);
        assert_eq!(block_size_for(true, true), 8);
        assert_eq!(block_size_for(false, true), 16);
    }

    #[test]
    fn counts_and_lengths() {
        assert_eq!(fragment_count(50_000, 1200), 42);
        assert_eq!(fragment_count(0, 1200), 1);
        assert_eq!(fragment_len(50_000, 1200, 41), 50_000 - 41 * 1200);
        assert_eq!(parity_count(42, 8), 6);
        assert_eq!(parity_count(42, 0), 0);
        // Last block starts at fragment 40: 50_000 - 48_000 = 2000, capped.
        assert_eq!(parity_len(50_000, 1200, 8, 5), 1200);
        // 20 fragments of 100, block 16: second block starts at 1600.
        assert_eq!(parity_len(1650, 100, 16, 1), 50);
    }

    #[test]
    fn recover_each_position_in_block() {
        let max_payload = 100;
        let data = frame(1_250);
        let frags = fragments(&data, max_payload);
        let block_size = 8u8;

        for block in 0..parity_count(frags.len(), block_size) {
            let mut parity = vec![0u8; parity_len(data.len(), max_payload, block_size, block)];
            encode_block_parity(&mut parity, &data, max_payload, block_size, block);

            let first = block * block_size as usize;
            let last = (first + block_size as usize).min(frags.len());
            for lost in first..last {
                let others = (first..last).filter(|&i| i != lost).map(|i| frags[i]);
                let rebuilt = recover_missing(others, &parity, frags[lost].len());
                assert_eq!(rebuilt, frags[lost], "block {block} fragment {lost}");
            }
        }
    }

    #[test]
    fn short_tail_fragment_recovers() {
        let max_payload = 64;
        let data = frame(64 * 3 + 5);
        let frags = fragments(&data, max_payload);
        let mut parity = vec![0u8; parity_len(data.len(), max_payload, 16, 0)];
        encode_block_parity(&mut parity, &data, max_payload, 16, 0);
        let rebuilt = recover_missing(frags[..3].iter().copied(), &parity, 5);
        assert_eq!(rebuilt, frags[3]);
    }
}
