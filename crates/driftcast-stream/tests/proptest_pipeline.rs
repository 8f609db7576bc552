//! Property-based tests for the pipeline's buffering and packetisation.
//!
//! Covers the frame inbox under arbitrary producer/consumer interleavings,
//! the frame-rate throttle across source rates, the send queue's generation
//! and keyframe gates, the keyframe cadence bound, XOR parity recovery for
//! any single loss, and packet parsing of hostile input.

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Clock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftcast_stream::config::{frame_interval, KeyframeSettings, SenderSettings};
use driftcast_stream::fec;
use driftcast_stream::frame::{CapturedFrame, FrameMetadata, PixelBuffer};
use driftcast_stream::inbox::FrameInbox;
use driftcast_stream::keyframe::{CadenceTrigger, KeyframeScheduler};
use driftcast_stream::pool::PooledPacket;
use driftcast_stream::sender::{sender_channel, Pacer, PacketTransport, SendPlan, WorkItem};
use driftcast_stream::throttle::FrameRateThrottle;
use driftcast_stream::wire::{parse_packet, FrameHeader};

// ─── Frame Inbox ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Real,
    Idle,
    Take,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Real),
        1 => Just(Op::Idle),
        3 => Just(Op::Take),
    ]
}

fn frame(id: u64, idle: bool) -> CapturedFrame {
    CapturedFrame::new(
        PixelBuffer::new(16, 16, Bytes::new()),
        Duration::from_micros(id),
        Duration::from_millis(16),
        FrameMetadata {
            is_idle: idle,
            ..FrameMetadata::default()
        },
    )
}

proptest! {
    #[test]
    fn inbox_never_repeats_or_exceeds_capacity(
        capacity in 1usize..4,
        ops in proptest::collection::vec(op(), 1..200),
    ) {
        let inbox = FrameInbox::new(capacity);
        let mut next_id = 0u64;
        let mut seen = HashSet::new();
        let mut last_real = None;
        let mut real_enqueued = 0u64;
        let mut real_taken = 0u64;

        for op in ops {
            match op {
                Op::Real | Op::Idle => {
                    let idle = matches!(op, Op::Idle);
                    prop_assert!(inbox.enqueue(frame(next_id, idle)));
                    if !idle {
                        real_enqueued += 1;
                    }
                    next_id += 1;
                }
                Op::Take => {
                    if let Some(f) = inbox.take_next() {
                        let id = f.pts.as_micros() as u64;
                        prop_assert!(seen.insert(id), "frame {} returned twice", id);
                        if !f.is_idle() {
                            real_taken += 1;
                            // Real frames come out in capture order.
                            if let Some(prev) = last_real {
                                prop_assert!(id > prev);
                            }
                            last_real = Some(id);
                        }
                    }
                }
            }
            prop_assert!(inbox.backlog() < capacity);
        }

        // Every real frame is either taken, still pending, or counted dropped.
        let mut pending = 0u64;
        while let Some(f) = inbox.take_next() {
            if !f.is_idle() {
                pending += 1;
            }
        }
        prop_assert_eq!(real_taken + pending + inbox.consume_dropped_count(), real_enqueued);
        prop_assert_eq!(inbox.consume_enqueued_count(), next_id);
    }

    #[test]
    fn closed_inbox_accepts_nothing(count in 1usize..20) {
        let inbox = FrameInbox::new(2);
        inbox.close();
        for id in 0..count as u64 {
            prop_assert!(!inbox.enqueue(frame(id, false)));
        }
        prop_assert!(inbox.take_next().is_none());
    }
}

// ─── Frame-Rate Throttle ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn throttle_holds_fast_sources_near_target(source_fps in 75u32..240, target in prop_oneof![Just(30u32), Just(60)]) {
        let mut throttle = FrameRateThrottle::new(target, false);
        let interval = frame_interval(source_fps);
        let seconds = 4;
        let mut kept = 0u32;
        for i in 0..source_fps * seconds {
            if throttle.admit(interval * i) {
                kept += 1;
            }
        }
        // Warm-up frames pass before the throttle engages.
        let expected = (target * seconds) as f64;
        prop_assert!((kept as f64) < expected * 1.15 + 10.0, "kept {} of {}", kept, source_fps * seconds);
        prop_assert!((kept as f64) > expected * 0.85, "kept {}", kept);
    }

    #[test]
    fn throttle_never_drops_slow_or_paced_sources(source_fps in 1u32..60, paced in any::<bool>()) {
        let mut throttle = FrameRateThrottle::new(60, paced);
        let interval = frame_interval(source_fps);
        for i in 0..source_fps * 3 {
            prop_assert!(throttle.admit(interval * i));
        }
        prop_assert_eq!(throttle.consume_dropped_count(), 0);
    }
}

// ─── Send Queue Gates ────────────────────────────────────────────────────────

#[derive(Default, Clone)]
struct Wire(Arc<Mutex<Vec<FrameHeader>>>);

impl PacketTransport for Wire {
    fn send_packet(&mut self, packet: PooledPacket) -> std::io::Result<()> {
        let (header, _) = parse_packet(&packet).expect("sender emitted a malformed packet");
        self.0.lock().unwrap().push(header);
        Ok(())
    }
}

struct NoPause;

impl Pacer for NoPause {
    fn pause(&mut self, _delay: Duration) {}
}

#[derive(Debug, Clone)]
enum SendOp {
    Keyframe(usize),
    Delta(usize),
    Bump,
    Process,
}

fn send_op() -> impl Strategy<Value = SendOp> {
    prop_oneof![
        1 => (1usize..30_000).prop_map(SendOp::Keyframe),
        4 => (1usize..6_000).prop_map(SendOp::Delta),
        1 => Just(SendOp::Bump),
        3 => Just(SendOp::Process),
    ]
}

proptest! {
    #[test]
    fn stale_and_gated_frames_never_reach_the_wire(
        ops in proptest::collection::vec(send_op(), 1..80),
    ) {
        let wire = Wire::default();
        let (handle, mut worker) = sender_channel(&SenderSettings::default(), wire.clone(), NoPause);
        let mut frame_number = 0u32;
        let mut sequence = 0u32;
        // Frame number -> generation it was tagged with.
        let mut tagged = HashMap::new();
        // Keyframes admitted, with the wire length at admission.
        let mut admitted_keyframes = Vec::new();

        let run = |worker: &mut driftcast_stream::sender::SendWorker<Wire, NoPause>,
                       tagged: &HashMap<u32, u64>,
                       current: u64|
         -> Result<(), TestCaseError> {
            let before = wire.0.lock().unwrap().len();
            worker.process_pending();
            let headers = wire.0.lock().unwrap();
            for h in &headers[before..] {
                prop_assert_eq!(tagged[&h.frame_number], current, "stale frame {} sent", h.frame_number);
            }
            Ok(())
        };

        for op in ops {
            match op {
                SendOp::Keyframe(bytes) | SendOp::Delta(bytes) => {
                    let keyframe = matches!(op, SendOp::Keyframe(_));
                    let plan = SendPlan::new(bytes, 1200, 0);
                    let mut item = WorkItem::new(Bytes::from(vec![7u8; bytes]), keyframe, plan);
                    item.frame_number = frame_number;
                    item.start_sequence = sequence;
                    item.generation = handle.generation();
                    tagged.insert(frame_number, item.generation);
                    let wire_len = wire.0.lock().unwrap().len();
                    if handle.enqueue(item) {
                        sequence = sequence.wrapping_add(plan.packets() as u32);
                        if keyframe {
                            admitted_keyframes.push((frame_number, wire_len));
                        }
                    }
                    frame_number += 1;
                }
                SendOp::Bump => {
                    handle.bump_generation();
                }
                SendOp::Process => run(&mut worker, &tagged, handle.generation())?,
            }
        }
        run(&mut worker, &tagged, handle.generation())?;

        // From a keyframe's admission until its last fragment, only keyframe
        // packets go out.
        let headers = wire.0.lock().unwrap();
        for (key, start) in admitted_keyframes {
            let Some(end) = headers.iter().position(|h| h.frame_number == key && h.is_end_of_frame()) else {
                continue;
            };
            for h in &headers[start..end] {
                prop_assert!(h.is_keyframe(), "delta {} sent while keyframe {} pending", h.frame_number, key);
            }
        }
        prop_assert_eq!(handle.queued_bytes(), 0);
    }
}

// ─── Keyframe Cadence ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn cadence_is_bounded_under_any_motion_and_queue(
        steps in proptest::collection::vec((0.0f64..1.0, 0usize..8_000_000), 50..400),
        fps in prop_oneof![Just(30u32), Just(60), Just(120)],
    ) {
        let (clock, mock) = Clock::mock();
        let step = Duration::from_millis(50);
        let mut scheduler = KeyframeScheduler::new(KeyframeSettings::default(), 1024 * 1024, 120, fps);
        let (_, max_cadence) = scheduler.cadence();
        scheduler.mark_keyframe_emitted(clock.now());
        let mut last = clock.now();
        let mut epoch = scheduler.epoch();

        for (dirty, queue_bytes) in steps {
            mock.increment(step);
            let now = clock.now();
            scheduler.observe_motion(dirty);
            if scheduler.poll_cadence(queue_bytes, now) == Some(CadenceTrigger::Overdue) {
                prop_assert!(scheduler.epoch() > epoch);
                prop_assert!(scheduler.discontinuity_pending());
            }
            if scheduler.should_emit_pending(queue_bytes, 0, now) {
                scheduler.begin_emit(now);
                scheduler.mark_keyframe_emitted(now);
                last = now;
            }
            prop_assert!(now.saturating_duration_since(last) <= max_cadence + step);
            prop_assert!(scheduler.epoch() >= epoch);
            epoch = scheduler.epoch();
        }
    }
}

// ─── XOR Parity ──────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn any_single_loss_per_block_is_recoverable(
        data in proptest::collection::vec(any::<u8>(), 1..20_000),
        max_payload in 64usize..1400,
        block_size in prop_oneof![Just(fec::KEYFRAME_BLOCK), Just(fec::DELTA_BLOCK)],
        lost_seed in any::<usize>(),
    ) {
        let fragments: Vec<&[u8]> = data.chunks(max_payload).collect();
        let count = fec::fragment_count(data.len(), max_payload);
        prop_assert_eq!(fragments.len(), count);

        let lost = lost_seed % count;
        let block = lost / block_size as usize;
        let mut parity = vec![0u8; fec::parity_len(data.len(), max_payload, block_size, block)];
        fec::encode_block_parity(&mut parity, &data, max_payload, block_size, block);

        let first = block * block_size as usize;
        let last = (first + block_size as usize).min(count);
        let received = (first..last).filter(|i| *i != lost).map(|i| fragments[i]);
        let rebuilt = fec::recover_missing(
            received,
            &parity,
            fec::fragment_len(data.len(), max_payload, lost),
        );
        prop_assert_eq!(rebuilt.as_slice(), fragments[lost]);
    }
}

// ─── Packet Parsing ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn parse_packet_rejects_garbage_without_panicking(
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        if let Ok((header, payload)) = parse_packet(&bytes) {
            prop_assert_eq!(header.payload_len as usize, payload.len());
        }
    }
}
