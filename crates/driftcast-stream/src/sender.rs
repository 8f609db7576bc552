//! # Packet Sender
//!
//! Turns compressed frames into ordered wire packets. One [`WorkItem`] per
//! frame goes into an unbounded, ordered queue; a single worker per stream
//! fragments it, interleaves XOR parity under loss mode, and hands pooled
//! packet buffers to the transport in paced bursts.
//!
//! ## Staleness
//!
//! Every item carries the sender generation that was current when its frame
//! entered the pipeline. The generation is bumped on encoder reset, flush and
//! reconfiguration; stale items are dropped at enqueue, at dequeue, and
//! before every burst of an item already being sent.
//!
//! Once a keyframe is admitted, differential items are dropped until that
//! keyframe has been fully sent, so an old delta can never land behind a
//! keyframe and corrupt the client's reference state.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{PacingTier, SenderSettings};
use crate::fec;
use crate::frame::Rect;
use crate::pool::{PacketBufferPool, PooledPacket};
use crate::stats::SenderStats;
use crate::wire::{crc32, FrameFlags, FrameHeader, HEADER_LEN};

// ─── Transport & Pacing Seams ───────────────────────────────────────────────

/// Destination for finished packets. Dropping the packet returns its buffer
/// to the pool, so implementations release it as soon as the bytes are out.
pub trait PacketTransport: Send {
    fn send_packet(&mut self, packet: PooledPacket) -> io::Result<()>;
}

impl<T: PacketTransport + ?Sized> PacketTransport for Box<T> {
    fn send_packet(&mut self, packet: PooledPacket) -> io::Result<()> {
        (**self).send_packet(packet)
    }
}

/// Waits between bursts.
pub trait Pacer: Send {
    fn pause(&mut self, delay: Duration);
}

/// Sleeps the sending thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, delay: Duration) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Pacing tier for a frame of `wire_bytes`. Loss mode always takes the most
/// conservative tier in the table.
pub fn select_tier(tiers: &[PacingTier], wire_bytes: usize, loss_mode: bool) -> PacingTier {
    const FALLBACK: PacingTier = PacingTier {
        min_bytes: 0,
        burst: 32,
        delay: Duration::from_micros(250),
    };
    let chosen = if loss_mode {
        tiers
            .iter()
            .min_by_key(|t| (t.burst, std::cmp::Reverse(t.delay)))
    } else {
        tiers
            .iter()
            .find(|t| wire_bytes >= t.min_bytes)
            .or_else(|| tiers.last())
    };
    let mut tier = chosen.copied().unwrap_or(FALLBACK);
    tier.burst = tier.burst.max(1);
    tier
}

// ─── Work Items ─────────────────────────────────────────────────────────────

/// What happened to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every packet was handed to the transport.
    Sent { packets: usize },
    /// The item's generation was superseded before sending started.
    StaleGeneration,
    /// A newer keyframe had already been accepted.
    StaleKeyframe,
    /// Differential frame dropped while a keyframe was pending.
    Gated,
    /// The generation changed mid-send; only `packets` went out.
    Aborted { packets: usize },
}

pub type SendCallback = Box<dyn FnOnce(SendOutcome) + Send>;

/// Packet layout of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPlan {
    pub block_size: u8,
    pub fragments: usize,
    pub parity: usize,
    /// Header plus payload bytes of every packet, parity included.
    pub wire_bytes: usize,
}

impl SendPlan {
    pub fn new(frame_bytes: usize, max_payload: usize, block_size: u8) -> Self {
        let fragments = fec::fragment_count(frame_bytes, max_payload);
        let parity = fec::parity_count(fragments, block_size);
        let parity_bytes: usize = (0..parity)
            .map(|b| fec::parity_len(frame_bytes, max_payload, block_size, b))
            .sum();
        SendPlan {
            block_size,
            fragments,
            parity,
            wire_bytes: frame_bytes + parity_bytes + (fragments + parity) * HEADER_LEN,
        }
    }

    /// Sequence numbers the frame consumes.
    pub fn packets(&self) -> usize {
        self.fragments + self.parity
    }
}

/// One compressed frame ready to be sent. Immutable once queued.
#[derive(Default)]
pub struct WorkItem {
    pub data: Bytes,
    /// Compressed byte count.
    pub frame_bytes: usize,
    pub is_keyframe: bool,
    pub pts: Duration,
    pub content_rect: Rect,
    pub stream_id: u16,
    pub frame_number: u32,
    pub start_sequence: u32,
    /// Base flags applied to every packet of the frame.
    pub flags: FrameFlags,
    pub dimension_token: u16,
    pub epoch: u16,
    pub fec_block_size: u8,
    pub loss_mode: bool,
    pub wire_bytes: usize,
    pub label: String,
    pub generation: u64,
    pub on_complete: Option<SendCallback>,
}

impl WorkItem {
    /// Item carrying `data`, laid out per `plan`. Remaining fields default.
    pub fn new(data: Bytes, is_keyframe: bool, plan: SendPlan) -> Self {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::KEYFRAME, is_keyframe);
        WorkItem {
            frame_bytes: data.len(),
            data,
            is_keyframe,
            flags,
            fec_block_size: plan.block_size,
            loss_mode: plan.block_size > 0,
            wire_bytes: plan.wire_bytes,
            ..WorkItem::default()
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .field("stream_id", &self.stream_id)
            .field("frame_number", &self.frame_number)
            .field("is_keyframe", &self.is_keyframe)
            .field("frame_bytes", &self.frame_bytes)
            .field("wire_bytes", &self.wire_bytes)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// `a` precedes `b` in wrapping frame-number order.
fn frame_precedes(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

// ─── Shared State ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct KeyframeGate {
    /// Most recently admitted keyframe.
    latest: Option<u32>,
    /// Keyframe admitted but not yet fully sent.
    pending: Option<u32>,
}

/// State shared between producers and the send worker.
#[derive(Debug, Default)]
pub struct SenderShared {
    generation: AtomicU64,
    queued_bytes: AtomicUsize,
    gate: Mutex<KeyframeGate>,
    stats: Mutex<SenderStats>,
}

impl SenderShared {
    fn gate(&self) -> MutexGuard<'_, KeyframeGate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats_mut(&self) -> MutexGuard<'_, SenderStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Invalidate everything queued or in flight. Returns the new generation.
    pub fn bump_generation(&self) -> u64 {
        let mut gate = self.gate();
        *gate = KeyframeGate::default();
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn stats(&self) -> SenderStats {
        self.stats_mut().clone()
    }

    fn release_bytes(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .queued_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Admission at enqueue time. Registers admitted keyframes with the gate.
    fn admit(&self, item: &WorkItem) -> Result<(), SendOutcome> {
        let mut gate = self.gate();
        if item.generation != self.generation() {
            return Err(SendOutcome::StaleGeneration);
        }
        if item.is_keyframe {
            if let Some(latest) = gate.latest {
                if frame_precedes(item.frame_number, latest) {
                    return Err(SendOutcome::StaleKeyframe);
                }
            }
            gate.latest = Some(item.frame_number);
            gate.pending = Some(item.frame_number);
        } else if gate.pending.is_some() {
            return Err(SendOutcome::Gated);
        }
        self.queued_bytes.fetch_add(item.wire_bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Re-check at dequeue time.
    fn recheck(&self, item: &WorkItem) -> Result<(), SendOutcome> {
        let gate = self.gate();
        if item.generation != self.generation() {
            return Err(SendOutcome::StaleGeneration);
        }
        if item.is_keyframe {
            match gate.latest {
                Some(latest) if frame_precedes(item.frame_number, latest) => {
                    Err(SendOutcome::StaleKeyframe)
                }
                _ => Ok(()),
            }
        } else if gate.pending.is_some() {
            Err(SendOutcome::Gated)
        } else {
            Ok(())
        }
    }

    fn keyframe_sent(&self, frame_number: u32) {
        let mut gate = self.gate();
        if gate.pending == Some(frame_number) {
            gate.pending = None;
        }
    }

    fn clear_pending_keyframe(&self) {
        self.gate().pending = None;
    }

    fn record_drop(&self, outcome: SendOutcome) {
        let mut stats = self.stats_mut();
        match outcome {
            SendOutcome::StaleGeneration => stats.stale_generation_drops += 1,
            SendOutcome::StaleKeyframe => stats.stale_keyframe_drops += 1,
            SendOutcome::Gated => stats.gated_drops += 1,
            SendOutcome::Aborted { .. } => stats.aborted_mid_send += 1,
            SendOutcome::Sent { .. } => {}
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

enum SenderCommand {
    Send(WorkItem),
    Shutdown,
}

/// Cloneable producer side of a stream's send queue.
#[derive(Clone)]
pub struct SenderHandle {
    tx: Sender<SenderCommand>,
    shared: Arc<SenderShared>,
    max_payload: usize,
}

impl SenderHandle {
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Packet layout for a frame about to be queued.
    pub fn plan(&self, frame_bytes: usize, is_keyframe: bool, loss_mode: bool) -> SendPlan {
        SendPlan::new(
            frame_bytes,
            self.max_payload,
            fec::block_size_for(is_keyframe, loss_mode),
        )
    }

    /// Queue an item. Returns `false` if it was rejected as stale or gated;
    /// its callback has then already run.
    pub fn enqueue(&self, mut item: WorkItem) -> bool {
        if let Err(outcome) = self.shared.admit(&item) {
            debug!(
                stream_id = item.stream_id,
                frame = item.frame_number,
                label = %item.label,
                generation = item.generation,
                ?outcome,
                "work item rejected at enqueue"
            );
            self.shared.record_drop(outcome);
            if let Some(cb) = item.on_complete.take() {
                cb(outcome);
            }
            return false;
        }
        let wire_bytes = item.wire_bytes;
        if let Err(crossbeam_channel::SendError(cmd)) = self.tx.send(SenderCommand::Send(item)) {
            self.shared.release_bytes(wire_bytes);
            if let SenderCommand::Send(mut item) = cmd {
                if let Some(cb) = item.on_complete.take() {
                    cb(SendOutcome::StaleGeneration);
                }
            }
            return false;
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    pub fn bump_generation(&self) -> u64 {
        let generation = self.shared.bump_generation();
        debug!(generation, "sender generation bumped");
        generation
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queued_bytes()
    }

    pub fn stats(&self) -> SenderStats {
        self.shared.stats()
    }
}

impl std::fmt::Debug for SenderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderHandle")
            .field("generation", &self.generation())
            .field("queued_bytes", &self.queued_bytes())
            .finish()
    }
}

// ─── Transmitter ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Cursor {
    sequence: u32,
    in_burst: usize,
    packets: usize,
    parity: usize,
    bytes: usize,
    errors: usize,
}

/// Fragments and sends one item at a time. Pure logic apart from the
/// transport and pacer seams.
pub struct FrameTransmitter<T, P> {
    shared: Arc<SenderShared>,
    transport: T,
    pacer: P,
    pool: PacketBufferPool,
    max_payload: usize,
    pacing: Vec<PacingTier>,
}

impl<T: PacketTransport, P: Pacer> FrameTransmitter<T, P> {
    pub fn pool(&self) -> &PacketBufferPool {
        &self.pool
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send (or discard) one item and report what happened.
    pub fn transmit(&mut self, mut item: WorkItem) -> SendOutcome {
        let callback = item.on_complete.take();
        let (outcome, accounted) = match self.shared.recheck(&item) {
            Err(outcome) => {
                debug!(
                    stream_id = item.stream_id,
                    frame = item.frame_number,
                    label = %item.label,
                    ?outcome,
                    "work item dropped at dequeue"
                );
                (outcome, 0)
            }
            Ok(()) => self.send_fragments(&item),
        };
        self.shared
            .release_bytes(item.wire_bytes.saturating_sub(accounted));

        match outcome {
            SendOutcome::Sent { .. } if item.is_keyframe => {
                self.shared.keyframe_sent(item.frame_number)
            }
            SendOutcome::Aborted { packets } => {
                self.shared.clear_pending_keyframe();
                debug!(
                    stream_id = item.stream_id,
                    frame = item.frame_number,
                    packets,
                    "send aborted by generation change"
                );
            }
            _ => {}
        }
        self.shared.record_drop(outcome);
        if let Some(cb) = callback {
            cb(outcome);
        }
        outcome
    }

    fn send_fragments(&mut self, item: &WorkItem) -> (SendOutcome, usize) {
        let max_payload = self.max_payload;
        let frame = &item.data[..];
        let fragments = fec::fragment_count(frame.len(), max_payload);
        let block = item.fec_block_size as usize;
        let tier = select_tier(&self.pacing, item.wire_bytes, item.loss_mode);
        let base = FrameHeader {
            flags: item.flags,
            stream_id: item.stream_id,
            sequence: 0,
            timestamp_us: item.pts.as_micros() as u64,
            frame_number: item.frame_number,
            fragment_index: 0,
            fragment_count: fragments as u16,
            payload_len: 0,
            fec_block_size: item.fec_block_size,
            frame_bytes: frame.len() as u32,
            checksum: 0,
            content_rect: item.content_rect,
            dimension_token: item.dimension_token,
            epoch: item.epoch,
        };
        let mut cursor = Cursor {
            sequence: item.start_sequence,
            ..Cursor::default()
        };

        let mut aborted = false;
        'fragments: for index in 0..fragments {
            if !self.burst_gate(item, &tier, &mut cursor) {
                aborted = true;
                break;
            }
            let start = index * max_payload;
            let end = (start + max_payload).min(frame.len());
            let mut header = base.clone();
            header.fragment_index = index as u16;
            header.flags.set(FrameFlags::END_OF_FRAME, index + 1 == fragments);
            self.emit(&mut header, &mut cursor, |buf| {
                buf.extend_from_slice(&frame[start.min(end)..end])
            });

            if block > 0 && ((index + 1) % block == 0 || index + 1 == fragments) {
                if !self.burst_gate(item, &tier, &mut cursor) {
                    aborted = true;
                    break 'fragments;
                }
                let block_index = index / block;
                let len = fec::parity_len(frame.len(), max_payload, block as u8, block_index);
                let mut header = base.clone();
                header.flags.insert(FrameFlags::FEC_PARITY);
                header.fragment_index = block_index as u16;
                self.emit(&mut header, &mut cursor, |buf| {
                    let at = buf.len();
                    buf.resize(at + len, 0);
                    fec::encode_block_parity(
                        &mut buf[at..],
                        frame,
                        max_payload,
                        block as u8,
                        block_index,
                    );
                });
                cursor.parity += 1;
            }
        }

        {
            let mut stats = self.shared.stats_mut();
            stats.packets_sent += cursor.packets as u64;
            stats.parity_packets_sent += cursor.parity as u64;
            stats.bytes_sent += cursor.bytes as u64;
            stats.transport_errors += cursor.errors as u64;
            if !aborted {
                stats.frames_sent += 1;
                if item.is_keyframe {
                    stats.keyframes_sent += 1;
                }
            }
        }
        if cursor.errors > 0 {
            warn!(
                stream_id = item.stream_id,
                frame = item.frame_number,
                errors = cursor.errors,
                packets = cursor.packets,
                "transport rejected packets"
            );
        }

        let outcome = if aborted {
            SendOutcome::Aborted {
                packets: cursor.packets,
            }
        } else {
            SendOutcome::Sent {
                packets: cursor.packets,
            }
        };
        (outcome, cursor.bytes)
    }

    /// Pause between bursts and re-check the generation at the start of each
    /// burst. Returns `false` when the item went stale.
    fn burst_gate(&mut self, item: &WorkItem, tier: &PacingTier, cursor: &mut Cursor) -> bool {
        if cursor.in_burst >= tier.burst {
            self.pacer.pause(tier.delay);
            cursor.in_burst = 0;
        }
        cursor.in_burst > 0 || self.shared.generation() == item.generation
    }

    fn emit(
        &mut self,
        header: &mut FrameHeader,
        cursor: &mut Cursor,
        fill: impl FnOnce(&mut BytesMut),
    ) {
        let mut packet = self.pool.acquire();
        packet.resize(HEADER_LEN, 0);
        fill(&mut packet);

        let payload = &packet[HEADER_LEN..];
        header.payload_len = payload.len() as u16;
        header.checksum = crc32(payload);
        header.sequence = cursor.sequence;
        {
            let mut slot: &mut [u8] = &mut packet[..HEADER_LEN];
            header.encode(&mut slot);
        }

        let len = packet.len();
        cursor.sequence = cursor.sequence.wrapping_add(1);
        cursor.in_burst += 1;
        cursor.packets += 1;
        cursor.bytes += len;
        if let Err(err) = self.transport.send_packet(packet) {
            cursor.errors += 1;
            debug!(sequence = header.sequence, error = %err, "packet send failed");
        }
        self.shared.release_bytes(len);
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Consumer side of the send queue.
pub struct SendWorker<T, P> {
    rx: Receiver<SenderCommand>,
    transmitter: FrameTransmitter<T, P>,
}

impl<T: PacketTransport, P: Pacer> SendWorker<T, P> {
    pub fn transmitter(&self) -> &FrameTransmitter<T, P> {
        &self.transmitter
    }

    pub fn transmitter_mut(&mut self) -> &mut FrameTransmitter<T, P> {
        &mut self.transmitter
    }

    /// Process everything queued right now without blocking. Returns the
    /// outcome of each item in queue order.
    pub fn process_pending(&mut self) -> Vec<SendOutcome> {
        std::iter::from_fn(|| self.process_next()).collect()
    }

    /// Transmit the next queued item without blocking. `None` when the queue
    /// is empty or shutdown was requested.
    pub fn process_next(&mut self) -> Option<SendOutcome> {
        match self.rx.try_recv().ok()? {
            SenderCommand::Send(item) => Some(self.transmitter.transmit(item)),
            SenderCommand::Shutdown => None,
        }
    }

    /// Block on the queue until shutdown. Items still queued at shutdown are
    /// discarded, never sent.
    pub fn run(mut self) {
        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                SenderCommand::Send(item) => {
                    self.transmitter.transmit(item);
                }
                SenderCommand::Shutdown => break,
            }
        }
        let shared = self.transmitter.shared.clone();
        for cmd in self.rx.try_iter() {
            if let SenderCommand::Send(mut item) = cmd {
                shared.release_bytes(item.wire_bytes);
                shared.record_drop(SendOutcome::StaleGeneration);
                if let Some(cb) = item.on_complete.take() {
                    cb(SendOutcome::StaleGeneration);
                }
            }
        }
    }
}

/// Build a connected handle/worker pair without spawning a thread.
pub fn sender_channel<T: PacketTransport, P: Pacer>(
    settings: &SenderSettings,
    transport: T,
    pacer: P,
) -> (SenderHandle, SendWorker<T, P>) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(SenderShared::default());
    let pool = PacketBufferPool::new(settings.max_payload_size, settings.pool_max_cached);
    let handle = SenderHandle {
        tx,
        shared: shared.clone(),
        max_payload: settings.max_payload_size,
    };
    let worker = SendWorker {
        rx,
        transmitter: FrameTransmitter {
            shared,
            transport,
            pacer,
            pool,
            max_payload: settings.max_payload_size,
            pacing: settings.pacing.clone(),
        },
    };
    (handle, worker)
}

// ─── Threaded Sender ────────────────────────────────────────────────────────

/// Send worker running on its own thread.
pub struct PacketSender {
    handle: SenderHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl PacketSender {
    pub fn spawn<T: PacketTransport + 'static>(
        stream_id: u16,
        settings: &SenderSettings,
        transport: T,
    ) -> io::Result<Self> {
        let (handle, worker) = sender_channel(settings, transport, ThreadPacer);
        worker.transmitter.pool.prefill(64);
        let thread = thread::Builder::new()
            .name(format!("driftcast-send-{stream_id}"))
            .spawn(move || worker.run())?;
        Ok(PacketSender {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    /// Discard everything queued, stop the worker and wait for it. No packet
    /// is sent after this returns. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.bump_generation();
            let _ = self.handle.tx.send(SenderCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for PacketSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}
