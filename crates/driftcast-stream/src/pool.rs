//! # Packet Buffer Pool
//!
//! Free-list of reusable packet buffers for the send hot path. A buffer is
//! acquired, filled in place with header and payload, handed to the
//! transport, and returns to the pool when the transport drops it. In steady
//! state no packet allocates.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::wire::HEADER_LEN;

// ─── Pool Stats ──────────────────────────────────────────────────────────────

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created because the free list was empty.
    pub allocated: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    /// Buffers dropped on release because the free list was full.
    pub discarded: u64,
    /// Buffers currently parked in the free list.
    pub cached: usize,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_cached: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn release(&self, mut buf: BytesMut) {
        // A buffer that was split or frozen elsewhere may have lost capacity.
        if buf.capacity() < self.buffer_capacity {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_cached {
            free.push(buf);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─── PacketBufferPool ────────────────────────────────────────────────────────

/// Shared free-list of packet buffers. Cloning shares the same pool.
#[derive(Clone)]
pub struct PacketBufferPool {
    inner: Arc<PoolInner>,
}

impl PacketBufferPool {
    /// Pool of buffers large enough for one header plus `max_payload` bytes.
    pub fn new(max_payload: usize, max_cached: usize) -> Self {
        PacketBufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_cached.min(1024))),
                buffer_capacity: HEADER_LEN + max_payload,
                max_cached,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer, allocating only if the free list is empty.
    pub fn acquire(&self) -> PooledPacket {
        let cached = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let buf = match cached {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.buffer_capacity)
            }
        };
        PooledPacket {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Pre-populate the free list so the first frames do not allocate.
    pub fn prefill(&self, count: usize) {
        let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
        while free.len() < count.min(self.inner.max_cached) {
            free.push(BytesMut::with_capacity(self.inner.buffer_capacity));
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            cached: self.inner.free.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}

impl std::fmt::Debug for PacketBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBufferPool")
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

// ─── PooledPacket ────────────────────────────────────────────────────────────

/// One packet buffer on loan from the pool. Dropping it releases the buffer.
pub struct PooledPacket {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl PooledPacket {
    /// Detach the buffer from the pool; it will not be returned.
    pub fn into_inner(mut self) -> BytesMut {
        self.buf.take().unwrap_or_default()
    }
}

impl Deref for PooledPacket {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only `into_inner` and `drop` take the buffer, and both consume self.
        match &self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl DerefMut for PooledPacket {
    fn deref_mut(&mut self) -> &mut BytesMut {
        match &mut self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl AsRef<[u8]> for PooledPacket {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPacket")
            .field("len", &self.len())
            .finish()
    }
}
