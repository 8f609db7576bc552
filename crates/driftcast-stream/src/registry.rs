//! Arena of running streams.
//!
//! Streams live in a slab; the slot key doubles as the stream id carried in
//! every wire header, so ids are small, dense and reused after a stream is
//! removed.

use slab::Slab;
use tracing::info;

use crate::capture::{CaptureSource, CaptureTarget};
use crate::config::StreamConfig;
use crate::encoder::VideoEncoder;
use crate::error::{StreamError, StreamResult};
use crate::pipeline::runtime::StreamRuntime;
use crate::sender::PacketTransport;
use crate::stats::StreamMetrics;

/// Largest number of concurrent streams a registry will host.
pub const MAX_STREAMS: usize = 64;

/// Running streams keyed by stream id.
pub struct StreamRegistry {
    streams: Slab<StreamRuntime>,
    max_streams: usize,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STREAMS)
    }

    pub fn with_capacity(max_streams: usize) -> Self {
        let max_streams = max_streams.clamp(1, u16::MAX as usize + 1);
        StreamRegistry {
            streams: Slab::with_capacity(max_streams.min(MAX_STREAMS)),
            max_streams,
        }
    }

    /// Start a stream in the next free slot and return its id.
    pub fn start<T: PacketTransport + 'static>(
        &mut self,
        config: StreamConfig,
        target: CaptureTarget,
        encoder: Box<dyn VideoEncoder>,
        capture: Box<dyn CaptureSource>,
        transport: T,
    ) -> StreamResult<u16> {
        if self.streams.len() >= self.max_streams {
            return Err(StreamError::RegistryFull(self.max_streams));
        }
        let entry = self.streams.vacant_entry();
        let id = u16::try_from(entry.key()).map_err(|_| StreamError::RegistryFull(self.max_streams))?;
        let runtime = StreamRuntime::start(id, config, target, encoder, capture, transport)?;
        entry.insert(runtime);
        info!(stream_id = id, active = self.streams.len(), "stream registered");
        Ok(id)
    }

    pub fn get(&self, id: u16) -> Option<&StreamRuntime> {
        self.streams.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut StreamRuntime> {
        self.streams.get_mut(id as usize)
    }

    /// Stop and remove a stream. Its id becomes free for reuse.
    pub fn stop(&mut self, id: u16) -> StreamResult<()> {
        let mut runtime = self
            .streams
            .try_remove(id as usize)
            .ok_or(StreamError::UnknownStream(id))?;
        runtime.stop();
        info!(stream_id = id, active = self.streams.len(), "stream removed");
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for mut runtime in self.streams.drain() {
            runtime.stop();
        }
    }

    pub fn ids(&self) -> Vec<u16> {
        self.streams.iter().map(|(key, _)| key as u16).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Snapshot every stream that still answers.
    pub fn metrics(&self) -> Vec<StreamMetrics> {
        self.streams
            .iter()
            .filter_map(|(_, runtime)| runtime.metrics().ok())
            .collect()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
