//! Error taxonomy for the stream pipeline.
//!
//! Only resource acquisition failures and invalid lifecycle transitions are
//! surfaced as [`StreamError`]. Per-frame encoder refusals are
//! [`EncodeRejection`]s, counted and dropped. Stalls and reconfiguration races
//! never surface as errors at all.

use thiserror::Error;

use crate::pipeline::controller::StreamState;

/// Failure reported by the hardware encoder seam.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder session creation failed: {0}")]
    SessionCreate(String),
    #[error("unsupported dimensions {width}x{height}")]
    UnsupportedDimensions { width: u32, height: u32 },
    #[error("encoder reset failed: {0}")]
    Reset(String),
    #[error("no active encoder session")]
    NoSession,
}

/// Failure reported by the capture source seam.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture start failed: {0}")]
    Start(String),
    #[error("capture reconfiguration failed: {0}")]
    Reconfigure(String),
    #[error("capture target unavailable: {0}")]
    TargetUnavailable(String),
}

/// Invalid or unreadable stream configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("{field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

/// Hard stream failures.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid transition from {from:?}: {action}")]
    InvalidState {
        from: StreamState,
        action: &'static str,
    },
    #[error("stream worker is gone")]
    Disconnected,
    #[error("stream registry full ({0} streams)")]
    RegistryFull(usize),
    #[error("unknown stream {0}")]
    UnknownStream(u16),
    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// A single frame the encoder declined. Transient: the frame is dropped and
/// the pipeline continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeRejection {
    #[error("encoder queue full")]
    QueueFull,
    #[error("frame dimensions do not match session")]
    DimensionMismatch,
    #[error("encoder inactive")]
    Inactive,
    #[error("no encoder session")]
    NoSession,
    #[error("encode failed: {0}")]
    Failed(String),
}

/// Header decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported header version {0}")]
    Version(u8),
    #[error("payload length {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload checksum mismatch")]
    Checksum,
}
