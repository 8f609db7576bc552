//! # driftcast-stream
//!
//! Per-stream capture → encode → send pipeline for real-time screen
//! streaming over lossy, bandwidth-constrained links.
//!
//! Frames pushed by a capture source are coalesced in a latest-frame-biased
//! inbox, scheduled onto a hardware encoder with stall recovery, keyframe
//! cadence and adaptive quality, then fragmented into MTU-sized wire packets
//! with optional XOR parity and paced bursts.
//!
//! ## Crate structure
//!
//! - [`frame`]: Captured frame and per-frame metadata
//! - [`inbox`]: Bounded, latest-frame-biased frame inbox
//! - [`throttle`]: Capture cadence → target frame-rate throttle
//! - [`keyframe`]: Keyframe scheduler, motion estimate, epochs
//! - [`quality`]: Closed-loop quality / in-flight depth controller
//! - [`geometry`]: Capture/encode geometry and dimension tokens
//! - [`pool`]: Reusable packet buffer pool
//! - [`wire`]: Bit-exact frame header codec
//! - [`fec`]: XOR block parity
//! - [`sender`]: WorkItem, generation gating, paced fragment sender
//! - [`encoder`] / [`capture`]: Seams to the external collaborators
//! - [`pipeline`]: Stream controller and its worker runtime
//! - [`registry`]: Arena of running streams
//! - [`stats`]: Metrics snapshots, EWMA, rate counters
//! - [`transport`]: UDP packet transport

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod fec;
pub mod frame;
pub mod geometry;
pub mod inbox;
pub mod keyframe;
pub mod pipeline;
pub mod pool;
pub mod quality;
pub mod registry;
pub mod sender;
pub mod stats;
pub mod throttle;
pub mod transport;
pub mod wire;

pub use config::StreamConfig;
pub use error::{StreamError, StreamResult};
pub use pipeline::runtime::StreamRuntime;
