//! Stream orchestration: the single-threaded controller, the encoder output
//! hand-off, the state both share, and the worker thread that drives them.

pub mod controller;
pub mod emitter;
pub mod runtime;
pub mod shared;

pub use controller::{Reconfiguration, StreamController, StreamState};
pub use emitter::{FrameEmitter, StreamEvent};
pub use shared::StreamShared;
