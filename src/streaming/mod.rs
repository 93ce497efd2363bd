//! Streaming format support
//!
//! A DAQ server (or a recording of one) sends a fixed handshake followed by
//! length-prefixed frames: configuration, events and periodic status.

pub mod frame;

pub use frame::{FrameAssembler, Handshake, STREAM_MAGIC, encode_frame, tags};
