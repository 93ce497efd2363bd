//! Legacy record file format support
//!
//! Self-describing files written by the DAQ host: a versioned file header, a
//! YAML run header, then back-to-back fixed-header packets.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{FileHeader, LEGACY_MAGIC};
pub use reader::LegacyReader;
pub use writer::LegacyWriter;
