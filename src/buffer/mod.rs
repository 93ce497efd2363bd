//! Columnar buffering of decoded records
//!
//! - [`RawBuffer`] accumulates the rows of one table
//! - [`BufferLibrary`] decides which table a decoder stream goes to
//! - [`BufferManager`] owns the buffers of a run and flushes them to the sink

pub mod library;
pub mod manager;
pub mod raw_buffer;

pub use library::{BufferLibrary, BufferLibraryConfig, BufferSpec, KeySpec, Routing, render_table_name};
pub use manager::{AppendOutcome, BufferManager, DEFAULT_BUFFER_SIZE};
pub use raw_buffer::{ColumnData, RawBuffer, TableChunk};
