//! Output sinks consuming flushed buffers

pub mod ipc;
pub mod memory;

pub use ipc::{ArrowSink, RestoredTable, WriteMode, read_table};
pub use memory::MemorySink;

use crate::Result;
use crate::buffer::TableChunk;

/// Append-only table store.
///
/// Each table is created on its first append and keeps the schema of that
/// first chunk. Nothing may be appended after [`OutputSink::close`].
pub trait OutputSink: Send {
    /// Append `chunk` as the next batch of `table`
    fn append(&mut self, table: &str, chunk: &TableChunk) -> Result<()>;

    /// Finish every table
    fn close(&mut self) -> Result<()>;
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn append(&mut self, table: &str, chunk: &TableChunk) -> Result<()> {
        (**self).append(table, chunk)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
