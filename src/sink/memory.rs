//! In-memory sink

use std::collections::BTreeMap;

use super::OutputSink;
use crate::buffer::TableChunk;
use crate::types::Value;
use crate::{ConversionError, Result};

/// Keeps every flushed chunk in memory, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, Vec<TableChunk>>,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Chunks of `table` in flush order
    pub fn chunks(&self, table: &str) -> &[TableChunk] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Total rows written to `table`
    pub fn rows(&self, table: &str) -> usize {
        self.chunks(table).iter().map(|c| c.rows).sum()
    }

    /// Every row of `table`, flattened across chunks
    pub fn records(&self, table: &str) -> Vec<Vec<Value>> {
        self.chunks(table).iter().flat_map(|chunk| (0..chunk.rows).filter_map(|row| chunk.row(row))).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl OutputSink for MemorySink {
    fn append(&mut self, table: &str, chunk: &TableChunk) -> Result<()> {
        if self.closed {
            return Err(ConversionError::config("memory sink", format!("append to '{}' after close", table)));
        }
        if let Some(first) = self.tables.get(table).and_then(|c| c.first())
            && first.schema != chunk.schema
        {
            return Err(ConversionError::schema_mismatch(table, "chunk schema differs from the table's"));
        }
        self.tables.entry(table.to_string()).or_default().push(chunk.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
