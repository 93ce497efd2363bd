//! Buffer manager: one raw buffer per output table
//!
//! Every append goes through [`BufferManager::append`]. A buffer that becomes
//! full is flushed to the sink before the call returns, and
//! [`BufferManager::finalize`] drains every non-empty buffer exactly once.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::library::{BufferLibrary, Routing};
use super::raw_buffer::{RawBuffer, TableChunk};
use crate::decoders::SchemaProvider;
use crate::sink::OutputSink;
use crate::types::{DecodedRecord, TableSchema};
use crate::{ConversionError, Result};

/// Default rows per buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// What happened to an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Held in its buffer
    Buffered,
    /// Filled its buffer, which was then flushed
    Flushed,
    /// No buffer library entry matched; dropped
    Unrouted,
    /// Its table was taken out of service earlier; dropped
    Discarded,
}

/// Owns the raw buffers of one run and the sink they flush to.
pub struct BufferManager<S> {
    sink: S,
    library: BufferLibrary,
    default_capacity: usize,
    buffers: BTreeMap<String, RawBuffer>,
    /// Rows handed to the sink per table
    flushed_rows: BTreeMap<String, u64>,
    failed_tables: BTreeSet<String>,
    unrouted: u64,
    discarded: u64,
    flushes: u64,
    closed: bool,
}

impl<S: OutputSink> BufferManager<S> {
    pub fn new(sink: S, library: BufferLibrary, default_capacity: usize) -> Self {
        Self {
            sink,
            library,
            default_capacity: default_capacity.max(1),
            buffers: BTreeMap::new(),
            flushed_rows: BTreeMap::new(),
            failed_tables: BTreeSet::new(),
            unrouted: 0,
            discarded: 0,
            flushes: 0,
            closed: false,
        }
    }

    /// Route `record` to its table's buffer, flushing the buffer if it fills.
    ///
    /// A record disagreeing with its table's schema takes that table out of
    /// service: rows already buffered are flushed, the error is returned and
    /// later records for the table are discarded.
    pub fn append(&mut self, record: DecodedRecord, schemas: &dyn SchemaProvider) -> Result<AppendOutcome> {
        if self.closed {
            return Err(ConversionError::config("buffer manager", "append after finalize"));
        }

        let (table, capacity) = match self.library.resolve(&record.stream) {
            Routing::Table { table, capacity } => (table, capacity),
            Routing::Default => (schemas.default_table(&record.stream), None),
            Routing::Unrouted => {
                self.unrouted += 1;
                return Ok(AppendOutcome::Unrouted);
            }
        };

        if self.failed_tables.contains(&table) {
            self.discarded += 1;
            return Ok(AppendOutcome::Discarded);
        }

        let default_capacity = self.default_capacity;
        let buffer = self.buffers.entry(table.clone()).or_insert_with(|| {
            let schema = schemas
                .declared_schema(&record.stream)
                .unwrap_or_else(|| TableSchema::from_record(&record));
            let capacity = capacity.unwrap_or(default_capacity);
            debug!("Created buffer for table '{}' ({} fields, {} rows)", table, schema.field_count(), capacity);
            RawBuffer::new(table.clone(), schema, capacity)
        });

        match buffer.append(record) {
            Ok(()) => {}
            Err(e @ ConversionError::SchemaMismatch { .. }) => {
                warn!("Taking table '{}' out of service: {}", table, e);
                self.discarded += 1;
                self.failed_tables.insert(table.clone());
                self.flush(&table)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        if buffer.is_full() {
            self.flush(&table)?;
            return Ok(AppendOutcome::Flushed);
        }
        Ok(AppendOutcome::Buffered)
    }

    /// Flush one table's buffer to the sink.
    fn flush(&mut self, table: &str) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(table) else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }

        let chunk = buffer.drain();
        let rows = chunk.rows as u64;
        self.sink.append(table, &chunk)?;
        *self.flushed_rows.entry(table.to_string()).or_default() += rows;
        self.flushes += 1;
        debug!("Flushed {} rows to table '{}'", rows, table);
        Ok(())
    }

    /// Reinstate a table written by an earlier run.
    ///
    /// `flushed` rows are already in the sink; `tail` holds rows of a batch
    /// that was never filled and goes back into the buffer.
    pub fn restore_table(
        &mut self,
        table: &str,
        schema: TableSchema,
        capacity: usize,
        flushed: u64,
        tail: Option<TableChunk>,
    ) -> Result<()> {
        let mut buffer = RawBuffer::new(table, schema, capacity);
        if let Some(tail) = tail {
            buffer.restore(tail)?;
        }
        debug!("Restored table '{}': {} rows on disk, {} buffered", table, flushed, buffer.len());
        self.flushed_rows.insert(table.to_string(), flushed);
        self.buffers.insert(table.to_string(), buffer);
        Ok(())
    }

    /// Keep a table out of service, e.g. one that failed in an earlier run.
    pub fn mark_failed(&mut self, table: &str) {
        self.failed_tables.insert(table.to_string());
    }

    /// Capacity a table's buffer has or would get.
    pub fn capacity_for(&self, table: &str) -> usize {
        match self.buffers.get(table) {
            Some(buffer) => buffer.capacity(),
            None => self.default_capacity,
        }
    }

    /// Flush every non-empty buffer, then close the sink. Idempotent.
    ///
    /// All buffers are attempted even if one fails; the first error is returned.
    pub fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let tables: Vec<String> = self.buffers.keys().cloned().collect();
        let mut first_error = None;
        for table in tables {
            if let Err(e) = self.flush(&table) {
                warn!("Final flush of table '{}' failed: {}", table, e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.sink.close() {
            first_error.get_or_insert(e);
        }

        info!(
            "Buffers drained: {} tables, {} rows in {} flushes",
            self.flushed_rows.len(),
            self.flushed_rows.values().sum::<u64>(),
            self.flushes
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rows handed to the sink per table
    pub fn flushed_rows(&self) -> &BTreeMap<String, u64> {
        &self.flushed_rows
    }

    /// Rows still held in memory
    pub fn buffered_rows(&self) -> usize {
        self.buffers.values().map(RawBuffer::len).sum()
    }

    pub fn buffer(&self, table: &str) -> Option<&RawBuffer> {
        self.buffers.get(table)
    }

    pub fn failed_tables(&self) -> &BTreeSet<String> {
        &self.failed_tables
    }

    pub fn unrouted(&self) -> u64 {
        self.unrouted
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::types::{StreamKey, Value};
    use anyhow::Result;
    use proptest::prelude::*;

    /// Schema provider with no declared schemas
    struct Lazy;

    impl SchemaProvider for Lazy {
        fn declared_schema(&self, _stream: &StreamKey) -> Option<TableSchema> {
            None
        }

        fn default_table(&self, stream: &StreamKey) -> String {
            format!("{}_{}", stream.decoder, stream.key)
        }
    }

    fn record(key: u32, id: u64, wf_len: usize) -> DecodedRecord {
        let mut record = DecodedRecord::new(StreamKey::new("Test", key));
        record.push("packet_id", Value::UInt64(id));
        record.push("waveform", Value::Waveform(vec![0; wf_len]));
        record
    }

    #[test]
    fn test_flush_on_full_and_drain_on_close() -> Result<()> {
        let mut manager = BufferManager::new(MemorySink::new(), BufferLibrary::new(), 2);

        assert_eq!(manager.append(record(0, 0, 4), &Lazy)?, AppendOutcome::Buffered);
        assert_eq!(manager.append(record(1, 1, 4), &Lazy)?, AppendOutcome::Buffered);
        assert_eq!(manager.append(record(0, 2, 4), &Lazy)?, AppendOutcome::Flushed);
        assert_eq!(manager.sink().rows("Test_0"), 2);
        assert_eq!(manager.buffered_rows(), 1);

        manager.finalize()?;
        manager.finalize()?;
        assert_eq!(manager.buffered_rows(), 0);
        assert_eq!(manager.sink().rows("Test_1"), 1);
        assert_eq!(manager.sink().chunks("Test_1").len(), 1);
        assert!(manager.sink().is_closed());
        assert!(manager.append(record(0, 3, 4), &Lazy).is_err());
        Ok(())
    }

    #[test]
    fn test_schema_mismatch_disables_only_that_table() -> Result<()> {
        let mut manager = BufferManager::new(MemorySink::new(), BufferLibrary::new(), 10);
        manager.append(record(0, 0, 4), &Lazy)?;
        manager.append(record(1, 1, 4), &Lazy)?;

        let err = manager.append(record(0, 2, 8), &Lazy).unwrap_err();
        assert!(matches!(err, ConversionError::SchemaMismatch { .. }));
        assert!(!err.is_fatal_for_run());
        // Rows buffered before the mismatch were flushed
        assert_eq!(manager.sink().rows("Test_0"), 1);

        assert_eq!(manager.append(record(0, 3, 4), &Lazy)?, AppendOutcome::Discarded);
        assert_eq!(manager.append(record(1, 4, 4), &Lazy)?, AppendOutcome::Buffered);
        manager.finalize()?;
        assert_eq!(manager.sink().rows("Test_1"), 2);
        assert_eq!(manager.discarded(), 2);
        assert!(manager.failed_tables().contains("Test_0"));
        Ok(())
    }

    #[test]
    fn test_library_routing_and_unrouted() -> Result<()> {
        let library = BufferLibrary::from_yaml("Test:\n  merged_{key}:\n    key_list: [1]\n    capacity: 1\n")?;
        let mut manager = BufferManager::new(MemorySink::new(), library, 100);

        assert_eq!(manager.append(record(1, 0, 2), &Lazy)?, AppendOutcome::Flushed);
        assert_eq!(manager.append(record(2, 1, 2), &Lazy)?, AppendOutcome::Unrouted);
        manager.finalize()?;
        assert_eq!(manager.sink().rows("merged_1"), 1);
        assert_eq!(manager.unrouted(), 1);
        assert_eq!(manager.sink().table_names(), vec!["merged_1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_restored_tail_completes_batch() -> Result<()> {
        let mut first = RawBuffer::new("Test_0", TableSchema::from_record(&record(0, 0, 2)), 3);
        first.append(record(0, 0, 2))?;
        let tail = first.drain();

        let mut manager = BufferManager::new(MemorySink::new(), BufferLibrary::new(), 3);
        manager.restore_table("Test_0", TableSchema::from_record(&record(0, 0, 2)), 3, 3, Some(tail))?;
        manager.append(record(0, 1, 2), &Lazy)?;
        assert_eq!(manager.append(record(0, 2, 2), &Lazy)?, AppendOutcome::Flushed);
        assert_eq!(manager.flushed_rows().get("Test_0"), Some(&6));
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_loss_free_and_bounded(
            keys in prop::collection::vec(0u32..4, 0..200),
            capacity in 1usize..16
        ) {
            let mut manager = BufferManager::new(MemorySink::new(), BufferLibrary::new(), capacity);
            for (i, key) in keys.iter().enumerate() {
                manager.append(record(*key, i as u64, 2), &Lazy).unwrap();
                for table in ["Test_0", "Test_1", "Test_2", "Test_3"] {
                    if let Some(buffer) = manager.buffer(table) {
                        prop_assert!(buffer.len() < capacity);
                        prop_assert!(buffer.column_lengths().iter().all(|&l| l == buffer.len()));
                    }
                }
            }
            manager.finalize().unwrap();

            prop_assert_eq!(manager.buffered_rows(), 0);
            let total: u64 = manager.flushed_rows().values().sum();
            prop_assert_eq!(total, keys.len() as u64);
            for key in 0u32..4 {
                let expected = keys.iter().filter(|&&k| k == key).count();
                prop_assert_eq!(manager.sink().rows(&format!("Test_{}", key)), expected);
            }
        }
    }
}
