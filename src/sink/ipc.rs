//! Arrow IPC file sink
//!
//! Every table is written to `<dir>/<table>.arrow`, one record batch per
//! flush. Waveforms become `FixedSizeList<UInt16>` columns and field
//! attributes are stored as a single JSON `attrs` metadata entry, so the same
//! chunks always produce the same bytes.

use arrow::array::{
    Array, ArrayData, ArrayRef, AsArray, BinaryArray, FixedSizeListArray, Float32Array, Float64Array, Int32Array,
    Int64Array, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int32Type, Int64Type, Schema, SchemaRef, UInt8Type, UInt16Type,
    UInt32Type, UInt64Type,
};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::OutputSink;
use crate::buffer::{ColumnData, TableChunk};
use crate::checkpoint::CHECKPOINT_FILE;
use crate::types::{ColumnType, FieldSpec, TableSchema};
use crate::{ConversionError, Result};

/// File extension of output tables
pub const TABLE_EXTENSION: &str = "arrow";

const ATTRS_KEY: &str = "attrs";

/// What to do with tables already present in the output directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Delete existing tables and the checkpoint
    Overwrite,
    /// Continue the tables of an interrupted run
    Resume,
    /// Refuse to touch an output directory that already holds tables
    #[default]
    Fresh,
}

/// Table reloaded from an earlier run.
#[derive(Debug, Clone)]
pub struct RestoredTable {
    pub schema: TableSchema,
    /// Rows kept on disk
    pub flushed: u64,
    /// Rows of a batch that never filled, to be buffered again
    pub tail: Option<TableChunk>,
}

struct TableWriter {
    writer: FileWriter<BufWriter<File>>,
    schema: SchemaRef,
    batches: usize,
}

/// Writes each table to its own Arrow IPC file.
pub struct ArrowSink {
    dir: PathBuf,
    writers: BTreeMap<String, TableWriter>,
    closed: bool,
}

impl ArrowSink {
    /// Prepare `dir` for output according to `mode`.
    pub fn create(dir: impl Into<PathBuf>, mode: WriteMode) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ConversionError::file_error(dir.clone(), e))?;

        let existing = existing_tables(&dir)?;
        let checkpoint = dir.join(CHECKPOINT_FILE);
        match mode {
            WriteMode::Fresh => {
                if !existing.is_empty() || checkpoint.exists() {
                    return Err(ConversionError::config(
                        format!("output directory {}", dir.display()),
                        format!("{} tables already exist; use overwrite or resume", existing.len()),
                    ));
                }
            }
            WriteMode::Overwrite => {
                for table in &existing {
                    let path = table_path(&dir, table);
                    std::fs::remove_file(&path).map_err(|e| ConversionError::file_error(path, e))?;
                }
                if checkpoint.exists() {
                    std::fs::remove_file(&checkpoint).map_err(|e| ConversionError::file_error(checkpoint, e))?;
                }
                if !existing.is_empty() {
                    info!("Removed {} existing tables from {}", existing.len(), dir.display());
                }
            }
            WriteMode::Resume => {}
        }

        Ok(Self { dir, writers: BTreeMap::new(), closed: false })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        table_path(&self.dir, table)
    }

    /// Reload the tables of an interrupted run.
    ///
    /// `capacities` gives each table's buffer capacity in that run. Batches
    /// holding a full buffer are rewritten as they were; a trailing shorter
    /// batch is returned as the table's tail instead. Tables listed in
    /// `failed` are rewritten whole.
    pub fn restore(
        &mut self,
        capacities: &BTreeMap<String, usize>,
        failed: &[String],
    ) -> Result<BTreeMap<String, RestoredTable>> {
        let mut restored = BTreeMap::new();

        for table in existing_tables(&self.dir)? {
            let Some(&capacity) = capacities.get(&table) else {
                return Err(ConversionError::config(
                    "resume",
                    format!("table '{}' in {} is not in the checkpoint", table, self.dir.display()),
                ));
            };

            let (schema, mut chunks) = read_table(&self.table_path(&table))?;
            let is_failed = failed.contains(&table);
            let tail = match chunks.last() {
                Some(last) if !is_failed && last.rows < capacity => chunks.pop(),
                _ => None,
            };

            if chunks.is_empty() {
                // Only the tail survives; the file comes back at the next flush
                let path = self.table_path(&table);
                std::fs::remove_file(&path).map_err(|e| ConversionError::file_error(path, e))?;
            }
            let mut flushed = 0u64;
            for chunk in &chunks {
                self.append(&table, chunk)?;
                flushed += chunk.rows as u64;
            }
            debug!(
                "Restored table '{}': {} batches rewritten, {} tail rows",
                table,
                chunks.len(),
                tail.as_ref().map_or(0, |t| t.rows)
            );
            restored.insert(table, RestoredTable { schema, flushed, tail });
        }

        Ok(restored)
    }

    fn open_writer(&self, table: &str, schema: &TableSchema) -> Result<TableWriter> {
        let path = self.table_path(table);
        let schema = Arc::new(arrow_schema(schema)?);
        let file = File::create(&path).map_err(|e| ConversionError::file_error(path.clone(), e))?;
        let writer =
            FileWriter::try_new(BufWriter::new(file), &schema).map_err(|e| ConversionError::sink(table, e))?;
        debug!("Created table file {}", path.display());
        Ok(TableWriter { writer, schema, batches: 0 })
    }
}

impl OutputSink for ArrowSink {
    fn append(&mut self, table: &str, chunk: &TableChunk) -> Result<()> {
        if self.closed {
            return Err(ConversionError::config("arrow sink", format!("append to '{}' after close", table)));
        }

        if !self.writers.contains_key(table) {
            let writer = self.open_writer(table, &chunk.schema)?;
            self.writers.insert(table.to_string(), writer);
        }
        let Some(entry) = self.writers.get_mut(table) else {
            return Ok(());
        };

        let batch = record_batch(Arc::clone(&entry.schema), chunk).map_err(|e| ConversionError::sink(table, e))?;
        entry.writer.write(&batch).map_err(|e| ConversionError::sink(table, e))?;
        entry.batches += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for (table, entry) in std::mem::take(&mut self.writers) {
            let batches = entry.batches;
            // Writes the footer and flushes the buffered file
            if let Err(e) = entry.writer.into_inner() {
                warn!("Failed to finish table '{}': {}", table, e);
                first_error.get_or_insert(ConversionError::sink(table, e));
                continue;
            }
            debug!("Closed table '{}' after {} batches", table, batches);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ArrowSink {
    fn drop(&mut self) {
        if !self.closed && !self.writers.is_empty() {
            warn!("Arrow sink for {} dropped without close; finishing tables", self.dir.display());
            let _ = self.close();
        }
    }
}

fn table_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{}.{}", table, TABLE_EXTENSION))
}

/// Names of the tables in `dir`, sorted.
pub fn existing_tables(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ConversionError::file_error(dir.to_path_buf(), e)),
    };

    let mut tables = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ConversionError::file_error(dir.to_path_buf(), e))?.path();
        if path.extension().is_some_and(|ext| ext == TABLE_EXTENSION)
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            tables.push(stem.to_string());
        }
    }
    tables.sort();
    Ok(tables)
}

/// Read a table written by [`ArrowSink`] back into chunks, one per batch.
pub fn read_table(path: &Path) -> Result<(TableSchema, Vec<TableChunk>)> {
    let table = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let file = File::open(path).map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
    let reader = FileReader::try_new(BufReader::new(file), None).map_err(|e| ConversionError::sink(&table, e))?;

    let schema = Arc::new(table_schema(&reader.schema())?);
    let mut chunks = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| ConversionError::sink(&table, e))?;
        chunks.push(table_chunk(Arc::clone(&schema), &batch)?);
    }
    Ok((TableSchema::clone(&schema), chunks))
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::UInt8 => DataType::UInt8,
        ColumnType::UInt16 => DataType::UInt16,
        ColumnType::UInt32 => DataType::UInt32,
        ColumnType::UInt64 => DataType::UInt64,
        ColumnType::Int32 => DataType::Int32,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float32 => DataType::Float32,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Waveform { len } => {
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::UInt16, false)), len as i32)
        }
        ColumnType::Binary => DataType::Binary,
    }
}

fn column_type(data_type: &DataType) -> Option<ColumnType> {
    Some(match data_type {
        DataType::UInt8 => ColumnType::UInt8,
        DataType::UInt16 => ColumnType::UInt16,
        DataType::UInt32 => ColumnType::UInt32,
        DataType::UInt64 => ColumnType::UInt64,
        DataType::Int32 => ColumnType::Int32,
        DataType::Int64 => ColumnType::Int64,
        DataType::Float32 => ColumnType::Float32,
        DataType::Float64 => ColumnType::Float64,
        DataType::FixedSizeList(item, len) if *item.data_type() == DataType::UInt16 => {
            ColumnType::Waveform { len: usize::try_from(*len).ok()? }
        }
        DataType::Binary => ColumnType::Binary,
        _ => return None,
    })
}

/// Arrow schema of a table; every field is non-nullable.
pub fn arrow_schema(schema: &TableSchema) -> Result<Schema> {
    let mut fields = Vec::with_capacity(schema.fields.len());
    for spec in &schema.fields {
        let mut field = Field::new(&spec.name, arrow_type(spec.column_type), false);
        if !spec.attrs.is_empty() {
            let attrs = serde_json::to_string(&spec.attrs)
                .map_err(|e| ConversionError::config(format!("attributes of field '{}'", spec.name), e.to_string()))?;
            field = field.with_metadata(HashMap::from([(ATTRS_KEY.to_string(), attrs)]));
        }
        fields.push(field);
    }
    Ok(Schema::new(fields))
}

/// Table schema of an Arrow schema written by [`arrow_schema`].
pub fn table_schema(schema: &Schema) -> Result<TableSchema> {
    let mut fields = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column_type = column_type(field.data_type()).ok_or_else(|| {
            ConversionError::config(
                "arrow schema",
                format!("field '{}' has unsupported type {}", field.name(), field.data_type()),
            )
        })?;
        let mut spec = FieldSpec::new(field.name().as_str(), column_type);
        if let Some(attrs) = field.metadata().get(ATTRS_KEY) {
            spec.attrs = serde_json::from_str(attrs)
                .map_err(|e| ConversionError::config(format!("attributes of field '{}'", field.name()), e.to_string()))?;
        }
        fields.push(spec);
    }
    TableSchema::new(fields)
}

fn record_batch(schema: SchemaRef, chunk: &TableChunk) -> std::result::Result<RecordBatch, ArrowError> {
    let columns = chunk.columns.iter().map(column_array).collect::<std::result::Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, columns)
}

fn column_array(column: &ColumnData) -> std::result::Result<ArrayRef, ArrowError> {
    Ok(match column {
        ColumnData::UInt8(v) => Arc::new(UInt8Array::from(v.clone())),
        ColumnData::UInt16(v) => Arc::new(UInt16Array::from(v.clone())),
        ColumnData::UInt32(v) => Arc::new(UInt32Array::from(v.clone())),
        ColumnData::UInt64(v) => Arc::new(UInt64Array::from(v.clone())),
        ColumnData::Int32(v) => Arc::new(Int32Array::from(v.clone())),
        ColumnData::Int64(v) => Arc::new(Int64Array::from(v.clone())),
        ColumnData::Float32(v) => Arc::new(Float32Array::from(v.clone())),
        ColumnData::Float64(v) => Arc::new(Float64Array::from(v.clone())),
        ColumnData::Waveform { len, rows, samples } => {
            let values = UInt16Array::from(samples.clone());
            // Built from array data so zero-length waveforms keep their row count
            let data = ArrayData::builder(arrow_type(ColumnType::Waveform { len: *len }))
                .len(*rows)
                .add_child_data(values.to_data())
                .build()?;
            Arc::new(FixedSizeListArray::from(data))
        }
        ColumnData::Binary(v) => Arc::new(BinaryArray::from_iter_values(v.iter())),
    })
}

fn table_chunk(schema: Arc<TableSchema>, batch: &RecordBatch) -> Result<TableChunk> {
    let rows = batch.num_rows();
    let mut columns = Vec::with_capacity(schema.fields.len());

    for (spec, array) in schema.fields.iter().zip(batch.columns()) {
        let column = column_data(spec.column_type, array.as_ref()).ok_or_else(|| {
            ConversionError::config("arrow table", format!("column '{}' does not hold {}", spec.name, spec.column_type))
        })?;
        columns.push(column);
    }

    Ok(TableChunk { schema, columns, rows })
}

fn column_data(column_type: ColumnType, array: &dyn Array) -> Option<ColumnData> {
    Some(match column_type {
        ColumnType::UInt8 => ColumnData::UInt8(array.as_primitive_opt::<UInt8Type>()?.values().to_vec()),
        ColumnType::UInt16 => ColumnData::UInt16(array.as_primitive_opt::<UInt16Type>()?.values().to_vec()),
        ColumnType::UInt32 => ColumnData::UInt32(array.as_primitive_opt::<UInt32Type>()?.values().to_vec()),
        ColumnType::UInt64 => ColumnData::UInt64(array.as_primitive_opt::<UInt64Type>()?.values().to_vec()),
        ColumnType::Int32 => ColumnData::Int32(array.as_primitive_opt::<Int32Type>()?.values().to_vec()),
        ColumnType::Int64 => ColumnData::Int64(array.as_primitive_opt::<Int64Type>()?.values().to_vec()),
        ColumnType::Float32 => ColumnData::Float32(array.as_primitive_opt::<Float32Type>()?.values().to_vec()),
        ColumnType::Float64 => ColumnData::Float64(array.as_primitive_opt::<Float64Type>()?.values().to_vec()),
        ColumnType::Waveform { len } => {
            let list = array.as_fixed_size_list_opt()?;
            let values = list.values().as_primitive_opt::<UInt16Type>()?;
            let rows = list.len();
            let samples = values.values().get(..rows * len)?.to_vec();
            ColumnData::Waveform { len, rows, samples }
        }
        ColumnType::Binary => {
            let binary = array.as_binary_opt::<i32>()?;
            ColumnData::Binary(binary.iter().map(|v| v.unwrap_or_default().to_vec()).collect())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RawBuffer;
    use crate::types::{DecodedRecord, StreamKey, Value};
    use anyhow::{Context, Result};

    fn schema() -> TableSchema {
        TableSchema {
            fields: vec![
                FieldSpec::new("packet_id", ColumnType::UInt64),
                FieldSpec::new("temperature_mc", ColumnType::Int32),
                FieldSpec::new("waveform", ColumnType::Waveform { len: 4 }).with_attr("dt", 4).with_attr("dt_units", "ns"),
                FieldSpec::new("empty", ColumnType::Waveform { len: 0 }),
                FieldSpec::new("packet", ColumnType::Binary),
            ],
        }
    }

    fn chunk(ids: std::ops::Range<u64>) -> Result<TableChunk> {
        let mut buffer = RawBuffer::new("t", schema(), 64);
        for id in ids {
            let mut record = DecodedRecord::new(StreamKey::new("Test", 0));
            record.push("packet_id", Value::UInt64(id));
            record.push("temperature_mc", Value::Int32(-(id as i32)));
            record.push("waveform", Value::Waveform(vec![id as u16; 4]));
            record.push("empty", Value::Waveform(Vec::new()));
            record.push("packet", Value::Binary(vec![0xab; id as usize]));
            buffer.append(record)?;
        }
        Ok(buffer.drain())
    }

    #[test]
    fn test_write_and_read_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Fresh)?;
        sink.append("events", &chunk(0..3)?)?;
        sink.append("events", &chunk(3..5)?)?;
        sink.close()?;

        let (read_schema, chunks) = read_table(&dir.path().join("events.arrow"))?;
        assert_eq!(read_schema, schema());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], chunk(0..3)?);
        assert_eq!(chunks[1].row(1), chunk(3..5)?.row(1));
        assert_eq!(existing_tables(dir.path())?, vec!["events".to_string()]);
        Ok(())
    }

    #[test]
    fn test_zero_length_waveform_keeps_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Fresh)?;
        sink.append("events", &chunk(0..4)?)?;
        sink.close()?;

        let (_, chunks) = read_table(&dir.path().join("events.arrow"))?;
        let empty = chunks[0].column("empty").context("empty column")?;
        assert_eq!(empty.len(), 4);
        assert_eq!(empty.value(3), Some(Value::Waveform(Vec::new())));
        Ok(())
    }

    #[test]
    fn test_modes_guard_existing_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Fresh)?;
        sink.append("events", &chunk(0..1)?)?;
        sink.close()?;

        let err = ArrowSink::create(dir.path(), WriteMode::Fresh).err().context("fresh must refuse")?;
        assert!(matches!(err, ConversionError::Config { .. }));

        ArrowSink::create(dir.path(), WriteMode::Overwrite)?;
        assert!(existing_tables(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_splits_off_partial_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Fresh)?;
        sink.append("events", &chunk(0..4)?)?;
        sink.append("events", &chunk(4..6)?)?;
        sink.append("broken", &chunk(0..2)?)?;
        sink.close()?;

        let capacities = BTreeMap::from([("events".to_string(), 4), ("broken".to_string(), 4)]);
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Resume)?;
        let restored = sink.restore(&capacities, &["broken".to_string()])?;
        sink.close()?;

        let events = &restored["events"];
        assert_eq!(events.flushed, 4);
        assert_eq!(events.tail.as_ref().map(|t| t.rows), Some(2));
        assert!(restored["broken"].tail.is_none());
        assert_eq!(read_table(&dir.path().join("events.arrow"))?.1.len(), 1);
        assert_eq!(read_table(&dir.path().join("broken.arrow"))?.1.len(), 1);
        Ok(())
    }

    #[test]
    fn test_restore_rejects_unknown_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ArrowSink::create(dir.path(), WriteMode::Fresh)?;
        sink.append("events", &chunk(0..1)?)?;
        sink.close()?;

        let mut sink = ArrowSink::create(dir.path(), WriteMode::Resume)?;
        assert!(sink.restore(&BTreeMap::new(), &[]).is_err());
        Ok(())
    }
}
