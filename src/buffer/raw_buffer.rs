//! Fixed-capacity columnar accumulator for one table

use std::sync::Arc;

use crate::types::{ColumnType, DecodedRecord, TableSchema, Value};
use crate::{ConversionError, Result};

/// Values of one column.
///
/// Waveforms are stored flat, `len` samples per row. The row count is kept
/// alongside since `len` may be 0.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Waveform { len: usize, rows: usize, samples: Vec<u16> },
    Binary(Vec<Vec<u8>>),
}

impl ColumnData {
    /// Empty column with room for `rows` rows.
    pub fn with_capacity(column_type: ColumnType, rows: usize) -> Self {
        match column_type {
            ColumnType::UInt8 => ColumnData::UInt8(Vec::with_capacity(rows)),
            ColumnType::UInt16 => ColumnData::UInt16(Vec::with_capacity(rows)),
            ColumnType::UInt32 => ColumnData::UInt32(Vec::with_capacity(rows)),
            ColumnType::UInt64 => ColumnData::UInt64(Vec::with_capacity(rows)),
            ColumnType::Int32 => ColumnData::Int32(Vec::with_capacity(rows)),
            ColumnType::Int64 => ColumnData::Int64(Vec::with_capacity(rows)),
            ColumnType::Float32 => ColumnData::Float32(Vec::with_capacity(rows)),
            ColumnType::Float64 => ColumnData::Float64(Vec::with_capacity(rows)),
            ColumnType::Waveform { len } => {
                ColumnData::Waveform { len, rows: 0, samples: Vec::with_capacity(rows * len) }
            }
            ColumnType::Binary => ColumnData::Binary(Vec::with_capacity(rows)),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::UInt8(_) => ColumnType::UInt8,
            ColumnData::UInt16(_) => ColumnType::UInt16,
            ColumnData::UInt32(_) => ColumnType::UInt32,
            ColumnData::UInt64(_) => ColumnType::UInt64,
            ColumnData::Int32(_) => ColumnType::Int32,
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Float32(_) => ColumnType::Float32,
            ColumnData::Float64(_) => ColumnType::Float64,
            ColumnData::Waveform { len, .. } => ColumnType::Waveform { len: *len },
            ColumnData::Binary(_) => ColumnType::Binary,
        }
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Waveform { rows, .. } => *rows,
            ColumnData::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value of matching type; returns false on a type mismatch.
    fn push(&mut self, value: Value) -> bool {
        match (self, value) {
            (ColumnData::UInt8(v), Value::UInt8(x)) => v.push(x),
            (ColumnData::UInt16(v), Value::UInt16(x)) => v.push(x),
            (ColumnData::UInt32(v), Value::UInt32(x)) => v.push(x),
            (ColumnData::UInt64(v), Value::UInt64(x)) => v.push(x),
            (ColumnData::Int32(v), Value::Int32(x)) => v.push(x),
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(x),
            (ColumnData::Float32(v), Value::Float32(x)) => v.push(x),
            (ColumnData::Float64(v), Value::Float64(x)) => v.push(x),
            (ColumnData::Waveform { len, rows, samples }, Value::Waveform(x)) if x.len() == *len => {
                samples.extend_from_slice(&x);
                *rows += 1;
            }
            (ColumnData::Binary(v), Value::Binary(x)) => v.push(x),
            _ => return false,
        }
        true
    }

    /// Append every row of `other`, which must have the same type.
    fn extend_from(&mut self, other: ColumnData) -> bool {
        match (self, other) {
            (ColumnData::UInt8(v), ColumnData::UInt8(x)) => v.extend(x),
            (ColumnData::UInt16(v), ColumnData::UInt16(x)) => v.extend(x),
            (ColumnData::UInt32(v), ColumnData::UInt32(x)) => v.extend(x),
            (ColumnData::UInt64(v), ColumnData::UInt64(x)) => v.extend(x),
            (ColumnData::Int32(v), ColumnData::Int32(x)) => v.extend(x),
            (ColumnData::Int64(v), ColumnData::Int64(x)) => v.extend(x),
            (ColumnData::Float32(v), ColumnData::Float32(x)) => v.extend(x),
            (ColumnData::Float64(v), ColumnData::Float64(x)) => v.extend(x),
            (
                ColumnData::Waveform { len, rows, samples },
                ColumnData::Waveform { len: other_len, rows: other_rows, samples: x },
            ) if *len == other_len => {
                samples.extend(x);
                *rows += other_rows;
            }
            (ColumnData::Binary(v), ColumnData::Binary(x)) => v.extend(x),
            _ => return false,
        }
        true
    }

    /// Value at `row`, if in range.
    pub fn value(&self, row: usize) -> Option<Value> {
        match self {
            ColumnData::UInt8(v) => v.get(row).copied().map(Value::UInt8),
            ColumnData::UInt16(v) => v.get(row).copied().map(Value::UInt16),
            ColumnData::UInt32(v) => v.get(row).copied().map(Value::UInt32),
            ColumnData::UInt64(v) => v.get(row).copied().map(Value::UInt64),
            ColumnData::Int32(v) => v.get(row).copied().map(Value::Int32),
            ColumnData::Int64(v) => v.get(row).copied().map(Value::Int64),
            ColumnData::Float32(v) => v.get(row).copied().map(Value::Float32),
            ColumnData::Float64(v) => v.get(row).copied().map(Value::Float64),
            ColumnData::Waveform { len, rows, samples } => {
                if row >= *rows {
                    return None;
                }
                samples.get(row * len..(row + 1) * len).map(|s| Value::Waveform(s.to_vec()))
            }
            ColumnData::Binary(v) => v.get(row).cloned().map(Value::Binary),
        }
    }
}

/// Rows drained from a [`RawBuffer`], handed to the output sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChunk {
    pub schema: Arc<TableSchema>,
    /// One column per schema field, all `rows` long
    pub columns: Vec<ColumnData>,
    pub rows: usize,
}

impl TableChunk {
    pub fn empty(schema: Arc<TableSchema>) -> Self {
        let columns = schema.fields.iter().map(|f| ColumnData::with_capacity(f.column_type, 0)).collect();
        Self { schema, columns, rows: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Column by field name
    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        let index = self.schema.fields.iter().position(|f| f.name == name)?;
        self.columns.get(index)
    }

    /// All values of one row, in schema order
    pub fn row(&self, row: usize) -> Option<Vec<Value>> {
        if row >= self.rows {
            return None;
        }
        self.columns.iter().map(|c| c.value(row)).collect()
    }

    /// Append the rows of `other`, which must share this chunk's schema.
    pub fn append(&mut self, other: TableChunk) -> Result<()> {
        if *other.schema != *self.schema {
            return Err(ConversionError::schema_mismatch("<chunk>", "appending chunk with a different schema"));
        }
        let rows = other.rows;
        for (column, incoming) in self.columns.iter_mut().zip(other.columns) {
            if !column.extend_from(incoming) {
                return Err(ConversionError::schema_mismatch("<chunk>", "column type changed"));
            }
        }
        self.rows += rows;
        Ok(())
    }
}

/// Column-oriented accumulator of records sharing one schema.
///
/// All columns always hold the same number of rows, never more than the
/// capacity. A rejected append leaves the buffer untouched.
#[derive(Debug)]
pub struct RawBuffer {
    table: String,
    schema: Arc<TableSchema>,
    columns: Vec<ColumnData>,
    len: usize,
    capacity: usize,
}

impl RawBuffer {
    pub fn new(table: impl Into<String>, schema: TableSchema, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let schema = Arc::new(schema);
        let columns = Self::empty_columns(&schema, capacity);
        Self { table: table.into(), schema, columns, len: 0, capacity }
    }

    fn empty_columns(schema: &TableSchema, capacity: usize) -> Vec<ColumnData> {
        schema.fields.iter().map(|f| ColumnData::with_capacity(f.column_type, capacity)).collect()
    }

    /// Append one record as a row across every column.
    pub fn append(&mut self, record: DecodedRecord) -> Result<()> {
        if let Some(details) = self.schema.mismatch(&record) {
            return Err(ConversionError::schema_mismatch(&self.table, details));
        }
        if self.is_full() {
            return Err(ConversionError::config(
                format!("buffer for table '{}'", self.table),
                format!("append to a full buffer of {} rows", self.capacity),
            ));
        }

        // Types and waveform lengths were checked above, so every push succeeds
        for (column, (_, value)) in self.columns.iter_mut().zip(record.fields) {
            let pushed = column.push(value);
            debug_assert!(pushed);
        }
        self.len += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Length of every column, for invariant checks.
    pub fn column_lengths(&self) -> Vec<usize> {
        self.columns.iter().map(ColumnData::len).collect()
    }

    /// Take all buffered rows and reset the length to 0.
    pub fn drain(&mut self) -> TableChunk {
        let fresh = Self::empty_columns(&self.schema, self.capacity);
        let columns = std::mem::replace(&mut self.columns, fresh);
        let rows = std::mem::take(&mut self.len);
        TableChunk { schema: Arc::clone(&self.schema), columns, rows }
    }

    /// Reload rows written by an earlier run that never filled a batch.
    pub fn restore(&mut self, chunk: TableChunk) -> Result<()> {
        if *chunk.schema != *self.schema {
            return Err(ConversionError::schema_mismatch(&self.table, "existing table has a different schema"));
        }
        if self.len + chunk.rows > self.capacity {
            return Err(ConversionError::config(
                format!("buffer for table '{}'", self.table),
                format!("{} restored rows exceed capacity {}", self.len + chunk.rows, self.capacity),
            ));
        }
        let rows = chunk.rows;
        for (column, incoming) in self.columns.iter_mut().zip(chunk.columns) {
            if !column.extend_from(incoming) {
                return Err(ConversionError::schema_mismatch(&self.table, "restored column type differs"));
            }
        }
        self.len += rows;
        Ok(())
    }
}
