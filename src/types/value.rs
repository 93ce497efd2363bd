//! Column and value type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Types a decoded field can take.
///
/// Waveforms are fixed-length per table; their length is part of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Fixed-length array of u16 ADC samples
    Waveform { len: usize },
    /// Variable-length opaque bytes
    Binary,
}

impl ColumnType {
    /// Size in bytes of one row of this type, if fixed.
    pub const fn row_size(&self) -> Option<usize> {
        match self {
            ColumnType::UInt8 => Some(1),
            ColumnType::UInt16 => Some(2),
            ColumnType::UInt32 | ColumnType::Int32 | ColumnType::Float32 => Some(4),
            ColumnType::UInt64 | ColumnType::Int64 | ColumnType::Float64 => Some(8),
            ColumnType::Waveform { len } => Some(*len * 2),
            ColumnType::Binary => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::UInt8 => f.write_str("u8"),
            ColumnType::UInt16 => f.write_str("u16"),
            ColumnType::UInt32 => f.write_str("u32"),
            ColumnType::UInt64 => f.write_str("u64"),
            ColumnType::Int32 => f.write_str("i32"),
            ColumnType::Int64 => f.write_str("i64"),
            ColumnType::Float32 => f.write_str("f32"),
            ColumnType::Float64 => f.write_str("f64"),
            ColumnType::Waveform { len } => write!(f, "u16[{}]", len),
            ColumnType::Binary => f.write_str("binary"),
        }
    }
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Waveform(Vec<u16>),
    Binary(Vec<u8>),
}

impl Value {
    /// The column type this value would establish.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::UInt8(_) => ColumnType::UInt8,
            Value::UInt16(_) => ColumnType::UInt16,
            Value::UInt32(_) => ColumnType::UInt32,
            Value::UInt64(_) => ColumnType::UInt64,
            Value::Int32(_) => ColumnType::Int32,
            Value::Int64(_) => ColumnType::Int64,
            Value::Float32(_) => ColumnType::Float32,
            Value::Float64(_) => ColumnType::Float64,
            Value::Waveform(samples) => ColumnType::Waveform { len: samples.len() },
            Value::Binary(_) => ColumnType::Binary,
        }
    }
}
