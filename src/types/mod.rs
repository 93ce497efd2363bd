//! Core types for packets, records and table schemas.
//!
//! ## Architecture
//!
//! - [`RawPacket`] is one framed unit read from a source, with its [`PacketHeader`]
//! - [`DecodedRecord`] is one row produced by a decoder, tagged with a [`StreamKey`]
//! - [`TableSchema`] fixes the field names, [`ColumnType`]s and attributes of a table
//! - [`RunMetadata`] exposes what a source learned from its preamble
//!
//! ## Usage Example
//!
//! ```rust
//! use daq2arrow::types::{DecodedRecord, StreamKey, TableSchema, Value};
//!
//! let mut record = DecodedRecord::new(StreamKey::new("RunControl", 0));
//! record.push("run_number", Value::UInt32(42));
//! record.push("timestamp", Value::UInt64(1_700_000_000));
//!
//! let schema = TableSchema::from_record(&record);
//! assert_eq!(schema.field_count(), 2);
//! assert!(schema.mismatch(&record).is_none());
//! ```

mod metadata;
mod packet;
mod record;
mod schema;
mod value;

pub use metadata::{AdcCard, AdcLayout, DigitizerChannel, RunHeader, RunMetadata, channel_key};
pub use packet::{PacketHeader, PacketKey, RawPacket, SourceFormat};
pub use record::{DecodedRecord, StreamKey};
pub use schema::{FieldSpec, TableSchema};
pub use value::{ColumnType, Value};

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<u8>().prop_map(Value::UInt8),
            any::<u16>().prop_map(Value::UInt16),
            any::<u32>().prop_map(Value::UInt32),
            any::<u64>().prop_map(Value::UInt64),
            any::<i32>().prop_map(Value::Int32),
            any::<f64>().prop_map(Value::Float64),
            prop::collection::vec(any::<u16>(), 0..8).prop_map(Value::Waveform),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Binary),
        ]
    }

    const NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

    prop_compose! {
        fn arb_record()(values in prop::collection::vec(arb_value(), 1..6)) -> DecodedRecord {
            let mut record = DecodedRecord::new(StreamKey::new("Test", 0));
            for (name, value) in NAMES.iter().zip(values) {
                record.push(*name, value);
            }
            record
        }
    }

    proptest! {
        #[test]
        fn prop_lazy_schema_accepts_its_own_record(record in arb_record()) {
            let schema = TableSchema::from_record(&record);
            prop_assert!(schema.validate().is_ok());
            prop_assert!(schema.mismatch(&record).is_none());
            prop_assert_eq!(schema.field_count(), record.fields.len());
        }

        #[test]
        fn prop_dropping_a_field_is_a_mismatch(record in arb_record()) {
            let schema = TableSchema::from_record(&record);
            let mut shorter = record.clone();
            shorter.fields.pop();
            prop_assert!(schema.mismatch(&shorter).is_some());
        }
    }

    #[test]
    fn column_type_row_sizes() {
        assert_eq!(ColumnType::UInt8.row_size(), Some(1));
        assert_eq!(ColumnType::UInt16.row_size(), Some(2));
        assert_eq!(ColumnType::Float32.row_size(), Some(4));
        assert_eq!(ColumnType::UInt64.row_size(), Some(8));
        assert_eq!(ColumnType::Waveform { len: 100 }.row_size(), Some(200));
        assert_eq!(ColumnType::Waveform { len: 0 }.row_size(), Some(0));
        assert_eq!(ColumnType::Binary.row_size(), None);
    }

    #[test]
    fn waveform_length_is_part_of_the_type() {
        let mut record = DecodedRecord::new(StreamKey::new("Test", 1));
        record.push("waveform", Value::Waveform(vec![0; 4]));
        let schema = TableSchema::from_record(&record);

        let mut longer = DecodedRecord::new(StreamKey::new("Test", 1));
        longer.push("waveform", Value::Waveform(vec![0; 5]));
        let reason = schema.mismatch(&longer).expect("length change must be a mismatch");
        assert!(reason.contains("u16[4]"));
        assert!(reason.contains("u16[5]"));
    }

    #[test]
    fn duplicate_field_names_rejected() {
        let fields = vec![
            FieldSpec::new("x", ColumnType::UInt32),
            FieldSpec::new("x", ColumnType::UInt64),
        ];
        assert!(TableSchema::new(fields).is_err());
    }

    #[test]
    fn field_attributes_builder() {
        let field = FieldSpec::new("waveform", ColumnType::Waveform { len: 8 })
            .with_attr("dt", 4)
            .with_attr("dt_units", "ns");
        assert_eq!(field.attrs.get("dt").map(String::as_str), Some("4"));
        assert_eq!(field.attrs.len(), 2);
    }
}
