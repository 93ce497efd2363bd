//! Packet decoders and the registry that dispatches to them
//!
//! Every packet type has one [`Decoder`] that owns its field layout. The
//! [`DecoderRegistry`] maps packet-type keys to decoders, built from the run
//! metadata when a source is opened.
//!
//! ## Schemas
//!
//! A decoder may declare the schema of a table up front from the preamble
//! (the digitizer knows every channel's waveform length and sampling period).
//! Tables without a declared schema take the shape of their first record.
//! Either way the schema is then fixed for the run.

mod adc;
mod digitizer;
mod registry;
mod run_control;
mod stream_config;
mod stream_event;
mod stream_status;

pub use adc::{AdcChannelData, AdcDecoder, AdcEvent};
pub use digitizer::{DigitizerDecoder, DigitizerEvent};
pub use registry::DecoderRegistry;
pub use run_control::{RunControlDecoder, RunControlPacket};
pub use stream_config::{ChannelMap, StreamConfigDecoder};
pub use stream_event::{StreamEvent, StreamEventDecoder, StreamTrace};
pub use stream_status::{CardStatus, StreamStatus, StreamStatusDecoder};

use crate::DecodeError;
use crate::types::{ColumnType, DecodedRecord, FieldSpec, RawPacket, StreamKey, TableSchema, Value};

/// Decoder name of the garbage table records
pub const GARBAGE_DECODER: &str = "garbage";

/// Table that collects undecodable packets
pub const GARBAGE_TABLE: &str = "garbage";

/// State shared by all decoders of one stream.
///
/// Only configuration packets write it; event decoders read it.
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    /// Trace layout from the latest streaming configuration packet
    pub channel_map: Option<ChannelMap>,
}

/// A decoder for one packet type.
pub trait Decoder: Send + Sync {
    /// Name used for routing in the buffer library
    fn name(&self) -> &'static str;

    /// Body layout version this decoder understands
    fn header_version(&self) -> u8 {
        1
    }

    /// Schema of the table fed by `key`, when known before the first record
    fn declared_schema(&self, _key: u32) -> Option<TableSchema> {
        None
    }

    /// Table name used when no buffer library rule applies
    fn default_table(&self, key: u32) -> String;

    /// Whether decoding changes [`DecoderState`]
    ///
    /// Packets of stateful decoders are replayed when a conversion resumes.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Parse one packet body into records
    ///
    /// Must not read beyond `packet.body`.
    fn decode(&self, packet: &RawPacket, state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError>;
}

/// Schema lookup used by the buffer manager when a table is first seen.
pub trait SchemaProvider {
    /// Schema declared for a stream before any record arrived.
    fn declared_schema(&self, stream: &StreamKey) -> Option<TableSchema>;

    /// Table a stream writes to when the buffer library has no rule for it.
    fn default_table(&self, stream: &StreamKey) -> String;
}

/// Schema of the garbage table
pub fn garbage_schema() -> TableSchema {
    TableSchema {
        fields: vec![
            FieldSpec::new("packet_id", ColumnType::UInt64),
            FieldSpec::new("packet_type", ColumnType::UInt16),
            FieldSpec::new("offset", ColumnType::UInt64),
            FieldSpec::new("code", ColumnType::UInt8),
            FieldSpec::new("packet", ColumnType::Binary),
        ],
    }
}

/// Record preserving a packet that failed to decode
pub fn garbage_record(packet: &RawPacket, error: &DecodeError) -> DecodedRecord {
    let mut record = DecodedRecord::with_capacity(StreamKey::new(GARBAGE_DECODER, 0), 5);
    record.push("packet_id", Value::UInt64(packet.index));
    record.push("packet_type", Value::UInt16(packet.key().0));
    record.push("offset", Value::UInt64(packet.header.offset));
    record.push("code", Value::UInt8(error.code()));
    record.push("packet", Value::Binary(packet.body.to_vec()));
    record
}

/// Require an exactly consumed body
pub(crate) fn ensure_consumed(cursor: &crate::cursor::ByteCursor<'_>, what: &str) -> Result<(), DecodeError> {
    if cursor.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::malformed(format!(
            "{} has {} surplus bytes at position {}",
            what,
            cursor.remaining(),
            cursor.position()
        )))
    }
}

/// Waveform field spec with sampling attributes
pub(crate) fn waveform_field(name: &str, len: usize, dt_ns: u32) -> FieldSpec {
    FieldSpec::new(name, ColumnType::Waveform { len })
        .with_attr("dt", dt_ns)
        .with_attr("dt_units", "ns")
        .with_attr("t0_units", "ns")
}
