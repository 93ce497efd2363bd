//! Run control markers: start, stop and heartbeat

use super::{Decoder, DecoderState, ensure_consumed};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{DecodedRecord, RawPacket, StreamKey, Value};

pub const DECODER_NAME: &str = "RunControl";

pub const KIND_START: u8 = 0;
pub const KIND_STOP: u8 = 1;
pub const KIND_HEARTBEAT: u8 = 2;

/// Parsed run control body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunControlPacket {
    pub run_number: u32,
    pub subrun: u32,
    pub timestamp: u64,
    pub kind: u8,
}

impl RunControlPacket {
    pub const SIZE: usize = 20;

    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let run_number = cursor.read_u32_le()?;
        let subrun = cursor.read_u32_le()?;
        let timestamp = cursor.read_u64_le()?;
        let kind = cursor.read_u8()?;
        cursor.skip(3)?;
        ensure_consumed(&cursor, "run control packet")?;

        if kind > KIND_HEARTBEAT {
            return Err(DecodeError::malformed(format!("unknown run control kind {}", kind)));
        }
        Ok(Self { run_number, subrun, timestamp, kind })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.run_number.to_le_bytes());
        out.extend_from_slice(&self.subrun.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&[self.kind, 0, 0, 0]);
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunControlDecoder;

impl Decoder for RunControlDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn default_table(&self, _key: u32) -> String {
        "run_control".to_string()
    }

    fn decode(&self, packet: &RawPacket, _state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let control = RunControlPacket::parse(&packet.body)?;
        let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, 0), 5);
        record.push("packet_id", Value::UInt64(packet.index));
        record.push("run_number", Value::UInt32(control.run_number));
        record.push("subrun", Value::UInt32(control.subrun));
        record.push("timestamp", Value::UInt64(control.timestamp));
        record.push("kind", Value::UInt8(control.kind));
        Ok(vec![record])
    }
}
