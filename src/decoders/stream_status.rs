//! Periodic streaming status frames

use super::{Decoder, DecoderState, ensure_consumed};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{DecodedRecord, RawPacket, StreamKey, Value};

pub const DECODER_NAME: &str = "StreamStatus";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub status: u32,
    pub timestamp_ns: u64,
    pub cards: Vec<CardStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardStatus {
    pub address: u16,
    pub errors: u32,
    /// Board temperature in milli-degrees Celsius
    pub temperature_mc: i32,
}

impl StreamStatus {
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let status = cursor.read_u32_le()?;
        let timestamp_ns = cursor.read_u64_le()?;
        let n_cards = cursor.read_u16_le()?;
        cursor.skip(2)?;

        let mut cards = Vec::with_capacity(usize::from(n_cards).min(cursor.remaining() / 12));
        for _ in 0..n_cards {
            let address = cursor.read_u16_le()?;
            cursor.skip(2)?;
            let errors = cursor.read_u32_le()?;
            let temperature_mc = cursor.read_i32_le()?;
            cards.push(CardStatus { address, errors, temperature_mc });
        }
        ensure_consumed(&cursor, "status frame")?;

        Ok(Self { status, timestamp_ns, cards })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 12 * self.cards.len());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&(self.cards.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        for card in &self.cards {
            out.extend_from_slice(&card.address.to_le_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&card.errors.to_le_bytes());
            out.extend_from_slice(&card.temperature_mc.to_le_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStatusDecoder;

impl Decoder for StreamStatusDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn default_table(&self, _key: u32) -> String {
        "stream_status".to_string()
    }

    fn decode(&self, packet: &RawPacket, _state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let status = StreamStatus::parse(&packet.body)?;
        let records = status
            .cards
            .iter()
            .map(|card| {
                let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, u32::from(card.address)), 6);
                record.push("packet_id", Value::UInt64(packet.index));
                record.push("status", Value::UInt32(status.status));
                record.push("timestamp", Value::UInt64(status.timestamp_ns));
                record.push("card", Value::UInt16(card.address));
                record.push("errors", Value::UInt32(card.errors));
                record.push("temperature_mc", Value::Int32(card.temperature_mc));
                record
            })
            .collect();
        Ok(records)
    }
}
