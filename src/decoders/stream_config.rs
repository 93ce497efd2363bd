//! Streaming configuration frames
//!
//! A configuration frame describes the trace layout of every following
//! event frame. The server resends it after a reconnect.

use tracing::{debug, info};

use super::{Decoder, DecoderState, ensure_consumed};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{DecodedRecord, RawPacket, StreamKey, Value};

pub const DECODER_NAME: &str = "StreamConfig";

/// Trace layout announced by a configuration frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    pub stream_id: u32,
    /// Samples per trace waveform
    pub wf_samples: u16,
    pub adc_bits: u16,
    /// Channel key (`card << 16 | input`) of every trace index
    pub traces: Vec<u32>,
}

impl ChannelMap {
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let stream_id = cursor.read_u32_le()?;
        let n_traces = cursor.read_u16_le()?;
        let wf_samples = cursor.read_u16_le()?;
        let adc_bits = cursor.read_u16_le()?;
        cursor.skip(2)?;

        let mut traces = Vec::with_capacity(usize::from(n_traces).min(cursor.remaining() / 4));
        for _ in 0..n_traces {
            traces.push(cursor.read_u32_le()?);
        }
        ensure_consumed(&cursor, "stream configuration")?;

        Ok(Self { stream_id, wf_samples, adc_bits, traces })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 4 * self.traces.len());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&(self.traces.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.wf_samples.to_le_bytes());
        out.extend_from_slice(&self.adc_bits.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        for trace in &self.traces {
            out.extend_from_slice(&trace.to_le_bytes());
        }
        out
    }

    pub fn n_traces(&self) -> usize {
        self.traces.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConfigDecoder;

impl Decoder for StreamConfigDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn default_table(&self, _key: u32) -> String {
        "stream_config".to_string()
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn decode(&self, packet: &RawPacket, state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let map = ChannelMap::parse(&packet.body)?;

        match &state.channel_map {
            Some(previous) if *previous == map => debug!("Configuration for stream {} unchanged", map.stream_id),
            _ => info!(
                "Stream {} configured: {} traces of {} samples, {}-bit ADC",
                map.stream_id,
                map.n_traces(),
                map.wf_samples,
                map.adc_bits
            ),
        }

        let tracemap: Vec<u8> = map.traces.iter().flat_map(|t| t.to_le_bytes()).collect();
        let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, 0), 6);
        record.push("packet_id", Value::UInt64(packet.index));
        record.push("stream_id", Value::UInt32(map.stream_id));
        record.push("n_traces", Value::UInt16(map.n_traces() as u16));
        record.push("wf_samples", Value::UInt16(map.wf_samples));
        record.push("adc_bits", Value::UInt16(map.adc_bits));
        record.push("tracemap", Value::Binary(tracemap));

        state.channel_map = Some(map);
        Ok(vec![record])
    }
}
