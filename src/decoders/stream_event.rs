//! Streaming event frames, full and sparse
//!
//! Full events carry every configured trace in order. Sparse events list the
//! trace indices they carry, padded to a 4-byte boundary.

use super::{Decoder, DecoderState, ensure_consumed};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{DecodedRecord, RawPacket, StreamKey, Value};

pub const DECODER_NAME: &str = "StreamEvent";

/// Parsed event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub event_number: u32,
    pub timestamp_ns: u64,
    pub sparse: bool,
    pub traces: Vec<StreamTrace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTrace {
    /// Index into the configured trace map
    pub index: u16,
    pub baseline: u16,
    pub daq_energy: u32,
    pub samples: Vec<u16>,
}

impl StreamEvent {
    /// Parse a payload whose traces hold `wf_samples` samples each.
    pub fn parse(body: &[u8], sparse: bool, wf_samples: usize) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let event_number = cursor.read_u32_le()?;
        let timestamp_ns = cursor.read_u64_le()?;
        let n_traces = cursor.read_u16_le()?;
        cursor.skip(2)?;

        let indices: Vec<u16> = if sparse {
            let mut indices = Vec::with_capacity(usize::from(n_traces));
            cursor.read_u16_samples(usize::from(n_traces), &mut indices)?;
            if n_traces % 2 == 1 {
                cursor.skip(2)?;
            }
            indices
        } else {
            (0..n_traces).collect()
        };

        let mut traces = Vec::with_capacity(indices.len());
        for index in indices {
            let baseline = cursor.read_u16_le()?;
            cursor.skip(2)?;
            let daq_energy = cursor.read_u32_le()?;
            let mut samples = Vec::new();
            cursor.read_u16_samples(wf_samples, &mut samples)?;
            traces.push(StreamTrace { index, baseline, daq_energy, samples });
        }
        ensure_consumed(&cursor, "stream event")?;

        Ok(Self { event_number, timestamp_ns, sparse, traces })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.traces.iter().map(|t| 10 + 2 * t.samples.len()).sum::<usize>());
        out.extend_from_slice(&self.event_number.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&(self.traces.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        if self.sparse {
            for trace in &self.traces {
                out.extend_from_slice(&trace.index.to_le_bytes());
            }
            if self.traces.len() % 2 == 1 {
                out.extend_from_slice(&[0, 0]);
            }
        }
        for trace in &self.traces {
            out.extend_from_slice(&trace.baseline.to_le_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&trace.daq_energy.to_le_bytes());
            for sample in &trace.samples {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        out
    }
}

/// Decoder for event frames; needs a prior configuration frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamEventDecoder {
    sparse: bool,
}

impl StreamEventDecoder {
    pub fn full() -> Self {
        Self { sparse: false }
    }

    pub fn sparse() -> Self {
        Self { sparse: true }
    }
}

impl Decoder for StreamEventDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn default_table(&self, _key: u32) -> String {
        "stream_events".to_string()
    }

    fn decode(&self, packet: &RawPacket, state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let map = state
            .channel_map
            .as_ref()
            .ok_or_else(|| DecodeError::missing_configuration("event frame before any configuration frame"))?;

        let event = StreamEvent::parse(&packet.body, self.sparse, usize::from(map.wf_samples))?;
        if !self.sparse && event.traces.len() != map.n_traces() {
            return Err(DecodeError::malformed(format!(
                "full event carries {} traces, configuration has {}",
                event.traces.len(),
                map.n_traces()
            )));
        }

        let mut records = Vec::with_capacity(event.traces.len());
        for trace in event.traces {
            let key = *map.traces.get(usize::from(trace.index)).ok_or_else(|| {
                DecodeError::malformed(format!(
                    "trace index {} outside configured {} traces",
                    trace.index,
                    map.n_traces()
                ))
            })?;

            let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, key), 9);
            record.push("packet_id", Value::UInt64(packet.index));
            record.push("event_number", Value::UInt32(event.event_number));
            record.push("timestamp", Value::UInt64(event.timestamp_ns));
            record.push("trace_index", Value::UInt16(trace.index));
            record.push("card", Value::UInt16((key >> 16) as u16));
            record.push("input", Value::UInt16((key & 0xffff) as u16));
            record.push("baseline", Value::UInt16(trace.baseline));
            record.push("daq_energy", Value::UInt32(trace.daq_energy));
            record.push("waveform", Value::Waveform(trace.samples));
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::ChannelMap;
    use crate::types::{PacketHeader, PacketKey, channel_key};
    use anyhow::Result;
    use bytes::Bytes;

    fn configured_state() -> DecoderState {
        DecoderState {
            channel_map: Some(ChannelMap {
                stream_id: 1,
                wf_samples: 3,
                adc_bits: 16,
                traces: vec![channel_key(2, 0), channel_key(2, 1), channel_key(3, 7)],
            }),
        }
    }

    fn trace(index: u16) -> StreamTrace {
        StreamTrace { index, baseline: 10 * index, daq_energy: u32::from(index) + 1, samples: vec![index; 3] }
    }

    fn packet(body: Vec<u8>) -> RawPacket {
        let header =
            PacketHeader { key: PacketKey(2), version: 1, flags: 0, body_len: body.len() as u32, sequence: None, offset: 0 };
        RawPacket::new(header, 9, Bytes::from(body))
    }

    #[test]
    fn test_event_before_configuration() {
        let event = StreamEvent { event_number: 1, timestamp_ns: 2, sparse: false, traces: vec![trace(0)] };
        let result = StreamEventDecoder::full().decode(&packet(event.encode()), &mut DecoderState::default());
        assert!(matches!(result, Err(DecodeError::MissingConfiguration { .. })));
    }

    #[test]
    fn test_full_event_uses_trace_map() -> Result<()> {
        let event =
            StreamEvent { event_number: 4, timestamp_ns: 8, sparse: false, traces: vec![trace(0), trace(1), trace(2)] };
        let records = StreamEventDecoder::full().decode(&packet(event.encode()), &mut configured_state())?;

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].stream.key, channel_key(3, 7));
        assert_eq!(records[2].get("card"), Some(&Value::UInt16(3)));
        assert_eq!(records[2].get("input"), Some(&Value::UInt16(7)));
        assert_eq!(records[1].get("waveform"), Some(&Value::Waveform(vec![1, 1, 1])));
        Ok(())
    }

    #[test]
    fn test_full_event_trace_count_must_match() {
        let event = StreamEvent { event_number: 4, timestamp_ns: 8, sparse: false, traces: vec![trace(0)] };
        let result = StreamEventDecoder::full().decode(&packet(event.encode()), &mut configured_state());
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_sparse_event_with_padding() -> Result<()> {
        let event = StreamEvent { event_number: 5, timestamp_ns: 9, sparse: true, traces: vec![trace(2)] };
        let body = event.encode();
        // 16 header bytes, 1 index + 2 padding bytes, 8 trace header bytes, 6 sample bytes
        assert_eq!(body.len(), 16 + 4 + 8 + 6);
        assert_eq!(StreamEvent::parse(&body, true, 3)?, event);

        let records = StreamEventDecoder::sparse().decode(&packet(body), &mut configured_state())?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("trace_index"), Some(&Value::UInt16(2)));
        Ok(())
    }

    #[test]
    fn test_sparse_index_out_of_range() {
        let event = StreamEvent { event_number: 5, timestamp_ns: 9, sparse: true, traces: vec![trace(5)] };
        let result = StreamEventDecoder::sparse().decode(&packet(event.encode()), &mut configured_state());
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }
}
