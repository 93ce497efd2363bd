//! Multi-channel ADC events
//!
//! One packet holds every read-out channel of one card for one trigger and
//! expands into one record per channel.

use std::collections::BTreeSet;

use super::{Decoder, DecoderState, ensure_consumed};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{
    AdcLayout, ColumnType, DecodedRecord, FieldSpec, RawPacket, RunHeader, StreamKey, TableSchema, Value, channel_key,
};

pub const DECODER_NAME: &str = "AdcEvent";

/// Parsed ADC event body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcEvent {
    pub event_number: u32,
    pub timestamp_ns: u64,
    pub card_address: u16,
    pub wf_len: u16,
    pub channels: Vec<AdcChannelData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdcChannelData {
    pub input: u16,
    pub baseline: u16,
    pub daq_energy: u32,
    pub samples: Vec<u16>,
}

impl AdcEvent {
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let event_number = cursor.read_u32_le()?;
        let timestamp_ns = cursor.read_u64_le()?;
        let card_address = cursor.read_u16_le()?;
        let n_channels = cursor.read_u16_le()? as usize;
        let wf_len = cursor.read_u16_le()?;
        cursor.skip(2)?;

        let mut channels = Vec::with_capacity(n_channels.min(64));
        for _ in 0..n_channels {
            let input = cursor.read_u16_le()?;
            let baseline = cursor.read_u16_le()?;
            let daq_energy = cursor.read_u32_le()?;
            let mut samples = Vec::new();
            cursor.read_u16_samples(wf_len as usize, &mut samples)?;
            channels.push(AdcChannelData { input, baseline, daq_energy, samples });
        }
        ensure_consumed(&cursor, "ADC event")?;

        Ok(Self { event_number, timestamp_ns, card_address, wf_len, channels })
    }

    /// Encode into a packet body. Every channel must hold `wf_len` samples.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.channels.len() * (8 + 2 * self.wf_len as usize));
        out.extend_from_slice(&self.event_number.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&self.card_address.to_le_bytes());
        out.extend_from_slice(&(self.channels.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.wf_len.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        for ch in &self.channels {
            out.extend_from_slice(&ch.input.to_le_bytes());
            out.extend_from_slice(&ch.baseline.to_le_bytes());
            out.extend_from_slice(&ch.daq_energy.to_le_bytes());
            for sample in &ch.samples {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        out
    }
}

/// Decoder for ADC events.
///
/// With a card list in the run header, only listed cards and inputs are accepted.
#[derive(Debug, Clone, Default)]
pub struct AdcDecoder {
    wf_len: Option<usize>,
    /// Channel keys of configured inputs; empty accepts all
    known_channels: BTreeSet<u32>,
    known_cards: BTreeSet<u16>,
}

impl AdcDecoder {
    pub fn new(layout: Option<&AdcLayout>) -> Self {
        let Some(layout) = layout else {
            return Self::default();
        };
        let known_cards = layout.cards.iter().map(|card| card.address).collect();
        let known_channels = layout
            .cards
            .iter()
            .flat_map(|card| card.inputs.iter().map(move |input| channel_key(card.address, *input)))
            .collect();
        Self { wf_len: Some(layout.wf_len as usize), known_channels, known_cards }
    }

    pub fn from_header(header: &RunHeader) -> Self {
        Self::new(header.adc.as_ref())
    }

    fn check_channel(&self, card: u16, input: u16) -> Result<(), DecodeError> {
        if self.known_cards.is_empty() {
            return Ok(());
        }
        if !self.known_cards.contains(&card) {
            return Err(DecodeError::missing_configuration(format!("ADC card {:#06x} not in run header", card)));
        }
        let card_has_inputs = self.known_channels.range(channel_key(card, 0)..=channel_key(card, u16::MAX)).next();
        if card_has_inputs.is_some() && !self.known_channels.contains(&channel_key(card, input)) {
            return Err(DecodeError::missing_configuration(format!(
                "ADC card {:#06x} input {} not in run header",
                card, input
            )));
        }
        Ok(())
    }
}

fn schema_for(wf_len: usize) -> TableSchema {
    TableSchema {
        fields: vec![
            FieldSpec::new("packet_id", ColumnType::UInt64),
            FieldSpec::new("event_number", ColumnType::UInt32),
            FieldSpec::new("timestamp", ColumnType::UInt64).with_attr("units", "ns"),
            FieldSpec::new("card", ColumnType::UInt16),
            FieldSpec::new("input", ColumnType::UInt16),
            FieldSpec::new("baseline", ColumnType::UInt16).with_attr("units", "adc"),
            FieldSpec::new("daq_energy", ColumnType::UInt32).with_attr("units", "adc"),
            FieldSpec::new("waveform", ColumnType::Waveform { len: wf_len }),
        ],
    }
}

impl Decoder for AdcDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn declared_schema(&self, _key: u32) -> Option<TableSchema> {
        self.wf_len.map(schema_for)
    }

    fn default_table(&self, _key: u32) -> String {
        "adc_events".to_string()
    }

    fn decode(&self, packet: &RawPacket, _state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let event = AdcEvent::parse(&packet.body)?;
        for ch in &event.channels {
            self.check_channel(event.card_address, ch.input)?;
        }

        let records = event
            .channels
            .into_iter()
            .map(|ch| {
                let key = channel_key(event.card_address, ch.input);
                let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, key), 8);
                record.push("packet_id", Value::UInt64(packet.index));
                record.push("event_number", Value::UInt32(event.event_number));
                record.push("timestamp", Value::UInt64(event.timestamp_ns));
                record.push("card", Value::UInt16(event.card_address));
                record.push("input", Value::UInt16(ch.input));
                record.push("baseline", Value::UInt16(ch.baseline));
                record.push("daq_energy", Value::UInt32(ch.daq_energy));
                record.push("waveform", Value::Waveform(ch.samples));
                record
            })
            .collect();
        Ok(records)
    }
}
