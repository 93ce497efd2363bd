//! Single-channel waveform digitizer events
//!
//! ## Event Layout (32-bit little-endian words)
//!
//! | Words | Present when    | Content                                              |
//! |-------|-----------------|------------------------------------------------------|
//! | 0     | always          | `timestamp_hi[31:16] | fch_id[15:4] | format[3:0]`   |
//! | 1     | always          | `timestamp_lo`                                       |
//! | 2..8  | format bit 0    | peak value/index, information + acc 1, acc 2..6      |
//! | +2    | format bit 1    | acc 7, acc 8                                         |
//! | +3    | format bit 2    | MAW max, before, after                               |
//! | +2    | format bit 3    | start energy, max energy                             |
//! | +1    | always          | length word: marker nibble, flags, raw length        |
//! | +1    | marker `0xA`    | averaged length word                                 |
//!
//! Raw samples follow, then averaged samples, both as u16.

use std::collections::BTreeMap;
use tracing::debug;

use super::{Decoder, DecoderState, ensure_consumed, waveform_field};
use crate::DecodeError;
use crate::cursor::ByteCursor;
use crate::types::{
    ColumnType, DecodedRecord, DigitizerChannel, FieldSpec, RawPacket, RunHeader, StreamKey, TableSchema, Value,
};

pub const DECODER_NAME: &str = "DigitizerEvent";

const MARKER_NO_AVERAGE: u32 = 0xE;
const MARKER_AVERAGE: u32 = 0xA;
const RAW_LENGTH_MASK: u32 = 0x03ff_ffff;
const STATUS_FLAG_BIT: u32 = 1 << 26;
const MAW_TEST_BIT: u32 = 1 << 27;

const ACC_SUM_FIELDS: [&str; 8] =
    ["acc_sum1", "acc_sum2", "acc_sum3", "acc_sum4", "acc_sum5", "acc_sum6", "acc_sum7", "acc_sum8"];

/// One decoded digitizer event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigitizerEvent {
    /// `fadc << 4 | channel`, 12 bits
    pub fch_id: u16,
    pub format_bits: u8,
    /// 48-bit clock tick counter
    pub timestamp: u64,
    pub peak_high_value: u16,
    pub peak_high_index: u16,
    pub information: u8,
    /// Accumulator sums; acc 1 has 24 significant bits
    pub acc_sums: [u32; 8],
    /// MAW max, before and after trigger
    pub maw: [u32; 3],
    pub start_energy: u32,
    pub max_energy: u32,
    pub status_flag: bool,
    pub maw_test: bool,
    /// Raw samples, even length
    pub raw_samples: Vec<u16>,
    /// Averaged samples, even length
    pub avg_samples: Vec<u16>,
}

impl DigitizerEvent {
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(body);
        let mut event = DigitizerEvent::default();

        let w0 = cursor.read_u32_le()?;
        let timestamp_lo = cursor.read_u32_le()?;
        event.timestamp = (u64::from(w0 >> 16) << 32) | u64::from(timestamp_lo);
        event.fch_id = ((w0 >> 4) & 0x0fff) as u16;
        event.format_bits = (w0 & 0x0f) as u8;

        if event.format_bits & 0x1 != 0 {
            let peak = cursor.read_u32_le()?;
            event.peak_high_value = (peak & 0xffff) as u16;
            event.peak_high_index = (peak >> 16) as u16;
            let info = cursor.read_u32_le()?;
            event.information = (info >> 24) as u8;
            event.acc_sums[0] = info & 0x00ff_ffff;
            for acc in &mut event.acc_sums[1..6] {
                *acc = cursor.read_u32_le()?;
            }
        }
        if event.format_bits & 0x2 != 0 {
            event.acc_sums[6] = cursor.read_u32_le()?;
            event.acc_sums[7] = cursor.read_u32_le()?;
        }
        if event.format_bits & 0x4 != 0 {
            for maw in &mut event.maw {
                *maw = cursor.read_u32_le()?;
            }
        }
        if event.format_bits & 0x8 != 0 {
            event.start_energy = cursor.read_u32_le()?;
            event.max_energy = cursor.read_u32_le()?;
        }

        let length_word = cursor.read_u32_le()?;
        let raw_len_32 = (length_word & RAW_LENGTH_MASK) as usize;
        event.status_flag = length_word & STATUS_FLAG_BIT != 0;
        event.maw_test = length_word & MAW_TEST_BIT != 0;

        let avg_len_32 = match length_word >> 28 {
            MARKER_NO_AVERAGE => 0,
            MARKER_AVERAGE => {
                let avg_word = cursor.read_u32_le()?;
                if avg_word >> 28 != MARKER_NO_AVERAGE {
                    return Err(DecodeError::malformed(format!(
                        "averaged length word {:#010x} lacks the 0xE marker",
                        avg_word
                    )));
                }
                (avg_word & 0xffff) as usize
            }
            other => {
                return Err(DecodeError::malformed(format!(
                    "length word {:#010x} has unknown marker {:#x}",
                    length_word, other
                )));
            }
        };

        if event.maw_test {
            return Err(DecodeError::Unsupported { details: "events carrying MAW test data".to_string() });
        }

        cursor.read_u16_samples(2 * raw_len_32, &mut event.raw_samples)?;
        cursor.read_u16_samples(2 * avg_len_32, &mut event.avg_samples)?;
        ensure_consumed(&cursor, "digitizer event")?;

        Ok(event)
    }

    /// Encode into a packet body. Sample vectors must have even length.
    pub fn encode(&self) -> Vec<u8> {
        let mut words: Vec<u32> = Vec::with_capacity(20);
        let ts_hi = ((self.timestamp >> 32) & 0xffff) as u32;
        words.push((ts_hi << 16) | (u32::from(self.fch_id & 0x0fff) << 4) | u32::from(self.format_bits & 0x0f));
        words.push(self.timestamp as u32);

        if self.format_bits & 0x1 != 0 {
            words.push(u32::from(self.peak_high_value) | (u32::from(self.peak_high_index) << 16));
            words.push((u32::from(self.information) << 24) | (self.acc_sums[0] & 0x00ff_ffff));
            words.extend_from_slice(&self.acc_sums[1..6]);
        }
        if self.format_bits & 0x2 != 0 {
            words.extend_from_slice(&self.acc_sums[6..8]);
        }
        if self.format_bits & 0x4 != 0 {
            words.extend_from_slice(&self.maw);
        }
        if self.format_bits & 0x8 != 0 {
            words.push(self.start_energy);
            words.push(self.max_energy);
        }

        let marker = if self.avg_samples.is_empty() { MARKER_NO_AVERAGE } else { MARKER_AVERAGE };
        let mut length_word = (marker << 28) | ((self.raw_samples.len() / 2) as u32 & RAW_LENGTH_MASK);
        if self.status_flag {
            length_word |= STATUS_FLAG_BIT;
        }
        if self.maw_test {
            length_word |= MAW_TEST_BIT;
        }
        words.push(length_word);
        if !self.avg_samples.is_empty() {
            words.push((MARKER_NO_AVERAGE << 28) | ((self.avg_samples.len() / 2) as u32 & 0xffff));
        }

        let mut out = Vec::with_capacity(words.len() * 4 + (self.raw_samples.len() + self.avg_samples.len()) * 2);
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for sample in self.raw_samples.iter().chain(&self.avg_samples) {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}

/// Decoder for digitizer events, configured per channel by the run header.
#[derive(Debug, Clone, Default)]
pub struct DigitizerDecoder {
    channels: BTreeMap<u32, DigitizerChannel>,
}

impl DigitizerDecoder {
    pub fn new(channels: impl IntoIterator<Item = DigitizerChannel>) -> Self {
        Self { channels: channels.into_iter().map(|ch| (ch.fch_id(), ch)).collect() }
    }

    pub fn from_header(header: &RunHeader) -> Self {
        let decoder = Self::new(header.digitizer_channels.iter().cloned());
        debug!("Digitizer decoder configured for {} channels", decoder.channels.len());
        decoder
    }

    pub fn channel(&self, fch_id: u32) -> Option<&DigitizerChannel> {
        self.channels.get(&fch_id)
    }
}

fn schema_for(format_bits: u8, waveform: Option<FieldSpec>, aux_waveform: Option<FieldSpec>) -> TableSchema {
    let mut fields = vec![
        FieldSpec::new("packet_id", ColumnType::UInt64),
        FieldSpec::new("fch_id", ColumnType::UInt32),
        FieldSpec::new("timestamp", ColumnType::UInt64).with_attr("units", "clock_ticks"),
    ];
    let adc = |name: &str| FieldSpec::new(name, ColumnType::UInt32).with_attr("units", "adc");

    if format_bits & 0x1 != 0 {
        fields.push(FieldSpec::new("peak_high_value", ColumnType::UInt16).with_attr("units", "adc"));
        fields.push(FieldSpec::new("peak_high_index", ColumnType::UInt16));
        fields.push(FieldSpec::new("information", ColumnType::UInt8));
        fields.extend(ACC_SUM_FIELDS[..6].iter().copied().map(adc));
    }
    if format_bits & 0x2 != 0 {
        fields.extend(ACC_SUM_FIELDS[6..].iter().copied().map(adc));
    }
    if format_bits & 0x4 != 0 {
        fields.extend(["maw_max", "maw_before", "maw_after"].into_iter().map(adc));
    }
    if format_bits & 0x8 != 0 {
        fields.extend(["start_energy", "max_energy"].into_iter().map(adc));
    }
    fields.extend(waveform);
    fields.extend(aux_waveform);

    TableSchema { fields }
}

impl Decoder for DigitizerDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn declared_schema(&self, key: u32) -> Option<TableSchema> {
        let ch = self.channels.get(&key)?;
        let waveform =
            (ch.sample_length > 0).then(|| waveform_field("waveform", ch.sample_length as usize, ch.dt_ns()));
        let aux = ch
            .has_aux_waveform()
            .then(|| waveform_field("aux_waveform", ch.avg_sample_length as usize, ch.aux_dt_ns()));
        Some(schema_for(ch.format_bits, waveform, aux))
    }

    fn default_table(&self, key: u32) -> String {
        format!("digitizer_{:03}", key)
    }

    fn decode(&self, packet: &RawPacket, _state: &mut DecoderState) -> Result<Vec<DecodedRecord>, DecodeError> {
        let event = DigitizerEvent::parse(&packet.body)?;
        let fch_id = u32::from(event.fch_id);
        let ch = self.channels.get(&fch_id).ok_or_else(|| {
            DecodeError::missing_configuration(format!("digitizer channel {:#05x} not in run header", fch_id))
        })?;

        let mut record = DecodedRecord::with_capacity(StreamKey::new(DECODER_NAME, fch_id), 24);
        record.push("packet_id", Value::UInt64(packet.index));
        record.push("fch_id", Value::UInt32(fch_id));
        record.push("timestamp", Value::UInt64(event.timestamp));

        if event.format_bits & 0x1 != 0 {
            record.push("peak_high_value", Value::UInt16(event.peak_high_value));
            record.push("peak_high_index", Value::UInt16(event.peak_high_index));
            record.push("information", Value::UInt8(event.information));
            for (name, acc) in ACC_SUM_FIELDS[..6].iter().zip(&event.acc_sums[..6]) {
                record.push(*name, Value::UInt32(*acc));
            }
        }
        if event.format_bits & 0x2 != 0 {
            for (name, acc) in ACC_SUM_FIELDS[6..].iter().zip(&event.acc_sums[6..]) {
                record.push(*name, Value::UInt32(*acc));
            }
        }
        if event.format_bits & 0x4 != 0 {
            record.push("maw_max", Value::UInt32(event.maw[0]));
            record.push("maw_before", Value::UInt32(event.maw[1]));
            record.push("maw_after", Value::UInt32(event.maw[2]));
        }
        if event.format_bits & 0x8 != 0 {
            record.push("start_energy", Value::UInt32(event.start_energy));
            record.push("max_energy", Value::UInt32(event.max_energy));
        }

        // A length disagreeing with the run header surfaces as a schema mismatch
        if ch.sample_length > 0 || !event.raw_samples.is_empty() {
            record.push("waveform", Value::Waveform(event.raw_samples));
        }
        if ch.has_aux_waveform() || !event.avg_samples.is_empty() {
            record.push("aux_waveform", Value::Waveform(event.avg_samples));
        }

        Ok(vec![record])
    }
}
