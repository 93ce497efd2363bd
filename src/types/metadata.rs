//! Run metadata parsed from stream preambles

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::SourceFormat;
use crate::{ConversionError, Result};

/// Metadata exposed by a source once its preamble has been read.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub format: SourceFormat,
    /// (major, minor) version of the file header or handshake
    pub version: (u16, u16),
    /// Stream id from the streaming handshake
    pub stream_id: Option<u32>,
    /// Run header from the legacy preamble
    pub header: Option<RunHeader>,
}

impl RunMetadata {
    pub fn legacy(version: (u16, u16), header: RunHeader) -> Self {
        Self { format: SourceFormat::Legacy, version, stream_id: None, header: Some(header) }
    }

    pub fn streaming(version: (u16, u16), stream_id: u32) -> Self {
        Self { format: SourceFormat::Streaming, version, stream_id: Some(stream_id), header: None }
    }
}

/// Largest averaging mode a digitizer channel accepts.
pub const MAX_AVG_MODE: u8 = 15;

/// Self-describing run header embedded at the start of a legacy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_number: u32,
    /// Unix seconds
    #[serde(default)]
    pub start_time: u64,
    /// Packet data id to decoder name
    #[serde(default)]
    pub decoders: BTreeMap<u16, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digitizer_channels: Vec<DigitizerChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adc: Option<AdcLayout>,
}

impl RunHeader {
    /// Validate hardware settings; `offset` locates the preamble in the stream.
    pub fn validate(&self, offset: u64) -> Result<()> {
        let mut seen = HashSet::new();
        for ch in &self.digitizer_channels {
            if ch.channel >= 16 {
                return Err(ConversionError::corrupt_stream(
                    offset,
                    format!("digitizer {} channel index {} out of range", ch.fadc, ch.channel),
                ));
            }
            if ch.format_bits >= 16 {
                return Err(ConversionError::corrupt_stream(
                    offset,
                    format!("digitizer {} channel {} format bits {:#x} out of range", ch.fadc, ch.channel, ch.format_bits),
                ));
            }
            if ch.avg_mode > MAX_AVG_MODE {
                return Err(ConversionError::corrupt_stream(
                    offset,
                    format!("digitizer {} channel {} averaging mode {} out of range", ch.fadc, ch.channel, ch.avg_mode),
                ));
            }
            if ch.sample_freq_mhz.is_nan() || ch.sample_freq_mhz <= 0.0 {
                return Err(ConversionError::corrupt_stream(
                    offset,
                    format!("digitizer {} channel {} has no sampling frequency", ch.fadc, ch.channel),
                ));
            }
            if !seen.insert(ch.fch_id()) {
                return Err(ConversionError::corrupt_stream(
                    offset,
                    format!("duplicate configuration for digitizer {} channel {}", ch.fadc, ch.channel),
                ));
            }
        }
        Ok(())
    }

    /// Look up a digitizer channel by its combined id.
    pub fn digitizer_channel(&self, fch_id: u32) -> Option<&DigitizerChannel> {
        self.digitizer_channels.iter().find(|ch| ch.fch_id() == fch_id)
    }
}

/// Per-channel settings of a single-channel waveform digitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerChannel {
    pub fadc: u8,
    pub channel: u8,
    /// Which optional header blocks each event carries
    pub format_bits: u8,
    /// Raw waveform length in samples
    pub sample_length: u32,
    /// Averaged waveform length in samples, 0 when disabled
    #[serde(default)]
    pub avg_sample_length: u32,
    #[serde(default)]
    pub avg_mode: u8,
    pub sample_freq_mhz: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub adc_offset: u32,
}

fn default_gain() -> f64 {
    1.0
}

impl DigitizerChannel {
    /// Combined id as it appears in event headers.
    pub fn fch_id(&self) -> u32 {
        (u32::from(self.fadc) << 4) | u32::from(self.channel & 0x0f)
    }

    /// Raw sampling period in whole nanoseconds.
    pub fn dt_ns(&self) -> u32 {
        (1000.0 / self.sample_freq_mhz + 0.5) as u32
    }

    /// Sampling period of the averaged waveform, saturating at `u32::MAX`.
    pub fn aux_dt_ns(&self) -> u32 {
        1u32.checked_shl(u32::from(self.avg_mode) + 1)
            .and_then(|factor| self.dt_ns().checked_mul(factor))
            .unwrap_or(u32::MAX)
    }

    pub fn has_aux_waveform(&self) -> bool {
        self.avg_mode > 0 && self.avg_sample_length > 0
    }
}

/// Card layout of a multi-channel ADC crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcLayout {
    /// Samples per channel waveform
    pub wf_len: u32,
    #[serde(default)]
    pub cards: Vec<AdcCard>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcCard {
    pub address: u16,
    #[serde(default)]
    pub crate_id: u8,
    #[serde(default)]
    pub slot: u8,
    #[serde(default)]
    pub inputs: Vec<u16>,
}

/// Combined key of an ADC or streaming channel.
pub const fn channel_key(card_address: u16, input: u16) -> u32 {
    ((card_address as u32) << 16) | input as u32
}
