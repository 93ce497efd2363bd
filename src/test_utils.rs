//! Fixture builders for tests and benchmarks
//!
//! Inputs are synthesized in memory instead of being checked in, so every
//! test states exactly which packets it feeds the pipeline.

#![cfg(any(test, feature = "benchmark"))]

use std::io::Cursor;
use std::path::Path;

use crate::Result;
use crate::decoders::{
    AdcChannelData, AdcEvent, CardStatus, ChannelMap, DigitizerEvent, RunControlPacket, StreamEvent, StreamStatus,
    StreamTrace,
};
use crate::legacy::format::{FILE_HEADER_SIZE, PACKET_HEADER_SIZE};
use crate::legacy::{LegacyReader, LegacyWriter};
use crate::streaming::{Handshake, encode_frame, tags};
use crate::types::{AdcCard, AdcLayout, DigitizerChannel, PacketKey, RunHeader, channel_key};
use crate::yaml_utils;

/// Legacy file assembled packet by packet.
#[derive(Debug, Clone)]
pub struct LegacyFixture {
    pub header: RunHeader,
    packets: Vec<(u16, Vec<u8>)>,
}

impl Default for LegacyFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyFixture {
    pub const DIGITIZER: u16 = 1;
    pub const ADC: u16 = 2;
    pub const RUN_CONTROL: u16 = 3;

    /// Samples per waveform of the configured digitizer channel
    pub const DIGITIZER_SAMPLES: usize = 8;
    /// Configured digitizer channel id
    pub const DIGITIZER_FCH: u16 = 0x21;
    pub const ADC_CARD: u16 = 4;
    pub const ADC_SAMPLES: usize = 4;

    /// Fixture whose run header registers the three legacy decoders.
    pub fn new() -> Self {
        let mut header = RunHeader { run_number: 42, start_time: 1_700_000_000, ..Default::default() };
        header.decoders.insert(Self::DIGITIZER, "DigitizerEvent".to_string());
        header.decoders.insert(Self::ADC, "AdcEvent".to_string());
        header.decoders.insert(Self::RUN_CONTROL, "RunControl".to_string());
        header.digitizer_channels.push(DigitizerChannel {
            fadc: 2,
            channel: 1,
            format_bits: 0b0001,
            sample_length: Self::DIGITIZER_SAMPLES as u32,
            avg_sample_length: 0,
            avg_mode: 0,
            sample_freq_mhz: 250.0,
            gain: 1.0,
            adc_offset: 0,
        });
        header.adc = Some(AdcLayout {
            wf_len: Self::ADC_SAMPLES as u32,
            cards: vec![AdcCard { address: Self::ADC_CARD, crate_id: 0, slot: 5, inputs: vec![] }],
        });
        Self { header, packets: Vec::new() }
    }

    pub fn push(&mut self, key: u16, body: Vec<u8>) -> &mut Self {
        self.packets.push((key, body));
        self
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// File image
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut writer = LegacyWriter::new(Vec::new(), &self.header)?;
        for (sequence, (key, body)) in self.packets.iter().enumerate() {
            writer.write_packet(PacketKey(*key), sequence as u32, body)?;
        }
        writer.finish()
    }

    pub fn reader(&self) -> Result<LegacyReader<Cursor<Vec<u8>>>> {
        LegacyReader::from_bytes(self.bytes()?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.bytes()?;
        std::fs::write(path, bytes).map_err(|e| crate::ConversionError::file_error(path.to_path_buf(), e))
    }

    /// Byte offset of packet `index`'s header
    pub fn packet_offset(&self, index: usize) -> u64 {
        let preamble = yaml_utils::encode_run_header(&self.header).map_or(0, |p| p.len());
        let packets: usize = self.packets.iter().take(index).map(|(_, body)| PACKET_HEADER_SIZE + body.len()).sum();
        (FILE_HEADER_SIZE + preamble + packets) as u64
    }
}

/// Digitizer event for the fixture's configured channel.
pub fn digitizer_event(n: u32) -> DigitizerEvent {
    let mut acc_sums = [0u32; 8];
    for (i, acc) in acc_sums.iter_mut().take(6).enumerate() {
        *acc = n * 10 + i as u32;
    }
    DigitizerEvent {
        fch_id: LegacyFixture::DIGITIZER_FCH,
        format_bits: 0b0001,
        timestamp: 1_000 + u64::from(n) * 250,
        peak_high_value: 900 + n as u16,
        peak_high_index: 3,
        information: 1,
        acc_sums,
        raw_samples: (0..LegacyFixture::DIGITIZER_SAMPLES).map(|i| (n as usize * 7 + i) as u16).collect(),
        ..Default::default()
    }
}

/// ADC event with one channel per input in `inputs`.
pub fn adc_event(n: u32, inputs: &[u16]) -> AdcEvent {
    AdcEvent {
        event_number: n,
        timestamp_ns: u64::from(n) * 1_000,
        card_address: LegacyFixture::ADC_CARD,
        wf_len: LegacyFixture::ADC_SAMPLES as u16,
        channels: inputs
            .iter()
            .map(|&input| AdcChannelData {
                input,
                baseline: 100 + input,
                daq_energy: n * 3 + u32::from(input),
                samples: vec![n as u16; LegacyFixture::ADC_SAMPLES],
            })
            .collect(),
    }
}

pub fn run_control(n: u32, kind: u8) -> Vec<u8> {
    RunControlPacket { run_number: 42, subrun: n, timestamp: u64::from(n) * 100, kind }.encode()
}

/// Mixed legacy run: one start marker, `events` digitizer and ADC events,
/// one stop marker.
pub fn mixed_legacy_run(events: u32) -> LegacyFixture {
    let mut fixture = LegacyFixture::new();
    fixture.push(LegacyFixture::RUN_CONTROL, run_control(0, 0));
    for n in 0..events {
        fixture.push(LegacyFixture::DIGITIZER, digitizer_event(n).encode());
        fixture.push(LegacyFixture::ADC, adc_event(n, &[0, 1, 2]).encode());
    }
    fixture.push(LegacyFixture::RUN_CONTROL, run_control(1, 1));
    fixture
}

/// Streaming recording assembled frame by frame.
#[derive(Debug, Clone)]
pub struct StreamFixture {
    bytes: Vec<u8>,
    frames: usize,
}

impl StreamFixture {
    pub fn new(stream_id: u32) -> Self {
        Self { bytes: Handshake::new(stream_id).encode().to_vec(), frames: 0 }
    }

    pub fn frame(&mut self, tag: u16, payload: &[u8]) -> &mut Self {
        encode_frame(tag, payload, &mut self.bytes);
        self.frames += 1;
        self
    }

    pub fn config(&mut self, map: &ChannelMap) -> &mut Self {
        self.frame(tags::CONFIG, &map.encode())
    }

    pub fn event(&mut self, event: &StreamEvent) -> &mut Self {
        let tag = if event.sparse { tags::SPARSE_EVENT } else { tags::EVENT };
        self.frame(tag, &event.encode())
    }

    pub fn status(&mut self, status: &StreamStatus) -> &mut Self {
        self.frame(tags::STATUS, &status.encode())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Channel map with `n_traces` inputs on card 1.
pub fn channel_map(stream_id: u32, n_traces: u16, wf_samples: u16) -> ChannelMap {
    ChannelMap { stream_id, wf_samples, adc_bits: 14, traces: (0..n_traces).map(|i| channel_key(1, i)).collect() }
}

/// Full event covering every trace of `map`.
pub fn stream_event(n: u32, map: &ChannelMap) -> StreamEvent {
    StreamEvent {
        event_number: n,
        timestamp_ns: u64::from(n) * 4_000,
        sparse: false,
        traces: (0..map.n_traces())
            .map(|i| StreamTrace {
                index: i as u16,
                baseline: 200,
                daq_energy: n + i as u32,
                samples: vec![(n as u16).wrapping_add(i as u16); usize::from(map.wf_samples)],
            })
            .collect(),
    }
}

pub fn stream_status(n: u32) -> StreamStatus {
    StreamStatus {
        status: 0,
        timestamp_ns: u64::from(n) * 1_000_000,
        cards: vec![CardStatus { address: 1, errors: 0, temperature_mc: 41_000 + n as i32 }],
    }
}

/// Streaming recording: a configuration frame, `events` full events and a
/// status frame after every 4th event.
pub fn streaming_run(stream_id: u32, events: u32) -> StreamFixture {
    let map = channel_map(stream_id, 3, 6);
    let mut fixture = StreamFixture::new(stream_id);
    fixture.config(&map);
    for n in 0..events {
        fixture.event(&stream_event(n, &map));
        if n % 4 == 3 {
            fixture.status(&stream_status(n));
        }
    }
    fixture
}
