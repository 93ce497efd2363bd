//! Input builders shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use daq2arrow::decoders::{
    AdcChannelData, AdcEvent, CardStatus, ChannelMap, DigitizerEvent, RunControlPacket, StreamEvent, StreamStatus,
    StreamTrace,
};
use daq2arrow::legacy::LegacyWriter;
use daq2arrow::streaming::{Handshake, encode_frame, tags};
use daq2arrow::{AdcCard, AdcLayout, DigitizerChannel, PacketKey, RunHeader, channel_key};

pub const DIGITIZER: u16 = 1;
pub const ADC: u16 = 2;
pub const RUN_CONTROL: u16 = 3;

pub const FCH: u16 = 0x21;
pub const DIGITIZER_SAMPLES: usize = 8;
pub const ADC_CARD: u16 = 4;
pub const ADC_SAMPLES: usize = 4;

pub fn run_header() -> RunHeader {
    let mut header = RunHeader { run_number: 1042, start_time: 1_700_000_000, ..Default::default() };
    header.decoders.insert(DIGITIZER, "DigitizerEvent".to_string());
    header.decoders.insert(ADC, "AdcEvent".to_string());
    header.decoders.insert(RUN_CONTROL, "RunControl".to_string());
    header.digitizer_channels.push(DigitizerChannel {
        fadc: 2,
        channel: 1,
        format_bits: 0b0001,
        sample_length: DIGITIZER_SAMPLES as u32,
        avg_sample_length: 0,
        avg_mode: 0,
        sample_freq_mhz: 250.0,
        gain: 1.0,
        adc_offset: 0,
    });
    header.adc = Some(AdcLayout {
        wf_len: ADC_SAMPLES as u32,
        cards: vec![AdcCard { address: ADC_CARD, crate_id: 0, slot: 5, inputs: vec![] }],
    });
    header
}

/// Write a legacy file holding `packets` as (data id, body) pairs.
pub fn write_legacy(path: &Path, packets: &[(u16, Vec<u8>)]) -> anyhow::Result<()> {
    let mut writer = LegacyWriter::new(Vec::new(), &run_header())?;
    for (sequence, (key, body)) in packets.iter().enumerate() {
        writer.write_packet(PacketKey(*key), sequence as u32, body)?;
    }
    std::fs::write(path, writer.finish()?)?;
    Ok(())
}

pub fn run_control(n: u32) -> Vec<u8> {
    RunControlPacket { run_number: 1042, subrun: n, timestamp: u64::from(n) * 100, kind: 2 }.encode()
}

pub fn digitizer(n: u32) -> Vec<u8> {
    DigitizerEvent {
        fch_id: FCH,
        format_bits: 0b0001,
        timestamp: 5_000 + u64::from(n) * 250,
        peak_high_value: 1_000 + n as u16,
        peak_high_index: 2,
        information: 1,
        raw_samples: (0..DIGITIZER_SAMPLES).map(|i| (n as usize + i) as u16).collect(),
        ..Default::default()
    }
    .encode()
}

pub fn adc(n: u32, wf_len: usize) -> Vec<u8> {
    AdcEvent {
        event_number: n,
        timestamp_ns: u64::from(n) * 1_000,
        card_address: ADC_CARD,
        wf_len: wf_len as u16,
        channels: (0..2)
            .map(|input| AdcChannelData {
                input,
                baseline: 50,
                daq_energy: n * 2 + u32::from(input),
                samples: vec![n as u16; wf_len],
            })
            .collect(),
    }
    .encode()
}

/// A run mixing every legacy packet type: `events` rounds of one digitizer,
/// one ADC and one run-control packet.
pub fn mixed_run(events: u32) -> Vec<(u16, Vec<u8>)> {
    let mut packets = Vec::new();
    for n in 0..events {
        packets.push((DIGITIZER, digitizer(n)));
        packets.push((ADC, adc(n, ADC_SAMPLES)));
        packets.push((RUN_CONTROL, run_control(n)));
    }
    packets
}

pub const STREAM_SAMPLES: u16 = 6;

pub fn channel_map(stream_id: u32) -> ChannelMap {
    channel_map_with(stream_id, STREAM_SAMPLES)
}

pub fn channel_map_with(stream_id: u32, wf_samples: u16) -> ChannelMap {
    ChannelMap { stream_id, wf_samples, adc_bits: 14, traces: (0..3).map(|i| channel_key(1, i)).collect() }
}

/// Streaming recording: configuration, `events` full events and a status
/// frame every 4th event.
pub fn streaming_bytes(stream_id: u32, events: u32) -> Vec<u8> {
    streaming_bytes_with(stream_id, events, STREAM_SAMPLES)
}

/// Like [`streaming_bytes`] with `wf_samples` samples per trace.
pub fn streaming_bytes_with(stream_id: u32, events: u32, wf_samples: u16) -> Vec<u8> {
    let map = channel_map_with(stream_id, wf_samples);
    let mut out = Handshake::new(stream_id).encode().to_vec();
    encode_frame(tags::CONFIG, &map.encode(), &mut out);
    for n in 0..events {
        let event = StreamEvent {
            event_number: n,
            timestamp_ns: u64::from(n) * 4_000,
            sparse: false,
            traces: (0..3)
                .map(|i| StreamTrace { index: i, baseline: 200, daq_energy: n + u32::from(i), samples: vec![n as u16; usize::from(wf_samples)] })
                .collect(),
        };
        encode_frame(tags::EVENT, &event.encode(), &mut out);
        if n % 4 == 3 {
            let status = StreamStatus {
                status: 0,
                timestamp_ns: u64::from(n) * 1_000_000,
                cards: vec![CardStatus { address: 1, errors: 0, temperature_mc: 40_000 }],
            };
            encode_frame(tags::STATUS, &status.encode(), &mut out);
        }
    }
    out
}

/// Contents of every `.arrow` file in `dir`, by file name.
pub fn table_files(dir: &Path) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "arrow"))
        .collect();
    files.sort();
    files
        .into_iter()
        .map(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            Ok((name, std::fs::read(&path)?))
        })
        .collect()
}

/// Row count of the table file `<dir>/<table>.arrow`.
pub fn table_rows(dir: &Path, table: &str) -> anyhow::Result<usize> {
    let (_, chunks) = daq2arrow::sink::read_table(&dir.join(format!("{}.arrow", table)))?;
    Ok(chunks.iter().map(|c| c.rows).sum())
}
