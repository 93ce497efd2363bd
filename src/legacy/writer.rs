//! Legacy record file writer
//!
//! Used by the skim command to copy a packet prefix, and by simulators and
//! tests to synthesize files.

use std::io::Write;

use super::format::{FileHeader, PACKET_VERSION, encode_packet_header};
use crate::types::{PacketHeader, PacketKey, RawPacket, RunHeader};
use crate::{ConversionError, Result, yaml_utils};

/// Writes a legacy file: header and preamble up front, then packets.
pub struct LegacyWriter<W: Write> {
    writer: W,
    offset: u64,
    packets_written: u64,
}

impl<W: Write> LegacyWriter<W> {
    /// Start a file with a freshly encoded run header.
    pub fn new(writer: W, header: &RunHeader) -> Result<Self> {
        let preamble = yaml_utils::encode_run_header(header)?;
        let preamble_len = u32::try_from(preamble.len())
            .map_err(|_| ConversionError::config("run header", "run header too large"))?;
        Self::with_preamble(writer, &FileHeader::new(preamble_len), &preamble)
    }

    /// Start a file with a preamble copied verbatim from another file.
    pub fn with_preamble(mut writer: W, file_header: &FileHeader, preamble: &[u8]) -> Result<Self> {
        if preamble.len() != file_header.preamble_len as usize {
            return Err(ConversionError::config(
                "legacy writer",
                format!(
                    "preamble is {} bytes, header declares {}",
                    preamble.len(),
                    file_header.preamble_len
                ),
            ));
        }

        writer.write_all(&file_header.encode()).map_err(write_err)?;
        writer.write_all(preamble).map_err(write_err)?;

        Ok(Self { writer, offset: file_header.packets_start(), packets_written: 0 })
    }

    /// Append a version-1 packet.
    pub fn write_packet(&mut self, key: PacketKey, sequence: u32, body: &[u8]) -> Result<()> {
        let body_len = u32::try_from(body.len())
            .map_err(|_| ConversionError::config("legacy writer", "packet body too large"))?;
        let header = PacketHeader {
            key,
            version: PACKET_VERSION,
            flags: 0,
            body_len,
            sequence: Some(sequence),
            offset: self.offset,
        };
        self.write_header_and_body(&header, body)
    }

    /// Append a packet read from another legacy file, header fields unchanged.
    pub fn write_raw_packet(&mut self, packet: &RawPacket) -> Result<()> {
        self.write_header_and_body(&packet.header, &packet.body)
    }

    fn write_header_and_body(&mut self, header: &PacketHeader, body: &[u8]) -> Result<()> {
        self.writer.write_all(&encode_packet_header(header)).map_err(write_err)?;
        self.writer.write_all(body).map_err(write_err)?;
        self.offset += (super::format::PACKET_HEADER_SIZE + body.len()) as u64;
        self.packets_written += 1;
        Ok(())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush().map_err(write_err)?;
        Ok(self.writer)
    }
}

fn write_err(e: std::io::Error) -> ConversionError {
    ConversionError::transport("writing legacy file", e)
}
