//! Legacy record file reader
//!
//! Reads the file header and run header once at open, then yields packets in
//! file order. Every declared body length is checked against the bytes left in
//! the file before the body is read.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use daq2arrow::legacy::LegacyReader;
//!
//! fn list_packets() -> daq2arrow::Result<()> {
//!     let mut reader = LegacyReader::open("run_0042.dqr")?;
//!     println!("Run {}", reader.run_header().run_number);
//!
//!     while let Some(packet) = reader.read_next_packet()? {
//!         println!("packet {} type {} ({} bytes)", packet.index, packet.key(), packet.body.len());
//!     }
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::format::{FileHeader, PACKET_HEADER_SIZE, parse_packet_header};
use crate::types::{RawPacket, RunHeader, RunMetadata};
use crate::{ConversionError, Result, yaml_utils};

/// Sequential reader over a legacy record file.
pub struct LegacyReader<R> {
    reader: R,
    path: PathBuf,
    file_header: FileHeader,
    run_header: RunHeader,
    /// Preamble exactly as stored, kept for verbatim copies
    raw_preamble: Vec<u8>,
    /// Offset of the next unread packet header
    offset: u64,
    file_len: u64,
    packets_read: u64,
}

impl LegacyReader<BufReader<File>> {
    /// Open a legacy file for reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ConversionError::file_error(path.clone(), e))?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl LegacyReader<Cursor<Vec<u8>>> {
    /// Create a reader over an in-memory file image
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_reader(Cursor::new(data), PathBuf::from("<memory>"))
    }
}

impl<R: Read + Seek> LegacyReader<R> {
    /// Create a reader from any seekable byte source
    pub fn from_reader(mut reader: R, path: PathBuf) -> Result<Self> {
        let io_err = |e| ConversionError::file_error(path.clone(), e);

        let file_len = reader.seek(SeekFrom::End(0)).map_err(io_err)?;
        reader.seek(SeekFrom::Start(0)).map_err(io_err)?;

        let file_header = FileHeader::parse_from_reader(&mut reader)?;
        file_header.validate()?;

        let packets_start = file_header.packets_start();
        if packets_start > file_len {
            return Err(ConversionError::corrupt_stream(
                FileHeader::HEADER_SIZE as u64,
                format!(
                    "preamble of {} bytes extends beyond file of {} bytes",
                    file_header.preamble_len, file_len
                ),
            ));
        }

        let mut raw_preamble = vec![0u8; file_header.preamble_len as usize];
        reader.read_exact(&mut raw_preamble).map_err(io_err)?;

        let preamble_offset = FileHeader::HEADER_SIZE as u64;
        let text = yaml_utils::extract_preamble_text(&raw_preamble, preamble_offset)?;
        let run_header = yaml_utils::parse_run_header(&text, preamble_offset)?;

        debug!(
            "Opened legacy file {}: run {}, {} decoders declared, {} bytes of packets",
            path.display(),
            run_header.run_number,
            run_header.decoders.len(),
            file_len - packets_start
        );

        Ok(Self {
            reader,
            path,
            file_header,
            run_header,
            raw_preamble,
            offset: packets_start,
            file_len,
            packets_read: 0,
        })
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` exactly at the end of the file. A partial header or
    /// a body running past the end of the file is a corrupt stream.
    pub fn read_next_packet(&mut self) -> Result<Option<RawPacket>> {
        let remaining = self.file_len - self.offset;
        if remaining == 0 {
            return Ok(None);
        }

        if remaining < PACKET_HEADER_SIZE as u64 {
            return Err(ConversionError::corrupt_stream(
                self.offset,
                format!("{} trailing bytes cannot hold a packet header", remaining),
            ));
        }

        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        self.reader
            .read_exact(&mut header_bytes)
            .map_err(|e| ConversionError::file_error(self.path.clone(), e))?;
        let header = parse_packet_header(&header_bytes, self.offset);

        let body_remaining = remaining - PACKET_HEADER_SIZE as u64;
        if u64::from(header.body_len) > body_remaining {
            // Leave the reader positioned at the bad header
            self.reader
                .seek(SeekFrom::Start(self.offset))
                .map_err(|e| ConversionError::file_error(self.path.clone(), e))?;
            return Err(ConversionError::corrupt_stream(
                self.offset,
                format!(
                    "packet type {} declares {} body bytes, only {} remain",
                    header.key, header.body_len, body_remaining
                ),
            ));
        }

        let mut body = vec![0u8; header.body_len as usize];
        self.reader
            .read_exact(&mut body)
            .map_err(|e| ConversionError::file_error(self.path.clone(), e))?;

        let index = self.packets_read;
        self.packets_read += 1;
        self.offset += PACKET_HEADER_SIZE as u64 + u64::from(header.body_len);

        trace!("Packet {}: type={}, len={}, next offset={}", index, header.key, header.body_len, self.offset);

        Ok(Some(RawPacket::new(header, index, Bytes::from(body))))
    }

    /// Reposition at a packet boundary recorded earlier by [`Self::offset`].
    ///
    /// `packet_index` is the index the packet at `offset` will be given.
    pub fn seek_to(&mut self, offset: u64, packet_index: u64) -> Result<()> {
        if offset < self.file_header.packets_start() || offset > self.file_len {
            return Err(ConversionError::config(
                "legacy seek",
                format!(
                    "offset {} outside packet region {}..={}",
                    offset,
                    self.file_header.packets_start(),
                    self.file_len
                ),
            ));
        }

        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ConversionError::file_error(self.path.clone(), e))?;
        self.offset = offset;
        self.packets_read = packet_index;
        Ok(())
    }

    /// Byte offset of the next unread packet
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of packets returned so far
    pub fn packets_read(&self) -> u64 {
        self.packets_read
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    pub fn run_header(&self) -> &RunHeader {
        &self.run_header
    }

    /// Preamble bytes exactly as stored in the file
    pub fn raw_preamble(&self) -> &[u8] {
        &self.raw_preamble
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata::legacy(
            (self.file_header.version_major, self.file_header.version_minor),
            self.run_header.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::LegacyWriter;
    use crate::types::PacketKey;
    use anyhow::{Context, Result, ensure};

    fn sample_file(bodies: &[&[u8]]) -> Result<Vec<u8>> {
        let header = RunHeader { run_number: 5, ..Default::default() };
        let mut writer = LegacyWriter::new(Vec::new(), &header)?;
        for (i, body) in bodies.iter().enumerate() {
            writer.write_packet(PacketKey(i as u16 + 1), i as u32, body)?;
        }
        Ok(writer.finish()?)
    }

    #[test]
    fn test_reads_packets_in_order_then_ends() -> Result<()> {
        let data = sample_file(&[b"abcd", b"", b"12345678"])?;
        let mut reader = LegacyReader::from_bytes(data).context("opening image")?;
        assert_eq!(reader.run_header().run_number, 5);

        let first = reader.read_next_packet()?.context("first packet")?;
        assert_eq!(first.index, 0);
        assert_eq!(first.key(), PacketKey(1));
        assert_eq!(&first.body[..], b"abcd");
        assert_eq!(first.header.sequence, Some(0));

        let second = reader.read_next_packet()?.context("second packet")?;
        assert!(second.body.is_empty());

        let third = reader.read_next_packet()?.context("third packet")?;
        assert_eq!(third.header.offset, second.header.offset + 12);
        assert_eq!(&third.body[..], b"12345678");

        ensure!(reader.read_next_packet()?.is_none(), "expected end of stream");
        // End of stream is sticky
        ensure!(reader.read_next_packet()?.is_none(), "expected end of stream again");
        assert_eq!(reader.offset(), reader.file_len());
        Ok(())
    }

    #[test]
    fn test_overlong_body_is_corrupt_stream() -> Result<()> {
        let mut data = sample_file(&[b"abcd", b"efgh"])?;
        let second_header = data.len() - 4 - 12;
        // Declare 100 body bytes for the last packet
        data[second_header + 4..second_header + 8].copy_from_slice(&100u32.to_le_bytes());

        let mut reader = LegacyReader::from_bytes(data)?;
        let first = reader.read_next_packet()?.context("first packet is intact")?;
        assert_eq!(&first.body[..], b"abcd");

        match reader.read_next_packet() {
            Err(ConversionError::CorruptStream { offset, .. }) => {
                assert_eq!(offset, second_header as u64);
            }
            other => panic!("Expected CorruptStream, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_partial_trailing_header_is_corrupt_stream() -> Result<()> {
        let mut data = sample_file(&[b"abcd"])?;
        data.extend_from_slice(&[1, 0, 1]);
        let mut reader = LegacyReader::from_bytes(data)?;
        reader.read_next_packet()?.context("intact packet")?;
        assert!(matches!(
            reader.read_next_packet().unwrap_err(),
            ConversionError::CorruptStream { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_seek_to_recorded_offset() -> Result<()> {
        let data = sample_file(&[b"aaaa", b"bbbb", b"cccc"])?;
        let mut reader = LegacyReader::from_bytes(data)?;
        reader.read_next_packet()?;
        let offset = reader.offset();
        let index = reader.packets_read();
        let second = reader.read_next_packet()?.context("second packet")?;
        reader.read_next_packet()?;

        reader.seek_to(offset, index)?;
        let again = reader.read_next_packet()?.context("second packet again")?;
        assert_eq!(again.index, second.index);
        assert_eq!(again.body, second.body);

        assert!(reader.seek_to(3, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let result = LegacyReader::open("/nonexistent/run.dqr");
        assert!(matches!(result, Err(ConversionError::File { .. })));
    }
}
