//! Legacy record file format structures and parsing
//!
//! ## File Structure
//!
//! 1. **File Header** (16 bytes) - magic, version, preamble length
//! 2. **Preamble** - NUL-padded YAML run header (multiple of 4 bytes)
//! 3. **Packets** - back-to-back 12-byte headers each followed by a body
//!
//! All integers are little-endian.

use std::io::Read;
use tracing::{debug, trace};

use crate::cursor::{ByteCursor, CursorError};
use crate::types::{PacketHeader, PacketKey};
use crate::{ConversionError, Result};

/// Magic bytes opening every legacy file.
pub const LEGACY_MAGIC: [u8; 4] = *b"DQRF";

pub const FILE_HEADER_SIZE: usize = 16;
pub const PACKET_HEADER_SIZE: usize = 12;

/// File header major version this reader understands.
pub const SUPPORTED_MAJOR_VERSION: u16 = 1;

/// Body layout version of every legacy decoder.
pub const PACKET_VERSION: u8 = 1;

// A run header larger than this is certainly corruption
const MAX_PREAMBLE_LEN: u32 = 64 * 1024 * 1024;

/// Fixed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    /// Length of the padded preamble in bytes
    pub preamble_len: u32,
}

impl FileHeader {
    pub const HEADER_SIZE: usize = FILE_HEADER_SIZE;

    pub fn new(preamble_len: u32) -> Self {
        Self { version_major: SUPPORTED_MAJOR_VERSION, version_minor: 0, preamble_len }
    }

    pub fn parse_from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        trace!("Reading legacy file header ({} bytes)", FILE_HEADER_SIZE);
        let mut data = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut data).map_err(|e| {
            ConversionError::corrupt_stream(
                0,
                format!("failed to read {} file header bytes: {}", FILE_HEADER_SIZE, e),
            )
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        let mut cursor = ByteCursor::new(data);
        let bad_header = |e: CursorError| ConversionError::corrupt_stream(0, format!("file header: {}", e));

        let magic = cursor.read_array::<4>().map_err(bad_header)?;
        if magic != LEGACY_MAGIC {
            return Err(ConversionError::corrupt_stream(
                0,
                format!("bad magic {:02x?}, expected {:02x?}", magic, LEGACY_MAGIC),
            ));
        }

        let version_major = cursor.read_u16_le().map_err(bad_header)?;
        let version_minor = cursor.read_u16_le().map_err(bad_header)?;
        let preamble_len = cursor.read_u32_le().map_err(bad_header)?;

        debug!(
            "Parsed legacy file header: version={}.{}, preamble_len={}",
            version_major, version_minor, preamble_len
        );

        Ok(Self { version_major, version_minor, preamble_len })
    }

    pub fn validate(&self) -> Result<()> {
        if self.version_major != SUPPORTED_MAJOR_VERSION {
            return Err(ConversionError::Version {
                what: "legacy file",
                expected: SUPPORTED_MAJOR_VERSION,
                found: self.version_major,
            });
        }

        if self.preamble_len % 4 != 0 {
            return Err(ConversionError::corrupt_stream(
                0,
                format!("preamble length {} is not word aligned", self.preamble_len),
            ));
        }

        if self.preamble_len > MAX_PREAMBLE_LEN {
            return Err(ConversionError::corrupt_stream(
                0,
                format!("preamble length {} is unreasonably large", self.preamble_len),
            ));
        }

        Ok(())
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[0..4].copy_from_slice(&LEGACY_MAGIC);
        out[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.preamble_len.to_le_bytes());
        out
    }

    /// Byte offset of the first packet.
    pub fn packets_start(&self) -> u64 {
        FILE_HEADER_SIZE as u64 + u64::from(self.preamble_len)
    }
}

/// Parse a 12-byte packet header found at `offset`.
pub fn parse_packet_header(data: &[u8; PACKET_HEADER_SIZE], offset: u64) -> PacketHeader {
    // struct packet_header {
    //   u16 type_key;     // offset 0
    //   u8  version;      // offset 2
    //   u8  flags;        // offset 3
    //   u32 body_len;     // offset 4
    //   u32 sequence;     // offset 8
    // }
    PacketHeader {
        key: PacketKey(u16::from_le_bytes([data[0], data[1]])),
        version: data[2],
        flags: data[3],
        body_len: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        sequence: Some(u32::from_le_bytes([data[8], data[9], data[10], data[11]])),
        offset,
    }
}

pub fn encode_packet_header(header: &PacketHeader) -> [u8; PACKET_HEADER_SIZE] {
    let mut out = [0u8; PACKET_HEADER_SIZE];
    out[0..2].copy_from_slice(&header.key.0.to_le_bytes());
    out[2] = header.version;
    out[3] = header.flags;
    out[4..8].copy_from_slice(&header.body_len.to_le_bytes());
    out[8..12].copy_from_slice(&header.sequence.unwrap_or(0).to_le_bytes());
    out
}
