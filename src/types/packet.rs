//! Packet types shared by both input formats

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet-type key used for decoder dispatch.
///
/// Legacy files carry a data id per packet; streaming frames carry a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketKey(pub u16);

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the two wire formats a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Back-to-back fixed-header records in a file
    Legacy,
    /// Framed messages after a handshake, from a socket or a recording
    Streaming,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Legacy => f.write_str("legacy"),
            SourceFormat::Streaming => f.write_str("streaming"),
        }
    }
}

/// Fixed header common to both formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Decoder dispatch key
    pub key: PacketKey,
    /// Layout version of the body
    pub version: u8,
    /// Reserved flag bits, preserved verbatim
    pub flags: u8,
    /// Declared body length in bytes
    pub body_len: u32,
    /// Sequence number (legacy format only)
    pub sequence: Option<u32>,
    /// Byte offset of the header within the source stream
    pub offset: u64,
}

/// One packet as produced by a source.
///
/// Consumed by exactly one decoder, then discarded.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub header: PacketHeader,
    /// 0-based position of the packet in its stream
    pub index: u64,
    pub body: Bytes,
}

impl RawPacket {
    pub fn new(header: PacketHeader, index: u64, body: Bytes) -> Self {
        Self { header, index, body }
    }

    pub fn key(&self) -> PacketKey {
        self.header.key
    }
}
