//! Streaming format framing
//!
//! ## Stream Structure
//!
//! 1. **Handshake** (16 bytes) - magic, protocol version, stream id
//! 2. **Frames** - 8-byte header (`payload_len`, `tag`, `version`, `flags`) then payload
//!
//! Bytes arrive in arbitrary chunks from the transport. [`FrameAssembler`]
//! buffers them and only releases complete frames.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::cursor::{ByteCursor, CursorError};
use crate::types::{PacketHeader, PacketKey, RawPacket};
use crate::{ConversionError, Result};

/// Magic bytes opening every stream.
pub const STREAM_MAGIC: [u8; 4] = *b"DQST";

pub const HANDSHAKE_SIZE: usize = 16;
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol major version this reader understands.
pub const SUPPORTED_MAJOR_VERSION: u16 = 1;

/// Payload layout version of every streaming decoder.
pub const FRAME_VERSION: u8 = 1;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Frame tags of the streaming protocol.
pub mod tags {
    pub const CONFIG: u16 = 1;
    pub const EVENT: u16 = 2;
    pub const SPARSE_EVENT: u16 = 3;
    pub const STATUS: u16 = 4;
}

/// Connection handshake sent by the DAQ before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version_major: u16,
    pub version_minor: u16,
    pub stream_id: u32,
}

impl Handshake {
    pub fn new(stream_id: u32) -> Self {
        Self { version_major: SUPPORTED_MAJOR_VERSION, version_minor: 0, stream_id }
    }

    pub fn parse(data: &[u8; HANDSHAKE_SIZE], offset: u64) -> Result<Self> {
        let mut cursor = ByteCursor::new(data);
        let corrupt = |e: CursorError| ConversionError::corrupt_stream(offset, format!("handshake: {}", e));

        let magic = cursor.read_array::<4>().map_err(corrupt)?;
        if magic != STREAM_MAGIC {
            return Err(ConversionError::corrupt_stream(
                offset,
                format!("bad handshake magic {:02x?}, expected {:02x?}", magic, STREAM_MAGIC),
            ));
        }

        let version_major = cursor.read_u16_le().map_err(corrupt)?;
        let version_minor = cursor.read_u16_le().map_err(corrupt)?;
        let stream_id = cursor.read_u32_le().map_err(corrupt)?;

        Ok(Self { version_major, version_minor, stream_id })
    }

    pub fn validate(&self) -> Result<()> {
        if self.version_major != SUPPORTED_MAJOR_VERSION {
            return Err(ConversionError::Version {
                what: "streaming protocol",
                expected: SUPPORTED_MAJOR_VERSION,
                found: self.version_major,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[0..4].copy_from_slice(&STREAM_MAGIC);
        out[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.stream_id.to_le_bytes());
        out
    }
}

/// Append one version-1 frame to `out`.
pub fn encode_frame(tag: u16, payload: &[u8], out: &mut Vec<u8>) {
    encode_frame_with_version(tag, FRAME_VERSION, payload, out);
}

pub fn encode_frame_with_version(tag: u16, version: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.push(version);
    out.push(0);
    out.extend_from_slice(payload);
}

/// Reassembles frames from arbitrarily chunked transport reads.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    /// Stream offset of the first buffered byte
    offset: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(64 * 1024), offset: 0 }
    }

    /// Buffer to read transport bytes into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet released as a handshake or frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Stream offset of the next unreleased byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Drop any partial data, e.g. after a reconnect.
    pub fn reset(&mut self) {
        if !self.buf.is_empty() {
            debug!("Discarding {} buffered bytes of an incomplete frame", self.buf.len());
        }
        self.offset += self.buf.len() as u64;
        self.buf.clear();
    }

    /// Release the handshake once all 16 bytes are buffered.
    pub fn try_handshake(&mut self) -> Result<Option<Handshake>> {
        if self.buf.len() < HANDSHAKE_SIZE {
            return Ok(None);
        }

        let mut data = [0u8; HANDSHAKE_SIZE];
        data.copy_from_slice(&self.buf[..HANDSHAKE_SIZE]);
        let handshake = Handshake::parse(&data, self.offset)?;
        handshake.validate()?;

        self.buf.advance(HANDSHAKE_SIZE);
        self.offset += HANDSHAKE_SIZE as u64;
        Ok(Some(handshake))
    }

    /// Release the next complete frame as packet `index`.
    pub fn try_frame(&mut self, index: u64) -> Result<Option<RawPacket>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = ByteCursor::new(&self.buf[..FRAME_HEADER_SIZE]);
        let header_field = |e: CursorError| ConversionError::corrupt_stream(self.offset, e.to_string());
        let payload_len = cursor.read_u32_le().map_err(header_field)?;
        let tag = cursor.read_u16_le().map_err(header_field)?;
        let version = cursor.read_u8().map_err(header_field)?;
        let flags = cursor.read_u8().map_err(header_field)?;

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(ConversionError::corrupt_stream(
                self.offset,
                format!("frame tag {} declares {} payload bytes", tag, payload_len),
            ));
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len as usize;
        if self.buf.len() < frame_len {
            self.buf.reserve(frame_len - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        let body = frame.split_off(FRAME_HEADER_SIZE);

        let header = PacketHeader {
            key: PacketKey(tag),
            version,
            flags,
            body_len: payload_len,
            sequence: None,
            offset: self.offset,
        };
        self.offset += frame_len as u64;

        trace!("Frame {}: tag={}, len={}", index, tag, payload_len);
        Ok(Some(RawPacket::new(header, index, body)))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
