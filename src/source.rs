//! Packet source trait shared by both input formats

use crate::Result;
use crate::types::{RawPacket, RunMetadata};

/// Trait for raw packet sources
///
/// Sources abstract over the input format (legacy file, streaming frames)
/// and the transport (file, socket). The preamble is read when the source is
/// opened, so metadata is available before the first packet.
#[async_trait::async_trait]
pub trait PacketSource: Send + 'static {
    /// Get the next packet
    ///
    /// Returns:
    /// - `Ok(Some(packet))` - Packet available
    /// - `Ok(None)` - Stream ended (normal termination)
    /// - `Err(e)` - Transport failure or corrupt stream
    ///
    /// Dropping the returned future before it resolves must not lose or
    /// duplicate packets.
    async fn next_packet(&mut self) -> Result<Option<RawPacket>>;

    /// Metadata read from the preamble or handshake
    fn metadata(&self) -> &RunMetadata;

    /// Byte offset of the next unread packet
    fn offset(&self) -> u64;

    /// Number of packets returned so far
    fn packets_read(&self) -> u64;

    /// Human-readable description for logs and checkpoints
    fn describe(&self) -> String;

    /// Whether a later run can continue this source from a saved offset
    fn is_resumable(&self) -> bool {
        true
    }

    /// Jump straight to a packet boundary recorded by [`Self::offset`]
    ///
    /// Returns `Ok(false)` when the source can only advance by reading.
    async fn seek_to(&mut self, _offset: u64, _packet_index: u64) -> Result<bool> {
        Ok(false)
    }
}
