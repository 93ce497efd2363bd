//! Streaming format source over any async byte transport

use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace};

use crate::source::PacketSource;
use crate::streaming::{FrameAssembler, Handshake};
use crate::types::{RawPacket, RunMetadata};
use crate::{ConversionError, Result};

/// Minimum free space kept in the assembly buffer before each read
const READ_CHUNK: usize = 16 * 1024;

/// Source that reassembles streaming frames from partial transport reads
pub struct StreamingSource<T> {
    transport: T,
    assembler: FrameAssembler,
    handshake: Handshake,
    metadata: RunMetadata,
    description: String,
    packets_read: u64,
    /// Set once the transport reports end of stream
    ended: bool,
}

impl StreamingSource<tokio::fs::File> {
    /// Open a recorded stream from disk
    pub async fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
        Self::open(file, path.display().to_string()).await
    }
}

impl<T> StreamingSource<T>
where
    T: AsyncRead + Unpin + Send,
{
    /// Read the handshake from `transport` and return a ready source
    pub async fn open(mut transport: T, description: impl Into<String>) -> Result<Self> {
        let description = description.into();
        let mut assembler = FrameAssembler::new();
        let handshake = read_handshake(&mut transport, &mut assembler, &description).await?;

        info!(
            "Opened stream {}: stream id {}, protocol {}.{}",
            description, handshake.stream_id, handshake.version_major, handshake.version_minor
        );

        let metadata =
            RunMetadata::streaming((handshake.version_major, handshake.version_minor), handshake.stream_id);

        Ok(Self { transport, assembler, handshake, metadata, description, packets_read: 0, ended: false })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Whether the current transport has reached end of stream.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Swap in a fresh transport after a reconnect.
    ///
    /// Partial frame data from the old transport is discarded and the new
    /// handshake is read before any further frames.
    pub async fn replace_transport(&mut self, mut transport: T) -> Result<()> {
        self.assembler.reset();
        let handshake = read_handshake(&mut transport, &mut self.assembler, &self.description).await?;
        if handshake.stream_id != self.handshake.stream_id {
            info!(
                "Stream {} reconnected with new stream id {} (was {})",
                self.description, handshake.stream_id, self.handshake.stream_id
            );
        }
        self.handshake = handshake;
        self.transport = transport;
        self.ended = false;
        Ok(())
    }

    /// Read more bytes into the assembler, returning how many arrived
    async fn fill(&mut self) -> Result<usize> {
        let buf = self.assembler.buffer_mut();
        buf.reserve(READ_CHUNK);
        let n = self
            .transport
            .read_buf(buf)
            .await
            .map_err(|e| ConversionError::transport(format!("reading {}", self.description), e))?;
        trace!("Read {} bytes from {}", n, self.description);
        Ok(n)
    }
}

async fn read_handshake<T>(transport: &mut T, assembler: &mut FrameAssembler, description: &str) -> Result<Handshake>
where
    T: AsyncRead + Unpin + Send,
{
    loop {
        if let Some(handshake) = assembler.try_handshake()? {
            return Ok(handshake);
        }

        let buf = assembler.buffer_mut();
        buf.reserve(READ_CHUNK);
        let n = transport
            .read_buf(buf)
            .await
            .map_err(|e| ConversionError::transport(format!("reading handshake from {}", description), e))?;
        if n == 0 {
            return Err(ConversionError::corrupt_stream(
                assembler.offset(),
                format!("{} ended after {} handshake bytes", description, assembler.buffered()),
            ));
        }
    }
}

#[async_trait::async_trait]
impl<T> PacketSource for StreamingSource<T>
where
    T: AsyncRead + Unpin + Send + 'static,
{
    async fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        loop {
            if let Some(packet) = self.assembler.try_frame(self.packets_read)? {
                self.packets_read += 1;
                return Ok(Some(packet));
            }

            if self.fill().await? == 0 {
                self.ended = true;
                if self.assembler.buffered() == 0 {
                    debug!("Stream {} ended after {} frames", self.description, self.packets_read);
                    return Ok(None);
                }
                return Err(ConversionError::corrupt_stream(
                    self.assembler.offset(),
                    format!("stream ended inside a frame ({} bytes buffered)", self.assembler.buffered()),
                ));
            }
        }
    }

    fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    fn offset(&self) -> u64 {
        self.assembler.offset()
    }

    fn packets_read(&self) -> u64 {
        self.packets_read
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{encode_frame, tags};
    use crate::types::{PacketKey, SourceFormat};
    use anyhow::{Context, Result};

    fn stream_bytes(frames: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Handshake::new(99).encode().to_vec();
        for (tag, payload) in frames {
            encode_frame(*tag, payload, &mut out);
        }
        out
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() -> Result<()> {
        let bytes = stream_bytes(&[(tags::STATUS, vec![1; 24]), (tags::EVENT, vec![2; 30])]);

        // Deliver the stream in awkward pieces
        let mut builder = tokio_test::io::Builder::new();
        builder.read(&bytes[..5]).read(&bytes[5..21]).read(&bytes[21..40]);
        builder.read(&bytes[40..]);
        let mock = builder.build();

        let mut source = StreamingSource::open(mock, "mock").await?;
        assert_eq!(source.metadata().format, SourceFormat::Streaming);
        assert_eq!(source.metadata().stream_id, Some(99));

        let first = source.next_packet().await?.context("first frame")?;
        assert_eq!(first.key(), PacketKey(tags::STATUS));
        assert_eq!(first.index, 0);
        let second = source.next_packet().await?.context("second frame")?;
        assert_eq!(second.key(), PacketKey(tags::EVENT));
        assert_eq!(&second.body[..], &[2; 30]);

        assert!(source.next_packet().await?.is_none());
        assert_eq!(source.offset(), bytes.len() as u64);
        Ok(())
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_corrupt() -> Result<()> {
        let bytes = stream_bytes(&[(tags::STATUS, vec![1; 24])]);
        let mock = tokio_test::io::Builder::new().read(&bytes[..bytes.len() - 3]).build();

        let mut source = StreamingSource::open(mock, "mock").await?;
        match source.next_packet().await {
            Err(ConversionError::CorruptStream { offset, .. }) => assert_eq!(offset, 16),
            other => panic!("Expected CorruptStream, got {:?}", other.map(|p| p.map(|p| p.index))),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_short_handshake_is_corrupt() {
        let mock = tokio_test::io::Builder::new().read(b"DQST\x01\x00").build();
        let result = StreamingSource::open(mock, "mock").await;
        assert!(matches!(result, Err(ConversionError::CorruptStream { .. })));
    }

    #[tokio::test]
    async fn test_read_error_is_transport_error() -> Result<()> {
        let bytes = stream_bytes(&[]);
        let mock = tokio_test::io::Builder::new()
            .read(&bytes)
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let mut source = StreamingSource::open(mock, "mock").await?;
        let err = source.next_packet().await.unwrap_err();
        assert!(matches!(err, ConversionError::Transport { .. }));
        Ok(())
    }
}
