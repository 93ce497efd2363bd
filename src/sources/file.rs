//! Legacy file source

use std::io::{Read, Seek};
use std::path::Path;
use tracing::{debug, info};

use crate::Result;
use crate::legacy::LegacyReader;
use crate::source::PacketSource;
use crate::types::{RawPacket, RunMetadata};

/// Source that reads packets from a legacy record file
pub struct LegacyFileSource<R> {
    /// Legacy file reader
    reader: LegacyReader<R>,

    /// Cached metadata
    metadata: RunMetadata,
}

impl LegacyFileSource<std::io::BufReader<std::fs::File>> {
    /// Open a legacy file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = LegacyReader::open(path)?;
        info!(
            "Opened legacy file {}: run {}, {} bytes",
            reader.file_path().display(),
            reader.run_header().run_number,
            reader.file_len()
        );
        Ok(Self::from_reader(reader))
    }
}

impl<R: Read + Seek> LegacyFileSource<R> {
    /// Wrap an already opened reader
    pub fn from_reader(reader: LegacyReader<R>) -> Self {
        let metadata = reader.metadata();
        Self { reader, metadata }
    }

    pub fn reader(&self) -> &LegacyReader<R> {
        &self.reader
    }
}

#[async_trait::async_trait]
impl<R> PacketSource for LegacyFileSource<R>
where
    R: Read + Seek + Send + 'static,
{
    async fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        let packet = self.reader.read_next_packet()?;
        if packet.is_none() {
            debug!("Reached end of {}", self.reader.file_path().display());
        }
        Ok(packet)
    }

    fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    fn offset(&self) -> u64 {
        self.reader.offset()
    }

    fn packets_read(&self) -> u64 {
        self.reader.packets_read()
    }

    fn describe(&self) -> String {
        self.reader.file_path().display().to_string()
    }

    async fn seek_to(&mut self, offset: u64, packet_index: u64) -> Result<bool> {
        self.reader.seek_to(offset, packet_index)?;
        debug!("Seeked to offset {} (packet {})", offset, packet_index);
        Ok(true)
    }
}
