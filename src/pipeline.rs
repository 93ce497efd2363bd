//! Conversion pipeline: source → decoders → buffers → sink
//!
//! One [`Converter`] drives one input. Packets are read, decoded and buffered
//! strictly in arrival order; the only suspension point is the read itself,
//! which races the cancellation token. Whatever way the loop ends, every
//! buffer is drained before [`Converter::run`] returns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{AppendOutcome, BufferManager};
use crate::checkpoint::{Checkpoint, TableCheckpoint};
use crate::config::ConversionConfig;
use crate::decoders::{DecoderRegistry, garbage_record};
use crate::sink::{ArrowSink, OutputSink, RestoredTable, WriteMode};
use crate::source::PacketSource;
use crate::sources::{SourceSpec, open_source};
use crate::types::{DecodedRecord, PacketKey, RawPacket};
use crate::{ConversionError, DecodeError, Result};

/// Packets between progress updates
pub const PROGRESS_INTERVAL: u64 = 1024;

/// Counts of everything that did not end up as a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCounters {
    /// Records produced by the decoders
    pub records_decoded: u64,
    /// Packets without a registered decoder
    pub unrecognized: u64,
    pub truncated: u64,
    pub malformed: u64,
    /// Unsupported content or header version
    pub unsupported: u64,
    pub missing_configuration: u64,
    /// Records matching no buffer library entry
    pub unrouted: u64,
    /// Records for tables out of service
    pub discarded: u64,
    pub schema_mismatches: u64,
    pub garbage_rows: u64,
}

impl RunCounters {
    fn count_decode_error(&mut self, error: &DecodeError) {
        match error {
            DecodeError::UnknownPacketType { .. } => self.unrecognized += 1,
            DecodeError::Truncated { .. } => self.truncated += 1,
            DecodeError::UnsupportedVersion { .. } | DecodeError::Unsupported { .. } => self.unsupported += 1,
            DecodeError::Malformed { .. } => self.malformed += 1,
            DecodeError::MissingConfiguration { .. } => self.missing_configuration += 1,
        }
    }

    /// Packets that could not be decoded, for any reason
    pub fn decode_failures(&self) -> u64 {
        self.unrecognized + self.truncated + self.malformed + self.unsupported + self.missing_configuration
    }
}

/// Why the packet loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfStream,
    PacketLimit,
    ByteLimit,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::PacketLimit => f.write_str("packet limit"),
            StopReason::ByteLimit => f.write_str("byte limit"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Position of a running conversion, published over a watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub packets: u64,
    pub bytes: u64,
    pub records: u64,
}

/// Outcome of a finished conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub input: String,
    pub stop_reason: StopReason,
    /// Packets read from the start of the input
    pub packets: u64,
    /// Byte offset of the next unread packet
    pub bytes: u64,
    /// Rows written per table
    pub tables: BTreeMap<String, u64>,
    pub failed_tables: Vec<String>,
    pub counters: RunCounters,
    /// Offset a resumed run started from
    pub resumed_from: Option<u64>,
}

impl RunSummary {
    /// Whether every table survived the run
    pub fn is_clean(&self) -> bool {
        self.failed_tables.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.values().sum()
    }

    pub fn log(&self) {
        info!(
            "{}: {} after {} packets ({} bytes), {} records into {} tables",
            self.input,
            self.stop_reason,
            self.packets,
            self.bytes,
            self.counters.records_decoded,
            self.tables.len()
        );
        for (table, rows) in &self.tables {
            info!("  {}: {} rows", table, rows);
        }
        let c = &self.counters;
        if c.decode_failures() > 0 {
            info!(
                "  skipped packets: {} unrecognized, {} truncated, {} malformed, {} unsupported, {} missing configuration",
                c.unrecognized, c.truncated, c.malformed, c.unsupported, c.missing_configuration
            );
        }
        if c.unrouted + c.discarded + c.garbage_rows > 0 {
            info!("  {} unrouted, {} discarded, {} garbage rows", c.unrouted, c.discarded, c.garbage_rows);
        }
        for table in &self.failed_tables {
            warn!("  table '{}' was taken out of service by a schema mismatch", table);
        }
    }
}

/// Converts the packets of one source into tables of one sink.
pub struct Converter<S> {
    input: String,
    source: Box<dyn PacketSource>,
    registry: DecoderRegistry,
    manager: BufferManager<S>,
    max_packets: Option<u64>,
    max_bytes: Option<u64>,
    keep_garbage: bool,
    counters: RunCounters,
    /// (packet type, error code) pairs already logged
    warned: HashSet<(PacketKey, u8)>,
    resumed_from: Option<u64>,
    progress: watch::Sender<Progress>,
}

impl<S: OutputSink> Converter<S> {
    /// Set up a conversion with decoders chosen from the source's metadata.
    pub fn new(input: impl Into<String>, source: Box<dyn PacketSource>, sink: S, config: &ConversionConfig) -> Result<Self> {
        config.validate()?;
        let registry = DecoderRegistry::for_metadata(source.metadata());
        let manager = BufferManager::new(sink, config.buffer_library()?, config.buffer_size);
        let (progress, _) = watch::channel(Progress::default());

        Ok(Self {
            input: input.into(),
            source,
            registry,
            manager,
            max_packets: config.max_packets,
            max_bytes: config.max_bytes,
            keep_garbage: config.keep_garbage,
            counters: RunCounters::default(),
            warned: HashSet::new(),
            resumed_from: None,
            progress,
        })
    }

    /// Replace the decoder registry.
    pub fn with_registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &BufferManager<S> {
        &self.manager
    }

    pub fn source(&self) -> &dyn PacketSource {
        self.source.as_ref()
    }

    pub fn into_sink(self) -> S {
        self.manager.into_sink()
    }

    /// Continue where a checkpointed run stopped.
    ///
    /// `restored` holds the tables the sink reloaded. The source is moved to
    /// the checkpointed offset, replaying configuration packets on the way
    /// when it cannot seek.
    pub async fn resume(&mut self, checkpoint: &Checkpoint, restored: BTreeMap<String, RestoredTable>) -> Result<()> {
        if !self.source.is_resumable() {
            return Err(ConversionError::config("resume", format!("{} cannot be resumed", self.source.describe())));
        }
        let format = self.source.metadata().format;
        if checkpoint.format != format {
            return Err(ConversionError::config(
                "resume",
                format!("checkpoint was written for a {} input, this input is {}", checkpoint.format, format),
            ));
        }

        for (table, entry) in &checkpoint.tables {
            let on_disk = restored
                .get(table)
                .map_or(0, |r| r.flushed + r.tail.as_ref().map_or(0, |t| t.rows as u64));
            if on_disk != entry.rows {
                return Err(ConversionError::config(
                    "resume",
                    format!("table '{}' holds {} rows but the checkpoint recorded {}", table, on_disk, entry.rows),
                ));
            }
        }

        for (table, restored) in restored {
            let capacity = checkpoint.tables.get(&table).map_or(self.manager.capacity_for(&table), |t| t.capacity);
            if checkpoint.failed_tables.contains(&table) {
                self.manager.restore_table(&table, restored.schema, capacity, restored.flushed, None)?;
                self.manager.mark_failed(&table);
            } else {
                self.manager.restore_table(&table, restored.schema, capacity, restored.flushed, restored.tail)?;
            }
        }

        self.advance_source(checkpoint.offset, checkpoint.packets_read).await?;

        // Manager-owned counters restart at zero and are added back in the summary
        self.counters = checkpoint.counters.clone();
        self.resumed_from = Some(checkpoint.offset);
        info!(
            "Resuming {} at packet {} (byte {}), {} tables restored",
            self.input,
            checkpoint.packets_read,
            checkpoint.offset,
            checkpoint.tables.len()
        );
        Ok(())
    }

    async fn advance_source(&mut self, offset: u64, packets_read: u64) -> Result<()> {
        if self.source.seek_to(offset, packets_read).await? {
            return Ok(());
        }

        let mut replayed = 0u64;
        while self.source.packets_read() < packets_read {
            let Some(packet) = self.source.next_packet().await? else {
                return Err(ConversionError::config(
                    "resume",
                    format!("input ended after {} packets, checkpoint expects {}", self.source.packets_read(), packets_read),
                ));
            };
            if self.registry.is_stateful(packet.key()) {
                replayed += 1;
                // Failures were counted by the run that wrote the checkpoint
                if let Err(e) = self.registry.replay(&packet) {
                    trace!("Replay of packet {} failed: {}", packet.index, e);
                }
            }
        }

        if self.source.offset() != offset {
            return Err(ConversionError::config(
                "resume",
                format!(
                    "packet {} ends at byte {}, checkpoint recorded {}; the input changed",
                    packets_read,
                    self.source.offset(),
                    offset
                ),
            ));
        }
        debug!("Skipped {} packets, replayed {} configuration packets", packets_read, replayed);
        Ok(())
    }

    /// Convert until the input ends, a limit is hit or `cancel` fires.
    ///
    /// Buffers are drained on every exit path, fatal errors included, so the
    /// sink always holds the converted prefix.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary> {
        info!("Converting {} ({} format)", self.source.describe(), self.source.metadata().format);

        let stop_reason = match self.convert_packets(cancel).await {
            Ok(reason) => reason,
            Err(e) => {
                if let Err(drain_error) = self.manager.finalize() {
                    warn!("Final drain after failure also failed: {}", drain_error);
                }
                self.publish_progress();
                error!("Conversion of {} stopped at packet {}: {}", self.input, self.source.packets_read(), e);
                return Err(e);
            }
        };

        self.manager.finalize()?;
        self.publish_progress();

        let summary = self.summary(stop_reason);
        summary.log();
        Ok(summary)
    }

    async fn convert_packets(&mut self, cancel: &CancellationToken) -> Result<StopReason> {
        loop {
            if cancel.is_cancelled() {
                info!("Conversion of {} cancelled", self.input);
                return Ok(StopReason::Cancelled);
            }
            if let Some(reason) = self.limit_reached() {
                debug!("Stopping at {}", reason);
                return Ok(reason);
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Conversion of {} cancelled during read", self.input);
                    return Ok(StopReason::Cancelled);
                }
                next = self.source.next_packet() => next?,
            };

            let Some(packet) = next else {
                debug!("{} ended after {} packets", self.input, self.source.packets_read());
                return Ok(StopReason::EndOfStream);
            };

            self.process(packet)?;

            if self.source.packets_read() % PROGRESS_INTERVAL == 0 {
                self.publish_progress();
            }
        }
    }

    fn limit_reached(&self) -> Option<StopReason> {
        if self.max_packets.is_some_and(|max| self.source.packets_read() >= max) {
            return Some(StopReason::PacketLimit);
        }
        if self.max_bytes.is_some_and(|max| self.source.offset() >= max) {
            return Some(StopReason::ByteLimit);
        }
        None
    }

    fn process(&mut self, packet: RawPacket) -> Result<()> {
        trace!("Packet {} type {} ({} bytes)", packet.index, packet.key(), packet.body.len());

        match self.registry.decode(&packet) {
            Ok(records) => {
                self.counters.records_decoded += records.len() as u64;
                for record in records {
                    self.append(record)?;
                }
            }
            Err(e) => self.decode_failed(&packet, e)?,
        }
        Ok(())
    }

    fn decode_failed(&mut self, packet: &RawPacket, error: DecodeError) -> Result<()> {
        self.counters.count_decode_error(&error);

        if self.warned.insert((packet.key(), error.code())) {
            warn!(
                "Skipping packet {} (type {}) at byte {}: {}; later failures of this kind are only counted",
                packet.index,
                packet.key(),
                packet.header.offset,
                error
            );
        } else {
            trace!("Skipping packet {}: {}", packet.index, error);
        }

        if self.keep_garbage
            && let Some(AppendOutcome::Buffered | AppendOutcome::Flushed) = self.append(garbage_record(packet, &error))?
        {
            self.counters.garbage_rows += 1;
        }
        Ok(())
    }

    /// Append one record; a schema mismatch only costs its table.
    fn append(&mut self, record: DecodedRecord) -> Result<Option<AppendOutcome>> {
        match self.manager.append(record, &self.registry) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if !e.is_fatal_for_run() => {
                self.counters.schema_mismatches += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn publish_progress(&self) {
        self.progress.send_replace(Progress {
            packets: self.source.packets_read(),
            bytes: self.source.offset(),
            records: self.counters.records_decoded,
        });
    }

    fn summary(&self, stop_reason: StopReason) -> RunSummary {
        let mut counters = self.counters.clone();
        counters.unrouted += self.manager.unrouted();
        counters.discarded += self.manager.discarded();

        RunSummary {
            input: self.input.clone(),
            stop_reason,
            packets: self.source.packets_read(),
            bytes: self.source.offset(),
            tables: self.manager.flushed_rows().clone(),
            failed_tables: self.manager.failed_tables().iter().cloned().collect(),
            counters,
            resumed_from: self.resumed_from,
        }
    }

    /// Checkpoint describing where this run stopped.
    pub fn checkpoint(&self, summary: &RunSummary) -> Checkpoint {
        let tables = summary
            .tables
            .iter()
            .map(|(table, &rows)| (table.clone(), TableCheckpoint { rows, capacity: self.manager.capacity_for(table) }))
            .collect();

        Checkpoint {
            input: self.input.clone(),
            format: self.source.metadata().format,
            offset: summary.bytes,
            packets_read: summary.packets,
            tables,
            failed_tables: summary.failed_tables.clone(),
            complete: summary.stop_reason == StopReason::EndOfStream,
            counters: summary.counters.clone(),
        }
    }
}

/// Convert one input into Arrow tables under `out_dir`.
///
/// Honors the write mode of `config`: resume picks up the checkpoint left in
/// `out_dir`. A checkpoint is saved when the run ends cleanly and the input
/// can be resumed.
pub async fn run_conversion(
    spec: &SourceSpec,
    out_dir: &Path,
    config: &ConversionConfig,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    config.validate()?;
    let resume = config.mode == WriteMode::Resume;
    if resume && matches!(spec, SourceSpec::Tcp(_)) {
        return Err(ConversionError::config("resume", format!("{} is a live socket and cannot be resumed", spec)));
    }

    let checkpoint = if resume { Checkpoint::load(out_dir)? } else { None };
    if let Some(checkpoint) = &checkpoint
        && checkpoint.input != spec.to_string()
    {
        return Err(ConversionError::config(
            "resume",
            format!("checkpoint in {} belongs to {}", out_dir.display(), checkpoint.input),
        ));
    }

    let source = open_source(spec, config.reconnect).await?;
    let mut sink = ArrowSink::create(out_dir, config.mode)?;
    let restored = if resume {
        let (capacities, failed) = match &checkpoint {
            Some(c) => (c.capacities(), c.failed_tables.clone()),
            None => (BTreeMap::new(), Vec::new()),
        };
        sink.restore(&capacities, &failed)?
    } else {
        BTreeMap::new()
    };

    let mut converter = Converter::new(spec.to_string(), source, sink, config)?;
    if let Some(checkpoint) = &checkpoint {
        converter.resume(checkpoint, restored).await?;
    }

    let summary = converter.run(cancel).await?;
    if config.checkpoint && converter.source().is_resumable() {
        converter.checkpoint(&summary).save(out_dir)?;
        debug!("Checkpoint saved to {}", Checkpoint::path(out_dir).display());
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::RunControlPacket;
    use crate::sink::MemorySink;
    use crate::sources::LegacyFileSource;
    use crate::test_utils::LegacyFixture;
    use anyhow::Result;

    fn converter(fixture: &LegacyFixture, config: &ConversionConfig) -> Result<Converter<MemorySink>> {
        let source = LegacyFileSource::from_reader(fixture.reader()?);
        Ok(Converter::new("fixture", Box::new(source), MemorySink::new(), config)?)
    }

    fn run_control(n: u32) -> Vec<u8> {
        RunControlPacket { run_number: 7, subrun: n, timestamp: u64::from(n) * 10, kind: 2 }.encode()
    }

    #[tokio::test]
    async fn test_unknown_packet_between_valid_ones() -> Result<()> {
        let mut fixture = LegacyFixture::new();
        fixture.push(LegacyFixture::RUN_CONTROL, run_control(0));
        fixture.push(99, vec![0xde, 0xad]);
        fixture.push(LegacyFixture::RUN_CONTROL, run_control(1));

        let mut converter = converter(&fixture, &ConversionConfig::default())?;
        let summary = converter.run(&CancellationToken::new()).await?;

        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(summary.counters.unrecognized, 1);
        assert_eq!(summary.tables.get("run_control"), Some(&2));
        assert_eq!(summary.tables.len(), 1);
        let sink = converter.into_sink();
        assert_eq!(sink.table_names(), vec!["run_control".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_packet_and_byte_limits() -> Result<()> {
        let mut fixture = LegacyFixture::new();
        for n in 0..10 {
            fixture.push(LegacyFixture::RUN_CONTROL, run_control(n));
        }

        let config = ConversionConfig { max_packets: Some(4), ..Default::default() };
        let summary = converter(&fixture, &config)?.run(&CancellationToken::new()).await?;
        assert_eq!(summary.stop_reason, StopReason::PacketLimit);
        assert_eq!(summary.packets, 4);
        assert_eq!(summary.total_rows(), 4);

        let config = ConversionConfig { max_bytes: Some(fixture.packet_offset(3)), ..Default::default() };
        let summary = converter(&fixture, &config)?.run(&CancellationToken::new()).await?;
        assert_eq!(summary.stop_reason, StopReason::ByteLimit);
        assert_eq!(summary.packets, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_still_drains() -> Result<()> {
        let mut fixture = LegacyFixture::new();
        fixture.push(LegacyFixture::RUN_CONTROL, run_control(0));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut converter = converter(&fixture, &ConversionConfig::default())?;
        let summary = converter.run(&cancel).await?;
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.packets, 0);
        assert!(converter.manager().is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_garbage_table_and_progress() -> Result<()> {
        let mut fixture = LegacyFixture::new();
        fixture.push(LegacyFixture::RUN_CONTROL, run_control(0));
        fixture.push(LegacyFixture::RUN_CONTROL, vec![1, 2, 3]);
        fixture.push(42, vec![4, 5]);

        let config = ConversionConfig { keep_garbage: true, ..Default::default() };
        let mut converter = converter(&fixture, &config)?;
        let progress = converter.subscribe();
        let summary = converter.run(&CancellationToken::new()).await?;

        assert_eq!(summary.counters.truncated, 1);
        assert_eq!(summary.counters.unrecognized, 1);
        assert_eq!(summary.counters.garbage_rows, 2);
        assert_eq!(summary.tables.get("garbage"), Some(&2));
        assert_eq!(progress.borrow().packets, 3);

        let sink = converter.into_sink();
        let rows = sink.records("garbage");
        assert_eq!(rows[1][1], crate::types::Value::UInt16(42));
        assert_eq!(rows[1][3], crate::types::Value::UInt8(1));
        Ok(())
    }
}
