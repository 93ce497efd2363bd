//! Decoder dispatch by packet-type key

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{
    AdcDecoder, Decoder, DecoderState, DigitizerDecoder, GARBAGE_DECODER, GARBAGE_TABLE, RunControlDecoder,
    SchemaProvider, StreamConfigDecoder, StreamEventDecoder, StreamStatusDecoder, garbage_schema,
};
use crate::DecodeError;
use crate::streaming::tags;
use crate::types::{DecodedRecord, PacketKey, RawPacket, RunHeader, RunMetadata, SourceFormat, StreamKey, TableSchema};

/// Maps packet-type keys to decoders and holds their shared state.
///
/// ```rust
/// use std::sync::Arc;
/// use daq2arrow::decoders::{DecoderRegistry, RunControlDecoder};
/// use daq2arrow::types::PacketKey;
///
/// let mut registry = DecoderRegistry::new();
/// registry.register(PacketKey(3), Arc::new(RunControlDecoder));
/// assert!(registry.decoder_for(PacketKey(3)).is_some());
/// assert!(registry.decoder_for(PacketKey(4)).is_none());
/// ```
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: BTreeMap<PacketKey, Arc<dyn Decoder>>,
    by_name: BTreeMap<&'static str, Arc<dyn Decoder>>,
    state: DecoderState,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry a source's metadata calls for.
    ///
    /// Legacy files name their decoders in the run header; streaming sources
    /// use the fixed frame tags.
    pub fn for_metadata(metadata: &RunMetadata) -> Self {
        let mut registry = Self::new();
        match (metadata.format, &metadata.header) {
            (SourceFormat::Legacy, Some(header)) => registry.register_legacy(header),
            (SourceFormat::Legacy, None) => warn!("Legacy source without run header, no decoders registered"),
            (SourceFormat::Streaming, _) => registry.register_streaming(),
        }
        registry
    }

    fn register_legacy(&mut self, header: &RunHeader) {
        for (&id, name) in &header.decoders {
            let decoder: Arc<dyn Decoder> = match name.as_str() {
                super::digitizer::DECODER_NAME => Arc::new(DigitizerDecoder::from_header(header)),
                super::adc::DECODER_NAME => Arc::new(AdcDecoder::from_header(header)),
                super::run_control::DECODER_NAME => Arc::new(RunControlDecoder),
                other => {
                    warn!("Run header names unknown decoder '{}' for data id {}, packets will be skipped", other, id);
                    continue;
                }
            };
            self.register(PacketKey(id), decoder);
        }
    }

    fn register_streaming(&mut self) {
        self.register(PacketKey(tags::CONFIG), Arc::new(StreamConfigDecoder));
        self.register(PacketKey(tags::EVENT), Arc::new(StreamEventDecoder::full()));
        self.register(PacketKey(tags::SPARSE_EVENT), Arc::new(StreamEventDecoder::sparse()));
        self.register(PacketKey(tags::STATUS), Arc::new(StreamStatusDecoder));
    }

    /// Register `decoder` for `key`, returning the decoder it replaces.
    pub fn register(&mut self, key: PacketKey, decoder: Arc<dyn Decoder>) -> Option<Arc<dyn Decoder>> {
        debug!("Registered decoder {} for packet type {}", decoder.name(), key);
        self.by_name.insert(decoder.name(), Arc::clone(&decoder));
        self.decoders.insert(key, decoder)
    }

    pub fn decoder_for(&self, key: PacketKey) -> Option<&dyn Decoder> {
        self.decoders.get(&key).map(|d| d.as_ref())
    }

    pub fn decoder_named(&self, name: &str) -> Option<&dyn Decoder> {
        self.by_name.get(name).map(|d| d.as_ref())
    }

    /// Registered decoder names, sorted.
    pub fn decoder_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }

    /// Whether packets of `key` change decoder state.
    pub fn is_stateful(&self, key: PacketKey) -> bool {
        self.decoders.get(&key).is_some_and(|d| d.is_stateful())
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Decode one packet.
    ///
    /// A key without a decoder yields [`DecodeError::UnknownPacketType`]; a
    /// body version the decoder does not know yields
    /// [`DecodeError::UnsupportedVersion`].
    pub fn decode(&mut self, packet: &RawPacket) -> Result<Vec<DecodedRecord>, DecodeError> {
        let key = packet.key();
        let decoder = self.decoders.get(&key).ok_or(DecodeError::UnknownPacketType { key })?;

        if packet.header.version != decoder.header_version() {
            return Err(DecodeError::UnsupportedVersion { what: decoder.name(), found: packet.header.version });
        }

        let records = decoder.decode(packet, &mut self.state)?;
        trace!("Packet {} ({}): {} records", packet.index, decoder.name(), records.len());
        Ok(records)
    }

    /// Apply a stateful packet without keeping its records.
    ///
    /// Used to rebuild decoder state when resuming past already converted
    /// packets. Stateless packets are ignored.
    pub fn replay(&mut self, packet: &RawPacket) -> Result<(), DecodeError> {
        if self.is_stateful(packet.key()) {
            self.decode(packet)?;
        }
        Ok(())
    }
}

impl SchemaProvider for DecoderRegistry {
    fn declared_schema(&self, stream: &StreamKey) -> Option<TableSchema> {
        if stream.decoder == GARBAGE_DECODER {
            return Some(garbage_schema());
        }
        self.by_name.get(stream.decoder)?.declared_schema(stream.key)
    }

    fn default_table(&self, stream: &StreamKey) -> String {
        if stream.decoder == GARBAGE_DECODER {
            return GARBAGE_TABLE.to_string();
        }
        match self.by_name.get(stream.decoder) {
            Some(decoder) => decoder.default_table(stream.key),
            None => format!("{}_{}", stream.decoder, stream.key),
        }
    }
}
