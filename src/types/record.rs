//! Decoded record types

use std::fmt;

use super::Value;

/// Routing identity of a record: which decoder produced it and for which key.
///
/// The key is decoder-specific (a digitizer channel id, a channel key
/// `card << 16 | input`, a card address, or 0 for singleton tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub decoder: &'static str,
    pub key: u32,
}

impl StreamKey {
    pub const fn new(decoder: &'static str, key: u32) -> Self {
        Self { decoder, key }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.decoder, self.key)
    }
}

/// One row destined for an output table.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub stream: StreamKey,
    /// Field values in schema order
    pub fields: Vec<(&'static str, Value)>,
}

impl DecodedRecord {
    pub fn new(stream: StreamKey) -> Self {
        Self { stream, fields: Vec::new() }
    }

    pub fn with_capacity(stream: StreamKey, capacity: usize) -> Self {
        Self { stream, fields: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, name: &'static str, value: Value) {
        self.fields.push((name, value));
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}
