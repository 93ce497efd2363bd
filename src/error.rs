//! Error types for packet decoding and conversion.
//!
//! Errors fall into two layers:
//!
//! - [`DecodeError`] describes why a single packet could not be turned into
//!   records. Every variant is recoverable: the packet is skipped, counted and
//!   optionally preserved in the garbage table.
//! - [`ConversionError`] is the crate-wide error. Most variants abort the run
//!   (after the final drain); [`ConversionError::SchemaMismatch`] only disables
//!   the affected output table.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: I/O failures on the input stream or output storage
//! - **Corrupt Streams**: Malformed preambles or out-of-bounds packet lengths
//! - **Version Errors**: Unknown file, handshake or packet layouts
//! - **Schema Mismatches**: Records disagreeing with an established table schema
//! - **Configuration Errors**: Invalid routing, checkpoint or output-mode setup
//!
//! ## Recovery
//!
//! ```rust
//! use daq2arrow::ConversionError;
//!
//! let error = ConversionError::corrupt_stream(128, "declared body length exceeds file");
//! assert!(error.is_fatal_for_run());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::cursor::CursorError;
use crate::types::PacketKey;

/// Result type alias for conversion operations.
pub type Result<T, E = ConversionError> = std::result::Result<T, E>;

/// Main error type for conversion operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConversionError {
    #[error("I/O failure during {context}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Input file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt stream at byte {offset}: {details}")]
    CorruptStream { offset: u64, details: String },

    #[error("Unsupported {what} version: expected {expected}, found {found}")]
    Version { what: &'static str, expected: u16, found: u16 },

    #[error("Schema mismatch on table '{table}': {details}")]
    SchemaMismatch { table: String, details: String },

    #[error("Packet {packet_id} could not be decoded")]
    Decode {
        packet_id: u64,
        #[source]
        source: DecodeError,
    },

    #[error("Output sink failed for table '{table}'")]
    Sink {
        table: String,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error("Checkpoint error: {path}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConversionError {
    /// Returns whether the run can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConversionError::Decode { .. })
    }

    /// Returns whether this error aborts the whole run.
    ///
    /// Schema mismatches only take their own table out of service.
    pub fn is_fatal_for_run(&self) -> bool {
        match self {
            ConversionError::Transport { .. } => true,
            ConversionError::File { .. } => true,
            ConversionError::CorruptStream { .. } => true,
            ConversionError::Version { .. } => true,
            ConversionError::Sink { .. } => true,
            ConversionError::Config { .. } => true,
            ConversionError::Checkpoint { .. } => true,
            ConversionError::SchemaMismatch { .. } => false,
            ConversionError::Decode { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ConversionError::Transport { .. } => vec![
                "Check the DAQ host is reachable and still streaming",
                "Verify free space on the output volume",
                "Retry with --reconnect for live sources",
            ],
            ConversionError::File { .. } => vec![
                "Check the file exists and is readable",
                "Check file permissions",
            ],
            ConversionError::CorruptStream { .. } => vec![
                "Convert the valid prefix with --max-bytes",
                "Skim the file to inspect the packets before the failure",
                "Re-copy the raw file from the DAQ machine",
            ],
            ConversionError::Version { .. } => vec![
                "Check the DAQ firmware and software versions",
                "Update daq2arrow to a release supporting this layout",
            ],
            ConversionError::SchemaMismatch { .. } => vec![
                "Check the run header matches the hardware configuration",
                "Route channels with differing settings to separate tables",
            ],
            ConversionError::Decode { .. } => vec![
                "Enable keep_garbage to preserve undecodable packets",
                "Inspect the packet with the skim command",
            ],
            ConversionError::Sink { .. } => vec![
                "Verify free space on the output volume",
                "Check the output directory is writable",
            ],
            ConversionError::Config { .. } => vec![
                "Review the buffer library configuration",
                "Use --overwrite or --resume when the output exists",
            ],
            ConversionError::Checkpoint { .. } => vec![
                "Remove the checkpoint and convert with --overwrite",
            ],
        }
    }

    /// Helper constructor for I/O failures on the input or output.
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        ConversionError::Transport { context: context.into(), source }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        ConversionError::File { path, source }
    }

    /// Helper constructor for corrupt stream errors.
    pub fn corrupt_stream(offset: u64, details: impl Into<String>) -> Self {
        ConversionError::CorruptStream { offset, details: details.into() }
    }

    /// Helper constructor for schema mismatches.
    pub fn schema_mismatch(table: impl Into<String>, details: impl Into<String>) -> Self {
        ConversionError::SchemaMismatch { table: table.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(context: impl Into<String>, details: impl Into<String>) -> Self {
        ConversionError::Config { context: context.into(), details: details.into() }
    }

    /// Helper constructor for output sink errors.
    pub fn sink(table: impl Into<String>, source: arrow::error::ArrowError) -> Self {
        ConversionError::Sink { table: table.into(), source }
    }
}

impl From<std::io::Error> for ConversionError {
    fn from(err: std::io::Error) -> Self {
        ConversionError::Transport { context: "unspecified I/O".to_string(), source: err }
    }
}

/// Reason a single packet could not be decoded.
///
/// The run always continues past these.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("No decoder registered for packet type {key}")]
    UnknownPacketType { key: PacketKey },

    #[error("Packet truncated: needed {needed} bytes at position {position}, {available} available")]
    Truncated { needed: usize, available: usize, position: usize },

    #[error("Unsupported {what} header version {found}")]
    UnsupportedVersion { what: &'static str, found: u8 },

    #[error("Unsupported packet content: {details}")]
    Unsupported { details: String },

    #[error("Malformed packet: {details}")]
    Malformed { details: String },

    #[error("Missing configuration: {details}")]
    MissingConfiguration { details: String },
}

impl DecodeError {
    /// Stable code written to the garbage table.
    pub fn code(&self) -> u8 {
        match self {
            DecodeError::UnknownPacketType { .. } => 1,
            DecodeError::Truncated { .. } => 2,
            DecodeError::UnsupportedVersion { .. } => 3,
            DecodeError::Unsupported { .. } => 4,
            DecodeError::Malformed { .. } => 5,
            DecodeError::MissingConfiguration { .. } => 6,
        }
    }

    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        DecodeError::Malformed { details: details.into() }
    }

    pub(crate) fn missing_configuration(details: impl Into<String>) -> Self {
        DecodeError::MissingConfiguration { details: details.into() }
    }
}

impl From<CursorError> for DecodeError {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::OutOfBounds { requested, remaining, position } => {
                DecodeError::Truncated { needed: requested, available: remaining, position }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            details in ".*",
            table in "\\w+",
            offset in any::<u64>(),
            expected in 1u16..10u16,
            found in 1u16..10u16
          ) {
            let corrupt = ConversionError::corrupt_stream(offset, details.clone());
            let mismatch = ConversionError::schema_mismatch(table.clone(), details.clone());
            let version = ConversionError::Version { what: "file", expected, found };

            prop_assert!(corrupt.to_string().contains(&offset.to_string()));
            prop_assert!(corrupt.to_string().contains(&details));
            prop_assert!(mismatch.to_string().contains(&table));

            let version_msg = version.to_string();
            prop_assert!(version_msg.contains(&expected.to_string()));
            prop_assert!(version_msg.contains(&found.to_string()));
          }

          #[test]
          fn cursor_errors_become_truncation(
            requested in 1usize..4096,
            remaining in 0usize..4096,
            position in 0usize..4096
          ) {
            let err: DecodeError = CursorError::OutOfBounds { requested, remaining, position }.into();
            prop_assert_eq!(
                err,
                DecodeError::Truncated { needed: requested, available: remaining, position }
            );
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<ConversionError>();
        assert_send_sync_static::<DecodeError>();
    }

    #[test]
    fn recoverability_classification() {
        let decode = ConversionError::Decode {
            packet_id: 3,
            source: DecodeError::malformed("bad nibble"),
        };
        let mismatch = ConversionError::schema_mismatch("digitizer_001", "waveform length");
        let corrupt = ConversionError::corrupt_stream(0, "bad magic");
        let io = ConversionError::transport(
            "reading packet",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        );

        assert!(decode.is_recoverable());
        assert!(!decode.is_fatal_for_run());
        assert!(!mismatch.is_recoverable());
        assert!(!mismatch.is_fatal_for_run());
        assert!(corrupt.is_fatal_for_run());
        assert!(io.is_fatal_for_run());

        for err in [&decode, &mismatch, &corrupt, &io] {
            let suggestions = err.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn garbage_codes_are_distinct() {
        let errors = [
            DecodeError::UnknownPacketType { key: PacketKey(9) },
            DecodeError::Truncated { needed: 4, available: 0, position: 8 },
            DecodeError::UnsupportedVersion { what: "packet", found: 7 },
            DecodeError::Unsupported { details: "maw test".into() },
            DecodeError::malformed("x"),
            DecodeError::missing_configuration("y"),
        ];
        let mut codes: Vec<u8> = errors.iter().map(DecodeError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn from_io_error_is_transport() {
        let err: ConversionError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        match err {
            ConversionError::Transport { source, .. } => {
                assert_eq!(source.to_string(), "pipe closed");
            }
            other => panic!("Expected Transport error, got {:?}", other),
        }
    }
}
