//! Streaming conversion of raw DAQ packets into Arrow tables.
//!
//! daq2arrow reads the binary output of digitizer DAQ systems, decodes every
//! packet into typed records and writes them as chunked, self-describing
//! Arrow IPC tables, one table per output stream.
//!
//! # Features
//!
//! - **Two input formats**: legacy record files and the framed streaming
//!   protocol, from files or live sockets, detected from their magic bytes
//! - **Bounded memory**: records are buffered column-wise and flushed in
//!   fixed-size batches
//! - **Resilience**: unknown or malformed packets are counted and skipped
//! - **Resume**: an interrupted conversion continues from its checkpoint and
//!   produces the same bytes as an uninterrupted one
//!
//! # Architecture
//!
//! ```text
//! PacketSource ──► DecoderRegistry ──► BufferManager ──► OutputSink
//!  (sources/)        (decoders/)         (buffer/)         (sink/)
//! ```
//!
//! [`pipeline::Converter`] drives the loop for one input.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daq2arrow::{ConversionConfig, Daq2Arrow};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> daq2arrow::Result<()> {
//!     let config = ConversionConfig { buffer_size: 4096, ..Default::default() };
//!     let summary = Daq2Arrow::convert("run_0042.dqr", "out/run_0042", &config, &CancellationToken::new()).await?;
//!     println!("{} rows in {} tables", summary.total_rows(), summary.tables.len());
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod cursor;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;
mod yaml_utils;

// Input formats and sources
pub mod legacy;
pub mod source;
pub mod sources;
pub mod streaming;

// Decoding, buffering and output
pub mod buffer;
pub mod decoders;
pub mod sink;

// Orchestration
pub mod checkpoint;
pub mod config;
pub mod pipeline;
pub mod skim;

// Core exports
pub use error::*;
pub use types::*;

pub use buffer::{BufferLibrary, BufferManager, RawBuffer, TableChunk};
pub use checkpoint::Checkpoint;
pub use config::ConversionConfig;
pub use decoders::{Decoder, DecoderRegistry};
pub use pipeline::{Converter, Progress, RunCounters, RunSummary, StopReason, run_conversion};
pub use sink::{ArrowSink, MemorySink, OutputSink, WriteMode};
pub use source::PacketSource;
pub use sources::{ReconnectPolicy, SourceSpec};

/// Entry point for opening inputs and converting them.
///
/// # Examples
///
/// ## Reading packets from a file
/// ```rust,no_run
/// use daq2arrow::Daq2Arrow;
///
/// #[tokio::main]
/// async fn main() -> daq2arrow::Result<()> {
///     let mut source = Daq2Arrow::open("run_0042.dqr").await?;
///     while let Some(packet) = source.next_packet().await? {
///         println!("packet {} type {}", packet.index, packet.key());
///     }
///     Ok(())
/// }
/// ```
pub struct Daq2Arrow;

impl Daq2Arrow {
    /// Open a recorded input of either format.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist or is not readable
    /// - Its magic bytes match neither format
    /// - The file header, run header or handshake is corrupt
    pub async fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Box<dyn PacketSource>> {
        sources::open_file(path.as_ref()).await
    }

    /// Connect to a live DAQ server streaming on `addr` (`host:port`).
    pub async fn connect(addr: impl Into<String>, reconnect: ReconnectPolicy) -> Result<sources::TcpSource> {
        sources::TcpSource::connect(addr, reconnect).await
    }

    /// Convert `input` (a path, or `tcp://host:port`) into tables under `out_dir`.
    pub async fn convert<P: AsRef<std::path::Path>>(
        input: &str,
        out_dir: P,
        config: &ConversionConfig,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<RunSummary> {
        run_conversion(&SourceSpec::parse(input), out_dir.as_ref(), config, cancel).await
    }
}
