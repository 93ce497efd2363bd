//! Packet source implementations
//!
//! The input format is chosen by sniffing the first four bytes of a file, so
//! callers never pass a format flag. Sockets always carry the streaming format.

pub mod file;
pub mod stream;
pub mod tcp;

pub use file::LegacyFileSource;
pub use stream::StreamingSource;
pub use tcp::{ReconnectPolicy, TcpSource};

use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::legacy::LEGACY_MAGIC;
use crate::source::PacketSource;
use crate::streaming::STREAM_MAGIC;
use crate::types::SourceFormat;
use crate::{ConversionError, Result};

/// Where to read packets from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    File(PathBuf),
    /// `host:port` of a live DAQ server
    Tcp(String),
}

impl SourceSpec {
    /// Parse a command-line input; a `tcp://` prefix selects a socket.
    pub fn parse(input: &str) -> Self {
        match input.strip_prefix("tcp://") {
            Some(addr) => SourceSpec::Tcp(addr.to_string()),
            None => SourceSpec::File(PathBuf::from(input)),
        }
    }

    /// Short name used for per-input output directories
    pub fn stem(&self) -> String {
        match self {
            SourceSpec::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string()),
            SourceSpec::Tcp(addr) => addr.replace([':', '/', '.'], "_"),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::File(path) => write!(f, "{}", path.display()),
            SourceSpec::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Identify the format of a file from its magic bytes.
pub async fn sniff_format(path: &Path) -> Result<SourceFormat> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file
            .read(&mut magic[filled..])
            .await
            .map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    match magic {
        _ if filled < magic.len() => Err(ConversionError::corrupt_stream(
            0,
            format!("{} is too short to identify ({} bytes)", path.display(), filled),
        )),
        m if m == LEGACY_MAGIC => Ok(SourceFormat::Legacy),
        m if m == STREAM_MAGIC => Ok(SourceFormat::Streaming),
        m => Err(ConversionError::corrupt_stream(
            0,
            format!("{} has unrecognized magic {:02x?}", path.display(), m),
        )),
    }
}

/// Open a file of either format.
pub async fn open_file(path: &Path) -> Result<Box<dyn PacketSource>> {
    let format = sniff_format(path).await?;
    debug!("Detected {} format for {}", format, path.display());
    match format {
        SourceFormat::Legacy => {
            let path = path.to_path_buf();
            // Header and YAML parsing use blocking reads
            let source = tokio::task::spawn_blocking(move || LegacyFileSource::open(path))
                .await
                .map_err(|e| ConversionError::config("opening legacy file", e.to_string()))??;
            Ok(Box::new(source))
        }
        SourceFormat::Streaming => Ok(Box::new(StreamingSource::open_file(path).await?)),
    }
}

/// Open any source described by `spec`.
pub async fn open_source(spec: &SourceSpec, reconnect: ReconnectPolicy) -> Result<Box<dyn PacketSource>> {
    match spec {
        SourceSpec::File(path) => open_file(path).await,
        SourceSpec::Tcp(addr) => Ok(Box::new(TcpSource::connect(addr.clone(), reconnect).await?)),
    }
}
