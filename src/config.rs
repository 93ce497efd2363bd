//! Conversion configuration
//!
//! Loaded from YAML; every field is optional. Command-line flags override the
//! file values.
//!
//! ```yaml
//! buffer_size: 4096
//! max_packets: 100000
//! mode: overwrite
//! keep_garbage: true
//! reconnect:
//!   attempts: 5
//!   delay_ms: 1000
//! buffers:
//!   DigitizerEvent:
//!     "digitizer_{key:03}":
//!       key_list: [[0, 15]]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::buffer::{BufferLibrary, BufferLibraryConfig, DEFAULT_BUFFER_SIZE};
use crate::sink::WriteMode;
use crate::sources::ReconnectPolicy;
use crate::{ConversionError, Result};

/// Settings of one conversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionConfig {
    /// Rows per raw buffer unless the buffer library says otherwise
    pub buffer_size: usize,
    /// Stop after this many packets from the start of the input
    pub max_packets: Option<u64>,
    /// Stop before reading a packet that starts at or past this byte offset
    pub max_bytes: Option<u64>,
    pub mode: WriteMode,
    /// Write undecodable packets to the garbage table
    pub keep_garbage: bool,
    /// Save a checkpoint next to the output when the run stops
    pub checkpoint: bool,
    pub reconnect: ReconnectPolicy,
    pub buffers: BufferLibraryConfig,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_packets: None,
            max_bytes: None,
            mode: WriteMode::default(),
            keep_garbage: false,
            checkpoint: true,
            reconnect: ReconnectPolicy::default(),
            buffers: BufferLibraryConfig::new(),
        }
    }
}

impl ConversionConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml_ng::from_str(yaml).map_err(|e| ConversionError::config("conversion config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ConversionError::config("conversion config", "buffer_size must be at least 1"));
        }
        self.buffer_library()?;
        Ok(())
    }

    /// Compile the routing rules.
    pub fn buffer_library(&self) -> Result<BufferLibrary> {
        BufferLibrary::from_config(&self.buffers)
    }
}
