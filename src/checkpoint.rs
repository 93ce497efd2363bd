//! Conversion checkpoints
//!
//! A checkpoint records how far a run got so a later run over the same input
//! can pick up at the next unread packet. It is written next to the output
//! tables once the run has drained its buffers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::pipeline::RunCounters;
use crate::types::SourceFormat;
use crate::{ConversionError, Result};

/// File name of the checkpoint inside the output directory
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Serializable progress of one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Input as given on the command line
    pub input: String,
    pub format: SourceFormat,
    /// Byte offset of the next unread packet
    pub offset: u64,
    pub packets_read: u64,
    pub tables: BTreeMap<String, TableCheckpoint>,
    /// Tables taken out of service by a schema mismatch
    #[serde(default)]
    pub failed_tables: Vec<String>,
    /// Whether the input was read to its end
    pub complete: bool,
    #[serde(default)]
    pub counters: RunCounters,
}

/// Rows on disk for one table and the buffer capacity that wrote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub rows: u64,
    pub capacity: usize,
}

impl Checkpoint {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Load the checkpoint in `dir`, if there is one.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConversionError::file_error(path, e)),
        };
        let checkpoint = serde_json::from_str(&json).map_err(|source| ConversionError::Checkpoint { path, source })?;
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint to `dir`, replacing any earlier one.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let json = serde_json::to_string_pretty(self)
            .map_err(|source| ConversionError::Checkpoint { path: path.clone(), source })?;

        // Rename over the old file so a crash never leaves half a checkpoint
        let partial = path.with_extension("json.partial");
        std::fs::write(&partial, json).map_err(|e| ConversionError::file_error(partial.clone(), e))?;
        std::fs::rename(&partial, &path).map_err(|e| ConversionError::file_error(path, e))?;
        Ok(())
    }

    /// Remove the checkpoint in `dir` if present.
    pub fn remove(dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConversionError::file_error(path, e)),
        }
    }

    /// Buffer capacity of every table
    pub fn capacities(&self) -> BTreeMap<String, usize> {
        self.tables.iter().map(|(name, t)| (name.clone(), t.capacity)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            input: "run_0042.dqr".to_string(),
            format: SourceFormat::Legacy,
            offset: 4096,
            packets_read: 17,
            tables: BTreeMap::from([("run_control".to_string(), TableCheckpoint { rows: 17, capacity: 8 })]),
            failed_tables: vec![],
            complete: false,
            counters: RunCounters { unrecognized: 2, ..Default::default() },
        }
    }

    #[test]
    fn test_checkpoint_save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(Checkpoint::load(dir.path())?.is_none());

        checkpoint().save(dir.path())?;
        let loaded = Checkpoint::load(dir.path())?.context("checkpoint was saved")?;
        assert_eq!(loaded, checkpoint());
        assert_eq!(loaded.capacities().get("run_control"), Some(&8));
        assert!(!dir.path().join("checkpoint.json.partial").exists());

        Checkpoint::remove(dir.path())?;
        Checkpoint::remove(dir.path())?;
        assert!(Checkpoint::load(dir.path())?.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(CHECKPOINT_FILE), "{ not json")?;
        let err = Checkpoint::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConversionError::Checkpoint { .. }));
        Ok(())
    }
}
