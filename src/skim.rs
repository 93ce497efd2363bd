//! Packet skimming
//!
//! Copies the file header, run header and first packets of a legacy file
//! byte for byte into a smaller file of the same format.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::legacy::{LegacyReader, LegacyWriter};
use crate::streaming::STREAM_MAGIC;
use crate::{ConversionError, Result};

/// What a skim copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkimSummary {
    pub packets: u64,
    /// Size of the skimmed file
    pub bytes: u64,
    /// Whether the input had no more packets than requested
    pub reached_end: bool,
}

/// Copy the first `packets` packets of the legacy file `input` to `output`.
pub fn skim(input: &Path, output: &Path, packets: u64) -> Result<SkimSummary> {
    if same_file(input, output) {
        return Err(ConversionError::config("skim", "output would overwrite the input"));
    }
    if is_streaming_file(input)? {
        return Err(ConversionError::config(
            "skim",
            format!("{} is a streaming recording; only legacy files can be skimmed", input.display()),
        ));
    }

    let mut reader = LegacyReader::open(input)?;
    let file = File::create(output).map_err(|e| ConversionError::file_error(output.to_path_buf(), e))?;
    let summary = skim_reader(&mut reader, BufWriter::new(file), packets)?.0;

    info!(
        "Skimmed {} packets ({} bytes) from {} into {}",
        summary.packets,
        summary.bytes,
        input.display(),
        output.display()
    );
    Ok(summary)
}

/// Whether `output` names the same file as `input`, which must exist.
fn same_file(input: &Path, output: &Path) -> bool {
    let Ok(input) = input.canonicalize() else {
        return false;
    };
    resolve(output).is_some_and(|output| output == input)
}

/// Canonical form of a path whose final component may not exist yet.
fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(path) = path.canonicalize() {
        return Some(path);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    parent.canonicalize().ok().map(|parent| parent.join(name))
}

/// Copy up to `packets` packets from `reader` into `writer`.
pub fn skim_reader<R: Read + Seek, W: Write>(
    reader: &mut LegacyReader<R>,
    writer: W,
    packets: u64,
) -> Result<(SkimSummary, W)> {
    let mut writer = LegacyWriter::with_preamble(writer, reader.file_header(), reader.raw_preamble())?;

    let mut reached_end = false;
    while writer.packets_written() < packets {
        match reader.read_next_packet()? {
            Some(packet) => writer.write_raw_packet(&packet)?,
            None => {
                reached_end = true;
                break;
            }
        }
    }
    if !reached_end && reader.offset() == reader.file_len() {
        reached_end = true;
    }

    let summary = SkimSummary { packets: writer.packets_written(), bytes: reader.offset(), reached_end };
    Ok((summary, writer.finish()?))
}

fn is_streaming_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| ConversionError::file_error(path.to_path_buf(), e))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == STREAM_MAGIC),
        // Too short for either format; the legacy reader reports it
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(ConversionError::file_error(path.to_path_buf(), e)),
    }
}
