//! YAML utilities for embedded run headers
//!
//! Legacy files carry their run header as NUL-padded YAML text written by the
//! DAQ host. Some hosts leak control characters into free-text fields, so the
//! text is cleaned before parsing.

use crate::types::RunHeader;
use crate::{ConversionError, Result};

/// Remove control characters (except \n, \r, \t) that break YAML parsers.
pub fn clean_yaml(yaml: &str) -> String {
    yaml.chars()
        .filter(|ch| !matches!(ch, '\x00'..='\x08' | '\x0B'..='\x0C' | '\x0E'..='\x1F'))
        .collect()
}

/// Extract preamble text from its padded on-disk form.
///
/// The text ends at the first NUL byte or at the end of the block.
pub fn extract_preamble_text(data: &[u8], offset: u64) -> Result<String> {
    let text_len = data.iter().position(|&b| b == 0).unwrap_or(data.len());

    let text = std::str::from_utf8(&data[..text_len]).map_err(|e| {
        ConversionError::corrupt_stream(offset, format!("run header is not UTF-8: {}", e))
    })?;

    Ok(text.to_string())
}

/// Parse a run header from preamble text located at `offset`.
pub fn parse_run_header(text: &str, offset: u64) -> Result<RunHeader> {
    let cleaned = clean_yaml(text);
    if cleaned.trim().is_empty() {
        return Err(ConversionError::corrupt_stream(offset, "run header is empty"));
    }

    let header: RunHeader = serde_yaml_ng::from_str(&cleaned).map_err(|e| {
        ConversionError::corrupt_stream(offset, format!("run header is not valid YAML: {}", e))
    })?;
    header.validate(offset)?;
    Ok(header)
}

/// Serialize a run header into its padded on-disk form.
///
/// The result length is a multiple of 4 and always ends in at least one NUL.
pub fn encode_run_header(header: &RunHeader) -> Result<Vec<u8>> {
    let text = serde_yaml_ng::to_string(header)
        .map_err(|e| ConversionError::config("run header", e.to_string()))?;
    let mut bytes = text.into_bytes();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_removes_control_characters() {
        let input = "run_number: 7\n\x00\x01\x02start_time: 5\x03";
        let result = clean_yaml(input);
        assert!(!result.contains('\x00'));
        assert!(!result.contains('\x03'));
        assert!(result.contains("run_number"));
        assert!(result.contains("start_time"));
    }

    #[test]
    fn test_clean_keeps_valid_whitespace() {
        let result = clean_yaml("Key:\n\r\t  Value");
        assert!(result.contains('\n'));
        assert!(result.contains('\r'));
        assert!(result.contains('\t'));
    }

    #[test]
    fn test_extract_stops_at_nul() {
        let data = b"run_number: 3\n\0\0\0";
        assert_eq!(extract_preamble_text(data, 16).unwrap(), "run_number: 3\n");
    }

    #[test]
    fn test_extract_rejects_invalid_utf8() {
        let data = [b'a', 0xff, 0xfe, 0];
        let err = extract_preamble_text(&data, 16).unwrap_err();
        assert!(matches!(err, ConversionError::CorruptStream { offset: 16, .. }));
    }

    #[test]
    fn test_encode_pads_and_round_trips() -> anyhow::Result<()> {
        let header = RunHeader { run_number: 99, start_time: 12, ..Default::default() };
        let bytes = encode_run_header(&header)?;
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.last(), Some(&0));

        let text = extract_preamble_text(&bytes, 16)?;
        assert_eq!(parse_run_header(&text, 16)?, header);
        Ok(())
    }

    #[test]
    fn test_malformed_yaml_is_corrupt_stream() {
        let err = parse_run_header("run_number: [unterminated", 16).unwrap_err();
        assert!(matches!(err, ConversionError::CorruptStream { .. }));
        let err = parse_run_header("   \n", 16).unwrap_err();
        assert!(matches!(err, ConversionError::CorruptStream { .. }));
    }

    #[test]
    fn test_preamble_with_out_of_range_avg_mode() {
        let yaml = "run_number: 5
digitizer_channels:
  - fadc: 0
    channel: 1
    format_bits: 1
    sample_length: 64
    avg_mode: 40
    sample_freq_mhz: 250.0
";
        let err = parse_run_header(yaml, 16).unwrap_err();
        assert!(matches!(err, ConversionError::CorruptStream { offset: 16, .. }));
    }
}
