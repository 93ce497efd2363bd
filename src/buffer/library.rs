//! Buffer library: routing of decoder streams to output tables
//!
//! ## Configuration Format
//!
//! ```yaml
//! DigitizerEvent:
//!   "digitizer_{key:03}":
//!     key_list: [[0, 15], 37]
//!     capacity: 4096
//! AdcEvent:
//!   adc_card_a:
//!     key_list: ["*"]
//! "*":
//!   "{name}":
//!     key_list: ["*"]
//! ```
//!
//! - `key_list` entries are a single key, an inclusive `[first, last]` range
//!   or `"*"` for every key not matched otherwise
//! - Output names may use `{key}`, `{key:0N}` (zero padded) and `{name}` (the
//!   decoder name); `out_name` overrides the entry name
//! - The `"*"` decoder entry applies to decoders without an entry of their own
//! - Keys of a configured decoder that match no entry are not written

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::types::StreamKey;
use crate::{ConversionError, Result};

/// Decoder name of the catch-all entry
pub const WILDCARD: &str = "*";

/// Raw buffer library as written in YAML: decoder name to output entries.
pub type BufferLibraryConfig = BTreeMap<String, BTreeMap<String, BufferSpec>>;

/// One output entry of the buffer library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub key_list: Vec<KeySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_name: Option<String>,
    /// Rows per buffer, overriding the global buffer size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// Entry of a key list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Key(u32),
    Range([u32; 2]),
    Wildcard(String),
}

/// Resolved destination of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Write to this table
    Table { table: String, capacity: Option<usize> },
    /// Covered by the library but matched by no entry; dropped
    Unrouted,
    /// Not covered by the library; use the decoder's default table
    Default,
}

#[derive(Debug, Clone)]
struct WildcardRule {
    template: String,
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct DecoderRules {
    exact: BTreeMap<u32, (String, Option<usize>)>,
    wildcard: Option<WildcardRule>,
}

/// Compiled buffer library with a per-stream routing cache.
#[derive(Debug, Clone, Default)]
pub struct BufferLibrary {
    rules: BTreeMap<String, DecoderRules>,
    cache: HashMap<StreamKey, Routing>,
}

impl BufferLibrary {
    /// Library that routes every stream to its default table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a library, expanding ranges and per-key templates.
    pub fn from_config(config: &BufferLibraryConfig) -> Result<Self> {
        let mut rules = BTreeMap::new();

        for (decoder, entries) in config {
            let mut decoder_rules = DecoderRules::default();

            for (entry_name, spec) in entries {
                if entry_name.is_empty() {
                    return Err(ConversionError::config("buffer library", format!("empty entry name under '{}'", decoder)));
                }
                if spec.capacity == Some(0) {
                    return Err(ConversionError::config(
                        "buffer library",
                        format!("entry '{}' of '{}' has zero capacity", entry_name, decoder),
                    ));
                }
                if spec.key_list.is_empty() {
                    return Err(ConversionError::config(
                        "buffer library",
                        format!("entry '{}' of '{}' has an empty key_list", entry_name, decoder),
                    ));
                }

                let template = spec.out_name.clone().unwrap_or_else(|| entry_name.clone());
                // Surface template errors at load time
                render_table_name(&template, 0, decoder)?;

                for key_spec in &spec.key_list {
                    let keys = match key_spec {
                        KeySpec::Key(key) => *key..=*key,
                        KeySpec::Range([first, last]) if first <= last => *first..=*last,
                        KeySpec::Range([first, last]) => {
                            return Err(ConversionError::config(
                                "buffer library",
                                format!("range [{}, {}] in '{}' is reversed", first, last, entry_name),
                            ));
                        }
                        KeySpec::Wildcard(w) if w == WILDCARD => {
                            if decoder_rules.wildcard.is_some() {
                                return Err(ConversionError::config(
                                    "buffer library",
                                    format!("decoder '{}' has more than one \"*\" key list", decoder),
                                ));
                            }
                            decoder_rules.wildcard =
                                Some(WildcardRule { template: template.clone(), capacity: spec.capacity });
                            continue;
                        }
                        KeySpec::Wildcard(other) => {
                            return Err(ConversionError::config(
                                "buffer library",
                                format!("key '{}' in '{}' is neither a number nor \"*\"", other, entry_name),
                            ));
                        }
                    };

                    for key in keys {
                        let table = render_table_name(&template, key, decoder)?;
                        if let Some((existing, _)) = decoder_rules.exact.insert(key, (table, spec.capacity)) {
                            return Err(ConversionError::config(
                                "buffer library",
                                format!("key {} of '{}' routed twice (already to '{}')", key, decoder, existing),
                            ));
                        }
                    }
                }
            }

            rules.insert(decoder.clone(), decoder_rules);
        }

        Ok(Self { rules, cache: HashMap::new() })
    }

    /// Parse and compile a YAML buffer library.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BufferLibraryConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| ConversionError::config("buffer library", e.to_string()))?;
        Self::from_config(&config)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve where records of `stream` go.
    pub fn resolve(&mut self, stream: &StreamKey) -> Routing {
        if let Some(routing) = self.cache.get(stream) {
            return routing.clone();
        }

        let routing = self.resolve_uncached(stream);
        debug!("Routing {} -> {:?}", stream, routing);
        self.cache.insert(*stream, routing.clone());
        routing
    }

    fn resolve_uncached(&self, stream: &StreamKey) -> Routing {
        let Some(rules) = self.rules.get(stream.decoder).or_else(|| self.rules.get(WILDCARD)) else {
            return Routing::Default;
        };

        if let Some((table, capacity)) = rules.exact.get(&stream.key) {
            return Routing::Table { table: table.clone(), capacity: *capacity };
        }

        match &rules.wildcard {
            // Templates were validated at load time
            Some(rule) => match render_table_name(&rule.template, stream.key, stream.decoder) {
                Ok(table) => Routing::Table { table, capacity: rule.capacity },
                Err(_) => Routing::Unrouted,
            },
            None => Routing::Unrouted,
        }
    }
}

/// Fill `{key}`, `{key:0N}` and `{name}` into an output name template.
pub fn render_table_name(template: &str, key: u32, decoder: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            ConversionError::config("buffer library", format!("unclosed '{{' in output name '{}'", template))
        })?;

        match &after[..end] {
            "key" => out.push_str(&key.to_string()),
            "name" => out.push_str(decoder),
            spec => match spec.strip_prefix("key:0").and_then(|w| w.parse::<usize>().ok()) {
                Some(width) => out.push_str(&format!("{:0width$}", key, width = width)),
                None => {
                    return Err(ConversionError::config(
                        "buffer library",
                        format!("unknown placeholder '{{{}}}' in output name '{}'", spec, template),
                    ));
                }
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    if out.is_empty() || out.contains(['/', '\\']) || out.starts_with('.') {
        return Err(ConversionError::config(
            "buffer library",
            format!("output name '{}' is not a valid table name", out),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const LIBRARY: &str = r#"
DigitizerEvent:
  "digitizer_{key:03}":
    key_list: [[16, 18], 37]
    capacity: 64
  spares:
    key_list: ["*"]
AdcEvent:
  adc_main:
    key_list: [65536]
"*":
  "{name}_all":
    key_list: ["*"]
"#;

    #[test]
    fn test_resolves_exact_range_and_wildcards() -> Result<()> {
        let mut library = BufferLibrary::from_yaml(LIBRARY)?;

        assert_eq!(
            library.resolve(&StreamKey::new("DigitizerEvent", 17)),
            Routing::Table { table: "digitizer_017".into(), capacity: Some(64) }
        );
        assert_eq!(
            library.resolve(&StreamKey::new("DigitizerEvent", 37)),
            Routing::Table { table: "digitizer_037".into(), capacity: Some(64) }
        );
        assert_eq!(
            library.resolve(&StreamKey::new("DigitizerEvent", 99)),
            Routing::Table { table: "spares".into(), capacity: None }
        );
        assert_eq!(
            library.resolve(&StreamKey::new("AdcEvent", 65536)),
            Routing::Table { table: "adc_main".into(), capacity: None }
        );
        assert_eq!(library.resolve(&StreamKey::new("AdcEvent", 65537)), Routing::Unrouted);
        assert_eq!(
            library.resolve(&StreamKey::new("RunControl", 0)),
            Routing::Table { table: "RunControl_all".into(), capacity: None }
        );
        Ok(())
    }

    #[test]
    fn test_empty_library_uses_defaults() {
        let mut library = BufferLibrary::new();
        assert!(library.is_empty());
        assert_eq!(library.resolve(&StreamKey::new("RunControl", 0)), Routing::Default);
    }

    #[test]
    fn test_duplicate_routing_rejected() {
        let yaml = r#"
RunControl:
  a:
    key_list: [[0, 4]]
  b:
    key_list: [4]
"#;
        assert!(matches!(BufferLibrary::from_yaml(yaml), Err(ConversionError::Config { .. })));
    }

    #[test]
    fn test_template_rendering() -> Result<()> {
        assert_eq!(render_table_name("ch{key:05}", 42, "X")?, "ch00042");
        assert_eq!(render_table_name("{name}-{key}", 7, "AdcEvent")?, "AdcEvent-7");
        assert!(render_table_name("bad{key", 1, "X").is_err());
        assert!(render_table_name("{channel}", 1, "X").is_err());
        assert!(render_table_name("../escape", 1, "X").is_err());
        Ok(())
    }

    #[test]
    fn test_bad_key_specs_rejected() {
        let reversed = "RunControl:\n  a:\n    key_list: [[5, 1]]\n";
        assert!(BufferLibrary::from_yaml(reversed).is_err());
        let word = "RunControl:\n  a:\n    key_list: [\"all\"]\n";
        assert!(BufferLibrary::from_yaml(word).is_err());
        let zero = "RunControl:\n  a:\n    key_list: [0]\n    capacity: 0\n";
        assert!(BufferLibrary::from_yaml(zero).is_err());
    }
}
