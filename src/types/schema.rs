//! Output table schema types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::{ColumnType, DecodedRecord};
use crate::{ConversionError, Result};

/// Schema of one output table: ordered fields with types and attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSpec>,
}

impl TableSchema {
    /// Create a new TableSchema with validation.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    /// Schema established lazily by the first record of a table.
    pub fn from_record(record: &DecodedRecord) -> Self {
        let fields = record
            .fields
            .iter()
            .map(|(name, value)| FieldSpec::new(*name, value.column_type()))
            .collect();
        Self { fields }
    }

    /// Validate the schema for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(ConversionError::config("Schema validation", "schema has no fields"));
        }

        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(ConversionError::config("Schema validation", "empty field name"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ConversionError::config(
                    "Schema validation",
                    format!("duplicate field '{}'", field.name),
                ));
            }
        }

        Ok(())
    }

    /// Describe how `record` disagrees with this schema, if it does.
    pub fn mismatch(&self, record: &DecodedRecord) -> Option<String> {
        if record.fields.len() != self.fields.len() {
            return Some(format!(
                "record has {} fields, table has {}",
                record.fields.len(),
                self.fields.len()
            ));
        }

        for (spec, (name, value)) in self.fields.iter().zip(&record.fields) {
            if spec.name != *name {
                return Some(format!("expected field '{}', found '{}'", spec.name, name));
            }
            let found = value.column_type();
            if spec.column_type != found {
                return Some(format!(
                    "field '{}' is {} in the table but {} in the record",
                    spec.name, spec.column_type, found
                ));
            }
        }

        None
    }

    /// Get a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub column_type: ColumnType,
    /// Free-form attributes such as units or sampling period
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, attrs: BTreeMap::new() }
    }

    /// Attach an attribute, builder style.
    pub fn with_attr(mut self, key: &str, value: impl ToString) -> Self {
        self.attrs.insert(key.to_string(), value.to_string());
        self
    }
}
