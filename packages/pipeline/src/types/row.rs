//! Input rows and extracted records.
//!
//! Both sides of the extraction contract are order-preserving maps of
//! string fields: the pipeline moves them around without interpreting
//! them. Validation and typing of identifiers belongs to input adapters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One target identifier supplied by an input adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRow {
    /// Opaque target identifier (e.g. a profile URL)
    pub id: String,

    /// Adapter-supplied columns for this row
    #[serde(default)]
    pub fields: IndexMap<String, String>,
}

impl TargetRow {
    /// Create a row with just an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: IndexMap::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// One record produced by the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier of the target row this record was extracted from
    pub target_id: String,

    /// Extracted columns, in extraction order
    #[serde(default)]
    pub fields: IndexMap<String, String>,
}

impl Record {
    /// Create a record for a target.
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            fields: IndexMap::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}
