//! Declarative per-source field mapping.
//!
//! Sources are read by header name, never by position. Each canonical field
//! lists the header aliases it may appear under; the first alias holding a
//! non-blank value wins. Headers compare case-insensitively after trimming, so
//! a renamed or reordered column only needs a mapping change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lead::LeadSource;

/// Source column carried into the CRM body under a readable label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraField {
    pub header: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub external_id: Vec<String>,
    pub name: Vec<String>,
    pub email: Vec<String>,
    pub phone: Vec<String>,
    pub unit: Vec<String>,
    pub notes: Vec<String>,
    pub received_at: Vec<String>,
    pub extras: Vec<ExtraField>,
    pub country_code: Option<String>,
    pub default_name: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            external_id: Vec::new(),
            name: Vec::new(),
            email: Vec::new(),
            phone: Vec::new(),
            unit: Vec::new(),
            notes: Vec::new(),
            received_at: Vec::new(),
            extras: Vec::new(),
            country_code: None,
            default_name: "Unknown".to_string(),
        }
    }
}

impl FieldMapping {
    /// Fields produced by the inbox form extractor.
    pub fn email_default() -> Self {
        Self {
            name: aliases(&["Name", "Nome"]),
            email: aliases(&["Email", "E-mail"]),
            phone: aliases(&["Phone", "Telefone", "Whatsapp"]),
            unit: aliases(&["Unit", "Unidade"]),
            notes: aliases(&["Notes"]),
            ..Self::default()
        }
    }

    /// Column names of the ad-platform lead export tab.
    pub fn meta_ads_default() -> Self {
        Self {
            external_id: aliases(&["id", "Lead ID"]),
            name: aliases(&["Full Name", "full_name", "Name"]),
            email: aliases(&["Email", "email"]),
            phone: aliases(&["Phone", "phone_number"]),
            unit: aliases(&["Question 1"]),
            notes: aliases(&["Notes"]),
            received_at: aliases(&["created_time", "Created Time"]),
            extras: vec![
                ExtraField {
                    header: "Question 1".to_string(),
                    label: "Question 1".to_string(),
                },
                ExtraField {
                    header: "Question 2".to_string(),
                    label: "Question 2".to_string(),
                },
            ],
            country_code: Some("55".to_string()),
            ..Self::default()
        }
    }
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTable {
    mappings: BTreeMap<LeadSource, FieldMapping>,
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MappingTable {
    pub fn builtin() -> Self {
        Self {
            mappings: BTreeMap::from([
                (LeadSource::Email, FieldMapping::email_default()),
                (LeadSource::MetaAds, FieldMapping::meta_ads_default()),
            ]),
        }
    }

    pub fn from_mappings(mappings: impl IntoIterator<Item = (LeadSource, FieldMapping)>) -> Self {
        Self {
            mappings: mappings.into_iter().collect(),
        }
    }

    pub fn get(&self, source: LeadSource) -> Option<&FieldMapping> {
        self.mappings.get(&source)
    }

    /// Replaces the mapping of every source named in a JSON object such as
    /// `{"meta_ads": {"phone": ["Mobile"]}}`. Unnamed sources keep theirs.
    pub fn with_overrides_json(mut self, raw: &str) -> Result<Self, ConfigError> {
        let overrides: BTreeMap<String, FieldMapping> = serde_json::from_str(raw)
            .map_err(|error| ConfigError::invalid("FIELD_MAPPINGS", error.to_string()))?;
        for (key, mapping) in overrides {
            let source = key
                .parse::<LeadSource>()
                .map_err(|message| ConfigError::invalid("FIELD_MAPPINGS", message))?;
            self.mappings.insert(source, mapping);
        }
        Ok(self)
    }
}

pub(crate) fn header_key(header: &str) -> String {
    header.trim().to_lowercase()
}

/// Case-insensitive view over one raw record.
pub struct FieldLookup<'a> {
    index: BTreeMap<String, &'a str>,
}

impl<'a> FieldLookup<'a> {
    pub fn new(fields: &'a BTreeMap<String, String>) -> Self {
        let mut index = BTreeMap::new();
        for (header, value) in fields {
            index.entry(header_key(header)).or_insert(value.as_str());
        }
        Self { index }
    }

    /// Trimmed non-blank value under `header`.
    pub fn get(&self, header: &str) -> Option<&'a str> {
        self.index
            .get(&header_key(header))
            .copied()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// First alias with a non-blank value, trimmed.
    pub fn first(&self, aliases: &[String]) -> Option<&'a str> {
        aliases.iter().find_map(|alias| self.get(alias))
    }
}
