use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NormalizationError;
use crate::lead::{normalize_email, phone_digits, strip_country_code, Lead, LeadSource, LeadStatus};
use crate::mapping::{FieldLookup, FieldMapping, MappingTable};

/// Field mapping as yielded by a source adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLeadRecord {
    pub source: LeadSource,
    pub fields: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl RawLeadRecord {
    pub fn new(
        source: LeadSource,
        fields: BTreeMap<String, String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            fields,
            received_at,
        }
    }
}

/// Maps raw records to leads using the mapping table of their source.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    table: &'a MappingTable,
}

impl<'a> Normalizer<'a> {
    pub fn new(table: &'a MappingTable) -> Self {
        Self { table }
    }

    pub fn normalize(&self, record: &RawLeadRecord) -> Result<Lead, NormalizationError> {
        let mapping = self
            .table
            .get(record.source)
            .ok_or(NormalizationError::UnmappedSource(record.source))?;
        normalize_record(record, mapping)
    }
}

pub fn normalize_record(
    record: &RawLeadRecord,
    mapping: &FieldMapping,
) -> Result<Lead, NormalizationError> {
    let lookup = FieldLookup::new(&record.fields);

    let email = lookup.first(&mapping.email).map(normalize_email).unwrap_or_default();
    let received_phone = lookup.first(&mapping.phone).unwrap_or_default();
    // Identity keys on every digit so the same number matches across sources.
    let digits = phone_digits(received_phone);
    let phone = match mapping.country_code.as_deref() {
        Some(country_code) if !digits.is_empty() => strip_country_code(&digits, country_code),
        _ => received_phone.to_string(),
    };

    if email.is_empty() && digits.is_empty() {
        return Err(NormalizationError::NoContactChannel {
            origin: record.source,
        });
    }

    let received_at = lookup
        .first(&mapping.received_at)
        .and_then(parse_timestamp)
        .unwrap_or(record.received_at);

    Ok(Lead {
        external_id: lookup.first(&mapping.external_id).map(str::to_string),
        name: lookup
            .first(&mapping.name)
            .unwrap_or(mapping.default_name.as_str())
            .to_string(),
        email,
        phone,
        phone_digits: digits,
        unit: lookup.first(&mapping.unit).map(str::to_string),
        notes: lookup.first(&mapping.notes).map(str::to_string),
        source: record.source,
        received_at,
        raw_fields: record.fields.clone(),
        team: None,
        status: LeadStatus::New,
    })
}

/// Accepts RFC 3339, the ad platform's `+0000` offset form and the
/// spreadsheet's `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }
    if let Ok(value) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(value.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|value| value.and_utc())
}
