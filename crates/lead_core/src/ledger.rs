//! Ledger tab codec and the per-run snapshot derived from it.
//!
//! The ledger is the only durable state: dedup identities, team counts and
//! the CRM retry queue are all re-derived from its rows at the start of each
//! run. Columns are addressed by header name, case-insensitively.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::distribution::{DistributionState, TeamConfig};
use crate::error::LedgerDecodeError;
use crate::lead::{normalize_email, phone_digits, Lead, LeadSource, LeadStatus};
use crate::mapping::FieldLookup;
use crate::normalizer::parse_timestamp;

/// One spreadsheet row keyed by header name.
pub type Row = BTreeMap<String, String>;

pub mod columns {
    pub const IDENTITY: &str = "Identity";
    pub const RECEIVED_AT: &str = "Received At";
    pub const SOURCE: &str = "Source";
    pub const EXTERNAL_ID: &str = "External Id";
    pub const NAME: &str = "Name";
    pub const EMAIL: &str = "Email";
    pub const PHONE: &str = "Phone";
    pub const UNIT: &str = "Unit";
    pub const NOTES: &str = "Notes";
    pub const TEAM: &str = "Team";
    pub const STATUS: &str = "Status";
    pub const UPDATED_AT: &str = "Updated At";
    pub const CRM_REFERENCE: &str = "CRM Reference";
    pub const LAST_ERROR: &str = "Last Error";
    pub const SYNC_ATTEMPTS: &str = "Sync Attempts";
    pub const RAW_FIELDS: &str = "Raw Fields";
}

/// Header row written when a ledger tab is created.
pub const LEDGER_HEADERS: [&str; 16] = [
    columns::IDENTITY,
    columns::RECEIVED_AT,
    columns::SOURCE,
    columns::EXTERNAL_ID,
    columns::NAME,
    columns::EMAIL,
    columns::PHONE,
    columns::UNIT,
    columns::NOTES,
    columns::TEAM,
    columns::STATUS,
    columns::UPDATED_AT,
    columns::CRM_REFERENCE,
    columns::LAST_ERROR,
    columns::SYNC_ATTEMPTS,
    columns::RAW_FIELDS,
];

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Full row for a freshly distributed lead.
pub fn encode_row(lead: &Lead, now: DateTime<Utc>) -> Row {
    let raw_fields = serde_json::to_string(lead.raw_fields()).unwrap_or_else(|_| "{}".to_string());
    Row::from([
        (columns::IDENTITY.to_string(), lead.identity().key()),
        (columns::RECEIVED_AT.to_string(), timestamp(lead.received_at())),
        (columns::SOURCE.to_string(), lead.source().as_str().to_string()),
        (
            columns::EXTERNAL_ID.to_string(),
            lead.external_id().unwrap_or_default().to_string(),
        ),
        (columns::NAME.to_string(), lead.name().to_string()),
        (columns::EMAIL.to_string(), lead.email().to_string()),
        (columns::PHONE.to_string(), lead.phone().to_string()),
        (columns::UNIT.to_string(), lead.unit().unwrap_or_default().to_string()),
        (columns::NOTES.to_string(), lead.notes().unwrap_or_default().to_string()),
        (columns::TEAM.to_string(), lead.team().unwrap_or_default().to_string()),
        (columns::STATUS.to_string(), lead.status().as_str().to_string()),
        (columns::UPDATED_AT.to_string(), timestamp(now)),
        (columns::CRM_REFERENCE.to_string(), String::new()),
        (columns::LAST_ERROR.to_string(), String::new()),
        (columns::SYNC_ATTEMPTS.to_string(), "0".to_string()),
        (columns::RAW_FIELDS.to_string(), raw_fields),
    ])
}

/// A ledger row read back, together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Value of the `Identity` column; rows are updated by this key.
    pub identity_key: String,
    pub lead: Lead,
    pub crm_reference: Option<String>,
    pub last_error: Option<String>,
    pub sync_attempts: u32,
}

impl LedgerEntry {
    pub fn from_new_lead(lead: Lead) -> Self {
        Self {
            identity_key: lead.identity().key(),
            lead,
            crm_reference: None,
            last_error: None,
            sync_attempts: 0,
        }
    }

    /// Cells to rewrite after a CRM attempt.
    pub fn sync_update(&self, now: DateTime<Utc>) -> Row {
        Row::from([
            (columns::STATUS.to_string(), self.lead.status().as_str().to_string()),
            (columns::UPDATED_AT.to_string(), timestamp(now)),
            (
                columns::CRM_REFERENCE.to_string(),
                self.crm_reference.clone().unwrap_or_default(),
            ),
            (
                columns::LAST_ERROR.to_string(),
                self.last_error.clone().unwrap_or_default(),
            ),
            (columns::SYNC_ATTEMPTS.to_string(), self.sync_attempts.to_string()),
        ])
    }
}

pub fn decode_row(row: &Row) -> Result<LedgerEntry, LedgerDecodeError> {
    let lookup = FieldLookup::new(row);

    let source = required(&lookup, columns::SOURCE)?;
    let source = source
        .parse::<LeadSource>()
        .map_err(|_| invalid(columns::SOURCE, source))?;
    let status = required(&lookup, columns::STATUS)?;
    let status = status
        .parse::<LeadStatus>()
        .map_err(|_| invalid(columns::STATUS, status))?;
    let received_raw = required(&lookup, columns::RECEIVED_AT)?;
    let received_at =
        parse_timestamp(received_raw).ok_or_else(|| invalid(columns::RECEIVED_AT, received_raw))?;

    let team = lookup.get(columns::TEAM).map(str::to_string);
    if team.is_none() && status != LeadStatus::New {
        return Err(LedgerDecodeError::MissingColumn(columns::TEAM));
    }

    let raw_fields = match lookup.get(columns::RAW_FIELDS) {
        Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(raw)
            .map_err(|_| invalid(columns::RAW_FIELDS, raw))?,
        None => BTreeMap::new(),
    };
    let sync_attempts = match lookup.get(columns::SYNC_ATTEMPTS) {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| invalid(columns::SYNC_ATTEMPTS, raw))?,
        None => 0,
    };

    let phone = lookup.get(columns::PHONE).unwrap_or_default().to_string();
    let lead = Lead {
        external_id: lookup.get(columns::EXTERNAL_ID).map(str::to_string),
        name: lookup.get(columns::NAME).unwrap_or_default().to_string(),
        email: lookup.get(columns::EMAIL).map(normalize_email).unwrap_or_default(),
        phone_digits: phone_digits(&phone),
        phone,
        unit: lookup.get(columns::UNIT).map(str::to_string),
        notes: lookup.get(columns::NOTES).map(str::to_string),
        source,
        received_at,
        raw_fields,
        team,
        status,
    };

    let identity_key = lookup
        .get(columns::IDENTITY)
        .map(str::to_string)
        .unwrap_or_else(|| lead.identity().key());

    Ok(LedgerEntry {
        identity_key,
        lead,
        crm_reference: lookup.get(columns::CRM_REFERENCE).map(str::to_string),
        last_error: lookup.get(columns::LAST_ERROR).map(str::to_string),
        sync_attempts,
    })
}

fn required<'a>(
    lookup: &FieldLookup<'a>,
    column: &'static str,
) -> Result<&'a str, LedgerDecodeError> {
    lookup
        .get(column)
        .ok_or(LedgerDecodeError::MissingColumn(column))
}

fn invalid(column: &'static str, value: &str) -> LedgerDecodeError {
    LedgerDecodeError::InvalidValue {
        column,
        value: value.to_string(),
    }
}

/// Everything a run needs from the ledger, read once before DEDUPE.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    identities: HashSet<String>,
    team_labels: Vec<String>,
    entries: Vec<LedgerEntry>,
    undecodable: usize,
}

impl LedgerSnapshot {
    /// Rows that fail to decode still contribute their `Identity` and `Team`
    /// cells; they are just never retried.
    pub fn from_rows(rows: &[Row]) -> Self {
        let mut snapshot = Self::default();
        for (index, row) in rows.iter().enumerate() {
            let lookup = FieldLookup::new(row);
            if let Some(team) = lookup.get(columns::TEAM) {
                snapshot.team_labels.push(team.to_string());
            }
            match decode_row(row) {
                Ok(entry) => {
                    snapshot.identities.insert(entry.identity_key.clone());
                    snapshot.entries.push(entry);
                }
                Err(error) => {
                    if let Some(identity) = lookup.get(columns::IDENTITY) {
                        snapshot.identities.insert(identity.to_string());
                    }
                    snapshot.undecodable += 1;
                    tracing::warn!(
                        event = "ledger_row_undecodable",
                        row = index + 2,
                        error = %error,
                        "skipping unreadable ledger row"
                    );
                }
            }
        }
        snapshot
    }

    pub fn identities(&self) -> &HashSet<String> {
        &self.identities
    }

    pub fn distribution_state(&self, config: &TeamConfig) -> DistributionState {
        DistributionState::from_team_labels(config, self.team_labels.iter().map(String::as_str))
    }

    /// Rows still owed a CRM submission, in ledger order.
    pub fn pending_sync(&self) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.lead.status().awaits_sync() && entry.lead.team().is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.undecodable
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn undecodable(&self) -> usize {
        self.undecodable
    }
}
