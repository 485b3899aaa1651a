use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LeadStateError;

/// Origin tag of a lead. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    Email,
    MetaAds,
}

impl LeadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::MetaAds => "meta_ads",
        }
    }
}

impl fmt::Display for LeadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadSource {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" | "email_import" => Ok(Self::Email),
            "meta_ads" | "meta-ads" | "ads_import" => Ok(Self::MetaAds),
            other => Err(format!("unknown lead source '{other}'")),
        }
    }
}

/// Processing status. Only moves forward; see [`LeadStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Distributed,
    SentToCrm,
    Failed,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Distributed => "DISTRIBUTED",
            Self::SentToCrm => "SENT_TO_CRM",
            Self::Failed => "FAILED",
        }
    }

    /// `Failed -> Failed` is allowed so a retried sync can record its latest error.
    pub fn can_advance_to(self, next: LeadStatus) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Distributed)
                | (Self::Distributed, Self::SentToCrm)
                | (Self::Distributed, Self::Failed)
                | (Self::Failed, Self::Failed)
                | (Self::Failed, Self::SentToCrm)
        )
    }

    /// Rows in these states still owe a CRM submission.
    pub fn awaits_sync(self) -> bool {
        matches!(self, Self::Distributed | Self::Failed)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "DISTRIBUTED" => Ok(Self::Distributed),
            "SENT_TO_CRM" => Ok(Self::SentToCrm),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown lead status '{other}'")),
        }
    }
}

/// Deduplication key of a lead.
///
/// Source-provided ids win; otherwise the normalized `(email, phone digits)`
/// pair identifies the contact regardless of which source it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeadIdentity {
    External {
        source: LeadSource,
        external_id: String,
    },
    Contact {
        email: String,
        phone: String,
    },
}

impl LeadIdentity {
    pub fn key(&self) -> String {
        match self {
            Self::External {
                source,
                external_id,
            } => format!("{source}:id:{external_id}"),
            Self::Contact { email, phone } => format!("contact:{email}|{phone}"),
        }
    }
}

impl fmt::Display for LeadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Canonical lead record.
///
/// Contact fields are fixed once the normalizer builds the lead. `team` is
/// written exactly once and `status` only advances.
#[derive(Debug, Clone, PartialEq)]
pub struct Lead {
    pub(crate) external_id: Option<String>,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) phone: String,
    pub(crate) phone_digits: String,
    pub(crate) unit: Option<String>,
    pub(crate) notes: Option<String>,
    pub(crate) source: LeadSource,
    pub(crate) received_at: DateTime<Utc>,
    pub(crate) raw_fields: BTreeMap<String, String>,
    pub(crate) team: Option<String>,
    pub(crate) status: LeadStatus,
}

impl Lead {
    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trimmed, lowercased email; empty when the source had none.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Phone for display. National digits when the source strips a country code.
    pub fn phone(&self) -> &str {
        &self.phone
    }

    /// Every digit of the phone as received; used for identity.
    pub fn phone_digits(&self) -> &str {
        &self.phone_digits
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn source(&self) -> LeadSource {
        self.source
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn raw_fields(&self) -> &BTreeMap<String, String> {
        &self.raw_fields
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref()
    }

    pub fn status(&self) -> LeadStatus {
        self.status
    }

    pub fn identity(&self) -> LeadIdentity {
        match &self.external_id {
            Some(external_id) => LeadIdentity::External {
                source: self.source,
                external_id: external_id.clone(),
            },
            None => LeadIdentity::Contact {
                email: self.email.clone(),
                phone: self.phone_digits.clone(),
            },
        }
    }

    /// Sets the team and moves the lead to `DISTRIBUTED`.
    pub fn assign_team(&mut self, team: impl Into<String>) -> Result<(), LeadStateError> {
        if let Some(existing) = &self.team {
            return Err(LeadStateError::TeamAlreadyAssigned {
                identity: self.identity().key(),
                team: existing.clone(),
            });
        }
        self.ensure_transition(LeadStatus::Distributed)?;
        self.team = Some(team.into());
        self.status = LeadStatus::Distributed;
        Ok(())
    }

    /// Records the outcome of a CRM submission.
    pub fn record_sync(&mut self, next: LeadStatus) -> Result<(), LeadStateError> {
        if self.team.is_none() {
            return Err(LeadStateError::Unassigned {
                identity: self.identity().key(),
            });
        }
        self.ensure_transition(next)?;
        self.status = next;
        Ok(())
    }

    fn ensure_transition(&self, next: LeadStatus) -> Result<(), LeadStateError> {
        if self.status.can_advance_to(next) {
            Ok(())
        } else {
            Err(LeadStateError::StatusRegression {
                identity: self.identity().key(),
                from: self.status,
                to: next,
            })
        }
    }
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn phone_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Drops a leading country code from a digits-only phone when the number is
/// longer than a national number (11 digits).
pub fn strip_country_code(digits: &str, country_code: &str) -> String {
    if !country_code.is_empty() && digits.len() > 11 {
        if let Some(national) = digits.strip_prefix(country_code) {
            return national.to_string();
        }
    }
    digits.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lead() -> Lead {
        Lead {
            external_id: None,
            name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
            phone: "+55 (11) 98765-4321".to_string(),
            phone_digits: "5511987654321".to_string(),
            unit: None,
            notes: None,
            source: LeadSource::Email,
            received_at: Utc::now(),
            raw_fields: BTreeMap::new(),
            team: None,
            status: LeadStatus::New,
        }
    }

    #[test]
    fn contact_identity_ignores_source() {
        let mut email_lead = sample_lead();
        let mut ads_lead = sample_lead();
        ads_lead.source = LeadSource::MetaAds;
        assert_eq!(email_lead.identity(), ads_lead.identity());

        email_lead.external_id = Some("987".to_string());
        assert_eq!(email_lead.identity().key(), "email:id:987");
        assert_eq!(
            ads_lead.identity().key(),
            "contact:ana@example.com|5511987654321"
        );
    }

    #[test]
    fn team_is_assigned_once() {
        let mut lead = sample_lead();
        lead.assign_team("Team A").expect("first assignment");
        assert_eq!(lead.status(), LeadStatus::Distributed);

        let error = lead.assign_team("Team B").expect_err("second assignment");
        assert!(matches!(error, LeadStateError::TeamAlreadyAssigned { .. }));
        assert_eq!(lead.team(), Some("Team A"));
    }

    #[test]
    fn status_never_moves_backwards() {
        let mut lead = sample_lead();
        assert!(matches!(
            lead.record_sync(LeadStatus::SentToCrm),
            Err(LeadStateError::Unassigned { .. })
        ));

        lead.assign_team("Team A").expect("assign");
        lead.record_sync(LeadStatus::Failed).expect("fail");
        lead.record_sync(LeadStatus::Failed).expect("fail again");
        lead.record_sync(LeadStatus::SentToCrm).expect("retry succeeds");

        let error = lead
            .record_sync(LeadStatus::Failed)
            .expect_err("sent is terminal");
        assert!(matches!(error, LeadStateError::StatusRegression { .. }));
    }

    #[test]
    fn strips_country_code_only_from_long_numbers() {
        assert_eq!(strip_country_code("5511987654321", "55"), "11987654321");
        assert_eq!(strip_country_code("55119876543", "55"), "55119876543");
        assert_eq!(strip_country_code("4411987654321", "55"), "4411987654321");
        assert_eq!(phone_digits("+55 (11) 9.8765-4321"), "5511987654321");
    }

    #[test]
    fn parses_status_and_source_labels() {
        assert_eq!("sent_to_crm".parse::<LeadStatus>(), Ok(LeadStatus::SentToCrm));
        assert_eq!("ads_import".parse::<LeadSource>(), Ok(LeadSource::MetaAds));
        assert!("carrier_pigeon".parse::<LeadSource>().is_err());
    }
}
