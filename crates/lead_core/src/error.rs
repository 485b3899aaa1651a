use crate::lead::{LeadSource, LeadStatus};

/// Fatal configuration problems. Any of these prevents a run from starting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid configuration for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("invalid team split: {0}")]
    TeamSplit(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// A raw record could not be turned into a lead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("{origin} record has no email or phone")]
    NoContactChannel { origin: LeadSource },

    #[error("no field mapping configured for source {0}")]
    UnmappedSource(LeadSource),
}

/// Rejected lifecycle transition on a lead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeadStateError {
    #[error("lead {identity} is already assigned to team {team}")]
    TeamAlreadyAssigned { identity: String, team: String },

    #[error("lead {identity} cannot move from {from} to {to}")]
    StatusRegression {
        identity: String,
        from: LeadStatus,
        to: LeadStatus,
    },

    #[error("lead {identity} has no team assigned")]
    Unassigned { identity: String },
}

/// A ledger row that cannot be read back as a lead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerDecodeError {
    #[error("ledger row is missing column '{0}'")]
    MissingColumn(&'static str),

    #[error("ledger column '{column}' has invalid value '{value}'")]
    InvalidValue { column: &'static str, value: String },
}
