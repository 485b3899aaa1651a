use lead_core::error::ConfigError;

/// A source could not be read this run. The source is skipped; other
/// sources still contribute their records.
#[derive(Debug, thiserror::Error)]
pub enum SourceFetchError {
    #[error("source request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("source answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("source tab unreadable: {0}")]
    Store(#[from] StoreError),

    #[error("inbox directory unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed source payload: {0}")]
    Decode(String),
}

/// Failure talking to the tabular store backing the ledger and the ad tab.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("csv store error: {0}")]
    Csv(#[from] csv::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tab '{0}' has no header row")]
    MissingHeader(String),

    #[error("tab '{tab}' has no column '{column}'")]
    MissingColumn { tab: String, column: String },

    #[error("no row in tab '{tab}' where {column} = '{key}'")]
    RowNotFound {
        tab: String,
        column: String,
        key: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn status(status: reqwest::StatusCode, body: String) -> Self {
        Self::Status {
            status: status.as_u16(),
            body,
        }
    }
}

/// A CRM submission that did not succeed. Always retryable.
#[derive(Debug, thiserror::Error)]
pub enum CrmSyncError {
    #[error("crm request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("crm answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("crm unavailable: {0}")]
    Unavailable(String),
}

/// Errors that stop a run before any lead is assigned.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("http client could not be built: {0}")]
    Client(#[from] reqwest::Error),

    #[error("ledger could not be read: {0}")]
    LedgerUnavailable(#[source] StoreError),
}
