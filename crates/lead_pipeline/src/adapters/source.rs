use lead_core::lead::LeadSource;
use lead_core::normalizer::RawLeadRecord;

use crate::error::SourceFetchError;

/// What happened to a fetched record, reported back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDisposition {
    Imported,
    Duplicate,
    Rejected,
}

impl RecordDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub record: RawLeadRecord,
    /// Opaque handle for [`SourceAdapter::acknowledge`]; `None` when the
    /// source cannot mark this record.
    pub receipt: Option<String>,
}

/// One origin of raw lead records.
///
/// Records that are never acknowledged are fetched again on the next run;
/// deduplication makes that harmless.
pub trait SourceAdapter {
    fn name(&self) -> &str;

    fn source(&self) -> LeadSource;

    fn fetch(&self) -> Result<Vec<FetchedRecord>, SourceFetchError>;

    fn acknowledge(
        &self,
        receipt: &str,
        disposition: RecordDisposition,
    ) -> Result<(), SourceFetchError>;
}
