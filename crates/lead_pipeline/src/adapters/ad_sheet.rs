use std::sync::Arc;

use chrono::Utc;

use lead_core::lead::LeadSource;
use lead_core::ledger::Row;
use lead_core::mapping::FieldLookup;
use lead_core::normalizer::RawLeadRecord;

use crate::adapters::source::{FetchedRecord, RecordDisposition, SourceAdapter};
use crate::adapters::tabular_store::TabularStore;
use crate::error::SourceFetchError;

pub const STATUS_COLUMN: &str = "Status";

/// The ad platform's lead export tab.
///
/// Rows with a non-blank `Status` were handled by an earlier run and are
/// skipped. Acknowledging a row writes the disposition into that column of
/// the first row with the same lead id whose `Status` is still blank, so rows
/// repeating an id are each marked once. Rows without an id are matched on
/// all of their cells.
pub struct AdSheetSource {
    name: String,
    store: Arc<dyn TabularStore>,
    tab: String,
    id_columns: Vec<String>,
}

impl AdSheetSource {
    /// `id_columns` are the header aliases of the platform lead id, usually
    /// the `external_id` aliases of the ad mapping.
    pub fn new(store: Arc<dyn TabularStore>, tab: impl Into<String>, id_columns: Vec<String>) -> Self {
        let tab = tab.into();
        Self {
            name: format!("ad_sheet:{tab}"),
            store,
            tab,
            id_columns,
        }
    }

    /// Cells the row still has while unacknowledged.
    fn receipt_for(&self, row: &Row) -> Option<String> {
        let lookup = FieldLookup::new(row);
        let mut criteria = self
            .id_columns
            .iter()
            .find_map(|column| {
                let value = lookup.get(column)?;
                Some(Row::from([(column.clone(), value.to_string())]))
            })
            .unwrap_or_else(|| row.clone());
        criteria.insert(STATUS_COLUMN.to_string(), String::new());
        serde_json::to_string(&criteria).ok()
    }
}

impl SourceAdapter for AdSheetSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> LeadSource {
        LeadSource::MetaAds
    }

    fn fetch(&self) -> Result<Vec<FetchedRecord>, SourceFetchError> {
        let observed_at = Utc::now();
        let rows = self.store.read_all_rows(&self.tab)?;
        Ok(rows
            .into_iter()
            .filter(|row| FieldLookup::new(row).get(STATUS_COLUMN).is_none())
            .map(|row| {
                let receipt = self.receipt_for(&row);
                let mut fields = row;
                fields.retain(|header, _| !header.trim().eq_ignore_ascii_case(STATUS_COLUMN));
                FetchedRecord {
                    record: RawLeadRecord::new(LeadSource::MetaAds, fields, observed_at),
                    receipt,
                }
            })
            .collect())
    }

    fn acknowledge(
        &self,
        receipt: &str,
        disposition: RecordDisposition,
    ) -> Result<(), SourceFetchError> {
        let criteria: Row = serde_json::from_str(receipt)
            .map_err(|error| SourceFetchError::Decode(format!("bad ad row receipt: {error}")))?;
        let fields = Row::from([(STATUS_COLUMN.to_string(), disposition.as_str().to_string())]);
        self.store.update_first_matching(&self.tab, &criteria, &fields)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MemoryTabularStore;

    fn store_with_export() -> Arc<MemoryTabularStore> {
        let store = Arc::new(MemoryTabularStore::new());
        store.seed(
            "meta",
            &["id", "Full Name", "Email", "Phone", "Question 1", "Status"],
            &[
                &["101", "Ana", "ana@x.io", "5511987654321", "Centro", ""],
                &["102", "Bruno", "b@x.io", "", "", "imported"],
                &["", "No Id", "n@x.io", "", "", ""],
            ],
        );
        store
    }

    #[test]
    fn skips_rows_that_already_have_a_status() {
        let store = store_with_export();
        let source = AdSheetSource::new(store.clone(), "meta", vec!["id".to_string()]);

        let records = source.fetch().expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].record.fields.get("Full Name").map(String::as_str),
            Some("Ana")
        );
        assert!(!records[0].record.fields.contains_key("Status"));
        assert!(records[0].receipt.is_some());
    }

    #[test]
    fn rows_without_an_id_are_acknowledged_by_their_cells() {
        let store = store_with_export();
        let source = AdSheetSource::new(store.clone(), "meta", vec!["id".to_string()]);

        let records = source.fetch().expect("fetch");
        let receipt = records[1].receipt.clone().expect("receipt");
        source
            .acknowledge(&receipt, RecordDisposition::Rejected)
            .expect("acknowledge");

        let rows = store.rows("meta");
        assert_eq!(rows[0].get("Status").map(String::as_str), Some(""));
        assert_eq!(rows[2].get("Status").map(String::as_str), Some("rejected"));
    }

    #[test]
    fn acknowledge_writes_disposition_to_status() {
        let store = store_with_export();
        let source = AdSheetSource::new(store.clone(), "meta", vec!["Lead ID".to_string(), "id".to_string()]);

        let records = source.fetch().expect("fetch");
        let receipt = records[0].receipt.clone().expect("receipt");
        source
            .acknowledge(&receipt, RecordDisposition::Duplicate)
            .expect("acknowledge");

        let rows = store.rows("meta");
        assert_eq!(rows[0].get("Status").map(String::as_str), Some("duplicate"));
        assert_eq!(source.fetch().expect("fetch").len(), 1);
    }

    #[test]
    fn rows_repeating_an_id_are_each_acknowledged_once() {
        let store = Arc::new(MemoryTabularStore::new());
        store.seed(
            "meta",
            &["id", "Full Name", "Email", "Status"],
            &[
                &["101", "Ana", "ana@x.io", ""],
                &["101", "Ana", "ana@x.io", ""],
            ],
        );
        let source = AdSheetSource::new(store.clone(), "meta", vec!["id".to_string()]);

        let records = source.fetch().expect("fetch");
        assert_eq!(records.len(), 2);
        for (record, disposition) in records
            .iter()
            .zip([RecordDisposition::Imported, RecordDisposition::Duplicate])
        {
            let receipt = record.receipt.as_deref().expect("receipt");
            source.acknowledge(receipt, disposition).expect("acknowledge");
        }

        let statuses: Vec<String> = store
            .rows("meta")
            .iter()
            .map(|row| row.get("Status").cloned().unwrap_or_default())
            .collect();
        assert_eq!(statuses, vec!["imported", "duplicate"]);
        assert!(source.fetch().expect("fetch").is_empty());
    }

    #[test]
    fn unreadable_tab_is_a_fetch_error() {
        let store = store_with_export();
        store.fail_reads("meta");
        let source = AdSheetSource::new(store.clone(), "meta", vec!["id".to_string()]);

        assert!(matches!(source.fetch(), Err(SourceFetchError::Store(_))));
    }
}
