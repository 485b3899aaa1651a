//! In-memory fakes for the pipeline ports.
//!
//! Each fake records what it was asked to do and can be told to fail, so
//! tests can drive the orchestrator through partial failures without any
//! network or filesystem.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeZone, Utc};

use lead_core::lead::LeadSource;
use lead_core::ledger::Row;
use lead_core::normalizer::RawLeadRecord;

use crate::adapters::lead_sink::{CrmPayload, LeadSink, SinkReceipt};
use crate::adapters::source::{FetchedRecord, RecordDisposition, SourceAdapter};
use crate::adapters::tabular_store::{Table, TabularStore};
use crate::error::{CrmSyncError, SourceFetchError, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed instant used by fake sources.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

/// Tabs held in memory, with the same header semantics as the real stores.
#[derive(Default)]
pub struct MemoryTabularStore {
    tables: Mutex<BTreeMap<String, Table>>,
    failing_reads: Mutex<HashSet<String>>,
    failing_appends: Mutex<HashSet<String>>,
    failing_updates: Mutex<bool>,
    appends: Mutex<usize>,
}

impl MemoryTabularStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, tab: &str, headers: &[&str], rows: &[&[&str]]) {
        let mut table = Table::with_headers(headers);
        table.rows = rows
            .iter()
            .map(|cells| cells.iter().map(|cell| (*cell).to_string()).collect())
            .collect();
        lock(&self.tables).insert(tab.to_string(), table);
    }

    pub fn rows(&self, tab: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(tab)
            .map(Table::to_rows)
            .unwrap_or_default()
    }

    /// Every read of `tab` fails until [`Self::heal_reads`].
    pub fn fail_reads(&self, tab: &str) {
        lock(&self.failing_reads).insert(tab.to_string());
    }

    pub fn heal_reads(&self) {
        lock(&self.failing_reads).clear();
    }

    /// Appends of rows whose `Identity` cell equals `identity` fail.
    pub fn fail_appends_for(&self, identity: &str) {
        lock(&self.failing_appends).insert(identity.to_string());
    }

    pub fn heal_appends(&self) {
        lock(&self.failing_appends).clear();
    }

    pub fn fail_updates(&self, failing: bool) {
        *lock(&self.failing_updates) = failing;
    }

    pub fn append_count(&self) -> usize {
        *lock(&self.appends)
    }
}

impl TabularStore for MemoryTabularStore {
    fn ensure_tab(&self, tab: &str, headers: &[&str]) -> Result<(), StoreError> {
        if lock(&self.failing_reads).contains(tab) {
            return Err(StoreError::Unavailable(format!("{tab} is unreachable")));
        }
        lock(&self.tables)
            .entry(tab.to_string())
            .or_insert_with(|| Table::with_headers(headers));
        Ok(())
    }

    fn read_all_rows(&self, tab: &str) -> Result<Vec<Row>, StoreError> {
        if lock(&self.failing_reads).contains(tab) {
            return Err(StoreError::Unavailable(format!("{tab} is unreachable")));
        }
        Ok(self.rows(tab))
    }

    fn append_row(&self, tab: &str, row: &Row) -> Result<(), StoreError> {
        let identity = row
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("identity"))
            .map(|(_, value)| value.as_str())
            .unwrap_or_default();
        if lock(&self.failing_appends).contains(identity) {
            return Err(StoreError::Unavailable(format!("append of {identity} rejected")));
        }
        let mut tables = lock(&self.tables);
        let table = tables
            .get_mut(tab)
            .ok_or_else(|| StoreError::MissingHeader(tab.to_string()))?;
        let cells = table.cells_for(row);
        table.rows.push(cells);
        *lock(&self.appends) += 1;
        Ok(())
    }

    fn update_first_matching(
        &self,
        tab: &str,
        criteria: &Row,
        fields: &Row,
    ) -> Result<(), StoreError> {
        if *lock(&self.failing_updates) {
            return Err(StoreError::Unavailable(format!("update of {tab} rejected")));
        }
        let mut tables = lock(&self.tables);
        let table = tables
            .get_mut(tab)
            .ok_or_else(|| StoreError::MissingHeader(tab.to_string()))?;
        table.update(tab, criteria, fields)
    }
}

/// Source serving a fixed list of records; acknowledgements are recorded.
pub struct ScriptedSource {
    name: String,
    source: LeadSource,
    records: Vec<FetchedRecord>,
    failure: Option<String>,
    acks: Mutex<Vec<(String, RecordDisposition)>>,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>, source: LeadSource) -> Self {
        Self {
            name: name.into(),
            source,
            records: Vec::new(),
            failure: None,
            acks: Mutex::new(Vec::new()),
        }
    }

    /// Adds a record whose receipt is `receipt`.
    pub fn with_record(mut self, receipt: &str, pairs: &[(&str, &str)]) -> Self {
        self.records.push(FetchedRecord {
            record: RawLeadRecord::new(self.source, fields(pairs), fixed_time()),
            receipt: Some(receipt.to_string()),
        });
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn acks(&self) -> Vec<(String, RecordDisposition)> {
        lock(&self.acks).clone()
    }
}

impl SourceAdapter for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> LeadSource {
        self.source
    }

    fn fetch(&self) -> Result<Vec<FetchedRecord>, SourceFetchError> {
        match &self.failure {
            Some(message) => Err(SourceFetchError::Decode(message.clone())),
            None => Ok(self.records.clone()),
        }
    }

    fn acknowledge(
        &self,
        receipt: &str,
        disposition: RecordDisposition,
    ) -> Result<(), SourceFetchError> {
        lock(&self.acks).push((receipt.to_string(), disposition));
        Ok(())
    }
}

/// Lead sink that captures payloads and answers from a script.
///
/// Queued outcomes are consumed first; once empty, submissions succeed
/// unless the payload email is in the failing set.
#[derive(Default)]
pub struct ScriptedLeadSink {
    submitted: Mutex<Vec<CrmPayload>>,
    script: Mutex<VecDeque<Result<Option<String>, String>>>,
    failing_emails: Mutex<HashSet<String>>,
}

impl ScriptedLeadSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failure(&self, message: &str) {
        lock(&self.script).push_back(Err(message.to_string()));
    }

    pub fn push_success(&self, reference: Option<&str>) {
        lock(&self.script).push_back(Ok(reference.map(str::to_string)));
    }

    pub fn fail_for_email(&self, email: &str) {
        lock(&self.failing_emails).insert(email.to_string());
    }

    pub fn heal(&self) {
        lock(&self.failing_emails).clear();
        lock(&self.script).clear();
    }

    pub fn submitted(&self) -> Vec<CrmPayload> {
        lock(&self.submitted).clone()
    }

    pub fn submitted_emails(&self) -> Vec<String> {
        self.submitted()
            .into_iter()
            .map(|payload| payload.data.attributes.email)
            .collect()
    }
}

impl LeadSink for ScriptedLeadSink {
    fn submit(&self, payload: &CrmPayload) -> Result<SinkReceipt, CrmSyncError> {
        lock(&self.submitted).push(payload.clone());
        if let Some(outcome) = lock(&self.script).pop_front() {
            return outcome
                .map(|reference| SinkReceipt { reference })
                .map_err(CrmSyncError::Unavailable);
        }
        if lock(&self.failing_emails).contains(&payload.data.attributes.email) {
            return Err(CrmSyncError::Rejected {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok(SinkReceipt {
            reference: Some(format!("crm-{}", lock(&self.submitted).len())),
        })
    }
}
