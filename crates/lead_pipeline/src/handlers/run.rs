//! One pipeline run: FETCH, NORMALIZE, DEDUPE, DISTRIBUTE, PERSIST, SYNC_CRM.
//!
//! Only an unreadable ledger stops a run. Everything else is isolated to the
//! source or record it happened to and reported in the [`RunSummary`].
//! All state a run needs is re-read from the ledger, so overlapping or
//! crashed runs converge on the next invocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lead_core::dedup::{DedupOutcome, Deduplicator};
use lead_core::distribution::{Distributor, TeamConfig};
use lead_core::lead::{Lead, LeadStatus};
use lead_core::ledger::{columns, encode_row, LedgerEntry, LedgerSnapshot, LEDGER_HEADERS};
use lead_core::mapping::MappingTable;
use lead_core::normalizer::Normalizer;

use crate::adapters::lead_sink::{CrmPayload, LeadSink};
use crate::adapters::source::{FetchedRecord, RecordDisposition, SourceAdapter};
use crate::adapters::tabular_store::TabularStore;
use crate::config::PipelineConfig;
use crate::error::RunError;
use crate::observability::{run_span, source_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetch,
    Normalize,
    Dedupe,
    Distribute,
    Persist,
    SyncCrm,
}

/// A record-level problem reported back to the trigger caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub stage: RunStage,
    pub kind: String,
    /// Source name, ledger identity or receipt the failure is about.
    pub reference: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub distributed: usize,
    pub persisted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Ledger rows from earlier runs that were resubmitted to the CRM.
    pub retried: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub config_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    /// Leads assigned in this run, per team.
    pub assignments: BTreeMap<String, u64>,
    /// Ledger rows per configured team once this run's appends landed.
    pub team_totals: BTreeMap<String, u64>,
    pub failures: Vec<RecordFailure>,
}

/// What a run needs besides its ports.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings<'a> {
    pub teams: &'a TeamConfig,
    pub mappings: &'a MappingTable,
    pub ledger_tab: &'a str,
}

impl<'a> From<&'a PipelineConfig> for RunSettings<'a> {
    fn from(config: &'a PipelineConfig) -> Self {
        Self {
            teams: &config.teams,
            mappings: &config.mappings,
            ledger_tab: &config.ledger_tab,
        }
    }
}

/// Ports a run talks to. Sources are fetched in the order given.
pub struct RunPorts<'a> {
    pub sources: Vec<&'a dyn SourceAdapter>,
    pub ledger: &'a dyn TabularStore,
    pub sink: &'a dyn LeadSink,
}

struct Candidate<'a> {
    origin: &'a dyn SourceAdapter,
    receipt: Option<String>,
    lead: Lead,
}

struct Run<'a> {
    run_id: &'a str,
    settings: RunSettings<'a>,
    ports: &'a RunPorts<'a>,
    counts: RunCounts,
    assignments: BTreeMap<String, u64>,
    failures: Vec<RecordFailure>,
}

pub fn run_pipeline(
    run_id: &str,
    settings: RunSettings<'_>,
    ports: &RunPorts<'_>,
) -> Result<RunSummary, RunError> {
    let config_fingerprint = settings.teams.fingerprint();
    let span = run_span(run_id, &config_fingerprint);
    let _guard = span.enter();

    let started_at = Utc::now();
    tracing::info!(
        event = "run_started",
        run_id,
        sources = ports.sources.len(),
        teams = settings.teams.teams().len(),
        "pipeline run started"
    );

    let mut run = Run {
        run_id,
        settings,
        ports,
        counts: RunCounts::default(),
        assignments: BTreeMap::new(),
        failures: Vec::new(),
    };

    let fetched = run.fetch();
    let candidates = run.normalize(fetched);

    let snapshot = match run.read_ledger() {
        Ok(snapshot) => snapshot,
        Err(error) => {
            tracing::error!(
                event = "ledger_unavailable",
                run_id,
                error = %error,
                "ledger unreadable, stopping before dedupe"
            );
            return Err(error);
        }
    };

    let fresh = run.dedupe_and_distribute(candidates, &snapshot);
    let persisted = run.persist(fresh);

    let mut team_totals = snapshot
        .distribution_state(settings.teams)
        .by_team(settings.teams);
    for team in persisted.iter().filter_map(|entry| entry.lead.team()) {
        *team_totals.entry(team.to_string()).or_default() += 1;
    }

    let mut queue = snapshot.pending_sync();
    run.counts.retried = queue.len();
    queue.extend(persisted);
    run.sync_crm(queue);

    let summary = RunSummary {
        run_id: run_id.to_string(),
        config_fingerprint,
        started_at,
        finished_at: Utc::now(),
        counts: run.counts,
        assignments: run.assignments,
        team_totals,
        failures: run.failures,
    };
    tracing::info!(
        event = "run_completed",
        run_id,
        fetched = summary.counts.fetched,
        duplicates = summary.counts.duplicates,
        distributed = summary.counts.distributed,
        persisted = summary.counts.persisted,
        sent = summary.counts.sent,
        failed = summary.counts.failed,
        retried = summary.counts.retried,
        failures = summary.failures.len(),
        "pipeline run completed"
    );
    Ok(summary)
}

impl<'a> Run<'a> {
    fn record_failure(
        &mut self,
        stage: RunStage,
        kind: &str,
        reference: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.failures.push(RecordFailure {
            stage,
            kind: kind.to_string(),
            reference: reference.into(),
            message: message.into(),
        });
    }

    fn acknowledge(
        &self,
        origin: &dyn SourceAdapter,
        receipt: Option<&str>,
        disposition: RecordDisposition,
    ) {
        let Some(receipt) = receipt else {
            return;
        };
        if let Err(error) = origin.acknowledge(receipt, disposition) {
            tracing::warn!(
                event = "source_ack_failed",
                run_id = self.run_id,
                source = origin.name(),
                receipt,
                disposition = disposition.as_str(),
                error = %error,
                "could not acknowledge record"
            );
        }
    }

    fn fetch(&mut self) -> Vec<(&'a dyn SourceAdapter, FetchedRecord)> {
        let mut fetched = Vec::new();
        let ports = self.ports;
        for &origin in &ports.sources {
            let span = source_span(origin.name());
            let _guard = span.enter();
            match origin.fetch() {
                Ok(records) => {
                    tracing::info!(
                        event = "source_fetched",
                        source = origin.name(),
                        records = records.len(),
                        "fetched source records"
                    );
                    self.counts.fetched += records.len();
                    fetched.extend(records.into_iter().map(|record| (origin, record)));
                }
                Err(error) => {
                    tracing::warn!(
                        event = "source_fetch_failed",
                        run_id = self.run_id,
                        source = origin.name(),
                        error = %error,
                        "skipping source for this run"
                    );
                    self.record_failure(
                        RunStage::Fetch,
                        "source_fetch_error",
                        origin.name(),
                        error.to_string(),
                    );
                }
            }
        }
        fetched
    }

    fn normalize(
        &mut self,
        fetched: Vec<(&'a dyn SourceAdapter, FetchedRecord)>,
    ) -> Vec<Candidate<'a>> {
        let normalizer = Normalizer::new(self.settings.mappings);
        let mut candidates = Vec::with_capacity(fetched.len());
        for (origin, fetched_record) in fetched {
            match normalizer.normalize(&fetched_record.record) {
                Ok(lead) => {
                    self.counts.normalized += 1;
                    candidates.push(Candidate {
                        origin,
                        receipt: fetched_record.receipt,
                        lead,
                    });
                }
                Err(error) => {
                    self.counts.rejected += 1;
                    let reference = fetched_record
                        .receipt
                        .clone()
                        .unwrap_or_else(|| origin.name().to_string());
                    tracing::warn!(
                        event = "lead_rejected",
                        run_id = self.run_id,
                        source = origin.name(),
                        reference = %reference,
                        error = %error,
                        "record could not be normalized"
                    );
                    self.acknowledge(
                        origin,
                        fetched_record.receipt.as_deref(),
                        RecordDisposition::Rejected,
                    );
                    self.record_failure(
                        RunStage::Normalize,
                        "normalization_error",
                        reference,
                        error.to_string(),
                    );
                }
            }
        }
        candidates
    }

    fn read_ledger(&self) -> Result<LedgerSnapshot, RunError> {
        let ledger = self.ports.ledger;
        let tab = self.settings.ledger_tab;
        ledger
            .ensure_tab(tab, &LEDGER_HEADERS)
            .map_err(RunError::LedgerUnavailable)?;
        let rows = ledger
            .read_all_rows(tab)
            .map_err(RunError::LedgerUnavailable)?;
        let snapshot = LedgerSnapshot::from_rows(&rows);
        tracing::info!(
            event = "ledger_loaded",
            run_id = self.run_id,
            rows = snapshot.len(),
            undecodable = snapshot.undecodable(),
            "ledger snapshot loaded"
        );
        Ok(snapshot)
    }

    /// Assigns a team to every candidate not already in the ledger or earlier
    /// in this batch, in fetch order.
    fn dedupe_and_distribute(
        &mut self,
        candidates: Vec<Candidate<'a>>,
        snapshot: &LedgerSnapshot,
    ) -> Vec<Candidate<'a>> {
        let teams = self.settings.teams;
        let mut dedup = Deduplicator::new(snapshot.identities());
        let mut distributor = Distributor::new(teams, &snapshot.distribution_state(teams));
        let mut fresh = Vec::with_capacity(candidates.len());

        for mut candidate in candidates {
            let identity = candidate.lead.identity().key();
            if dedup.check(&candidate.lead) == DedupOutcome::Duplicate {
                self.counts.duplicates += 1;
                tracing::info!(
                    event = "lead_duplicate",
                    run_id = self.run_id,
                    identity = %identity,
                    source = candidate.origin.name(),
                    "lead already recorded"
                );
                self.acknowledge(
                    candidate.origin,
                    candidate.receipt.as_deref(),
                    RecordDisposition::Duplicate,
                );
                continue;
            }

            match distributor.assign(&mut candidate.lead) {
                Ok(team) => {
                    self.counts.distributed += 1;
                    *self.assignments.entry(team.to_string()).or_default() += 1;
                    tracing::info!(
                        event = "lead_assigned",
                        run_id = self.run_id,
                        identity = %identity,
                        team,
                        source = %candidate.lead.source(),
                        "lead distributed"
                    );
                    fresh.push(candidate);
                }
                Err(error) => {
                    self.record_failure(
                        RunStage::Distribute,
                        "lead_state_error",
                        identity,
                        error.to_string(),
                    );
                }
            }
        }
        fresh
    }

    /// Appends each distributed lead on its own; a failed append leaves the
    /// source record unacknowledged so it is fetched again.
    fn persist(&mut self, fresh: Vec<Candidate<'a>>) -> Vec<LedgerEntry> {
        let mut persisted = Vec::with_capacity(fresh.len());
        for candidate in fresh {
            let row = encode_row(&candidate.lead, Utc::now());
            let entry = LedgerEntry::from_new_lead(candidate.lead);
            match self.ports.ledger.append_row(self.settings.ledger_tab, &row) {
                Ok(()) => {
                    self.counts.persisted += 1;
                    self.acknowledge(
                        candidate.origin,
                        candidate.receipt.as_deref(),
                        RecordDisposition::Imported,
                    );
                    persisted.push(entry);
                }
                Err(error) => {
                    tracing::error!(
                        event = "ledger_append_failed",
                        run_id = self.run_id,
                        identity = %entry.identity_key,
                        error = %error,
                        "lead not persisted, will be refetched"
                    );
                    self.record_failure(
                        RunStage::Persist,
                        "ledger_write_error",
                        entry.identity_key,
                        error.to_string(),
                    );
                }
            }
        }
        persisted
    }

    fn extras_for(&self, lead: &Lead) -> &'a [lead_core::mapping::ExtraField] {
        let mappings: &'a MappingTable = self.settings.mappings;
        mappings
            .get(lead.source())
            .map(|mapping| mapping.extras.as_slice())
            .unwrap_or(&[])
    }

    /// Submits every entry still owed to the CRM and records the outcome
    /// on its ledger row.
    fn sync_crm(&mut self, queue: Vec<LedgerEntry>) {
        for mut entry in queue {
            let Some(team) = entry.lead.team().map(str::to_string) else {
                continue;
            };
            let payload = CrmPayload::for_lead(&entry.lead, &team, self.extras_for(&entry.lead));
            entry.sync_attempts += 1;

            let outcome = match self.ports.sink.submit(&payload) {
                Ok(receipt) => {
                    entry.crm_reference = receipt.reference.or(entry.crm_reference.take());
                    entry.last_error = None;
                    entry.lead.record_sync(LeadStatus::SentToCrm)
                }
                Err(error) => {
                    tracing::warn!(
                        event = "crm_sync_failed",
                        run_id = self.run_id,
                        identity = %entry.identity_key,
                        team = %team,
                        attempt = entry.sync_attempts,
                        error = %error,
                        "crm submission failed, will retry next run"
                    );
                    self.record_failure(
                        RunStage::SyncCrm,
                        "crm_sync_error",
                        entry.identity_key.clone(),
                        error.to_string(),
                    );
                    entry.last_error = Some(error.to_string());
                    entry.lead.record_sync(LeadStatus::Failed)
                }
            };
            if let Err(error) = outcome {
                self.record_failure(
                    RunStage::SyncCrm,
                    "lead_state_error",
                    entry.identity_key.clone(),
                    error.to_string(),
                );
                continue;
            }

            match entry.lead.status() {
                LeadStatus::SentToCrm => {
                    self.counts.sent += 1;
                    tracing::info!(
                        event = "crm_synced",
                        run_id = self.run_id,
                        identity = %entry.identity_key,
                        team = %team,
                        reference = entry.crm_reference.as_deref().unwrap_or_default(),
                        "lead sent to crm"
                    );
                }
                _ => self.counts.failed += 1,
            }

            let update = entry.sync_update(Utc::now());
            if let Err(error) = self.ports.ledger.update_row(
                self.settings.ledger_tab,
                columns::IDENTITY,
                &entry.identity_key,
                &update,
            ) {
                tracing::error!(
                    event = "ledger_update_failed",
                    run_id = self.run_id,
                    identity = %entry.identity_key,
                    status = %entry.lead.status(),
                    error = %error,
                    "sync outcome not recorded"
                );
                self.record_failure(
                    RunStage::SyncCrm,
                    "ledger_write_error",
                    entry.identity_key.clone(),
                    error.to_string(),
                );
            }
        }
    }
}
