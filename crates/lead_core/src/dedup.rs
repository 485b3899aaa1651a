use std::collections::HashSet;

use crate::lead::Lead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

/// Checks candidates against the identities already in the ledger and
/// against everything accepted earlier in the same batch.
///
/// The ledger set is only borrowed; accepted identities accumulate in a
/// separate in-batch set so two raw records that normalize to the same
/// identity are assigned at most once per run.
#[derive(Debug)]
pub struct Deduplicator<'a> {
    ledger: &'a HashSet<String>,
    batch: HashSet<String>,
}

impl<'a> Deduplicator<'a> {
    pub fn new(ledger: &'a HashSet<String>) -> Self {
        Self {
            ledger,
            batch: HashSet::new(),
        }
    }

    pub fn check(&mut self, lead: &Lead) -> DedupOutcome {
        let key = lead.identity().key();
        if self.ledger.contains(&key) || !self.batch.insert(key) {
            DedupOutcome::Duplicate
        } else {
            DedupOutcome::New
        }
    }

    pub fn accepted(&self) -> usize {
        self.batch.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::lead::LeadSource;
    use crate::mapping::MappingTable;
    use crate::normalizer::{Normalizer, RawLeadRecord};

    fn lead(source: LeadSource, pairs: &[(&str, &str)]) -> Lead {
        let table = MappingTable::builtin();
        let fields: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Normalizer::new(&table)
            .normalize(&RawLeadRecord::new(source, fields, Utc::now()))
            .expect("lead should normalize")
    }

    #[test]
    fn second_record_with_same_contact_in_batch_is_duplicate() {
        let ledger = HashSet::new();
        let mut dedup = Deduplicator::new(&ledger);

        let first = lead(LeadSource::Email, &[("Email", "x@y.com")]);
        let second = lead(LeadSource::Email, &[("Email", " X@Y.com ")]);

        assert_eq!(dedup.check(&first), DedupOutcome::New);
        assert_eq!(dedup.check(&second), DedupOutcome::Duplicate);
        assert_eq!(dedup.accepted(), 1);
    }

    #[test]
    fn ledger_identities_are_duplicates_and_left_untouched() {
        let existing = lead(LeadSource::MetaAds, &[("id", "77"), ("email", "a@b.c")]);
        let ledger = HashSet::from([existing.identity().key()]);
        let mut dedup = Deduplicator::new(&ledger);

        let refetched = lead(LeadSource::MetaAds, &[("id", "77"), ("email", "changed@b.c")]);
        assert_eq!(dedup.check(&refetched), DedupOutcome::Duplicate);
        assert_eq!(ledger.len(), 1);
        assert_eq!(dedup.accepted(), 0);
    }

    #[test]
    fn different_phone_is_a_different_contact() {
        let ledger = HashSet::new();
        let mut dedup = Deduplicator::new(&ledger);

        let first = lead(LeadSource::Email, &[("Email", "x@y.com"), ("Phone", "11 1111-1111")]);
        let second = lead(LeadSource::Email, &[("Email", "x@y.com"), ("Phone", "11 2222-2222")]);

        assert_eq!(dedup.check(&first), DedupOutcome::New);
        assert_eq!(dedup.check(&second), DedupOutcome::New);
    }
}
