//! Lead domain primitives.
//!
//! This crate owns normalization, deduplication, team distribution and the
//! ledger row codec. It performs no I/O; source adapters, the ledger store and
//! the CRM client live in `lead_pipeline`.

pub mod dedup;
pub mod distribution;
pub mod error;
pub mod lead;
pub mod ledger;
pub mod mapping;
pub mod normalizer;
