//! Adapters and handlers around `lead_core`.
//!
//! Sources, the ledger store and the CRM sink sit behind traits in
//! [`adapters`]; [`handlers::run`] drives one pipeline run through them and
//! [`handlers::trigger`] turns its outcome into the scheduler's HTTP answer.
//! The binaries only wire concrete adapters from configuration.

pub mod adapters;
pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
