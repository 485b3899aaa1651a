//! Ports to the outside world and their HTTP / filesystem implementations.
//!
//! The orchestrator only sees the traits; the deployed trigger wires the
//! Google and CRM clients, the local runner wires CSV tabs and a directory
//! inbox, and tests wire the fakes from `test_helpers`.

use std::time::Duration;

use reqwest::blocking::Client;

pub mod ad_sheet;
pub mod inbox;
pub mod lead_sink;
pub mod sheets;
pub mod source;
pub mod tabular_store;

/// Blocking client shared by every adapter of a run. `timeout` bounds each
/// request end to end.
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("lead_pipeline/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Keeps error bodies short enough for a log line and a run summary.
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 500;
    match body.char_indices().nth(LIMIT) {
        Some((index, _)) => format!("{}...", &body[..index]),
        None => body.to_string(),
    }
}
