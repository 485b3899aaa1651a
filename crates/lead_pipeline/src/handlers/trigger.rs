use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RunError;
use crate::handlers::run::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

/// Maps a finished run to the scheduler's response.
///
/// A completed run is always 200, whatever happened to individual records.
pub fn trigger_response(outcome: Result<RunSummary, RunError>) -> ApiGatewayResponse {
    match outcome {
        Ok(summary) => success_response(200, &summary),
        Err(RunError::Config(error)) => error_response(
            500,
            json!({
                "error": "configuration_error",
                "message": error.to_string(),
            }),
        ),
        Err(RunError::Client(error)) => error_response(
            500,
            json!({
                "error": "startup_error",
                "message": error.to_string(),
            }),
        ),
        Err(RunError::LedgerUnavailable(error)) => error_response(
            503,
            json!({
                "error": "ledger_unavailable",
                "message": error.to_string(),
            }),
        ),
    }
}

fn success_response(status_code: u16, payload: impl Serialize) -> ApiGatewayResponse {
    match serde_json::to_string(&payload) {
        Ok(body) => ApiGatewayResponse {
            status_code,
            headers: json!({"Content-Type": "application/json"}),
            body,
        },
        Err(error) => error_response(
            500,
            json!({
                "error": "serialization_error",
                "message": error.to_string(),
            }),
        ),
    }
}

fn error_response(status_code: u16, payload: Value) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use lead_core::error::ConfigError;

    use super::*;
    use crate::error::StoreError;
    use crate::handlers::run::{RecordFailure, RunCounts, RunStage};

    fn body(response: &ApiGatewayResponse) -> Value {
        serde_json::from_str(&response.body).expect("body should be json")
    }

    #[test]
    fn completed_run_answers_200_even_with_record_failures() {
        let summary = RunSummary {
            run_id: "req-1".to_string(),
            config_fingerprint: "abc".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            counts: RunCounts {
                fetched: 3,
                failed: 1,
                ..RunCounts::default()
            },
            assignments: BTreeMap::from([("Team A".to_string(), 2)]),
            team_totals: BTreeMap::from([("Team A".to_string(), 9), ("Team B".to_string(), 4)]),
            failures: vec![RecordFailure {
                stage: RunStage::SyncCrm,
                kind: "crm_sync_error".to_string(),
                reference: "contact:a@x.io|".to_string(),
                message: "crm answered 503".to_string(),
            }],
        };

        let response = trigger_response(Ok(summary));
        assert_eq!(response.status_code, 200);
        let value = body(&response);
        assert_eq!(value["run_id"], "req-1");
        assert_eq!(value["counts"]["fetched"], 3);
        assert_eq!(value["assignments"]["Team A"], 2);
        assert_eq!(value["team_totals"]["Team B"], 4);
        assert_eq!(value["failures"][0]["stage"], "sync_crm");
    }

    #[test]
    fn configuration_error_answers_500() {
        let response = trigger_response(Err(RunError::Config(ConfigError::Missing(
            "CRM_API_URL".to_string(),
        ))));

        assert_eq!(response.status_code, 500);
        let value = body(&response);
        assert_eq!(value["error"], "configuration_error");
        assert!(value["message"]
            .as_str()
            .unwrap_or_default()
            .contains("CRM_API_URL"));
    }

    #[test]
    fn unreadable_ledger_answers_503() {
        let response = trigger_response(Err(RunError::LedgerUnavailable(
            StoreError::Unavailable("timeout".to_string()),
        )));

        assert_eq!(response.status_code, 503);
        assert_eq!(body(&response)["error"], "ledger_unavailable");
        assert_eq!(response.headers["Content-Type"], "application/json");
    }
}
