//! CRM submission.
//!
//! The payload uses the common `data -> attributes` envelope. Any non-2xx
//! answer is a retryable [`CrmSyncError`].

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use lead_core::lead::Lead;
use lead_core::mapping::{ExtraField, FieldLookup};

use crate::adapters::truncate_body;
use crate::config::CrmConfig;
use crate::error::CrmSyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmAttributes {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub source: String,
    pub description: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmData {
    pub attributes: CrmAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmPayload {
    pub data: CrmData,
}

impl CrmPayload {
    /// `extras` are the source's custom form questions, rendered as
    /// `Label: value` lines when the lead answered them.
    pub fn for_lead(lead: &Lead, team: &str, extras: &[ExtraField]) -> Self {
        let lookup = FieldLookup::new(lead.raw_fields());
        let mut body_parts = Vec::new();
        if let Some(unit) = lead.unit() {
            body_parts.push(format!("Unit of Interest: {unit}"));
        }
        for extra in extras {
            if let Some(value) = lookup.get(&extra.header) {
                body_parts.push(format!("{}: {value}", extra.label));
            }
        }
        if let Some(notes) = lead.notes() {
            body_parts.push(format!("\nOriginal Notes: {notes}"));
        }

        Self {
            data: CrmData {
                attributes: CrmAttributes {
                    name: lead.name().to_string(),
                    email: lead.email().to_string(),
                    phone: lead.phone().to_string(),
                    source: format!("Lead Manager - {}", lead.source()),
                    description: format!("[{team}] - New lead registered"),
                    body: body_parts.join("\n"),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReceipt {
    /// CRM-side id of the created record, when the CRM returns one.
    pub reference: Option<String>,
}

pub trait LeadSink {
    fn submit(&self, payload: &CrmPayload) -> Result<SinkReceipt, CrmSyncError>;
}

pub struct HttpLeadSink {
    client: Client,
    api_url: String,
    token: String,
}

impl HttpLeadSink {
    pub fn new(client: Client, config: &CrmConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            token: config.api_token.clone(),
        }
    }
}

impl LeadSink for HttpLeadSink {
    #[instrument(level = "debug", skip_all)]
    fn submit(&self, payload: &CrmPayload) -> Result<SinkReceipt, CrmSyncError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .send()?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        receipt_from_answer(status, &text)
    }
}

/// Any 2xx is accepted; everything else is a rejection carrying the body.
pub fn receipt_from_answer(status: StatusCode, text: &str) -> Result<SinkReceipt, CrmSyncError> {
    if !status.is_success() {
        return Err(CrmSyncError::Rejected {
            status: status.as_u16(),
            body: truncate_body(text),
        });
    }
    let reference = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|body| reference_from_response(&body));
    Ok(SinkReceipt { reference })
}

/// Reads `data.id`, falling back to a top-level `id`.
pub fn reference_from_response(body: &Value) -> Option<String> {
    let id = body
        .pointer("/data/id")
        .filter(|value| !value.is_null())
        .or_else(|| body.get("id"))?;
    match id {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use chrono::Utc;
    use serde_json::json;

    use lead_core::lead::LeadSource;
    use lead_core::mapping::{FieldMapping, MappingTable};
    use lead_core::normalizer::{Normalizer, RawLeadRecord};

    use super::*;

    fn ad_lead() -> Lead {
        let table = MappingTable::builtin();
        let fields: BTreeMap<String, String> = [
            ("id", "991"),
            ("Full Name", "Carla"),
            ("Email", "carla@x.io"),
            ("Phone", "+55 11 98888-7777"),
            ("Question 1", "Moema"),
            ("Question 2", "Noite"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        let mut lead = Normalizer::new(&table)
            .normalize(&RawLeadRecord::new(LeadSource::MetaAds, fields, Utc::now()))
            .expect("lead should normalize");
        lead.assign_team("Team B").expect("assign");
        lead
    }

    #[test]
    fn payload_follows_data_attributes_envelope() {
        let lead = ad_lead();
        let payload = CrmPayload::for_lead(&lead, "Team B", &FieldMapping::meta_ads_default().extras);
        let value = serde_json::to_value(&payload).expect("serialize");

        assert_eq!(value["data"]["attributes"]["name"], "Carla");
        assert_eq!(value["data"]["attributes"]["source"], "Lead Manager - meta_ads");
        assert_eq!(
            value["data"]["attributes"]["description"],
            "[Team B] - New lead registered"
        );
        assert_eq!(
            payload.data.attributes.body,
            "Unit of Interest: Moema\nQuestion 1: Moema\nQuestion 2: Noite"
        );
    }

    #[test]
    fn notes_are_appended_after_a_blank_line() {
        let table = MappingTable::builtin();
        let fields = BTreeMap::from([
            ("Email".to_string(), "d@x.io".to_string()),
            ("Notes".to_string(), "Imported from email. Subject: Oi".to_string()),
        ]);
        let lead = Normalizer::new(&table)
            .normalize(&RawLeadRecord::new(LeadSource::Email, fields, Utc::now()))
            .expect("lead should normalize");

        let payload = CrmPayload::for_lead(&lead, "Team A", &[]);
        assert_eq!(
            payload.data.attributes.body,
            "\nOriginal Notes: Imported from email. Subject: Oi"
        );
        assert_eq!(payload.data.attributes.name, "Unknown");
    }

    #[test]
    fn non_2xx_answers_are_rejections() {
        match receipt_from_answer(StatusCode::UNPROCESSABLE_ENTITY, "{\"error\":\"email taken\"}") {
            Err(CrmSyncError::Rejected { status, body }) => {
                assert_eq!(status, 422);
                assert!(body.contains("email taken"));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert!(matches!(
            receipt_from_answer(StatusCode::MOVED_PERMANENTLY, ""),
            Err(CrmSyncError::Rejected { status: 301, .. })
        ));
        assert_eq!(
            receipt_from_answer(StatusCode::CREATED, "{\"data\":{\"id\":\"c-9\"}}")
                .expect("accepted")
                .reference,
            Some("c-9".to_string())
        );
        assert_eq!(
            receipt_from_answer(StatusCode::NO_CONTENT, "").expect("accepted"),
            SinkReceipt::default()
        );
    }

    /// Answers one request on a local port with `status_line` and `body`,
    /// handing back the raw request it read.
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/leads", listener.local_addr().expect("addr"));
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let read = stream.read(&mut buffer).expect("read");
                request.extend_from_slice(&buffer[..read]);
                if read == 0 || request_complete(&request) {
                    break;
                }
            }
            let answer = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(answer.as_bytes()).expect("write");
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn sink_for(url: String) -> HttpLeadSink {
        HttpLeadSink::new(
            Client::builder().no_proxy().build().expect("client"),
            &CrmConfig {
                api_url: url,
                api_token: "crm-token".to_string(),
            },
        )
    }

    #[test]
    fn http_sink_posts_payload_with_bearer_token() {
        let (url, server) = serve_once("201 Created", "{\"data\":{\"id\":\"crm-77\"}}");
        let payload = CrmPayload::for_lead(&ad_lead(), "Team B", &[]);

        let receipt = sink_for(url).submit(&payload).expect("accepted");
        let request = server.join().expect("server thread");

        assert_eq!(receipt.reference.as_deref(), Some("crm-77"));
        assert!(request.starts_with("POST /leads "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer crm-token"));
        assert!(request.contains("\"description\":\"[Team B] - New lead registered\""));
    }

    #[test]
    fn http_sink_maps_error_status_to_rejection() {
        let (url, server) = serve_once("503 Service Unavailable", "{\"error\":\"maintenance\"}");
        let payload = CrmPayload::for_lead(&ad_lead(), "Team B", &[]);

        let outcome = sink_for(url).submit(&payload);
        server.join().expect("server thread");

        match outcome {
            Err(CrmSyncError::Rejected { status, body }) => {
                assert_eq!(status, 503);
                assert!(body.contains("maintenance"));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn reads_reference_from_common_response_shapes() {
        assert_eq!(
            reference_from_response(&json!({"data": {"id": "abc-1"}})),
            Some("abc-1".to_string())
        );
        assert_eq!(
            reference_from_response(&json!({"id": 42})),
            Some("42".to_string())
        );
        assert_eq!(reference_from_response(&json!({"data": {"id": null}, "id": "x"})), Some("x".to_string()));
        assert_eq!(reference_from_response(&json!({"ok": true})), None);
    }
}
