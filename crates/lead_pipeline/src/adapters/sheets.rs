//! Google Sheets v4 `values` API as a [`TabularStore`].
//!
//! Auth is an OAuth2 access token (bearer). All writes use
//! `valueInputOption=RAW` so timestamps and ids are stored verbatim. Reads
//! ask for unformatted values so long numeric ids are not rounded.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use lead_core::ledger::Row;

use crate::adapters::tabular_store::{Table, TabularStore};
use crate::adapters::truncate_body;
use crate::error::StoreError;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

pub struct SheetsTabularStore {
    client: Client,
    api_base: String,
    spreadsheet_id: String,
    token: String,
    headers: Mutex<HashMap<String, Vec<String>>>,
}

impl SheetsTabularStore {
    pub fn new(client: Client, spreadsheet_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: SHEETS_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            token: token.into(),
            headers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// `.../v4/spreadsheets/{id}/values/{range}{suffix}`
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|error| StoreError::Unavailable(format!("invalid sheets api base: {error}")))?;
        url.path_segments_mut()
            .map_err(|()| StoreError::Unavailable("sheets api base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values"])
            .push(&format!("{range}{suffix}"));
        Ok(url)
    }

    fn batch_update_url(&self) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|error| StoreError::Unavailable(format!("invalid sheets api base: {error}")))?;
        url.path_segments_mut()
            .map_err(|()| StoreError::Unavailable("sheets api base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str()])
            .push("values:batchUpdate");
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request.bearer_auth(&self.token).send()?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().unwrap_or_default();
            Err(StoreError::status(status, truncate_body(&body)))
        }
    }

    fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.values_url(range, "")?;
        let body: ValueRange = self
            .send(self.client.get(url).query(&[("valueRenderOption", "UNFORMATTED_VALUE")]))?
            .json()?;
        Ok(body
            .values
            .into_iter()
            .map(|cells| cells.into_iter().map(cell_text).collect())
            .collect())
    }

    fn load_table(&self, tab: &str) -> Result<Table, StoreError> {
        let table = Table::from_records(self.get_values(&quoted(tab))?);
        self.remember_headers(tab, &table.headers);
        Ok(table)
    }

    fn header_row(&self, tab: &str) -> Result<Vec<String>, StoreError> {
        if let Some(headers) = self
            .headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tab)
        {
            return Ok(headers.clone());
        }
        let headers = self
            .get_values(&format!("{}!1:1", quoted(tab)))?
            .into_iter()
            .next()
            .unwrap_or_default();
        self.remember_headers(tab, &headers);
        Ok(headers)
    }

    fn remember_headers(&self, tab: &str, headers: &[String]) {
        if headers.is_empty() {
            return;
        }
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tab.to_string(), headers.to_vec());
    }
}

impl TabularStore for SheetsTabularStore {
    #[instrument(level = "debug", skip(self, headers))]
    fn ensure_tab(&self, tab: &str, headers: &[&str]) -> Result<(), StoreError> {
        if !self.header_row(tab)?.is_empty() {
            return Ok(());
        }
        let url = self.values_url(&format!("{}!A1", quoted(tab)), "")?;
        self.send(
            self.client
                .put(url)
                .query(&[("valueInputOption", "RAW")])
                .json(&json!({ "values": [headers] })),
        )?;
        let written: Vec<String> = headers.iter().map(|header| (*header).to_string()).collect();
        self.remember_headers(tab, &written);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    fn read_all_rows(&self, tab: &str) -> Result<Vec<Row>, StoreError> {
        Ok(self.load_table(tab)?.to_rows())
    }

    #[instrument(level = "debug", skip(self, row))]
    fn append_row(&self, tab: &str, row: &Row) -> Result<(), StoreError> {
        let headers = self.header_row(tab)?;
        if headers.is_empty() {
            return Err(StoreError::MissingHeader(tab.to_string()));
        }
        let cells = Table {
            headers,
            rows: Vec::new(),
        }
        .cells_for(row);

        let url = self.values_url(&format!("{}!A1", quoted(tab)), ":append")?;
        self.send(
            self.client
                .post(url)
                .query(&[
                    ("valueInputOption", "RAW"),
                    ("insertDataOption", "INSERT_ROWS"),
                ])
                .json(&json!({ "values": [cells] })),
        )?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, fields))]
    fn update_first_matching(
        &self,
        tab: &str,
        criteria: &Row,
        fields: &Row,
    ) -> Result<(), StoreError> {
        let table = self.load_table(tab)?;
        let position = table.find_row(tab, criteria)?;
        let targets = table.update_targets(tab, fields)?;

        // Data row `position` sits below the header, and sheet rows are 1-based.
        let sheet_row = position + 2;
        let data: Vec<serde_json::Value> = targets
            .into_iter()
            .map(|(column, value)| {
                json!({
                    "range": format!("{}!{}{}", quoted(tab), column_letter(column), sheet_row),
                    "values": [[value]],
                })
            })
            .collect();

        let url = self.batch_update_url()?;
        self.send(self.client.post(url).json(&json!({
            "valueInputOption": "RAW",
            "data": data,
        })))?;
        Ok(())
    }
}

/// A1-notation sheet name; always quoted so spaces and digits are safe.
fn quoted(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

/// Zero-based column index to A1 column letters (`0 -> A`, `26 -> AA`).
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut remaining = index + 1;
    while remaining > 0 {
        let offset = (remaining - 1) % 26;
        letters.push(char::from(b'A' + offset as u8));
        remaining = (remaining - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Unformatted numbers keep every digit; integral floats drop the `.0`.
fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(number) => {
            if let Some(integer) = number.as_u64() {
                integer.to_string()
            } else if let Some(integer) = number.as_i64() {
                integer.to_string()
            } else {
                match number.as_f64() {
                    Some(float) if float.fract() == 0.0 && float.abs() < 1e15 => {
                        format!("{float:.0}")
                    }
                    Some(float) => float.to_string(),
                    None => number.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_follow_a1_notation() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(15), "P");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn tab_names_are_quoted() {
        assert_eq!(quoted("leads"), "'leads'");
        assert_eq!(quoted("Bob's leads"), "'Bob''s leads'");
    }

    #[test]
    fn builds_values_urls_under_spreadsheet() {
        let store = SheetsTabularStore::new(Client::new(), "sheet-123", "token")
            .with_api_base("http://localhost:8080/");
        let url = store.values_url("'leads'!A1", ":append").expect("url");
        assert!(url.as_str().starts_with("http://localhost:8080/v4/spreadsheets/sheet-123/values/"));
        assert!(url.as_str().ends_with(":append"));

        let batch = store.batch_update_url().expect("url");
        assert_eq!(
            batch.as_str(),
            "http://localhost:8080/v4/spreadsheets/sheet-123/values:batchUpdate"
        );
    }

    #[test]
    fn numeric_cells_become_text() {
        assert_eq!(cell_text(serde_json::json!(42)), "42");
        assert_eq!(cell_text(serde_json::json!("x")), "x");
        assert_eq!(cell_text(serde_json::Value::Null), "");
        assert_eq!(cell_text(serde_json::json!(true)), "true");
    }

    #[test]
    fn long_lead_ids_keep_every_digit() {
        assert_eq!(
            cell_text(serde_json::json!(120211234567890123u64)),
            "120211234567890123"
        );
        assert_eq!(cell_text(serde_json::json!(-7)), "-7");
        assert_eq!(cell_text(serde_json::json!(5511987654321.0)), "5511987654321");
        assert_eq!(cell_text(serde_json::json!(0.25)), "0.25");
    }
}
