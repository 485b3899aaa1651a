//! Lead-form emails as a lead source.
//!
//! An [`InboxReader`] yields unread messages; [`InboxSource`] pulls the form
//! fields out of each plain-text body and marks the message processed once
//! the run has decided what to do with it.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use lead_core::lead::LeadSource;
use lead_core::normalizer::RawLeadRecord;

use crate::adapters::source::{FetchedRecord, RecordDisposition, SourceAdapter};
use crate::adapters::truncate_body;
use crate::error::SourceFetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

pub trait InboxReader {
    fn fetch_unread(&self) -> Result<Vec<RawMessage>, SourceFetchError>;

    fn mark_processed(&self, message_id: &str) -> Result<(), SourceFetchError>;
}

struct FormPattern {
    field: &'static str,
    regex: Regex,
}

static FORM_PATTERNS: OnceLock<Vec<FormPattern>> = OnceLock::new();

fn form_patterns() -> &'static [FormPattern] {
    FORM_PATTERNS.get_or_init(|| {
        [
            ("Name", r"(?im)^[ \t]*(?:name|nome)[ \t]*:[ \t]*([^\r\n]*)"),
            (
                "Email",
                r"(?i)e-?mail[ \t]*:[ \t]*([a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,})",
            ),
            (
                "Phone",
                r"(?i)(?:phone|telefone|whatsapp)[ \t]*:[ \t]*([+\d][+\d \t().-]*)",
            ),
            ("Unit", r"(?im)^[ \t]*(?:unit|unidade)[ \t]*:[ \t]*([^\r\n]*)"),
        ]
        .into_iter()
        .filter_map(|(field, pattern)| match Regex::new(pattern) {
            Ok(regex) => Some(FormPattern { field, regex }),
            Err(error) => {
                tracing::error!(field, %error, "invalid form pattern");
                None
            }
        })
        .collect()
    })
}

/// Labeled form fields found in a plain-text body. Labels match
/// case-insensitively; fields without a value are left out.
pub fn extract_form_fields(body: &str) -> BTreeMap<String, String> {
    form_patterns()
        .iter()
        .filter_map(|pattern| {
            let value = pattern.regex.captures(body)?.get(1)?.as_str().trim();
            (!value.is_empty()).then(|| (pattern.field.to_string(), value.to_string()))
        })
        .collect()
}

/// Turns one message into the field mapping the normalizer reads.
pub fn message_fields(message: &RawMessage) -> BTreeMap<String, String> {
    let mut fields = extract_form_fields(&message.body);
    fields.insert(
        "Notes".to_string(),
        format!("Imported from email. Subject: {}", message.subject),
    );
    fields.insert("Subject".to_string(), message.subject.clone());
    if !message.sender.is_empty() {
        fields.insert("From".to_string(), message.sender.clone());
    }
    fields
}

pub struct InboxSource<R> {
    name: String,
    reader: R,
}

impl<R: InboxReader> InboxSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            name: "inbox".to_string(),
            reader,
        }
    }
}

impl<R: InboxReader> SourceAdapter for InboxSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> LeadSource {
        LeadSource::Email
    }

    fn fetch(&self) -> Result<Vec<FetchedRecord>, SourceFetchError> {
        Ok(self
            .reader
            .fetch_unread()?
            .into_iter()
            .map(|message| FetchedRecord {
                record: RawLeadRecord::new(
                    LeadSource::Email,
                    message_fields(&message),
                    message.received_at,
                ),
                receipt: Some(message.id),
            })
            .collect())
    }

    /// Every outcome marks the message read; a rejected form will not become
    /// valid by being fetched again.
    fn acknowledge(
        &self,
        receipt: &str,
        _disposition: RecordDisposition,
    ) -> Result<(), SourceFetchError> {
        self.reader.mark_processed(receipt)
    }
}

/// Reads `*.eml` / `*.txt` files from a directory and moves processed ones
/// into `processed/`. Files are a header block (`From:`, `Subject:`,
/// `Date:`) followed by a blank line and a plain-text body.
#[derive(Debug, Clone)]
pub struct DirectoryInboxReader {
    dir: PathBuf,
}

impl DirectoryInboxReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn processed_dir(&self) -> PathBuf {
        self.dir.join("processed")
    }
}

impl InboxReader for DirectoryInboxReader {
    fn fetch_unread(&self) -> Result<Vec<RawMessage>, SourceFetchError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_message = path
                .extension()
                .and_then(|extension| extension.to_str())
                .map(|extension| matches!(extension, "eml" | "txt"))
                .unwrap_or(false);
            if path.is_file() && is_message {
                paths.push(path);
            }
        }
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            let modified = fs::metadata(&path)?.modified().ok().map(DateTime::<Utc>::from);
            messages.push(parse_plain_message(id, &text, modified.unwrap_or_else(Utc::now)));
        }
        Ok(messages)
    }

    fn mark_processed(&self, message_id: &str) -> Result<(), SourceFetchError> {
        let processed = self.processed_dir();
        fs::create_dir_all(&processed)?;
        fs::rename(self.dir.join(message_id), processed.join(message_id))?;
        Ok(())
    }
}

/// A leading block counts as headers only when every line is `Name: value`
/// and it carries at least one of `From`, `Subject` or `Date`; a body that
/// starts straight with form fields is not mistaken for headers.
fn is_header_block(head: &str) -> bool {
    let mut known = false;
    for line in head.lines() {
        let Some((name, _)) = line.split_once(':') else {
            return false;
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return false;
        }
        known |= ["from", "subject", "date"]
            .iter()
            .any(|header| name.eq_ignore_ascii_case(header));
    }
    known
}

/// Splits a header block from the body. `fallback` is used when there is
/// no parseable `Date:` header.
pub fn parse_plain_message(id: &str, text: &str, fallback: DateTime<Utc>) -> RawMessage {
    let text = text.replace("\r\n", "\n");
    let (head, body) = match text.split_once("\n\n") {
        Some((head, body)) if is_header_block(head) => (head, body),
        _ => ("", text.as_str()),
    };

    let mut sender = String::new();
    let mut subject = String::new();
    let mut received_at = fallback;
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "from" => sender = value.to_string(),
            "subject" => subject = value.to_string(),
            "date" => {
                if let Ok(date) = DateTime::parse_from_rfc2822(value) {
                    received_at = date.with_timezone(&Utc);
                }
            }
            _ => {}
        }
    }

    RawMessage {
        id: id.to_string(),
        sender,
        subject,
        body: body.to_string(),
        received_at,
    }
}

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";
const MAX_LIST_PAGES: usize = 10;

#[derive(Debug, Deserialize)]
struct GmailMessagesListResponse {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

#[derive(Debug, Default, Deserialize)]
struct GmailPart {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

impl GmailPart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// First `text/plain` part, depth first.
    fn plain_text(&self) -> Option<String> {
        if self.mime_type.eq_ignore_ascii_case("text/plain") {
            let data = self.body.as_ref()?.data.as_deref()?;
            return decode_body(data);
        }
        self.parts.iter().find_map(GmailPart::plain_text)
    }
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Unread messages of a Gmail mailbox over the REST API (bearer token).
pub struct GmailInboxReader {
    client: Client,
    api_base: String,
    token: String,
    user_id: String,
    query: String,
}

impl GmailInboxReader {
    pub fn new(client: Client, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: GMAIL_API_BASE.to_string(),
            token: token.into(),
            user_id: "me".to_string(),
            query: "is:unread".to_string(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/gmail/v1/users/{}/messages",
            self.api_base.trim_end_matches('/'),
            self.user_id
        )
    }

    fn check(response: Response) -> Result<Response, SourceFetchError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().unwrap_or_default();
            Err(SourceFetchError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            })
        }
    }

    fn list_message_ids(&self) -> Result<Vec<String>, SourceFetchError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut request = self
                .client
                .get(self.messages_url())
                .bearer_auth(&self.token)
                .query(&[("q", self.query.as_str()), ("maxResults", "100")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: GmailMessagesListResponse = Self::check(request.send()?)?.json()?;
            ids.extend(page.messages.into_iter().map(|message| message.id));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(ids)
    }

    fn get_message(&self, message_id: &str) -> Result<RawMessage, SourceFetchError> {
        let response = self
            .client
            .get(format!("{}/{}", self.messages_url(), message_id))
            .bearer_auth(&self.token)
            .query(&[("format", "full")])
            .send()?;
        let message: GmailMessage = Self::check(response)?.json()?;
        Ok(raw_message_from_gmail(message))
    }
}

fn raw_message_from_gmail(message: GmailMessage) -> RawMessage {
    let payload = message.payload.unwrap_or_default();
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    RawMessage {
        sender: payload.header("From").unwrap_or_default().to_string(),
        subject: payload.header("Subject").unwrap_or("No Subject").to_string(),
        body: payload.plain_text().unwrap_or_default(),
        id: message.id,
        received_at,
    }
}

impl InboxReader for GmailInboxReader {
    #[instrument(level = "info", skip(self), fields(user = %self.user_id))]
    fn fetch_unread(&self) -> Result<Vec<RawMessage>, SourceFetchError> {
        let ids = self.list_message_ids()?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_message(&id) {
                Ok(message) => messages.push(message),
                // Left unread; picked up again next run.
                Err(error) => tracing::warn!(
                    event = "inbox_message_unreadable",
                    message_id = %id,
                    error = %error,
                    "skipping message"
                ),
            }
        }
        Ok(messages)
    }

    fn mark_processed(&self, message_id: &str) -> Result<(), SourceFetchError> {
        let response = self
            .client
            .post(format!("{}/{}/modify", self.messages_url(), message_id))
            .bearer_auth(&self.token)
            .json(&json!({ "removeLabelIds": ["UNREAD"] }))
            .send()?;
        Self::check(response)?;
        Ok(())
    }
}
