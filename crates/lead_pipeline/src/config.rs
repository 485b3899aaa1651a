//! Environment configuration, parsed once per invocation.
//!
//! Everything is read through a lookup function so tests can feed a map
//! instead of touching the process environment.

use std::time::Duration;

use lead_core::distribution::TeamConfig;
use lead_core::error::ConfigError;
use lead_core::mapping::MappingTable;

use crate::observability::LogFormat;

pub const DEFAULT_LEDGER_TAB: &str = "leads";
pub const DEFAULT_ADS_TAB: &str = "meta";
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmConfig {
    pub api_url: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub teams: TeamConfig,
    pub mappings: MappingTable,
    pub crm: CrmConfig,
    pub ledger_tab: String,
    pub ads_tab: String,
    pub io_timeout: Duration,
    pub log_format: LogFormat,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let teams = team_config(&get)?;

        let mut mappings = MappingTable::builtin();
        if let Some(raw) = get("FIELD_MAPPINGS") {
            mappings = mappings.with_overrides_json(&raw)?;
        }

        let crm = CrmConfig {
            api_url: required(&get, "CRM_API_URL")?,
            api_token: required(&get, "CRM_API_TOKEN")?,
        };
        if !crm.api_url.starts_with("http://") && !crm.api_url.starts_with("https://") {
            return Err(ConfigError::invalid("CRM_API_URL", "must be an http(s) URL"));
        }

        let io_timeout = match get("IO_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::invalid(
                        "IO_TIMEOUT_SECS",
                        format!("expected a positive number of seconds, got '{raw}'"),
                    ))
                }
            },
            None => Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        };

        let log_format = match get("LOG_FORMAT") {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|message| ConfigError::invalid("LOG_FORMAT", message))?,
            None => LogFormat::Json,
        };

        Ok(Self {
            teams,
            mappings,
            crm,
            ledger_tab: get("LEDGER_TAB").unwrap_or_else(|| DEFAULT_LEDGER_TAB.to_string()),
            ads_tab: get("ADS_TAB").unwrap_or_else(|| DEFAULT_ADS_TAB.to_string()),
            io_timeout,
            log_format,
        })
    }
}

/// `TEAM_SPLIT` wins; otherwise the two-team form driven by
/// `DISTRIBUTION_PERCENTAGE_A`.
fn team_config(get: &impl Fn(&str) -> Option<String>) -> Result<TeamConfig, ConfigError> {
    if let Some(raw) = get("TEAM_SPLIT") {
        return TeamConfig::parse(&raw);
    }

    let Some(raw_fraction) = get("DISTRIBUTION_PERCENTAGE_A") else {
        return Err(ConfigError::Missing(
            "TEAM_SPLIT (or DISTRIBUTION_PERCENTAGE_A)".to_string(),
        ));
    };
    let fraction = raw_fraction.parse::<f64>().map_err(|_| {
        ConfigError::invalid(
            "DISTRIBUTION_PERCENTAGE_A",
            format!("'{raw_fraction}' is not a number"),
        )
    })?;
    if !(0.0..=1.0).contains(&fraction) {
        return Err(ConfigError::invalid(
            "DISTRIBUTION_PERCENTAGE_A",
            "must be between 0.0 and 1.0",
        ));
    }

    TeamConfig::new(vec![
        (get("TEAM_A_NAME").unwrap_or_else(|| "Team A".to_string()), fraction),
        (get("TEAM_B_NAME").unwrap_or_else(|| "Team B".to_string()), 1.0 - fraction),
    ])
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

/// Google Workspace access used by the deployed trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleConfig {
    pub spreadsheet_id: String,
    pub access_token: String,
    pub gmail_user: String,
    pub gmail_query: String,
}

impl GoogleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Ok(Self {
            spreadsheet_id: required(&get, "SPREADSHEET_ID")?,
            access_token: required(&get, "GOOGLE_ACCESS_TOKEN")?,
            gmail_user: get("GMAIL_USER").unwrap_or_else(|| "me".to_string()),
            gmail_query: get("GMAIL_QUERY").unwrap_or_else(|| "is:unread".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CRM: [(&str, &str); 2] = [
        ("CRM_API_URL", "https://crm.example.com/api/leads"),
        ("CRM_API_TOKEN", "secret"),
    ];

    #[test]
    fn reads_team_split_and_defaults() {
        let mut pairs = CRM.to_vec();
        pairs.push(("TEAM_SPLIT", "North:0.6,South:0.4"));
        let config = PipelineConfig::from_lookup(lookup(&pairs)).expect("config should load");

        assert_eq!(config.teams.teams().len(), 2);
        assert_eq!(config.ledger_tab, "leads");
        assert_eq!(config.ads_tab, "meta");
        assert_eq!(config.io_timeout, Duration::from_secs(20));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn falls_back_to_two_team_percentage() {
        let mut pairs = CRM.to_vec();
        pairs.push(("DISTRIBUTION_PERCENTAGE_A", "0.7"));
        pairs.push(("TEAM_B_NAME", "Closers"));
        let config = PipelineConfig::from_lookup(lookup(&pairs)).expect("config should load");

        let names: Vec<&str> = config.teams.teams().iter().map(|team| team.name.as_str()).collect();
        assert_eq!(names, vec!["Team A", "Closers"]);
        assert!((config.teams.teams()[1].target_fraction - 0.3).abs() < 1e-9);
    }

    #[test]
    fn missing_values_are_fatal() {
        let error = PipelineConfig::from_lookup(lookup(&CRM)).expect_err("no split");
        assert!(matches!(error, ConfigError::Missing(_)));

        let error = PipelineConfig::from_lookup(lookup(&[("TEAM_SPLIT", "A:1.0")]))
            .expect_err("no crm");
        assert_eq!(error, ConfigError::Missing("CRM_API_URL".to_string()));
    }

    #[test]
    fn rejects_bad_values() {
        for (key, value) in [
            ("TEAM_SPLIT", "A:0.5,B:0.4"),
            ("IO_TIMEOUT_SECS", "0"),
            ("LOG_FORMAT", "xml"),
            ("FIELD_MAPPINGS", "{not json"),
        ] {
            let mut pairs = CRM.to_vec();
            if key != "TEAM_SPLIT" {
                pairs.push(("TEAM_SPLIT", "A:1.0"));
            }
            pairs.push((key, value));
            assert!(
                PipelineConfig::from_lookup(lookup(&pairs)).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn google_config_requires_sheet_and_token() {
        assert!(GoogleConfig::from_lookup(lookup(&[("SPREADSHEET_ID", "abc")])).is_err());

        let google = GoogleConfig::from_lookup(lookup(&[
            ("SPREADSHEET_ID", "abc"),
            ("GOOGLE_ACCESS_TOKEN", "ya29.token"),
        ]))
        .expect("google config");
        assert_eq!(google.gmail_user, "me");
        assert_eq!(google.gmail_query, "is:unread");
    }
}
