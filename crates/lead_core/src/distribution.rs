//! Deficit-weighted round robin over the configured teams.
//!
//! Counts are always rebuilt from the ledger's `Team` column before a batch,
//! so no counter survives between runs. Each lead goes to the team with the
//! largest `target * total - count`; ties resolve to the team listed first.
//! Assignment of a batch is a pure function of the starting counts, the
//! batch length and the [`TeamConfig`].

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, LeadStateError};
use crate::lead::Lead;

pub const FRACTION_SUM_TOLERANCE: f64 = 1e-6;
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamTarget {
    pub name: String,
    pub target_fraction: f64,
}

/// Ordered teams with their target shares. Order is the tie-break priority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamConfig {
    teams: Vec<TeamTarget>,
}

impl TeamConfig {
    pub fn new(teams: Vec<(String, f64)>) -> Result<Self, ConfigError> {
        if teams.is_empty() {
            return Err(ConfigError::TeamSplit("team list cannot be empty".to_string()));
        }

        let mut targets: Vec<TeamTarget> = Vec::with_capacity(teams.len());
        for (name, fraction) in teams {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::TeamSplit("team names must be non-empty".to_string()));
            }
            if targets.iter().any(|existing| existing.name == name) {
                return Err(ConfigError::TeamSplit(format!("team '{name}' is listed twice")));
            }
            if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
                return Err(ConfigError::TeamSplit(format!(
                    "fraction for team '{name}' must be within [0, 1], got {fraction}"
                )));
            }
            targets.push(TeamTarget {
                name,
                target_fraction: fraction,
            });
        }

        let sum: f64 = targets.iter().map(|team| team.target_fraction).sum();
        if (sum - 1.0).abs() > FRACTION_SUM_TOLERANCE {
            return Err(ConfigError::TeamSplit(format!(
                "fractions must sum to 1.0, got {sum}"
            )));
        }

        Ok(Self { teams: targets })
    }

    /// Parses `Name:fraction,Name:fraction`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut teams = Vec::new();
        for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
            let Some((name, fraction)) = entry.rsplit_once(':') else {
                return Err(ConfigError::TeamSplit(format!(
                    "entry '{}' must look like Name:fraction",
                    entry.trim()
                )));
            };
            let fraction = fraction.trim().parse::<f64>().map_err(|_| {
                ConfigError::TeamSplit(format!("fraction '{}' is not a number", fraction.trim()))
            })?;
            teams.push((name.to_string(), fraction));
        }
        Self::new(teams)
    }

    pub fn teams(&self) -> &[TeamTarget] {
        &self.teams
    }

    pub fn position(&self, team: &str) -> Option<usize> {
        self.teams.iter().position(|target| target.name == team)
    }

    /// Stable digest of the split, reported with every run.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for team in &self.teams {
            hasher.update(team.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(team.target_fraction.to_bits().to_be_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Per-team assignment counts, aligned with the [`TeamConfig`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionState {
    counts: Vec<u64>,
}

impl DistributionState {
    pub fn empty(config: &TeamConfig) -> Self {
        Self {
            counts: vec![0; config.teams.len()],
        }
    }

    /// Counts the team labels found in the ledger. Labels of teams that are
    /// no longer configured are ignored.
    pub fn from_team_labels<'a>(
        config: &TeamConfig,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut state = Self::empty(config);
        for label in labels {
            if let Some(index) = config.position(label.trim()) {
                state.counts[index] += 1;
            }
        }
        state
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn by_team(&self, config: &TeamConfig) -> BTreeMap<String, u64> {
        config
            .teams
            .iter()
            .zip(&self.counts)
            .map(|(team, count)| (team.name.clone(), *count))
            .collect()
    }
}

#[derive(Debug)]
pub struct Distributor<'a> {
    config: &'a TeamConfig,
    counts: Vec<u64>,
    total: u64,
}

impl<'a> Distributor<'a> {
    pub fn new(config: &'a TeamConfig, state: &DistributionState) -> Self {
        let mut counts = state.counts.clone();
        counts.resize(config.teams.len(), 0);
        let total = counts.iter().sum();
        Self {
            config,
            counts,
            total,
        }
    }

    /// Picks the next team and counts the assignment.
    pub fn next_team(&mut self) -> &'a str {
        let config = self.config;
        let index = self.pick();
        self.counts[index] += 1;
        self.total += 1;
        &config.teams[index].name
    }

    /// Assigns `lead` and moves it to `DISTRIBUTED`. A lead that already
    /// carries a team is rejected without touching the counts.
    pub fn assign(&mut self, lead: &mut Lead) -> Result<&'a str, LeadStateError> {
        let config = self.config;
        let index = self.pick();
        let team = &config.teams[index].name;
        lead.assign_team(team.clone())?;
        self.counts[index] += 1;
        self.total += 1;
        Ok(team)
    }

    pub fn state(&self) -> DistributionState {
        DistributionState {
            counts: self.counts.clone(),
        }
    }

    fn pick(&self) -> usize {
        let total = self.total as f64;
        let mut best: Option<(usize, f64)> = None;
        for (index, team) in self.config.teams.iter().enumerate() {
            if team.target_fraction <= 0.0 {
                continue;
            }
            let deficit = team.target_fraction * total - self.counts[index] as f64;
            match best {
                Some((_, best_deficit)) if deficit <= best_deficit + TIE_EPSILON => {}
                _ => best = Some((index, deficit)),
            }
        }
        // TeamConfig guarantees at least one positive fraction.
        best.map(|(index, _)| index).unwrap_or(0)
    }
}

/// Team sequence for `batch_len` new leads starting from `state`.
pub fn plan_assignments(
    config: &TeamConfig,
    state: &DistributionState,
    batch_len: usize,
) -> Vec<String> {
    let mut distributor = Distributor::new(config, state);
    (0..batch_len)
        .map(|_| distributor.next_team().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(pairs: &[(&str, f64)]) -> TeamConfig {
        TeamConfig::new(
            pairs
                .iter()
                .map(|(name, fraction)| ((*name).to_string(), *fraction))
                .collect(),
        )
        .expect("valid split")
    }

    #[test]
    fn seventy_thirty_cold_start_sequence() {
        let config = split(&[("A", 0.7), ("B", 0.3)]);
        let plan = plan_assignments(&config, &DistributionState::empty(&config), 10);

        assert_eq!(
            plan,
            vec!["A", "B", "A", "A", "B", "A", "A", "B", "A", "A"]
        );
        let state = DistributionState::from_team_labels(&config, plan.iter().map(String::as_str));
        assert_eq!(state.counts(), &[7, 3]);
    }

    #[test]
    fn plan_is_deterministic() {
        let config = split(&[("A", 0.45), ("B", 0.35), ("C", 0.2)]);
        let state = DistributionState::from_team_labels(&config, ["A", "C", "C", "B"]);

        assert_eq!(
            plan_assignments(&config, &state, 250),
            plan_assignments(&config, &state, 250)
        );
    }

    #[test]
    fn existing_counts_steer_towards_lagging_team() {
        let config = split(&[("A", 0.5), ("B", 0.5)]);
        let state = DistributionState::from_team_labels(&config, ["A", "A", "A", "A", "A", "B"]);

        assert_eq!(plan_assignments(&config, &state, 4), vec!["B", "B", "B", "B"]);
    }

    #[test]
    fn zero_fraction_team_never_receives_leads() {
        let config = split(&[("Paused", 0.0), ("A", 0.6), ("B", 0.4)]);
        let plan = plan_assignments(&config, &DistributionState::empty(&config), 500);

        assert!(plan.iter().all(|team| team != "Paused"));
        assert_eq!(plan.iter().filter(|team| *team == "A").count(), 300);
    }

    #[test]
    fn unknown_ledger_teams_are_not_counted() {
        let config = split(&[("A", 0.5), ("B", 0.5)]);
        let state = DistributionState::from_team_labels(&config, ["Retired", "A", " B ", ""]);

        assert_eq!(state.counts(), &[1, 1]);
        assert_eq!(state.total(), 2);
    }

    #[test]
    fn rejects_invalid_splits() {
        assert!(TeamConfig::new(Vec::new()).is_err());
        assert!(TeamConfig::parse("A:0.7,B:0.2").is_err());
        assert!(TeamConfig::parse("A:0.7,A:0.3").is_err());
        assert!(TeamConfig::parse("A:1.5,B:-0.5").is_err());
        assert!(TeamConfig::parse("A 0.7").is_err());
        assert!(TeamConfig::parse(" :1.0").is_err());
        assert!(TeamConfig::parse("A:NaN").is_err());
    }

    #[test]
    fn parses_split_and_tolerates_rounding() {
        let config = TeamConfig::parse("Sales North:0.3333333, Sales South:0.3333333, Inside:0.3333334")
            .expect("split should parse");
        let names: Vec<&str> = config.teams().iter().map(|team| team.name.as_str()).collect();
        assert_eq!(names, vec!["Sales North", "Sales South", "Inside"]);
    }

    #[test]
    fn fingerprint_changes_with_split() {
        let a = split(&[("A", 0.7), ("B", 0.3)]);
        let b = split(&[("A", 0.6), ("B", 0.4)]);
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
