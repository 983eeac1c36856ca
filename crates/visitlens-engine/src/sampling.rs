//! Sampling filter
//!
//! Picks visit ids for downstream review. Selection works on slim visits only
//! and is deterministic for a given seed, so both backends return the same
//! ids for the same inputs.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use visitlens_core::SlimVisit;
use visitlens_query::{ConfigError, VisitFilters};

/// Criteria for selecting visits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingCriteria {
    pub statuses: BTreeSet<String>,
    pub flagged_only: bool,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub usernames: BTreeSet<String>,
    /// Keep at most this many ids; `None` keeps every match
    pub sample_size: Option<usize>,
    pub seed: u64,
    /// Also return slim visits for the selected ids
    pub include_visits: bool,
}

impl SamplingCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.statuses.insert(status.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.usernames.insert(username.into());
        self
    }

    pub fn flagged_only(mut self, flagged_only: bool) -> Self {
        self.flagged_only = flagged_only;
        self
    }

    pub fn date_range(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn sample(mut self, size: usize, seed: u64) -> Self {
        self.sample_size = Some(size);
        self.seed = seed;
        self
    }

    pub fn include_visits(mut self, include: bool) -> Self {
        self.include_visits = include;
        self
    }

    /// The record filters these criteria imply
    pub fn filters(&self) -> VisitFilters {
        VisitFilters {
            statuses: self.statuses.clone(),
            flagged_only: self.flagged_only,
            date_from: self.date_from,
            date_to: self.date_to,
            usernames: self.usernames.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filters().validate()
    }
}

/// Ids chosen for sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSelection {
    pub dataset_id: String,
    /// Number of visits that matched before sampling
    pub matched: usize,
    /// Selected ids, ascending
    pub ids: Vec<String>,
    pub visits: Option<Vec<SlimVisit>>,
}

impl SampleSelection {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Select from visits that already passed the filters.
///
/// Ids are deduplicated and sorted before sampling so that the choice
/// depends only on the matching id set and the seed.
pub fn select(dataset_id: &str, matching: Vec<SlimVisit>, criteria: &SamplingCriteria) -> SampleSelection {
    let mut ids: Vec<String> = matching.iter().map(|v| v.visit_id.clone()).collect();
    ids.sort();
    ids.dedup();
    let matched = ids.len();

    if let Some(size) = criteria.sample_size {
        if size < ids.len() {
            let mut rng = StdRng::seed_from_u64(criteria.seed);
            let mut chosen: Vec<String> = ids.choose_multiple(&mut rng, size).cloned().collect();
            chosen.sort();
            ids = chosen;
        }
    }

    let visits = criteria.include_visits.then(|| {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let mut visits: Vec<SlimVisit> = matching
            .into_iter()
            .filter(|v| wanted.contains(v.visit_id.as_str()) && seen.insert(v.visit_id.clone()))
            .collect();
        visits.sort_by(|a, b| a.visit_id.cmp(&b.visit_id));
        for (ordinal, visit) in visits.iter_mut().enumerate() {
            visit.ordinal = ordinal;
        }
        visits
    });

    SampleSelection {
        dataset_id: dataset_id.to_string(),
        matched,
        ids,
        visits,
    }
}

/// Filter slim visits then select
pub fn filter_and_select(dataset_id: &str, visits: Vec<SlimVisit>, criteria: &SamplingCriteria) -> SampleSelection {
    let filters = criteria.filters();
    let matching = visits.into_iter().filter(|v| filters.matches(v)).collect();
    select(dataset_id, matching, criteria)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn visits() -> Vec<SlimVisit> {
        (0..20)
            .map(|i| {
                let date = Utc.with_ymd_and_hms(2024, 3, 1 + i % 10, 9, 0, 0).unwrap();
                let status = if i % 4 == 0 { "rejected" } else { "approved" };
                let mut visit = SlimVisit::new(format!("v{:02}", i), format!("u{}", i % 3), status, date);
                visit.flagged = i % 5 == 0;
                visit
            })
            .collect()
    }

    #[test]
    fn test_filters_apply() {
        let criteria = SamplingCriteria::new().status("rejected");
        let selection = filter_and_select("d", visits(), &criteria);
        assert_eq!(selection.ids, vec!["v00", "v04", "v08", "v12", "v16"]);
        assert_eq!(selection.matched, 5);
        assert!(selection.visits.is_none());
    }

    #[test]
    fn test_sample_is_deterministic_and_order_independent() {
        let criteria = SamplingCriteria::new().sample(5, 42);
        let first = filter_and_select("d", visits(), &criteria);
        let mut reversed = visits();
        reversed.reverse();
        let second = filter_and_select("d", reversed, &criteria);

        assert_eq!(first.len(), 5);
        assert_eq!(first.matched, 20);
        assert_eq!(first.ids, second.ids);
        let mut sorted = first.ids.clone();
        sorted.sort();
        assert_eq!(first.ids, sorted);
    }

    #[test]
    fn test_sample_larger_than_matches_keeps_all() {
        let criteria = SamplingCriteria::new().flagged_only(true).sample(10, 1);
        let selection = filter_and_select("d", visits(), &criteria);
        assert_eq!(selection.ids, vec!["v00", "v05", "v10", "v15"]);
    }

    #[test]
    fn test_include_visits_follow_ids() {
        let criteria = SamplingCriteria::new().username("u1").include_visits(true);
        let selection = filter_and_select("d", visits(), &criteria);
        let visits = selection.visits.unwrap();
        let ids: Vec<&str> = visits.iter().map(|v| v.visit_id.as_str()).collect();
        assert_eq!(ids, selection.ids.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(visits.last().unwrap().ordinal, visits.len() - 1);
    }

    #[test]
    fn test_inverted_dates_rejected() {
        let from = NaiveDate::from_ymd_opt(2024, 3, 5);
        let to = NaiveDate::from_ymd_opt(2024, 3, 1);
        assert!(SamplingCriteria::new().date_range(from, to).validate().is_err());
    }
}
