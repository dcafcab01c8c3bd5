// ⏰ Vintage Model - point-in-time reconstruction of a series
//
// Every observation of a date is a vintage. Vintages are ranked by:
// 1. release_date (absent = available immediately, ranks lowest)
// 2. created_at (pending, not yet stamped = newest)
// 3. creation order within the series
//
// as_of keeps the highest-ranked vintage per date among those whose
// release_date does not exceed the cutoff.

use crate::entities::Observation;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

// ============================================================================
// RANKING
// ============================================================================

/// Total order over the vintages of one series
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VintageRank {
    release_date: Option<NaiveDate>,
    pending: bool,
    created_at: Option<DateTime<Utc>>,
    position: usize,
}

impl VintageRank {
    fn of(observation: &Observation, position: usize) -> Self {
        VintageRank {
            release_date: observation.release_date,
            pending: observation.created_at.is_none(),
            created_at: observation.created_at,
            position,
        }
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// The winning vintage per observed date, ascending by date.
///
/// `observations` must be in creation order (the order a TimeSeries holds them).
pub fn select_vintages(observations: &[Observation], cutoff: Option<NaiveDate>) -> Vec<&Observation> {
    let mut best: BTreeMap<NaiveDate, (VintageRank, &Observation)> = BTreeMap::new();

    for (position, observation) in observations.iter().enumerate() {
        if let Some(cutoff) = cutoff {
            if !observation.is_available_at(cutoff) {
                continue;
            }
        }

        let rank = VintageRank::of(observation, position);
        match best.get(&observation.observed_date) {
            Some((current, _)) if *current >= rank => {}
            _ => {
                best.insert(observation.observed_date, (rank, observation));
            }
        }
    }

    best.into_values().map(|(_, observation)| observation).collect()
}

/// Point-in-time view: one (date, value) per observed date
pub fn as_of(observations: &[Observation], cutoff: Option<NaiveDate>) -> Vec<(NaiveDate, f64)> {
    select_vintages(observations, cutoff)
        .into_iter()
        .map(|observation| (observation.observed_date, observation.value))
        .collect()
}

/// Every vintage, ordered by observed date then rank (oldest vintage first)
pub fn raw_ordered(observations: &[Observation]) -> Vec<&Observation> {
    let mut ranked: Vec<(NaiveDate, VintageRank, &Observation)> = observations
        .iter()
        .enumerate()
        .map(|(position, observation)| {
            (
                observation.observed_date,
                VintageRank::of(observation, position),
                observation,
            )
        })
        .collect();

    ranked.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    ranked.into_iter().map(|(_, _, observation)| observation).collect()
}

/// Revision history of one observed date, oldest vintage first
pub fn vintages(observations: &[Observation], observed_date: NaiveDate) -> Vec<&Observation> {
    raw_ordered(observations)
        .into_iter()
        .filter(|observation| observation.observed_date == observed_date)
        .collect()
}
