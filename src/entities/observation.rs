// 📈 Observation - one vintage of one observed date
//
// Observations are immutable once persisted. A revision is a NEW observation
// for the same observed_date, distinguished by release_date and created_at.

use crate::error::{Result, SeriesError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Row id; None until the observation is persisted
    pub id: Option<i64>,

    /// The date the value describes
    pub observed_date: NaiveDate,

    pub value: f64,

    /// Publication date of this vintage. None = not formally published,
    /// treated as available immediately
    pub release_date: Option<NaiveDate>,

    /// Stamped by the store on insert; None while pending
    pub created_at: Option<DateTime<Utc>>,
}

impl Observation {
    /// Create a pending observation. Non-finite values are rejected.
    pub fn new(observed_date: NaiveDate, value: f64, release_date: Option<NaiveDate>) -> Result<Self> {
        if !value.is_finite() {
            return Err(SeriesError::InvalidValue(format!(
                "observation for {observed_date} is not finite: {value}"
            )));
        }

        Ok(Observation {
            id: None,
            observed_date,
            value,
            release_date,
            created_at: None,
        })
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Whether this vintage was available at a cutoff release date
    pub fn is_available_at(&self, cutoff: NaiveDate) -> bool {
        self.release_date.map_or(true, |released| released <= cutoff)
    }
}
