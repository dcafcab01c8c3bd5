// Entity Models
//
// Every entity lives in an id-indexed arena (see hierarchy::SeriesGraph).
// Relations between entities are keys into that arena, never owning pointers:
// - Group.parent / Group.members hold SeriesKey
// - TimeSeries.series_type holds TypeKey
// - Keywords are referenced by normalized text and resolved to rows on save

pub mod keyword;
pub mod observation;
pub mod series;

pub use keyword::{normalize_keyword, Keyword, KeywordRegistry, MAX_KEYWORD_LEN};
pub use observation::Observation;
pub use series::{
    DeltaType, Frequency, Group, Series, SeriesKind, SeriesVariant, TimeSeries, TimeSeriesType,
};

use serde::{Deserialize, Serialize};

/// Handle of a Group or TimeSeries inside a SeriesGraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey(pub(crate) usize);

/// Handle of a TimeSeriesType inside a SeriesGraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey(pub(crate) usize);

impl SeriesKey {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl TypeKey {
    pub fn index(&self) -> usize {
        self.0
    }
}
