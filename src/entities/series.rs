// 🗂️ Series Entities - Group and TimeSeries over a common base
//
// The base (name, description, timestamps, keywords) is shared; the variant
// payload is a closed enum. Kind is fixed at construction.
//
// Group:      code, optional parent Group, set of member series
// TimeSeries: code, type, frequency, delta type, owned observations

use super::observation::Observation;
use super::{SeriesKey, TypeKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// SERIES KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKind {
    Group,
    TimeSeries,
}

impl SeriesKind {
    /// Discriminator stored in series_base.kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesKind::Group => "group",
            SeriesKind::TimeSeries => "time_series",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(SeriesKind::Group),
            "time_series" => Some(SeriesKind::TimeSeries),
            _ => None,
        }
    }

    /// Display label ("Group" / "TimeSeries")
    pub fn label(&self) -> &'static str {
        match self {
            SeriesKind::Group => "Group",
            SeriesKind::TimeSeries => "TimeSeries",
        }
    }
}

// ============================================================================
// FREQUENCY / DELTA TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

impl Frequency {
    /// Period code
    pub fn code(&self) -> &'static str {
        match self {
            Frequency::Daily => "D",
            Frequency::Weekly => "W",
            Frequency::Monthly => "M",
            Frequency::Quarterly => "Q",
            Frequency::Annual => "A",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().as_str() {
            "D" => Some(Frequency::Daily),
            "W" => Some(Frequency::Weekly),
            "M" => Some(Frequency::Monthly),
            "Q" => Some(Frequency::Quarterly),
            "A" | "Y" => Some(Frequency::Annual),
            _ => None,
        }
    }
}

/// How period-over-period changes of the series are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeltaType {
    #[default]
    Percent,
    Absolute,
    Log,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Percent => "percent",
            DeltaType::Absolute => "absolute",
            DeltaType::Log => "log",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "percent" | "pct" => Some(DeltaType::Percent),
            "absolute" | "abs" => Some(DeltaType::Absolute),
            "log" => Some(DeltaType::Log),
            _ => None,
        }
    }
}

// ============================================================================
// TIME SERIES TYPE
// ============================================================================

/// Shared classification of time series (e.g. "Price", "Volume")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesType {
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl TimeSeriesType {
    pub fn new(name: impl Into<String>) -> Self {
        TimeSeriesType {
            id: None,
            name: name.into(),
            description: None,
            created_at: None,
            updated_at: None,
            dirty: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

// ============================================================================
// VARIANTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub code: String,
    pub parent: Option<SeriesKey>,
    /// Many-to-many membership, independent of parent nesting
    pub members: BTreeSet<SeriesKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub code: String,
    pub series_type: TypeKey,
    pub frequency: Frequency,
    pub delta_type: DeltaType,
    /// Every vintage, in creation order
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeriesVariant {
    Group(Group),
    TimeSeries(TimeSeries),
}

// ============================================================================
// SERIES (BASE)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Row id in series_base; None until persisted
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Normalized keyword texts
    pub keywords: BTreeSet<String>,

    pub variant: SeriesVariant,

    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl Series {
    /// Draft Group (not validated until saved or created through a Session)
    pub fn group(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::with_variant(
            name.into(),
            SeriesVariant::Group(Group {
                code: code.into(),
                parent: None,
                members: BTreeSet::new(),
            }),
        )
    }

    /// Draft TimeSeries with default frequency (monthly) and delta type (percent)
    pub fn time_series(name: impl Into<String>, code: impl Into<String>, series_type: TypeKey) -> Self {
        Self::with_variant(
            name.into(),
            SeriesVariant::TimeSeries(TimeSeries {
                code: code.into(),
                series_type,
                frequency: Frequency::default(),
                delta_type: DeltaType::default(),
                observations: Vec::new(),
            }),
        )
    }

    fn with_variant(name: String, variant: SeriesVariant) -> Self {
        Series {
            id: None,
            name,
            description: None,
            created_at: None,
            updated_at: None,
            keywords: BTreeSet::new(),
            variant,
            dirty: false,
        }
    }

    /// Builder: description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: parent group (no effect on a TimeSeries)
    pub fn with_parent(mut self, parent: SeriesKey) -> Self {
        if let SeriesVariant::Group(group) = &mut self.variant {
            group.parent = Some(parent);
        }
        self
    }

    /// Builder: frequency (no effect on a Group)
    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        if let SeriesVariant::TimeSeries(ts) = &mut self.variant {
            ts.frequency = frequency;
        }
        self
    }

    /// Builder: delta type (no effect on a Group)
    pub fn with_delta_type(mut self, delta_type: DeltaType) -> Self {
        if let SeriesVariant::TimeSeries(ts) = &mut self.variant {
            ts.delta_type = delta_type;
        }
        self
    }

    pub fn kind(&self) -> SeriesKind {
        match self.variant {
            SeriesVariant::Group(_) => SeriesKind::Group,
            SeriesVariant::TimeSeries(_) => SeriesKind::TimeSeries,
        }
    }

    pub fn code(&self) -> &str {
        match &self.variant {
            SeriesVariant::Group(group) => &group.code,
            SeriesVariant::TimeSeries(ts) => &ts.code,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match &self.variant {
            SeriesVariant::Group(group) => Some(group),
            SeriesVariant::TimeSeries(_) => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.variant {
            SeriesVariant::Group(group) => Some(group),
            SeriesVariant::TimeSeries(_) => None,
        }
    }

    pub fn as_time_series(&self) -> Option<&TimeSeries> {
        match &self.variant {
            SeriesVariant::TimeSeries(ts) => Some(ts),
            SeriesVariant::Group(_) => None,
        }
    }

    pub fn as_time_series_mut(&mut self) -> Option<&mut TimeSeries> {
        match &mut self.variant {
            SeriesVariant::TimeSeries(ts) => Some(ts),
            SeriesVariant::Group(_) => None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// New rows and rows with unsaved changes
    pub fn needs_write(&self) -> bool {
        self.id.is_none() || self.dirty
    }
}
