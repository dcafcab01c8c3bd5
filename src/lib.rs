// Vintage Series Store - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod hierarchy;
pub mod persistence;
pub mod search;
pub mod tabular;
pub mod temporal;

// Re-export commonly used types
pub use config::{DatabaseLocation, Environment, StoreConfig};
pub use db::{open_connection, setup_database, StoredTable};
pub use entities::{
    normalize_keyword, DeltaType, Frequency, Group, Keyword, KeywordRegistry, Observation,
    Series, SeriesKey, SeriesKind, SeriesVariant, TimeSeries, TimeSeriesType, TypeKey,
};
pub use error::{Result, SeriesError};
pub use hierarchy::{Descendants, SeriesGraph};
pub use persistence::{plan, EntityRef, SaveOptions, Session, WritePlan, WriteStep};
pub use search::{search, SearchHit, SearchQuery};
pub use tabular::{
    ingest, project, Cell, Column, ColumnSelector, DescriptionOverride, GroupAssignment,
    IngestOptions, Ingested, NameOverride, ProjectOptions, Table,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
