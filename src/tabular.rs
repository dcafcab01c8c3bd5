// 📊 Tabular Bridge - rectangular tables in, series out (and back)
//
// ingest:  Table -> unsaved TimeSeries (one per value column) in a SeriesGraph
// project: TimeSeries -> point-in-time Table indexed by observed date
//
// Every shape check runs before the graph is touched.

use crate::entities::{Frequency, Observation, Series, SeriesKey, SeriesKind, TypeKey};
use crate::error::{Result, SeriesError};
use crate::hierarchy::SeriesGraph;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;

/// Name of the date axis column on CSV output
pub const DATE_COLUMN: &str = "date";

/// Accepted textual date layouts, tried in order
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Number(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Text(String),
    Null,
}

impl Cell {
    /// Interpret a raw text field: empty, number, date, timestamp, else text
    pub fn parse(raw: &str) -> Cell {
        let raw = raw.trim();
        if raw.is_empty() {
            return Cell::Null;
        }
        if let Ok(number) = raw.parse::<f64>() {
            return Cell::Number(number);
        }
        if let Some(date) = parse_date(raw) {
            return Cell::Date(date);
        }
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
            return Cell::Timestamp(timestamp.with_timezone(&Utc));
        }
        Cell::Text(raw.to_string())
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(date) => Some(*date),
            Cell::Timestamp(timestamp) => Some(timestamp.date_naive()),
            Cell::Text(text) => parse_date(text),
            Cell::Number(_) | Cell::Null => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Cell::Number(number) => number.to_string(),
            Cell::Date(date) => date.format("%Y-%m-%d").to_string(),
            Cell::Timestamp(timestamp) => timestamp.to_rfc3339(),
            Cell::Text(text) => text.clone(),
            Cell::Null => String::new(),
        }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub cells: Vec<Cell>,
}

impl Column {
    pub fn new(name: impl Into<String>, cells: Vec<Cell>) -> Self {
        Column {
            name: name.into(),
            cells,
        }
    }

    pub fn numbers(name: impl Into<String>, values: &[f64]) -> Self {
        Self::new(name, values.iter().map(|v| Cell::Number(*v)).collect())
    }

    pub fn dates(name: impl Into<String>, values: &[NaiveDate]) -> Self {
        Self::new(name, values.iter().map(|d| Cell::Date(*d)).collect())
    }
}

/// Named columns of equal length, optionally indexed by date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableParts")]
pub struct Table {
    index: Option<Vec<NaiveDate>>,
    columns: Vec<Column>,
}

/// Deserialized shape, checked through `Table::new` before use
#[derive(Deserialize)]
struct TableParts {
    index: Option<Vec<NaiveDate>>,
    columns: Vec<Column>,
}

impl TryFrom<TableParts> for Table {
    type Error = SeriesError;

    fn try_from(parts: TableParts) -> Result<Self> {
        let table = Table::new(parts.columns)?;
        match parts.index {
            Some(index) => table.with_index(index),
            None => Ok(table),
        }
    }
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let rows = first.cells.len();
            if let Some(ragged) = columns.iter().find(|c| c.cells.len() != rows) {
                return Err(SeriesError::InvalidTable(format!(
                    "column '{}' has {} rows, expected {}",
                    ragged.name,
                    ragged.cells.len(),
                    rows
                )));
            }
        }

        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(SeriesError::InvalidTable(format!(
                "duplicate column '{}'",
                dup.name
            )));
        }

        Ok(Table {
            index: None,
            columns,
        })
    }

    /// Attach a date row index
    pub fn with_index(mut self, index: Vec<NaiveDate>) -> Result<Self> {
        if !self.columns.is_empty() && index.len() != self.row_count() {
            return Err(SeriesError::InvalidTable(format!(
                "index has {} rows, columns have {}",
                index.len(),
                self.row_count()
            )));
        }
        self.index = Some(index);
        Ok(self)
    }

    pub fn index(&self) -> Option<&[NaiveDate]> {
        self.index.as_deref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        match self.columns.first() {
            Some(column) => column.cells.len(),
            None => self.index.as_ref().map_or(0, Vec::len),
        }
    }

    // ========================================================================
    // CSV
    // ========================================================================

    /// Read a headed CSV; every field is typed with `Cell::parse`
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        if headers.is_empty() {
            return Err(SeriesError::InvalidTable("CSV has no header".to_string()));
        }

        let mut cells: Vec<Vec<Cell>> = vec![Vec::new(); headers.len()];
        for record in rdr.records() {
            let record = record?;
            for (column, field) in cells.iter_mut().zip(record.iter()) {
                column.push(Cell::parse(field));
            }
        }

        let columns = headers
            .into_iter()
            .zip(cells)
            .map(|(name, cells)| Column::new(name, cells))
            .collect();
        Self::new(columns)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            SeriesError::InvalidTable(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::from_csv_reader(file)
    }

    /// Write as CSV; the index (if any) becomes a leading "date" column
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header: Vec<&str> = Vec::new();
        if self.index.is_some() {
            header.push(DATE_COLUMN);
        }
        header.extend(self.column_names());
        wtr.write_record(&header)?;

        for row in 0..self.row_count() {
            let mut record: Vec<String> = Vec::with_capacity(header.len());
            if let Some(index) = &self.index {
                record.push(index[row].format("%Y-%m-%d").to_string());
            }
            for column in &self.columns {
                record.push(column.cells[row].render());
            }
            wtr.write_record(&record)?;
        }

        wtr.flush().map_err(|e| SeriesError::TableIo(e.into()))?;
        Ok(())
    }
}

// ============================================================================
// INGEST OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ColumnSelector {
    /// Every column except the date axis
    #[default]
    All,
    Named(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupAssignment {
    /// One group for every resulting series
    Single(SeriesKey),
    /// One group per selected column, in column order
    PerColumn(Vec<SeriesKey>),
    /// Every listed group for every resulting series
    Broadcast(Vec<SeriesKey>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NameOverride {
    Single(String),
    PerColumn(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DescriptionOverride {
    /// Same description on every resulting series
    Shared(String),
    /// One description per selected column, in column order
    PerColumn(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub columns: ColumnSelector,
    pub date_column: Option<String>,
    pub groups: Option<GroupAssignment>,
    pub series_type: TypeKey,
    pub names: Option<NameOverride>,
    pub descriptions: Option<DescriptionOverride>,
    pub frequency: Option<Frequency>,
}

impl IngestOptions {
    pub fn new(series_type: TypeKey) -> Self {
        IngestOptions {
            columns: ColumnSelector::All,
            date_column: None,
            groups: None,
            series_type,
            names: None,
            descriptions: None,
            frequency: None,
        }
    }

    pub fn with_columns(mut self, columns: ColumnSelector) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_date_column(mut self, name: impl Into<String>) -> Self {
        self.date_column = Some(name.into());
        self
    }

    pub fn with_groups(mut self, groups: GroupAssignment) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_names(mut self, names: NameOverride) -> Self {
        self.names = Some(names);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.descriptions = Some(DescriptionOverride::Shared(description.into()));
        self
    }

    pub fn with_descriptions(mut self, descriptions: Vec<String>) -> Self {
        self.descriptions = Some(DescriptionOverride::PerColumn(descriptions));
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Single(SeriesKey),
    Many(Vec<SeriesKey>),
}

impl Ingested {
    pub fn keys(&self) -> Vec<SeriesKey> {
        match self {
            Ingested::Single(key) => vec![*key],
            Ingested::Many(keys) => keys.clone(),
        }
    }
}

// ============================================================================
// INGEST
// ============================================================================

/// Validated plan for one output series
struct PendingSeries {
    name: String,
    code: String,
    description: Option<String>,
    groups: Vec<SeriesKey>,
    observations: Vec<Observation>,
}

fn resolve_dates(table: &Table, options: &IngestOptions) -> Result<(Option<String>, Vec<NaiveDate>)> {
    let date_column = match &options.date_column {
        Some(name) => Some(table.column(name).ok_or_else(|| {
            SeriesError::MissingDateAxis(format!("date column '{name}' not found"))
        })?),
        None => table
            .columns()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(DATE_COLUMN)),
    };

    match date_column {
        Some(column) => {
            let dates = column
                .cells
                .iter()
                .enumerate()
                .map(|(row, cell)| {
                    cell.as_date().ok_or_else(|| {
                        SeriesError::InvalidValue(format!(
                            "row {row} of '{}' is not a date: {cell:?}",
                            column.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((Some(column.name.clone()), dates))
        }
        None => match table.index() {
            Some(index) => Ok((None, index.to_vec())),
            None => Err(SeriesError::MissingDateAxis(
                "no date column and no date index".to_string(),
            )),
        },
    }
}

fn resolve_columns<'t>(
    table: &'t Table,
    selector: &ColumnSelector,
    date_column: Option<&str>,
) -> Result<Vec<&'t Column>> {
    let selected: Vec<&Column> = match selector {
        // A conventional "date" column is never a value column, even when
        // another column was chosen as the axis
        ColumnSelector::All => table
            .columns()
            .iter()
            .filter(|c| Some(c.name.as_str()) != date_column)
            .filter(|c| !c.name.eq_ignore_ascii_case(DATE_COLUMN))
            .collect(),
        ColumnSelector::Named(names) => names
            .iter()
            .map(|name| {
                if Some(name.as_str()) == date_column {
                    return Err(SeriesError::InvalidTable(format!(
                        "'{name}' is the date axis, not a value column"
                    )));
                }
                table
                    .column(name)
                    .ok_or_else(|| SeriesError::UnresolvedReference(format!("column '{name}'")))
            })
            .collect::<Result<Vec<_>>>()?,
    };

    if selected.is_empty() {
        return Err(SeriesError::InvalidTable("no value columns selected".to_string()));
    }
    Ok(selected)
}

fn resolve_names(columns: &[&Column], names: Option<&NameOverride>) -> Result<Vec<String>> {
    let expected = columns.len();
    match names {
        None => Ok(columns.iter().map(|c| c.name.clone()).collect()),
        Some(NameOverride::Single(name)) if expected == 1 => Ok(vec![name.clone()]),
        Some(NameOverride::Single(_)) => Err(SeriesError::NameCardinalityMismatch { expected, got: 1 }),
        Some(NameOverride::PerColumn(names)) if names.len() == expected => Ok(names.clone()),
        Some(NameOverride::PerColumn(names)) => Err(SeriesError::NameCardinalityMismatch {
            expected,
            got: names.len(),
        }),
    }
}

fn resolve_descriptions(
    count: usize,
    descriptions: Option<&DescriptionOverride>,
) -> Result<Vec<Option<String>>> {
    match descriptions {
        None => Ok(vec![None; count]),
        Some(DescriptionOverride::Shared(text)) => Ok(vec![Some(text.clone()); count]),
        Some(DescriptionOverride::PerColumn(texts)) if texts.len() == count => {
            Ok(texts.iter().cloned().map(Some).collect())
        }
        Some(DescriptionOverride::PerColumn(texts)) => Err(SeriesError::InvalidValue(format!(
            "expected {count} descriptions, got {}",
            texts.len()
        ))),
    }
}

fn resolve_groups(
    graph: &SeriesGraph,
    count: usize,
    groups: Option<&GroupAssignment>,
) -> Result<Vec<Vec<SeriesKey>>> {
    let per_series = match groups {
        None => vec![Vec::new(); count],
        Some(GroupAssignment::Single(group)) => vec![vec![*group]; count],
        Some(GroupAssignment::Broadcast(groups)) => vec![groups.clone(); count],
        Some(GroupAssignment::PerColumn(groups)) if groups.len() == count => {
            groups.iter().map(|group| vec![*group]).collect()
        }
        Some(GroupAssignment::PerColumn(groups)) => {
            return Err(SeriesError::GroupCardinalityMismatch {
                expected: count,
                got: groups.len(),
            })
        }
    };

    for group in per_series.iter().flatten() {
        if graph.get(*group)?.kind() != SeriesKind::Group {
            return Err(SeriesError::UnresolvedReference(format!(
                "series key {} is not a group",
                group.index()
            )));
        }
    }
    Ok(per_series)
}

fn column_observations(column: &Column, dates: &[NaiveDate]) -> Result<Vec<Observation>> {
    let mut observations = Vec::with_capacity(dates.len());

    for (date, cell) in dates.iter().zip(&column.cells) {
        match cell {
            Cell::Number(value) => observations.push(Observation::new(*date, *value, None)?),
            // Missing values produce no vintage
            Cell::Null => {}
            other => {
                return Err(SeriesError::InvalidValue(format!(
                    "column '{}' on {date} is not numeric: {other:?}",
                    column.name
                )))
            }
        }
    }

    Ok(observations)
}

/// Build unsaved time series from `table`: one per selected value column,
/// one initial vintage (no release date) per row. Codes are the column headers.
pub fn ingest(graph: &mut SeriesGraph, table: &Table, options: &IngestOptions) -> Result<Ingested> {
    graph.series_type(options.series_type)?;

    let (date_column, dates) = resolve_dates(table, options)?;
    let columns = resolve_columns(table, &options.columns, date_column.as_deref())?;
    let names = resolve_names(&columns, options.names.as_ref())?;
    let descriptions = resolve_descriptions(columns.len(), options.descriptions.as_ref())?;
    let groups = resolve_groups(graph, columns.len(), options.groups.as_ref())?;

    let mut pending = Vec::with_capacity(columns.len());
    for (((column, name), description), groups) in
        columns.iter().zip(names).zip(descriptions).zip(groups)
    {
        if graph.find_time_series_by_code(&column.name).is_some() {
            return Err(SeriesError::ConstraintViolation(format!(
                "time series code '{}' already exists",
                column.name
            )));
        }
        pending.push(PendingSeries {
            name,
            code: column.name.clone(),
            description,
            groups,
            observations: column_observations(column, &dates)?,
        });
    }

    // Validated; now mutate the graph
    let mut keys = Vec::with_capacity(pending.len());
    for series in pending {
        let mut draft = Series::time_series(series.name, series.code, options.series_type)
            .with_frequency(options.frequency.unwrap_or_default());
        if let Some(description) = series.description {
            draft = draft.with_description(description);
        }
        if let Some(payload) = draft.as_time_series_mut() {
            payload.observations = series.observations;
        }

        let key = graph.insert(draft)?;
        for group in series.groups {
            graph.add_member(group, key)?;
        }
        keys.push(key);
    }

    log::info!(
        "ingested {} series from {} rows",
        keys.len(),
        dates.len()
    );

    if keys.len() == 1 {
        Ok(Ingested::Single(keys[0]))
    } else {
        Ok(Ingested::Many(keys))
    }
}

// ============================================================================
// PROJECT
// ============================================================================

/// Metadata column names on projected tables
pub const RELEASE_DATE_COLUMN: &str = "release_date";
pub const CREATED_AT_COLUMN: &str = "created_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectOptions {
    pub cutoff: Option<NaiveDate>,
    pub include_release_date: bool,
    pub include_created_at: bool,
    /// Every vintage, one row each, instead of one row per date.
    /// `cutoff` does not apply.
    pub all_vintages: bool,
}

/// Metadata column name; prefixed with an underscore while it equals the
/// value column's name
fn metadata_column_name(series_name: &str, base: &str) -> String {
    let mut name = base.to_string();
    while name == series_name {
        name.insert(0, '_');
    }
    name
}

/// Point-in-time view of a time series as a table indexed by observed date.
/// With `all_vintages` the index repeats a date once per revision.
pub fn project(graph: &SeriesGraph, series: SeriesKey, options: &ProjectOptions) -> Result<Table> {
    let name = graph.get(series)?.name.clone();
    let selected = if options.all_vintages {
        graph.raw_observations(series)?
    } else {
        graph.selected_vintages(series, options.cutoff)?
    };

    let release_date_column = metadata_column_name(&name, RELEASE_DATE_COLUMN);
    let created_at_column = metadata_column_name(&name, CREATED_AT_COLUMN);

    let index: Vec<NaiveDate> = selected.iter().map(|o| o.observed_date).collect();
    let mut columns = vec![Column::new(
        name,
        selected.iter().map(|o| Cell::Number(o.value)).collect(),
    )];

    if options.include_release_date {
        columns.push(Column::new(
            release_date_column,
            selected
                .iter()
                .map(|o| o.release_date.map_or(Cell::Null, Cell::Date))
                .collect(),
        ));
    }
    if options.include_created_at {
        columns.push(Column::new(
            created_at_column,
            selected
                .iter()
                .map(|o| o.created_at.map_or(Cell::Null, Cell::Timestamp))
                .collect(),
        ));
    }

    Table::new(columns)?.with_index(index)
}
