use crate::config::{DatabaseLocation, StoreConfig};
use crate::entities::{DeltaType, Frequency, Observation, SeriesKind, TimeSeriesType};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

// ============================================================================
// CONNECTION
// ============================================================================

/// Open the configured database, apply connection pragmas and create the schema
pub fn open_connection(config: &StoreConfig) -> Result<Connection> {
    let conn = match &config.database {
        DatabaseLocation::InMemory => Connection::open_in_memory()?,
        DatabaseLocation::File { path } => Connection::open(path)?,
    };

    configure_connection(&conn, config)?;
    setup_database(&conn)?;

    Ok(conn)
}

/// Journal mode and busy timeout. In-memory databases keep their default journal.
pub fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

    if !config.is_in_memory() {
        // journal_mode answers with the mode actually in effect
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.as_str(),
            |row| row.get(0),
        )?;
        log::debug!("journal_mode = {}", mode);
    }

    Ok(())
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Cascades and references depend on it
    conn.pragma_update(None, "foreign_keys", true)?;

    // ==========================================================================
    // Keywords
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS keyword (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Time series types
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_series_type (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Series base + variant tables (joined on id)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS series_base (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('group', 'time_series')),
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS series_group (
            id INTEGER PRIMARY KEY REFERENCES series_base(id) ON DELETE CASCADE,
            code TEXT UNIQUE NOT NULL,
            parent_id INTEGER REFERENCES series_group(id) ON DELETE SET NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_series (
            id INTEGER PRIMARY KEY REFERENCES series_base(id) ON DELETE CASCADE,
            code TEXT UNIQUE NOT NULL,
            type_id INTEGER NOT NULL REFERENCES time_series_type(id),
            frequency TEXT NOT NULL DEFAULT 'M',
            delta_type TEXT NOT NULL DEFAULT 'percent'
        )",
        [],
    )?;

    // ==========================================================================
    // Observations (one row per vintage)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS observation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time_series_id INTEGER NOT NULL REFERENCES time_series(id) ON DELETE CASCADE,
            observed_date TEXT NOT NULL,
            value REAL NOT NULL,
            release_date TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Link tables
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_member (
            group_id INTEGER NOT NULL REFERENCES series_group(id) ON DELETE CASCADE,
            series_id INTEGER NOT NULL REFERENCES series_base(id) ON DELETE CASCADE,
            PRIMARY KEY (group_id, series_id),
            CHECK (group_id <> series_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS series_keyword (
            series_id INTEGER NOT NULL REFERENCES series_base(id) ON DELETE CASCADE,
            keyword_id INTEGER NOT NULL REFERENCES keyword(id),
            PRIMARY KEY (series_id, keyword_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observation_series_date
            ON observation(time_series_id, observed_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_parent ON series_group(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_member_series ON group_member(series_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// COLUMN CONVERSIONS
// ============================================================================

impl ToSql for SeriesKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SeriesKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        SeriesKind::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown series kind '{text}'").into()))
    }
}

impl ToSql for Frequency {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.code().into())
    }
}

impl FromSql for Frequency {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Frequency::from_code(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown frequency '{text}'").into()))
    }
}

impl ToSql for DeltaType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for DeltaType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        DeltaType::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown delta type '{text}'").into()))
    }
}

// ============================================================================
// TIME SERIES TYPES
// ============================================================================

fn type_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimeSeriesType> {
    let mut series_type = TimeSeriesType::new(row.get::<_, String>(1)?);
    series_type.id = Some(row.get(0)?);
    series_type.description = row.get(2)?;
    series_type.created_at = Some(row.get(3)?);
    series_type.updated_at = Some(row.get(4)?);
    Ok(series_type)
}

pub fn insert_type(conn: &Connection, series_type: &TimeSeriesType, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO time_series_type (name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![series_type.name, series_type.description, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_type(
    conn: &Connection,
    id: i64,
    series_type: &TimeSeriesType,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE time_series_type SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, series_type.name, series_type.description, now],
    )?;
    Ok(())
}

pub fn find_type(conn: &Connection, id: i64) -> Result<Option<TimeSeriesType>> {
    let series_type = conn
        .query_row(
            "SELECT id, name, description, created_at, updated_at
             FROM time_series_type WHERE id = ?1",
            params![id],
            type_from_row,
        )
        .optional()?;
    Ok(series_type)
}

pub fn find_type_by_name(conn: &Connection, name: &str) -> Result<Option<TimeSeriesType>> {
    let series_type = conn
        .query_row(
            "SELECT id, name, description, created_at, updated_at
             FROM time_series_type WHERE name = ?1",
            params![name],
            type_from_row,
        )
        .optional()?;
    Ok(series_type)
}

// ============================================================================
// SERIES ROWS
// ============================================================================

/// series_base row
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub id: i64,
    pub kind: SeriesKind,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    pub id: i64,
    pub code: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRow {
    pub id: i64,
    pub code: String,
    pub type_id: i64,
    pub frequency: Frequency,
    pub delta_type: DeltaType,
}

pub fn insert_series_base(
    conn: &Connection,
    kind: SeriesKind,
    name: &str,
    description: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO series_base (kind, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![kind, name, description, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_series_base(
    conn: &Connection,
    id: i64,
    name: &str,
    description: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE series_base SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, name, description, now],
    )?;
    Ok(())
}

pub fn insert_group_row(conn: &Connection, id: i64, code: &str, parent_id: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT INTO series_group (id, code, parent_id) VALUES (?1, ?2, ?3)",
        params![id, code, parent_id],
    )?;
    Ok(())
}

pub fn update_group_row(conn: &Connection, id: i64, code: &str, parent_id: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE series_group SET code = ?2, parent_id = ?3 WHERE id = ?1",
        params![id, code, parent_id],
    )?;
    Ok(())
}

pub fn insert_time_series_row(conn: &Connection, row: &TimeSeriesRow) -> Result<()> {
    conn.execute(
        "INSERT INTO time_series (id, code, type_id, frequency, delta_type)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![row.id, row.code, row.type_id, row.frequency, row.delta_type],
    )?;
    Ok(())
}

pub fn update_time_series_row(conn: &Connection, row: &TimeSeriesRow) -> Result<()> {
    conn.execute(
        "UPDATE time_series SET code = ?2, type_id = ?3, frequency = ?4, delta_type = ?5
         WHERE id = ?1",
        params![row.id, row.code, row.type_id, row.frequency, row.delta_type],
    )?;
    Ok(())
}

pub fn find_series_row(conn: &Connection, id: i64) -> Result<Option<SeriesRow>> {
    let row = conn
        .query_row(
            "SELECT id, kind, name, description, created_at, updated_at
             FROM series_base WHERE id = ?1",
            params![id],
            |row| {
                Ok(SeriesRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn find_group_row(conn: &Connection, id: i64) -> Result<Option<GroupRow>> {
    let row = conn
        .query_row(
            "SELECT id, code, parent_id FROM series_group WHERE id = ?1",
            params![id],
            |row| {
                Ok(GroupRow {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    parent_id: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn find_time_series_row(conn: &Connection, id: i64) -> Result<Option<TimeSeriesRow>> {
    let row = conn
        .query_row(
            "SELECT id, code, type_id, frequency, delta_type FROM time_series WHERE id = ?1",
            params![id],
            |row| {
                Ok(TimeSeriesRow {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    type_id: row.get(2)?,
                    frequency: row.get(3)?,
                    delta_type: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn find_group_id_by_code(conn: &Connection, code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM series_group WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn find_time_series_id_by_code(conn: &Connection, code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM time_series WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn delete_series(conn: &Connection, id: i64) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM series_base WHERE id = ?1", params![id])?;
    Ok(deleted)
}

// ============================================================================
// RELATIONS
// ============================================================================

fn collect_ids(conn: &Connection, sql: &str, id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub fn child_group_ids(conn: &Connection, parent_id: i64) -> Result<Vec<i64>> {
    collect_ids(
        conn,
        "SELECT id FROM series_group WHERE parent_id = ?1 ORDER BY id",
        parent_id,
    )
}

pub fn member_ids(conn: &Connection, group_id: i64) -> Result<Vec<i64>> {
    collect_ids(
        conn,
        "SELECT series_id FROM group_member WHERE group_id = ?1 ORDER BY series_id",
        group_id,
    )
}

pub fn group_ids_containing(conn: &Connection, series_id: i64) -> Result<Vec<i64>> {
    collect_ids(
        conn,
        "SELECT group_id FROM group_member WHERE series_id = ?1 ORDER BY group_id",
        series_id,
    )
}

/// Make the stored membership of `group_id` exactly `series_ids`
pub fn replace_members(conn: &Connection, group_id: i64, series_ids: &[i64]) -> Result<()> {
    conn.execute("DELETE FROM group_member WHERE group_id = ?1", params![group_id])?;

    let mut stmt = conn.prepare("INSERT INTO group_member (group_id, series_id) VALUES (?1, ?2)")?;
    for series_id in series_ids {
        stmt.execute(params![group_id, series_id])?;
    }
    Ok(())
}

/// Make the stored keyword links of `series_id` exactly `keyword_ids`
pub fn replace_keywords(conn: &Connection, series_id: i64, keyword_ids: &[i64]) -> Result<()> {
    conn.execute(
        "DELETE FROM series_keyword WHERE series_id = ?1",
        params![series_id],
    )?;

    let mut stmt =
        conn.prepare("INSERT INTO series_keyword (series_id, keyword_id) VALUES (?1, ?2)")?;
    for keyword_id in keyword_ids {
        stmt.execute(params![series_id, keyword_id])?;
    }
    Ok(())
}

pub fn keyword_texts_for(conn: &Connection, series_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT k.text FROM series_keyword sk
         JOIN keyword k ON k.id = sk.keyword_id
         WHERE sk.series_id = ?1
         ORDER BY k.text",
    )?;
    let texts = stmt
        .query_map(params![series_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(texts)
}

// ============================================================================
// OBSERVATIONS
// ============================================================================

pub fn insert_observation(
    conn: &Connection,
    time_series_id: i64,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO observation (time_series_id, observed_date, value, release_date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            time_series_id,
            observation.observed_date,
            observation.value,
            observation.release_date,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Every stored vintage of a time series, in creation (id) order
pub fn observations_for(conn: &Connection, time_series_id: i64) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare(
        "SELECT id, observed_date, value, release_date, created_at
         FROM observation WHERE time_series_id = ?1
         ORDER BY id",
    )?;

    let observations = stmt
        .query_map(params![time_series_id], |row| {
            Ok(Observation {
                id: Some(row.get(0)?),
                observed_date: row.get(1)?,
                value: row.get(2)?,
                release_date: row.get(3)?,
                created_at: Some(row.get(4)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(observations)
}

// ============================================================================
// COUNTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredTable {
    Keyword,
    TimeSeriesType,
    SeriesBase,
    Group,
    TimeSeries,
    Observation,
    GroupMember,
    SeriesKeyword,
}

impl StoredTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            StoredTable::Keyword => "keyword",
            StoredTable::TimeSeriesType => "time_series_type",
            StoredTable::SeriesBase => "series_base",
            StoredTable::Group => "series_group",
            StoredTable::TimeSeries => "time_series",
            StoredTable::Observation => "observation",
            StoredTable::GroupMember => "group_member",
            StoredTable::SeriesKeyword => "series_keyword",
        }
    }
}

pub fn count_rows(conn: &Connection, table: StoredTable) -> Result<i64> {
    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.table_name()),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn insert_ts(conn: &Connection, code: &str) -> i64 {
        let now = Utc::now();
        let type_id = match find_type_by_name(conn, "Price").unwrap() {
            Some(existing) => existing.id.unwrap(),
            None => insert_type(conn, &TimeSeriesType::new("Price"), now).unwrap(),
        };
        let id = insert_series_base(conn, SeriesKind::TimeSeries, code, None, now).unwrap();
        insert_time_series_row(
            conn,
            &TimeSeriesRow {
                id,
                code: code.to_string(),
                type_id,
                frequency: Frequency::Daily,
                delta_type: DeltaType::Absolute,
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn test_setup_is_repeatable() {
        let conn = test_db();
        setup_database(&conn).unwrap();
        assert_eq!(count_rows(&conn, StoredTable::SeriesBase).unwrap(), 0);
    }

    #[test]
    fn test_time_series_row_round_trip() {
        let conn = test_db();
        let id = insert_ts(&conn, "PX");

        let base = find_series_row(&conn, id).unwrap().unwrap();
        assert_eq!(base.kind, SeriesKind::TimeSeries);
        assert_eq!(base.created_at, base.updated_at);

        let row = find_time_series_row(&conn, id).unwrap().unwrap();
        assert_eq!(row.code, "PX");
        assert_eq!(row.frequency, Frequency::Daily);
        assert_eq!(row.delta_type, DeltaType::Absolute);

        assert_eq!(find_time_series_id_by_code(&conn, "PX").unwrap(), Some(id));
        assert_eq!(find_group_id_by_code(&conn, "PX").unwrap(), None);
    }

    #[test]
    fn test_duplicate_type_name_is_rejected() {
        let conn = test_db();
        let now = Utc::now();
        insert_type(&conn, &TimeSeriesType::new("Price"), now).unwrap();

        let result = insert_type(&conn, &TimeSeriesType::new("Price"), now);
        assert!(matches!(
            result,
            Err(crate::error::SeriesError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_self_membership_rejected_by_schema() {
        let conn = test_db();
        let now = Utc::now();
        let group_id = insert_series_base(&conn, SeriesKind::Group, "G", None, now).unwrap();
        insert_group_row(&conn, group_id, "G", None).unwrap();

        let result = replace_members(&conn, group_id, &[group_id]);
        assert!(matches!(
            result,
            Err(crate::error::SeriesError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_delete_series_cascades() {
        let conn = test_db();
        let now = Utc::now();
        let ts_id = insert_ts(&conn, "PX");
        let group_id = insert_series_base(&conn, SeriesKind::Group, "G", None, now).unwrap();
        insert_group_row(&conn, group_id, "G", None).unwrap();
        replace_members(&conn, group_id, &[ts_id]).unwrap();

        let obs = Observation::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 1.5, None).unwrap();
        insert_observation(&conn, ts_id, &obs, now).unwrap();
        insert_observation(&conn, ts_id, &obs, now).unwrap();

        assert_eq!(delete_series(&conn, ts_id).unwrap(), 1);

        assert_eq!(count_rows(&conn, StoredTable::TimeSeries).unwrap(), 0);
        assert_eq!(count_rows(&conn, StoredTable::Observation).unwrap(), 0);
        assert_eq!(count_rows(&conn, StoredTable::GroupMember).unwrap(), 0);
        // Shared type survives
        assert_eq!(count_rows(&conn, StoredTable::TimeSeriesType).unwrap(), 1);
    }

    #[test]
    fn test_deleting_parent_detaches_children() {
        let conn = test_db();
        let now = Utc::now();
        let parent = insert_series_base(&conn, SeriesKind::Group, "P", None, now).unwrap();
        insert_group_row(&conn, parent, "P", None).unwrap();
        let child = insert_series_base(&conn, SeriesKind::Group, "C", None, now).unwrap();
        insert_group_row(&conn, child, "C", Some(parent)).unwrap();

        assert_eq!(child_group_ids(&conn, parent).unwrap(), vec![child]);

        delete_series(&conn, parent).unwrap();
        let row = find_group_row(&conn, child).unwrap().unwrap();
        assert_eq!(row.parent_id, None);
    }

    #[test]
    fn test_observations_preserve_dates_and_order() {
        let conn = test_db();
        let ts_id = insert_ts(&conn, "PX");
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();

        let first = Observation::new(d(2), 10.0, Some(d(5))).unwrap();
        let second = Observation::new(d(1), 11.0, None).unwrap();
        insert_observation(&conn, ts_id, &first, Utc::now()).unwrap();
        insert_observation(&conn, ts_id, &second, Utc::now()).unwrap();

        let stored = observations_for(&conn, ts_id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].observed_date, d(2));
        assert_eq!(stored[0].release_date, Some(d(5)));
        assert_eq!(stored[1].release_date, None);
        assert!(stored.iter().all(|o| o.id.is_some() && o.created_at.is_some()));
    }
}
