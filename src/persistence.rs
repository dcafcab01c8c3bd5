// 💾 Session - cascading persistence of a SeriesGraph into SQLite
//
// save(entity) works in two phases:
// 1. plan: compute the dependency closure of the entity and order the writes
//    (types -> groups, parents first -> time series -> membership links ->
//    keyword links -> observations). The plan is a plain value.
// 2. apply: execute the plan inside the session transaction, stamping ids and
//    timestamps back into the graph.
//
// A failure anywhere rolls back the whole open transaction and restores the
// graph to its state when the transaction began.

use crate::config::StoreConfig;
use crate::db;
use crate::entities::{
    DeltaType, Frequency, Keyword, KeywordRegistry, Series, SeriesKey, SeriesKind, SeriesVariant,
    TypeKey,
};
use crate::error::{Result, SeriesError};
use crate::hierarchy::SeriesGraph;
use crate::tabular::{self, IngestOptions, Ingested, Table};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::BTreeSet;

// ============================================================================
// WRITE PLAN
// ============================================================================

/// What to save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Type(TypeKey),
    Series(SeriesKey),
    /// Observation by position within its time series
    Observation(SeriesKey, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Also write everything the entity depends on
    pub cascade: bool,
    /// Commit when done; false leaves the transaction open for batching
    pub commit: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            cascade: true,
            commit: true,
        }
    }
}

impl SaveOptions {
    /// Cascade, but keep the transaction open
    pub fn deferred() -> Self {
        SaveOptions {
            cascade: true,
            commit: false,
        }
    }

    /// Only the entity itself; its dependencies must already be stored
    pub fn shallow() -> Self {
        SaveOptions {
            cascade: false,
            commit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    InsertType(TypeKey),
    UpdateType(TypeKey),
    InsertSeries(SeriesKey),
    UpdateSeries(SeriesKey),
    /// Replace the stored member list of a group
    SyncMembers(SeriesKey),
    /// Ensure keywords exist, then replace the stored links of a series
    SyncKeywords(SeriesKey),
    InsertObservation(SeriesKey, usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    steps: Vec<WriteStep>,
}

impl WritePlan {
    pub fn steps(&self) -> &[WriteStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Closure of everything a save of `roots` has to write
struct Closure {
    types: BTreeSet<TypeKey>,
    series: BTreeSet<SeriesKey>,
    observations: BTreeSet<(SeriesKey, usize)>,
}

impl Closure {
    fn collect(graph: &SeriesGraph, roots: &[EntityRef], cascade: bool) -> Result<Self> {
        let mut closure = Closure {
            types: BTreeSet::new(),
            series: BTreeSet::new(),
            observations: BTreeSet::new(),
        };

        for root in roots {
            match *root {
                EntityRef::Type(key) => {
                    graph.series_type(key)?;
                    closure.types.insert(key);
                }
                EntityRef::Series(key) => {
                    graph.get(key)?;
                    closure.series.insert(key);
                }
                EntityRef::Observation(key, index) => {
                    let count = graph
                        .get(key)?
                        .as_time_series()
                        .map_or(0, |ts| ts.observations.len());
                    if index >= count {
                        return Err(SeriesError::UnresolvedReference(format!(
                            "observation {index} of series key {}",
                            key.index()
                        )));
                    }
                    if cascade {
                        closure.series.insert(key);
                    } else {
                        closure.observations.insert((key, index));
                    }
                }
            }
        }

        if cascade {
            closure.expand(graph)?;
        }

        // A time series in the plan carries its unsaved vintages with it
        for key in &closure.series {
            if let Some(ts) = graph.get(*key)?.as_time_series() {
                for (index, observation) in ts.observations.iter().enumerate() {
                    if !observation.is_persisted() {
                        closure.observations.insert((*key, index));
                    }
                }
            }
        }

        closure.check_resolved(graph)?;
        Ok(closure)
    }

    /// Follow parent, member, type and containing-group references
    fn expand(&mut self, graph: &SeriesGraph) -> Result<()> {
        let mut stack: Vec<SeriesKey> = self.series.iter().copied().collect();

        while let Some(key) = stack.pop() {
            let mut next = Vec::new();
            match &graph.get(key)?.variant {
                SeriesVariant::Group(group) => {
                    next.extend(group.parent);
                    next.extend(group.members.iter().copied());
                }
                SeriesVariant::TimeSeries(ts) => {
                    self.types.insert(ts.series_type);
                    next.extend(graph.groups_of(key));
                }
            }

            for reference in next {
                if self.series.insert(reference) {
                    stack.push(reference);
                }
            }
        }

        Ok(())
    }

    fn series_resolved(&self, graph: &SeriesGraph, key: SeriesKey) -> Result<()> {
        let series = graph.get(key)?;
        if series.is_persisted() || self.series.contains(&key) {
            Ok(())
        } else {
            Err(SeriesError::UnresolvedReference(format!(
                "series '{}' is not saved",
                series.code()
            )))
        }
    }

    /// Every reference is either stored already or written by this plan
    fn check_resolved(&self, graph: &SeriesGraph) -> Result<()> {
        for key in &self.series {
            match &graph.get(*key)?.variant {
                SeriesVariant::Group(group) => {
                    for reference in group.parent.iter().chain(group.members.iter()) {
                        self.series_resolved(graph, *reference)?;
                    }
                }
                SeriesVariant::TimeSeries(ts) => {
                    let series_type = graph.series_type(ts.series_type)?;
                    if !series_type.is_persisted() && !self.types.contains(&ts.series_type) {
                        return Err(SeriesError::UnresolvedReference(format!(
                            "type '{}' is not saved",
                            series_type.name
                        )));
                    }
                }
            }
        }

        for (key, _) in &self.observations {
            self.series_resolved(graph, *key)?;
        }

        Ok(())
    }
}

/// Order the writes needed to save `roots`
pub fn plan(graph: &SeriesGraph, roots: &[EntityRef], cascade: bool) -> Result<WritePlan> {
    let closure = Closure::collect(graph, roots, cascade)?;
    let mut steps = Vec::new();

    for key in &closure.types {
        let series_type = graph.series_type(*key)?;
        if !series_type.is_persisted() {
            steps.push(WriteStep::InsertType(*key));
        } else if series_type.dirty {
            steps.push(WriteStep::UpdateType(*key));
        }
    }

    // Parents before children
    let mut groups = Vec::new();
    let mut time_series = Vec::new();
    for key in &closure.series {
        match graph.get(*key)?.kind() {
            SeriesKind::Group => groups.push((graph.ancestors(*key)?.len(), *key)),
            SeriesKind::TimeSeries => time_series.push(*key),
        }
    }
    groups.sort();
    let groups: Vec<SeriesKey> = groups.into_iter().map(|(_, key)| key).collect();

    for key in groups.iter().chain(time_series.iter()) {
        let series = graph.get(*key)?;
        if !series.is_persisted() {
            steps.push(WriteStep::InsertSeries(*key));
        } else if series.dirty {
            steps.push(WriteStep::UpdateSeries(*key));
        }
    }

    for key in &groups {
        let series = graph.get(*key)?;
        let has_members = series.as_group().map_or(false, |g| !g.members.is_empty());
        if (!series.is_persisted() && has_members) || (series.is_persisted() && series.dirty) {
            steps.push(WriteStep::SyncMembers(*key));
        }
    }

    for key in groups.iter().chain(time_series.iter()) {
        let series = graph.get(*key)?;
        if (!series.is_persisted() && !series.keywords.is_empty())
            || (series.is_persisted() && series.dirty)
        {
            steps.push(WriteStep::SyncKeywords(*key));
        }
    }

    for (key, index) in &closure.observations {
        steps.push(WriteStep::InsertObservation(*key, *index));
    }

    Ok(WritePlan { steps })
}

// ============================================================================
// SESSION
// ============================================================================

pub struct Session {
    conn: Connection,
    graph: SeriesGraph,

    /// Graph as it was when the open transaction began
    snapshot: Option<SeriesGraph>,

    /// Steps applied in the open transaction
    pending_steps: usize,
}

impl Session {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = db::open_connection(config)?;
        Ok(Session {
            conn,
            graph: SeriesGraph::new(),
            snapshot: None,
            pending_steps: 0,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Open the database selected by VINTAGE_ENV / VINTAGE_DATABASE
    pub fn from_env() -> Result<Self> {
        Self::open(&StoreConfig::from_env()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn graph(&self) -> &SeriesGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut SeriesGraph {
        &mut self.graph
    }

    pub fn count(&self, table: db::StoredTable) -> Result<i64> {
        db::count_rows(&self.conn, table)
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_none() {
            self.conn.execute_batch("BEGIN")?;
            self.snapshot = Some(self.graph.clone());
            self.pending_steps = 0;
        }
        Ok(())
    }

    /// Commit the open transaction (no-op without one)
    pub fn commit(&mut self) -> Result<()> {
        if self.snapshot.is_none() {
            return Ok(());
        }

        if let Err(e) = self.conn.execute_batch("COMMIT") {
            if let Err(rollback_err) = self.rollback() {
                log::warn!("rollback after failed commit failed: {}", rollback_err);
            }
            return Err(e.into());
        }

        log::info!("committed {} write steps", self.pending_steps);
        self.snapshot = None;
        self.pending_steps = 0;
        Ok(())
    }

    /// Abort the open transaction and restore the graph (no-op without one)
    pub fn rollback(&mut self) -> Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        log::warn!("rolling back {} write steps", self.pending_steps);
        self.graph = snapshot;
        self.pending_steps = 0;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `work` inside the session transaction; any error rolls it back
    fn transactional<T>(
        &mut self,
        commit: bool,
        work: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.begin()?;

        match work(self) {
            Ok(value) => {
                if commit {
                    self.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    log::warn!("rollback after failed write failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // SAVE
    // ========================================================================

    /// Persist `entity` (and, with cascade, everything it depends on)
    pub fn save(&mut self, entity: EntityRef, options: SaveOptions) -> Result<WritePlan> {
        self.save_many(&[entity], options)
    }

    pub fn save_many(&mut self, roots: &[EntityRef], options: SaveOptions) -> Result<WritePlan> {
        self.transactional(options.commit, |session| {
            let write_plan = plan(&session.graph, roots, options.cascade)?;
            for step in write_plan.steps() {
                session.apply(step)?;
            }
            Ok(write_plan)
        })
    }

    /// Save every type and series in the graph
    pub fn save_all(&mut self, options: SaveOptions) -> Result<WritePlan> {
        let mut roots: Vec<EntityRef> = (0..self.graph.type_count())
            .map(|index| EntityRef::Type(TypeKey(index)))
            .collect();
        roots.extend(self.graph.iter().map(|(key, _)| EntityRef::Series(key)));
        self.save_many(&roots, options)
    }

    fn stored_series_id(&self, key: SeriesKey) -> Result<i64> {
        let series = self.graph.get(key)?;
        series.id.ok_or_else(|| {
            SeriesError::UnresolvedReference(format!("series '{}' is not saved", series.code()))
        })
    }

    fn stored_type_id(&self, key: TypeKey) -> Result<i64> {
        let series_type = self.graph.series_type(key)?;
        series_type.id.ok_or_else(|| {
            SeriesError::UnresolvedReference(format!("type '{}' is not saved", series_type.name))
        })
    }

    fn time_series_row(&self, key: SeriesKey, id: i64) -> Result<Option<db::TimeSeriesRow>> {
        let Some(ts) = self.graph.get(key)?.as_time_series() else {
            return Ok(None);
        };
        Ok(Some(db::TimeSeriesRow {
            id,
            code: ts.code.clone(),
            type_id: self.stored_type_id(ts.series_type)?,
            frequency: ts.frequency,
            delta_type: ts.delta_type,
        }))
    }

    fn group_row(&self, key: SeriesKey) -> Result<Option<(String, Option<i64>)>> {
        let Some(group) = self.graph.get(key)?.as_group() else {
            return Ok(None);
        };
        let parent_id = group
            .parent
            .map(|parent| self.stored_series_id(parent))
            .transpose()?;
        Ok(Some((group.code.clone(), parent_id)))
    }

    fn apply(&mut self, step: &WriteStep) -> Result<()> {
        log::debug!("apply {:?}", step);
        let now = Utc::now();

        match *step {
            WriteStep::InsertType(key) => {
                let id = db::insert_type(&self.conn, self.graph.series_type(key)?, now)?;
                if let Some(series_type) = self.graph.type_mut_untracked(key) {
                    series_type.id = Some(id);
                    series_type.created_at = Some(now);
                    series_type.updated_at = Some(now);
                    series_type.dirty = false;
                }
                self.graph.register_type_id(key, id);
            }
            WriteStep::UpdateType(key) => {
                let id = self.stored_type_id(key)?;
                db::update_type(&self.conn, id, self.graph.series_type(key)?, now)?;
                if let Some(series_type) = self.graph.type_mut_untracked(key) {
                    series_type.updated_at = Some(now);
                    series_type.dirty = false;
                }
            }
            WriteStep::InsertSeries(key) => {
                let series = self.graph.get(key)?;
                let id = db::insert_series_base(
                    &self.conn,
                    series.kind(),
                    &series.name,
                    series.description.as_deref(),
                    now,
                )?;

                if let Some((code, parent_id)) = self.group_row(key)? {
                    db::insert_group_row(&self.conn, id, &code, parent_id)?;
                }
                if let Some(row) = self.time_series_row(key, id)? {
                    db::insert_time_series_row(&self.conn, &row)?;
                }

                let series = self.graph.get_mut_untracked(key)?;
                series.id = Some(id);
                series.created_at = Some(now);
                series.updated_at = Some(now);
                series.dirty = false;
                self.graph.register_series_id(key, id);
            }
            WriteStep::UpdateSeries(key) => {
                let id = self.stored_series_id(key)?;
                let series = self.graph.get(key)?;
                db::update_series_base(
                    &self.conn,
                    id,
                    &series.name,
                    series.description.as_deref(),
                    now,
                )?;

                if let Some((code, parent_id)) = self.group_row(key)? {
                    db::update_group_row(&self.conn, id, &code, parent_id)?;
                }
                if let Some(row) = self.time_series_row(key, id)? {
                    db::update_time_series_row(&self.conn, &row)?;
                }

                let series = self.graph.get_mut_untracked(key)?;
                series.updated_at = Some(now);
                series.dirty = false;
            }
            WriteStep::SyncMembers(key) => {
                let id = self.stored_series_id(key)?;
                let members: Vec<SeriesKey> = self
                    .graph
                    .get(key)?
                    .as_group()
                    .map(|g| g.members.iter().copied().collect())
                    .unwrap_or_default();
                let member_ids = members
                    .into_iter()
                    .map(|member| self.stored_series_id(member))
                    .collect::<Result<Vec<_>>>()?;
                db::replace_members(&self.conn, id, &member_ids)?;
            }
            WriteStep::SyncKeywords(key) => {
                let id = self.stored_series_id(key)?;
                let registry = KeywordRegistry::new(&self.conn);
                let keyword_ids = self
                    .graph
                    .get(key)?
                    .keywords
                    .iter()
                    .map(|text| registry.ensure(text).map(|keyword| keyword.id))
                    .collect::<Result<Vec<_>>>()?;
                db::replace_keywords(&self.conn, id, &keyword_ids)?;
            }
            WriteStep::InsertObservation(key, index) => {
                let ts_id = self.stored_series_id(key)?;
                let series = self.graph.get_mut_untracked(key)?;
                let observation = series
                    .as_time_series_mut()
                    .and_then(|ts| ts.observations.get_mut(index))
                    .ok_or_else(|| {
                        SeriesError::UnresolvedReference(format!(
                            "observation {index} of series key {}",
                            key.index()
                        ))
                    })?;

                let id = db::insert_observation(&self.conn, ts_id, observation, now)?;
                observation.id = Some(id);
                observation.created_at = Some(now);
            }
        }

        self.pending_steps += 1;
        Ok(())
    }

    // ========================================================================
    // CREATION (checked against storage)
    // ========================================================================

    /// New group; the code must be free both in the graph and in storage
    pub fn create_group(
        &mut self,
        name: &str,
        code: &str,
        parent: Option<SeriesKey>,
        description: Option<&str>,
    ) -> Result<SeriesKey> {
        if db::find_group_id_by_code(&self.conn, code)?.is_some() {
            return Err(SeriesError::ConstraintViolation(format!(
                "group code '{code}' already exists"
            )));
        }
        self.graph.create_group(name, code, parent, description)
    }

    /// New time series of a stored type, looked up by name
    pub fn create_time_series(
        &mut self,
        name: &str,
        code: &str,
        type_name: &str,
        frequency: Option<Frequency>,
        delta_type: Option<DeltaType>,
    ) -> Result<SeriesKey> {
        let series_type = self.load_type_by_name(type_name)?;
        if db::find_time_series_id_by_code(&self.conn, code)?.is_some() {
            return Err(SeriesError::ConstraintViolation(format!(
                "time series code '{code}' already exists"
            )));
        }
        self.graph
            .create_time_series(name, code, series_type, frequency, delta_type)
    }

    /// Get-or-create a keyword row directly
    pub fn ensure_keyword(&self, text: &str) -> Result<Keyword> {
        KeywordRegistry::new(&self.conn).ensure(text)
    }

    // ========================================================================
    // LOAD
    // ========================================================================

    pub fn load_type(&mut self, id: i64) -> Result<TypeKey> {
        if let Some(key) = self.graph.type_key_by_id(id) {
            return Ok(key);
        }
        let series_type = db::find_type(&self.conn, id)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("type id {id}")))?;
        Ok(self.graph.add_type(series_type))
    }

    pub fn load_type_by_name(&mut self, name: &str) -> Result<TypeKey> {
        let series_type = db::find_type_by_name(&self.conn, name)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("type '{name}'")))?;
        Ok(self.graph.add_type(series_type))
    }

    /// Bring a stored series into the graph. A group brings its parent chain,
    /// child groups and members; a time series brings its type and vintages.
    pub fn load_series(&mut self, id: i64) -> Result<SeriesKey> {
        if let Some(key) = self.graph.key_for_id(id) {
            return Ok(key);
        }

        let row = db::find_series_row(&self.conn, id)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("series id {id}")))?;

        let mut series = match row.kind {
            SeriesKind::Group => {
                let group = db::find_group_row(&self.conn, id)?.ok_or_else(|| {
                    SeriesError::UnresolvedReference(format!("group row for series id {id}"))
                })?;
                Series::group(row.name, group.code)
            }
            SeriesKind::TimeSeries => {
                let ts_row = db::find_time_series_row(&self.conn, id)?.ok_or_else(|| {
                    SeriesError::UnresolvedReference(format!("time series row for series id {id}"))
                })?;
                let type_key = self.load_type(ts_row.type_id)?;
                let mut series = Series::time_series(row.name, ts_row.code, type_key)
                    .with_frequency(ts_row.frequency)
                    .with_delta_type(ts_row.delta_type);
                if let Some(ts) = series.as_time_series_mut() {
                    ts.observations = db::observations_for(&self.conn, id)?;
                }
                series
            }
        };

        series.id = Some(id);
        series.description = row.description;
        series.created_at = Some(row.created_at);
        series.updated_at = Some(row.updated_at);
        series.keywords = db::keyword_texts_for(&self.conn, id)?.into_iter().collect();

        // Registered before relations are followed so loops terminate
        let key = self.graph.insert(series)?;

        if row.kind == SeriesKind::Group {
            self.load_group_relations(key, id)?;
        }

        Ok(key)
    }

    fn load_group_relations(&mut self, key: SeriesKey, id: i64) -> Result<()> {
        let parent = match db::find_group_row(&self.conn, id)?.and_then(|g| g.parent_id) {
            Some(parent_id) => Some(self.load_series(parent_id)?),
            None => None,
        };

        let mut members = BTreeSet::new();
        for member_id in db::member_ids(&self.conn, id)? {
            members.insert(self.load_series(member_id)?);
        }

        if let Some(group) = self.graph.get_mut_untracked(key)?.as_group_mut() {
            group.parent = parent;
            group.members = members;
        }

        for child_id in db::child_group_ids(&self.conn, id)? {
            self.load_series(child_id)?;
        }

        Ok(())
    }

    /// Bring in every stored group that has `series` as a member
    pub fn load_groups_of(&mut self, series: SeriesKey) -> Result<Vec<SeriesKey>> {
        let Some(id) = self.graph.get(series)?.id else {
            return Ok(self.graph.groups_of(series));
        };

        for group_id in db::group_ids_containing(&self.conn, id)? {
            self.load_series(group_id)?;
        }
        Ok(self.graph.groups_of(series))
    }

    pub fn load_group_by_code(&mut self, code: &str) -> Result<SeriesKey> {
        let id = db::find_group_id_by_code(&self.conn, code)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("group '{code}'")))?;
        self.load_series(id)
    }

    pub fn load_time_series_by_code(&mut self, code: &str) -> Result<SeriesKey> {
        let id = db::find_time_series_id_by_code(&self.conn, code)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("time series '{code}'")))?;
        self.load_series(id)
    }

    // ========================================================================
    // DELETE / INGEST
    // ========================================================================

    /// Delete a series; its observations and links go with it.
    /// Inside an open transaction the delete is part of it.
    pub fn delete_series(&mut self, key: SeriesKey) -> Result<()> {
        let id = self.graph.get(key)?.id;

        if let Some(id) = id {
            let deleted = db::delete_series(&self.conn, id)?;
            log::info!("deleted series {} ({} row)", id, deleted);
        }
        self.graph.remove(key)?;
        Ok(())
    }

    /// Ingest a table and save the resulting series with a single commit
    pub fn ingest_and_save(&mut self, table: &Table, options: &IngestOptions) -> Result<Ingested> {
        self.transactional(true, |session| {
            let ingested = tabular::ingest(&mut session.graph, table, options)?;
            let roots: Vec<EntityRef> = ingested.keys().into_iter().map(EntityRef::Series).collect();

            let write_plan = plan(&session.graph, &roots, true)?;
            for step in write_plan.steps() {
                session.apply(step)?;
            }
            Ok(ingested)
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(e) = self.rollback() {
                log::warn!("rollback on close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoredTable;
    use crate::entities::TimeSeriesType;
    use crate::tabular::{Column, GroupAssignment};
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Fresh type, fresh time series, two observations; nothing saved
    fn draft_series(session: &mut Session) -> SeriesKey {
        let graph = session.graph_mut();
        let price = graph.add_type(TimeSeriesType::new("Price"));
        let ts = graph
            .insert(Series::time_series("S&P 500", "SPX", price))
            .unwrap();
        graph.append(ts, d(2024, 1, 1), 4700.0, None).unwrap();
        graph.append(ts, d(2024, 1, 2), 4710.0, None).unwrap();
        ts
    }

    fn counts(session: &Session) -> (i64, i64, i64) {
        (
            session.count(StoredTable::TimeSeriesType).unwrap(),
            session.count(StoredTable::TimeSeries).unwrap(),
            session.count(StoredTable::Observation).unwrap(),
        )
    }

    #[test]
    fn test_cascade_save_writes_each_row_once() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);

        session
            .save(EntityRef::Series(ts), SaveOptions::default())
            .unwrap();

        assert_eq!(counts(&session), (1, 1, 2));
        assert!(!session.in_transaction());

        // Nothing left to write
        let again = session
            .save(EntityRef::Series(ts), SaveOptions::default())
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(counts(&session), (1, 1, 2));
    }

    #[test]
    fn test_cascade_save_with_deferred_commit() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);

        session
            .save(EntityRef::Observation(ts, 0), SaveOptions::deferred())
            .unwrap();
        assert!(session.in_transaction());
        session
            .save(EntityRef::Series(ts), SaveOptions::deferred())
            .unwrap();
        session.commit().unwrap();

        assert_eq!(counts(&session), (1, 1, 2));
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_plan_order() {
        let mut graph = SeriesGraph::new();
        let price = graph.add_type(TimeSeriesType::new("Price"));
        let root = graph.create_group("Markets", "MKT", None, None).unwrap();
        let ts = graph.create_time_series("Px", "PX", price, None, None).unwrap();
        // Child created after its member so key order differs from depth order
        let child = graph.create_group("Equities", "EQ", Some(root), None).unwrap();
        graph.add_member(child, ts).unwrap();
        graph.tag(ts, "stocks").unwrap();
        graph.append(ts, d(2024, 1, 1), 1.0, None).unwrap();

        let write_plan = plan(&graph, &[EntityRef::Series(child)], true).unwrap();

        assert_eq!(
            write_plan.steps(),
            &[
                WriteStep::InsertType(price),
                WriteStep::InsertSeries(root),
                WriteStep::InsertSeries(child),
                WriteStep::InsertSeries(ts),
                WriteStep::SyncMembers(child),
                WriteStep::SyncKeywords(ts),
                WriteStep::InsertObservation(ts, 0),
            ]
        );
    }

    #[test]
    fn test_shallow_save_requires_stored_dependencies() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);

        let result = session.save(EntityRef::Series(ts), SaveOptions::shallow());
        assert!(matches!(result, Err(SeriesError::UnresolvedReference(_))));
        assert_eq!(counts(&session), (0, 0, 0));

        let price = session.graph().type_key_by_name("Price").unwrap();
        session
            .save(EntityRef::Type(price), SaveOptions::shallow())
            .unwrap();
        session
            .save(EntityRef::Series(ts), SaveOptions::shallow())
            .unwrap();
        assert_eq!(counts(&session), (1, 1, 2));
    }

    #[test]
    fn test_duplicate_code_aborts_whole_transaction() {
        let mut session = Session::open_in_memory().unwrap();
        let first = draft_series(&mut session);
        session
            .save(EntityRef::Series(first), SaveOptions::default())
            .unwrap();

        // Batched: a valid series, then a draft reusing a stored code
        let price = session.graph().type_key_by_name("Price").unwrap();
        let fresh = session
            .graph_mut()
            .insert(Series::time_series("Nasdaq", "NDX", price))
            .unwrap();
        let clash = session
            .graph_mut()
            .insert(Series::time_series("Copy", "SPX", price))
            .unwrap();

        session
            .save(EntityRef::Series(fresh), SaveOptions::deferred())
            .unwrap();
        let result = session.save(EntityRef::Series(clash), SaveOptions::deferred());

        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));
        assert!(!session.in_transaction());
        assert_eq!(session.count(StoredTable::TimeSeries).unwrap(), 1);
        assert!(
            !session.graph().get(fresh).unwrap().is_persisted(),
            "Rollback restores the graph"
        );
    }

    #[test]
    fn test_explicit_rollback_restores_graph() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);

        session
            .save(EntityRef::Series(ts), SaveOptions::deferred())
            .unwrap();
        assert!(session.graph().get(ts).unwrap().is_persisted());

        session.rollback().unwrap();

        assert_eq!(counts(&session), (0, 0, 0));
        let series = session.graph().get(ts).unwrap();
        assert!(!series.is_persisted());
        assert!(series
            .as_time_series()
            .unwrap()
            .observations
            .iter()
            .all(|o| o.id.is_none() && o.created_at.is_none()));
    }

    #[test]
    fn test_group_cycle_leaves_storage_untouched() {
        let mut session = Session::open_in_memory().unwrap();
        let a = session.create_group("A", "A", None, None).unwrap();
        let b = session.create_group("B", "B", Some(a), None).unwrap();
        session
            .save(EntityRef::Series(b), SaveOptions::default())
            .unwrap();

        let result = session.graph_mut().set_parent(a, Some(b));
        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));

        let plan = session
            .save(EntityRef::Series(a), SaveOptions::default())
            .unwrap();
        assert!(plan.is_empty(), "Nothing changed, nothing to write");

        let a_id = session.graph().get(a).unwrap().id.unwrap();
        let row = db::find_group_row(session.connection(), a_id).unwrap().unwrap();
        assert_eq!(row.parent_id, None);
    }

    #[test]
    fn test_create_time_series_needs_stored_type() {
        let mut session = Session::open_in_memory().unwrap();

        let result = session.create_time_series("Px", "PX", "Price", None, None);
        assert!(matches!(result, Err(SeriesError::UnresolvedReference(_))));

        let price = session.graph_mut().add_type(TimeSeriesType::new("Price"));
        session
            .save(EntityRef::Type(price), SaveOptions::default())
            .unwrap();

        let ts = session
            .create_time_series("Px", "PX", "Price", Some(Frequency::Daily), None)
            .unwrap();
        assert_eq!(
            session.graph().get(ts).unwrap().as_time_series().unwrap().series_type,
            price,
            "Stored type resolves to the key already in the graph"
        );
    }

    #[test]
    fn test_tagging_twice_links_once() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);
        session.graph_mut().tag(ts, "Equities").unwrap();
        session.graph_mut().tag(ts, "equities ").unwrap();

        session
            .save(EntityRef::Series(ts), SaveOptions::default())
            .unwrap();

        assert_eq!(session.count(StoredTable::SeriesKeyword).unwrap(), 1);
        assert_eq!(session.count(StoredTable::Keyword).unwrap(), 1);

        // Keyword rows outlive the link
        session.graph_mut().untag(ts, "equities");
        session
            .save(EntityRef::Series(ts), SaveOptions::default())
            .unwrap();
        assert_eq!(session.count(StoredTable::SeriesKeyword).unwrap(), 0);
        assert_eq!(session.count(StoredTable::Keyword).unwrap(), 1);
    }

    #[test]
    fn test_update_and_membership_sync() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);
        let group = session.create_group("Indices", "IDX", None, None).unwrap();
        session.graph_mut().add_member(group, ts).unwrap();
        session
            .save(EntityRef::Series(group), SaveOptions::default())
            .unwrap();
        assert_eq!(session.count(StoredTable::GroupMember).unwrap(), 1);

        session.graph_mut().get_mut(ts).unwrap().name = "S&P 500 Index".to_string();
        session.graph_mut().remove_member(group, ts).unwrap();
        let write_plan = session.save_all(SaveOptions::default()).unwrap();

        assert!(write_plan.steps().contains(&WriteStep::UpdateSeries(ts)));
        assert!(write_plan.steps().contains(&WriteStep::SyncMembers(group)));
        assert_eq!(session.count(StoredTable::GroupMember).unwrap(), 0);

        let id = session.graph().get(ts).unwrap().id.unwrap();
        let row = db::find_series_row(session.connection(), id).unwrap().unwrap();
        assert_eq!(row.name, "S&P 500 Index");
        assert!(row.updated_at >= row.created_at);
    }

    #[test]
    fn test_delete_series_removes_observations() {
        let mut session = Session::open_in_memory().unwrap();
        let ts = draft_series(&mut session);
        session
            .save(EntityRef::Series(ts), SaveOptions::default())
            .unwrap();

        session.delete_series(ts).unwrap();

        assert_eq!(counts(&session), (1, 0, 0));
        assert!(!session.graph().contains(ts));
    }

    #[test]
    fn test_ingest_and_save() {
        let mut session = Session::open_in_memory().unwrap();
        let price = session.graph_mut().add_type(TimeSeriesType::new("Price"));
        let group = session.create_group("Indices", "IDX", None, None).unwrap();

        let table = Table::new(vec![
            Column::dates("date", &[d(2024, 1, 1), d(2024, 1, 2)]),
            Column::numbers("spx", &[4700.0, 4710.0]),
            Column::numbers("ndx", &[16800.0, 16850.0]),
        ])
        .unwrap();
        let options = IngestOptions::new(price).with_groups(GroupAssignment::Single(group));

        let ingested = session.ingest_and_save(&table, &options).unwrap();

        assert_eq!(ingested.keys().len(), 2);
        assert_eq!(counts(&session), (1, 2, 4));
        assert_eq!(session.count(StoredTable::GroupMember).unwrap(), 2);
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_failed_ingest_leaves_nothing_behind() {
        let mut session = Session::open_in_memory().unwrap();
        let price = session.graph_mut().add_type(TimeSeriesType::new("Price"));
        let table = Table::new(vec![Column::numbers("spx", &[1.0])]).unwrap();

        let result = session.ingest_and_save(&table, &IngestOptions::new(price));

        assert!(matches!(result, Err(SeriesError::MissingDateAxis(_))));
        assert_eq!(counts(&session), (0, 0, 0));
        assert_eq!(session.graph().len(), 0);
    }

    #[test]
    fn test_reload_from_file_and_query_vintages() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::file(dir.path().join("series.db"));

        {
            let mut session = Session::open(&config).unwrap();
            let price = session.graph_mut().add_type(TimeSeriesType::new("Price"));
            let table = Table::new(vec![
                Column::dates("date", &[d(2024, 1, 1), d(2024, 1, 2)]),
                Column::numbers("price", &[100.0, 101.0]),
            ])
            .unwrap();
            let key = session
                .ingest_and_save(&table, &IngestOptions::new(price))
                .unwrap()
                .keys()[0];
            session.graph_mut().tag(key, "Benchmark").unwrap();
            session
                .graph_mut()
                .append(key, d(2024, 1, 1), 100.5, Some(d(2024, 1, 3)))
                .unwrap();
            session
                .save(EntityRef::Series(key), SaveOptions::default())
                .unwrap();
        }

        let mut session = Session::open(&config).unwrap();
        let key = session.load_time_series_by_code("price").unwrap();
        let series = session.graph().get(key).unwrap();

        assert_eq!(series.name, "price");
        assert!(series.keywords.contains("benchmark"));
        assert_eq!(session.graph().raw_observations(key).unwrap().len(), 3);
        assert_eq!(
            session.graph().as_of(key, None).unwrap(),
            vec![(d(2024, 1, 1), 100.5), (d(2024, 1, 2), 101.0)]
        );
        assert_eq!(
            session.graph().as_of(key, Some(d(2024, 1, 2))).unwrap(),
            vec![(d(2024, 1, 1), 100.0), (d(2024, 1, 2), 101.0)]
        );

        // Loading twice resolves to the same key
        assert_eq!(session.load_time_series_by_code("price").unwrap(), key);
    }

    #[test]
    fn test_group_code_checked_against_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::file(dir.path().join("groups.db"));

        {
            let mut session = Session::open(&config).unwrap();
            let root = session.create_group("Markets", "MKT", None, None).unwrap();
            let child = session
                .create_group("Equities", "EQ", Some(root), Some("Stock indices"))
                .unwrap();
            let price = session.graph_mut().add_type(TimeSeriesType::new("Price"));
            let ts = session
                .graph_mut()
                .create_time_series("Px", "PX", price, None, None)
                .unwrap();
            session.graph_mut().add_member(child, ts).unwrap();
            session
                .save_all(SaveOptions::default())
                .unwrap();
        }

        let mut session = Session::open(&config).unwrap();
        let result = session.create_group("Markets again", "MKT", None, None);
        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));

        let root = session.load_group_by_code("MKT").unwrap();
        let children = session.graph().children(root);
        assert_eq!(children.len(), 1);

        let child = children[0];
        let loaded = session.graph().get(child).unwrap();
        assert_eq!(loaded.code(), "EQ");
        assert_eq!(loaded.description.as_deref(), Some("Stock indices"));
        assert_eq!(session.graph().leaf_members(child).unwrap().len(), 1);
        assert_eq!(session.graph().ancestors(child).unwrap(), vec![root]);
    }

    #[test]
    fn test_failed_rollback_does_not_mask_write_error() {
        let mut session = Session::open_in_memory().unwrap();
        let first = draft_series(&mut session);
        session
            .save(EntityRef::Series(first), SaveOptions::default())
            .unwrap();

        let price = session.graph().type_key_by_name("Price").unwrap();
        let fresh = session
            .graph_mut()
            .insert(Series::time_series("Nasdaq", "NDX", price))
            .unwrap();
        let clash = session
            .graph_mut()
            .insert(Series::time_series("Copy", "SPX", price))
            .unwrap();
        session
            .save(EntityRef::Series(fresh), SaveOptions::deferred())
            .unwrap();

        // The engine ends the open transaction behind the session's back
        session.connection().execute_batch("ROLLBACK").unwrap();

        let result = session.save(EntityRef::Series(clash), SaveOptions::deferred());
        assert!(
            matches!(result, Err(SeriesError::ConstraintViolation(_))),
            "got {result:?}"
        );
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_load_groups_of_time_series() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::file(dir.path().join("series.db"));

        {
            let mut session = Session::open(&config).unwrap();
            let ts = draft_series(&mut session);
            let graph = session.graph_mut();
            let equities = graph.create_group("Equities", "EQ", None, None).unwrap();
            let us = graph.create_group("United States", "US", None, None).unwrap();
            graph.add_member(equities, ts).unwrap();
            graph.add_member(us, ts).unwrap();
            session.save_all(SaveOptions::default()).unwrap();
        }

        let mut session = Session::open(&config).unwrap();
        let ts = session.load_time_series_by_code("SPX").unwrap();
        assert!(session.graph().groups_of(ts).is_empty());

        let groups = session.load_groups_of(ts).unwrap();
        assert_eq!(groups.len(), 2);

        // Already in the graph, so code lookups resolve to the same keys
        let equities = session.load_group_by_code("EQ").unwrap();
        let us = session.load_group_by_code("US").unwrap();
        assert!(groups.contains(&equities) && groups.contains(&us));
        assert_eq!(session.graph().groups_of(ts), groups);
    }
}
