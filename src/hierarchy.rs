// 🌳 Series Graph - arena of types and series with parent and membership relations
//
// Entities live in id-indexed vectors; relations are keys into them.
// Two independent relations over groups:
// - parent/child nesting (a forest; cycles rejected at insertion)
// - membership (many-to-many; members may be groups or time series)
//
// Deleted series leave a tombstone so keys stay stable.

use crate::entities::{
    normalize_keyword, DeltaType, Frequency, Observation, Series, SeriesKey, SeriesKind,
    SeriesVariant, TimeSeriesType, TypeKey,
};
use crate::error::{Result, SeriesError};
use crate::temporal;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct SeriesGraph {
    types: Vec<TimeSeriesType>,
    series: Vec<Option<Series>>,

    // Identity maps: stored row id -> arena key
    type_ids: HashMap<i64, TypeKey>,
    series_ids: HashMap<i64, SeriesKey>,
}

impl SeriesGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // TYPES
    // ========================================================================

    /// Add a type to the arena. A type that carries a row id already known
    /// to the graph resolves to the existing key.
    pub fn add_type(&mut self, series_type: TimeSeriesType) -> TypeKey {
        if let Some(key) = series_type.id.and_then(|id| self.type_ids.get(&id)) {
            return *key;
        }

        let key = TypeKey(self.types.len());
        if let Some(id) = series_type.id {
            self.type_ids.insert(id, key);
        }
        self.types.push(series_type);
        key
    }

    pub fn series_type(&self, key: TypeKey) -> Result<&TimeSeriesType> {
        self.types
            .get(key.0)
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("type key {}", key.0)))
    }

    /// Mutable access marks the type for update on the next save
    pub fn series_type_mut(&mut self, key: TypeKey) -> Result<&mut TimeSeriesType> {
        let series_type = self
            .types
            .get_mut(key.0)
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("type key {}", key.0)))?;
        series_type.dirty = true;
        Ok(series_type)
    }

    pub fn type_key_by_id(&self, id: i64) -> Option<TypeKey> {
        self.type_ids.get(&id).copied()
    }

    pub fn type_key_by_name(&self, name: &str) -> Option<TypeKey> {
        self.types
            .iter()
            .position(|series_type| series_type.name == name)
            .map(TypeKey)
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub(crate) fn type_mut_untracked(&mut self, key: TypeKey) -> Option<&mut TimeSeriesType> {
        self.types.get_mut(key.0)
    }

    pub(crate) fn register_type_id(&mut self, key: TypeKey, id: i64) {
        self.type_ids.insert(id, key);
    }

    // ========================================================================
    // SERIES
    // ========================================================================

    /// Add a draft series. Its parent, members and type must already be in
    /// the graph; codes are checked when the series is saved.
    pub fn insert(&mut self, series: Series) -> Result<SeriesKey> {
        match &series.variant {
            SeriesVariant::Group(group) => {
                if let Some(parent) = group.parent {
                    self.require_group(parent)?;
                }
                for member in &group.members {
                    self.get(*member)?;
                }
            }
            SeriesVariant::TimeSeries(ts) => {
                self.series_type(ts.series_type)?;
            }
        }

        let key = SeriesKey(self.series.len());
        if let Some(id) = series.id {
            if self.series_ids.contains_key(&id) {
                return Err(SeriesError::ConstraintViolation(format!(
                    "series row {id} is already in the graph"
                )));
            }
            self.series_ids.insert(id, key);
        }
        self.series.push(Some(series));
        Ok(key)
    }

    pub fn get(&self, key: SeriesKey) -> Result<&Series> {
        self.series
            .get(key.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("series key {}", key.0)))
    }

    /// Mutable access marks the series for update on the next save
    pub fn get_mut(&mut self, key: SeriesKey) -> Result<&mut Series> {
        let series = self.get_mut_untracked(key)?;
        series.dirty = true;
        Ok(series)
    }

    pub(crate) fn get_mut_untracked(&mut self, key: SeriesKey) -> Result<&mut Series> {
        self.series
            .get_mut(key.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("series key {}", key.0)))
    }

    pub fn contains(&self, key: SeriesKey) -> bool {
        self.get(key).is_ok()
    }

    pub fn key_for_id(&self, id: i64) -> Option<SeriesKey> {
        self.series_ids.get(&id).copied()
    }

    pub(crate) fn register_series_id(&mut self, key: SeriesKey, id: i64) {
        self.series_ids.insert(id, key);
    }

    /// Live series in key order
    pub fn iter(&self) -> impl Iterator<Item = (SeriesKey, &Series)> + '_ {
        self.series
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|series| (SeriesKey(index), series)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_group_by_code(&self, code: &str) -> Option<SeriesKey> {
        self.find_by_code(SeriesKind::Group, code)
    }

    pub fn find_time_series_by_code(&self, code: &str) -> Option<SeriesKey> {
        self.find_by_code(SeriesKind::TimeSeries, code)
    }

    fn find_by_code(&self, kind: SeriesKind, code: &str) -> Option<SeriesKey> {
        self.iter()
            .find(|(_, series)| series.kind() == kind && series.code() == code)
            .map(|(key, _)| key)
    }

    /// Drop a series from the graph. Membership links to it are removed and
    /// child groups lose their parent, as the store does on delete.
    pub fn remove(&mut self, key: SeriesKey) -> Result<Series> {
        let removed = self
            .series
            .get_mut(key.0)
            .and_then(Option::take)
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("series key {}", key.0)))?;

        if let Some(id) = removed.id {
            self.series_ids.remove(&id);
        }

        for series in self.series.iter_mut().flatten() {
            if let Some(group) = series.as_group_mut() {
                group.members.remove(&key);
                if group.parent == Some(key) {
                    group.parent = None;
                }
            }
        }

        Ok(removed)
    }

    // ========================================================================
    // CREATION (validated)
    // ========================================================================

    /// New group with a unique code and an optional parent group
    pub fn create_group(
        &mut self,
        name: &str,
        code: &str,
        parent: Option<SeriesKey>,
        description: Option<&str>,
    ) -> Result<SeriesKey> {
        if self.find_group_by_code(code).is_some() {
            return Err(SeriesError::ConstraintViolation(format!(
                "group code '{code}' already exists"
            )));
        }
        if let Some(parent) = parent {
            self.require_group(parent)?;
            // An existing corrupt chain would be inherited by the new node
            self.ancestors_from(parent)?;
        }

        let mut group = Series::group(name, code);
        if let Some(parent) = parent {
            group = group.with_parent(parent);
        }
        if let Some(description) = description {
            group = group.with_description(description);
        }
        self.insert(group)
    }

    /// New time series with a unique code, of a type already in the graph
    pub fn create_time_series(
        &mut self,
        name: &str,
        code: &str,
        series_type: TypeKey,
        frequency: Option<Frequency>,
        delta_type: Option<DeltaType>,
    ) -> Result<SeriesKey> {
        self.series_type(series_type)?;
        if self.find_time_series_by_code(code).is_some() {
            return Err(SeriesError::ConstraintViolation(format!(
                "time series code '{code}' already exists"
            )));
        }

        let series = Series::time_series(name, code, series_type)
            .with_frequency(frequency.unwrap_or_default())
            .with_delta_type(delta_type.unwrap_or_default());
        self.insert(series)
    }

    // ========================================================================
    // PARENT / CHILD
    // ========================================================================

    fn require_group(&self, key: SeriesKey) -> Result<()> {
        match self.get(key)?.kind() {
            SeriesKind::Group => Ok(()),
            SeriesKind::TimeSeries => Err(SeriesError::UnresolvedReference(format!(
                "series key {} is not a group",
                key.0
            ))),
        }
    }

    /// Re-parent a group. Fails if `group` would become its own ancestor.
    pub fn set_parent(&mut self, group: SeriesKey, parent: Option<SeriesKey>) -> Result<()> {
        self.require_group(group)?;

        if let Some(parent) = parent {
            self.require_group(parent)?;
            if parent == group || self.ancestors_from(parent)?.contains(&group) {
                return Err(SeriesError::ConstraintViolation(format!(
                    "group '{}' cannot be nested under its own descendant",
                    self.get(group)?.code()
                )));
            }
        }

        let series = self.get_mut(group)?;
        if let Some(payload) = series.as_group_mut() {
            payload.parent = parent;
        }
        Ok(())
    }

    /// `start` followed by its ancestors; errors if the chain loops
    fn ancestors_from(&self, start: SeriesKey) -> Result<Vec<SeriesKey>> {
        let mut chain = vec![start];
        let mut seen: HashSet<SeriesKey> = HashSet::from([start]);
        let mut current = start;

        while let Some(parent) = self.get(current)?.as_group().and_then(|g| g.parent) {
            if !seen.insert(parent) {
                return Err(SeriesError::ConstraintViolation(format!(
                    "parent chain of series key {} loops",
                    start.0
                )));
            }
            chain.push(parent);
            current = parent;
        }

        Ok(chain)
    }

    /// Parent, grandparent, ... nearest first
    pub fn ancestors(&self, group: SeriesKey) -> Result<Vec<SeriesKey>> {
        self.require_group(group)?;
        let mut chain = self.ancestors_from(group)?;
        chain.remove(0);
        Ok(chain)
    }

    /// Direct child groups
    pub fn children(&self, group: SeriesKey) -> Vec<SeriesKey> {
        self.iter()
            .filter(|(_, series)| series.as_group().and_then(|g| g.parent) == Some(group))
            .map(|(key, _)| key)
            .collect()
    }

    /// Lazy walk over every group nested below `group` (depth first).
    /// Reflects the graph as it is when iterated.
    pub fn descendants_by_parent(&self, group: SeriesKey) -> Descendants<'_> {
        Descendants {
            graph: self,
            stack: self.children(group).into_iter().rev().collect(),
            seen: HashSet::from([group]),
        }
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Add `member` to `group`. Returns false if it was already a member.
    pub fn add_member(&mut self, group: SeriesKey, member: SeriesKey) -> Result<bool> {
        if group == member {
            return Err(SeriesError::ConstraintViolation(format!(
                "series key {} cannot be a member of itself",
                group.0
            )));
        }
        self.require_group(group)?;
        self.get(member)?;

        if self
            .get(group)?
            .as_group()
            .map_or(false, |g| g.members.contains(&member))
        {
            return Ok(false);
        }

        let series = self.get_mut(group)?;
        Ok(series
            .as_group_mut()
            .map_or(false, |payload| payload.members.insert(member)))
    }

    /// Remove `member` from `group`. Returns false if it was not a member.
    pub fn remove_member(&mut self, group: SeriesKey, member: SeriesKey) -> Result<bool> {
        self.require_group(group)?;

        if !self
            .get(group)?
            .as_group()
            .map_or(false, |g| g.members.contains(&member))
        {
            return Ok(false);
        }

        let series = self.get_mut(group)?;
        Ok(series
            .as_group_mut()
            .map_or(false, |payload| payload.members.remove(&member)))
    }

    /// Groups that list `series` as a member
    pub fn groups_of(&self, series: SeriesKey) -> Vec<SeriesKey> {
        self.iter()
            .filter(|(_, candidate)| {
                candidate
                    .as_group()
                    .map_or(false, |g| g.members.contains(&series))
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// Every time series reachable from `group` through membership
    pub fn leaf_members(&self, group: SeriesKey) -> Result<Vec<SeriesKey>> {
        self.require_group(group)?;

        let mut leaves = Vec::new();
        let mut seen: HashSet<SeriesKey> = HashSet::from([group]);
        let mut stack = vec![group];

        while let Some(current) = stack.pop() {
            let Some(payload) = self.get(current)?.as_group() else {
                continue;
            };
            for member in &payload.members {
                if !seen.insert(*member) {
                    continue;
                }
                match self.get(*member)?.kind() {
                    SeriesKind::TimeSeries => leaves.push(*member),
                    SeriesKind::Group => stack.push(*member),
                }
            }
        }

        leaves.sort();
        Ok(leaves)
    }

    // ========================================================================
    // KEYWORDS
    // ========================================================================

    /// Tag a series. Returns false if the (normalized) keyword was already set.
    pub fn tag(&mut self, series: SeriesKey, text: &str) -> Result<bool> {
        let keyword = normalize_keyword(text)?;
        if self.get(series)?.keywords.contains(&keyword) {
            return Ok(false);
        }
        Ok(self.get_mut(series)?.keywords.insert(keyword))
    }

    /// Remove a tag if present. Never fails on an unknown series or keyword.
    pub fn untag(&mut self, series: SeriesKey, text: &str) -> bool {
        let Ok(keyword) = normalize_keyword(text) else {
            return false;
        };
        let present = self
            .get(series)
            .map_or(false, |s| s.keywords.contains(&keyword));
        if !present {
            return false;
        }
        self.get_mut(series)
            .map_or(false, |s| s.keywords.remove(&keyword))
    }

    // ========================================================================
    // OBSERVATIONS
    // ========================================================================

    fn observations(&self, series: SeriesKey) -> Result<&[Observation]> {
        self.get(series)?
            .as_time_series()
            .map(|ts| ts.observations.as_slice())
            .ok_or_else(|| {
                SeriesError::UnresolvedReference(format!(
                    "series key {} is not a time series",
                    series.0
                ))
            })
    }

    /// Record a new vintage. Earlier vintages of the same date are kept.
    pub fn append(
        &mut self,
        series: SeriesKey,
        observed_date: NaiveDate,
        value: f64,
        release_date: Option<NaiveDate>,
    ) -> Result<&Observation> {
        let observation = Observation::new(observed_date, value, release_date)?;
        self.observations(series)?;

        let payload = self
            .get_mut_untracked(series)?
            .as_time_series_mut()
            .ok_or_else(|| {
                SeriesError::UnresolvedReference(format!(
                    "series key {} is not a time series",
                    series.0
                ))
            })?;
        payload.observations.push(observation);

        payload
            .observations
            .last()
            .ok_or_else(|| SeriesError::InvalidValue("observation was not recorded".to_string()))
    }

    /// Point-in-time view of a time series
    pub fn as_of(&self, series: SeriesKey, cutoff: Option<NaiveDate>) -> Result<Vec<(NaiveDate, f64)>> {
        Ok(temporal::as_of(self.observations(series)?, cutoff))
    }

    /// The winning observations behind `as_of`
    pub fn selected_vintages(
        &self,
        series: SeriesKey,
        cutoff: Option<NaiveDate>,
    ) -> Result<Vec<&Observation>> {
        Ok(temporal::select_vintages(self.observations(series)?, cutoff))
    }

    /// Every vintage ordered by date, then vintage rank
    pub fn raw_observations(&self, series: SeriesKey) -> Result<Vec<&Observation>> {
        Ok(temporal::raw_ordered(self.observations(series)?))
    }

    /// Revision history of one observed date
    pub fn vintages(&self, series: SeriesKey, observed_date: NaiveDate) -> Result<Vec<&Observation>> {
        Ok(temporal::vintages(self.observations(series)?, observed_date))
    }
}

// ============================================================================
// DESCENDANTS ITERATOR
// ============================================================================

pub struct Descendants<'g> {
    graph: &'g SeriesGraph,
    stack: Vec<SeriesKey>,
    seen: HashSet<SeriesKey>,
}

impl<'g> Iterator for Descendants<'g> {
    type Item = SeriesKey;

    fn next(&mut self) -> Option<SeriesKey> {
        while let Some(key) = self.stack.pop() {
            if !self.seen.insert(key) {
                continue;
            }
            let mut children = self.graph.children(key);
            children.reverse();
            self.stack.extend(children);
            return Some(key);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn graph_with_type() -> (SeriesGraph, TypeKey) {
        let mut graph = SeriesGraph::new();
        let price = graph.add_type(TimeSeriesType::new("Price"));
        (graph, price)
    }

    #[test]
    fn test_create_group_rejects_duplicate_code() {
        let mut graph = SeriesGraph::new();
        graph.create_group("Rates", "RT", None, None).unwrap();

        let result = graph.create_group("Rates again", "RT", None, None);
        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_create_group_parent_must_be_group() {
        let (mut graph, price) = graph_with_type();
        let ts = graph.create_time_series("Px", "PX", price, None, None).unwrap();

        let result = graph.create_group("G", "G", Some(ts), None);
        assert!(matches!(result, Err(SeriesError::UnresolvedReference(_))));
    }

    #[test]
    fn test_create_time_series_rejects_duplicate_code() {
        let (mut graph, price) = graph_with_type();
        graph.create_time_series("Px", "PX", price, None, None).unwrap();

        let result = graph.create_time_series("Px 2", "PX", price, Some(Frequency::Daily), None);
        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));
    }

    #[test]
    fn test_group_and_time_series_codes_are_separate_namespaces() {
        let (mut graph, price) = graph_with_type();
        graph.create_group("Spx", "SPX", None, None).unwrap();
        assert!(graph.create_time_series("Spx", "SPX", price, None, None).is_ok());
    }

    #[test]
    fn test_set_parent_rejects_cycles() {
        let mut graph = SeriesGraph::new();
        let a = graph.create_group("A", "A", None, None).unwrap();
        let b = graph.create_group("B", "B", Some(a), None).unwrap();
        let c = graph.create_group("C", "C", Some(b), None).unwrap();

        let result = graph.set_parent(a, Some(c));
        assert!(matches!(result, Err(SeriesError::ConstraintViolation(_))));
        assert!(matches!(
            graph.set_parent(a, Some(a)),
            Err(SeriesError::ConstraintViolation(_))
        ));

        // Unchanged
        assert_eq!(graph.get(a).unwrap().as_group().unwrap().parent, None);
        assert_eq!(graph.ancestors(c).unwrap(), vec![b, a]);
    }

    #[test]
    fn test_descendants_follow_current_state() {
        let mut graph = SeriesGraph::new();
        let root = graph.create_group("Root", "R", None, None).unwrap();
        let left = graph.create_group("Left", "L", Some(root), None).unwrap();
        let right = graph.create_group("Right", "RR", Some(root), None).unwrap();
        let leaf = graph.create_group("Leaf", "LF", Some(left), None).unwrap();

        let all: Vec<SeriesKey> = graph.descendants_by_parent(root).collect();
        assert_eq!(all, vec![left, leaf, right]);
        assert_eq!(graph.children(root), vec![left, right]);

        graph.set_parent(leaf, None).unwrap();
        let after: Vec<SeriesKey> = graph.descendants_by_parent(root).collect();
        assert_eq!(after, vec![left, right]);

        // Lazy: only the first step is computed
        assert_eq!(graph.descendants_by_parent(root).next(), Some(left));
    }

    #[test]
    fn test_membership_is_a_set() {
        let (mut graph, price) = graph_with_type();
        let group = graph.create_group("Basket", "BSK", None, None).unwrap();
        let ts = graph.create_time_series("Px", "PX", price, None, None).unwrap();

        assert!(graph.add_member(group, ts).unwrap());
        assert!(!graph.add_member(group, ts).unwrap());
        assert_eq!(graph.groups_of(ts), vec![group]);

        assert!(graph.remove_member(group, ts).unwrap());
        assert!(!graph.remove_member(group, ts).unwrap());
        assert!(graph.groups_of(ts).is_empty());
    }

    #[test]
    fn test_self_membership_rejected() {
        let mut graph = SeriesGraph::new();
        let group = graph.create_group("G", "G", None, None).unwrap();

        assert!(matches!(
            graph.add_member(group, group),
            Err(SeriesError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_leaf_members_walks_nested_membership() {
        let (mut graph, price) = graph_with_type();
        let outer = graph.create_group("Outer", "O", None, None).unwrap();
        let inner = graph.create_group("Inner", "I", None, None).unwrap();
        let a = graph.create_time_series("A", "A", price, None, None).unwrap();
        let b = graph.create_time_series("B", "B", price, None, None).unwrap();

        graph.add_member(outer, inner).unwrap();
        graph.add_member(outer, a).unwrap();
        graph.add_member(inner, a).unwrap();
        graph.add_member(inner, b).unwrap();
        // Membership loops are allowed; traversal must still terminate
        graph.add_member(inner, outer).unwrap();

        assert_eq!(graph.leaf_members(outer).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_tag_twice_keeps_one_keyword() {
        let (mut graph, price) = graph_with_type();
        let ts = graph.create_time_series("Px", "PX", price, None, None).unwrap();

        assert!(graph.tag(ts, "Equities").unwrap());
        assert!(!graph.tag(ts, " equities ").unwrap());
        assert_eq!(graph.get(ts).unwrap().keywords.len(), 1);

        assert!(graph.untag(ts, "EQUITIES"));
        assert!(!graph.untag(ts, "equities"));
        assert!(!graph.untag(ts, ""));
        assert!(matches!(graph.tag(ts, "  "), Err(SeriesError::InvalidValue(_))));
    }

    #[test]
    fn test_append_and_as_of() {
        let (mut graph, price) = graph_with_type();
        let ts = graph.create_time_series("price", "price", price, None, None).unwrap();

        graph.append(ts, d(2024, 1, 1), 100.0, None).unwrap();
        graph.append(ts, d(2024, 1, 2), 101.0, None).unwrap();
        graph.append(ts, d(2024, 1, 1), 100.5, Some(d(2024, 1, 3))).unwrap();

        assert_eq!(
            graph.as_of(ts, None).unwrap(),
            vec![(d(2024, 1, 1), 100.5), (d(2024, 1, 2), 101.0)]
        );
        assert_eq!(graph.raw_observations(ts).unwrap().len(), 3);
        assert_eq!(graph.vintages(ts, d(2024, 1, 1)).unwrap().len(), 2);

        assert!(matches!(
            graph.append(ts, d(2024, 1, 4), f64::NAN, None),
            Err(SeriesError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_append_to_group_fails() {
        let mut graph = SeriesGraph::new();
        let group = graph.create_group("G", "G", None, None).unwrap();

        assert!(matches!(
            graph.append(group, d(2024, 1, 1), 1.0, None),
            Err(SeriesError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_remove_detaches_relations() {
        let (mut graph, price) = graph_with_type();
        let parent = graph.create_group("P", "P", None, None).unwrap();
        let child = graph.create_group("C", "C", Some(parent), None).unwrap();
        let ts = graph.create_time_series("Px", "PX", price, None, None).unwrap();
        graph.add_member(parent, ts).unwrap();

        graph.remove(parent).unwrap();

        assert!(!graph.contains(parent));
        assert_eq!(graph.get(child).unwrap().as_group().unwrap().parent, None);
        assert!(graph.groups_of(ts).is_empty());
        assert!(matches!(
            graph.get(parent),
            Err(SeriesError::UnresolvedReference(_))
        ));
    }
}
