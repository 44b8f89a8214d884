// src/database.rs
//
// Transition database: the sorted collection of TransitionSets that
// stitching draws from.
//
// Invariants:
// - sets are kept in non-decreasing IdentityKey order at every point of
//   the build (binary search for the insertion point, then insert);
// - one set per identity key; further rows with that key add an action
//   result to the existing set;
// - an action result, once written, is never overwritten;
// - every pre/post vector has exactly `feature_count` entries.
//
// After the build the database is immutable except for each set's
// `last_used_epoch` stamp, which the stitching engine owns.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{ActionId, ActionSpace, FeatureVector, IdentityKey, RawFields, Summary};

/// Stamp value of a set that has not been consumed in any generation.
pub const UNUSED_EPOCH: u64 = 0;

/// One observed transition, as produced by the ingestion layer.
#[derive(Debug, Clone)]
pub struct TransitionRow {
    pub key: IdentityKey,
    pub action: ActionId,
    pub pre_state: FeatureVector,
    pub post_state: FeatureVector,
    pub summary: Summary,
    pub raw_fields: RawFields,
    pub is_initial: bool,
    pub is_terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseError {
    DimensionMismatch {
        key: IdentityKey,
        expected: usize,
        pre: usize,
        post: usize,
    },
    DuplicateAction {
        key: IdentityKey,
        action: ActionId,
    },
    UnknownAction {
        key: IdentityKey,
        action: ActionId,
    },
    Empty,
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::DimensionMismatch {
                key,
                expected,
                pre,
                post,
            } => write!(
                f,
                "Transition {} has {} pre and {} post features; expected {}",
                key, pre, post, expected
            ),
            DatabaseError::DuplicateAction { key, action } => {
                write!(f, "Action {} recorded twice for transition {}", action, key)
            }
            DatabaseError::UnknownAction { key, action } => write!(
                f,
                "Action {} of transition {} is not in the domain's action set",
                action, key
            ),
            DatabaseError::Empty => write!(f, "Transition log contained no rows"),
        }
    }
}

impl std::error::Error for DatabaseError {}

/// The outcome of taking one action in a transition set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub post_state: FeatureVector,
    pub summary: Summary,
    pub raw_fields: RawFields,
}

/// All observed action outcomes sharing one identity key.
#[derive(Debug, Clone)]
pub struct TransitionSet {
    key: IdentityKey,
    pre_state: FeatureVector,
    is_initial: bool,
    is_terminal: bool,
    actions: Arc<ActionSpace>,
    /// Indexed by `ActionSpace::slot`.
    results: Vec<Option<ActionResult>>,
    last_used_epoch: u64,
}

impl TransitionSet {
    fn from_row(row: TransitionRow, actions: &Arc<ActionSpace>) -> Result<Self, DatabaseError> {
        let mut set = TransitionSet {
            key: row.key.clone(),
            pre_state: row.pre_state.clone(),
            is_initial: row.is_initial,
            is_terminal: row.is_terminal,
            actions: Arc::clone(actions),
            results: vec![None; actions.len()],
            last_used_epoch: UNUSED_EPOCH,
        };
        set.add_result(row)?;
        Ok(set)
    }

    fn add_result(&mut self, row: TransitionRow) -> Result<(), DatabaseError> {
        let slot = self
            .actions
            .slot(row.action)
            .ok_or_else(|| DatabaseError::UnknownAction {
                key: self.key.clone(),
                action: row.action,
            })?;
        if self.results[slot].is_some() {
            return Err(DatabaseError::DuplicateAction {
                key: self.key.clone(),
                action: row.action,
            });
        }
        self.results[slot] = Some(ActionResult {
            post_state: row.post_state,
            summary: row.summary,
            raw_fields: row.raw_fields,
        });
        Ok(())
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn pre_state(&self) -> &[f64] {
        &self.pre_state
    }

    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }

    pub fn last_used_epoch(&self) -> u64 {
        self.last_used_epoch
    }

    pub fn result(&self, action: ActionId) -> Option<&ActionResult> {
        let slot = self.actions.slot(action)?;
        self.results[slot].as_ref()
    }

    pub fn has_action(&self, action: ActionId) -> bool {
        self.result(action).is_some()
    }

    /// Actions with a recorded result, in action-space order.
    pub fn actions(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .filter_map(|(slot, _)| self.actions.action_at(slot))
    }

    pub fn action_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// True when every action of the domain was observed here.
    pub fn has_all_actions(&self) -> bool {
        self.results.iter().all(|r| r.is_some())
    }

    /// Raw fields of the first recorded action, for policies that only
    /// need the situation's context rather than a particular outcome.
    pub fn additional_fields(&self) -> Option<&RawFields> {
        self.results
            .iter()
            .flatten()
            .next()
            .map(|r| &r.raw_fields)
    }
}

/// Incremental merge-insert builder.
#[derive(Debug)]
pub struct DatabaseBuilder {
    sets: Vec<TransitionSet>,
    initial_keys: Vec<IdentityKey>,
    actions: Arc<ActionSpace>,
    feature_count: usize,
    rows: usize,
}

impl DatabaseBuilder {
    pub fn new(actions: ActionSpace, feature_count: usize) -> Self {
        Self {
            sets: Vec::new(),
            initial_keys: Vec::new(),
            actions: Arc::new(actions),
            feature_count,
            rows: 0,
        }
    }

    /// Merge one row into the sorted set list.
    pub fn insert(&mut self, row: TransitionRow) -> Result<(), DatabaseError> {
        if row.pre_state.len() != self.feature_count || row.post_state.len() != self.feature_count
        {
            return Err(DatabaseError::DimensionMismatch {
                key: row.key,
                expected: self.feature_count,
                pre: row.pre_state.len(),
                post: row.post_state.len(),
            });
        }

        let lo = self.sets.partition_point(|s| s.key < row.key);
        if lo < self.sets.len() && self.sets[lo].key == row.key {
            self.sets[lo].add_result(row)?;
        } else {
            let set = TransitionSet::from_row(row, &self.actions)?;
            if set.is_initial {
                self.initial_keys.push(set.key.clone());
            }
            self.sets.insert(lo, set);
        }
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<TransitionDatabase, DatabaseError> {
        if self.sets.is_empty() {
            return Err(DatabaseError::Empty);
        }
        // Starts keep first-appearance order; resolve keys to final positions.
        let initial_sets = self
            .initial_keys
            .iter()
            .filter_map(|k| self.sets.binary_search_by(|s| s.key.cmp(k)).ok())
            .collect();
        Ok(TransitionDatabase {
            sets: self.sets,
            initial_sets,
            actions: self.actions,
            feature_count: self.feature_count,
            rows: self.rows,
        })
    }
}

/// The sorted, bulk-loaded transition database.
#[derive(Debug, Clone)]
pub struct TransitionDatabase {
    sets: Vec<TransitionSet>,
    initial_sets: Vec<usize>,
    actions: Arc<ActionSpace>,
    feature_count: usize,
    rows: usize,
}

impl TransitionDatabase {
    pub fn build<I>(
        rows: I,
        actions: ActionSpace,
        feature_count: usize,
    ) -> Result<Self, DatabaseError>
    where
        I: IntoIterator<Item = TransitionRow>,
    {
        let mut builder = DatabaseBuilder::new(actions, feature_count);
        for row in rows {
            builder.insert(row)?;
        }
        builder.finish()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Number of rows merged into the database.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.actions
    }

    pub fn sets(&self) -> &[TransitionSet] {
        &self.sets
    }

    pub fn get(&self, idx: usize) -> Option<&TransitionSet> {
        self.sets.get(idx)
    }

    /// Positions of sets eligible as trajectory starts, in the order
    /// they first appeared in the log.
    pub fn initial_sets(&self) -> &[usize] {
        &self.initial_sets
    }

    pub fn find(&self, key: &IdentityKey) -> Option<usize> {
        self.sets.binary_search_by(|s| s.key.cmp(key)).ok()
    }

    /// Positions of sets missing at least one action of the domain.
    pub fn incomplete_sets(&self) -> Vec<usize> {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.has_all_actions())
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn stamp(&mut self, idx: usize, epoch: u64) {
        if let Some(set) = self.sets.get_mut(idx) {
            set.last_used_epoch = epoch;
        }
    }
}
