// src/types.rs
//
// Common shared types for the mfmc stitching engine.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered feature values, one per configured pre- (or post-) transition variable.
pub type FeatureVector = Vec<f64>;

/// Every source column of one observed row, after row processing.
pub type RawFields = BTreeMap<String, FieldValue>;

/// Human-meaningful output variables reported for one step.
pub type Summary = BTreeMap<String, FieldValue>;

/// A single cell from the transition log.
///
/// Cells that parse as a float become `Number`; everything else is kept
/// verbatim as `Text`. Ordering is numeric-ascending for numbers,
/// lexicographic for text, and every number sorts before every text value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Coerce a raw cell to a number when possible.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(v) => FieldValue::Number(unsigned_zero(v)),
            Err(_) => FieldValue::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

}

/// `-0.0` and `0.0` name the same key.
fn unsigned_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => {
                unsigned_zero(*a).total_cmp(&unsigned_zero(*b))
            }
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Number(_), FieldValue::Text(_)) => Ordering::Less,
            (FieldValue::Text(_), FieldValue::Number(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// Identifier of one member of the domain's closed action set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u32);

impl ActionId {
    /// Interpret a log cell as an action identifier.
    ///
    /// Actions are recorded as numbers (often written as `1.0`); anything
    /// negative, fractional or non-numeric is rejected.
    pub fn from_field(value: &FieldValue) -> Option<Self> {
        let v = value.as_f64()?;
        if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 {
            Some(ActionId(v as u32))
        } else {
            None
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of actions available in a domain.
///
/// Each action owns a fixed slot, so per-action storage can be a plain
/// vector indexed by [`ActionSpace::slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpace {
    actions: Vec<ActionId>,
}

impl ActionSpace {
    /// Build from the configured action list. Duplicates are dropped,
    /// first occurrence wins.
    pub fn new(actions: impl IntoIterator<Item = ActionId>) -> Self {
        let mut out: Vec<ActionId> = Vec::new();
        for a in actions {
            if !out.contains(&a) {
                out.push(a);
            }
        }
        Self { actions: out }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[ActionId] {
        &self.actions
    }

    pub fn slot(&self, action: ActionId) -> Option<usize> {
        self.actions.iter().position(|a| *a == action)
    }

    pub fn action_at(&self, slot: usize) -> Option<ActionId> {
        self.actions.get(slot).copied()
    }
}

/// Identity of a transition set: `(time step, trajectory, policy)`.
///
/// The derived ordering is lexicographic in field order, which is the
/// order the database is kept sorted by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub time_step: FieldValue,
    pub trajectory: FieldValue,
    pub policy: FieldValue,
}

impl IdentityKey {
    pub fn new(
        time_step: impl Into<FieldValue>,
        trajectory: impl Into<FieldValue>,
        policy: impl Into<FieldValue>,
    ) -> Self {
        Self {
            time_step: time_step.into(),
            trajectory: trajectory.into(),
            policy: policy.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(time step {}, trajectory {}, policy {})",
            self.time_step, self.trajectory, self.policy
        )
    }
}
