// src/policy.rs
//
// Policy interface consumed by the stitching engine.
//
// A policy looks at the transition set the engine is about to stitch to
// and names the action to take there. Policies must be pure with respect
// to the engine: same set -> same action.
//
// Provided:
// - any `Fn(&TransitionSet) -> ActionId` closure
// - ConstantPolicy: always the same action
// - ThresholdPolicy: compares one raw field against a threshold
// - PolicySpec: CLI-friendly textual form of the above

use std::fmt;

use crate::database::TransitionSet;
use crate::types::ActionId;

pub trait Policy {
    /// Short identifier used in logs and metadata.
    fn name(&self) -> String {
        "custom".to_string()
    }

    fn select_action(&self, set: &TransitionSet) -> ActionId;
}

impl<F> Policy for F
where
    F: Fn(&TransitionSet) -> ActionId,
{
    fn select_action(&self, set: &TransitionSet) -> ActionId {
        self(set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantPolicy {
    pub action: ActionId,
}

impl ConstantPolicy {
    pub fn new(action: ActionId) -> Self {
        Self { action }
    }
}

impl Policy for ConstantPolicy {
    fn name(&self) -> String {
        format!("constant:{}", self.action)
    }

    fn select_action(&self, _set: &TransitionSet) -> ActionId {
        self.action
    }
}

/// `above` when `field >= threshold`, otherwise `below`.
///
/// The field is read from the set's additional (raw) fields; a missing or
/// non-numeric field selects `below`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    pub field: String,
    pub threshold: f64,
    pub above: ActionId,
    pub below: ActionId,
}

impl Policy for ThresholdPolicy {
    fn name(&self) -> String {
        format!(
            "threshold:{}:{}:{}:{}",
            self.field, self.threshold, self.above, self.below
        )
    }

    fn select_action(&self, set: &TransitionSet) -> ActionId {
        let value = set
            .additional_fields()
            .and_then(|f| f.get(&self.field))
            .and_then(|v| v.as_f64());
        match value {
            Some(v) if v >= self.threshold => self.above,
            _ => self.below,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicySpecError(pub String);

impl fmt::Display for PolicySpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid policy {:?}; expected constant:A or threshold:FIELD:T:ABOVE:BELOW",
            self.0
        )
    }
}

impl std::error::Error for PolicySpecError {}

/// Textual policy description, e.g. `constant:1` or `threshold:ERC:70:1:0`.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicySpec {
    Constant(ConstantPolicy),
    Threshold(ThresholdPolicy),
}

impl PolicySpec {
    pub fn parse(s: &str) -> Result<Self, PolicySpecError> {
        let err = || PolicySpecError(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let action = |p: &str| p.trim().parse::<u32>().map(ActionId).map_err(|_| err());

        match parts.as_slice() {
            [kind, a] if kind.eq_ignore_ascii_case("constant") => {
                Ok(PolicySpec::Constant(ConstantPolicy::new(action(a)?)))
            }
            [kind, field, t, above, below] if kind.eq_ignore_ascii_case("threshold") => {
                if field.trim().is_empty() {
                    return Err(err());
                }
                Ok(PolicySpec::Threshold(ThresholdPolicy {
                    field: field.trim().to_string(),
                    threshold: t.trim().parse::<f64>().map_err(|_| err())?,
                    above: action(above)?,
                    below: action(below)?,
                }))
            }
            _ => Err(err()),
        }
    }
}

impl Policy for PolicySpec {
    fn name(&self) -> String {
        match self {
            PolicySpec::Constant(p) => p.name(),
            PolicySpec::Threshold(p) => p.name(),
        }
    }

    fn select_action(&self, set: &TransitionSet) -> ActionId {
        match self {
            PolicySpec::Constant(p) => p.select_action(set),
            PolicySpec::Threshold(p) => p.select_action(set),
        }
    }
}
