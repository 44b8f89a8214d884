// src/reward.rs
//
// Discounted returns over synthesized trajectories.
//
// A reward reads one step's summary and yields a scalar; the return of a
// trajectory is sum_t discount^t * r_t and the return of a batch is the
// sum over its trajectories.

use std::collections::BTreeMap;
use std::fmt;

use crate::metrics::OnlineStats;
use crate::trajectory::{StepRecord, Trajectory};

#[derive(Debug, Clone, PartialEq)]
pub enum RewardError {
    /// A weighted variable is absent or non-numeric in a step summary.
    MissingVariable { step_idx: u32, variable: String },
    /// A weight spec could not be parsed.
    InvalidSpec(String),
}

impl fmt::Display for RewardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardError::MissingVariable { step_idx, variable } => write!(
                f,
                "Step {} has no numeric summary variable '{}'",
                step_idx, variable
            ),
            RewardError::InvalidSpec(s) => write!(
                f,
                "invalid reward spec {:?}; expected NAME:WEIGHT[,NAME:WEIGHT...]",
                s
            ),
        }
    }
}

impl std::error::Error for RewardError {}

pub trait Reward {
    fn step_reward(&self, step: &StepRecord) -> Result<f64, RewardError>;

    /// Per-step discount factor.
    fn discount(&self) -> f64 {
        1.0
    }

    fn trajectory_return(&self, trajectory: &Trajectory) -> Result<f64, RewardError> {
        let gamma = self.discount();
        let mut total = 0.0;
        let mut factor = 1.0;
        for step in &trajectory.steps {
            total += factor * self.step_reward(step)?;
            factor *= gamma;
        }
        Ok(total)
    }

    fn batch_return(&self, trajectories: &[Trajectory]) -> Result<f64, RewardError> {
        trajectories
            .iter()
            .map(|t| self.trajectory_return(t))
            .sum()
    }

    /// Distribution of per-trajectory returns.
    fn return_stats(&self, trajectories: &[Trajectory]) -> Result<OnlineStats, RewardError> {
        let mut stats = OnlineStats::default();
        for t in trajectories {
            stats.add(self.trajectory_return(t)?);
        }
        Ok(stats)
    }
}

/// Weighted sum of summary variables.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearReward {
    pub weights: BTreeMap<String, f64>,
    pub discount: f64,
}

impl LinearReward {
    pub fn new(weights: BTreeMap<String, f64>, discount: f64) -> Self {
        Self { weights, discount }
    }

    /// Parse `reward:1,cost:-0.5`. A bare name gets weight 1.
    pub fn parse(spec: &str, discount: f64) -> Result<Self, RewardError> {
        let err = || RewardError::InvalidSpec(spec.to_string());
        let mut weights = BTreeMap::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            // Names may contain spaces but not the final ':'.
            let (name, weight) = match part.rsplit_once(':') {
                Some((name, w)) => (name.trim(), w.trim().parse::<f64>().map_err(|_| err())?),
                None => (part, 1.0),
            };
            if name.is_empty() {
                return Err(err());
            }
            weights.insert(name.to_string(), weight);
        }
        if weights.is_empty() {
            return Err(err());
        }
        Ok(Self { weights, discount })
    }
}

impl Reward for LinearReward {
    fn step_reward(&self, step: &StepRecord) -> Result<f64, RewardError> {
        let mut r = 0.0;
        for (name, w) in &self.weights {
            let v = step.value(name).ok_or_else(|| RewardError::MissingVariable {
                step_idx: step.step_idx,
                variable: name.clone(),
            })?;
            r += w * v;
        }
        Ok(r)
    }

    fn discount(&self) -> f64 {
        self.discount
    }
}
