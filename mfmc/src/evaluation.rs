// src/evaluation.rs
//
// Comparing trajectory batches.
//
// - variable_height: value range of one variable across a batch
// - step_quantile:   quantile of a variable at one time step, taken as
//                    sorted[floor(q * n)]
// - fan_chart:       per-step quantile bands for a variable
// - median_objective: sum over variables and steps of
//                    |median_truth - median_synth| / height_truth
//                    (variables with zero height contribute nothing)
// - bootstrap:       seeded resampling with replacement
//
// Used to score a synthesized batch against ground-truth rollouts of the
// same policy.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::trajectory::Trajectory;

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// A trajectory has no numeric value for the variable at that step.
    MissingValue {
        trajectory_idx: u32,
        step_idx: usize,
        variable: String,
    },
    /// No trajectory in the batch reaches the step.
    EmptyStep { step_idx: usize },
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationError::MissingValue {
                trajectory_idx,
                step_idx,
                variable,
            } => write!(
                f,
                "Trajectory {} step {} has no numeric '{}'",
                trajectory_idx, step_idx, variable
            ),
            EvaluationError::EmptyStep { step_idx } => {
                write!(f, "No trajectory reaches step {}", step_idx)
            }
        }
    }
}

impl std::error::Error for EvaluationError {}

/// max - min of `variable` over every step of every trajectory.
pub fn variable_height(trajectories: &[Trajectory], variable: &str) -> Result<f64, EvaluationError> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for t in trajectories {
        for (step_idx, step) in t.steps.iter().enumerate() {
            let v = step.value(variable).ok_or_else(|| EvaluationError::MissingValue {
                trajectory_idx: t.trajectory_idx,
                step_idx,
                variable: variable.to_string(),
            })?;
            min = min.min(v);
            max = max.max(v);
        }
    }
    if min > max {
        return Ok(0.0);
    }
    Ok(max - min)
}

/// `sorted[floor(q * n)]`, with the index clamped to the last element.
pub fn quantile(values: &mut [f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let idx = ((q.clamp(0.0, 1.0) * values.len() as f64).floor() as usize).min(values.len() - 1);
    Some(values[idx])
}

fn step_values(
    trajectories: &[Trajectory],
    variable: &str,
    step_idx: usize,
) -> Result<Vec<f64>, EvaluationError> {
    let mut values = Vec::with_capacity(trajectories.len());
    for t in trajectories {
        // Trajectories that ended earlier do not contribute.
        if let Some(step) = t.steps.get(step_idx) {
            let v = step.value(variable).ok_or_else(|| EvaluationError::MissingValue {
                trajectory_idx: t.trajectory_idx,
                step_idx,
                variable: variable.to_string(),
            })?;
            values.push(v);
        }
    }
    if values.is_empty() {
        return Err(EvaluationError::EmptyStep { step_idx });
    }
    Ok(values)
}

pub fn step_quantile(
    trajectories: &[Trajectory],
    variable: &str,
    step_idx: usize,
    q: f64,
) -> Result<f64, EvaluationError> {
    let mut values = step_values(trajectories, variable, step_idx)?;
    quantile(&mut values, q).ok_or(EvaluationError::EmptyStep { step_idx })
}

/// Quantile bands of one variable: `bands[step][i]` is quantile
/// `quantiles[i]` at that step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanChart {
    pub variable: String,
    pub quantiles: Vec<f64>,
    pub bands: Vec<Vec<f64>>,
}

/// Longest trajectory length in the batch.
pub fn max_len(trajectories: &[Trajectory]) -> usize {
    trajectories.iter().map(|t| t.len()).max().unwrap_or(0)
}

pub fn fan_chart(
    trajectories: &[Trajectory],
    variable: &str,
    quantiles: &[f64],
) -> Result<FanChart, EvaluationError> {
    let mut bands = Vec::with_capacity(max_len(trajectories));
    for step_idx in 0..max_len(trajectories) {
        let mut values = step_values(trajectories, variable, step_idx)?;
        let band = quantiles
            .iter()
            .map(|&q| quantile(&mut values, q).ok_or(EvaluationError::EmptyStep { step_idx }))
            .collect::<Result<Vec<_>, _>>()?;
        bands.push(band);
    }
    Ok(FanChart {
        variable: variable.to_string(),
        quantiles: quantiles.to_vec(),
        bands,
    })
}

/// Median-error objective of `synthesized` against `truth`.
///
/// Steps are compared up to the shorter of the two batches' lengths.
pub fn median_objective(
    truth: &[Trajectory],
    synthesized: &[Trajectory],
    variables: &[String],
) -> Result<f64, EvaluationError> {
    let steps = max_len(truth).min(max_len(synthesized));
    let mut error = 0.0;
    for v in variables {
        let height = variable_height(truth, v)?;
        if height == 0.0 {
            continue;
        }
        for step_idx in 0..steps {
            let actual = step_quantile(truth, v, step_idx, 0.5)?;
            let synth = step_quantile(synthesized, v, step_idx, 0.5)?;
            error += (actual - synth).abs() / height;
        }
    }
    Ok(error)
}

/// Resample `trajectories` with replacement, deterministically from `seed`.
pub fn bootstrap(trajectories: &[Trajectory], seed: u64) -> Vec<Trajectory> {
    if trajectories.is_empty() {
        return Vec::new();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..trajectories.len())
        .map(|_| trajectories[rng.gen_range(0..trajectories.len())].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Outcome, StepRecord};
    use crate::types::{ActionId, FieldValue, Summary};

    fn traj(idx: u32, xs: &[f64]) -> Trajectory {
        Trajectory {
            trajectory_idx: idx,
            steps: xs
                .iter()
                .enumerate()
                .map(|(i, x)| {
                    let mut summary = Summary::new();
                    summary.insert("x".to_string(), FieldValue::Number(*x));
                    summary.insert("flat".to_string(), FieldValue::Number(3.0));
                    StepRecord {
                        step_idx: i as u32,
                        action: ActionId(0),
                        stitch_distance: 0.0,
                        terminal: false,
                        summary,
                    }
                })
                .collect(),
            outcome: Outcome::HorizonReached,
        }
    }

    #[test]
    fn quantile_floors_the_index() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&mut v, 0.5), Some(3.0));
        assert_eq!(quantile(&mut v, 0.0), Some(1.0));
        assert_eq!(quantile(&mut v, 1.0), Some(4.0));
        assert_eq!(quantile(&mut [], 0.5), None);
    }

    #[test]
    fn height_spans_all_steps() {
        let batch = vec![traj(0, &[1.0, 5.0]), traj(1, &[-2.0, 0.0])];
        assert_eq!(variable_height(&batch, "x").unwrap(), 7.0);
        assert_eq!(variable_height(&batch, "flat").unwrap(), 0.0);
        assert!(variable_height(&batch, "y").is_err());
    }

    #[test]
    fn fan_chart_bands_per_step() {
        let batch = vec![traj(0, &[1.0, 10.0]), traj(1, &[2.0, 20.0]), traj(2, &[3.0, 30.0])];
        let chart = fan_chart(&batch, "x", &[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(chart.bands, vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]]);
    }

    #[test]
    fn objective_is_zero_for_identical_batches() {
        let batch = vec![traj(0, &[1.0, 2.0]), traj(1, &[3.0, 4.0])];
        let vars = vec!["x".to_string(), "flat".to_string()];
        assert_eq!(median_objective(&batch, &batch, &vars).unwrap(), 0.0);
    }

    #[test]
    fn objective_normalises_by_truth_height() {
        let truth = vec![traj(0, &[0.0, 0.0]), traj(1, &[4.0, 4.0])];
        let synth = vec![traj(0, &[2.0, 2.0]), traj(1, &[2.0, 2.0])];
        // medians: truth 4.0, synth 2.0 at both steps; height 4.
        let err = median_objective(&truth, &synth, &["x".to_string()]).unwrap();
        assert_eq!(err, 1.0);
    }

    #[test]
    fn bootstrap_is_seeded() {
        let batch: Vec<_> = (0..10).map(|i| traj(i, &[i as f64])).collect();
        let a = bootstrap(&batch, 42);
        let b = bootstrap(&batch, 42);
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert!(a.iter().all(|t| batch.contains(t)));
    }
}
