// src/engine.rs
//
// Stitching / rollout engine.
//
// Turns single-step stitches into trajectories:
//   s0()         draw a start set uniformly from the eligible starts
//   step(policy) stitch the current state to its nearest unused,
//                action-compatible neighbour and advance to the outcome
//   generate(..) run `count` rollouts inside one rollout generation
//
// States: NotStarted -> Active -> (Terminal | HorizonReached).
//
// Exclusion bookkeeping: each set carries the generation it was last
// consumed in. The engine owns the generation counter and is the single
// writer of those stamps; a new batch invalidates older stamps by bumping
// the counter, never by clearing them.
//
// All state transitions are deterministic given the seed.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::database::{TransitionDatabase, TransitionSet, UNUSED_EPOCH};
use crate::index::{IndexError, Neighbor, NeighborIndex};
use crate::logging::{EventSink, NoopSink, StepEvent};
use crate::normalizer::DiagonalMetric;
use crate::policy::Policy;
use crate::trajectory::{Outcome, StepRecord, Trajectory, ACTION_KEY, STITCH_DISTANCE_KEY};
use crate::types::{FeatureVector, FieldValue};

#[derive(Debug, Clone, PartialEq)]
pub enum StitchError {
    /// No unused, action-compatible neighbour within the k cap.
    Exhausted {
        generation: u64,
        database_size: usize,
        k: usize,
    },
    /// The database has no eligible start sets.
    NoInitialStates,
    /// `step` was called before `s0` or after the rollout ended.
    RolloutNotActive { state: RolloutState },
}

impl fmt::Display for StitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StitchError::Exhausted {
                generation,
                database_size,
                k,
            } => write!(
                f,
                "Stitching exhausted in generation {}: no unused compatible neighbour \
                 among the {} nearest of {} transition sets",
                generation, k, database_size
            ),
            StitchError::NoInitialStates => {
                write!(f, "Database has no initial transition sets to start from")
            }
            StitchError::RolloutNotActive { state } => {
                write!(f, "Cannot step a rollout in state {:?}; call s0 first", state)
            }
        }
    }
}

impl std::error::Error for StitchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RolloutState {
    NotStarted,
    Active,
    Terminal,
    HorizonReached,
}

/// Stitching statistics for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub generation: u64,
    pub trajectories: u32,
    pub steps: u64,
    pub total_stitch_distance: f64,
    pub max_stitch_distance: f64,
    pub rejections: u64,
    /// Deepest neighbour ranking any step needed.
    pub max_k: usize,
}

impl BatchStats {
    pub fn mean_stitch_distance(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.total_stitch_distance / self.steps as f64
        }
    }
}

/// A candidate accepted by the neighbour search.
#[derive(Debug)]
struct Selection<T> {
    idx: usize,
    distance: f64,
    value: T,
    rejections: u32,
    k: usize,
}

pub struct StitchingEngine {
    database: TransitionDatabase,
    index: NeighborIndex,
    config: EngineConfig,
    rng: ChaCha8Rng,
    generation: u64,
    state: RolloutState,
    pre_state: FeatureVector,
    trajectory_idx: u32,
    step_idx: u32,
    stats: BatchStats,
}

impl StitchingEngine {
    /// Index `database` under `metric` and wrap both in an engine.
    pub fn new(
        database: TransitionDatabase,
        metric: DiagonalMetric,
        config: EngineConfig,
    ) -> Result<Self, IndexError> {
        let index = NeighborIndex::build(database.sets().iter().map(|s| s.pre_state()), metric)?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            database,
            index,
            config,
            rng,
            generation: UNUSED_EPOCH,
            state: RolloutState::NotStarted,
            pre_state: Vec::new(),
            trajectory_idx: 0,
            step_idx: 0,
            stats: BatchStats::default(),
        })
    }

    pub fn database(&self) -> &TransitionDatabase {
        &self.database
    }

    pub fn index(&self) -> &NeighborIndex {
        &self.index
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current rollout generation; `UNUSED_EPOCH` before the first batch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> RolloutState {
        self.state
    }

    pub fn pre_state(&self) -> &[f64] {
        &self.pre_state
    }

    /// Statistics of the most recent generation.
    pub fn last_batch_stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Restart the start-state sampler from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Open a new rollout generation. Every stamp from earlier
    /// generations stops counting as used.
    pub fn begin_generation(&mut self) -> u64 {
        self.generation += 1;
        self.stats = BatchStats {
            generation: self.generation,
            ..BatchStats::default()
        };
        self.generation
    }

    fn is_used(&self, idx: usize) -> bool {
        self.database
            .get(idx)
            .map(|s| {
                let epoch = s.last_used_epoch();
                epoch != UNUSED_EPOCH && epoch == self.generation
            })
            .unwrap_or(true)
    }

    /// Consume a set in the current generation.
    pub fn mark_used(&mut self, idx: usize) {
        self.database.stamp(idx, self.generation);
    }

    /// Ranked search for the nearest unused candidate that `accept` takes.
    ///
    /// k starts at 1 and grows by `neighbor_growth` whenever the ranking
    /// holds no acceptable candidate, up to min(max_neighbors, len).
    /// Candidates `accept` refuses are stamped for the duration of the
    /// search so deeper rankings skip them, then released.
    fn search<T, F>(&mut self, query: &[f64], mut accept: F) -> Result<Selection<T>, StitchError>
    where
        F: FnMut(&TransitionSet) -> Option<T>,
    {
        let cap = self.config.max_neighbors.min(self.database.len());
        let growth = self.config.neighbor_growth.max(2);
        let mut k = 1usize;
        let mut rejected: Vec<usize> = Vec::new();

        let outcome = loop {
            let k_eff = k.min(cap);
            let ranking = self.index.query(query, k_eff);

            let mut found = None;
            for (idx, distance) in ranking {
                if self.is_used(idx) {
                    continue;
                }
                let verdict = self.database.get(idx).and_then(&mut accept);
                match verdict {
                    Some(value) => {
                        found = Some(Selection {
                            idx,
                            distance,
                            value,
                            rejections: rejected.len() as u32,
                            k: k_eff,
                        });
                        break;
                    }
                    None => {
                        self.database.stamp(idx, self.generation);
                        rejected.push(idx);
                    }
                }
            }

            if let Some(selection) = found {
                break Ok(selection);
            }
            if k_eff >= cap {
                break Err(StitchError::Exhausted {
                    generation: self.generation,
                    database_size: self.database.len(),
                    k: k_eff,
                });
            }
            k = k.saturating_mul(growth);
        };

        for idx in rejected {
            self.database.stamp(idx, UNUSED_EPOCH);
        }
        outcome
    }

    /// Nearest set to `query` not yet consumed in this generation.
    ///
    /// Does not consume it; see [`StitchingEngine::mark_used`].
    pub fn nearest_unused(&mut self, query: &[f64]) -> Result<Neighbor, StitchError> {
        let sel = self.search(query, |_| Some(()))?;
        Ok((sel.idx, sel.distance))
    }

    /// Start a rollout from a uniformly drawn initial set.
    ///
    /// Opens the first generation if none is open yet, so stamps written
    /// by the steps that follow always count as used.
    pub fn s0(&mut self) -> Result<&[f64], StitchError> {
        if self.generation == UNUSED_EPOCH {
            self.begin_generation();
        }
        let starts = self.database.initial_sets();
        if starts.is_empty() {
            return Err(StitchError::NoInitialStates);
        }
        let pick = starts[self.rng.gen_range(0..starts.len())];
        let set = self
            .database
            .get(pick)
            .ok_or(StitchError::NoInitialStates)?;
        self.pre_state = set.pre_state().to_vec();
        self.state = RolloutState::Active;
        self.step_idx = 0;
        Ok(&self.pre_state)
    }

    pub fn step<P>(&mut self, policy: &P) -> Result<StepRecord, StitchError>
    where
        P: Policy + ?Sized,
    {
        self.step_with_sink(policy, &mut NoopSink)
    }

    /// One stitched step, reporting it to `sink`.
    pub fn step_with_sink<P>(
        &mut self,
        policy: &P,
        sink: &mut dyn EventSink,
    ) -> Result<StepRecord, StitchError>
    where
        P: Policy + ?Sized,
    {
        if self.state != RolloutState::Active {
            return Err(StitchError::RolloutNotActive { state: self.state });
        }

        let query = self.pre_state.clone();
        let sel = self.search(&query, |set| {
            let action = policy.select_action(set);
            set.result(action).map(|r| {
                (
                    action,
                    r.post_state.clone(),
                    r.summary.clone(),
                    set.is_terminal(),
                )
            })
        })?;
        self.mark_used(sel.idx);

        let (action, post_state, mut summary, terminal) = sel.value;
        summary.insert(ACTION_KEY.to_string(), FieldValue::Number(action.0 as f64));
        summary.insert(
            STITCH_DISTANCE_KEY.to_string(),
            FieldValue::Number(sel.distance),
        );

        self.pre_state = post_state;
        if terminal {
            self.state = RolloutState::Terminal;
        }

        self.stats.steps += 1;
        self.stats.total_stitch_distance += sel.distance;
        self.stats.max_stitch_distance = self.stats.max_stitch_distance.max(sel.distance);
        self.stats.rejections += sel.rejections as u64;
        self.stats.max_k = self.stats.max_k.max(sel.k);

        sink.log_step(&StepEvent {
            generation: self.generation,
            trajectory_idx: self.trajectory_idx,
            step_idx: self.step_idx,
            action,
            set_idx: sel.idx,
            stitch_distance: sel.distance,
            rejections: sel.rejections,
            k: sel.k,
        });

        let record = StepRecord {
            step_idx: self.step_idx,
            action,
            stitch_distance: sel.distance,
            terminal,
            summary,
        };
        self.step_idx += 1;
        Ok(record)
    }

    /// `count` trajectories of at most `horizon` steps, all drawn in one
    /// fresh generation so no set is stitched twice across the batch.
    pub fn generate<P>(
        &mut self,
        count: u32,
        horizon: u32,
        policy: &P,
    ) -> Result<Vec<Trajectory>, StitchError>
    where
        P: Policy + ?Sized,
    {
        self.generate_with_sink(count, horizon, policy, &mut NoopSink)
    }

    pub fn generate_with_sink<P>(
        &mut self,
        count: u32,
        horizon: u32,
        policy: &P,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<Trajectory>, StitchError>
    where
        P: Policy + ?Sized,
    {
        self.begin_generation();
        let mut trajectories = Vec::with_capacity(count as usize);

        for trajectory_idx in 0..count {
            self.trajectory_idx = trajectory_idx;
            self.s0()?;

            let mut steps = Vec::with_capacity(horizon as usize);
            while (steps.len() as u32) < horizon && self.state == RolloutState::Active {
                steps.push(self.step_with_sink(policy, sink)?);
            }

            let outcome = if self.state == RolloutState::Terminal {
                Outcome::Terminal
            } else {
                self.state = RolloutState::HorizonReached;
                Outcome::HorizonReached
            };

            self.stats.trajectories += 1;
            trajectories.push(Trajectory {
                trajectory_idx,
                steps,
                outcome,
            });
        }

        sink.log_batch(&self.stats);
        Ok(trajectories)
    }
}
