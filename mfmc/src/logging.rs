// src/logging.rs
//
// Event sinks for the stitching engine.
// - EventSink: trait the engine reports build / step / batch events to
// - NoopSink:  discards all events
//
// The JSONL implementation lives in telemetry.rs.

use crate::database::TransitionDatabase;
use crate::engine::BatchStats;
use crate::types::ActionId;

/// Shape of a freshly built database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildEvent {
    pub rows: usize,
    pub sets: usize,
    pub initial_sets: usize,
    pub incomplete_sets: usize,
    pub feature_count: usize,
}

impl BuildEvent {
    pub fn for_database(db: &TransitionDatabase) -> Self {
        Self {
            rows: db.row_count(),
            sets: db.len(),
            initial_sets: db.initial_sets().len(),
            incomplete_sets: db.incomplete_sets().len(),
            feature_count: db.feature_count(),
        }
    }
}

/// One resolved stitching step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepEvent {
    pub generation: u64,
    pub trajectory_idx: u32,
    pub step_idx: u32,
    pub action: ActionId,
    /// Database position of the stitched set.
    pub set_idx: usize,
    pub stitch_distance: f64,
    /// Candidates rejected because they lacked the chosen action.
    pub rejections: u32,
    /// Neighbour ranking depth the search reached.
    pub k: usize,
}

/// Abstract sink for engine events.
pub trait EventSink {
    fn log_build(&mut self, event: &BuildEvent);
    fn log_step(&mut self, event: &StepEvent);
    fn log_batch(&mut self, stats: &BatchStats);
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn log_build(&mut self, _event: &BuildEvent) {
        // intentionally no-op
    }

    fn log_step(&mut self, _event: &StepEvent) {
        // intentionally no-op
    }

    fn log_batch(&mut self, _stats: &BatchStats) {
        // intentionally no-op
    }
}
