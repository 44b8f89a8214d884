//! mfmc core library.
//!
//! Model-free Monte Carlo trajectory synthesis: a surrogate for an
//! expensive simulator built from a fixed log of observed transitions.
//! New trajectories under any policy are produced by *stitching*, i.e.
//! repeatedly jumping to the nearest previously observed transition (under
//! an inverse-variance metric) that offers the policy's chosen action, and
//! never reusing a transition within one batch.
//!
//! The binary (`src/main.rs`) is a thin CLI harness around these pieces.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - **Normalizer** (`normalizer`): per-column variances of a reference log,
//!   the diagonal metric derived from them, and a get-or-compute cache.
//! - **Ingest** (`ingest`): CSV (optionally gzip) log reader, row
//!   processing hook, column-to-feature mapping.
//! - **Database** (`database`): sorted merge-insert of rows into
//!   `TransitionSet`s, one per (time step, trajectory, policy).
//! - **Index** (`index`): k-d tree over metric-scaled pre-states.
//! - **Engine** (`engine`): `s0` / `step` / `generate` with the
//!   generation-stamped no-reuse rule.
//!
//! Around the core:
//!
//! - **Policy** / **Reward**: caller-supplied decision and scoring functions.
//! - **Evaluation**: fan charts, median-error objective, bootstrap.
//! - **Trajectory**: records and the JSONL writer.
//! - **Telemetry** / **Logging**: env-driven JSONL event sink.
//! - **Config**: domain YAML and engine knobs with env overrides.

pub mod config;
pub mod database;
pub mod engine;
pub mod evaluation;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod normalizer;
pub mod policy;
pub mod reward;
pub mod surrogate;
pub mod telemetry;
pub mod trajectory;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{ConfigError, DomainConfig, EngineConfig};
pub use database::{
    ActionResult, DatabaseBuilder, DatabaseError, TransitionDatabase, TransitionRow, TransitionSet,
    UNUSED_EPOCH,
};
pub use engine::{BatchStats, RolloutState, StitchError, StitchingEngine};
pub use index::{IndexError, Neighbor, NeighborIndex};
pub use ingest::{IngestError, NoopProcessor, RowProcessor};
pub use logging::{EventSink, NoopSink};
pub use normalizer::{
    CacheOutcome, DiagonalMetric, JsonFileCache, MemoryCache, NormalizerError, VarianceCache,
    Variances, DOMINANT_WEIGHT,
};
pub use policy::{ConstantPolicy, Policy, PolicySpec, ThresholdPolicy};
pub use reward::{LinearReward, Reward, RewardError};
pub use surrogate::{Surrogate, SurrogateBuilder, SurrogateError};
pub use telemetry::TelemetrySink;
pub use trajectory::{StepRecord, Trajectory, TrajectoryMetadata, TrajectoryWriter};
pub use types::{ActionId, ActionSpace, FieldValue, IdentityKey};
