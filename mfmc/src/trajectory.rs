// src/trajectory.rs
//
// Synthesized trajectory records and their on-disk format.
//
// Design:
// - StepRecord: one stitched step (action, realized distance, summary)
// - Trajectory: ordered steps plus how the rollout ended
// - TrajectoryWriter: JSON Lines records + versioned JSON metadata

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ActionId, FieldValue, Summary};

/// Current trajectory format version.
/// Increment when changing the record schema.
pub const TRAJECTORY_VERSION: u32 = 1;

/// Summary key holding the chosen action.
pub const ACTION_KEY: &str = "action";

/// Summary key holding the realized stitching distance.
pub const STITCH_DISTANCE_KEY: &str = "stitch distance";

/// A single stitched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step index within the trajectory.
    pub step_idx: u32,
    /// Action the policy chose.
    pub action: ActionId,
    /// Metric distance between the query state and the stitched set.
    pub stitch_distance: f64,
    /// Whether the stitched set ends the trajectory.
    pub terminal: bool,
    /// Summary variables of the chosen result, with `action` and
    /// `stitch distance` merged in.
    pub summary: Summary,
}

impl StepRecord {
    /// Numeric summary variable, if present.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.summary.get(name).and_then(FieldValue::as_f64)
    }
}

/// How a rollout stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Terminal,
    HorizonReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Position within the batch that produced it.
    pub trajectory_idx: u32,
    pub steps: Vec<StepRecord>,
    pub outcome: Outcome,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The per-step summaries, in order.
    pub fn summaries(&self) -> impl Iterator<Item = &Summary> + '_ {
        self.steps.iter().map(|s| &s.summary)
    }

    pub fn total_stitch_distance(&self) -> f64 {
        self.steps.iter().map(|s| s.stitch_distance).sum()
    }
}

/// Metadata for a synthesized trajectory batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    /// Trajectory format version.
    pub trajectory_version: u32,
    /// Crate version that produced the batch.
    pub generator_version: String,
    /// Domain name.
    pub domain: String,
    /// Policy identifier.
    pub policy: String,
    pub seed: u64,
    pub horizon: u32,
    /// Rollout generation the batch was drawn in.
    pub generation: u64,
    pub num_trajectories: u32,
    /// Total number of stitched steps.
    pub num_steps: u64,
    /// Transition sets in the database.
    pub database_size: usize,
    pub mean_stitch_distance: f64,
    pub max_stitch_distance: f64,
    /// Biased-database rejections during the batch.
    pub rejections: u64,
    /// Optional discounted return of the batch.
    pub batch_return: Option<f64>,
    /// Generation timestamp (seconds since the Unix epoch).
    pub generated_at: String,
}

/// Seconds since the Unix epoch, as a string.
pub fn timestamp_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// Writes trajectory batches to an output directory.
pub struct TrajectoryWriter {
    output_dir: PathBuf,
}

impl TrajectoryWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn records_path(&self) -> PathBuf {
        self.output_dir.join("trajectories.jsonl")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join("metadata.json")
    }

    /// Write trajectories and metadata.
    ///
    /// Creates:
    /// - {output_dir}/trajectories.jsonl - one trajectory per line
    /// - {output_dir}/metadata.json - JSON metadata
    pub fn write(&self, trajectories: &[Trajectory], metadata: &TrajectoryMetadata) -> io::Result<()> {
        fs::create_dir_all(&self.output_dir)?;

        let metadata_json = serde_json::to_string_pretty(metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.metadata_path(), metadata_json)?;

        let mut file = BufWriter::new(fs::File::create(self.records_path())?);
        for trajectory in trajectories {
            let line = serde_json::to_string(trajectory)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{}", line)?;
        }
        file.flush()
    }
}

/// Read trajectories back from a `trajectories.jsonl` file.
pub fn read_trajectories(path: &Path) -> io::Result<Vec<Trajectory>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let t: Trajectory = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.push(t);
    }
    Ok(out)
}
