// src/config.rs
//
// Configuration for the mfmc surrogate.
//
// Two layers:
// - DomainConfig: what the transition log looks like (feature columns,
//   identity columns, the closed action set). Loaded from YAML or taken
//   from a built-in preset.
// - EngineConfig: how the stitching engine runs (seed, neighbour cap).
//   Defaults, overridable from the environment (MFMC_SEED,
//   MFMC_MAX_NEIGHBORS); CLI flags override both.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{ActionId, ActionSpace};

/// Default hard cap on how deep the neighbour ranking is searched.
pub const DEFAULT_MAX_NEIGHBORS: usize = 10_000;

/// Factor by which k grows each time every ranked candidate is used.
pub const DEFAULT_NEIGHBOR_GROWTH: usize = 10;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: String },
    Parse { source: String },
    Validation { field: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read domain file '{}': {}", path, source)
            }
            ConfigError::Parse { source } => {
                write!(f, "Failed to parse domain YAML: {}", source)
            }
            ConfigError::Validation { field, message } => {
                write!(f, "Domain validation error in '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_action_field() -> String {
    "action".to_string()
}

fn default_time_step_field() -> String {
    "time step".to_string()
}

fn default_trajectory_field() -> String {
    "trajectory identifier".to_string()
}

fn default_policy_field() -> String {
    "policy identifier".to_string()
}

fn default_temporal_feature() -> String {
    "time step start".to_string()
}

/// Description of one domain's transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Human-readable domain name (used in logs / metadata).
    pub name: String,
    /// Ordered columns forming the pre-transition feature vector.
    pub pre_transition_variables: Vec<String>,
    /// Columns forming the post-transition vector, index-aligned with
    /// `pre_transition_variables`.
    pub post_transition_variables: Vec<String>,
    /// Columns copied into each step's summary.
    #[serde(default)]
    pub summary_variables: Vec<String>,
    /// The closed action set.
    pub possible_actions: Vec<u32>,
    #[serde(default = "default_action_field")]
    pub action_field: String,
    #[serde(default = "default_time_step_field")]
    pub time_step_field: String,
    #[serde(default = "default_trajectory_field")]
    pub trajectory_field: String,
    #[serde(default = "default_policy_field")]
    pub policy_field: String,
    /// Time step value marking a legitimate trajectory start.
    #[serde(default)]
    pub initial_time_step: f64,
    /// Optional numeric column; non-zero marks the set as terminal.
    /// When absent no state is terminal.
    #[serde(default)]
    pub terminal_field: Option<String>,
    /// Give `temporal_feature` a near-infinite weight so stitching only
    /// matches states from the same time step.
    #[serde(default)]
    pub non_stationary: bool,
    #[serde(default = "default_temporal_feature")]
    pub temporal_feature: String,
}

impl DomainConfig {
    /// The two-state testing domain: one feature, actions {0, 1}.
    pub fn testing() -> Self {
        Self {
            name: "testing".to_string(),
            pre_transition_variables: vec!["one start".to_string()],
            post_transition_variables: vec!["one end".to_string()],
            summary_variables: vec!["action".to_string(), "reward".to_string()],
            possible_actions: vec![0, 1],
            action_field: default_action_field(),
            time_step_field: default_time_step_field(),
            trajectory_field: default_trajectory_field(),
            policy_field: default_policy_field(),
            initial_time_step: 0.0,
            terminal_field: None,
            non_stationary: false,
            temporal_feature: default_temporal_feature(),
        }
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "testing" | "test" => Some(Self::testing()),
            _ => None,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: DomainConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            source: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn feature_count(&self) -> usize {
        self.pre_transition_variables.len()
    }

    pub fn action_space(&self) -> ActionSpace {
        ActionSpace::new(self.possible_actions.iter().map(|a| ActionId(*a)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pre_transition_variables.is_empty() {
            return Err(ConfigError::Validation {
                field: "pre_transition_variables".to_string(),
                message: "at least one feature is required".to_string(),
            });
        }
        if self.pre_transition_variables.len() != self.post_transition_variables.len() {
            return Err(ConfigError::Validation {
                field: "post_transition_variables".to_string(),
                message: format!(
                    "expected {} entries to match pre_transition_variables, got {}",
                    self.pre_transition_variables.len(),
                    self.post_transition_variables.len()
                ),
            });
        }
        if self.possible_actions.is_empty() {
            return Err(ConfigError::Validation {
                field: "possible_actions".to_string(),
                message: "at least one action is required".to_string(),
            });
        }
        if self.action_space().len() != self.possible_actions.len() {
            return Err(ConfigError::Validation {
                field: "possible_actions".to_string(),
                message: "actions must be unique".to_string(),
            });
        }
        if self.non_stationary
            && !self
                .pre_transition_variables
                .iter()
                .any(|v| v == &self.temporal_feature)
        {
            return Err(ConfigError::Validation {
                field: "temporal_feature".to_string(),
                message: format!(
                    "'{}' is not a pre-transition variable but non_stationary is set",
                    self.temporal_feature
                ),
            });
        }
        Ok(())
    }
}

/// Runtime knobs for the stitching engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Seed for initial-state sampling.
    pub seed: u64,
    /// Hard cap on the neighbour ranking depth before stitching fails.
    pub max_neighbors: usize,
    /// Growth factor applied to k when every ranked candidate is used.
    pub neighbor_growth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            neighbor_growth: DEFAULT_NEIGHBOR_GROWTH,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = env::var("MFMC_SEED") {
            match raw.trim().parse::<u64>() {
                Ok(v) => {
                    cfg.seed = v;
                    eprintln!("[config] MFMC_SEED = {v} (overrode default)");
                }
                Err(_) => {
                    eprintln!(
                        "[config] WARN: could not parse MFMC_SEED = {:?} as u64; using default {}",
                        raw, cfg.seed
                    );
                }
            }
        }

        if let Ok(raw) = env::var("MFMC_MAX_NEIGHBORS") {
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => {
                    cfg.max_neighbors = v;
                    eprintln!("[config] MFMC_MAX_NEIGHBORS = {v} (overrode default)");
                }
                _ => {
                    eprintln!(
                        "[config] WARN: could not parse MFMC_MAX_NEIGHBORS = {:?} as a positive integer; using default {}",
                        raw, cfg.max_neighbors
                    );
                }
            }
        }

        cfg
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
