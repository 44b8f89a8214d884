//! telemetry.rs
//!
//! Lightweight JSONL telemetry sink for mfmc.
//!
//! # Goals
//!
//! - Write one JSON object per engine event (database build, stitched
//!   step, finished batch) to a file.
//! - Controlled entirely via environment variables so experiments can
//!   turn telemetry on/off without code changes.
//!
//! # Environment variables
//!
//! - `MFMC_TELEMETRY_MODE`: `"off"` (default) disables telemetry,
//!   `"jsonl"` writes JSONL to `MFMC_TELEMETRY_PATH`.
//! - `MFMC_TELEMETRY_PATH`: Path to the JSONL file. Required when
//!   mode is `"jsonl"`.
//! - `MFMC_TELEMETRY_APPEND`: Optional. When set to `"1"`/`"true"`/`"yes"`,
//!   appends to existing files instead of truncating. Default is truncate.
//!
//! # Schema
//!
//! Every record written through the [`EventSink`] implementation carries
//! `"schema_version": 1` and an `"event"` tag (`build`, `step`, `batch`).
//! Records passed straight to [`TelemetrySink::log_json`] get the version
//! inserted by [`ensure_schema_v1`] when they lack one.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde_json::{json, Value as JsonValue};

use crate::engine::BatchStats;
use crate::logging::{BuildEvent, EventSink, StepEvent};

/// Current telemetry schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Ensure a JSON record has `schema_version: 1`.
///
/// - Object without `schema_version`: inserts it.
/// - Object with `schema_version`: left unchanged.
/// - Anything else: debug builds assert, release builds leave it alone.
pub fn ensure_schema_v1(record: &mut JsonValue) {
    match record {
        JsonValue::Object(map) => {
            map.entry("schema_version")
                .or_insert_with(|| JsonValue::Number(SCHEMA_VERSION.into()));
        }
        _ => {
            debug_assert!(
                false,
                "ensure_schema_v1: telemetry records should be JSON objects, got {:?}",
                record
            );
        }
    }
}

/// Telemetry mode, controlled by MFMC_TELEMETRY_MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Jsonl,
}

impl TelemetryMode {
    /// Parse mode from environment. Defaults to Off.
    pub fn from_env() -> Self {
        match env::var("MFMC_TELEMETRY_MODE") {
            Ok(s) => Self::parse(&s),
            Err(_) => TelemetryMode::Off,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => TelemetryMode::Jsonl,
            // Unknown values mean Off.
            _ => TelemetryMode::Off,
        }
    }
}

/// Configuration for the telemetry sink.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    /// Construct from environment variables.
    ///
    /// - mode = MFMC_TELEMETRY_MODE (default Off)
    /// - path = MFMC_TELEMETRY_PATH (required if mode == Jsonl)
    pub fn from_env() -> Self {
        let mode = TelemetryMode::from_env();

        let path = if mode == TelemetryMode::Jsonl {
            env::var("MFMC_TELEMETRY_PATH").ok().map(PathBuf::from)
        } else {
            None
        };

        TelemetryConfig {
            mode,
            path,
            append: Self::append_from_env(),
        }
    }

    /// JSONL output to `path`, truncating.
    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        TelemetryConfig {
            mode: TelemetryMode::Jsonl,
            path: Some(path.into()),
            append: false,
        }
    }

    pub fn append_from_env() -> bool {
        env::var("MFMC_TELEMETRY_APPEND")
            .ok()
            .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// A JSONL telemetry sink.
///
/// When mode == Off, all methods are no-ops.
/// When mode == Jsonl, the path is opened lazily on first use and one JSON
/// object is appended per line.
pub struct TelemetrySink {
    mode: TelemetryMode,
    path: Option<PathBuf>,
    append: bool,
    writer: Option<BufWriter<File>>,
}

impl TelemetrySink {
    /// Construct a telemetry sink from environment configuration.
    ///
    /// Never fails: an invalid configuration falls back to Off.
    pub fn from_env() -> Self {
        Self::from_config(TelemetryConfig::from_env())
    }

    pub fn from_config(cfg: TelemetryConfig) -> Self {
        TelemetrySink {
            mode: cfg.mode,
            path: cfg.path,
            append: cfg.append,
            writer: None,
        }
    }

    pub fn mode(&self) -> TelemetryMode {
        self.mode
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != TelemetryMode::Jsonl {
            return None;
        }

        if self.writer.is_none() {
            let path = match &self.path {
                Some(p) => p.clone(),
                None => {
                    // Mode Jsonl but no path.
                    self.mode = TelemetryMode::Off;
                    return None;
                }
            };

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let mut options = OpenOptions::new();
            options.create(true).write(true);
            if self.append {
                options.append(true);
            } else {
                options.truncate(true);
            }

            let file = match options.open(&path) {
                Ok(f) => f,
                Err(_) => {
                    self.mode = TelemetryMode::Off;
                    return None;
                }
            };

            self.writer = Some(BufWriter::new(file));
        }

        self.writer.as_mut()
    }

    /// Log a JSON value as a single line.
    ///
    /// Write errors disable telemetry for the rest of the process; they do
    /// not propagate into the rollout loop.
    pub fn log_json(&mut self, value: &JsonValue) {
        if self.mode != TelemetryMode::Jsonl {
            return;
        }

        let mut record = value.clone();
        ensure_schema_v1(&mut record);

        let writer = match self.ensure_writer() {
            Some(w) => w,
            None => return,
        };

        let line = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(_) => return,
        };

        if writeln!(writer, "{}", line).is_err() {
            self.mode = TelemetryMode::Off;
            self.writer = None;
        }
    }

    /// Convenience helper: log a map-like structure as JSON.
    pub fn log_map<I, K, V>(&mut self, iter: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        let mut obj = serde_json::Map::new();
        for (k, v) in iter {
            obj.insert(k.into(), v.into());
        }
        self.log_json(&JsonValue::Object(obj));
    }

    /// Flush the underlying writer, if any.
    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl EventSink for TelemetrySink {
    fn log_build(&mut self, event: &BuildEvent) {
        self.log_json(&json!({
            "schema_version": SCHEMA_VERSION,
            "event": "build",
            "rows": event.rows,
            "sets": event.sets,
            "initial_sets": event.initial_sets,
            "incomplete_sets": event.incomplete_sets,
            "feature_count": event.feature_count,
        }));
    }

    fn log_step(&mut self, event: &StepEvent) {
        self.log_json(&json!({
            "schema_version": SCHEMA_VERSION,
            "event": "step",
            "generation": event.generation,
            "trajectory": event.trajectory_idx,
            "step": event.step_idx,
            "action": event.action,
            "set": event.set_idx,
            "stitch_distance": event.stitch_distance,
            "rejections": event.rejections,
            "k": event.k,
        }));
    }

    fn log_batch(&mut self, stats: &BatchStats) {
        self.log_json(&json!({
            "schema_version": SCHEMA_VERSION,
            "event": "batch",
            "generation": stats.generation,
            "trajectories": stats.trajectories,
            "steps": stats.steps,
            "mean_stitch_distance": stats.mean_stitch_distance(),
            "max_stitch_distance": stats.max_stitch_distance,
            "rejections": stats.rejections,
            "max_k": stats.max_k,
        }));
        self.flush();
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}
