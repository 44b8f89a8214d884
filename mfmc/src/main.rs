// src/main.rs
//
// Research-harness CLI entrypoint for mfmc.
//
// Constraints:
// - Domain precedence: --domain <yaml> overrides --preset; with neither,
//   the testing preset is used.
// - Engine precedence: CLI flag > MFMC_* env > default.
// - Deterministic runs via --seed.
// - Print concise run header (domain, database shape, seed, policy).
// - Telemetry is controlled by MFMC_TELEMETRY_* (see telemetry.rs); a `run`
//   record precedes the build record.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use serde_json::Value as JsonValue;

use mfmc::config::{DomainConfig, EngineConfig};
use mfmc::evaluation::{fan_chart, FanChart};
use mfmc::logging::{BuildEvent, EventSink};
use mfmc::policy::{Policy, PolicySpec};
use mfmc::reward::{LinearReward, Reward};
use mfmc::surrogate::SurrogateBuilder;
use mfmc::telemetry::TelemetrySink;
use mfmc::trajectory::{timestamp_now, TrajectoryMetadata, TrajectoryWriter, TRAJECTORY_VERSION};

#[derive(Debug, Parser)]
#[command(
    name = "mfmc",
    about = "Synthesize trajectories by stitching observed transitions (research harness)",
    version
)]
struct Args {
    /// Domain description (YAML). Overrides --preset.
    #[arg(long)]
    domain: Option<PathBuf>,

    /// Built-in domain preset.
    #[arg(long, default_value = "testing")]
    preset: String,

    /// Transition log to stitch from (CSV; `<path>.gz` is tried if absent).
    #[arg(long)]
    database: PathBuf,

    /// Log to compute feature variances from. Defaults to --database.
    #[arg(long)]
    normalization_database: Option<PathBuf>,

    /// Number of trajectories to synthesize.
    #[arg(long, default_value_t = 10)]
    count: u32,

    /// Maximum steps per trajectory.
    #[arg(long, default_value_t = 10)]
    horizon: u32,

    /// Seed for initial-state sampling. If omitted, uses MFMC_SEED (default 0).
    #[arg(long)]
    seed: Option<u64>,

    /// Neighbour ranking cap. If omitted, uses MFMC_MAX_NEIGHBORS (default 10000).
    #[arg(long)]
    max_neighbors: Option<usize>,

    /// constant:A | threshold:FIELD:T:ABOVE:BELOW
    #[arg(long, default_value = "constant:0")]
    policy: String,

    /// Summary weights, e.g. `reward:1,cost:-0.5`.
    #[arg(long)]
    reward: Option<String>,

    /// Per-step discount for --reward.
    #[arg(long, default_value_t = 1.0)]
    discount: f64,

    /// Write trajectories.jsonl + metadata.json here.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Summary variable to compute a fan chart for (repeatable). Written to
    /// fan_charts.json under --output-dir, or printed.
    #[arg(long = "fan-chart")]
    fan_chart: Vec<String>,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Quantiles drawn in each fan chart.
const FAN_QUANTILES: [f64; 7] = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];

fn load_domain(args: &Args) -> Result<DomainConfig> {
    match &args.domain {
        Some(path) => DomainConfig::from_yaml_file(path)
            .with_context(|| format!("loading domain {}", path.display())),
        None => DomainConfig::preset(&args.preset)
            .ok_or_else(|| anyhow!("unknown domain preset '{}'", args.preset)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let domain = load_domain(&args)?;
    let policy = PolicySpec::parse(&args.policy)?;
    let reward = args
        .reward
        .as_deref()
        .map(|spec| LinearReward::parse(spec, args.discount))
        .transpose()?;

    let mut engine_cfg = EngineConfig::from_env();
    if let Some(seed) = args.seed {
        engine_cfg.seed = seed;
    }
    if let Some(k) = args.max_neighbors {
        engine_cfg.max_neighbors = k;
    }

    let mut builder =
        SurrogateBuilder::new(domain.clone(), &args.database).engine_config(engine_cfg.clone());
    if let Some(norm) = &args.normalization_database {
        builder = builder.normalization_database(norm);
    }
    let surrogate = builder
        .build()
        .with_context(|| format!("building surrogate from {}", args.database.display()))?;
    let mut engine = surrogate.engine;

    let build = BuildEvent::for_database(engine.database());
    println!(
        "mfmc | domain={} | sets={} | rows={} | starts={} | variances={:?} | count={} | horizon={} | seed={} | policy={}",
        domain.name,
        build.sets,
        build.rows,
        build.initial_sets,
        surrogate.cache,
        args.count,
        args.horizon,
        engine_cfg.seed,
        policy.name()
    );
    if args.verbose > 0 {
        eprintln!(
            "[mfmc] metric weights = {:?}; incomplete sets = {}",
            engine.index().metric().weights(),
            build.incomplete_sets
        );
    }

    let mut sink = TelemetrySink::from_env();
    sink.log_map([
        ("event", JsonValue::from("run")),
        ("domain", domain.name.clone().into()),
        ("database", args.database.display().to_string().into()),
        ("seed", engine_cfg.seed.into()),
        ("count", args.count.into()),
        ("horizon", args.horizon.into()),
        ("policy", policy.name().into()),
    ]);
    sink.log_build(&build);

    let trajectories = engine
        .generate_with_sink(args.count, args.horizon, &policy, &mut sink)
        .context("generating trajectories")?;
    let stats = *engine.last_batch_stats();

    if args.verbose > 1 {
        for t in &trajectories {
            eprintln!(
                "[mfmc] trajectory {} | steps={} | outcome={:?} | stitch_distance={:.6}",
                t.trajectory_idx,
                t.len(),
                t.outcome,
                t.total_stitch_distance()
            );
        }
    }

    let batch_return = match &reward {
        Some(r) => {
            let returns = r.return_stats(&trajectories)?;
            if args.verbose > 0 {
                eprintln!(
                    "[mfmc] return per trajectory: mean={:.6} std={:.6} min={:.6} max={:.6}",
                    returns.mean(),
                    returns.stddev_population(),
                    returns.min(),
                    returns.max()
                );
            }
            Some(r.batch_return(&trajectories)?)
        }
        None => None,
    };

    println!(
        "mfmc | generation={} | trajectories={} | steps={} | mean_stitch_distance={:.6} | max_stitch_distance={:.6} | rejections={} | max_k={}{}",
        stats.generation,
        stats.trajectories,
        stats.steps,
        stats.mean_stitch_distance(),
        stats.max_stitch_distance,
        stats.rejections,
        stats.max_k,
        batch_return
            .map(|r| format!(" | return={:.6}", r))
            .unwrap_or_default()
    );

    if let Some(dir) = &args.output_dir {
        let metadata = TrajectoryMetadata {
            trajectory_version: TRAJECTORY_VERSION,
            generator_version: env!("CARGO_PKG_VERSION").to_string(),
            domain: domain.name.clone(),
            policy: policy.name(),
            seed: engine_cfg.seed,
            horizon: args.horizon,
            generation: stats.generation,
            num_trajectories: stats.trajectories,
            num_steps: stats.steps,
            database_size: build.sets,
            mean_stitch_distance: stats.mean_stitch_distance(),
            max_stitch_distance: stats.max_stitch_distance,
            rejections: stats.rejections,
            batch_return,
            generated_at: timestamp_now(),
        };
        TrajectoryWriter::new(dir)
            .write(&trajectories, &metadata)
            .with_context(|| format!("writing trajectories to {}", dir.display()))?;
        println!("mfmc | wrote {}", dir.display());
    }

    if !args.fan_chart.is_empty() {
        let charts = args
            .fan_chart
            .iter()
            .map(|v| fan_chart(&trajectories, v, &FAN_QUANTILES))
            .collect::<Result<Vec<FanChart>, _>>()
            .context("computing fan charts")?;
        let body = serde_json::to_string_pretty(&charts)?;
        match &args.output_dir {
            Some(dir) => {
                let path = dir.join("fan_charts.json");
                std::fs::write(&path, body)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("mfmc | wrote {}", path.display());
            }
            None => println!("{}", body),
        }
    }

    Ok(())
}
