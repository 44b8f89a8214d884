//! Stitching scenarios.
//!
//! - Two-entry database: nearest, then the other, then exhaustion
//! - Testing domain, horizon 2, constant action 1
//! - No-reuse: no set is chosen twice within one generate call
//! - Biased database: sets lacking the chosen action are skipped

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use mfmc::config::{DomainConfig, EngineConfig};
use mfmc::database::{TransitionDatabase, TransitionRow, UNUSED_EPOCH};
use mfmc::engine::{BatchStats, StitchError, StitchingEngine};
use mfmc::logging::{BuildEvent, EventSink, StepEvent};
use mfmc::normalizer::{compute_variances, DiagonalMetric, MemoryCache};
use mfmc::policy::{ConstantPolicy, ThresholdPolicy};
use mfmc::surrogate::SurrogateBuilder;
use mfmc::trajectory::{Outcome, STITCH_DISTANCE_KEY};
use mfmc::types::{ActionId, ActionSpace, FieldValue, IdentityKey, RawFields, Summary};
use mfmc::TransitionSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const TESTING_CSV: &str = "\
time step,trajectory identifier,policy identifier,action,one start,one end,reward,
0,0,0,0,0,1,0,
0,0,0,1,0,1,0,
0,1,0,0,1,0,0,
0,1,0,1,1,0,0,
";

fn write_log(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn testing_engine(dir: &Path, body: &str) -> StitchingEngine {
    let log = write_log(dir, "transitions.csv", body);
    let mut cache = MemoryCache::new();
    SurrogateBuilder::new(DomainConfig::testing(), &log)
        .cache(&mut cache)
        .build()
        .unwrap()
        .engine
}

/// Records which sets were stitched.
#[derive(Default)]
struct RecordingSink {
    chosen: Vec<usize>,
    batches: Vec<BatchStats>,
}

impl EventSink for RecordingSink {
    fn log_build(&mut self, _event: &BuildEvent) {}

    fn log_step(&mut self, event: &StepEvent) {
        self.chosen.push(event.set_idx);
    }

    fn log_batch(&mut self, stats: &BatchStats) {
        self.batches.push(*stats);
    }
}

fn one_feature_row(traj: f64, action: u32, x: f64) -> TransitionRow {
    let mut raw = RawFields::new();
    raw.insert("x".to_string(), FieldValue::Number(x));
    TransitionRow {
        key: IdentityKey::new(0.0, traj, 0.0),
        action: ActionId(action),
        pre_state: vec![x],
        post_state: vec![x],
        summary: Summary::new(),
        raw_fields: raw,
        is_initial: true,
        is_terminal: false,
    }
}

#[test]
fn two_entry_database_ranks_then_exhausts() {
    // A at 0.0, B at 10.0; query at 10.
    let rows = vec![
        one_feature_row(0.0, 0, 0.0),
        one_feature_row(0.0, 1, 0.0),
        one_feature_row(1.0, 0, 10.0),
        one_feature_row(1.0, 1, 10.0),
    ];
    let variances = compute_variances(rows.iter().map(|r| r.raw_fields.clone()));
    let metric = DiagonalMetric::from_variances(&["x".to_string()], &variances, None).unwrap();
    let w = metric.weights()[0];
    assert!((w - 1.0 / 25.0).abs() < 1e-15);

    let db = TransitionDatabase::build(rows, ActionSpace::new([ActionId(0), ActionId(1)]), 1)
        .unwrap();
    let mut engine = StitchingEngine::new(db, metric, EngineConfig::default()).unwrap();
    engine.begin_generation();

    let (b, d_b) = engine.nearest_unused(&[10.0]).unwrap();
    assert_eq!(engine.database().sets()[b].pre_state(), &[10.0]);
    assert_eq!(d_b, 0.0);
    engine.mark_used(b);

    let (a, d_a) = engine.nearest_unused(&[10.0]).unwrap();
    assert_eq!(engine.database().sets()[a].pre_state(), &[0.0]);
    assert!((d_a - (w * 100.0).sqrt()).abs() < 1e-12);
    engine.mark_used(a);

    match engine.nearest_unused(&[10.0]) {
        Err(StitchError::Exhausted {
            generation,
            database_size,
            ..
        }) => {
            assert_eq!(generation, engine.generation());
            assert_eq!(database_size, 2);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[test]
fn testing_domain_distances_use_inverse_variance() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = testing_engine(dir.path(), TESTING_CSV);
    assert_eq!(engine.index().metric().weights(), &[4.0]);
    engine.begin_generation();

    let (first, d1) = engine.nearest_unused(&[10.0]).unwrap();
    assert_eq!(d1, 18.0);
    engine.mark_used(first);
    let (_, d2) = engine.nearest_unused(&[10.0]).unwrap();
    assert_eq!(d2, 20.0);
}

#[test]
fn horizon_two_constant_action_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = testing_engine(dir.path(), TESTING_CSV);
    let out = engine
        .generate(1, 2, &ConstantPolicy::new(ActionId(1)))
        .unwrap();

    assert_eq!(out.len(), 1);
    let t = &out[0];
    assert_eq!(t.steps.len(), 2);
    assert_eq!(t.outcome, Outcome::HorizonReached);
    for step in &t.steps {
        assert_eq!(step.action, ActionId(1));
        assert_eq!(step.summary["action"], FieldValue::Number(1.0));
        assert!(step.summary.contains_key(STITCH_DISTANCE_KEY));
        assert!(step.summary.contains_key("reward"));
    }
    // Each state maps exactly onto the other set's pre-state.
    assert_eq!(t.total_stitch_distance(), 0.0);
}

#[test]
fn third_step_in_testing_domain_exhausts() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = testing_engine(dir.path(), TESTING_CSV);
    let err = engine
        .generate(1, 3, &ConstantPolicy::new(ActionId(0)))
        .unwrap_err();
    assert_eq!(
        err,
        StitchError::Exhausted {
            generation: 1,
            database_size: 2,
            k: 2
        }
    );
}

fn random_database(seed: u64, sets: usize) -> TransitionDatabase {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rows = Vec::new();
    for i in 0..sets {
        let t = (i % 10) as f64;
        let traj = (i / 10) as f64;
        let x: f64 = rng.gen_range(0.0..100.0);
        let y: f64 = rng.gen_range(0.0..1.0);
        for action in 0..2u32 {
            let mut raw = RawFields::new();
            raw.insert("y".to_string(), FieldValue::Number(y));
            let mut summary = Summary::new();
            summary.insert("x".to_string(), FieldValue::Number(x));
            rows.push(TransitionRow {
                key: IdentityKey::new(t, traj, 0.0),
                action: ActionId(action),
                pre_state: vec![x, y],
                post_state: vec![x + if action == 0 { -3.0 } else { 3.0 }, y],
                summary,
                raw_fields: raw,
                is_initial: t == 0.0,
                is_terminal: false,
            });
        }
    }
    TransitionDatabase::build(rows, ActionSpace::new([ActionId(0), ActionId(1)]), 2).unwrap()
}

#[test]
fn no_set_is_chosen_twice_in_one_batch() {
    let db = random_database(3, 200);
    let mut engine =
        StitchingEngine::new(db, DiagonalMetric::new(vec![0.01, 1.0]), EngineConfig::default())
            .unwrap();
    let policy = ThresholdPolicy {
        field: "y".to_string(),
        threshold: 0.5,
        above: ActionId(1),
        below: ActionId(0),
    };

    for _ in 0..3 {
        let mut sink = RecordingSink::default();
        let out = engine.generate_with_sink(10, 12, &policy, &mut sink).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(sink.chosen.len(), 120);

        let unique: BTreeSet<usize> = sink.chosen.iter().copied().collect();
        assert_eq!(unique.len(), sink.chosen.len(), "a set was stitched twice");

        let gen = engine.generation();
        for idx in &sink.chosen {
            assert_eq!(engine.database().sets()[*idx].last_used_epoch(), gen);
        }
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0].steps, 120);
    }
}

#[test]
fn biased_database_skips_sets_without_the_action() {
    // The only start lacks action 1; the next-nearest set has it.
    let body = "\
time step,trajectory identifier,policy identifier,action,one start,one end,reward,
0,0,0,0,0,0,0,
1,0,0,0,1,0,5,
1,0,0,1,1,0,7,
";
    let dir = tempfile::tempdir().unwrap();
    let mut engine = testing_engine(dir.path(), body);
    assert_eq!(engine.database().initial_sets().len(), 1);

    let out = engine
        .generate(1, 1, &ConstantPolicy::new(ActionId(1)))
        .unwrap();
    let step = &out[0].steps[0];
    assert_eq!(step.action, ActionId(1));
    assert_eq!(step.summary["reward"], FieldValue::Number(7.0));
    // var(one start) over [0, 1, 1] = 2/9, so w = 4.5.
    assert!((step.stitch_distance - 4.5f64.sqrt()).abs() < 1e-12);
    assert_eq!(engine.last_batch_stats().rejections, 1);

    let start = engine
        .database()
        .find(&IdentityKey::new(0.0, 0.0, 0.0))
        .unwrap();
    let chosen = engine
        .database()
        .find(&IdentityKey::new(1.0, 0.0, 0.0))
        .unwrap();
    assert_eq!(engine.database().sets()[start].last_used_epoch(), UNUSED_EPOCH);
    assert_eq!(
        engine.database().sets()[chosen].last_used_epoch(),
        engine.generation()
    );

    // A second step has nowhere left to go.
    let err = engine
        .generate(1, 2, &ConstantPolicy::new(ActionId(1)))
        .unwrap_err();
    assert!(matches!(err, StitchError::Exhausted { .. }));
}

#[test]
fn closure_policies_see_the_candidate_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = testing_engine(dir.path(), TESTING_CSV);
    let flip = |set: &TransitionSet| {
        if set.pre_state()[0] < 0.5 {
            ActionId(1)
        } else {
            ActionId(0)
        }
    };
    let out = engine.generate(1, 2, &flip).unwrap();
    assert_eq!(out[0].steps.len(), 2);
    assert_ne!(out[0].steps[0].action, out[0].steps[1].action);
}
