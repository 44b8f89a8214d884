// src/normalizer.rs
//
// Feature normalisation for the stitching metric.
//
// The metric is a diagonal Mahalanobis form: axis i is weighted by
// 1 / variance_i of the reference dataset. A zero variance is floored to
// 1.0. In non-stationary domains one temporal axis instead receives
// DOMINANT_WEIGHT so neighbours effectively must share its value.
//
// Variances are computed once per reference dataset and kept in a
// get-or-compute cache keyed by the dataset's content digest.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::DomainConfig;
use crate::ingest::{log_digest, IngestError, RawRows, RowProcessor};
use crate::metrics::population_variance;
use crate::types::RawFields;

/// Weight given to the temporal axis of a non-stationary domain.
pub const DOMINANT_WEIGHT: f64 = 99_999_999_999_999.0;

/// Column name -> population variance.
pub type Variances = BTreeMap<String, f64>;

#[derive(Debug)]
pub enum NormalizerError {
    Ingest(IngestError),
    Cache { path: String, source: String },
    MissingVariance { feature: String },
}

impl fmt::Display for NormalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizerError::Ingest(e) => write!(f, "{}", e),
            NormalizerError::Cache { path, source } => {
                write!(f, "Variance cache '{}' unusable: {}", path, source)
            }
            NormalizerError::MissingVariance { feature } => write!(
                f,
                "Feature '{}' has no numeric variance in the reference dataset",
                feature
            ),
        }
    }
}

impl std::error::Error for NormalizerError {}

impl From<IngestError> for NormalizerError {
    fn from(e: IngestError) -> Self {
        NormalizerError::Ingest(e)
    }
}

/// Population variance of every column whose values are all numeric.
pub fn compute_variances<I>(rows: I) -> Variances
where
    I: IntoIterator<Item = RawFields>,
{
    let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut non_numeric: BTreeSet<String> = BTreeSet::new();

    for row in rows {
        for (name, value) in row {
            if non_numeric.contains(&name) {
                continue;
            }
            match value.as_f64() {
                Some(v) => columns.entry(name).or_default().push(v),
                None => {
                    columns.remove(&name);
                    non_numeric.insert(name);
                }
            }
        }
    }

    columns
        .into_iter()
        .map(|(name, xs)| {
            let var = population_variance(&xs);
            (name, var)
        })
        .collect()
}

/// Diagonal weight matrix, stored as its diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalMetric {
    weights: Vec<f64>,
}

impl DiagonalMetric {
    pub fn new(weights: Vec<f64>) -> Self {
        Self { weights }
    }

    /// Identity metric of the given dimension.
    pub fn identity(dim: usize) -> Self {
        Self {
            weights: vec![1.0; dim],
        }
    }

    /// Build inverse-variance weights for `features`. `dominant` names an
    /// axis that gets [`DOMINANT_WEIGHT`] instead of its variance.
    pub fn from_variances(
        features: &[String],
        variances: &Variances,
        dominant: Option<&str>,
    ) -> Result<Self, NormalizerError> {
        let weights = features
            .iter()
            .map(|name| {
                if dominant == Some(name.as_str()) {
                    return Ok(DOMINANT_WEIGHT);
                }
                let var = *variances
                    .get(name)
                    .ok_or_else(|| NormalizerError::MissingVariance {
                        feature: name.clone(),
                    })?;
                let var = if var == 0.0 { 1.0 } else { var };
                Ok(1.0 / var)
            })
            .collect::<Result<Vec<_>, NormalizerError>>()?;
        Ok(Self { weights })
    }

    /// Metric for a domain's pre-transition features.
    pub fn for_domain(domain: &DomainConfig, variances: &Variances) -> Result<Self, NormalizerError> {
        let dominant = if domain.non_stationary {
            Some(domain.temporal_feature.as_str())
        } else {
            None
        };
        Self::from_variances(&domain.pre_transition_variables, variances, dominant)
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    /// `sqrt((x - y)' M (x - y))`.
    pub fn distance(&self, x: &[f64], y: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(x.iter().zip(y))
            .map(|(w, (a, b))| w * (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Map a vector into the space where the metric is Euclidean.
    pub fn scale(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(x)
            .map(|(w, v)| w.sqrt() * v)
            .collect()
    }
}

/// Whether a variance lookup hit the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Computed,
}

/// Narrow get-or-compute store for derived statistics.
pub trait VarianceCache {
    fn load(&self, key: &str) -> Option<Variances>;
    fn store(&mut self, key: &str, variances: &Variances) -> Result<(), NormalizerError>;
}

/// In-process cache.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: BTreeMap<String, Variances>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VarianceCache for MemoryCache {
    fn load(&self, key: &str) -> Option<Variances> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: &str, variances: &Variances) -> Result<(), NormalizerError> {
        self.entries.insert(key.to_string(), variances.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedVariances {
    key: String,
    variances: Variances,
}

/// JSON file persisted next to the reference log.
#[derive(Debug, Clone)]
pub struct JsonFileCache {
    path: PathBuf,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<log>.variances.json`.
    pub fn for_log(log: &Path) -> Self {
        let mut p = log.as_os_str().to_owned();
        p.push(".variances.json");
        Self {
            path: PathBuf::from(p),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VarianceCache for JsonFileCache {
    fn load(&self, key: &str) -> Option<Variances> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let cached: CachedVariances = serde_json::from_str(&raw).ok()?;
        if cached.key == key {
            Some(cached.variances)
        } else {
            None
        }
    }

    fn store(&mut self, key: &str, variances: &Variances) -> Result<(), NormalizerError> {
        let cache_err = |source: String| NormalizerError::Cache {
            path: self.path.display().to_string(),
            source,
        };
        let body = serde_json::to_string_pretty(&CachedVariances {
            key: key.to_string(),
            variances: variances.clone(),
        })
        .map_err(|e| cache_err(e.to_string()))?;
        fs::write(&self.path, body).map_err(|e| cache_err(e.to_string()))
    }
}

/// Return the cached variances for `key`, computing and storing them on a miss.
pub fn get_or_compute<F>(
    cache: &mut dyn VarianceCache,
    key: &str,
    compute: F,
) -> Result<(Variances, CacheOutcome), NormalizerError>
where
    F: FnOnce() -> Result<Variances, NormalizerError>,
{
    if let Some(v) = cache.load(key) {
        return Ok((v, CacheOutcome::Hit));
    }
    let v = compute()?;
    cache.store(key, &v)?;
    Ok((v, CacheOutcome::Computed))
}

/// Variances of a reference log on disk, through `cache`.
pub fn reference_variances(
    log: &Path,
    processor: &dyn RowProcessor,
    cache: &mut dyn VarianceCache,
) -> Result<(Variances, CacheOutcome), NormalizerError> {
    let key = log_digest(log)?;
    get_or_compute(cache, &key, || {
        let rows = RawRows::open(log, processor)?.collect::<Result<Vec<_>, _>>()?;
        Ok(compute_variances(rows))
    })
}
