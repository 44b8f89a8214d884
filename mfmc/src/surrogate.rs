// src/surrogate.rs
//
// One-call construction of a stitching surrogate from files on disk.
//
//   normalization log --(variances, cached)--> DiagonalMetric
//   transition log    --(ingest, merge-insert)--> TransitionDatabase
//   metric + database --(kd-tree)--> StitchingEngine
//
// The normalization log defaults to the transition log itself.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{DomainConfig, EngineConfig};
use crate::database::{DatabaseError, TransitionDatabase};
use crate::engine::StitchingEngine;
use crate::index::IndexError;
use crate::ingest::{read_transition_rows, IngestError, NoopProcessor, RowProcessor};
use crate::normalizer::{
    reference_variances, CacheOutcome, DiagonalMetric, JsonFileCache, NormalizerError,
    VarianceCache, Variances,
};

#[derive(Debug)]
pub enum SurrogateError {
    Ingest(IngestError),
    Database(DatabaseError),
    Normalizer(NormalizerError),
    Index(IndexError),
}

impl fmt::Display for SurrogateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurrogateError::Ingest(e) => write!(f, "ingest: {}", e),
            SurrogateError::Database(e) => write!(f, "database: {}", e),
            SurrogateError::Normalizer(e) => write!(f, "normalizer: {}", e),
            SurrogateError::Index(e) => write!(f, "index: {}", e),
        }
    }
}

impl std::error::Error for SurrogateError {}

impl From<IngestError> for SurrogateError {
    fn from(e: IngestError) -> Self {
        SurrogateError::Ingest(e)
    }
}

impl From<DatabaseError> for SurrogateError {
    fn from(e: DatabaseError) -> Self {
        SurrogateError::Database(e)
    }
}

impl From<NormalizerError> for SurrogateError {
    fn from(e: NormalizerError) -> Self {
        SurrogateError::Normalizer(e)
    }
}

impl From<IndexError> for SurrogateError {
    fn from(e: IndexError) -> Self {
        SurrogateError::Index(e)
    }
}

/// A ready-to-roll engine plus what went into its metric.
pub struct Surrogate {
    pub engine: StitchingEngine,
    pub variances: Variances,
    pub cache: CacheOutcome,
}

pub struct SurrogateBuilder<'a> {
    domain: DomainConfig,
    database_path: PathBuf,
    normalization_path: Option<PathBuf>,
    processor: &'a dyn RowProcessor,
    cache: Option<&'a mut dyn VarianceCache>,
    engine: EngineConfig,
}

impl<'a> SurrogateBuilder<'a> {
    pub fn new(domain: DomainConfig, database_path: impl Into<PathBuf>) -> Self {
        Self {
            domain,
            database_path: database_path.into(),
            normalization_path: None,
            processor: &NoopProcessor,
            cache: None,
            engine: EngineConfig::default(),
        }
    }

    /// Compute variances from a different log than the one stitched from.
    pub fn normalization_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.normalization_path = Some(path.into());
        self
    }

    pub fn processor(mut self, processor: &'a dyn RowProcessor) -> Self {
        self.processor = processor;
        self
    }

    /// Use `cache` instead of `<normalization log>.variances.json`.
    pub fn cache(mut self, cache: &'a mut dyn VarianceCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    fn normalization_log(&self) -> &Path {
        self.normalization_path
            .as_deref()
            .unwrap_or(self.database_path.as_path())
    }

    pub fn build(self) -> Result<Surrogate, SurrogateError> {
        let norm_log = self.normalization_log().to_path_buf();
        let (variances, cache) = match self.cache {
            Some(cache) => reference_variances(&norm_log, self.processor, cache)?,
            None => {
                let mut file_cache = JsonFileCache::for_log(&norm_log);
                reference_variances(&norm_log, self.processor, &mut file_cache)?
            }
        };
        let metric = DiagonalMetric::for_domain(&self.domain, &variances)?;

        let rows = read_transition_rows(&self.database_path, &self.domain, self.processor)?;
        let database = TransitionDatabase::build(
            rows,
            self.domain.action_space(),
            self.domain.feature_count(),
        )?;

        let engine = StitchingEngine::new(database, metric, self.engine)?;
        Ok(Surrogate {
            engine,
            variances,
            cache,
        })
    }
}
