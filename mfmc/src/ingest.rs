// src/ingest.rs
//
// Transition log ingestion.
//
// The log is a comma-separated file with a header row; each data row is one
// observed transition. If the configured path does not exist, `<path>.gz` is
// tried and read through a gzip decoder.
//
// Pipeline per row:
//   csv record -> RawFields (numbers coerced) -> RowProcessor -> RowMapper
//   -> TransitionRow (consumed by TransitionDatabase::build)

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::config::DomainConfig;
use crate::database::TransitionRow;
use crate::types::{ActionId, FieldValue, IdentityKey, RawFields, Summary};

#[derive(Debug)]
pub enum IngestError {
    Io { path: String, source: String },
    Csv { path: String, source: String },
    MissingField { row: usize, field: String },
    NonNumeric { row: usize, field: String, value: String },
    InvalidAction { row: usize, value: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Io { path, source } => {
                write!(f, "Failed to read transition log '{}': {}", path, source)
            }
            IngestError::Csv { path, source } => {
                write!(f, "Malformed CSV in '{}': {}", path, source)
            }
            IngestError::MissingField { row, field } => {
                write!(f, "Row {} has no column '{}'", row, field)
            }
            IngestError::NonNumeric { row, field, value } => {
                write!(
                    f,
                    "Row {} column '{}' must be numeric, found {:?}",
                    row, field, value
                )
            }
            IngestError::InvalidAction { row, value } => {
                write!(f, "Row {} has invalid action {:?}", row, value)
            }
        }
    }
}

impl std::error::Error for IngestError {}

/// Hook for adding derived fields to a row before features are extracted.
pub trait RowProcessor {
    fn process(&self, fields: &mut RawFields);
}

/// Leaves rows untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessor;

impl RowProcessor for NoopProcessor {
    fn process(&self, _fields: &mut RawFields) {}
}

impl<F> RowProcessor for F
where
    F: Fn(&mut RawFields),
{
    fn process(&self, fields: &mut RawFields) {
        self(fields)
    }
}

/// Resolve the on-disk location of a log: the path itself, else `<path>.gz`.
pub fn resolve_log_path(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    let gz = PathBuf::from(gz);
    if gz.is_file() {
        Some(gz)
    } else {
        None
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

fn open_resolved(path: &Path) -> Result<(PathBuf, Box<dyn Read>), IngestError> {
    let resolved = resolve_log_path(path).ok_or_else(|| IngestError::Io {
        path: path.display().to_string(),
        source: "no such file (also tried .gz)".to_string(),
    })?;
    let file = File::open(&resolved).map_err(|e| IngestError::Io {
        path: resolved.display().to_string(),
        source: e.to_string(),
    })?;
    let reader: Box<dyn Read> = if is_gzip(&resolved) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok((resolved, reader))
}

/// SHA-256 of the resolved log's bytes, hex encoded.
///
/// Used as the identity of a reference dataset for cached statistics.
pub fn log_digest(path: &Path) -> Result<String, IngestError> {
    let resolved = resolve_log_path(path).ok_or_else(|| IngestError::Io {
        path: path.display().to_string(),
        source: "no such file (also tried .gz)".to_string(),
    })?;
    let io_err = |e: std::io::Error| IngestError::Io {
        path: resolved.display().to_string(),
        source: e.to_string(),
    };
    let mut file = File::open(&resolved).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Streaming iterator over the processed rows of a transition log.
pub struct RawRows<'p> {
    path: PathBuf,
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Box<dyn Read>>,
    processor: &'p dyn RowProcessor,
}

impl<'p> RawRows<'p> {
    pub fn open(path: &Path, processor: &'p dyn RowProcessor) -> Result<Self, IngestError> {
        let (resolved, reader) = open_resolved(path)?;
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader
            .headers()
            .map_err(|e| IngestError::Csv {
                path: resolved.display().to_string(),
                source: e.to_string(),
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        Ok(Self {
            path: resolved,
            headers,
            records: csv_reader.into_records(),
            processor,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for RawRows<'_> {
    type Item = Result<RawFields, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(r) => r,
            Err(e) => {
                return Some(Err(IngestError::Csv {
                    path: self.path.display().to_string(),
                    source: e.to_string(),
                }))
            }
        };

        let mut fields = RawFields::new();
        for (header, cell) in self.headers.iter().zip(record.iter()) {
            // Trailing commas in the header produce unnamed columns.
            if header.is_empty() {
                continue;
            }
            fields.insert(header.clone(), FieldValue::parse(cell));
        }
        self.processor.process(&mut fields);
        Some(Ok(fields))
    }
}

/// Maps processed raw rows onto the columns named by a [`DomainConfig`].
#[derive(Debug, Clone)]
pub struct RowMapper {
    domain: DomainConfig,
}

impl RowMapper {
    pub fn new(domain: &DomainConfig) -> Self {
        Self {
            domain: domain.clone(),
        }
    }

    fn field<'a>(
        raw: &'a RawFields,
        row: usize,
        name: &str,
    ) -> Result<&'a FieldValue, IngestError> {
        raw.get(name).ok_or_else(|| IngestError::MissingField {
            row,
            field: name.to_string(),
        })
    }

    fn numeric(raw: &RawFields, row: usize, name: &str) -> Result<f64, IngestError> {
        let value = Self::field(raw, row, name)?;
        value.as_f64().ok_or_else(|| IngestError::NonNumeric {
            row,
            field: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Extract one transition. `row` is the 1-based data row number used
    /// in error messages.
    pub fn map(&self, row: usize, raw: RawFields) -> Result<TransitionRow, IngestError> {
        let d = &self.domain;

        let pre_state = d
            .pre_transition_variables
            .iter()
            .map(|name| Self::numeric(&raw, row, name))
            .collect::<Result<Vec<_>, _>>()?;
        let post_state = d
            .post_transition_variables
            .iter()
            .map(|name| Self::numeric(&raw, row, name))
            .collect::<Result<Vec<_>, _>>()?;

        let action_value = Self::field(&raw, row, &d.action_field)?;
        let action =
            ActionId::from_field(action_value).ok_or_else(|| IngestError::InvalidAction {
                row,
                value: action_value.to_string(),
            })?;

        let key = IdentityKey {
            time_step: Self::field(&raw, row, &d.time_step_field)?.clone(),
            trajectory: Self::field(&raw, row, &d.trajectory_field)?.clone(),
            policy: Self::field(&raw, row, &d.policy_field)?.clone(),
        };

        let mut summary = Summary::new();
        for name in &d.summary_variables {
            summary.insert(name.clone(), Self::field(&raw, row, name)?.clone());
        }

        let is_initial = key.time_step.as_f64() == Some(d.initial_time_step);
        let is_terminal = match &d.terminal_field {
            Some(name) => Self::numeric(&raw, row, name)? != 0.0,
            None => false,
        };

        Ok(TransitionRow {
            key,
            action,
            pre_state,
            post_state,
            summary,
            raw_fields: raw,
            is_initial,
            is_terminal,
        })
    }
}

/// Read and map every row of a log.
pub fn read_transition_rows(
    path: &Path,
    domain: &DomainConfig,
    processor: &dyn RowProcessor,
) -> Result<Vec<TransitionRow>, IngestError> {
    let mapper = RowMapper::new(domain);
    RawRows::open(path, processor)?
        .enumerate()
        .map(|(i, raw)| raw.and_then(|raw| mapper.map(i + 1, raw)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

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

    #[test]
    fn reads_rows_and_skips_unnamed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "t.csv", TESTING_CSV);
        let rows = RawRows::open(&path, &NoopProcessor).unwrap();
        assert_eq!(rows.headers().len(), 8);
        let rows: Vec<_> = rows.collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2]["one start"], FieldValue::Number(1.0));
        assert!(!rows[0].contains_key(""));
    }

    #[test]
    fn processor_adds_derived_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "t.csv", TESTING_CSV);
        let add_delta = |f: &mut RawFields| {
            let a = f["one start"].as_f64().unwrap_or(0.0);
            let b = f["one end"].as_f64().unwrap_or(0.0);
            f.insert("delta".to_string(), FieldValue::Number(b - a));
        };
        let rows: Vec<_> = RawRows::open(&path, &add_delta)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[0]["delta"], FieldValue::Number(1.0));
        assert_eq!(rows[3]["delta"], FieldValue::Number(-1.0));
    }

    #[test]
    fn maps_rows_onto_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "t.csv", TESTING_CSV);
        let rows = read_transition_rows(&path, &DomainConfig::testing(), &NoopProcessor).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].action, ActionId(1));
        assert_eq!(rows[2].pre_state, vec![1.0]);
        assert_eq!(rows[2].post_state, vec![0.0]);
        assert!(rows.iter().all(|r| r.is_initial));
        assert!(rows.iter().all(|r| !r.is_terminal));
        assert_eq!(rows[0].summary.len(), 2);
    }

    #[test]
    fn missing_feature_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "t.csv",
            "time step,trajectory identifier,policy identifier,action,one start\n0,0,0,0,1\n",
        );
        let err = read_transition_rows(&path, &DomainConfig::testing(), &NoopProcessor)
            .unwrap_err();
        match err {
            IngestError::MissingField { row, field } => {
                assert_eq!(row, 1);
                assert_eq!(field, "one end");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn falls_back_to_gzip_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("t.csv.gz");
        let file = File::create(&gz_path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(TESTING_CSV.as_bytes()).unwrap();
        enc.finish().unwrap();

        let plain = dir.path().join("t.csv");
        assert_eq!(resolve_log_path(&plain), Some(gz_path));
        let rows = read_transition_rows(&plain, &DomainConfig::testing(), &NoopProcessor).unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "t.csv", TESTING_CSV);
        let d1 = log_digest(&path).unwrap();
        assert_eq!(d1.len(), 64);
        assert_eq!(d1, log_digest(&path).unwrap());
        write_log(dir.path(), "t.csv", "a,b\n1,2\n");
        assert_ne!(d1, log_digest(&path).unwrap());
    }
}
