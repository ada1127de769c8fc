//! Chunked reading of header-having event logs.
//!
//! A [`ChunkSource`] resolves its declared columns against the header once,
//! then yields batches of at most `chunk_size` decoded [`EventRecord`]s until
//! the underlying reader is exhausted. Malformed rows never abort the pass:
//! they are skipped, counted in the [`SourceReport`] and logged.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::measure::{parse_yyyymmdd, EntityId, MeasureKind, MeasureSpec};

const MAX_REPORTED_ERRORS: usize = 16;

pub const DEFAULT_ENTITY_COLUMN: &str = "msno";
pub const DEFAULT_DATE_COLUMN: &str = "date";

/// Where a log lives and which of its columns carry the entity key and date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_entity_column")]
    pub entity_column: String,
    #[serde(default)]
    pub date_column: Option<String>,
}

fn default_entity_column() -> String {
    DEFAULT_ENTITY_COLUMN.to_string()
}

impl LogSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entity_column: default_entity_column(),
            date_column: None,
        }
    }

    pub fn with_date_column(mut self, column: &str) -> Self {
        self.date_column = Some(column.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub entity_id: EntityId,
    pub date: Option<NaiveDate>,
    /// One slot per declared measure, in declaration order. `None` means the
    /// cell was empty and the measure is unobserved for this row.
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u64,
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub chunks: u64,
    pub records_read: u64,
    pub records_skipped: u64,
    pub skipped_by_reason: BTreeMap<String, u64>,
    pub first_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("row has {found} columns, header has {expected}")]
    ColumnCount { found: usize, expected: usize },
    #[error("empty entity id")]
    EmptyEntity,
    #[error("unparseable date '{value}'")]
    ParseDate { value: String },
    #[error("unparseable value '{value}' in column {column}")]
    ParseMeasure { column: String, value: String },
    #[error("undecodable row: {0}")]
    Decode(String),
}

impl RecordError {
    fn reason(&self) -> &'static str {
        match self {
            Self::ColumnCount { .. } => "column_count",
            Self::EmptyEntity => "empty_entity",
            Self::ParseDate { .. } => "parse_date",
            Self::ParseMeasure { .. } => "parse_measure",
            Self::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Clone)]
enum ResolvedMeasure {
    Column(usize),
    Difference(usize, usize),
    DaysFrom(usize, NaiveDate),
}

#[derive(Debug, Clone)]
struct ColumnPlan {
    width: usize,
    entity: usize,
    date: Option<usize>,
    measures: Vec<ResolvedMeasure>,
    header: StringRecord,
}

impl ColumnPlan {
    fn resolve(
        header: &StringRecord,
        source: &LogSourceConfig,
        measures: &[MeasureSpec],
        label: &str,
    ) -> Result<Self, PipelineError> {
        let lookup = |column: &str| -> Result<usize, PipelineError> {
            header
                .iter()
                .position(|name| name.trim() == column)
                .ok_or_else(|| PipelineError::SchemaMismatch {
                    column: column.to_string(),
                    source_label: label.to_string(),
                })
        };

        let entity = lookup(&source.entity_column)?;
        let date = match &source.date_column {
            Some(column) => Some(lookup(column)?),
            None => None,
        };

        let mut resolved = Vec::with_capacity(measures.len());
        for measure in measures {
            resolved.push(match &measure.kind {
                MeasureKind::Column { column } => ResolvedMeasure::Column(lookup(column)?),
                MeasureKind::Difference {
                    minuend,
                    subtrahend,
                } => ResolvedMeasure::Difference(lookup(minuend)?, lookup(subtrahend)?),
                MeasureKind::DaysFrom { column, reference } => {
                    ResolvedMeasure::DaysFrom(lookup(column)?, *reference)
                }
            });
        }

        Ok(Self {
            width: header.len(),
            entity,
            date,
            measures: resolved,
            header: header.clone(),
        })
    }

    fn decode(&self, record: &StringRecord) -> Result<EventRecord, RecordError> {
        if record.len() != self.width {
            return Err(RecordError::ColumnCount {
                found: record.len(),
                expected: self.width,
            });
        }

        let entity_id = record.get(self.entity).unwrap_or_default().trim();
        if entity_id.is_empty() {
            return Err(RecordError::EmptyEntity);
        }

        let date = match self.date {
            Some(idx) => {
                let raw = record.get(idx).unwrap_or_default();
                Some(parse_yyyymmdd(raw).ok_or_else(|| RecordError::ParseDate {
                    value: raw.to_string(),
                })?)
            }
            None => None,
        };

        let mut values = Vec::with_capacity(self.measures.len());
        for measure in &self.measures {
            let value = match *measure {
                ResolvedMeasure::Column(idx) => self.number(record, idx)?,
                ResolvedMeasure::Difference(lhs, rhs) => {
                    match (self.number(record, lhs)?, self.number(record, rhs)?) {
                        (Some(a), Some(b)) => Some(a - b),
                        _ => None,
                    }
                }
                // An unreadable date only leaves this measure unobserved.
                ResolvedMeasure::DaysFrom(idx, reference) => record
                    .get(idx)
                    .and_then(parse_yyyymmdd)
                    .map(|date| (date - reference).num_days() as f64),
            };
            values.push(value.map(normalize_zero));
        }

        Ok(EventRecord {
            entity_id: entity_id.to_string(),
            date,
            values,
        })
    }

    fn number(&self, record: &StringRecord, idx: usize) -> Result<Option<f64>, RecordError> {
        let raw = record.get(idx).unwrap_or_default().trim();
        if raw.is_empty() {
            return Ok(None);
        }
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(RecordError::ParseMeasure {
                column: self.header.get(idx).unwrap_or_default().to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

// -0.0 and 0.0 compare equal but print differently; min/max must not depend
// on which one arrived first.
fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

pub struct ChunkSource<R: Read> {
    reader: csv::Reader<R>,
    plan: ColumnPlan,
    chunk_size: usize,
    next_index: u64,
    exhausted: bool,
    row: StringRecord,
    report: SourceReport,
}

impl ChunkSource<Box<dyn Read + Send>> {
    /// Opens a log file for chunked reading. With the `zip-archives` feature a
    /// `.zip` path is read through its first CSV entry.
    pub fn open(
        source: &LogSourceConfig,
        measures: &[MeasureSpec],
        chunk_size: usize,
    ) -> Result<Self, PipelineError> {
        let reader = open_log_reader(&source.path)?;
        let label = source.path.display().to_string();
        ChunkSource::from_reader(reader, &label, source, measures, chunk_size)
    }
}

impl<R: Read> ChunkSource<R> {
    pub fn from_reader(
        reader: R,
        label: &str,
        source: &LogSourceConfig,
        measures: &[MeasureSpec],
        chunk_size: usize,
    ) -> Result<Self, PipelineError> {
        if chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk_size must be > 0".to_string(),
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let header = reader.headers()?.clone();
        let plan = ColumnPlan::resolve(&header, source, measures, label)?;

        info!(
            component = "source",
            event = "source.open",
            source = label,
            columns = header.len(),
            measures = measures.len(),
            chunk_size = chunk_size
        );

        Ok(Self {
            reader,
            plan,
            chunk_size,
            next_index: 0,
            exhausted: false,
            row: StringRecord::new(),
            report: SourceReport {
                source: label.to_string(),
                ..SourceReport::default()
            },
        })
    }

    /// Next batch of decoded records, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, PipelineError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(self.chunk_size.min(65_536));
        while records.len() < self.chunk_size {
            match self.reader.read_record(&mut self.row) {
                Ok(true) => {}
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    self.report.records_read += 1;
                    let line = err.position().map(|pos| pos.line());
                    self.skip(line, RecordError::Decode(err.to_string()));
                    continue;
                }
            }

            self.report.records_read += 1;
            match self.plan.decode(&self.row) {
                Ok(record) => records.push(record),
                Err(err) => {
                    let line = self.row.position().map(|pos| pos.line());
                    self.skip(line, err);
                }
            }
        }

        if records.is_empty() && self.exhausted {
            info!(
                component = "source",
                event = "source.exhausted",
                source = %self.report.source,
                chunks = self.report.chunks,
                records_read = self.report.records_read,
                records_skipped = self.report.records_skipped
            );
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.report.chunks += 1;
        debug!(
            component = "source",
            event = "source.chunk.read",
            chunk_index = index,
            records = records.len()
        );

        Ok(Some(Chunk { index, records }))
    }

    pub fn into_report(self) -> SourceReport {
        self.report
    }

    fn skip(&mut self, line: Option<u64>, err: RecordError) {
        self.report.records_skipped += 1;
        *self
            .report
            .skipped_by_reason
            .entry(err.reason().to_string())
            .or_insert(0) += 1;
        let message = match line {
            Some(line) => format!("line {line}: {err}"),
            None => err.to_string(),
        };
        warn!(
            component = "source",
            event = "source.record.skipped",
            source = %self.report.source,
            reason = err.reason(),
            details = %message
        );
        if self.report.first_errors.len() < MAX_REPORTED_ERRORS {
            self.report.first_errors.push(message);
        }
    }
}

impl<R: Read> Iterator for ChunkSource<R> {
    type Item = Result<Chunk, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(err) => {
                self.exhausted = true;
                Some(Err(err))
            }
        }
    }
}

pub fn open_log_reader(path: &Path) -> Result<Box<dyn Read + Send>, PipelineError> {
    #[cfg(feature = "zip-archives")]
    {
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip {
            return open_zip_entry(path);
        }
    }

    Ok(Box::new(File::open(path)?))
}

/// Unpacks the first CSV entry into an anonymous temp file so the log can be
/// streamed without holding the decompressed entry in memory.
#[cfg(feature = "zip-archives")]
fn open_zip_entry(path: &Path) -> Result<Box<dyn Read + Send>, PipelineError> {
    use std::io::{Seek, SeekFrom};

    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut spool = tempfile::tempfile()?;
        let bytes = std::io::copy(&mut entry, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;
        info!(
            component = "source",
            event = "source.archive.unpacked",
            path = %path.display(),
            entry = entry.name(),
            bytes = bytes
        );
        return Ok(Box::new(spool));
    }

    Err(PipelineError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}
