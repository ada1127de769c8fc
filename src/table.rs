//! Flat per-entity tables, their CSV form and atomic publishing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::PipelineError;
use crate::measure::EntityId;

pub const TABLE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Number(f64),
    Text(String),
}

impl Value {
    /// Empty cells are missing, finite numbers are numeric, anything else is text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Self::Number(value),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Missing => String::new(),
            Self::Number(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub entity_id: EntityId,
    pub values: Vec<Value>,
}

/// One row per entity, a key column and named value columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    key_column: String,
    columns: Vec<String>,
    rows: Vec<FeatureRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub version: u32,
    pub key_column: String,
    pub columns: Vec<String>,
    pub row_count: u64,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedTable {
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub schema: TableSchema,
}

impl FeatureTable {
    pub fn new(key_column: &str, columns: Vec<String>) -> Self {
        Self {
            key_column: key_column.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn push_row(&mut self, entity_id: EntityId, values: Vec<Value>) -> Result<(), PipelineError> {
        if values.len() != self.columns.len() {
            return Err(PipelineError::RowWidth {
                entity_id,
                found: values.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(FeatureRow { entity_id, values });
        Ok(())
    }

    pub fn row(&self, entity_id: &str) -> Option<&FeatureRow> {
        self.rows.iter().find(|row| row.entity_id == entity_id)
    }

    /// Looks up one cell by entity and column name.
    pub fn value(&self, entity_id: &str, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.row(entity_id).map(|row| &row.values[idx])
    }

    pub fn sort_by_entity(&mut self) {
        self.rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [FeatureRow] {
        &mut self.rows
    }

    /// Reads a header-having CSV. Duplicate keys are kept; the merge stage
    /// decides which occurrence wins.
    pub fn read_csv(path: &Path, key_column: &str) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)?;
        let header = reader.headers()?.clone();
        let key_idx = header
            .iter()
            .position(|name| name.trim() == key_column)
            .ok_or_else(|| PipelineError::SchemaMismatch {
                column: key_column.to_string(),
                source_label: path.display().to_string(),
            })?;

        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != key_idx)
            .map(|(_, name)| name.trim().to_string())
            .collect();
        let mut table = Self::new(key_column, columns);

        for record in reader.records() {
            let record = record?;
            let entity_id = record.get(key_idx).unwrap_or_default().trim().to_string();
            let values = record
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != key_idx)
                .map(|(_, raw)| Value::parse(raw))
                .collect();
            table.push_row(entity_id, values)?;
        }

        info!(
            component = "table",
            event = "table.loaded",
            path = %path.display(),
            rows = table.len(),
            columns = table.columns.len()
        );

        Ok(table)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<W, PipelineError> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_field(&self.key_column)?;
        for column in &self.columns {
            out.write_field(column)?;
        }
        out.write_record(None::<&[u8]>)?;

        for row in &self.rows {
            out.write_field(&row.entity_id)?;
            for value in &row.values {
                out.write_field(value.render())?;
            }
            out.write_record(None::<&[u8]>)?;
        }

        out.into_inner()
            .map_err(|err| PipelineError::Io(err.into_error()))
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema {
            version: TABLE_SCHEMA_VERSION,
            key_column: self.key_column.clone(),
            columns: self.columns.clone(),
            row_count: self.rows.len() as u64,
            fingerprint: schema_fingerprint(&self.key_column, &self.columns),
        }
    }

    /// Entity id to row position, first occurrence wins.
    pub fn first_occurrence_index(&self) -> (HashMap<&str, usize>, u64) {
        let mut index = HashMap::with_capacity(self.rows.len());
        let mut duplicates = 0u64;
        for (pos, row) in self.rows.iter().enumerate() {
            if index.contains_key(row.entity_id.as_str()) {
                duplicates += 1;
            } else {
                index.insert(row.entity_id.as_str(), pos);
            }
        }
        (index, duplicates)
    }
}

/// Writes the table and its `.schema.json` manifest. Both land in a sibling
/// temp file first and are renamed into place once fully written, so a
/// reader never observes a partial table.
pub fn publish(table: &FeatureTable, path: &Path) -> Result<PublishedTable, PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = staging_path(path)?;
    let file = table.write_csv(File::create(&tmp_path)?)?;
    file.sync_all()?;
    drop(file);

    let schema = table.schema();
    let manifest_path = manifest_path(path)?;
    let manifest_tmp = staging_path(&manifest_path)?;
    {
        let mut manifest = File::create(&manifest_tmp)?;
        serde_json::to_writer_pretty(&mut manifest, &schema)?;
        manifest.write_all(b"\n")?;
        manifest.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    fs::rename(&manifest_tmp, &manifest_path)?;

    info!(
        component = "table",
        event = "output.published",
        path = %path.display(),
        rows = schema.row_count,
        columns = schema.columns.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(PublishedTable {
        path: path.to_path_buf(),
        manifest_path,
        schema,
    })
}

pub fn manifest_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let file_name = file_name(path)?;
    Ok(path.with_file_name(format!("{file_name}.schema.json")))
}

fn staging_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let file_name = file_name(path)?;
    Ok(path.with_file_name(format!("{file_name}.tmp")))
}

fn file_name(path: &Path) -> Result<String, PipelineError> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            PipelineError::InvalidConfig(format!("invalid output path: {}", path.display()))
        })
}

fn schema_fingerprint(key_column: &str, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{TABLE_SCHEMA_VERSION};"));
    hasher.update(format!("key:{key_column};columns:"));
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> FeatureTable {
        let mut table = FeatureTable::new("msno", vec!["x_sum".to_string(), "gender".to_string()]);
        table
            .push_row("B".to_string(), vec![Value::from(4.5), Value::from("male")])
            .unwrap();
        table
            .push_row("A".to_string(), vec![Value::from(18.0), Value::Missing])
            .unwrap();
        table
    }

    #[test]
    fn values_render_compactly() {
        assert_eq!(Value::from(18.0).render(), "18");
        assert_eq!(Value::from(4.5).render(), "4.5");
        assert_eq!(Value::from(0.1).render(), "0.1");
        assert_eq!(Value::Missing.render(), "");
        assert_eq!(Value::parse(" 7 "), Value::Number(7.0));
        assert_eq!(Value::parse("female"), Value::Text("female".to_string()));
        assert_eq!(Value::parse("NaN"), Value::Text("NaN".to_string()));
    }

    #[test]
    fn row_width_is_enforced() {
        let mut table = FeatureTable::new("msno", vec!["a".to_string()]);
        let err = table.push_row("A".to_string(), vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::RowWidth { expected: 1, .. }));
    }

    #[test]
    fn csv_round_trip_preserves_cells() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("table.csv");
        let mut table = sample();
        table.sort_by_entity();
        fs::write(&path, table.write_csv(Vec::new()).unwrap()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "msno,x_sum,gender\nA,18,\nB,4.5,male\n");

        let loaded = FeatureTable::read_csv(&path, "msno").unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn publish_writes_table_and_manifest_without_leftovers() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out").join("features.csv");

        let published = publish(&sample(), &path).unwrap();
        assert!(path.exists());
        assert!(published.manifest_path.exists());
        assert!(!temp.path().join("out").join("features.csv.tmp").exists());

        let manifest: TableSchema =
            serde_json::from_str(&fs::read_to_string(&published.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest, sample().schema());
        assert_eq!(manifest.row_count, 2);
        assert_eq!(manifest.fingerprint.len(), 64);
    }

    #[test]
    fn first_occurrence_index_counts_duplicates() {
        let mut table = FeatureTable::new("msno", vec!["v".to_string()]);
        table.push_row("A".to_string(), vec![Value::from(1.0)]).unwrap();
        table.push_row("A".to_string(), vec![Value::from(2.0)]).unwrap();
        table.push_row("B".to_string(), vec![Value::from(3.0)]).unwrap();

        let (index, duplicates) = table.first_occurrence_index();
        assert_eq!(duplicates, 1);
        assert_eq!(index["A"], 0);
        assert_eq!(index["B"], 2);
    }
}
