//! JSON run configuration with environment overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::measure::AggregationSpec;
use crate::merge::{ColumnPolicy, FillPolicy};
use crate::source::{LogSourceConfig, DEFAULT_ENTITY_COLUMN};
use crate::trend::TrendConfig;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;
pub const DEFAULT_OUTPUT_PATH: &str = "features.csv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Primary table whose entities anchor the merged output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterConfig {
    pub path: PathBuf,
    /// Fill policy for roster columns; columns not listed keep empty cells.
    #[serde(default)]
    pub columns: Vec<ColumnPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatePassConfig {
    pub name: String,
    pub source: LogSourceConfig,
    #[serde(flatten)]
    pub spec: AggregationSpec,
    /// Drop records for entities outside the roster before reducing.
    #[serde(default)]
    pub restrict_to_roster: bool,
    #[serde(default = "zero_fill")]
    pub fill: FillPolicy,
}

fn zero_fill() -> FillPolicy {
    FillPolicy::Zero
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPassConfig {
    pub source: LogSourceConfig,
    #[serde(flatten)]
    pub config: TrendConfig,
}

/// An already-materialized per-entity table joined as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub default_fill: Option<FillPolicy>,
    #[serde(default)]
    pub columns: Vec<ColumnPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub entity_column: String,
    pub chunk_size: usize,
    pub workers: usize,
    pub roster: Option<RosterConfig>,
    pub aggregates: Vec<AggregatePassConfig>,
    pub trend: Option<TrendPassConfig>,
    pub tables: Vec<TableConfig>,
    pub output: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entity_column: DEFAULT_ENTITY_COLUMN.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 1,
            roster: None,
            aggregates: Vec::new(),
            trend: None,
            tables: Vec::new(),
            output: PathBuf::from(DEFAULT_OUTPUT_PATH),
        }
    }
}

impl RunConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Applies `CHURN_CHUNK_SIZE`, `CHURN_WORKERS` and `CHURN_OUTPUT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(chunk_size) = env_usize("CHURN_CHUNK_SIZE")? {
            self.chunk_size = chunk_size;
        }
        if let Some(workers) = env_usize("CHURN_WORKERS")? {
            self.workers = workers;
        }
        if let Ok(output) = env::var("CHURN_OUTPUT") {
            let trimmed = output.trim();
            if !trimmed.is_empty() {
                self.output = PathBuf::from(trimmed);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".to_string()));
        }
        if self.entity_column.trim().is_empty() {
            return Err(ConfigError::Invalid("entity_column must not be empty".to_string()));
        }
        if self.aggregates.is_empty() && self.trend.is_none() && self.tables.is_empty() {
            return Err(ConfigError::Invalid(
                "run declares no aggregate, trend or table inputs".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pass in &self.aggregates {
            if pass.spec.measures.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "aggregate '{}' declares no measures",
                    pass.name
                )));
            }
            if pass.spec.stats.is_empty() && pass.spec.row_count_column.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "aggregate '{}' emits no columns",
                    pass.name
                )));
            }
            if pass.restrict_to_roster && self.roster.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "aggregate '{}' is restricted to a roster but none is configured",
                    pass.name
                )));
            }
            if !names.insert(pass.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate input name '{}'",
                    pass.name
                )));
            }
        }
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate input name '{}'",
                    table.name
                )));
            }
        }

        if let Some(trend) = &self.trend {
            if trend.config.window_days == 0 {
                return Err(ConfigError::Invalid("trend window_days must be > 0".to_string()));
            }
            if trend.config.measures.is_empty() {
                return Err(ConfigError::Invalid("trend declares no measures".to_string()));
            }
            if trend.source.date_column.is_none() {
                return Err(ConfigError::Invalid(
                    "trend source needs a date_column".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid(format!("{key}={raw}: {err}"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::StatKind;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    const SAMPLE: &str = r#"{
        "chunk_size": 500,
        "roster": {
            "path": "train.csv",
            "columns": [{ "column": "is_churn", "fill": "keep" }]
        },
        "aggregates": [{
            "name": "user_logs",
            "source": { "path": "user_logs.csv" },
            "measures": [
                { "name": "total_secs", "kind": "column", "column": "total_secs", "clamp_negative": true },
                { "name": "discount", "kind": "difference", "minuend": "plan_list_price", "subtrahend": "actual_amount_paid" }
            ],
            "stats": ["sum", "max"],
            "row_count_column": "total_rows",
            "restrict_to_roster": true
        }],
        "trend": {
            "source": { "path": "user_logs.csv", "date_column": "date" },
            "window_days": 7
        },
        "tables": [{
            "name": "members",
            "path": "members.csv",
            "columns": [
                { "column": "city", "fill": "mode" },
                { "column": "bd", "fill": { "median_within": { "min": 10.0, "max": 100.0 } } },
                { "column": "gender", "fill": { "text": "unknown" } }
            ]
        }],
        "output": "out/features.csv"
    }"#;

    #[test]
    fn parses_full_run_config() {
        let cfg = RunConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.entity_column, "msno");

        let pass = &cfg.aggregates[0];
        assert_eq!(pass.spec.stats, vec![StatKind::Sum, StatKind::Max]);
        assert_eq!(pass.spec.row_count_column.as_deref(), Some("total_rows"));
        assert!(pass.spec.measures[0].clamp_negative);
        assert_eq!(pass.fill, FillPolicy::Zero);
        assert_eq!(pass.source.entity_column, "msno");

        let trend = cfg.trend.as_ref().unwrap();
        assert_eq!(trend.config.window_days, 7);
        assert_eq!(trend.config.measures.len(), 3);

        assert_eq!(
            cfg.tables[0].columns[1].fill,
            FillPolicy::MedianWithin { min: 10.0, max: 100.0 }
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_runs() {
        let mut cfg = RunConfig::from_json(SAMPLE).unwrap();
        cfg.chunk_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = RunConfig::from_json(SAMPLE).unwrap();
        cfg.tables[0].name = "user_logs".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")));

        let mut cfg = RunConfig::from_json(SAMPLE).unwrap();
        if let Some(trend) = cfg.trend.as_mut() {
            trend.config.window_days = 0;
        }
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::from_json(SAMPLE).unwrap();
        cfg.aggregates[0].spec.measures.clear();
        assert!(cfg.validate().is_err());

        assert!(RunConfig::default().validate().is_err());
    }

    #[test]
    fn env_overrides_replace_sizes_and_output() {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        env::set_var("CHURN_CHUNK_SIZE", "64");
        env::set_var("CHURN_WORKERS", "4");
        env::set_var("CHURN_OUTPUT", "elsewhere.csv");

        let mut cfg = RunConfig::default();
        let result = cfg.apply_env_overrides();

        env::remove_var("CHURN_CHUNK_SIZE");
        env::remove_var("CHURN_WORKERS");
        env::remove_var("CHURN_OUTPUT");

        result.unwrap();
        assert_eq!(cfg.chunk_size, 64);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.output, PathBuf::from("elsewhere.csv"));
    }

    #[test]
    fn unparseable_env_override_is_an_error() {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        env::set_var("CHURN_WORKERS", "many");
        let result = RunConfig::default().apply_env_overrides();
        env::remove_var("CHURN_WORKERS");

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RunConfig::from_path(Path::new("/nonexistent/churn.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { path, .. } if path.ends_with("churn.json")));
    }
}
