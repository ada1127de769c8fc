//! Streaming per-entity feature aggregation for subscriber churn models.
//!
//! A run reads arbitrarily large daily activity logs in bounded chunks,
//! reduces each chunk to per-entity partial statistics, merges partials into
//! a run-long accumulator and finalizes one row per entity. A separate pass
//! computes two-window trend ratios from dated rows. All outputs are joined
//! onto a roster with per-column fill policies and published atomically.

mod accumulator;
mod config;
mod error;
mod measure;
mod merge;
mod observability;
mod pipeline;
mod reducer;
mod source;
mod stat;
mod table;
mod trend;

pub use accumulator::GlobalAccumulator;
pub use config::{
    AggregatePassConfig, ConfigError, RosterConfig, RunConfig, TableConfig, TrendPassConfig,
    DEFAULT_CHUNK_SIZE, DEFAULT_OUTPUT_PATH,
};
pub use error::PipelineError;
pub use measure::{
    parse_yyyymmdd, trend_measures, user_log_measures, AggregationSpec, EntityId, MeasureKind,
    MeasureSpec, StatKind, TREND_COLUMNS, USER_LOG_COLUMNS,
};
pub use merge::{merge_tables, ColumnPolicy, FillPolicy, MergeInput, MergeReport, TableMergeStats};
pub use observability::{
    init_logging, log_app_error, log_app_finish, log_app_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    aggregate_log, aggregate_source, compute_trends, run, AggregateOptions, AggregateReport,
    CancelFlag, RunReport, TrendPassReport,
};
pub use reducer::{ChunkPartial, ChunkReducer, EntityStats};
pub use source::{
    open_log_reader, Chunk, ChunkSource, EventRecord, LogSourceConfig, RecordError, SourceReport,
    DEFAULT_DATE_COLUMN, DEFAULT_ENTITY_COLUMN,
};
pub use stat::{ExactSum, Extrema, MeasureStat};
pub use table::{
    manifest_path, publish, FeatureRow, FeatureTable, PublishedTable, TableSchema, Value,
    TABLE_SCHEMA_VERSION,
};
pub use trend::{
    trend_column, trend_ratio, TrendCalculator, TrendConfig, TrendReport, TrendWindows,
    DEFAULT_WINDOW_DAYS, NEUTRAL_TREND,
};
