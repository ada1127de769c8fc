//! Pass orchestration: streaming aggregation, trends, merge and publish.
//!
//! Each aggregate pass pulls chunks from its source and reduces them either
//! inline or on a rayon pool. Reduced partials travel over a bounded channel
//! to the calling thread, which is the only owner of the
//! [`GlobalAccumulator`]. The trend pass runs on its own thread next to the
//! aggregate passes. Nothing is written until the merged table is complete.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::Serialize;
use tracing::{info, warn};

use crate::accumulator::GlobalAccumulator;
use crate::config::{AggregatePassConfig, RunConfig};
use crate::error::PipelineError;
use crate::measure::{AggregationSpec, EntityId};
use crate::merge::{merge_tables, FillPolicy, MergeInput, MergeReport};
use crate::reducer::ChunkReducer;
use crate::source::{ChunkSource, LogSourceConfig, SourceReport};
use crate::table::{publish, FeatureTable, PublishedTable};
use crate::trend::{TrendCalculator, TrendConfig, TrendReport, NEUTRAL_TREND};

/// Shared stop request, checked between chunks.
///
/// A [`child`](CancelFlag::child) flag also observes every flag it was
/// derived from, while cancelling it leaves its parents untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parents: Vec<Arc<AtomicBool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parents,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parents
                .iter()
                .any(|parent| parent.load(Ordering::SeqCst))
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub key_column: String,
    pub chunk_size: usize,
    pub workers: usize,
    pub entity_filter: Option<Arc<HashSet<EntityId>>>,
}

impl AggregateOptions {
    pub fn new(key_column: &str, chunk_size: usize) -> Self {
        Self {
            key_column: key_column.to_string(),
            chunk_size,
            workers: 1,
            entity_filter: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_entity_filter(mut self, filter: Arc<HashSet<EntityId>>) -> Self {
        self.entity_filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateReport {
    pub name: String,
    pub source: SourceReport,
    pub chunks_merged: u64,
    pub records_merged: u64,
    pub records_filtered: u64,
    pub entities: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendPassReport {
    pub source: SourceReport,
    pub trend: TrendReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub aggregates: Vec<AggregateReport>,
    pub trend: Option<TrendPassReport>,
    pub merge: MergeReport,
    pub published: PublishedTable,
    pub elapsed_ms: u64,
}

/// Drains `source` into a [`GlobalAccumulator`].
///
/// With `workers <= 1` every chunk is reduced and merged on the calling
/// thread. Otherwise chunks are reduced on a pool of `workers` threads and
/// merged here as they arrive; the result is identical either way.
pub fn aggregate_source<R: Read + Send>(
    mut source: ChunkSource<R>,
    reducer: &ChunkReducer,
    spec: AggregationSpec,
    workers: usize,
    cancel: &CancelFlag,
) -> Result<(GlobalAccumulator, SourceReport), PipelineError> {
    let mut accumulator = GlobalAccumulator::new(spec);

    if workers <= 1 {
        while let Some(chunk) = source.next_chunk()? {
            cancel.check()?;
            accumulator.merge(reducer.reduce(chunk));
        }
        return Ok((accumulator, source.into_report()));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|idx| format!("churn-reduce-{idx}"))
        .build()
        .map_err(|err| PipelineError::WorkerPool(err.to_string()))?;
    let (tx, rx) = mpsc::sync_channel(workers * 2);

    let produced = thread::scope(|scope| {
        let chunks = &mut source;
        let producer = scope.spawn(move || {
            pool.install(|| {
                chunks.par_bridge().try_for_each_with(tx, |tx, chunk| {
                    cancel.check()?;
                    let partial = reducer.reduce(chunk?);
                    tx.send(partial).map_err(|_| {
                        PipelineError::WorkerPool("merge channel closed".to_string())
                    })
                })
            })
        });

        for partial in rx {
            accumulator.merge(partial);
        }

        producer
            .join()
            .unwrap_or_else(|_| Err(PipelineError::WorkerPool("reducer panicked".to_string())))
    });
    produced?;

    Ok((accumulator, source.into_report()))
}

/// Streams one log through an aggregation pass and finalizes it.
pub fn aggregate_log(
    name: &str,
    source: &LogSourceConfig,
    spec: &AggregationSpec,
    options: &AggregateOptions,
    cancel: &CancelFlag,
) -> Result<(FeatureTable, AggregateReport), PipelineError> {
    let chunks = ChunkSource::open(source, &spec.measures, options.chunk_size)?;
    aggregate_opened(name, source, chunks, spec, options, cancel)
}

fn aggregate_opened<R: Read + Send>(
    name: &str,
    source: &LogSourceConfig,
    chunks: ChunkSource<R>,
    spec: &AggregationSpec,
    options: &AggregateOptions,
    cancel: &CancelFlag,
) -> Result<(FeatureTable, AggregateReport), PipelineError> {
    info!(
        component = "pipeline",
        event = "pipeline.aggregate.start",
        pass = name,
        path = %source.path.display(),
        measures = spec.measures.len(),
        chunk_size = options.chunk_size,
        workers = options.workers,
        filtered = options.entity_filter.is_some()
    );

    let mut reducer = ChunkReducer::new(&spec.measures);
    if let Some(filter) = &options.entity_filter {
        reducer = reducer.with_entity_filter(Arc::clone(filter));
    }

    let (accumulator, source_report) =
        aggregate_source(chunks, &reducer, spec.clone(), options.workers, cancel)?;
    let report = AggregateReport {
        name: name.to_string(),
        chunks_merged: accumulator.chunks_merged(),
        records_merged: accumulator.records_merged(),
        records_filtered: accumulator.records_filtered(),
        entities: accumulator.entity_count() as u64,
        source: source_report,
    };
    let table = accumulator.finalize(&options.key_column)?;

    info!(
        component = "pipeline",
        event = "pipeline.aggregate.finish",
        pass = name,
        chunks = report.chunks_merged,
        records = report.records_merged,
        skipped = report.source.records_skipped,
        filtered = report.records_filtered,
        entities = report.entities
    );

    Ok((table, report))
}

/// Runs the two-window trend pass over one dated log.
pub fn compute_trends(
    source: &LogSourceConfig,
    config: &TrendConfig,
    key_column: &str,
    chunk_size: usize,
    cancel: &CancelFlag,
) -> Result<(FeatureTable, TrendPassReport), PipelineError> {
    let (calculator, chunks) = open_trends(source, config, chunk_size)?;
    drain_trends(calculator, chunks, key_column, cancel)
}

fn open_trends(
    source: &LogSourceConfig,
    config: &TrendConfig,
    chunk_size: usize,
) -> Result<(TrendCalculator, ChunkSource<Box<dyn Read + Send>>), PipelineError> {
    if source.date_column.is_none() {
        return Err(PipelineError::InvalidConfig(format!(
            "trend source {} has no date_column",
            source.path.display()
        )));
    }

    let calculator = TrendCalculator::new(config.clone())?;
    let chunks = ChunkSource::open(source, &config.measures, chunk_size)?;
    Ok((calculator, chunks))
}

fn drain_trends<R: Read>(
    mut calculator: TrendCalculator,
    mut chunks: ChunkSource<R>,
    key_column: &str,
    cancel: &CancelFlag,
) -> Result<(FeatureTable, TrendPassReport), PipelineError> {
    while let Some(chunk) = chunks.next_chunk()? {
        cancel.check()?;
        calculator.ingest_chunk(chunk);
    }

    let (table, trend) = calculator.finish(key_column)?;
    Ok((
        table,
        TrendPassReport {
            source: chunks.into_report(),
            trend,
        },
    ))
}

/// Full run: aggregate passes, trend pass, table merge, atomic publish.
pub fn run(config: &RunConfig, cancel: &CancelFlag) -> Result<RunReport, PipelineError> {
    let started = Instant::now();
    config.validate()?;
    let key_column = config.entity_column.as_str();

    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        aggregates = config.aggregates.len(),
        trend = config.trend.is_some(),
        tables = config.tables.len(),
        chunk_size = config.chunk_size,
        workers = config.workers,
        output = %config.output.display()
    );

    // Every input is opened and its header resolved before any pass reads
    // a chunk.
    let roster = match &config.roster {
        Some(roster) => Some(FeatureTable::read_csv(&roster.path, key_column)?),
        None => None,
    };
    let roster_filter: Option<Arc<HashSet<EntityId>>> = roster.as_ref().map(|table| {
        Arc::new(
            table
                .rows()
                .iter()
                .map(|row| row.entity_id.clone())
                .collect(),
        )
    });
    let mut tables = Vec::with_capacity(config.tables.len());
    for table_cfg in &config.tables {
        let table = FeatureTable::read_csv(&table_cfg.path, key_column)?;
        let mut input = MergeInput::new(&table_cfg.name, table);
        input.default_fill = table_cfg.default_fill.clone();
        input.columns = table_cfg.columns.clone();
        tables.push(input);
    }
    let opened = open_aggregate_passes(config, roster_filter.as_ref())?;
    let trend_source = match &config.trend {
        Some(pass) => Some(open_trends(&pass.source, &pass.config, config.chunk_size)?),
        None => None,
    };

    // A failing pass stops its siblings without marking the caller's flag.
    let passes_cancel = cancel.child();
    let (aggregated, trend) = thread::scope(|scope| {
        let trend_pass = trend_source.map(|(calculator, chunks)| {
            let passes_cancel = &passes_cancel;
            scope.spawn(move || {
                let result = drain_trends(calculator, chunks, key_column, passes_cancel);
                if result.is_err() {
                    passes_cancel.cancel();
                }
                result
            })
        });

        let aggregated = run_aggregate_passes(opened, &passes_cancel);
        if aggregated.is_err() {
            passes_cancel.cancel();
        }
        let trend = trend_pass.map(|handle| {
            handle
                .join()
                .unwrap_or_else(|_| Err(PipelineError::WorkerPool("trend pass panicked".to_string())))
        });
        (aggregated, trend)
    });
    let (aggregated, trend) = match (aggregated, trend.transpose()) {
        (Ok(aggregated), Ok(trend)) => (aggregated, trend),
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => return Err(cancelled_or(err, cancel)),
        (Err(aggregate_err), Err(trend_err)) => {
            let err = if matches!(aggregate_err, PipelineError::Cancelled) {
                trend_err
            } else {
                aggregate_err
            };
            return Err(cancelled_or(err, cancel));
        }
    };

    let mut secondaries = Vec::new();
    let mut aggregate_reports = Vec::new();
    for (pass, table, report) in aggregated {
        secondaries.push(MergeInput::new(&pass.name, table).fill_all(pass.fill.clone()));
        aggregate_reports.push(report);
    }
    let trend_report = match trend {
        Some((table, report)) => {
            secondaries.push(
                MergeInput::new("trend", table).fill_all(FillPolicy::Constant(NEUTRAL_TREND)),
            );
            Some(report)
        }
        None => None,
    };
    secondaries.extend(tables);

    let anchor = match (roster, &config.roster) {
        (Some(table), Some(roster_cfg)) => {
            let mut input = MergeInput::new("roster", table).fill_all(FillPolicy::Keep);
            input.columns = roster_cfg.columns.clone();
            input
        }
        _ => MergeInput::new("entities", entity_union(key_column, &secondaries)?),
    };

    let (merged, merge_report) = merge_tables(anchor, secondaries)?;

    cancel.check().map_err(|err| cancelled_or(err, cancel))?;
    let published = publish(&merged, &config.output)?;

    let report = RunReport {
        aggregates: aggregate_reports,
        trend: trend_report,
        merge: merge_report,
        published,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        rows = report.published.schema.row_count,
        columns = report.published.schema.columns.len(),
        output = %report.published.path.display(),
        elapsed_ms = report.elapsed_ms
    );

    Ok(report)
}

type AggregatedPass<'a> = (&'a AggregatePassConfig, FeatureTable, AggregateReport);

struct OpenedPass<'a> {
    pass: &'a AggregatePassConfig,
    chunks: ChunkSource<Box<dyn Read + Send>>,
    options: AggregateOptions,
}

fn open_aggregate_passes<'a>(
    config: &'a RunConfig,
    roster_filter: Option<&Arc<HashSet<EntityId>>>,
) -> Result<Vec<OpenedPass<'a>>, PipelineError> {
    let mut out = Vec::with_capacity(config.aggregates.len());
    for pass in &config.aggregates {
        let mut options = AggregateOptions::new(&config.entity_column, config.chunk_size)
            .with_workers(config.workers);
        if pass.restrict_to_roster {
            if let Some(filter) = roster_filter {
                options = options.with_entity_filter(Arc::clone(filter));
            }
        }
        let chunks = ChunkSource::open(&pass.source, &pass.spec.measures, config.chunk_size)?;
        out.push(OpenedPass {
            pass,
            chunks,
            options,
        });
    }
    Ok(out)
}

fn run_aggregate_passes<'a>(
    opened: Vec<OpenedPass<'a>>,
    cancel: &CancelFlag,
) -> Result<Vec<AggregatedPass<'a>>, PipelineError> {
    let mut out = Vec::with_capacity(opened.len());
    for OpenedPass {
        pass,
        chunks,
        options,
    } in opened
    {
        let (table, report) =
            aggregate_opened(&pass.name, &pass.source, chunks, &pass.spec, &options, cancel)?;
        out.push((pass, table, report));
    }
    Ok(out)
}

/// Rosterless runs anchor on every entity seen in any input, sorted.
fn entity_union(key_column: &str, inputs: &[MergeInput]) -> Result<FeatureTable, PipelineError> {
    let ids: BTreeSet<&str> = inputs
        .iter()
        .flat_map(|input| input.table.rows().iter().map(|row| row.entity_id.as_str()))
        .collect();
    let mut table = FeatureTable::new(key_column, Vec::new());
    for id in ids {
        table.push_row(id.to_string(), Vec::new())?;
    }
    Ok(table)
}

fn cancelled_or(err: PipelineError, cancel: &CancelFlag) -> PipelineError {
    if matches!(err, PipelineError::Cancelled) || cancel.is_cancelled() {
        warn!(
            component = "pipeline",
            event = "pipeline.cancelled",
            reason = %err
        );
        PipelineError::Cancelled
    } else {
        err
    }
}
