//! Cross-chunk merged state and its finalization into a feature table.

use std::collections::HashMap;

use tracing::info;

use crate::error::PipelineError;
use crate::measure::{AggregationSpec, EntityId, StatKind};
use crate::reducer::{ChunkPartial, EntityStats};
use crate::stat::MeasureStat;
use crate::table::{FeatureTable, Value};

/// Run-long per-entity statistics.
///
/// The accumulator is the single owner of merged state: partials come in by
/// value through [`GlobalAccumulator::merge`] and the only way out is
/// [`GlobalAccumulator::finalize`], which consumes it. Memory grows with the
/// number of distinct entities, not with the number of events.
#[derive(Debug, Clone)]
pub struct GlobalAccumulator {
    spec: AggregationSpec,
    entities: HashMap<EntityId, EntityStats>,
    chunks_merged: u64,
    records_merged: u64,
    records_filtered: u64,
}

impl GlobalAccumulator {
    pub fn new(spec: AggregationSpec) -> Self {
        Self {
            spec,
            entities: HashMap::new(),
            chunks_merged: 0,
            records_merged: 0,
            records_filtered: 0,
        }
    }

    pub fn merge(&mut self, partial: ChunkPartial) {
        self.chunks_merged += 1;
        self.records_merged += partial.records_reduced;
        self.records_filtered += partial.records_filtered;

        for (entity_id, incoming) in partial.entities {
            match self.entities.get_mut(&entity_id) {
                Some(existing) => existing.merge(&incoming),
                None => {
                    self.entities.insert(entity_id, incoming);
                }
            }
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn chunks_merged(&self) -> u64 {
        self.chunks_merged
    }

    pub fn records_merged(&self) -> u64 {
        self.records_merged
    }

    pub fn records_filtered(&self) -> u64 {
        self.records_filtered
    }

    /// Emits one row per entity, sorted by entity id. Unobserved measures
    /// read as zero for every statistic.
    pub fn finalize(self, key_column: &str) -> Result<FeatureTable, PipelineError> {
        let mut table = FeatureTable::new(key_column, self.spec.column_names());
        let mut entities: Vec<(EntityId, EntityStats)> = self.entities.into_iter().collect();
        entities.sort_by(|a, b| a.0.cmp(&b.0));

        for (entity_id, stats) in entities {
            let mut values = Vec::with_capacity(table.columns().len());
            for stat in &stats.measures {
                for kind in &self.spec.stats {
                    values.push(Value::Number(finalized_value(stat, *kind)));
                }
            }
            if self.spec.row_count_column.is_some() {
                values.push(Value::Number(stats.rows as f64));
            }
            table.push_row(entity_id, values)?;
        }

        info!(
            component = "accumulator",
            event = "accumulator.finalized",
            entities = table.len(),
            columns = table.columns().len(),
            chunks_merged = self.chunks_merged,
            records_merged = self.records_merged
        );

        Ok(table)
    }
}

fn finalized_value(stat: &MeasureStat, kind: StatKind) -> f64 {
    match kind {
        StatKind::Sum => stat.sum(),
        StatKind::Count => stat.count() as f64,
        StatKind::Mean => stat.mean().unwrap_or(0.0),
        StatKind::Min => stat.min().unwrap_or(0.0),
        StatKind::Max => stat.max().unwrap_or(0.0),
    }
}
