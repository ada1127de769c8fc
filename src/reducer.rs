//! Per-chunk grouping of event records into partial statistics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::measure::{EntityId, MeasureSpec};
use crate::source::Chunk;
use crate::stat::MeasureStat;

/// Partial statistics for one entity: one [`MeasureStat`] per declared
/// measure plus the number of rows that contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStats {
    pub rows: u64,
    pub measures: Vec<MeasureStat>,
}

impl EntityStats {
    pub fn new(measure_count: usize) -> Self {
        Self {
            rows: 0,
            measures: vec![MeasureStat::new(); measure_count],
        }
    }

    pub fn merge(&mut self, other: &EntityStats) {
        self.rows += other.rows;
        for (mine, theirs) in self.measures.iter_mut().zip(&other.measures) {
            mine.merge(theirs);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPartial {
    pub chunk_index: u64,
    pub records_reduced: u64,
    pub records_filtered: u64,
    pub entities: HashMap<EntityId, EntityStats>,
}

/// Groups one chunk by entity and computes sum/count/min/max per measure.
///
/// Clamping happens here, on raw values, before any statistic sees them.
/// An optional entity filter drops rows for entities outside the set.
#[derive(Debug, Clone)]
pub struct ChunkReducer {
    measures: Vec<MeasureSpec>,
    entity_filter: Option<Arc<HashSet<EntityId>>>,
}

impl ChunkReducer {
    pub fn new(measures: &[MeasureSpec]) -> Self {
        Self {
            measures: measures.to_vec(),
            entity_filter: None,
        }
    }

    pub fn with_entity_filter(mut self, filter: Arc<HashSet<EntityId>>) -> Self {
        self.entity_filter = Some(filter);
        self
    }

    pub fn reduce(&self, chunk: Chunk) -> ChunkPartial {
        let mut partial = ChunkPartial {
            chunk_index: chunk.index,
            ..ChunkPartial::default()
        };

        for record in chunk.records {
            if let Some(filter) = &self.entity_filter {
                if !filter.contains(&record.entity_id) {
                    partial.records_filtered += 1;
                    continue;
                }
            }

            let stats = partial
                .entities
                .entry(record.entity_id)
                .or_insert_with(|| EntityStats::new(self.measures.len()));
            stats.rows += 1;
            for ((slot, measure), value) in stats
                .measures
                .iter_mut()
                .zip(&self.measures)
                .zip(&record.values)
            {
                if let Some(value) = value {
                    slot.observe(measure.apply_clamp(*value));
                }
            }
            partial.records_reduced += 1;
        }

        partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::EventRecord;

    fn record(entity: &str, values: &[Option<f64>]) -> EventRecord {
        EventRecord {
            entity_id: entity.to_string(),
            date: None,
            values: values.to_vec(),
        }
    }

    #[test]
    fn groups_by_entity_within_the_chunk() {
        let reducer = ChunkReducer::new(&[MeasureSpec::column("x"), MeasureSpec::column("y")]);
        let chunk = Chunk {
            index: 7,
            records: vec![
                record("A", &[Some(3.0), Some(1.0)]),
                record("B", &[Some(2.0), None]),
                record("A", &[Some(5.0), None]),
            ],
        };

        let partial = reducer.reduce(chunk);
        assert_eq!(partial.chunk_index, 7);
        assert_eq!(partial.records_reduced, 3);

        let a = &partial.entities["A"];
        assert_eq!(a.rows, 2);
        assert_eq!(a.measures[0].sum(), 8.0);
        assert_eq!(a.measures[0].count(), 2);
        assert_eq!(a.measures[0].min(), Some(3.0));
        assert_eq!(a.measures[1].count(), 1);

        let b = &partial.entities["B"];
        assert_eq!(b.measures[1].count(), 0);
        assert_eq!(b.measures[1].max(), None);
    }

    #[test]
    fn clamp_applies_before_sum_and_min() {
        let reducer = ChunkReducer::new(&[MeasureSpec::column("total_secs").clamped()]);
        let chunk = Chunk {
            index: 0,
            records: vec![
                record("A", &[Some(-300.0)]),
                record("A", &[Some(120.0)]),
            ],
        };

        let stat = &reducer.reduce(chunk).entities["A"].measures[0];
        assert_eq!(stat.sum(), 120.0);
        assert_eq!(stat.min(), Some(0.0));
        assert_eq!(stat.count(), 2);
    }

    #[test]
    fn entity_filter_drops_foreign_rows() {
        let roster: HashSet<EntityId> = ["A".to_string()].into_iter().collect();
        let reducer =
            ChunkReducer::new(&[MeasureSpec::column("x")]).with_entity_filter(Arc::new(roster));
        let chunk = Chunk {
            index: 0,
            records: vec![record("A", &[Some(1.0)]), record("Z", &[Some(2.0)])],
        };

        let partial = reducer.reduce(chunk);
        assert_eq!(partial.records_filtered, 1);
        assert!(partial.entities.contains_key("A"));
        assert!(!partial.entities.contains_key("Z"));
    }
}
