//! Two-window activity trend ratios.
//!
//! Given the maximum date `T` over the whole log and a window length `w`,
//! the recent window is `(T - w, T]` and the previous window is
//! `(T - 2w, T - w]`. For each entity with activity in either window and
//! each measure, the trend is `(recent + 1) / (previous + 1)`.
//!
//! `T` is only known at end of stream, so the calculator keeps per-entity
//! daily sums for dates within `2w` of the running maximum and drops older
//! buckets whenever the maximum advances. Memory is bounded by entities
//! times `2w` days.

use std::collections::{BTreeMap, HashMap};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::measure::{trend_measures, EntityId, MeasureSpec};
use crate::source::{Chunk, EventRecord};
use crate::stat::ExactSum;
use crate::table::{FeatureTable, Value};

pub const DEFAULT_WINDOW_DAYS: u32 = 14;

/// Trend value for an entity with no change, or no observations at all.
pub const NEUTRAL_TREND: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "trend_measures")]
    pub measures: Vec<MeasureSpec>,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    DEFAULT_WINDOW_DAYS
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            measures: trend_measures(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

impl TrendConfig {
    pub fn column_names(&self) -> Vec<String> {
        self.measures
            .iter()
            .map(|measure| trend_column(&measure.name))
            .collect()
    }
}

pub fn trend_column(measure: &str) -> String {
    format!("{measure}_trend")
}

/// Smoothed ratio of recent to previous activity.
pub fn trend_ratio(recent_sum: f64, previous_sum: f64) -> f64 {
    (recent_sum + 1.0) / (previous_sum + 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendWindows {
    pub max_date: NaiveDate,
    /// Exclusive start of the recent window; inclusive end of the previous one.
    pub boundary: NaiveDate,
    /// Exclusive start of the previous window.
    pub horizon: NaiveDate,
}

impl TrendWindows {
    fn ending_at(max_date: NaiveDate, window_days: u32) -> Self {
        let w = u64::from(window_days);
        Self {
            max_date,
            boundary: max_date
                .checked_sub_days(Days::new(w))
                .unwrap_or(NaiveDate::MIN),
            horizon: max_date
                .checked_sub_days(Days::new(2 * w))
                .unwrap_or(NaiveDate::MIN),
        }
    }

    pub fn is_recent(&self, date: NaiveDate) -> bool {
        date > self.boundary && date <= self.max_date
    }

    pub fn is_previous(&self, date: NaiveDate) -> bool {
        date > self.horizon && date <= self.boundary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendReport {
    pub records_seen: u64,
    pub records_outside_windows: u64,
    pub records_without_date: u64,
    pub entities: u64,
    pub windows: Option<TrendWindows>,
}

#[derive(Debug, Clone)]
struct DayBucket {
    records: u64,
    sums: Vec<ExactSum>,
}

type DailySums = BTreeMap<NaiveDate, DayBucket>;

/// Streaming two-window trend calculator.
#[derive(Debug, Clone)]
pub struct TrendCalculator {
    config: TrendConfig,
    windows: Option<TrendWindows>,
    daily: HashMap<EntityId, DailySums>,
    report: TrendReport,
}

impl TrendCalculator {
    pub fn new(config: TrendConfig) -> Result<Self, PipelineError> {
        if config.window_days == 0 {
            return Err(PipelineError::InvalidConfig(
                "trend window_days must be > 0".to_string(),
            ));
        }
        if config.measures.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "trend pass needs at least one measure".to_string(),
            ));
        }

        Ok(Self {
            config,
            windows: None,
            daily: HashMap::new(),
            report: TrendReport::default(),
        })
    }

    pub fn ingest_chunk(&mut self, chunk: Chunk) {
        for record in chunk.records {
            self.observe(record);
        }
    }

    pub fn observe(&mut self, record: EventRecord) {
        self.report.records_seen += 1;
        let Some(date) = record.date else {
            self.report.records_without_date += 1;
            return;
        };

        match self.windows {
            Some(windows) if date > windows.max_date => self.advance(date),
            Some(_) => {}
            None => self.advance(date),
        }

        let windows = match self.windows {
            Some(windows) => windows,
            None => return,
        };
        if date <= windows.horizon {
            self.report.records_outside_windows += 1;
            return;
        }

        let measure_count = self.config.measures.len();
        let bucket = self
            .daily
            .entry(record.entity_id)
            .or_default()
            .entry(date)
            .or_insert_with(|| DayBucket {
                records: 0,
                sums: vec![ExactSum::new(); measure_count],
            });
        bucket.records += 1;
        for ((sum, measure), value) in bucket
            .sums
            .iter_mut()
            .zip(&self.config.measures)
            .zip(&record.values)
        {
            if let Some(value) = value {
                sum.add(measure.apply_clamp(*value));
            }
        }
    }

    fn advance(&mut self, max_date: NaiveDate) {
        let windows = TrendWindows::ending_at(max_date, self.config.window_days);
        let horizon = windows.horizon;
        let first_kept = horizon.succ_opt().unwrap_or(NaiveDate::MAX);
        let mut pruned_records = 0u64;

        self.daily.retain(|_, days| {
            let keep = days.split_off(&first_kept);
            pruned_records += days.values().map(|bucket| bucket.records).sum::<u64>();
            *days = keep;
            !days.is_empty()
        });

        self.report.records_outside_windows += pruned_records;
        if pruned_records > 0 {
            debug!(
                component = "trend",
                event = "trend.window.advanced",
                max_date = %max_date,
                pruned_records = pruned_records,
                entities = self.daily.len()
            );
        }
        self.windows = Some(windows);
    }

    /// One row per entity with activity in either window, sorted by entity.
    pub fn finish(self, key_column: &str) -> Result<(FeatureTable, TrendReport), PipelineError> {
        let mut report = self.report;
        let mut table = FeatureTable::new(key_column, self.config.column_names());
        let measure_count = self.config.measures.len();

        if let Some(windows) = self.windows {
            let mut entities: Vec<(EntityId, DailySums)> = self.daily.into_iter().collect();
            entities.sort_by(|a, b| a.0.cmp(&b.0));

            for (entity_id, days) in entities {
                let mut recent = vec![ExactSum::new(); measure_count];
                let mut previous = vec![ExactSum::new(); measure_count];
                for (date, bucket) in &days {
                    let target = if windows.is_recent(*date) {
                        &mut recent
                    } else if windows.is_previous(*date) {
                        &mut previous
                    } else {
                        continue;
                    };
                    for (acc, sum) in target.iter_mut().zip(&bucket.sums) {
                        acc.merge(sum);
                    }
                }

                let values = recent
                    .iter()
                    .zip(&previous)
                    .map(|(r, p)| Value::Number(trend_ratio(r.value(), p.value())))
                    .collect();
                table.push_row(entity_id, values)?;
            }
        }

        report.entities = table.len() as u64;
        report.windows = self.windows;

        info!(
            component = "trend",
            event = "trend.finish",
            entities = report.entities,
            records_seen = report.records_seen,
            records_outside_windows = report.records_outside_windows,
            max_date = ?self.windows.map(|w| w.max_date)
        );

        Ok((table, report))
    }
}
