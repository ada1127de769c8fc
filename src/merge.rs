//! Roster-anchored left join of per-entity tables.
//!
//! Every roster entity yields exactly one output row. Cells with no match
//! (or empty in the source) are filled by the column's declared policy;
//! mode and median fills are computed once over the whole merged column.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::table::{FeatureTable, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Leave missing cells empty.
    Keep,
    Zero,
    Constant(f64),
    Text(String),
    /// Most frequent observed value; ties go to the smallest value.
    Mode,
    Median,
    /// Median over values within `[min, max]`; values outside the range are
    /// treated as missing and imputed too.
    MedianWithin { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPolicy {
    pub column: String,
    pub fill: FillPolicy,
}

/// A table joined into the output together with its declared fill policies.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub name: String,
    pub table: FeatureTable,
    pub default_fill: Option<FillPolicy>,
    pub columns: Vec<ColumnPolicy>,
}

impl MergeInput {
    pub fn new(name: &str, table: FeatureTable) -> Self {
        Self {
            name: name.to_string(),
            table,
            default_fill: None,
            columns: Vec::new(),
        }
    }

    /// Applies `fill` to every column without an explicit policy.
    pub fn fill_all(mut self, fill: FillPolicy) -> Self {
        self.default_fill = Some(fill);
        self
    }

    pub fn fill_column(mut self, column: &str, fill: FillPolicy) -> Self {
        self.columns.push(ColumnPolicy {
            column: column.to_string(),
            fill,
        });
        self
    }

    fn policy_for(&self, column: &str) -> Result<FillPolicy, PipelineError> {
        self.columns
            .iter()
            .find(|policy| policy.column == column)
            .map(|policy| policy.fill.clone())
            .or_else(|| self.default_fill.clone())
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "no fill policy declared for column '{column}' of table '{}'",
                    self.name
                ))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMergeStats {
    pub name: String,
    pub rows: u64,
    pub matched_rows: u64,
    pub duplicate_keys: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub roster_rows: u64,
    pub duplicate_roster_keys: u64,
    pub output_rows: u64,
    pub filled_cells: u64,
    pub tables: Vec<TableMergeStats>,
}

pub fn merge_tables(
    roster: MergeInput,
    secondaries: Vec<MergeInput>,
) -> Result<(FeatureTable, MergeReport), PipelineError> {
    let key_column = roster.table.key_column().to_string();

    let mut columns: Vec<String> = Vec::new();
    let mut policies: Vec<FillPolicy> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for input in std::iter::once(&roster).chain(secondaries.iter()) {
        for column in input.table.columns() {
            if column == &key_column || !seen.insert(column.clone()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "column '{column}' of table '{}' collides with an earlier column",
                    input.name
                )));
            }
            policies.push(input.policy_for(column)?);
            columns.push(column.clone());
        }
    }

    let (roster_index, duplicate_roster_keys) = roster.table.first_occurrence_index();
    if duplicate_roster_keys > 0 {
        warn!(
            component = "merge",
            event = "merge.duplicate_key",
            table = %roster.name,
            duplicates = duplicate_roster_keys,
            rule = "first_occurrence"
        );
    }
    let mut roster_positions: Vec<usize> = roster_index.into_values().collect();
    roster_positions.sort_unstable();

    let mut lookups = Vec::with_capacity(secondaries.len());
    let mut stats = Vec::with_capacity(secondaries.len());
    for input in &secondaries {
        let (index, duplicates) = input.table.first_occurrence_index();
        if duplicates > 0 {
            warn!(
                component = "merge",
                event = "merge.duplicate_key",
                table = %input.name,
                duplicates = duplicates,
                rule = "first_occurrence"
            );
        }
        stats.push(TableMergeStats {
            name: input.name.clone(),
            rows: input.table.len() as u64,
            matched_rows: 0,
            duplicate_keys: duplicates,
        });
        lookups.push(index);
    }

    let mut merged = FeatureTable::new(&key_column, columns);
    for pos in roster_positions {
        let roster_row = &roster.table.rows()[pos];
        let mut values = roster_row.values.clone();
        for ((input, index), stat) in secondaries.iter().zip(&lookups).zip(stats.iter_mut()) {
            match index.get(roster_row.entity_id.as_str()) {
                Some(row_pos) => {
                    stat.matched_rows += 1;
                    values.extend(input.table.rows()[*row_pos].values.iter().cloned());
                }
                None => {
                    values.extend(std::iter::repeat(Value::Missing).take(input.table.columns().len()));
                }
            }
        }
        merged.push_row(roster_row.entity_id.clone(), values)?;
    }

    let mut filled_cells = 0u64;
    for (idx, policy) in policies.iter().enumerate() {
        filled_cells += fill_column(&mut merged, idx, policy);
    }

    let report = MergeReport {
        roster_rows: roster.table.len() as u64,
        duplicate_roster_keys,
        output_rows: merged.len() as u64,
        filled_cells,
        tables: stats,
    };

    info!(
        component = "merge",
        event = "merge.finish",
        roster_rows = report.roster_rows,
        output_rows = report.output_rows,
        columns = merged.columns().len(),
        filled_cells = report.filled_cells
    );

    Ok((merged, report))
}

fn fill_column(table: &mut FeatureTable, idx: usize, policy: &FillPolicy) -> u64 {
    if let FillPolicy::MedianWithin { min, max } = policy {
        for row in table.rows_mut() {
            if let Some(value) = row.values[idx].as_f64() {
                if value < *min || value > *max {
                    row.values[idx] = Value::Missing;
                }
            }
        }
    }

    let replacement = match policy {
        FillPolicy::Keep => return 0,
        FillPolicy::Zero => Value::Number(0.0),
        FillPolicy::Constant(value) => Value::Number(*value),
        FillPolicy::Text(text) => Value::Text(text.clone()),
        FillPolicy::Mode => match column_mode(table, idx) {
            Some(value) => value,
            None => return unfillable(table, idx),
        },
        FillPolicy::Median | FillPolicy::MedianWithin { .. } => match column_median(table, idx) {
            Some(value) => Value::Number(value),
            None => return unfillable(table, idx),
        },
    };

    let mut filled = 0u64;
    for row in table.rows_mut() {
        if row.values[idx].is_missing() {
            row.values[idx] = replacement.clone();
            filled += 1;
        }
    }
    filled
}

fn unfillable(table: &FeatureTable, idx: usize) -> u64 {
    warn!(
        component = "merge",
        event = "merge.fill.no_observations",
        column = %table.columns()[idx]
    );
    0
}

fn column_median(table: &FeatureTable, idx: usize) -> Option<f64> {
    let mut observed: Vec<f64> = table
        .rows()
        .iter()
        .filter_map(|row| row.values[idx].as_f64())
        .collect();
    if observed.is_empty() {
        return None;
    }
    observed.sort_by(|a, b| a.total_cmp(b));
    let mid = observed.len() / 2;
    if observed.len() % 2 == 0 {
        Some((observed[mid - 1] + observed[mid]) / 2.0)
    } else {
        Some(observed[mid])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ModeKey {
    Number(u64),
    Text(String),
}

impl ModeKey {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(if *n == 0.0 { 0 } else { n.to_bits() })),
            Value::Text(text) => Some(Self::Text(text.clone())),
            Value::Missing => None,
        }
    }
}

fn column_mode(table: &FeatureTable, idx: usize) -> Option<Value> {
    let mut counts: HashMap<ModeKey, (Value, u64)> = HashMap::new();
    for row in table.rows() {
        let value = &row.values[idx];
        let Some(key) = ModeKey::of(value) else {
            continue;
        };
        counts.entry(key).or_insert_with(|| (value.clone(), 0)).1 += 1;
    }

    counts
        .into_values()
        .max_by(|(a, a_count), (b, b_count)| {
            a_count.cmp(b_count).then_with(|| value_order(b, a))
        })
        .map(|(value, _)| value)
}

// Numbers sort before text; within a kind, natural order.
fn value_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Text(_), Value::Missing) => Ordering::Less,
        (Value::Missing, Value::Text(_)) => Ordering::Greater,
        (Value::Missing, Value::Missing) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: &[(&str, Vec<Value>)]) -> FeatureTable {
        let mut table = FeatureTable::new(
            "msno",
            columns.iter().map(|c| c.to_string()).collect(),
        );
        for (entity, values) in rows {
            table.push_row(entity.to_string(), values.clone()).unwrap();
        }
        table
    }

    #[test]
    fn roster_rows_are_preserved_with_zero_fill() {
        let roster = table(
            &["is_churn"],
            &[
                ("A", vec![Value::from(1.0)]),
                ("B", vec![Value::from(0.0)]),
                ("C", vec![Value::from(0.0)]),
            ],
        );
        let logs = table(
            &["x_count"],
            &[("B", vec![Value::from(4.0)]), ("Z", vec![Value::from(9.0)])],
        );

        let (merged, report) = merge_tables(
            MergeInput::new("roster", roster).fill_all(FillPolicy::Keep),
            vec![MergeInput::new("logs", logs).fill_all(FillPolicy::Zero)],
        )
        .unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged.value("A", "x_count"), Some(&Value::Number(0.0)));
        assert_eq!(merged.value("B", "x_count"), Some(&Value::Number(4.0)));
        assert_eq!(merged.value("C", "x_count"), Some(&Value::Number(0.0)));
        assert!(merged.row("Z").is_none());
        assert_eq!(report.tables[0].matched_rows, 1);
        assert_eq!(report.filled_cells, 2);
    }

    #[test]
    fn trend_columns_fill_with_neutral_ratio() {
        let roster = table(&[], &[("A", vec![]), ("B", vec![])]);
        let trends = table(&["total_secs_trend"], &[("A", vec![Value::from(0.1)])]);

        let (merged, _) = merge_tables(
            MergeInput::new("roster", roster),
            vec![MergeInput::new("trend", trends).fill_all(FillPolicy::Constant(1.0))],
        )
        .unwrap();

        assert_eq!(merged.value("A", "total_secs_trend"), Some(&Value::Number(0.1)));
        assert_eq!(merged.value("B", "total_secs_trend"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let roster = table(
            &[],
            &[("A", vec![]), ("B", vec![]), ("A", vec![])],
        );
        let members = table(
            &["city"],
            &[
                ("A", vec![Value::from(5.0)]),
                ("A", vec![Value::from(13.0)]),
            ],
        );

        let (merged, report) = merge_tables(
            MergeInput::new("roster", roster),
            vec![MergeInput::new("members", members).fill_all(FillPolicy::Keep)],
        )
        .unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.value("A", "city"), Some(&Value::Number(5.0)));
        assert_eq!(merged.value("B", "city"), Some(&Value::Missing));
        assert_eq!(report.duplicate_roster_keys, 1);
        assert_eq!(report.tables[0].duplicate_keys, 1);
    }

    #[test]
    fn categorical_and_demographic_fills() {
        let roster = table(
            &["gender", "city", "bd"],
            &[
                ("A", vec![Value::from("male"), Value::from(13.0), Value::from(30.0)]),
                ("B", vec![Value::Missing, Value::from(1.0), Value::from(-7.0)]),
                ("C", vec![Value::from("female"), Value::from(13.0), Value::from(40.0)]),
                ("D", vec![Value::Missing, Value::Missing, Value::from(25.0)]),
                ("E", vec![Value::from("female"), Value::from(1.0), Value::from(1200.0)]),
            ],
        );

        let (merged, report) = merge_tables(
            MergeInput::new("members", roster)
                .fill_column("gender", FillPolicy::Text("unknown".to_string()))
                .fill_column("city", FillPolicy::Mode)
                .fill_column("bd", FillPolicy::MedianWithin { min: 10.0, max: 100.0 }),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(merged.value("B", "gender"), Some(&Value::Text("unknown".to_string())));
        // 1 and 13 tie at two each; the smaller wins.
        assert_eq!(merged.value("D", "city"), Some(&Value::Number(1.0)));
        assert_eq!(merged.value("B", "bd"), Some(&Value::Number(30.0)));
        assert_eq!(merged.value("E", "bd"), Some(&Value::Number(30.0)));
        assert_eq!(merged.value("C", "bd"), Some(&Value::Number(40.0)));
        assert_eq!(report.filled_cells, 5);
    }

    #[test]
    fn undeclared_policy_and_collisions_are_rejected() {
        let roster = table(&["a"], &[("A", vec![Value::from(1.0)])]);
        let err = merge_tables(MergeInput::new("roster", roster.clone()), Vec::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));

        let other = table(&["a"], &[("A", vec![Value::from(2.0)])]);
        let err = merge_tables(
            MergeInput::new("roster", roster).fill_all(FillPolicy::Keep),
            vec![MergeInput::new("other", other).fill_all(FillPolicy::Zero)],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(msg) if msg.contains("collides")));
    }

    #[test]
    fn mode_counts_numbers_and_text_separately() {
        let roster = table(
            &["registered_via"],
            &[
                ("A", vec![Value::from(1.0)]),
                ("B", vec![Value::from("1")]),
                ("C", vec![Value::from("1")]),
                ("D", vec![Value::from(2.0)]),
                ("E", vec![Value::from(2.0)]),
                ("F", vec![Value::Missing]),
            ],
        );
        let (merged, report) = merge_tables(
            MergeInput::new("members", roster).fill_all(FillPolicy::Mode),
            Vec::new(),
        )
        .unwrap();

        // Text "1" and number 2 tie at two each; numbers win ties.
        assert_eq!(merged.value("F", "registered_via"), Some(&Value::Number(2.0)));
        assert_eq!(report.filled_cells, 1);
    }

    #[test]
    fn mode_and_median_without_observations_leave_cells_missing() {
        let roster = table(&["city"], &[("A", vec![Value::Missing])]);
        let (merged, report) = merge_tables(
            MergeInput::new("roster", roster).fill_all(FillPolicy::Mode),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(merged.value("A", "city"), Some(&Value::Missing));
        assert_eq!(report.filled_cells, 0);
    }
}
