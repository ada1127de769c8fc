//! Measure declarations and the statistic columns derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type EntityId = String;

/// Log columns tracked per subscriber in the daily listening log.
pub const USER_LOG_COLUMNS: [&str; 7] = [
    "num_25",
    "num_50",
    "num_75",
    "num_985",
    "num_100",
    "num_unq",
    "total_secs",
];

/// Measures compared across the two trend windows.
pub const TREND_COLUMNS: [&str; 3] = ["total_secs", "num_unq", "num_100"];

/// How a measure value is obtained from one input row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureKind {
    /// Numeric value read straight from a column.
    Column { column: String },
    /// `minuend - subtrahend`, both numeric columns of the same row.
    Difference { minuend: String, subtrahend: String },
    /// Signed day count from `reference` to a `YYYYMMDD` date column.
    DaysFrom { column: String, reference: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: MeasureKind,
    /// Negative raw values are read as zero before any statistic sees them.
    #[serde(default)]
    pub clamp_negative: bool,
}

impl MeasureSpec {
    pub fn column(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: MeasureKind::Column {
                column: name.to_string(),
            },
            clamp_negative: false,
        }
    }

    pub fn difference(name: &str, minuend: &str, subtrahend: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: MeasureKind::Difference {
                minuend: minuend.to_string(),
                subtrahend: subtrahend.to_string(),
            },
            clamp_negative: false,
        }
    }

    pub fn days_from(name: &str, column: &str, reference: NaiveDate) -> Self {
        Self {
            name: name.to_string(),
            kind: MeasureKind::DaysFrom {
                column: column.to_string(),
                reference,
            },
            clamp_negative: false,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.clamp_negative = true;
        self
    }

    pub fn apply_clamp(&self, value: f64) -> f64 {
        if self.clamp_negative && value < 0.0 {
            0.0
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Sum,
    Count,
    Mean,
    Min,
    Max,
}

impl StatKind {
    pub const ALL: [StatKind; 5] = [
        StatKind::Sum,
        StatKind::Count,
        StatKind::Mean,
        StatKind::Min,
        StatKind::Max,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// What one aggregation pass computes: its measures, which statistics become
/// output columns, and an optional per-entity row count column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub measures: Vec<MeasureSpec>,
    #[serde(default = "default_stats")]
    pub stats: Vec<StatKind>,
    #[serde(default)]
    pub row_count_column: Option<String>,
}

fn default_stats() -> Vec<StatKind> {
    StatKind::ALL.to_vec()
}

impl AggregationSpec {
    pub fn new(measures: Vec<MeasureSpec>) -> Self {
        Self {
            measures,
            stats: default_stats(),
            row_count_column: None,
        }
    }

    pub fn with_stats(mut self, stats: &[StatKind]) -> Self {
        self.stats = stats.to_vec();
        self
    }

    pub fn with_row_count(mut self, column: &str) -> Self {
        self.row_count_column = Some(column.to_string());
        self
    }

    /// Output columns in emission order: measures outer, stats inner, row count last.
    pub fn column_names(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.measures.len() * self.stats.len() + 1);
        for measure in &self.measures {
            for stat in &self.stats {
                columns.push(format!("{}_{}", measure.name, stat.suffix()));
            }
        }
        if let Some(row_count) = &self.row_count_column {
            columns.push(row_count.clone());
        }
        columns
    }
}

/// The subscriber daily-log pass: seven play/duration measures, with the
/// session-seconds column clamped at zero.
pub fn user_log_measures() -> Vec<MeasureSpec> {
    USER_LOG_COLUMNS
        .iter()
        .map(|column| {
            let spec = MeasureSpec::column(column);
            if *column == "total_secs" {
                spec.clamped()
            } else {
                spec
            }
        })
        .collect()
}

pub fn trend_measures() -> Vec<MeasureSpec> {
    TREND_COLUMNS
        .iter()
        .map(|column| MeasureSpec::column(column))
        .collect()
}

/// Parses `YYYYMMDD` in integer or string form.
pub fn parse_yyyymmdd(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_follow_measure_then_stat_order() {
        let spec = AggregationSpec::new(vec![MeasureSpec::column("x"), MeasureSpec::column("y")])
            .with_stats(&[StatKind::Sum, StatKind::Max])
            .with_row_count("total_transactions");

        assert_eq!(
            spec.column_names(),
            vec!["x_sum", "x_max", "y_sum", "y_max", "total_transactions"]
        );
    }

    #[test]
    fn user_log_measures_clamp_only_session_seconds() {
        let measures = user_log_measures();
        assert_eq!(measures.len(), 7);
        for measure in &measures {
            assert_eq!(measure.clamp_negative, measure.name == "total_secs");
        }
        assert_eq!(measures[6].apply_clamp(-12.5), 0.0);
        assert_eq!(measures[0].apply_clamp(-12.5), -12.5);
    }

    #[test]
    fn parses_compact_dates_only() {
        assert_eq!(
            parse_yyyymmdd("20170301"),
            NaiveDate::from_ymd_opt(2017, 3, 1)
        );
        assert_eq!(parse_yyyymmdd(" 20170301 "), NaiveDate::from_ymd_opt(2017, 3, 1));
        assert_eq!(parse_yyyymmdd("2017-03-01"), None);
        assert_eq!(parse_yyyymmdd("20171341"), None);
        assert_eq!(parse_yyyymmdd(""), None);
    }

    #[test]
    fn measure_spec_deserializes_flattened_kind() {
        let raw = r#"[
            {"name": "total_secs", "kind": "column", "column": "total_secs", "clamp_negative": true},
            {"name": "discount", "kind": "difference", "minuend": "plan_list_price", "subtrahend": "actual_amount_paid"},
            {"name": "days_to_expire", "kind": "days_from", "column": "membership_expire_date", "reference": "2017-03-31"}
        ]"#;
        let parsed: Vec<MeasureSpec> = serde_json::from_str(raw).unwrap();

        assert_eq!(parsed[0], MeasureSpec::column("total_secs").clamped());
        assert_eq!(
            parsed[1],
            MeasureSpec::difference("discount", "plan_list_price", "actual_amount_paid")
        );
        assert_eq!(
            parsed[2],
            MeasureSpec::days_from(
                "days_to_expire",
                "membership_expire_date",
                NaiveDate::from_ymd_opt(2017, 3, 31).unwrap()
            )
        );
    }
}
