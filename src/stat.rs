//! Mergeable per-measure statistics.
//!
//! [`MeasureStat`] is the state behind both a chunk-scoped partial and the
//! run-long accumulated value. Its merge is associative and commutative:
//! sums are kept as exact non-overlapping partials (correctly rounded only
//! when read), counts add, and extrema combine through an explicit
//! unobserved state instead of infinite sentinels.

use serde::{Deserialize, Serialize};

// 2^969: partials at or above this magnitude move to the scaled list.
const LARGE: f64 = 4.9896007738368e291;
// 2^-60 and 2^60.
const SCALE_DOWN: f64 = 8.673617379884035e-19;
const SCALE_UP: f64 = 1_152_921_504_606_846_976.0;
// 2^1000: scaled totals below this are combined in the unscaled domain.
const UNSCALED_LIMIT: f64 = 1.0715086071862673e301;

/// Order-independent floating point sum.
///
/// Holds the running total as a list of non-overlapping partials whose exact
/// sum is the true total, then rounds once on read. Two sums over the same
/// multiset of values read back bit-identical regardless of the order or
/// grouping in which values were added.
///
/// Magnitudes near `f64::MAX` are kept in a second partial list scaled by
/// 2^-60, so intermediate totals never overflow; only a total that itself
/// rounds past `f64::MAX` reads back as infinite. Non-finite inputs are
/// summed separately and dominate the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExactSum {
    partials: Vec<f64>,
    #[serde(default)]
    large: Vec<f64>,
    #[serde(default)]
    special: Option<f64>,
}

impl ExactSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            self.special = Some(self.special.map_or(value, |special| special + value));
        } else if value.abs() >= LARGE {
            self.add_large(value * SCALE_DOWN);
        } else {
            grow(&mut self.partials, value);
            if let Some(&top) = self.partials.last() {
                if top.abs() >= LARGE {
                    self.partials.pop();
                    self.add_large(top * SCALE_DOWN);
                }
            }
        }
    }

    fn add_large(&mut self, scaled: f64) {
        grow(&mut self.large, scaled);
        if let Some(&top) = self.large.last() {
            // Past 2^1084 the total saturates.
            if !top.is_finite() {
                self.large.clear();
                self.add(top);
            }
        }
    }

    pub fn merge(&mut self, other: &ExactSum) {
        for partial in &other.partials {
            self.add(*partial);
        }
        for partial in &other.large {
            self.add_large(*partial);
        }
        if let Some(special) = other.special {
            self.add(special);
        }
    }

    /// Correctly rounded total.
    pub fn value(&self) -> f64 {
        if let Some(special) = self.special {
            return special;
        }

        let total = if self.large.is_empty() {
            round_partials(&self.partials)
        } else if (round_partials(&self.large) * SCALE_UP).abs() < UNSCALED_LIMIT {
            let mut combined = self.partials.clone();
            for partial in &self.large {
                grow(&mut combined, partial * SCALE_UP);
            }
            round_partials(&combined)
        } else {
            let mut combined = self.large.clone();
            for partial in &self.partials {
                grow(&mut combined, partial * SCALE_DOWN);
            }
            round_partials(&combined) * SCALE_UP
        };

        if total == 0.0 {
            0.0
        } else {
            total
        }
    }
}

fn grow(partials: &mut Vec<f64>, value: f64) {
    let mut x = value;
    let mut kept = 0;
    for idx in 0..partials.len() {
        let mut y = partials[idx];
        if x.abs() < y.abs() {
            std::mem::swap(&mut x, &mut y);
        }
        let hi = x + y;
        let lo = y - (hi - x);
        if lo != 0.0 {
            partials[kept] = lo;
            kept += 1;
        }
        x = hi;
    }
    partials.truncate(kept);
    partials.push(x);
}

fn round_partials(partials: &[f64]) -> f64 {
    let mut n = partials.len();
    if n == 0 {
        return 0.0;
    }

    n -= 1;
    let mut hi = partials[n];
    let mut lo = 0.0;
    while n > 0 {
        let x = hi;
        n -= 1;
        let y = partials[n];
        hi = x + y;
        let yr = hi - x;
        lo = y - yr;
        if lo != 0.0 {
            break;
        }
    }

    // Round-half-even correction when the remaining partials push the
    // exact value past the halfway point.
    if n > 0 && ((lo < 0.0 && partials[n - 1] < 0.0) || (lo > 0.0 && partials[n - 1] > 0.0)) {
        let y = lo * 2.0;
        let x = hi + y;
        let yr = x - hi;
        if y == yr {
            hi = x;
        }
    }
    hi
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrema {
    pub min: f64,
    pub max: f64,
}

impl Extrema {
    fn of(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    fn widen(self, other: Extrema) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Sum, count and extrema of one measure for one entity.
///
/// Invariant: `count == 0` exactly when `extrema` is `None`, and then the sum
/// reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureStat {
    sum: ExactSum,
    count: u64,
    extrema: Option<Extrema>,
}

impl MeasureStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: &[f64]) -> Self {
        let mut stat = Self::new();
        for value in values {
            stat.observe(*value);
        }
        stat
    }

    pub fn observe(&mut self, value: f64) {
        self.sum.add(value);
        self.count += 1;
        self.extrema = Some(match self.extrema {
            Some(current) => current.widen(Extrema::of(value)),
            None => Extrema::of(value),
        });
    }

    pub fn merge(&mut self, other: &MeasureStat) {
        self.sum.merge(&other.sum);
        self.count += other.count;
        self.extrema = match (self.extrema, other.extrema) {
            (Some(a), Some(b)) => Some(a.widen(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
    }

    pub fn sum(&self) -> f64 {
        self.sum.value()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        self.extrema.map(|e| e.min)
    }

    pub fn max(&self) -> Option<f64> {
        self.extrema.map(|e| e.max)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum() / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_sum_is_order_independent() {
        let values = [0.1, 0.2, 0.3, 1e16, -1e16, 7.25, 1e-3, 3.3333];
        let mut forward = ExactSum::new();
        for v in values {
            forward.add(v);
        }

        let mut grouped_a = ExactSum::new();
        let mut grouped_b = ExactSum::new();
        for (idx, v) in values.iter().rev().enumerate() {
            if idx % 2 == 0 {
                grouped_a.add(*v);
            } else {
                grouped_b.add(*v);
            }
        }
        grouped_b.merge(&grouped_a);

        assert_eq!(forward.value().to_bits(), grouped_b.value().to_bits());
    }

    #[test]
    fn exact_sum_recovers_cancelled_low_bits() {
        let mut sum = ExactSum::new();
        sum.add(1e100);
        sum.add(1.0);
        sum.add(-1e100);
        assert_eq!(sum.value(), 1.0);
        assert_eq!(ExactSum::new().value(), 0.0);
    }

    #[test]
    fn exact_sum_survives_intermediate_overflow() {
        let mut sum = ExactSum::new();
        sum.add(1e308);
        sum.add(1e308);
        sum.add(-1e308);
        assert_eq!(sum.value(), 1e308);

        let mut crossing = ExactSum::new();
        for v in [3e291, 3e291, -6e291, 1.0] {
            crossing.add(v);
        }
        assert_eq!(crossing.value(), 1.0);
    }

    #[test]
    fn exact_sum_with_huge_values_is_order_independent() {
        let values = [
            1e308, -3.0, 5e307, -1e308, 2.5, 1e-300, -5e307, 7.0, 3e291, -3e291, 0.1, 0.2,
        ];
        let mut forward = ExactSum::new();
        for v in values {
            forward.add(v);
        }

        let mut grouped_a = ExactSum::new();
        let mut grouped_b = ExactSum::new();
        for (idx, v) in values.iter().rev().enumerate() {
            if idx % 3 == 0 {
                grouped_a.add(*v);
            } else {
                grouped_b.add(*v);
            }
        }
        grouped_a.merge(&grouped_b);

        assert_eq!(forward.value().to_bits(), grouped_a.value().to_bits());
        assert_eq!(forward.value(), 0.1 + 0.2 + 6.5);
    }

    #[test]
    fn exact_sum_overflows_only_when_the_total_does() {
        let mut sum = ExactSum::new();
        sum.add(1.7e308);
        sum.add(1.7e308);
        assert_eq!(sum.value(), f64::INFINITY);

        let mut negative = ExactSum::new();
        negative.add(-1.7e308);
        negative.add(-1.7e308);
        assert_eq!(negative.value(), f64::NEG_INFINITY);

        sum.merge(&negative);
        assert_eq!(sum.value(), 0.0);
    }

    #[test]
    fn non_finite_inputs_dominate_the_total() {
        let mut sum = ExactSum::new();
        sum.add(1.0);
        sum.add(f64::INFINITY);
        assert_eq!(sum.value(), f64::INFINITY);

        let mut other = ExactSum::new();
        other.add(f64::NEG_INFINITY);
        sum.merge(&other);
        assert!(sum.value().is_nan());
    }

    #[test]
    fn first_merge_into_unobserved_takes_incoming_extrema() {
        let mut acc = MeasureStat::new();
        assert_eq!(acc.min(), None);
        assert_eq!(acc.max(), None);

        acc.merge(&MeasureStat::from_values(&[-4.0, 2.0]));
        assert_eq!(acc.min(), Some(-4.0));
        assert_eq!(acc.max(), Some(2.0));

        acc.merge(&MeasureStat::new());
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.min(), Some(-4.0));
    }

    #[test]
    fn merged_partials_match_single_pass() {
        let mut merged = MeasureStat::from_values(&[3.0, 5.0]);
        merged.merge(&MeasureStat::from_values(&[1.0, 9.0]));

        assert_eq!(merged.sum(), 18.0);
        assert_eq!(merged.count(), 4);
        assert_eq!(merged.mean(), Some(4.5));
        assert_eq!(merged.min(), Some(1.0));
        assert_eq!(merged.max(), Some(9.0));
    }
}
