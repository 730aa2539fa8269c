//! Aggregation: grouping, column reduction, and order statistics.
//!
//! # Grouping
//!
//! [`compute_groups`] buckets row indices by the filtered fingerprint of each
//! row (`by` keeps the listed labels, `without` drops them, the metric name is
//! always dropped). Buckets are ordered by that fingerprint and represented by
//! the filtered metric. Without a clause every row falls in one bucket with
//! no labels.
//!
//! # Aggregators
//!
//! - Mapping aggregators (`sum`, `avg`, `count`, `min`, `max`, `stddev`,
//!   `stdvar`) reduce each bucket column by column, see [`reduce`].
//! - `topk`/`bottomk` keep row shape and blank the losers at each timestamp,
//!   see [`select_k`].
//! - `quantile` interpolates within each bucket per timestamp, see [`quantile_by`].
//! - `count_values` counts rows per distinct value, see [`count_values`].
//!
//! Stale values never take part in any aggregation. A bucket with no value at
//! a timestamp yields stale there.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::ast::Grouping;
use crate::error::{ParameterError, Result, SymbolError};
use crate::metric::{Fingerprint, Metric, is_valid_label_name};
use crate::value::{PointMatrix, Points, STALE, Scalar, format_value, is_stale};

/// Column-reducing aggregators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingOp {
    /// Sum of values.
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Number of values.
    Count,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Population standard deviation.
    Stddev,
    /// Population variance.
    Stdvar,
}

/// A resolved aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    /// Column reduction.
    Mapping(MappingOp),
    /// `topk(k, v)`.
    TopK,
    /// `bottomk(k, v)`.
    BottomK,
    /// `quantile(q, v)`.
    Quantile,
    /// `count_values("label", v)`.
    CountValues,
}

impl MappingOp {
    /// Aggregator name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Stddev => "stddev",
            Self::Stdvar => "stdvar",
        }
    }
}

impl Aggregator {
    /// Aggregator name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mapping(op) => op.name(),
            Self::TopK => "topk",
            Self::BottomK => "bottomk",
            Self::Quantile => "quantile",
            Self::CountValues => "count_values",
        }
    }

    /// Whether the aggregator takes a parameter and must be planned dynamically.
    pub fn is_variadic(self) -> bool {
        !matches!(self, Self::Mapping(_))
    }
}

/// Maps aggregator names to aggregators.
#[derive(Debug, Clone)]
pub struct AggregatorRegistry {
    aggregators: HashMap<String, Aggregator>,
}

impl AggregatorRegistry {
    /// The builtin aggregators.
    pub fn builtin() -> Self {
        let all = [
            Aggregator::Mapping(MappingOp::Sum),
            Aggregator::Mapping(MappingOp::Avg),
            Aggregator::Mapping(MappingOp::Count),
            Aggregator::Mapping(MappingOp::Min),
            Aggregator::Mapping(MappingOp::Max),
            Aggregator::Mapping(MappingOp::Stddev),
            Aggregator::Mapping(MappingOp::Stdvar),
            Aggregator::TopK,
            Aggregator::BottomK,
            Aggregator::Quantile,
            Aggregator::CountValues,
        ];
        Self {
            aggregators: all.into_iter().map(|agg| (agg.name().to_string(), agg)).collect(),
        }
    }

    /// Resolves an aggregator name.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Aggregator`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Aggregator> {
        self.aggregators.get(name).copied().ok_or_else(|| {
            SymbolError::Aggregator {
                name: name.to_string(),
            }
            .into()
        })
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Partition of input rows into output buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct Groups {
    /// Representative metric of each bucket.
    pub metrics: Vec<Metric>,
    /// Input row indices of each bucket, parallel to `metrics`.
    pub members: Vec<Vec<usize>>,
}

fn group_metric(metric: &Metric, grouping: Option<&Grouping>) -> Metric {
    match grouping {
        Some(g) => metric.filter(g.mode, &g.labels, true),
        None => Metric::empty(),
    }
}

/// Buckets `metrics` by their grouping key.
pub fn compute_groups(metrics: &[Metric], grouping: Option<&Grouping>) -> Groups {
    let mut buckets: BTreeMap<Fingerprint, (Metric, Vec<usize>)> = BTreeMap::new();
    for (i, m) in metrics.iter().enumerate() {
        let key = group_metric(m, grouping);
        buckets
            .entry(key.fingerprint())
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(i);
    }
    let (metrics, members) = buckets.into_values().unzip();
    Groups { metrics, members }
}

pub(crate) fn reduce_values(op: MappingOp, values: &[f64]) -> f64 {
    let Some(&first) = values.first() else {
        return STALE;
    };
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    match op {
        MappingOp::Sum => values.iter().sum(),
        MappingOp::Avg => values.iter().sum::<f64>() / n,
        MappingOp::Count => n,
        MappingOp::Min => values
            .iter()
            .fold(first, |acc, &v| if v < acc || acc.is_nan() { v } else { acc }),
        MappingOp::Max => values
            .iter()
            .fold(first, |acc, &v| if v > acc || acc.is_nan() { v } else { acc }),
        MappingOp::Stddev => welford_variance(values).sqrt(),
        MappingOp::Stdvar => welford_variance(values),
    }
}

/// Population variance computed in one pass with Welford's method.
pub(crate) fn welford_variance(values: &[f64]) -> f64 {
    let mut count = 0.0;
    let mut mean = 0.0;
    let mut aux = 0.0;
    for &v in values {
        count += 1.0;
        let delta = v - mean;
        mean += delta / count;
        aux += delta * (v - mean);
    }
    aux / count
}

/// Reduces each bucket column by column.
///
/// # Errors
///
/// Returns [`crate::error::InternalError::ShapeMismatch`] if `groups` refers
/// to rows `input` does not have.
pub fn reduce(op: MappingOp, groups: &Groups, input: &PointMatrix) -> Result<PointMatrix> {
    let frames = *input.frames();
    let mut scratch = Vec::new();
    let rows = groups
        .members
        .iter()
        .map(|members| {
            let rows = members
                .iter()
                .map(|&r| input.rows().get(r))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| crate::error::InternalError::ShapeMismatch {
                    reason: format!("group refers past {} input rows", input.len()),
                })?;
            Ok(Points::from_frames(&frames, |i, _| {
                scratch.clear();
                scratch.extend(rows.iter().map(|row| row.values()[i]).filter(|v| !is_stale(*v)));
                reduce_values(op, &scratch)
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    PointMatrix::new(groups.metrics.clone(), rows, frames)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn k_at(k: &Scalar, i: usize, limit: usize) -> usize {
    let v = k.at(i);
    if v.is_nan() || v < 1.0 {
        0
    } else if v >= limit as f64 {
        limit
    } else {
        v as usize
    }
}

/// Orders candidates for topk: larger first, NaN last.
fn rank_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Orders candidates for bottomk: smaller first, NaN last.
fn rank_asc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Keeps the `k` largest (or smallest, with `bottom`) values of each bucket
/// at each timestamp and blanks every other value to stale.
///
/// `k` may differ per timestamp. Rows are never dropped. The result is a
/// private copy of `input`, sorted by last value (descending for `topk`,
/// ascending for `bottomk`) with non-finite values last. Ties go to the
/// earlier row.
///
/// # Errors
///
/// Returns [`crate::error::InternalError::ShapeMismatch`] if the result cannot
/// be assembled.
pub fn select_k(bottom: bool, k: &Scalar, grouping: Option<&Grouping>, input: &PointMatrix) -> Result<PointMatrix> {
    let groups = compute_groups(input.metrics(), grouping);
    let rank = if bottom { rank_asc } else { rank_desc };
    let (metrics, mut rows, frames) = input.clone().into_parts();

    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for i in 0..frames.len() {
        for members in &groups.members {
            candidates.clear();
            candidates.extend(
                members
                    .iter()
                    .map(|&r| (r, rows[r].values()[i]))
                    .filter(|(_, v)| !is_stale(*v)),
            );
            candidates.sort_by(|a, b| rank(a.1, b.1).then(a.0.cmp(&b.0)));
            let keep = k_at(k, i, candidates.len());
            for &(r, _) in &candidates[keep..] {
                rows[r].values_mut()[i] = STALE;
            }
        }
    }

    let mut pairs: Vec<(Metric, Points)> = metrics.into_iter().zip(rows).collect();
    pairs.sort_by(|a, b| {
        let (x, y) = (a.1.last().unwrap_or(STALE), b.1.last().unwrap_or(STALE));
        match (x.is_finite(), y.is_finite()) {
            (true, true) => rank(x, y),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        }
    });
    let (metrics, rows) = pairs.into_iter().unzip();
    PointMatrix::new(metrics, rows, frames)
}

/// Linear interpolation between order statistics.
///
/// With `n` sorted values the rank is `q * (n - 1)`; the result interpolates
/// between the values at the floor and ceiling of the rank. An empty input
/// yields NaN, `q < 0` yields `-Inf`, and `q > 1` yields `+Inf`.
pub fn quantile(q: f64, values: &mut [f64]) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(f64::total_cmp);
    #[allow(clippy::cast_precision_loss)]
    let rank = q * (values.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(values.len() - 1);
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper] * weight
}

/// `quantile(q, v)` per bucket and timestamp.
///
/// # Errors
///
/// Returns [`crate::error::InternalError::ShapeMismatch`] if the result cannot
/// be assembled.
pub fn quantile_by(q: &Scalar, grouping: Option<&Grouping>, input: &PointMatrix) -> Result<PointMatrix> {
    let groups = compute_groups(input.metrics(), grouping);
    let frames = *input.frames();
    let mut scratch = Vec::new();
    let rows = groups
        .members
        .iter()
        .map(|members| {
            Points::from_frames(&frames, |i, _| {
                scratch.clear();
                scratch.extend(
                    members
                        .iter()
                        .map(|&r| input.rows()[r].values()[i])
                        .filter(|v| !is_stale(*v)),
                );
                if scratch.is_empty() {
                    STALE
                } else {
                    quantile(q.at(i), &mut scratch)
                }
            })
        })
        .collect();
    PointMatrix::new(groups.metrics, rows, frames)
}

/// `count_values(label, v)`: counts rows per distinct value at each timestamp.
///
/// Each row's value is formatted into `label` on top of the row's grouping
/// metric; the output has one row per distinct resulting metric.
///
/// # Errors
///
/// Returns [`ParameterError::InvalidLabelName`] if `label` is not a valid
/// label name.
pub fn count_values(label: &str, grouping: Option<&Grouping>, input: &PointMatrix) -> Result<PointMatrix> {
    if !is_valid_label_name(label) {
        return Err(ParameterError::InvalidLabelName {
            name: label.to_string(),
        }
        .into());
    }
    let frames = *input.frames();
    let bases: Vec<Metric> = input.metrics().iter().map(|m| group_metric(m, grouping)).collect();

    let mut counts: BTreeMap<Fingerprint, (Metric, Vec<f64>)> = BTreeMap::new();
    for (row, base) in input.rows().iter().zip(&bases) {
        for (i, &v) in row.values().iter().enumerate() {
            if is_stale(v) {
                continue;
            }
            let mut builder = base.to_builder();
            builder.put(label, format_value(v));
            let metric = builder.build();
            let slot = counts
                .entry(metric.fingerprint())
                .or_insert_with(|| (metric, vec![0.0; frames.len()]));
            slot.1[i] += 1.0;
        }
    }

    let (metrics, rows) = counts
        .into_values()
        .map(|(m, cs)| {
            let row = Points::from_frames(&frames, |i, _| if cs[i] == 0.0 { STALE } else { cs[i] });
            (m, row)
        })
        .unzip();
    PointMatrix::new(metrics, rows, frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Frames;

    fn m(labels: &[(&str, &str)]) -> Metric {
        Metric::new(labels.iter().copied())
    }

    fn matrix(metrics: Vec<Metric>, values: &[&[f64]]) -> PointMatrix {
        let frames = Frames::new(0, (values[0].len() as i64 - 1) * 1000, 1000).unwrap();
        let rows = values
            .iter()
            .map(|vs| Points::from_frames(&frames, |i, _| vs[i]))
            .collect();
        PointMatrix::new(metrics, rows, frames).unwrap()
    }

    fn sample() -> PointMatrix {
        matrix(
            vec![
                m(&[("__name__", "x"), ("job", "a"), ("i", "1")]),
                m(&[("__name__", "x"), ("job", "a"), ("i", "2")]),
                m(&[("__name__", "x"), ("job", "b"), ("i", "1")]),
            ],
            &[&[1.0, 5.0], &[3.0, STALE], &[10.0, 2.0]],
        )
    }

    #[test]
    fn test_registry() {
        let reg = AggregatorRegistry::builtin();
        assert_eq!(reg.get("sum").unwrap(), Aggregator::Mapping(MappingOp::Sum));
        assert!(reg.get("topk").unwrap().is_variadic());
        assert!(reg.get("median").is_err());
    }

    #[test]
    fn test_groups_by_and_without() {
        let input = sample();
        let by = compute_groups(input.metrics(), Some(&Grouping::by(["job"])));
        assert_eq!(by.metrics.len(), 2);
        assert!(by.metrics.contains(&m(&[("job", "a")])));
        let a = by.metrics.iter().position(|x| *x == m(&[("job", "a")])).unwrap();
        assert_eq!(by.members[a], vec![0, 1]);

        let without = compute_groups(input.metrics(), Some(&Grouping::without(["job"])));
        assert_eq!(without.metrics.len(), 2);
        assert!(without.metrics.contains(&m(&[("i", "1")])));

        let all = compute_groups(input.metrics(), None);
        assert_eq!(all.metrics, vec![Metric::empty()]);
        assert_eq!(all.members, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_reduce_skips_stale() {
        let input = sample();
        let groups = compute_groups(input.metrics(), None);
        let sum = reduce(MappingOp::Sum, &groups, &input).unwrap();
        assert_eq!(sum.rows()[0].values(), &[14.0, 7.0]);
        let count = reduce(MappingOp::Count, &groups, &input).unwrap();
        assert_eq!(count.rows()[0].values(), &[3.0, 2.0]);
        let min = reduce(MappingOp::Min, &groups, &input).unwrap();
        assert_eq!(min.rows()[0].values(), &[1.0, 2.0]);
        let max = reduce(MappingOp::Max, &groups, &input).unwrap();
        assert_eq!(max.rows()[0].values(), &[10.0, 5.0]);
        let avg = reduce(MappingOp::Avg, &groups, &input).unwrap();
        assert_eq!(avg.rows()[0].values()[1], 3.5);
    }

    #[test]
    fn test_reduce_all_stale_is_stale() {
        let input = matrix(vec![m(&[("a", "1")])], &[&[STALE]]);
        let groups = compute_groups(input.metrics(), None);
        let sum = reduce(MappingOp::Sum, &groups, &input).unwrap();
        assert!(is_stale(sum.rows()[0].values()[0]));
    }

    #[test]
    fn test_stddev_stdvar() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((reduce_values(MappingOp::Stdvar, &values) - 4.0).abs() < 1e-12);
        assert!((reduce_values(MappingOp::Stddev, &values) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_topk_blanks_losers() {
        let input = sample();
        let out = select_k(false, &Scalar::Constant(1.0), None, &input).unwrap();
        assert_eq!(out.len(), 3);
        for i in 0..2 {
            let live: Vec<f64> = out
                .rows()
                .iter()
                .map(|r| r.values()[i])
                .filter(|v| !is_stale(*v))
                .collect();
            assert_eq!(live.len(), 1);
        }
        // Row with the largest last value comes first.
        assert!(is_stale(out.rows()[0].values()[0]));
        assert_eq!(out.rows()[0].values()[1], 5.0);
        assert_eq!(out.metrics()[0], input.metrics()[0]);
    }

    #[test]
    fn test_topk_grouped_and_varying_k() {
        let input = sample();
        let out = select_k(false, &Scalar::Series(vec![1.0, 0.0]), Some(&Grouping::by(["job"])), &input).unwrap();
        let find = |i: &str, job: &str| {
            out.iter()
                .find(|(mm, _)| mm.get("i") == Some(i) && mm.get("job") == Some(job))
                .unwrap()
                .1
                .values()
                .to_vec()
        };
        assert_eq!(find("2", "a")[0], 3.0);
        assert!(is_stale(find("1", "a")[0]));
        assert_eq!(find("1", "b")[0], 10.0);
        assert!(out.rows().iter().all(|r| is_stale(r.values()[1])));
    }

    #[test]
    fn test_bottomk() {
        let input = sample();
        let out = select_k(true, &Scalar::Constant(2.0), None, &input).unwrap();
        let col0: Vec<f64> = input
            .metrics()
            .iter()
            .map(|mm| {
                let idx = out.metrics().iter().position(|x| x == mm).unwrap();
                out.rows()[idx].values()[0]
            })
            .collect();
        assert_eq!(col0[0], 1.0);
        assert_eq!(col0[1], 3.0);
        assert!(is_stale(col0[2]));
    }

    #[test]
    fn test_quantile_interpolation() {
        assert_eq!(quantile(0.5, &mut [1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(quantile(0.0, &mut [3.0, 1.0]), 1.0);
        assert_eq!(quantile(1.0, &mut [3.0, 1.0]), 3.0);
        assert_eq!(quantile(0.9, &mut [7.0]), 7.0);
        assert_eq!(quantile(-0.1, &mut [1.0]), f64::NEG_INFINITY);
        assert_eq!(quantile(1.1, &mut [1.0]), f64::INFINITY);
        assert!(quantile(0.5, &mut []).is_nan());
    }

    #[test]
    fn test_quantile_by() {
        let input = sample();
        let out = quantile_by(&Scalar::Constant(0.5), None, &input).unwrap();
        assert_eq!(out.rows()[0].values(), &[3.0, 3.5]);
    }

    #[test]
    fn test_count_values() {
        let input = matrix(
            vec![m(&[("i", "1")]), m(&[("i", "2")]), m(&[("i", "3")])],
            &[&[1.0], &[1.0], &[2.5]],
        );
        let out = count_values("value", None, &input).unwrap();
        assert_eq!(out.len(), 2);
        let one = out.iter().find(|(mm, _)| mm.get("value") == Some("1")).unwrap();
        assert_eq!(one.1.values(), &[2.0]);
        let other = out.iter().find(|(mm, _)| mm.get("value") == Some("2.5")).unwrap();
        assert_eq!(other.1.values(), &[1.0]);

        assert!(count_values("bad-name", None, &input).is_err());
    }
}
