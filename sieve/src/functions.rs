//! Function library: elementwise maps, window reductions, and label rewriting.
//!
//! # Overview
//!
//! Every function is described by a [`FunctionDef`]: its argument kinds, the
//! kind it returns, how its output metrics relate to its input ([`Shape`]),
//! and a plain `fn` pointer that evaluates it. [`FunctionRegistry::builtin`]
//! holds the full table; the planner resolves names against it once and the
//! executor calls [`FunctionDef::call`] with the evaluated arguments.
//!
//! Window functions see each window with stale samples removed. An empty
//! window yields stale.
//!
//! # Example
//!
//! ```rust
//! use sieve::functions::FunctionRegistry;
//!
//! let registry = FunctionRegistry::builtin();
//! let rate = registry.get("rate").unwrap();
//! assert_eq!(rate.name(), "rate");
//! assert!(registry.get("no_such_function").is_err());
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::aggregate::{MappingOp, quantile, reduce_values};
use crate::error::{MatchingError, ParameterError, Result, SymbolError, TypeError};
use crate::matcher::{SeriesMatcher, anchored};
use crate::metric::{BUCKET_LABEL, FilterMode, Fingerprint, Metric, is_valid_label_name};
use crate::value::{Frames, PointMatrix, Points, RangeMatrix, RuntimeValue, STALE, Scalar, ValueKind, is_stale};

/// Evaluation entry point of a function.
pub type EvalFn = fn(&CallContext<'_>) -> Result<RuntimeValue>;

/// How a function's output rows relate to its input rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// One output row per row of argument `main`, in the same order.
    ///
    /// With `drops_name` the metric name is removed from every row. When the
    /// argument is missing the function yields a single unlabelled row.
    Map {
        /// Index of the row-carrying argument.
        main: usize,
        /// Whether output rows lose the metric name.
        drops_name: bool,
    },
    /// Output rows are only known after evaluation.
    Reshape,
    /// Returns a scalar.
    Scalar,
}

/// A builtin function.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    name: &'static str,
    params: &'static [ValueKind],
    optional: usize,
    variadic: bool,
    returns: ValueKind,
    shape: Shape,
    ordered: bool,
    eval: EvalFn,
}

impl FunctionDef {
    /// Function name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Kind of the returned value.
    pub fn returns(&self) -> ValueKind {
        self.returns
    }

    /// Output row shape.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Whether the function decides the order of its output rows.
    ///
    /// The executor keeps that order instead of sorting by fingerprint.
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Expected kind of argument `index`, if the function takes that many.
    pub fn param_kind(&self, index: usize) -> Option<ValueKind> {
        match self.params.get(index) {
            Some(kind) => Some(*kind),
            None if self.variadic => self.params.last().copied(),
            None => None,
        }
    }

    /// Checks the number of arguments.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::ArgumentCount`] when `found` is out of range.
    pub fn check_arity(&self, found: usize) -> Result<()> {
        let max = self.params.len();
        let min = max - self.optional;
        let ok = found >= min && (self.variadic || found <= max);
        if ok {
            return Ok(());
        }
        let expected = if self.variadic {
            format!("at least {min}")
        } else if min == max {
            min.to_string()
        } else {
            format!("{min} to {max}")
        };
        Err(TypeError::ArgumentCount {
            name: self.name.to_string(),
            expected,
            found,
        }
        .into())
    }

    /// Checks that argument `index` has the expected kind.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] on mismatch.
    pub fn check_kind(&self, index: usize, found: ValueKind) -> Result<()> {
        match self.param_kind(index) {
            Some(expected) if expected != found => Err(TypeError::UnexpectedKind {
                context: format!("{}() argument {}", self.name, index + 1),
                expected,
                found,
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Evaluates the function.
    ///
    /// # Errors
    ///
    /// Propagates argument kind and count errors and any parameter error the
    /// function raises.
    pub fn call(&self, frames: &Frames, args: &[RuntimeValue], hint: Option<&SeriesMatcher>) -> Result<RuntimeValue> {
        self.check_arity(args.len())?;
        let ctx = CallContext {
            name: self.name,
            frames,
            args,
            hint,
        };
        (self.eval)(&ctx)
    }
}

/// Arguments and environment of one function evaluation.
#[derive(Debug)]
pub struct CallContext<'a> {
    /// Name of the function being evaluated.
    pub name: &'a str,
    /// Evaluation grid.
    pub frames: &'a Frames,
    /// Evaluated arguments.
    pub args: &'a [RuntimeValue],
    /// Series matcher of the first argument, if it is an instant selector.
    pub hint: Option<&'a SeriesMatcher>,
}

impl CallContext<'_> {
    fn context(&self, index: usize) -> String {
        format!("{}() argument {}", self.name, index + 1)
    }

    fn arg(&self, index: usize) -> Result<&RuntimeValue> {
        self.args.get(index).ok_or_else(|| {
            TypeError::ArgumentCount {
                name: self.name.to_string(),
                expected: format!("at least {}", index + 1),
                found: self.args.len(),
            }
            .into()
        })
    }

    fn scalar(&self, index: usize) -> Result<&Scalar> {
        self.arg(index)?.as_scalar(&self.context(index))
    }

    fn text(&self, index: usize) -> Result<&str> {
        self.arg(index)?.as_text(&self.context(index))
    }

    fn vector(&self, index: usize) -> Result<&PointMatrix> {
        self.arg(index)?.as_vector(&self.context(index))
    }

    fn matrix(&self, index: usize) -> Result<&RangeMatrix> {
        self.arg(index)?.as_matrix(&self.context(index))
    }
}

/// Maps function names to definitions.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<&'static str, FunctionDef>,
}

const V: ValueKind = ValueKind::Vector;
const M: ValueKind = ValueKind::Matrix;
const S: ValueKind = ValueKind::Scalar;
const T: ValueKind = ValueKind::String;

const MAP: Shape = Shape::Map {
    main: 0,
    drops_name: true,
};

fn def(name: &'static str, params: &'static [ValueKind], shape: Shape, eval: EvalFn) -> FunctionDef {
    let returns = if shape == Shape::Scalar {
        ValueKind::Scalar
    } else {
        ValueKind::Vector
    };
    FunctionDef {
        name,
        params,
        optional: 0,
        variadic: false,
        returns,
        shape,
        ordered: false,
        eval,
    }
}

fn optional(mut d: FunctionDef, count: usize) -> FunctionDef {
    d.optional = count;
    d
}

impl FunctionRegistry {
    /// The builtin function table.
    pub fn builtin() -> Self {
        let mut table = vec![
            def("abs", &[V], MAP, |c| elementwise(c, f64::abs)),
            def("ceil", &[V], MAP, |c| elementwise(c, f64::ceil)),
            def("floor", &[V], MAP, |c| elementwise(c, f64::floor)),
            def("exp", &[V], MAP, |c| elementwise(c, f64::exp)),
            def("ln", &[V], MAP, |c| elementwise(c, f64::ln)),
            def("log2", &[V], MAP, |c| elementwise(c, f64::log2)),
            def("log10", &[V], MAP, |c| elementwise(c, f64::log10)),
            def("sqrt", &[V], MAP, |c| elementwise(c, f64::sqrt)),
            optional(def("round", &[V, S], MAP, eval_round), 1),
            def("clamp_min", &[V, S], MAP, |c| clamp(c, f64::max)),
            def("clamp_max", &[V, S], MAP, |c| clamp(c, f64::min)),
            def("timestamp", &[V], MAP, eval_timestamp),
            def("sum_over_time", &[M], MAP, |c| over_time(c, MappingOp::Sum)),
            def("avg_over_time", &[M], MAP, |c| over_time(c, MappingOp::Avg)),
            def("count_over_time", &[M], MAP, |c| over_time(c, MappingOp::Count)),
            def("min_over_time", &[M], MAP, |c| over_time(c, MappingOp::Min)),
            def("max_over_time", &[M], MAP, |c| over_time(c, MappingOp::Max)),
            def("stddev_over_time", &[M], MAP, |c| over_time(c, MappingOp::Stddev)),
            def("stdvar_over_time", &[M], MAP, |c| over_time(c, MappingOp::Stdvar)),
            def(
                "quantile_over_time",
                &[S, M],
                Shape::Map {
                    main: 1,
                    drops_name: true,
                },
                eval_quantile_over_time,
            ),
            def("rate", &[M], MAP, |c| windowed(c, 0, |m, t, w| extrapolated_rate(m, t, w, true, true))),
            def("increase", &[M], MAP, |c| windowed(c, 0, |m, t, w| extrapolated_rate(m, t, w, true, false))),
            def("delta", &[M], MAP, |c| windowed(c, 0, |m, t, w| extrapolated_rate(m, t, w, false, false))),
            def("irate", &[M], MAP, |c| windowed(c, 0, |_, _, w| instant_value(w, true))),
            def("idelta", &[M], MAP, |c| windowed(c, 0, |_, _, w| instant_value(w, false))),
            def("deriv", &[M], MAP, eval_deriv),
            def("predict_linear", &[M, S], MAP, eval_predict_linear),
            def("holt_winters", &[M, S, S], MAP, eval_holt_winters),
            def("changes", &[M], MAP, |c| windowed(c, 0, |_, _, w| changes(w.values()))),
            def("resets", &[M], MAP, |c| windowed(c, 0, |_, _, w| resets(w.values()))),
            optional(def("day_of_month", &[V], MAP, |c| chrono_fn(c, |d| f64::from(d.day()))), 1),
            optional(
                def("day_of_week", &[V], MAP, |c| {
                    chrono_fn(c, |d| f64::from(d.weekday().num_days_from_sunday()))
                }),
                1,
            ),
            optional(def("days_in_month", &[V], MAP, |c| chrono_fn(c, days_in_month)), 1),
            optional(def("hour", &[V], MAP, |c| chrono_fn(c, |d| f64::from(d.hour()))), 1),
            optional(def("minute", &[V], MAP, |c| chrono_fn(c, |d| f64::from(d.minute()))), 1),
            optional(def("month", &[V], MAP, |c| chrono_fn(c, |d| f64::from(d.month()))), 1),
            optional(def("year", &[V], MAP, |c| chrono_fn(c, |d| f64::from(d.year()))), 1),
            def("histogram_quantile", &[S, V], Shape::Reshape, eval_histogram_quantile),
            def("label_replace", &[V, T, T, T, T], Shape::Reshape, eval_label_replace),
            def("absent", &[V], Shape::Reshape, eval_absent),
            def("vector", &[S], Shape::Reshape, eval_vector),
            def("time", &[], Shape::Scalar, eval_time),
            def("scalar", &[V], Shape::Scalar, eval_scalar),
        ];

        let mut join = def("label_join", &[V, T, T, T], Shape::Reshape, eval_label_join);
        join.variadic = true;
        join.optional = 1;
        table.push(join);

        for (name, eval) in [("sort", eval_sort as EvalFn), ("sort_desc", eval_sort_desc as EvalFn)] {
            // Reordered rows cannot back a precomputed pairing.
            let mut d = def(name, &[V], Shape::Reshape, eval);
            d.ordered = true;
            table.push(d);
        }

        Self {
            functions: table.into_iter().map(|d| (d.name, d)).collect(),
        }
    }

    /// Resolves a function name.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Function`] for unknown names.
    pub fn get(&self, name: &str) -> Result<&FunctionDef> {
        self.functions.get(name).ok_or_else(|| {
            SymbolError::Function {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Names of all registered functions, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn drop_names(metrics: &[Metric]) -> Vec<Metric> {
    metrics.iter().map(Metric::without_name).collect()
}

/// Builds a vector from `input`'s rows, computing each value from its grid
/// index and the input value. Stale input stays stale.
fn map_rows(input: &PointMatrix, mut f: impl FnMut(usize, f64) -> f64) -> Result<RuntimeValue> {
    let rows = input
        .rows()
        .iter()
        .map(|r| r.map_values_indexed(|i, v| if is_stale(v) { STALE } else { f(i, v) }))
        .collect();
    Ok(RuntimeValue::Vector(PointMatrix::new(
        drop_names(input.metrics()),
        rows,
        *input.frames(),
    )?))
}

fn elementwise(ctx: &CallContext<'_>, f: fn(f64) -> f64) -> Result<RuntimeValue> {
    map_rows(ctx.vector(0)?, |_, v| f(v))
}

fn clamp(ctx: &CallContext<'_>, f: fn(f64, f64) -> f64) -> Result<RuntimeValue> {
    let bound = ctx.scalar(1)?;
    map_rows(ctx.vector(0)?, |i, v| f(v, bound.at(i)))
}

fn eval_round(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let to_nearest = match ctx.args.get(1) {
        Some(_) => ctx.scalar(1)?.clone(),
        None => Scalar::Constant(1.0),
    };
    map_rows(ctx.vector(0)?, |i, v| {
        let inverse = 1.0 / to_nearest.at(i);
        (v * inverse + 0.5).floor() / inverse
    })
}

#[allow(clippy::cast_precision_loss)]
fn eval_timestamp(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let input = ctx.vector(0)?;
    let frames = *input.frames();
    map_rows(input, |i, _| frames.get(i).map_or(STALE, |t| t as f64 / 1000.0))
}

/// Reduces each window of argument `index` with `f(matrix, timestamp, window)`.
fn windowed(
    ctx: &CallContext<'_>,
    index: usize,
    mut f: impl FnMut(&RangeMatrix, i64, &Points) -> f64,
) -> Result<RuntimeValue> {
    let m = ctx.matrix(index)?;
    let unified = m.unify(|ts, w| if w.is_empty() { STALE } else { f(m, ts, w) });
    let (metrics, rows, frames) = unified.into_parts();
    Ok(RuntimeValue::Vector(PointMatrix::new(drop_names(&metrics), rows, frames)?))
}

fn over_time(ctx: &CallContext<'_>, op: MappingOp) -> Result<RuntimeValue> {
    windowed(ctx, 0, |_, _, w| reduce_values(op, w.values()))
}

/// Value of a possibly per-timestamp scalar at grid timestamp `ts`.
fn scalar_at(s: &Scalar, frames: &Frames, ts: i64) -> f64 {
    frames.index_of(ts).map_or(STALE, |i| s.at(i))
}

fn eval_quantile_over_time(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let q = ctx.scalar(0)?;
    let frames = *ctx.frames;
    let mut scratch = Vec::new();
    windowed(ctx, 1, |_, ts, w| {
        scratch.clear();
        scratch.extend_from_slice(w.values());
        quantile(scalar_at(q, &frames, ts), &mut scratch)
    })
}

/// `rate`, `increase` and `delta`.
///
/// The observed difference between the first and last sample is extrapolated
/// towards the window boundaries. A boundary further away than 1.1 times the
/// average sample interval is only extrapolated by half an interval. Counters
/// are corrected for resets and never extrapolated below zero.
#[allow(clippy::cast_precision_loss)]
fn extrapolated_rate(m: &RangeMatrix, ts: i64, window: &Points, is_counter: bool, is_rate: bool) -> f64 {
    let (times, values) = (window.timestamps(), window.values());
    if values.len() < 2 {
        return STALE;
    }
    let range_start = ts - m.range() - m.offset();
    let range_end = ts - m.offset();
    let (first, last) = (values[0], values[values.len() - 1]);
    let (first_ts, last_ts) = (times[0], times[times.len() - 1]);

    let correction: f64 = if is_counter {
        values.windows(2).filter(|p| p[1] < p[0]).map(|p| p[0]).sum()
    } else {
        0.0
    };
    let mut result = last - first + correction;

    let mut to_start = (first_ts - range_start) as f64 / 1000.0;
    let to_end = (range_end - last_ts) as f64 / 1000.0;
    let sampled = (last_ts - first_ts) as f64 / 1000.0;
    let average = sampled / (values.len() - 1) as f64;

    if is_counter && result > 0.0 && first >= 0.0 {
        let to_zero = sampled * (first / result);
        if to_zero < to_start {
            to_start = to_zero;
        }
    }

    let threshold = average * 1.1;
    let mut interval = sampled;
    interval += if to_start < threshold { to_start } else { average / 2.0 };
    interval += if to_end < threshold { to_end } else { average / 2.0 };

    result *= interval / sampled;
    if is_rate {
        result /= m.range() as f64 / 1000.0;
    }
    result
}

/// `irate` and `idelta`: the last two samples only.
#[allow(clippy::cast_precision_loss)]
fn instant_value(window: &Points, is_rate: bool) -> f64 {
    let (times, values) = (window.timestamps(), window.values());
    let n = values.len();
    if n < 2 {
        return STALE;
    }
    let (last, prev) = (values[n - 1], values[n - 2]);
    let interval = times[n - 1] - times[n - 2];
    if interval == 0 {
        return STALE;
    }
    if !is_rate {
        return last - prev;
    }
    let delta = if last < prev { last } else { last - prev };
    delta / (interval as f64 / 1000.0)
}

/// Least squares fit of value against seconds since `intercept_time`.
///
/// Returns `(slope, intercept)`.
#[allow(clippy::cast_precision_loss)]
fn linear_regression(window: &Points, intercept_time: i64) -> (f64, f64) {
    let (mut n, mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (t, v) in window.iter() {
        let x = (t - intercept_time) as f64 / 1000.0;
        n += 1.0;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_x2 += x * x;
    }
    let cov_xy = sum_xy - sum_x * sum_y / n;
    let var_x = sum_x2 - sum_x * sum_x / n;
    let slope = cov_xy / var_x;
    let intercept = sum_y / n - slope * sum_x / n;
    (slope, intercept)
}

fn eval_deriv(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    windowed(ctx, 0, |_, _, w| {
        if w.len() < 2 {
            return STALE;
        }
        linear_regression(w, w.timestamps()[0]).0
    })
}

fn eval_predict_linear(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let duration = ctx.scalar(1)?;
    let frames = *ctx.frames;
    windowed(ctx, 0, |_, ts, w| {
        if w.len() < 2 {
            return STALE;
        }
        let (slope, intercept) = linear_regression(w, ts);
        slope * scalar_at(duration, &frames, ts) + intercept
    })
}

fn check_factor(s: &Scalar, frames: &Frames, trend: bool) -> Result<()> {
    for i in 0..frames.len() {
        let value = s.at(i);
        if !(value > 0.0 && value < 1.0) {
            return Err(if trend {
                ParameterError::TrendFactor { value }
            } else {
                ParameterError::SmoothingFactor { value }
            }
            .into());
        }
    }
    Ok(())
}

/// Double exponential smoothing; returns the last smoothed level.
fn holt_winters(values: &[f64], sf: f64, tf: f64) -> f64 {
    if values.len() < 2 {
        return STALE;
    }
    let (mut s0, mut s1) = (0.0, values[0]);
    let mut b = values[1] - values[0];
    for (i, &v) in values.iter().enumerate().skip(1) {
        let x = sf * v;
        if i > 1 {
            b = tf * (s1 - s0) + (1.0 - tf) * b;
        }
        let y = (1.0 - sf) * (s1 + b);
        s0 = s1;
        s1 = x + y;
    }
    s1
}

fn eval_holt_winters(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let (sf, tf) = (ctx.scalar(1)?, ctx.scalar(2)?);
    let frames = *ctx.frames;
    check_factor(sf, &frames, false)?;
    check_factor(tf, &frames, true)?;
    windowed(ctx, 0, |_, ts, w| {
        holt_winters(w.values(), scalar_at(sf, &frames, ts), scalar_at(tf, &frames, ts))
    })
}

#[allow(clippy::cast_precision_loss)]
fn changes(values: &[f64]) -> f64 {
    values
        .windows(2)
        .filter(|p| p[0] != p[1] && !(p[0].is_nan() && p[1].is_nan()))
        .count() as f64
}

#[allow(clippy::cast_precision_loss)]
fn resets(values: &[f64]) -> f64 {
    values.windows(2).filter(|p| p[1] < p[0]).count() as f64
}

fn days_in_month(d: &DateTime<Utc>) -> f64 {
    let (year, month) = (d.year(), d.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        #[allow(clippy::cast_precision_loss)]
        (Some(start), Some(end)) => (end - start).num_days() as f64,
        _ => f64::NAN,
    }
}

/// Calendar field extraction in UTC.
///
/// Without an argument the grid timestamps are used; otherwise each value of
/// the argument is read as seconds since the epoch.
#[allow(clippy::cast_possible_truncation)]
fn chrono_fn(ctx: &CallContext<'_>, extract: fn(&DateTime<Utc>) -> f64) -> Result<RuntimeValue> {
    if ctx.args.is_empty() {
        let row = Points::from_frames(ctx.frames, |_, t| {
            DateTime::from_timestamp_millis(t).map_or(f64::NAN, |d| extract(&d))
        });
        return Ok(RuntimeValue::Vector(PointMatrix::new(
            vec![Metric::empty()],
            vec![row],
            *ctx.frames,
        )?));
    }
    map_rows(ctx.vector(0)?, |_, v| {
        if !v.is_finite() {
            return f64::NAN;
        }
        DateTime::from_timestamp(v as i64, 0).map_or(f64::NAN, |d| extract(&d))
    })
}

fn parse_bound(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" | "inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

/// Interpolates quantile `q` within cumulative `(upper_bound, count)` buckets.
pub fn bucket_quantile(q: f64, buckets: &mut [(f64, f64)]) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    if buckets.len() < 2 {
        return f64::NAN;
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut max = buckets[0].1;
    for bucket in buckets.iter_mut().skip(1) {
        if bucket.1 > max {
            max = bucket.1;
        } else if bucket.1 < max {
            bucket.1 = max;
        }
    }

    let n = buckets.len();
    let mut rank = q * buckets[n - 1].1;
    let Some(b) = buckets.iter().position(|&(_, count)| count >= rank) else {
        return f64::NAN;
    };
    if b == n - 1 {
        return buckets[n - 2].0;
    }
    if b == 0 && buckets[0].0 <= 0.0 {
        return buckets[0].0;
    }
    let (mut start, end, mut count) = (0.0, buckets[b].0, buckets[b].1);
    if b > 0 {
        start = buckets[b - 1].0;
        count -= buckets[b - 1].1;
        rank -= buckets[b - 1].1;
    }
    start + (end - start) * (rank / count)
}

fn eval_histogram_quantile(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let q = ctx.scalar(0)?;
    let input = ctx.vector(1)?;
    let frames = *input.frames();

    let mut families: BTreeMap<Fingerprint, (Metric, Vec<(f64, usize)>)> = BTreeMap::new();
    for (row, metric) in input.metrics().iter().enumerate() {
        let Some(bound) = metric.get(BUCKET_LABEL).and_then(parse_bound) else {
            tracing::debug!(%metric, "histogram_quantile skips series without a valid bucket bound");
            continue;
        };
        let base = metric.filter(FilterMode::Without, &[BUCKET_LABEL], true);
        families
            .entry(base.fingerprint())
            .or_insert_with(|| (base, Vec::new()))
            .1
            .push((bound, row));
    }

    let mut buckets = Vec::new();
    let mut metrics = Vec::new();
    let mut rows = Vec::new();
    for (metric, members) in families.into_values() {
        let row = Points::from_frames(&frames, |i, _| {
            buckets.clear();
            buckets.extend(
                members
                    .iter()
                    .map(|&(bound, r)| (bound, input.rows()[r].values()[i]))
                    .filter(|(_, count)| !is_stale(*count)),
            );
            if buckets.is_empty() {
                STALE
            } else {
                bucket_quantile(q.at(i), &mut buckets)
            }
        });
        if !row.is_all_stale() {
            metrics.push(metric);
            rows.push(row);
        }
    }
    Ok(RuntimeValue::Vector(PointMatrix::new(metrics, rows, frames)?))
}

fn check_label_name(name: &str) -> Result<()> {
    if is_valid_label_name(name) {
        Ok(())
    } else {
        Err(ParameterError::InvalidLabelName {
            name: name.to_string(),
        }
        .into())
    }
}

/// Replaces the metrics of `input`, rejecting rewrites that collide.
fn relabel(function: &str, input: &PointMatrix, metrics: Vec<Metric>) -> Result<RuntimeValue> {
    let mut seen = HashSet::with_capacity(metrics.len());
    if let Some(dup) = metrics.iter().find(|m| !seen.insert(m.fingerprint())) {
        return Err(MatchingError::DuplicatedRewrite {
            function: function.to_string(),
            metric: dup.to_string(),
        }
        .into());
    }
    let out = input.clone().with_metrics(metrics)?;
    Ok(RuntimeValue::Vector(out.sort_by_fingerprint()))
}

fn eval_label_replace(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let input = ctx.vector(0)?;
    let (dst, replacement, src, pattern) = (ctx.text(1)?, ctx.text(2)?, ctx.text(3)?, ctx.text(4)?);
    let regex = anchored(pattern)?;
    check_label_name(dst)?;

    let metrics = input
        .metrics()
        .iter()
        .map(|metric| {
            let Some(caps) = regex.captures(metric.get(src).unwrap_or_default()) else {
                return metric.clone();
            };
            let mut value = String::new();
            caps.expand(replacement, &mut value);
            let mut builder = metric.to_builder();
            builder.put_or_remove(dst, Some(value.as_str()).filter(|v| !v.is_empty()));
            builder.build()
        })
        .collect();
    relabel(ctx.name, input, metrics)
}

fn eval_label_join(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let input = ctx.vector(0)?;
    let (dst, separator) = (ctx.text(1)?, ctx.text(2)?);
    check_label_name(dst)?;
    let sources = (3..ctx.args.len())
        .map(|i| {
            let name = ctx.text(i)?;
            check_label_name(name)?;
            Ok(name)
        })
        .collect::<Result<Vec<_>>>()?;

    let metrics = input
        .metrics()
        .iter()
        .map(|metric| {
            let joined = sources
                .iter()
                .map(|s| metric.get(s).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(separator);
            let mut builder = metric.to_builder();
            builder.put_or_remove(dst, Some(joined.as_str()).filter(|v| !v.is_empty()));
            builder.build()
        })
        .collect();
    relabel(ctx.name, input, metrics)
}

fn sort_rows(input: &PointMatrix, descending: bool) -> Result<RuntimeValue> {
    let (metrics, rows, frames) = input.clone().into_parts();
    let mut pairs: Vec<(Metric, Points)> = metrics.into_iter().zip(rows).collect();
    pairs.sort_by(|a, b| {
        let (x, y) = (a.1.last().unwrap_or(STALE), b.1.last().unwrap_or(STALE));
        match (x.is_nan(), y.is_nan()) {
            (false, false) if descending => y.total_cmp(&x),
            (false, false) => x.total_cmp(&y),
            (nx, ny) => nx.cmp(&ny),
        }
    });
    let (metrics, rows) = pairs.into_iter().unzip();
    Ok(RuntimeValue::Vector(PointMatrix::new(metrics, rows, frames)?))
}

fn eval_sort(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    sort_rows(ctx.vector(0)?, false)
}

fn eval_sort_desc(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    sort_rows(ctx.vector(0)?, true)
}

fn eval_absent(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let input = ctx.vector(0)?;
    let frames = *input.frames();
    let row = Points::from_frames(&frames, |i, _| {
        if input.rows().iter().any(|r| !is_stale(r.values()[i])) {
            STALE
        } else {
            1.0
        }
    });
    if row.is_all_stale() {
        return Ok(RuntimeValue::Vector(PointMatrix::empty(frames)));
    }
    let metric = ctx.hint.map_or_else(Metric::empty, SeriesMatcher::equality_labels);
    Ok(RuntimeValue::Vector(PointMatrix::new(vec![metric], vec![row], frames)?))
}

fn eval_vector(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let s = ctx.scalar(0)?;
    let row = Points::from_frames(ctx.frames, |i, _| s.at(i));
    Ok(RuntimeValue::Vector(PointMatrix::new(
        vec![Metric::empty()],
        vec![row],
        *ctx.frames,
    )?))
}

#[allow(clippy::cast_precision_loss, clippy::unnecessary_wraps)]
fn eval_time(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    Ok(RuntimeValue::Scalar(Scalar::Series(
        ctx.frames.iter().map(|t| t as f64 / 1000.0).collect(),
    )))
}

/// `scalar(v)`: the single value present at each timestamp, otherwise NaN.
fn eval_scalar(ctx: &CallContext<'_>) -> Result<RuntimeValue> {
    let input = ctx.vector(0)?;
    let values = (0..ctx.frames.len())
        .map(|i| {
            let mut present = input.rows().iter().map(|r| r.values()[i]).filter(|v| !is_stale(*v));
            match (present.next(), present.next()) {
                (Some(v), None) => v,
                _ => f64::NAN,
            }
        })
        .collect();
    Ok(RuntimeValue::Scalar(Scalar::Series(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::LabelMatcher;

    fn m(labels: &[(&str, &str)]) -> Metric {
        Metric::new(labels.iter().copied())
    }

    fn vector(frames: Frames, rows: Vec<(Metric, Vec<f64>)>) -> RuntimeValue {
        let (metrics, rows): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .map(|(mm, vs)| (mm, Points::from_frames(&frames, |i, _| vs[i])))
            .unzip();
        RuntimeValue::Vector(PointMatrix::new(metrics, rows, frames).unwrap())
    }

    fn range(frames: Frames, range_ms: i64, samples: &[(i64, f64)]) -> RuntimeValue {
        let window = |t: i64| {
            let (ts, vs) = samples
                .iter()
                .filter(|(s, _)| *s >= t - range_ms && *s <= t)
                .copied()
                .unzip();
            Points::new(ts, vs).unwrap()
        };
        let windows = vec![frames.iter().map(window).collect()];
        RuntimeValue::Matrix(
            RangeMatrix::new(vec![m(&[("__name__", "c"), ("job", "x")])], windows, frames, range_ms, 0).unwrap(),
        )
    }

    fn call(name: &str, frames: &Frames, args: &[RuntimeValue]) -> Result<RuntimeValue> {
        FunctionRegistry::builtin().get(name)?.call(frames, args, None)
    }

    fn values(v: &RuntimeValue) -> Vec<f64> {
        v.as_vector("test").unwrap().rows()[0].values().to_vec()
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            FunctionRegistry::builtin().get("nope"),
            Err(crate::SieveError::Symbol(SymbolError::Function { .. }))
        ));
    }

    #[test]
    fn test_arity_checks() {
        let reg = FunctionRegistry::builtin();
        assert!(reg.get("round").unwrap().check_arity(1).is_ok());
        assert!(reg.get("round").unwrap().check_arity(2).is_ok());
        assert!(reg.get("round").unwrap().check_arity(3).is_err());
        assert!(reg.get("label_join").unwrap().check_arity(6).is_ok());
        assert!(reg.get("label_join").unwrap().check_arity(2).is_err());
        assert!(reg.get("hour").unwrap().check_arity(0).is_ok());
        assert!(reg.get("time").unwrap().check_arity(1).is_err());
        assert!(reg.get("rate").unwrap().check_kind(0, ValueKind::Vector).is_err());
    }

    #[test]
    fn test_elementwise_drops_name_and_keeps_stale() {
        let frames = Frames::new(0, 1000, 1000).unwrap();
        let input = vector(frames, vec![(m(&[("__name__", "x"), ("a", "1")]), vec![-2.5, STALE])]);
        let out = call("abs", &frames, &[input]).unwrap();
        let pm = out.as_vector("test").unwrap();
        assert_eq!(pm.metrics()[0], m(&[("a", "1")]));
        assert_eq!(pm.rows()[0].values()[0], 2.5);
        assert!(is_stale(pm.rows()[0].values()[1]));
    }

    #[test]
    fn test_round_and_clamp() {
        let frames = Frames::instant(0);
        let input = vector(frames, vec![(m(&[("a", "1")]), vec![2.26])]);
        let out = call("round", &frames, &[input.clone(), RuntimeValue::Scalar(Scalar::Constant(0.5))]).unwrap();
        assert_eq!(values(&out), vec![2.5]);
        let out = call("round", &frames, std::slice::from_ref(&input)).unwrap();
        assert_eq!(values(&out), vec![2.0]);
        let out = call("clamp_max", &frames, &[input, RuntimeValue::Scalar(Scalar::Constant(1.0))]).unwrap();
        assert_eq!(values(&out), vec![1.0]);
    }

    #[test]
    fn test_rate_on_steady_counter() {
        // 10 per 10s, window of 60s covering samples at 0..=60s.
        let samples: Vec<(i64, f64)> = (0..=6).map(|i| (i * 10_000, f64::from(i as i32) * 10.0)).collect();
        let frames = Frames::instant(60_000);
        let out = call("rate", &frames, &[range(frames, 60_000, &samples)]).unwrap();
        assert!((values(&out)[0] - 1.0).abs() < 1e-9);
        let out = call("increase", &frames, &[range(frames, 60_000, &samples)]).unwrap();
        assert!((values(&out)[0] - 60.0).abs() < 1e-9);
        let pm = out.as_vector("test").unwrap();
        assert_eq!(pm.metrics()[0], m(&[("job", "x")]));
    }

    #[test]
    fn test_rate_corrects_counter_reset() {
        let samples = [(0, 5.0), (10_000, 10.0), (20_000, 2.0), (30_000, 7.0)];
        let frames = Frames::instant(30_000);
        let out = call("increase", &frames, &[range(frames, 30_000, &samples)]).unwrap();
        // 7 - 5 + 10 observed, zero crossing closer than boundary does not apply.
        assert!((values(&out)[0] - 12.0).abs() < 1e-9);
        let out = call("resets", &frames, &[range(frames, 30_000, &samples)]).unwrap();
        assert_eq!(values(&out), vec![1.0]);
        let out = call("changes", &frames, &[range(frames, 30_000, &samples)]).unwrap();
        assert_eq!(values(&out), vec![3.0]);
    }

    #[test]
    fn test_rate_needs_two_samples() {
        let frames = Frames::instant(10_000);
        let out = call("rate", &frames, &[range(frames, 5000, &[(9000, 1.0)])]).unwrap();
        assert!(is_stale(values(&out)[0]));
        let out = call("sum_over_time", &frames, &[range(frames, 5000, &[])]).unwrap();
        assert!(is_stale(values(&out)[0]));
    }

    #[test]
    fn test_irate_and_idelta() {
        let samples = [(0, 1.0), (10_000, 4.0), (20_000, 2.0)];
        let frames = Frames::instant(20_000);
        let out = call("irate", &frames, &[range(frames, 30_000, &samples)]).unwrap();
        assert!((values(&out)[0] - 0.2).abs() < 1e-12);
        let out = call("idelta", &frames, &[range(frames, 30_000, &samples)]).unwrap();
        assert_eq!(values(&out), vec![-2.0]);
    }

    #[test]
    fn test_deriv_and_predict_linear() {
        let samples: Vec<(i64, f64)> = (0..5).map(|i| (i * 1000, 3.0 + 2.0 * f64::from(i as i32))).collect();
        let frames = Frames::instant(4000);
        let out = call("deriv", &frames, &[range(frames, 10_000, &samples)]).unwrap();
        assert!((values(&out)[0] - 2.0).abs() < 1e-9);
        let out = call(
            "predict_linear",
            &frames,
            &[range(frames, 10_000, &samples), RuntimeValue::Scalar(Scalar::Constant(10.0))],
        )
        .unwrap();
        // Value at 4s is 11, slope 2 per second.
        assert!((values(&out)[0] - 31.0).abs() < 1e-9);
    }

    #[test]
    fn test_over_time_reductions() {
        let samples = [(0, 1.0), (1000, 3.0), (2000, STALE), (3000, 2.0)];
        let frames = Frames::instant(3000);
        let arg = || range(frames, 10_000, &samples);
        assert_eq!(values(&call("count_over_time", &frames, &[arg()]).unwrap()), vec![3.0]);
        assert_eq!(values(&call("sum_over_time", &frames, &[arg()]).unwrap()), vec![6.0]);
        assert_eq!(values(&call("avg_over_time", &frames, &[arg()]).unwrap()), vec![2.0]);
        assert_eq!(values(&call("max_over_time", &frames, &[arg()]).unwrap()), vec![3.0]);
        assert_eq!(values(&call("min_over_time", &frames, &[arg()]).unwrap()), vec![1.0]);
        let q = call(
            "quantile_over_time",
            &frames,
            &[RuntimeValue::Scalar(Scalar::Constant(0.5)), arg()],
        )
        .unwrap();
        assert_eq!(values(&q), vec![2.0]);
    }

    #[test]
    fn test_holt_winters() {
        assert_eq!(holt_winters(&[1.0, 2.0, 3.0, 4.0], 0.5, 0.5), 4.0);
        let frames = Frames::instant(3000);
        let bad = call(
            "holt_winters",
            &frames,
            &[
                range(frames, 10_000, &[(0, 1.0), (1000, 2.0)]),
                RuntimeValue::Scalar(Scalar::Constant(1.0)),
                RuntimeValue::Scalar(Scalar::Constant(0.5)),
            ],
        );
        assert!(matches!(
            bad,
            Err(crate::SieveError::Parameter(ParameterError::SmoothingFactor { .. }))
        ));
    }

    #[test]
    fn test_bucket_quantile_rules() {
        let mut two = [(1.0, 50.0), (f64::INFINITY, 100.0)];
        let v = bucket_quantile(0.5, &mut two);
        assert!(v > 0.0 && v <= 1.0);
        assert_eq!(bucket_quantile(1.5, &mut two), f64::INFINITY);
        assert_eq!(bucket_quantile(-0.5, &mut two), f64::NEG_INFINITY);
        assert!(bucket_quantile(0.5, &mut [(1.0, 3.0)]).is_nan());
        // Rank in the last bucket returns the second to last bound.
        assert_eq!(bucket_quantile(0.9, &mut two), 1.0);
        // Non-monotonic counts are clamped.
        let mut buckets = [(2.0, 4.0), (1.0, 5.0), (f64::INFINITY, 10.0)];
        assert_eq!(bucket_quantile(0.2, &mut buckets), 1.0 * (2.0 / 5.0));
        let mut neg = [(-1.0, 5.0), (f64::INFINITY, 10.0)];
        assert_eq!(bucket_quantile(0.1, &mut neg), -1.0);
    }

    #[test]
    fn test_histogram_quantile_groups_families() {
        let frames = Frames::instant(0);
        let input = vector(
            frames,
            vec![
                (m(&[("__name__", "h"), ("le", "1"), ("job", "a")]), vec![50.0]),
                (m(&[("__name__", "h"), ("le", "+Inf"), ("job", "a")]), vec![100.0]),
                (m(&[("__name__", "h"), ("le", "2"), ("job", "b")]), vec![1.0]),
                (m(&[("__name__", "h"), ("le", "+Inf"), ("job", "b")]), vec![1.0]),
                (m(&[("__name__", "h"), ("job", "c")]), vec![1.0]),
            ],
        );
        let out = call(
            "histogram_quantile",
            &frames,
            &[RuntimeValue::Scalar(Scalar::Constant(0.5)), input],
        )
        .unwrap();
        let pm = out.as_vector("test").unwrap();
        assert_eq!(pm.len(), 2);
        let a = pm.iter().find(|(mm, _)| mm.get("job") == Some("a")).unwrap();
        assert_eq!(a.0, &m(&[("job", "a")]));
        assert_eq!(a.1.values(), &[1.0]);
    }

    #[test]
    fn test_label_replace() {
        let frames = Frames::instant(0);
        let input = vector(
            frames,
            vec![
                (m(&[("__name__", "up"), ("instance", "host1:9100")]), vec![1.0]),
                (m(&[("__name__", "up"), ("instance", "other")]), vec![1.0]),
            ],
        );
        let text = |s: &str| RuntimeValue::Text(s.to_string());
        let out = call(
            "label_replace",
            &frames,
            &[input, text("host"), text("$1"), text("instance"), text("(.*):.*")],
        )
        .unwrap();
        let pm = out.as_vector("test").unwrap();
        let replaced = pm.metrics().iter().find(|mm| mm.get("instance") == Some("host1:9100")).unwrap();
        assert_eq!(replaced.get("host"), Some("host1"));
        assert_eq!(replaced.name(), Some("up"));
        let untouched = pm.metrics().iter().find(|mm| mm.get("instance") == Some("other")).unwrap();
        assert_eq!(untouched.get("host"), None);
    }

    #[test]
    fn test_label_replace_rejects_duplicates() {
        let frames = Frames::instant(0);
        let input = vector(
            frames,
            vec![(m(&[("a", "x"), ("b", "1")]), vec![1.0]), (m(&[("a", "x"), ("b", "2")]), vec![2.0])],
        );
        let text = |s: &str| RuntimeValue::Text(s.to_string());
        let out = call("label_replace", &frames, &[input, text("b"), text("same"), text("a"), text(".*")]);
        assert!(matches!(
            out,
            Err(crate::SieveError::Matching(MatchingError::DuplicatedRewrite { .. }))
        ));
    }

    #[test]
    fn test_label_replace_invalid_regex() {
        let frames = Frames::instant(0);
        let input = vector(frames, vec![(m(&[("a", "x")]), vec![1.0])]);
        let text = |s: &str| RuntimeValue::Text(s.to_string());
        let out = call("label_replace", &frames, &[input, text("b"), text("$1"), text("a"), text("(")]);
        assert!(matches!(
            out,
            Err(crate::SieveError::Parameter(ParameterError::InvalidRegex { .. }))
        ));
    }

    #[test]
    fn test_label_join() {
        let frames = Frames::instant(0);
        let input = vector(frames, vec![(m(&[("a", "x"), ("b", "y")]), vec![1.0])]);
        let text = |s: &str| RuntimeValue::Text(s.to_string());
        let out = call("label_join", &frames, &[input, text("c"), text("-"), text("a"), text("b")]).unwrap();
        assert_eq!(out.as_vector("test").unwrap().metrics()[0].get("c"), Some("x-y"));
    }

    #[test]
    fn test_sort_desc_orders_by_value() {
        let frames = Frames::instant(0);
        let input = vector(
            frames,
            vec![
                (m(&[("i", "1")]), vec![1.0]),
                (m(&[("i", "2")]), vec![f64::NAN]),
                (m(&[("i", "3")]), vec![3.0]),
            ],
        );
        let out = call("sort_desc", &frames, &[input]).unwrap();
        let order: Vec<_> = out
            .as_vector("test")
            .unwrap()
            .metrics()
            .iter()
            .map(|mm| mm.get("i").unwrap_or_default().to_string())
            .collect();
        assert_eq!(order, vec!["3", "1", "2"]);
    }

    #[test]
    fn test_absent_uses_equality_labels() {
        let frames = Frames::new(0, 2000, 1000).unwrap();
        let input = vector(frames, vec![(m(&[("a", "1")]), vec![1.0, STALE, STALE])]);
        let hint = SeriesMatcher::for_selector(
            Some("up"),
            &[
                LabelMatcher::equal("job", "api"),
                LabelMatcher::new("env", crate::matcher::MatchOp::Regex, "p.*").unwrap(),
            ],
        );
        let def = FunctionRegistry::builtin();
        let out = def.get("absent").unwrap().call(&frames, &[input], Some(&hint)).unwrap();
        let pm = out.as_vector("test").unwrap();
        assert_eq!(pm.metrics(), &[m(&[("job", "api")])]);
        assert!(is_stale(pm.rows()[0].values()[0]));
        assert_eq!(&pm.rows()[0].values()[1..], &[1.0, 1.0]);

        let present = vector(frames, vec![(m(&[("a", "1")]), vec![1.0, 1.0, 1.0])]);
        let out = call("absent", &frames, &[present]).unwrap();
        assert!(out.as_vector("test").unwrap().is_empty());
    }

    #[test]
    fn test_time_vector_scalar() {
        let frames = Frames::new(1000, 2000, 1000).unwrap();
        let t = call("time", &frames, &[]).unwrap();
        assert_eq!(t.as_scalar("test").unwrap().at(1), 2.0);
        let v = call("vector", &frames, &[t]).unwrap();
        assert_eq!(values(&v), vec![1.0, 2.0]);

        let input = vector(
            frames,
            vec![(m(&[("i", "1")]), vec![5.0, 5.0]), (m(&[("i", "2")]), vec![STALE, 6.0])],
        );
        let s = call("scalar", &frames, &[input]).unwrap();
        let s = s.as_scalar("test").unwrap();
        assert_eq!(s.at(0), 5.0);
        assert!(s.at(1).is_nan() && !is_stale(s.at(1)));
    }

    #[test]
    fn test_chrono_functions() {
        // 2024-02-29T13:45:00Z, a Thursday.
        let secs = 1_709_214_300.0;
        let frames = Frames::instant(0);
        let input = || vector(frames, vec![(m(&[("__name__", "t")]), vec![secs])]);
        let at = |name: &str| values(&call(name, &frames, &[input()]).unwrap())[0];
        assert_eq!(at("year"), 2024.0);
        assert_eq!(at("month"), 2.0);
        assert_eq!(at("day_of_month"), 29.0);
        assert_eq!(at("day_of_week"), 4.0);
        assert_eq!(at("days_in_month"), 29.0);
        assert_eq!(at("hour"), 13.0);
        assert_eq!(at("minute"), 45.0);

        let grid = Frames::instant(1_709_214_300_000);
        let out = call("hour", &grid, &[]).unwrap();
        assert_eq!(values(&out), vec![13.0]);
        assert_eq!(out.as_vector("test").unwrap().metrics()[0], Metric::empty());
    }
}
