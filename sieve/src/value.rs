//! Runtime value model: the stale sentinel, evaluation grids, and the
//! containers that carry numbers through a plan.
//!
//! # Overview
//!
//! - [`Frames`] - the evaluation grid, an arithmetic sequence of millisecond timestamps
//! - [`Points`] - one row of parallel timestamps and values
//! - [`PointMatrix`] - rows of [`Points`] keyed by [`Metric`], sharing one grid
//! - [`RangeMatrix`] - rows where every grid timestamp owns a window of raw samples
//! - [`Scalar`] - an untimed number, possibly varying per grid timestamp
//! - [`RuntimeValue`] - what evaluating any plan node produces
//!
//! # Staleness
//!
//! "No data here" is encoded as a NaN with a reserved payload, [`STALE_BITS`].
//! It is compared by raw bits, so a NaN computed by arithmetic (`0/0`) is never
//! mistaken for a missing sample.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InternalError, MatchingError, ParameterError, Result, TypeError};
use crate::metric::Metric;

/// Bit pattern of the stale sentinel: a quiet NaN with payload bit 50 set.
pub const STALE_BITS: u64 = 0x7ff8_0000_0000_0000 | (1 << 50);

/// The stale sentinel value.
pub const STALE: f64 = f64::from_bits(STALE_BITS);

/// Whether `v` is the stale sentinel. Ordinary NaNs are not stale.
#[inline]
pub fn is_stale(v: f64) -> bool {
    v.to_bits() == STALE_BITS
}

/// Formats a sample value the way Prometheus-compatible clients expect.
///
/// Non-finite values print as `NaN`, `+Inf` and `-Inf`; finite values use the
/// shortest representation that round-trips, without a trailing `.0`.
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

/// Kind of a [`RuntimeValue`], used in type errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// A number.
    Scalar,
    /// A string.
    String,
    /// An instant vector.
    Vector,
    /// A range vector.
    Matrix,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar => "scalar",
            Self::String => "string",
            Self::Vector => "instant vector",
            Self::Matrix => "range vector",
        })
    }
}

/// An evaluation grid: timestamps `start, start + step, ..., end` in milliseconds.
///
/// An instant query is the grid with `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frames {
    start: i64,
    end: i64,
    step: i64,
}

impl Frames {
    /// Creates a grid.
    ///
    /// `end` is rounded down to the last timestamp aligned with `step`.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::InvalidFrames`] if `step` is not positive or
    /// `end` precedes `start`.
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self> {
        let invalid = |reason: &str| ParameterError::InvalidFrames {
            start,
            end,
            step,
            reason: reason.to_string(),
        };
        if step <= 0 {
            return Err(invalid("step must be positive").into());
        }
        if end < start {
            return Err(invalid("end precedes start").into());
        }
        let end = start + (end - start) / step * step;
        Ok(Self { start, end, step })
    }

    /// The single-timestamp grid used by instant queries.
    pub fn instant(ts: i64) -> Self {
        Self {
            start: ts,
            end: ts,
            step: 1,
        }
    }

    /// First timestamp.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Last timestamp.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Distance between consecutive timestamps.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Number of timestamps in the grid; never zero.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn len(&self) -> usize {
        ((self.end - self.start) / self.step + 1) as usize
    }

    /// Always false: a grid holds at least one timestamp.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether this grid has a single timestamp.
    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    /// Timestamp at `index`.
    pub fn get(&self, index: usize) -> Option<i64> {
        let i = i64::try_from(index).ok()?;
        let ts = self.start.checked_add(i.checked_mul(self.step)?)?;
        (ts <= self.end).then_some(ts)
    }

    /// Iterates the grid timestamps in order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Collects the grid timestamps.
    pub fn to_vec(&self) -> Vec<i64> {
        self.iter().collect()
    }

    /// Whether `ts` lies within `[start, end]`, aligned or not.
    pub fn includes(&self, ts: i64) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Whether `ts` is one of the grid timestamps.
    pub fn contains(&self, ts: i64) -> bool {
        self.includes(ts) && (ts - self.start) % self.step == 0
    }

    /// Index of `ts` if it is a grid timestamp.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn index_of(&self, ts: i64) -> Option<usize> {
        self.contains(ts)
            .then(|| ((ts - self.start) / self.step) as usize)
    }

    /// Extends the start backward by `lookback` milliseconds, keeping step alignment.
    ///
    /// With `inclusive`, the new start is rounded further back to the aligned
    /// timestamp at or before `start - lookback`; otherwise it is rounded
    /// forward to the aligned timestamp after it.
    pub fn stretch_start(&self, lookback: i64, inclusive: bool) -> Self {
        if lookback == 0 {
            return *self;
        }
        let jitter = lookback % self.step;
        let start = if inclusive {
            self.start - lookback - (self.step - jitter)
        } else {
            self.start - lookback + jitter
        };
        Self {
            start,
            end: self.end,
            step: self.step,
        }
    }

    /// Moves the whole grid by `delta` milliseconds.
    pub fn shift(&self, delta: i64) -> Self {
        Self {
            start: self.start + delta,
            end: self.end + delta,
            step: self.step,
        }
    }
}

impl fmt::Display for Frames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{} step {}]", self.start, self.end, self.step)
    }
}

/// Parallel timestamps and values of one row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Points {
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl Points {
    /// Creates a row from parallel arrays.
    ///
    /// # Errors
    ///
    /// Returns [`InternalError::ShapeMismatch`] if the lengths differ.
    pub fn new(timestamps: Vec<i64>, values: Vec<f64>) -> Result<Self> {
        if timestamps.len() != values.len() {
            return Err(InternalError::ShapeMismatch {
                reason: format!(
                    "{} timestamps but {} values",
                    timestamps.len(),
                    values.len()
                ),
            }
            .into());
        }
        Ok(Self { timestamps, values })
    }

    /// Creates a row over `frames`, computing each value from its index and timestamp.
    pub fn from_frames(frames: &Frames, mut f: impl FnMut(usize, i64) -> f64) -> Self {
        let timestamps = frames.to_vec();
        let values = timestamps.iter().enumerate().map(|(i, &t)| f(i, t)).collect();
        Self { timestamps, values }
    }

    /// A row over `frames` where every value is stale.
    pub fn stale(frames: &Frames) -> Self {
        Self::from_frames(frames, |_, _| STALE)
    }

    /// Timestamps in milliseconds.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Values, parallel to [`Points::timestamps`].
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable access to the values; the timestamps are fixed.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no points.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the row has no points or only stale ones.
    pub fn is_all_stale(&self) -> bool {
        self.values.iter().all(|&v| is_stale(v))
    }

    /// Last value, if any.
    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Applies `f(value, timestamp)` to every point, keeping the timestamps.
    pub fn map_values(&self, mut f: impl FnMut(f64, i64) -> f64) -> Self {
        let values = self
            .values
            .iter()
            .zip(&self.timestamps)
            .map(|(&v, &t)| f(v, t))
            .collect();
        Self {
            timestamps: self.timestamps.clone(),
            values,
        }
    }

    /// Applies `f(index, value)` to every point, keeping the timestamps.
    pub fn map_values_indexed(&self, mut f: impl FnMut(usize, f64) -> f64) -> Self {
        let values = self.values.iter().enumerate().map(|(i, &v)| f(i, v)).collect();
        Self {
            timestamps: self.timestamps.clone(),
            values,
        }
    }

    /// Iterates `(timestamp, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.timestamps.iter().copied().zip(self.values.iter().copied())
    }
}

/// Rows of [`Points`] keyed by metric, all on the same grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PointMatrix {
    metrics: Vec<Metric>,
    rows: Vec<Points>,
    frames: Frames,
}

impl PointMatrix {
    /// Creates a matrix.
    ///
    /// # Errors
    ///
    /// Returns [`InternalError::ShapeMismatch`] if `metrics` and `rows` differ
    /// in length or a row does not have one point per grid timestamp.
    pub fn new(metrics: Vec<Metric>, rows: Vec<Points>, frames: Frames) -> Result<Self> {
        if metrics.len() != rows.len() {
            return Err(InternalError::ShapeMismatch {
                reason: format!("{} metrics but {} rows", metrics.len(), rows.len()),
            }
            .into());
        }
        if let Some(row) = rows.iter().find(|r| r.len() != frames.len()) {
            return Err(InternalError::ShapeMismatch {
                reason: format!("row of {} points on a grid of {}", row.len(), frames.len()),
            }
            .into());
        }
        Ok(Self {
            metrics,
            rows,
            frames,
        })
    }

    /// A matrix without rows.
    pub fn empty(frames: Frames) -> Self {
        Self {
            metrics: Vec::new(),
            rows: Vec::new(),
            frames,
        }
    }

    /// Row metrics.
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Row values.
    pub fn rows(&self) -> &[Points] {
        &self.rows
    }

    /// Mutable row values. Callers own this matrix exclusively.
    pub fn rows_mut(&mut self) -> &mut [Points] {
        &mut self.rows
    }

    /// The shared grid.
    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates `(metric, row)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Metric, &Points)> {
        self.metrics.iter().zip(self.rows.iter())
    }

    /// Splits into metrics, rows and grid.
    pub fn into_parts(self) -> (Vec<Metric>, Vec<Points>, Frames) {
        (self.metrics, self.rows, self.frames)
    }

    /// Applies `f(value, timestamp)` elementwise, keeping metrics.
    pub fn map_values(&self, mut f: impl FnMut(f64, i64) -> f64) -> Self {
        Self {
            metrics: self.metrics.clone(),
            rows: self.rows.iter().map(|r| r.map_values(&mut f)).collect(),
            frames: self.frames,
        }
    }

    /// Replaces the metrics, keeping the rows.
    ///
    /// # Errors
    ///
    /// Returns [`InternalError::ShapeMismatch`] if the count changes.
    pub fn with_metrics(self, metrics: Vec<Metric>) -> Result<Self> {
        Self::new(metrics, self.rows, self.frames)
    }

    /// Sorts rows by metric fingerprint.
    pub fn sort_by_fingerprint(self) -> Self {
        let mut pairs: Vec<(Metric, Points)> = self.metrics.into_iter().zip(self.rows).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let (metrics, rows) = pairs.into_iter().unzip();
        Self {
            metrics,
            rows,
            frames: self.frames,
        }
    }

    /// Sorts rows by fingerprint and rejects duplicate label sets.
    ///
    /// # Errors
    ///
    /// Returns [`MatchingError::DuplicatedLabelSet`] if two rows share a metric.
    pub fn into_sorted_unique(self) -> Result<Self> {
        let sorted = self.sort_by_fingerprint();
        if let Some(w) = sorted.metrics.windows(2).find(|w| w[0] == w[1]) {
            return Err(MatchingError::DuplicatedLabelSet {
                metric: w[0].to_string(),
            }
            .into());
        }
        Ok(sorted)
    }

    /// Rejects duplicate label sets without reordering rows.
    ///
    /// # Errors
    ///
    /// Returns [`MatchingError::DuplicatedLabelSet`] if two rows share a metric.
    pub fn check_unique(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::with_capacity(self.metrics.len());
        match self.metrics.iter().find(|m| !seen.insert(m.fingerprint())) {
            Some(dup) => Err(MatchingError::DuplicatedLabelSet {
                metric: dup.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

/// Rows where every grid timestamp owns a window of raw samples.
///
/// The window at grid timestamp `t` holds the samples in
/// `[t - range - offset, t - offset]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeMatrix {
    metrics: Vec<Metric>,
    windows: Vec<Vec<Points>>,
    frames: Frames,
    range: i64,
    offset: i64,
}

impl RangeMatrix {
    /// Creates a range matrix; `windows[row][frame]` holds the samples.
    ///
    /// # Errors
    ///
    /// Returns [`InternalError::ShapeMismatch`] on inconsistent dimensions.
    pub fn new(
        metrics: Vec<Metric>,
        windows: Vec<Vec<Points>>,
        frames: Frames,
        range: i64,
        offset: i64,
    ) -> Result<Self> {
        if metrics.len() != windows.len() || windows.iter().any(|w| w.len() != frames.len()) {
            return Err(InternalError::ShapeMismatch {
                reason: format!(
                    "{} metrics, {} window rows on a grid of {}",
                    metrics.len(),
                    windows.len(),
                    frames.len()
                ),
            }
            .into());
        }
        Ok(Self {
            metrics,
            windows,
            frames,
            range,
            offset,
        })
    }

    /// Row metrics.
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Windows per row, one per grid timestamp.
    pub fn windows(&self) -> &[Vec<Points>] {
        &self.windows
    }

    /// The shared grid.
    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    /// Window length in milliseconds.
    pub fn range(&self) -> i64 {
        self.range
    }

    /// Offset in milliseconds.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Collapses every window to one value.
    ///
    /// `f` receives the grid timestamp and the window with stale samples
    /// removed; the resulting matrix keeps the row metrics.
    pub fn unify(&self, mut f: impl FnMut(i64, &Points) -> f64) -> PointMatrix {
        let rows = self
            .windows
            .iter()
            .map(|row| {
                Points::from_frames(&self.frames, |i, ts| {
                    let window = &row[i];
                    if window.values.iter().any(|&v| is_stale(v)) {
                        let (timestamps, values) =
                            window.iter().filter(|&(_, v)| !is_stale(v)).unzip();
                        f(ts, &Points { timestamps, values })
                    } else {
                        f(ts, window)
                    }
                })
            })
            .collect();
        PointMatrix {
            metrics: self.metrics.clone(),
            rows,
            frames: self.frames,
        }
    }
}

/// A number that is constant or varies per grid timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// The same value at every timestamp.
    Constant(f64),
    /// One value per grid timestamp.
    Series(Vec<f64>),
}

impl Scalar {
    /// Value at grid index `i`.
    pub fn at(&self, i: usize) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Series(vs) => vs.get(i).copied().unwrap_or(STALE),
        }
    }

    /// Value at the first grid timestamp, used where a single number is required.
    pub fn first(&self) -> f64 {
        self.at(0)
    }

    /// Whether the value never changes.
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Self::Constant(v) => Some(*v),
            Self::Series(_) => None,
        }
    }
}

/// The result of evaluating a plan node.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    /// A number.
    Scalar(Scalar),
    /// A string.
    Text(String),
    /// An instant vector.
    Vector(PointMatrix),
    /// A range vector.
    Matrix(RangeMatrix),
}

impl RuntimeValue {
    /// The value's kind.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Scalar(_) => ValueKind::Scalar,
            Self::Text(_) => ValueKind::String,
            Self::Vector(_) => ValueKind::Vector,
            Self::Matrix(_) => ValueKind::Matrix,
        }
    }

    fn mismatch(&self, context: &str, expected: ValueKind) -> TypeError {
        TypeError::UnexpectedKind {
            context: context.to_string(),
            expected,
            found: self.kind(),
        }
    }

    /// Unwraps a scalar.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] for any other kind.
    pub fn as_scalar(&self, context: &str) -> Result<&Scalar> {
        match self {
            Self::Scalar(s) => Ok(s),
            _ => Err(self.mismatch(context, ValueKind::Scalar).into()),
        }
    }

    /// Unwraps a string.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] for any other kind.
    pub fn as_text(&self, context: &str) -> Result<&str> {
        match self {
            Self::Text(s) => Ok(s),
            _ => Err(self.mismatch(context, ValueKind::String).into()),
        }
    }

    /// Unwraps an instant vector.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] for any other kind.
    pub fn as_vector(&self, context: &str) -> Result<&PointMatrix> {
        match self {
            Self::Vector(m) => Ok(m),
            _ => Err(self.mismatch(context, ValueKind::Vector).into()),
        }
    }

    /// Takes an instant vector by value.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] for any other kind.
    pub fn into_vector(self, context: &str) -> Result<PointMatrix> {
        match self {
            Self::Vector(m) => Ok(m),
            other => Err(other.mismatch(context, ValueKind::Vector).into()),
        }
    }

    /// Unwraps a range vector.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::UnexpectedKind`] for any other kind.
    pub fn as_matrix(&self, context: &str) -> Result<&RangeMatrix> {
        match self {
            Self::Matrix(m) => Ok(m),
            _ => Err(self.mismatch(context, ValueKind::Matrix).into()),
        }
    }
}
