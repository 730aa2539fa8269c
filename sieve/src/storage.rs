//! Storage contracts consumed by the engine, plus an in-memory implementation.
//!
//! The engine needs two things from storage:
//!
//! - [`MetricRegistry`] resolves a selector to the metrics it names. The
//!   planner calls it once per selector; re-evaluating a plan never does.
//! - [`SampleFetcher`] returns samples for already-resolved metrics on an
//!   evaluation grid, either one value per timestamp or a window per timestamp.
//!
//! [`MemoryStorage`] implements both over sorted in-memory sample arrays and
//! can be loaded from JSON:
//!
//! ```json
//! [{"labels": {"__name__": "up", "job": "api"}, "samples": [[0, 1], [15000, "NaN"]]}]
//! ```
//!
//! Sample values may be numbers or the strings `NaN`, `+Inf`, `-Inf` and `stale`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, StorageError};
use crate::matcher::SeriesMatcher;
use crate::metric::{Fingerprint, Metric};
use crate::value::{Frames, PointMatrix, Points, RangeMatrix, STALE};

/// Default staleness lookback for instant fetches, in milliseconds.
pub const DEFAULT_LOOKBACK_MS: i64 = 5 * 60 * 1000;

/// Resolves selectors to metrics.
pub trait MetricRegistry {
    /// Returns every stored metric `matcher` accepts, sorted by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the registry cannot be read.
    fn lookup_metrics(&self, matcher: &SeriesMatcher) -> Result<Vec<Metric>>;
}

/// Fetches samples for resolved metrics.
pub trait SampleFetcher {
    /// One value per grid timestamp and metric, looking `offset` ms into the past.
    ///
    /// The returned rows are parallel to `metrics` and timestamped with the grid.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if samples cannot be read.
    fn fetch_instant(&self, metrics: &[Metric], frames: &Frames, offset: i64) -> Result<PointMatrix>;

    /// A window of raw samples per grid timestamp `t` and metric, covering
    /// `[t - range - offset, t - offset]`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if samples cannot be read.
    fn fetch_range(&self, metrics: &[Metric], frames: &Frames, range: i64, offset: i64) -> Result<RangeMatrix>;
}

#[derive(Debug, Clone)]
struct StoredSeries {
    metric: Metric,
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl StoredSeries {
    fn insert(&mut self, ts: i64, value: f64) {
        match self.timestamps.binary_search(&ts) {
            Ok(i) => self.values[i] = value,
            Err(i) => {
                self.timestamps.insert(i, ts);
                self.values.insert(i, value);
            }
        }
    }

    /// Index range of samples with `lo <= ts <= hi`.
    fn span(&self, lo: i64, hi: i64) -> std::ops::Range<usize> {
        let start = self.timestamps.partition_point(|&t| t < lo);
        let end = self.timestamps.partition_point(|&t| t <= hi);
        start..end.max(start)
    }
}

/// In-memory series store implementing both storage contracts.
///
/// # Example
///
/// ```rust
/// use sieve::metric::Metric;
/// use sieve::storage::MemoryStorage;
///
/// let mut storage = MemoryStorage::default();
/// let up = Metric::new([("__name__", "up"), ("job", "api")]);
/// storage.insert(&up, 0, 1.0);
/// storage.insert(&up, 15_000, 1.0);
/// assert_eq!(storage.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    series: BTreeMap<Fingerprint, StoredSeries>,
    lookback_ms: i64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_MS)
    }
}

#[derive(Deserialize)]
struct SeriesRecord {
    labels: BTreeMap<String, String>,
    #[serde(default)]
    samples: Vec<(i64, SampleValue)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SampleValue {
    Number(f64),
    Text(String),
}

impl SampleValue {
    fn resolve(self) -> Result<f64> {
        match self {
            Self::Number(v) => Ok(v),
            Self::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "+Inf" | "Inf" => Ok(f64::INFINITY),
                "-Inf" => Ok(f64::NEG_INFINITY),
                "stale" => Ok(STALE),
                other => other.parse().map_err(|_| {
                    StorageError::InvalidData {
                        reason: format!("'{other}' is not a sample value"),
                    }
                    .into()
                }),
            },
        }
    }
}

impl MemoryStorage {
    /// Creates an empty store with the given instant-fetch lookback.
    pub fn new(lookback_ms: i64) -> Self {
        Self {
            series: BTreeMap::new(),
            lookback_ms,
        }
    }

    /// Staleness lookback in milliseconds.
    pub fn lookback_ms(&self) -> i64 {
        self.lookback_ms
    }

    /// Number of stored series.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether no series are stored.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Stores one sample, replacing any sample at the same timestamp.
    pub fn insert(&mut self, metric: &Metric, ts: i64, value: f64) {
        self.series
            .entry(metric.fingerprint())
            .or_insert_with(|| StoredSeries {
                metric: metric.clone(),
                timestamps: Vec::new(),
                values: Vec::new(),
            })
            .insert(ts, value);
    }

    /// Stores a batch of `(timestamp, value)` samples for one metric.
    pub fn insert_series(&mut self, metric: &Metric, samples: impl IntoIterator<Item = (i64, f64)>) {
        for (ts, v) in samples {
            self.insert(metric, ts, v);
        }
    }

    /// Parses series from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Decode`] for malformed JSON and
    /// [`StorageError::InvalidData`] for unparseable sample values.
    pub fn from_json(json: &str, lookback_ms: i64) -> Result<Self> {
        let records: Vec<SeriesRecord> = serde_json::from_str(json).map_err(StorageError::from)?;
        let mut storage = Self::new(lookback_ms);
        for record in records {
            let metric = Metric::new(record.labels);
            for (ts, v) in record.samples {
                storage.insert(&metric, ts, v.resolve()?);
            }
        }
        tracing::debug!("loaded {} series", storage.len());
        Ok(storage)
    }

    /// Reads series from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the file cannot be read, otherwise
    /// the errors of [`MemoryStorage::from_json`].
    pub fn load(path: impl AsRef<Path>, lookback_ms: i64) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data, lookback_ms)
    }
}

impl MetricRegistry for MemoryStorage {
    fn lookup_metrics(&self, matcher: &SeriesMatcher) -> Result<Vec<Metric>> {
        let metrics: Vec<Metric> = self
            .series
            .values()
            .filter(|s| matcher.matches(&s.metric))
            .map(|s| s.metric.clone())
            .collect();
        tracing::debug!("{matcher} resolved to {} series", metrics.len());
        Ok(metrics)
    }
}

impl SampleFetcher for MemoryStorage {
    fn fetch_instant(&self, metrics: &[Metric], frames: &Frames, offset: i64) -> Result<PointMatrix> {
        let rows = metrics
            .iter()
            .map(|m| match self.series.get(&m.fingerprint()) {
                None => Points::stale(frames),
                Some(s) => Points::from_frames(frames, |_, ts| {
                    let target = ts - offset;
                    let idx = s.timestamps.partition_point(|&t| t <= target);
                    match idx.checked_sub(1) {
                        Some(i) if target - s.timestamps[i] <= self.lookback_ms => s.values[i],
                        _ => STALE,
                    }
                }),
            })
            .collect();
        PointMatrix::new(metrics.to_vec(), rows, *frames)
    }

    fn fetch_range(&self, metrics: &[Metric], frames: &Frames, range: i64, offset: i64) -> Result<RangeMatrix> {
        let windows = metrics
            .iter()
            .map(|m| match self.series.get(&m.fingerprint()) {
                None => Ok(frames.iter().map(|_| Points::default()).collect()),
                Some(s) => frames
                    .iter()
                    .map(|ts| {
                        let span = s.span(ts - range - offset, ts - offset);
                        Points::new(s.timestamps[span.clone()].to_vec(), s.values[span].to_vec())
                    })
                    .collect::<Result<Vec<_>>>(),
            })
            .collect::<Result<Vec<Vec<Points>>>>()?;
        RangeMatrix::new(metrics.to_vec(), windows, *frames, range, offset)
    }
}
