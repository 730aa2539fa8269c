//! Prometheus HTTP API response rendering.
//!
//! Values are rendered the way the Prometheus query API returns them:
//! timestamps as float seconds, sample values as strings. Stale points are
//! omitted and a row whose points are all stale is dropped.

use serde::Serialize;

use crate::metric::Metric;
use crate::value::{Frames, PointMatrix, Points, RangeMatrix, RuntimeValue, Scalar, format_value, is_stale};

/// One rendered sample: `[seconds, "value"]`.
pub type Sample = (f64, String);

/// A rendered row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    /// Row labels.
    pub metric: Metric,
    /// Samples for range results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Sample>>,
    /// The sample for instant results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Sample>,
}

/// The `result` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultData {
    /// `matrix` and `vector` results.
    Series(Vec<Series>),
    /// `scalar` and `string` results.
    Sample(Sample),
}

/// The `data` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseData {
    /// `matrix`, `vector`, `scalar` or `string`.
    #[serde(rename = "resultType")]
    pub result_type: &'static str,
    /// The rendered value.
    pub result: ResultData,
}

/// A successful query response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    /// Always `success`.
    pub status: &'static str,
    /// The result.
    pub data: ResponseData,
}

impl QueryResponse {
    /// Renders `value` evaluated on `frames`.
    pub fn new(value: &RuntimeValue, frames: &Frames) -> Self {
        let data = match value {
            RuntimeValue::Vector(m) if frames.is_instant() => ResponseData {
                result_type: "vector",
                result: ResultData::Series(instant_rows(m)),
            },
            RuntimeValue::Vector(m) => ResponseData {
                result_type: "matrix",
                result: ResultData::Series(range_rows(m)),
            },
            RuntimeValue::Scalar(s) if frames.is_instant() => ResponseData {
                result_type: "scalar",
                result: ResultData::Sample(sample(frames.start(), s.first())),
            },
            RuntimeValue::Scalar(s) => ResponseData {
                result_type: "matrix",
                result: ResultData::Series(scalar_rows(s, frames)),
            },
            RuntimeValue::Text(t) => ResponseData {
                result_type: "string",
                result: ResultData::Sample((seconds(frames.end()), t.clone())),
            },
            RuntimeValue::Matrix(m) => ResponseData {
                result_type: "matrix",
                result: ResultData::Series(window_rows(m)),
            },
        };
        Self {
            status: "success",
            data,
        }
    }

    /// Renders as JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which only happens for non-string map keys.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds(ts: i64) -> f64 {
    ts as f64 / 1000.0
}

fn sample(ts: i64, v: f64) -> Sample {
    (seconds(ts), format_value(v))
}

fn samples(points: &Points) -> Vec<Sample> {
    points
        .iter()
        .filter(|&(_, v)| !is_stale(v))
        .map(|(ts, v)| sample(ts, v))
        .collect()
}

fn range_rows(m: &PointMatrix) -> Vec<Series> {
    m.iter()
        .filter(|(_, row)| !row.is_all_stale())
        .map(|(metric, row)| Series {
            metric: metric.clone(),
            values: Some(samples(row)),
            value: None,
        })
        .collect()
}

fn instant_rows(m: &PointMatrix) -> Vec<Series> {
    m.iter()
        .filter_map(|(metric, row)| {
            let (ts, v) = row.iter().next()?;
            (!is_stale(v)).then(|| Series {
                metric: metric.clone(),
                values: None,
                value: Some(sample(ts, v)),
            })
        })
        .collect()
}

fn scalar_rows(s: &Scalar, frames: &Frames) -> Vec<Series> {
    let values: Vec<Sample> = frames
        .iter()
        .enumerate()
        .map(|(i, ts)| (ts, s.at(i)))
        .filter(|&(_, v)| !is_stale(v))
        .map(|(ts, v)| sample(ts, v))
        .collect();
    if values.is_empty() {
        return Vec::new();
    }
    vec![Series {
        metric: Metric::empty(),
        values: Some(values),
        value: None,
    }]
}

fn window_rows(m: &RangeMatrix) -> Vec<Series> {
    m.metrics()
        .iter()
        .zip(m.windows())
        .filter_map(|(metric, windows)| {
            let values = samples(windows.last()?);
            (!values.is_empty()).then(|| Series {
                metric: metric.clone(),
                values: Some(values),
                value: None,
            })
        })
        .collect()
}
