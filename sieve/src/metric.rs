//! Metric identities and their fingerprints.
//!
//! A [`Metric`] is an immutable, key-sorted set of label pairs. One reserved
//! label, [`NAME_LABEL`], carries the metric name. Every metric carries a
//! precomputed 64-bit [`Fingerprint`] that serves as its identity: two metrics
//! are equal exactly when their fingerprints are equal.
//!
//! # Fingerprints
//!
//! Each label pair is hashed on its own with FNV-1a over
//! `key, 0xff, value, 0xff`, and the per-label hashes are XOR-ed onto the FNV
//! offset basis. XOR makes the result independent of label order while any
//! change to a key or value changes the hash.
//!
//! A *filtered* fingerprint hashes only a subset of the labels, selected by
//! [`FilterMode::On`] (keep listed labels) or [`FilterMode::Without`] (drop
//! listed labels), optionally also dropping the name. Vector matching and
//! grouping key rows by filtered fingerprints.
//!
//! # Example
//!
//! ```rust
//! use sieve::metric::{FilterMode, Metric};
//!
//! let a = Metric::new([("__name__", "http_requests"), ("job", "api"), ("code", "200")]);
//! let b = Metric::new([("__name__", "http_errors"), ("job", "api"), ("code", "500")]);
//!
//! assert_ne!(a.fingerprint(), b.fingerprint());
//! assert_eq!(
//!     a.filtered_fingerprint(FilterMode::On, &["job"], true),
//!     b.filtered_fingerprint(FilterMode::On, &["job"], true),
//! );
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Reserved label holding the metric name.
pub const NAME_LABEL: &str = "__name__";

/// Label holding a histogram bucket's upper bound.
pub const BUCKET_LABEL: &str = "le";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEPARATOR: u8 = 0xff;

/// 64-bit content hash identifying a [`Metric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn fnv_update(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn label_hash(key: &str, value: &str) -> u64 {
    let mut h = fnv_update(FNV_OFFSET, key.as_bytes());
    h = fnv_update(h, &[SEPARATOR]);
    h = fnv_update(h, value.as_bytes());
    fnv_update(h, &[SEPARATOR])
}

fn fingerprint_of<'a>(labels: impl Iterator<Item = &'a (String, String)>) -> Fingerprint {
    Fingerprint(labels.fold(FNV_OFFSET, |acc, (k, v)| acc ^ label_hash(k, v)))
}

/// Whether `name` is a valid label name: `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Selects which labels a filter keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Keep only the listed labels.
    #[serde(alias = "by")]
    On,
    /// Keep everything except the listed labels.
    Without,
}

impl FilterMode {
    fn keeps(self, listed: bool) -> bool {
        match self {
            Self::On => listed,
            Self::Without => !listed,
        }
    }
}

/// An immutable, key-sorted label set with a precomputed fingerprint.
///
/// Cloning is cheap: the label storage is shared.
#[derive(Clone)]
pub struct Metric {
    labels: Arc<[(String, String)]>,
    fingerprint: Fingerprint,
}

impl Metric {
    /// Builds a metric from label pairs.
    ///
    /// Pairs are sorted by key. When a key repeats, the last value wins.
    /// Labels with an empty value are dropped, matching the convention that
    /// an empty label is the same as an absent one.
    pub fn new<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut builder = MetricBuilder::default();
        for (k, v) in labels {
            builder.put(k, v);
        }
        builder.build()
    }

    /// The metric without any labels.
    pub fn empty() -> Self {
        Self::from_sorted(Vec::new())
    }

    fn from_sorted(labels: Vec<(String, String)>) -> Self {
        let fingerprint = fingerprint_of(labels.iter());
        Self {
            labels: labels.into(),
            fingerprint,
        }
    }

    /// Returns the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.labels[i].1.as_str())
    }

    /// Returns the metric name, if present.
    pub fn name(&self) -> Option<&str> {
        self.get(NAME_LABEL)
    }

    /// Returns the label pairs in key order.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the metric has no labels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the precomputed fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Returns a builder seeded with this metric's labels.
    pub fn to_builder(&self) -> MetricBuilder {
        MetricBuilder {
            labels: self.labels.to_vec(),
        }
    }

    fn selected<'a, S: AsRef<str>>(
        &'a self,
        mode: FilterMode,
        labels: &'a [S],
        drop_name: bool,
    ) -> impl Iterator<Item = &'a (String, String)> + 'a {
        self.labels.iter().filter(move |(k, _)| {
            if drop_name && k == NAME_LABEL {
                return false;
            }
            mode.keeps(labels.iter().any(|l| l.as_ref() == k))
        })
    }

    /// Returns the metric reduced to the labels `mode` selects.
    ///
    /// # Arguments
    ///
    /// * `mode` - [`FilterMode::On`] keeps `labels`; [`FilterMode::Without`] drops them
    /// * `labels` - The label names the mode applies to
    /// * `drop_name` - Also drop [`NAME_LABEL`] regardless of `mode`
    pub fn filter<S: AsRef<str>>(&self, mode: FilterMode, labels: &[S], drop_name: bool) -> Self {
        Self::from_sorted(self.selected(mode, labels, drop_name).cloned().collect())
    }

    /// Returns the metric without its name label.
    pub fn without_name(&self) -> Self {
        if self.name().is_none() {
            return self.clone();
        }
        self.filter::<&str>(FilterMode::Without, &[], true)
    }

    /// Fingerprint over the labels `mode` selects.
    ///
    /// Equal to `self.filter(mode, labels, drop_name).fingerprint()` without
    /// allocating the filtered metric.
    pub fn filtered_fingerprint<S: AsRef<str>>(
        &self,
        mode: FilterMode,
        labels: &[S],
        drop_name: bool,
    ) -> Fingerprint {
        fingerprint_of(self.selected(mode, labels, drop_name))
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Metric {}

impl Hash for Metric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl PartialOrd for Metric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Metric {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fingerprint.cmp(&other.fingerprint)
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            f.write_str(name)?;
        }
        f.write_str("{")?;
        let mut first = true;
        for (k, v) in self.labels.iter().filter(|(k, _)| k != NAME_LABEL) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v:?}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for Metric {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.labels.len()))?;
        for (k, v) in self.labels.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = std::collections::BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(Self::new(map))
    }
}

/// Incremental builder for a [`Metric`].
///
/// Labels may be put and removed in any order; [`MetricBuilder::build`] sorts
/// them before computing the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct MetricBuilder {
    labels: Vec<(String, String)>,
}

impl MetricBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.labels.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.labels.push((key, value)),
        }
        self
    }

    /// Removes `key` if present.
    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.labels.retain(|(k, _)| k != key);
        self
    }

    /// Sets `key` to `value`, or removes it when `value` is `None` or empty.
    pub fn put_or_remove(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) if !v.is_empty() => self.put(key, v),
            _ => self.remove(key),
        }
    }

    /// Keeps only the labels for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> &mut Self {
        self.labels.retain(|(k, _)| keep(k));
        self
    }

    /// Sorts the labels and produces the metric.
    pub fn build(&self) -> Metric {
        let mut labels: Vec<(String, String)> = self
            .labels
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .cloned()
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Metric::from_sorted(labels)
    }
}
