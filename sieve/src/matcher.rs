//! Label matchers used by selectors to pick series from the registry.
//!
//! A [`SeriesMatcher`] is a conjunction of [`LabelMatcher`]s. A label that a
//! metric does not carry is matched as the empty string, so `{env=""}` selects
//! series without an `env` label and `{env!="prod"}` selects series without
//! one as well. Regular expressions are fully anchored.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ParameterError, Result};
use crate::metric::{Metric, NAME_LABEL};

/// Comparison performed by a [`LabelMatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// `=`
    #[serde(rename = "=")]
    Equal,
    /// `!=`
    #[serde(rename = "!=")]
    NotEqual,
    /// `=~`
    #[serde(rename = "=~")]
    Regex,
    /// `!~`
    #[serde(rename = "!~")]
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        })
    }
}

/// Matches the value of one label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawLabelMatcher", into = "RawLabelMatcher")]
pub struct LabelMatcher {
    name: String,
    op: MatchOp,
    value: String,
    regex: Option<Regex>,
}

#[derive(Serialize, Deserialize)]
struct RawLabelMatcher {
    name: String,
    op: MatchOp,
    value: String,
}

impl TryFrom<RawLabelMatcher> for LabelMatcher {
    type Error = crate::SieveError;

    fn try_from(raw: RawLabelMatcher) -> Result<Self> {
        Self::new(raw.name, raw.op, raw.value)
    }
}

impl From<LabelMatcher> for RawLabelMatcher {
    fn from(m: LabelMatcher) -> Self {
        Self {
            name: m.name,
            op: m.op,
            value: m.value,
        }
    }
}

impl LabelMatcher {
    /// Creates a matcher, compiling the pattern for regex operators.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::InvalidRegex`] if `op` is a regex operator
    /// and `value` does not compile.
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(anchored(&value)?),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self {
            name: name.into(),
            op,
            value,
            regex,
        })
    }

    /// Shorthand for an `=` matcher, which cannot fail.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    /// The label name this matcher tests.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The comparison operator.
    pub fn op(&self) -> MatchOp {
        self.op
    }

    /// The literal value or pattern.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests a label value; `None` means the label is absent.
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        let v = value.unwrap_or("");
        match (self.op, &self.regex) {
            (MatchOp::Equal, _) => v == self.value,
            (MatchOp::NotEqual, _) => v != self.value,
            (MatchOp::Regex, Some(re)) => re.is_match(v),
            (MatchOp::NotRegex, Some(re)) => !re.is_match(v),
            (MatchOp::Regex | MatchOp::NotRegex, None) => false,
        }
    }

    /// Tests a metric.
    pub fn matches(&self, metric: &Metric) -> bool {
        self.matches_value(metric.get(&self.name))
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Compiles `pattern` so that it must match the whole input.
///
/// # Errors
///
/// Returns [`ParameterError::InvalidRegex`] if the pattern does not compile.
pub fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
        ParameterError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        }
        .into()
    })
}

/// A conjunction of label matchers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesMatcher {
    matchers: Vec<LabelMatcher>,
}

impl SeriesMatcher {
    /// Creates a matcher from its parts.
    pub fn new(matchers: Vec<LabelMatcher>) -> Self {
        Self { matchers }
    }

    /// Creates the matcher for a selector: an optional metric name plus label matchers.
    pub fn for_selector(name: Option<&str>, matchers: &[LabelMatcher]) -> Self {
        let mut all = Vec::with_capacity(matchers.len() + 1);
        if let Some(name) = name
            && !name.is_empty()
        {
            all.push(LabelMatcher::equal(NAME_LABEL, name));
        }
        all.extend(matchers.iter().cloned());
        Self { matchers: all }
    }

    /// The individual matchers.
    pub fn matchers(&self) -> &[LabelMatcher] {
        &self.matchers
    }

    /// Whether every matcher accepts `metric`.
    pub fn matches(&self, metric: &Metric) -> bool {
        self.matchers.iter().all(|m| m.matches(metric))
    }

    /// Labels pinned by `=` matchers, excluding the name.
    ///
    /// `absent()` uses these to label its output.
    pub fn equality_labels(&self) -> Metric {
        Metric::new(
            self.matchers
                .iter()
                .filter(|m| m.op == MatchOp::Equal && m.name != NAME_LABEL)
                .map(|m| (m.name.clone(), m.value.clone())),
        )
    }
}

impl fmt::Display for SeriesMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{m}")?;
        }
        f.write_str("}")
    }
}
