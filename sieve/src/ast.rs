//! Expression tree consumed by the planner.
//!
//! Text parsing lives outside this crate; callers hand the planner an [`Expr`]
//! built with the constructors below or decoded from JSON. The JSON form is
//! internally tagged by `type`:
//!
//! ```json
//! {"type": "call", "func": "rate", "args": [
//!     {"type": "range", "selector": {"name": "http_requests_total"}, "range_ms": 300000}
//! ]}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matcher::{LabelMatcher, SeriesMatcher};
use crate::metric::FilterMode;

/// Names a set of series: an optional metric name, label matchers, and an offset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Metric name; `None` selects on matchers only.
    #[serde(default)]
    pub name: Option<String>,
    /// Additional label matchers.
    #[serde(default)]
    pub matchers: Vec<LabelMatcher>,
    /// Look this many milliseconds into the past.
    #[serde(default)]
    pub offset_ms: i64,
}

impl Selector {
    /// Selector for a metric name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Adds a label matcher.
    #[must_use]
    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn with_offset(mut self, offset_ms: i64) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    /// The registry query for this selector.
    pub fn series_matcher(&self) -> SeriesMatcher {
        SeriesMatcher::for_selector(self.name.as_deref(), &self.matchers)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if !self.matchers.is_empty() || self.name.is_none() {
            f.write_str("{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{m}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// How rows of two vectors pair up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Each match key appears at most once per side.
    #[default]
    OneToOne,
    /// `group_left`: many left rows per right row.
    ManyToOne,
    /// `group_right`: many right rows per left row.
    OneToMany,
    /// Set operators only.
    ManyToMany,
}

/// Vector matching modifiers of a binary expression.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VectorMatching {
    /// Pairing cardinality.
    #[serde(default)]
    pub card: Cardinality,
    /// Labels named by `on(...)` or `ignoring(...)`.
    #[serde(default)]
    pub labels: Vec<String>,
    /// `true` for `on`, `false` for `ignoring`.
    #[serde(default)]
    pub on: bool,
    /// Extra labels copied from the "one" side by `group_left`/`group_right`.
    #[serde(default)]
    pub include: Vec<String>,
}

impl VectorMatching {
    /// Matching on the listed labels.
    pub fn on<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            on: true,
            labels: labels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Matching on everything except the listed labels.
    pub fn ignoring<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            on: false,
            labels: labels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the cardinality and included labels.
    #[must_use]
    pub fn group<S: Into<String>>(mut self, card: Cardinality, include: impl IntoIterator<Item = S>) -> Self {
        self.card = card;
        self.include = include.into_iter().map(Into::into).collect();
        self
    }

    /// The filter mode implied by `on`.
    pub fn filter_mode(&self) -> FilterMode {
        if self.on { FilterMode::On } else { FilterMode::Without }
    }
}

/// `by (...)` or `without (...)` clause of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    /// Whether the labels are kept (`by`) or dropped (`without`).
    pub mode: FilterMode,
    /// The listed labels.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Grouping {
    /// `by (labels)`.
    pub fn by<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            mode: FilterMode::On,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// `without (labels)`.
    pub fn without<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            mode: FilterMode::Without,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

/// A query expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// Numeric literal.
    Number {
        /// The value.
        value: f64,
    },
    /// String literal.
    String {
        /// The value.
        value: String,
    },
    /// Instant vector selector.
    Selector {
        /// The selector.
        selector: Selector,
    },
    /// Range vector selector.
    Range {
        /// The selector.
        selector: Selector,
        /// Window length in milliseconds.
        range_ms: i64,
    },
    /// Binary operator application.
    Binary {
        /// Operator token, e.g. `+`, `==`, `and`.
        op: String,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
        /// Matching modifiers.
        #[serde(default)]
        matching: VectorMatching,
        /// `bool` modifier on comparisons.
        #[serde(default)]
        return_bool: bool,
    },
    /// Aggregation.
    Aggregate {
        /// Aggregator name, e.g. `sum`, `topk`.
        op: String,
        /// Parameter of variadic aggregators (`k`, `q`, label name).
        #[serde(default)]
        param: Option<Box<Expr>>,
        /// Aggregated vector.
        expr: Box<Expr>,
        /// `by`/`without` clause.
        #[serde(default)]
        grouping: Option<Grouping>,
    },
    /// Function call.
    Call {
        /// Function name.
        func: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Converts values to 1 (non-zero, finite) or 0.
    Bool {
        /// Converted expression.
        expr: Box<Expr>,
    },
}

impl Expr {
    /// Numeric literal.
    pub fn number(value: f64) -> Self {
        Self::Number { value }
    }

    /// String literal.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            value: value.into(),
        }
    }

    /// Instant selector.
    pub fn selector(selector: Selector) -> Self {
        Self::Selector { selector }
    }

    /// Instant selector for a metric name.
    pub fn metric(name: impl Into<String>) -> Self {
        Self::selector(Selector::named(name))
    }

    /// Range selector.
    pub fn range(selector: Selector, range_ms: i64) -> Self {
        Self::Range { selector, range_ms }
    }

    /// Binary expression with default matching.
    pub fn binary(op: impl Into<String>, lhs: Self, rhs: Self) -> Self {
        Self::binary_with(op, lhs, rhs, VectorMatching::default(), false)
    }

    /// Binary expression with explicit modifiers.
    pub fn binary_with(
        op: impl Into<String>,
        lhs: Self,
        rhs: Self,
        matching: VectorMatching,
        return_bool: bool,
    ) -> Self {
        Self::Binary {
            op: op.into(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            matching,
            return_bool,
        }
    }

    /// Aggregation.
    pub fn aggregate(op: impl Into<String>, param: Option<Self>, expr: Self, grouping: Option<Grouping>) -> Self {
        Self::Aggregate {
            op: op.into(),
            param: param.map(Box::new),
            expr: Box::new(expr),
            grouping,
        }
    }

    /// Function call.
    pub fn call(func: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Call {
            func: func.into(),
            args,
        }
    }

    /// Bool conversion.
    pub fn bool(expr: Self) -> Self {
        Self::Bool {
            expr: Box::new(expr),
        }
    }
}

fn fmt_duration(ms: i64) -> String {
    const UNITS: [(i64, &str); 6] = [
        (7 * 24 * 3_600_000, "w"),
        (24 * 3_600_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1000, "s"),
        (1, "ms"),
    ];
    UNITS
        .iter()
        .find(|(unit, _)| ms != 0 && ms % unit == 0)
        .map_or_else(|| format!("{ms}ms"), |(unit, suffix)| format!("{}{suffix}", ms / unit))
}

fn fmt_offset(f: &mut fmt::Formatter<'_>, offset_ms: i64) -> fmt::Result {
    if offset_ms != 0 {
        write!(f, " offset {}", fmt_duration(offset_ms))?;
    }
    Ok(())
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = match self.mode {
            FilterMode::On => "by",
            FilterMode::Without => "without",
        };
        write!(f, "{kw} ({})", self.labels.join(","))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { value } => write!(f, "{value}"),
            Self::String { value } => write!(f, "{value:?}"),
            Self::Selector { selector } => {
                write!(f, "{selector}")?;
                fmt_offset(f, selector.offset_ms)
            }
            Self::Range { selector, range_ms } => {
                write!(f, "{selector}[{}]", fmt_duration(*range_ms))?;
                fmt_offset(f, selector.offset_ms)
            }
            Self::Binary {
                op,
                lhs,
                rhs,
                matching,
                return_bool,
            } => {
                write!(f, "{lhs} {op}")?;
                if *return_bool {
                    f.write_str(" bool")?;
                }
                if matching.on || !matching.labels.is_empty() {
                    let kw = if matching.on { "on" } else { "ignoring" };
                    write!(f, " {kw}({})", matching.labels.join(","))?;
                }
                match matching.card {
                    Cardinality::ManyToOne => write!(f, " group_left({})", matching.include.join(","))?,
                    Cardinality::OneToMany => write!(f, " group_right({})", matching.include.join(","))?,
                    Cardinality::OneToOne | Cardinality::ManyToMany => {}
                }
                write!(f, " {rhs}")
            }
            Self::Aggregate {
                op,
                param,
                expr,
                grouping,
            } => {
                f.write_str(op)?;
                if let Some(g) = grouping {
                    write!(f, " {g} ")?;
                }
                match param {
                    Some(p) => write!(f, "({p}, {expr})"),
                    None => write!(f, "({expr})"),
                }
            }
            Self::Call { func, args } => {
                write!(f, "{func}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Self::Bool { expr } => write!(f, "bool({expr})"),
        }
    }
}
