//! Executable query plans.
//!
//! # Overview
//!
//! A [`Plan`] is a tree of [`PlanNode`]s produced by [`crate::planner`]. Each
//! node carries only what its evaluation needs: selectors hold their resolved
//! series, vector/vector operators over fixed operands hold a precomputed
//! [`Pairing`], and mapping aggregators over a fixed operand hold their
//! [`Groups`]. Anything that depends on evaluated data is computed by
//! [`crate::exec`] instead.
//!
//! [`MetricPlan`] says whether a node's output metrics are known before
//! evaluation; [`Affinity`] classifies nodes for a distributed executor and
//! has no effect on results.

use std::fmt::{self, Write};

use crate::aggregate::{Aggregator, Groups, MappingOp};
use crate::ast::{Grouping, VectorMatching};
use crate::matcher::SeriesMatcher;
use crate::matching::Pairing;
use crate::metric::{Fingerprint, Metric};
use crate::ops::{BinaryOp, SetOp};
use crate::value::ValueKind;

/// Whether a node's output metrics are known at plan time.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPlan {
    /// Output rows have exactly these metrics, in this order.
    Fixed(Vec<Metric>),
    /// Output rows are only known after evaluation.
    Variable,
}

impl MetricPlan {
    /// The fixed metrics, if known.
    pub fn metrics(&self) -> Option<&[Metric]> {
        match self {
            Self::Fixed(m) => Some(m),
            Self::Variable => None,
        }
    }
}

/// Placement hint for a distributed executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// No data dependency (literals and their combinations).
    Any,
    /// Reads exactly one series.
    Single(Fingerprint),
    /// Reads several series and could be split across workers.
    Splittable,
}

impl Affinity {
    fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Any, x) | (x, Self::Any) => x,
            (Self::Single(a), Self::Single(b)) if a == b => Self::Single(a),
            _ => Self::Splittable,
        }
    }
}

/// A plan node.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Numeric literal, possibly folded.
    ScalarLiteral(f64),
    /// String literal.
    TextLiteral(String),
    /// Instant selector with its series resolved.
    InstantSelector {
        /// Resolved series, sorted by fingerprint.
        metrics: Vec<Metric>,
        /// Offset in milliseconds.
        offset: i64,
        /// The registry query that resolved `metrics`.
        matcher: SeriesMatcher,
    },
    /// Range selector with its series resolved.
    RangeSelector {
        /// Resolved series, sorted by fingerprint.
        metrics: Vec<Metric>,
        /// Window length in milliseconds.
        range: i64,
        /// Offset in milliseconds.
        offset: i64,
        /// The registry query that resolved `metrics`.
        matcher: SeriesMatcher,
    },
    /// `bool` conversion of a scalar or vector.
    BoolConvert {
        /// Converted operand.
        expr: Box<PlanNode>,
        /// Output metrics, those of the operand.
        metrics: MetricPlan,
    },
    /// Operator between two scalars, at least one of them not a literal.
    ScalarScalar {
        /// The operator.
        op: BinaryOp,
        /// `bool` modifier.
        return_bool: bool,
        /// Left operand.
        lhs: Box<PlanNode>,
        /// Right operand.
        rhs: Box<PlanNode>,
    },
    /// Operator between a scalar and every row of a vector.
    Broadcast {
        /// The operator.
        op: BinaryOp,
        /// `bool` modifier.
        return_bool: bool,
        /// Whether the scalar is the left operand.
        scalar_lhs: bool,
        /// The scalar operand.
        scalar: Box<PlanNode>,
        /// The vector operand.
        vector: Box<PlanNode>,
        /// Output metrics.
        metrics: MetricPlan,
    },
    /// Vector/vector operator with a pairing computed at plan time.
    BinaryFixed {
        /// The operator.
        op: BinaryOp,
        /// `bool` modifier.
        return_bool: bool,
        /// Left operand.
        lhs: Box<PlanNode>,
        /// Right operand.
        rhs: Box<PlanNode>,
        /// Row pairing and result metrics.
        pairing: Pairing,
    },
    /// Vector/vector operator paired at evaluation time.
    BinaryDynamic {
        /// The operator.
        op: BinaryOp,
        /// `bool` modifier.
        return_bool: bool,
        /// Left operand.
        lhs: Box<PlanNode>,
        /// Right operand.
        rhs: Box<PlanNode>,
        /// Matching modifiers.
        matching: VectorMatching,
    },
    /// `and`, `or`, `unless`.
    SetOperation {
        /// The set operator.
        op: SetOp,
        /// Left operand.
        lhs: Box<PlanNode>,
        /// Right operand.
        rhs: Box<PlanNode>,
        /// Matching modifiers, always many-to-many.
        matching: VectorMatching,
    },
    /// Mapping aggregator with groups computed at plan time.
    AggregateFixed {
        /// The aggregator.
        op: MappingOp,
        /// Aggregated operand.
        expr: Box<PlanNode>,
        /// Row buckets of the operand.
        groups: Groups,
        /// Original grouping clause, for display.
        grouping: Option<Grouping>,
    },
    /// Mapping aggregator grouped at evaluation time.
    AggregateDynamic {
        /// The aggregator.
        op: MappingOp,
        /// Aggregated operand.
        expr: Box<PlanNode>,
        /// Grouping clause.
        grouping: Option<Grouping>,
    },
    /// `topk`, `bottomk`, `quantile`, `count_values`.
    AggregateVariadic {
        /// The aggregator.
        op: Aggregator,
        /// Its parameter.
        param: Box<PlanNode>,
        /// Aggregated operand.
        expr: Box<PlanNode>,
        /// Grouping clause.
        grouping: Option<Grouping>,
    },
    /// Function call, resolved against the function registry at evaluation.
    Function {
        /// Function name.
        name: String,
        /// Arguments.
        args: Vec<PlanNode>,
        /// Kind of the returned value.
        returns: ValueKind,
        /// Whether the function orders its own output.
        ordered: bool,
        /// Matcher of the first argument when it is an instant selector.
        hint: Option<SeriesMatcher>,
        /// Output metrics.
        metrics: MetricPlan,
    },
}

impl PlanNode {
    /// Kind of the value this node evaluates to.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::ScalarLiteral(_) | Self::ScalarScalar { .. } => ValueKind::Scalar,
            Self::TextLiteral(_) => ValueKind::String,
            Self::RangeSelector { .. } => ValueKind::Matrix,
            Self::BoolConvert { expr, .. } => expr.kind(),
            Self::Function { returns, .. } => *returns,
            Self::InstantSelector { .. }
            | Self::Broadcast { .. }
            | Self::BinaryFixed { .. }
            | Self::BinaryDynamic { .. }
            | Self::SetOperation { .. }
            | Self::AggregateFixed { .. }
            | Self::AggregateDynamic { .. }
            | Self::AggregateVariadic { .. } => ValueKind::Vector,
        }
    }

    /// Output metrics when known at plan time.
    pub fn fixed_metrics(&self) -> Option<&[Metric]> {
        match self {
            Self::InstantSelector { metrics, .. } | Self::RangeSelector { metrics, .. } => Some(metrics),
            Self::BoolConvert { metrics, .. } | Self::Broadcast { metrics, .. } | Self::Function { metrics, .. } => {
                metrics.metrics()
            }
            Self::BinaryFixed { pairing, .. } => Some(&pairing.metrics),
            Self::AggregateFixed { groups, .. } => Some(&groups.metrics),
            _ => None,
        }
    }

    /// The node's metric plan.
    pub fn metric_plan(&self) -> MetricPlan {
        self.fixed_metrics()
            .map_or(MetricPlan::Variable, |m| MetricPlan::Fixed(m.to_vec()))
    }

    /// Whether evaluation decides the row order of the result.
    pub fn preserves_order(&self) -> bool {
        match self {
            Self::AggregateVariadic { op, .. } => matches!(op, Aggregator::TopK | Aggregator::BottomK),
            Self::Function { ordered, .. } => *ordered,
            _ => false,
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            Self::ScalarLiteral(_) | Self::TextLiteral(_) | Self::InstantSelector { .. } | Self::RangeSelector { .. } => {
                Vec::new()
            }
            Self::BoolConvert { expr, .. }
            | Self::AggregateFixed { expr, .. }
            | Self::AggregateDynamic { expr, .. } => vec![expr.as_ref()],
            Self::ScalarScalar { lhs, rhs, .. }
            | Self::BinaryFixed { lhs, rhs, .. }
            | Self::BinaryDynamic { lhs, rhs, .. }
            | Self::SetOperation { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            Self::Broadcast { scalar, vector, scalar_lhs, .. } => {
                if *scalar_lhs {
                    vec![scalar.as_ref(), vector.as_ref()]
                } else {
                    vec![vector.as_ref(), scalar.as_ref()]
                }
            }
            Self::AggregateVariadic { param, expr, .. } => vec![param.as_ref(), expr.as_ref()],
            Self::Function { args, .. } => args.iter().collect(),
        }
    }

    /// Placement hint for this subtree.
    pub fn affinity(&self) -> Affinity {
        match self {
            Self::ScalarLiteral(_) | Self::TextLiteral(_) => Affinity::Any,
            Self::InstantSelector { metrics, .. } | Self::RangeSelector { metrics, .. } => match metrics.as_slice() {
                [] => Affinity::Any,
                [single] => Affinity::Single(single.fingerprint()),
                _ => Affinity::Splittable,
            },
            Self::AggregateFixed { .. } | Self::AggregateDynamic { .. } | Self::AggregateVariadic { .. } => {
                Affinity::Splittable
            }
            _ => self
                .children()
                .into_iter()
                .fold(Affinity::Any, |acc, c| acc.combine(c.affinity())),
        }
    }

    /// One-line description used by tracers and [`Plan::explain`].
    pub fn label(&self) -> String {
        match self {
            Self::ScalarLiteral(v) => format!("scalar {v}"),
            Self::TextLiteral(s) => format!("string {s:?}"),
            Self::InstantSelector { matcher, offset, .. } => format!("instant {matcher}{}", fmt_offset(*offset)),
            Self::RangeSelector {
                matcher, range, offset, ..
            } => format!("range {matcher}[{range}ms]{}", fmt_offset(*offset)),
            Self::BoolConvert { .. } => "bool".to_string(),
            Self::ScalarScalar { op, .. } => format!("scalar {op}"),
            Self::Broadcast { op, .. } => format!("broadcast {op}"),
            Self::BinaryFixed { op, .. } => format!("binary {op} (fixed)"),
            Self::BinaryDynamic { op, .. } => format!("binary {op}"),
            Self::SetOperation { op, .. } => format!("set {}", BinaryOp::Set(*op)),
            Self::AggregateFixed { op, grouping, .. } => {
                format!("aggregate {} (fixed){}", op.name(), fmt_grouping(grouping.as_ref()))
            }
            Self::AggregateDynamic { op, grouping, .. } => {
                format!("aggregate {}{}", op.name(), fmt_grouping(grouping.as_ref()))
            }
            Self::AggregateVariadic { op, grouping, .. } => {
                format!("aggregate {}{}", op.name(), fmt_grouping(grouping.as_ref()))
            }
            Self::Function { name, .. } => format!("call {name}"),
        }
    }
}

fn fmt_offset(offset: i64) -> String {
    if offset == 0 {
        String::new()
    } else {
        format!(" offset {offset}ms")
    }
}

fn fmt_grouping(grouping: Option<&Grouping>) -> String {
    grouping.map(|g| format!(" {g}")).unwrap_or_default()
}

/// A planned query, reusable across evaluation grids.
#[derive(Debug, Clone)]
pub struct Plan {
    root: PlanNode,
}

impl Plan {
    /// Wraps a root node.
    pub fn new(root: PlanNode) -> Self {
        Self { root }
    }

    /// The root node.
    pub fn root(&self) -> &PlanNode {
        &self.root
    }

    /// Kind of the query result.
    pub fn kind(&self) -> ValueKind {
        self.root.kind()
    }

    /// The root's metric plan.
    pub fn metric_plan(&self) -> MetricPlan {
        self.root.metric_plan()
    }

    /// Renders the plan as an indented tree, one node per line.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        explain_node(&self.root, 0, &mut out);
        out
    }
}

fn explain_node(node: &PlanNode, depth: usize, out: &mut String) {
    let metrics = match node.fixed_metrics() {
        Some(m) => format!("fixed {}", m.len()),
        None => "variable".to_string(),
    };
    let affinity = match node.affinity() {
        Affinity::Any => "any".to_string(),
        Affinity::Single(fp) => format!("single {fp}"),
        Affinity::Splittable => "splittable".to_string(),
    };
    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        "{:indent$}{} [{}, {metrics}, {affinity}]",
        "",
        node.label(),
        node.kind(),
        indent = depth * 2
    );
    for child in node.children() {
        explain_node(child, depth + 1, out);
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(names: &[&str]) -> PlanNode {
        let metrics: Vec<Metric> = names.iter().map(|n| Metric::new([("__name__", *n)])).collect();
        PlanNode::InstantSelector {
            metrics,
            offset: 0,
            matcher: SeriesMatcher::default(),
        }
    }

    #[test]
    fn test_affinity() {
        assert_eq!(PlanNode::ScalarLiteral(1.0).affinity(), Affinity::Any);
        let one = selector(&["a"]);
        assert!(matches!(one.affinity(), Affinity::Single(_)));
        assert_eq!(selector(&["a", "b"]).affinity(), Affinity::Splittable);

        let conv = PlanNode::BoolConvert {
            metrics: one.metric_plan(),
            expr: Box::new(one.clone()),
        };
        assert_eq!(conv.affinity(), one.affinity());
    }

    #[test]
    fn test_metric_plan_and_kind() {
        let sel = selector(&["a", "b"]);
        assert_eq!(sel.kind(), ValueKind::Vector);
        assert_eq!(sel.fixed_metrics().map(<[Metric]>::len), Some(2));
        let dynamic = PlanNode::AggregateDynamic {
            op: MappingOp::Sum,
            expr: Box::new(sel),
            grouping: None,
        };
        assert_eq!(dynamic.metric_plan(), MetricPlan::Variable);
    }

    #[test]
    fn test_explain_indents_children() {
        let plan = Plan::new(PlanNode::AggregateDynamic {
            op: MappingOp::Sum,
            expr: Box::new(selector(&["a"])),
            grouping: Some(Grouping::by(["job"])),
        });
        let text = plan.explain();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("aggregate sum by (job)"));
        assert!(lines[1].starts_with("  instant"));
    }

    #[test]
    fn test_preserves_order() {
        let topk = PlanNode::AggregateVariadic {
            op: Aggregator::TopK,
            param: Box::new(PlanNode::ScalarLiteral(1.0)),
            expr: Box::new(selector(&["a"])),
            grouping: None,
        };
        assert!(topk.preserves_order());
        assert!(!selector(&["a"]).preserves_order());
    }
}
