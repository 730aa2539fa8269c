//! Compiles an [`Expr`] into a [`Plan`].
//!
//! # Overview
//!
//! Selectors are resolved against the [`MetricRegistry`] exactly once, here;
//! evaluating the plan later never queries the registry again. Work that only
//! depends on metrics is done as early as possible:
//!
//! - literal/literal operators are folded to a literal
//! - vector/vector operators over fixed operands get their row pairing
//! - mapping aggregators over a fixed operand get their groups
//!
//! Every name is resolved against the [`Builtins`] so an unknown operator,
//! aggregator or function fails before any data is read.

use crate::aggregate::{Aggregator, AggregatorRegistry, compute_groups};
use crate::ast::{Cardinality, Expr, Grouping, Selector, VectorMatching};
use crate::error::{MatchingError, Result, TypeError};
use crate::functions::{FunctionRegistry, Shape};
use crate::matcher::SeriesMatcher;
use crate::matching::compute_matching;
use crate::metric::Metric;
use crate::ops::{BinaryOp, OperatorRegistry, bool_convert};
use crate::plan::{MetricPlan, Plan, PlanNode};
use crate::storage::MetricRegistry;
use crate::value::ValueKind;

/// The operator, aggregator and function registries.
#[derive(Debug, Clone, Default)]
pub struct Builtins {
    /// Binary operators.
    pub operators: OperatorRegistry,
    /// Aggregators.
    pub aggregators: AggregatorRegistry,
    /// Functions.
    pub functions: FunctionRegistry,
}

impl Builtins {
    /// All builtin registries.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Turns expressions into plans against one metric registry.
pub struct Planner<'a, R: MetricRegistry + ?Sized> {
    builtins: &'a Builtins,
    registry: &'a R,
}

impl<'a, R: MetricRegistry + ?Sized> Planner<'a, R> {
    /// Creates a planner.
    pub fn new(builtins: &'a Builtins, registry: &'a R) -> Self {
        Self { builtins, registry }
    }

    /// Plans `expr`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SymbolError`] for unknown names,
    /// [`TypeError`] for operands of the wrong kind, [`MatchingError`] for
    /// invalid matching modifiers or pairings, and any registry error.
    pub fn plan(&self, expr: &Expr) -> Result<Plan> {
        Ok(Plan::new(self.node(expr)?))
    }

    fn node(&self, expr: &Expr) -> Result<PlanNode> {
        match expr {
            Expr::Number { value } => Ok(PlanNode::ScalarLiteral(*value)),
            Expr::String { value } => Ok(PlanNode::TextLiteral(value.clone())),
            Expr::Selector { selector } => {
                let (metrics, matcher) = self.resolve(selector)?;
                Ok(PlanNode::InstantSelector {
                    metrics,
                    offset: selector.offset_ms,
                    matcher,
                })
            }
            Expr::Range { selector, range_ms } => {
                let (metrics, matcher) = self.resolve(selector)?;
                Ok(PlanNode::RangeSelector {
                    metrics,
                    range: *range_ms,
                    offset: selector.offset_ms,
                    matcher,
                })
            }
            Expr::Bool { expr } => self.plan_bool(expr),
            Expr::Binary {
                op,
                lhs,
                rhs,
                matching,
                return_bool,
            } => self.plan_binary(op, lhs, rhs, matching, *return_bool),
            Expr::Aggregate {
                op,
                param,
                expr,
                grouping,
            } => self.plan_aggregate(op, param.as_deref(), expr, grouping.as_ref()),
            Expr::Call { func, args } => self.plan_call(func, args),
        }
    }

    fn resolve(&self, selector: &Selector) -> Result<(Vec<Metric>, SeriesMatcher)> {
        let matcher = selector.series_matcher();
        let mut metrics = self.registry.lookup_metrics(&matcher)?;
        metrics.sort();
        tracing::debug!(%matcher, series = metrics.len(), "resolved selector");
        Ok((metrics, matcher))
    }

    fn plan_bool(&self, expr: &Expr) -> Result<PlanNode> {
        let inner = self.node(expr)?;
        match (&inner, inner.kind()) {
            (PlanNode::ScalarLiteral(v), _) => Ok(PlanNode::ScalarLiteral(bool_convert(*v))),
            (_, ValueKind::Scalar | ValueKind::Vector) => Ok(PlanNode::BoolConvert {
                metrics: inner.metric_plan(),
                expr: Box::new(inner),
            }),
            (_, found) => Err(TypeError::UnexpectedKind {
                context: "bool conversion".to_string(),
                expected: ValueKind::Vector,
                found,
            }
            .into()),
        }
    }

    fn plan_binary(
        &self,
        token: &str,
        lhs: &Expr,
        rhs: &Expr,
        matching: &VectorMatching,
        return_bool: bool,
    ) -> Result<PlanNode> {
        let op = self.builtins.operators.get(token)?;
        let lhs = self.node(lhs)?;
        let rhs = self.node(rhs)?;
        let kinds = (lhs.kind(), rhs.kind());
        let unsupported = || TypeError::UnsupportedOperands {
            op: op.to_string(),
            lhs: kinds.0,
            rhs: kinds.1,
        };

        if let Some(set_op) = op.as_set() {
            if kinds != (ValueKind::Vector, ValueKind::Vector) {
                return Err(unsupported().into());
            }
            let matching = match matching.card {
                Cardinality::ManyToOne | Cardinality::OneToMany => {
                    return Err(MatchingError::GroupingOnSetOperator { op: op.to_string() }.into());
                }
                Cardinality::OneToOne | Cardinality::ManyToMany => VectorMatching {
                    card: Cardinality::ManyToMany,
                    ..matching.clone()
                },
            };
            return Ok(PlanNode::SetOperation {
                op: set_op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                matching,
            });
        }

        if matching.card == Cardinality::ManyToMany {
            return Err(MatchingError::ManyToManyNotAllowed { op: op.to_string() }.into());
        }

        match kinds {
            (ValueKind::Scalar, ValueKind::Scalar) => {
                if op.is_comparison() && !return_bool {
                    return Err(unsupported().into());
                }
                if let (PlanNode::ScalarLiteral(l), PlanNode::ScalarLiteral(r)) = (&lhs, &rhs) {
                    return Ok(PlanNode::ScalarLiteral(op.apply(*l, *r, return_bool)));
                }
                Ok(PlanNode::ScalarScalar {
                    op,
                    return_bool,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            (ValueKind::Scalar, ValueKind::Vector) => Ok(broadcast(op, return_bool, true, lhs, rhs)),
            (ValueKind::Vector, ValueKind::Scalar) => Ok(broadcast(op, return_bool, false, rhs, lhs)),
            (ValueKind::Vector, ValueKind::Vector) => {
                let fixed = match (lhs.fixed_metrics(), rhs.fixed_metrics()) {
                    (Some(l), Some(r)) => Some(compute_matching(matching, l, r, op.drops_name(return_bool))?),
                    _ => None,
                };
                let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
                Ok(match fixed {
                    Some(pairing) => PlanNode::BinaryFixed {
                        op,
                        return_bool,
                        lhs,
                        rhs,
                        pairing,
                    },
                    None => PlanNode::BinaryDynamic {
                        op,
                        return_bool,
                        lhs,
                        rhs,
                        matching: matching.clone(),
                    },
                })
            }
            _ => Err(unsupported().into()),
        }
    }

    fn plan_aggregate(
        &self,
        name: &str,
        param: Option<&Expr>,
        expr: &Expr,
        grouping: Option<&Grouping>,
    ) -> Result<PlanNode> {
        let agg = self.builtins.aggregators.get(name)?;
        let expected_args = if agg.is_variadic() { 2 } else { 1 };
        let found_args = 1 + usize::from(param.is_some());
        if found_args != expected_args {
            return Err(TypeError::ArgumentCount {
                name: name.to_string(),
                expected: expected_args.to_string(),
                found: found_args,
            }
            .into());
        }

        let inner = self.node(expr)?;
        expect_kind(&format!("{name}() operand"), ValueKind::Vector, inner.kind())?;
        let grouping = grouping.cloned();

        match (agg, param) {
            (Aggregator::Mapping(op), _) => Ok(match inner.fixed_metrics() {
                Some(metrics) => PlanNode::AggregateFixed {
                    op,
                    groups: compute_groups(metrics, grouping.as_ref()),
                    expr: Box::new(inner),
                    grouping,
                },
                None => PlanNode::AggregateDynamic {
                    op,
                    expr: Box::new(inner),
                    grouping,
                },
            }),
            (op, Some(param)) => {
                let param = self.node(param)?;
                let expected = if op == Aggregator::CountValues {
                    ValueKind::String
                } else {
                    ValueKind::Scalar
                };
                expect_kind(&format!("{name}() parameter"), expected, param.kind())?;
                Ok(PlanNode::AggregateVariadic {
                    op,
                    param: Box::new(param),
                    expr: Box::new(inner),
                    grouping,
                })
            }
            (_, None) => Err(TypeError::ArgumentCount {
                name: name.to_string(),
                expected: "2".to_string(),
                found: 1,
            }
            .into()),
        }
    }

    fn plan_call(&self, name: &str, args: &[Expr]) -> Result<PlanNode> {
        let def = self.builtins.functions.get(name)?;
        def.check_arity(args.len())?;
        let args = args.iter().map(|a| self.node(a)).collect::<Result<Vec<_>>>()?;
        for (i, arg) in args.iter().enumerate() {
            def.check_kind(i, arg.kind())?;
        }

        let metrics = match def.shape() {
            Shape::Map { main, drops_name } => match args.get(main) {
                None => MetricPlan::Fixed(vec![Metric::empty()]),
                Some(arg) => match arg.fixed_metrics() {
                    Some(m) if drops_name => MetricPlan::Fixed(m.iter().map(Metric::without_name).collect()),
                    Some(m) => MetricPlan::Fixed(m.to_vec()),
                    None => MetricPlan::Variable,
                },
            },
            Shape::Reshape | Shape::Scalar => MetricPlan::Variable,
        };
        let hint = match args.first() {
            Some(PlanNode::InstantSelector { matcher, .. }) => Some(matcher.clone()),
            _ => None,
        };

        Ok(PlanNode::Function {
            name: def.name().to_string(),
            returns: def.returns(),
            ordered: def.is_ordered(),
            args,
            hint,
            metrics,
        })
    }
}

fn broadcast(op: BinaryOp, return_bool: bool, scalar_lhs: bool, scalar: PlanNode, vector: PlanNode) -> PlanNode {
    let metrics = match vector.fixed_metrics() {
        Some(m) if op.drops_name(return_bool) => MetricPlan::Fixed(m.iter().map(Metric::without_name).collect()),
        Some(m) => MetricPlan::Fixed(m.to_vec()),
        None => MetricPlan::Variable,
    };
    PlanNode::Broadcast {
        op,
        return_bool,
        scalar_lhs,
        scalar: Box::new(scalar),
        vector: Box::new(vector),
        metrics,
    }
}

fn expect_kind(context: &str, expected: ValueKind, found: ValueKind) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(TypeError::UnexpectedKind {
            context: context.to_string(),
            expected,
            found,
        }
        .into())
    }
}
