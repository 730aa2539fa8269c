//! Evaluates a [`Plan`] on an evaluation grid.
//!
//! The executor walks the plan depth first, fetching samples for the metrics
//! the planner resolved and combining child results bottom up. It never
//! consults the metric registry. Work the planner could not do ahead of time
//! (pairing rows of variable-metric operands, grouping variable inputs) is
//! done here.
//!
//! A vector result is returned sorted by fingerprint, except when the root
//! decides row order itself (`topk`, `bottomk`, `sort`, `sort_desc`). In both
//! cases a result containing the same label set twice is rejected.

use crate::aggregate::{Aggregator, compute_groups, count_values, quantile_by, reduce, select_k};
use crate::error::{InternalError, Result};
use crate::matching::{apply_pairing, compute_matching, set_operation};
use crate::metric::Metric;
use crate::ops::{BinaryOp, bool_convert};
use crate::plan::{Plan, PlanNode};
use crate::planner::Builtins;
use crate::storage::SampleFetcher;
use crate::trace::Tracer;
use crate::value::{Frames, PointMatrix, RuntimeValue, Scalar};

/// Evaluates `plan` on `frames`.
///
/// # Errors
///
/// Returns storage errors from `fetcher`, parameter errors raised by
/// functions and aggregators, [`crate::error::MatchingError`] for pairings
/// that only fail at run time, and [`InternalError`] when the plan and the
/// builtins disagree.
pub fn evaluate<F: SampleFetcher + ?Sized>(
    plan: &Plan,
    frames: &Frames,
    fetcher: &F,
    builtins: &Builtins,
    tracer: &mut dyn Tracer,
) -> Result<RuntimeValue> {
    let mut exec = Executor {
        frames,
        fetcher,
        builtins,
        tracer,
    };
    let value = exec.eval(plan.root())?;
    match value {
        RuntimeValue::Vector(m) if plan.root().preserves_order() => {
            m.check_unique()?;
            Ok(RuntimeValue::Vector(m))
        }
        RuntimeValue::Vector(m) => Ok(RuntimeValue::Vector(m.into_sorted_unique()?)),
        other => Ok(other),
    }
}

struct Executor<'a, F: ?Sized> {
    frames: &'a Frames,
    fetcher: &'a F,
    builtins: &'a Builtins,
    tracer: &'a mut dyn Tracer,
}

impl<F: SampleFetcher + ?Sized> Executor<'_, F> {
    fn eval(&mut self, node: &PlanNode) -> Result<RuntimeValue> {
        self.tracer.enter(&node.label());
        let result = self.eval_node(node);
        self.tracer.exit();
        result
    }

    fn vector(&mut self, node: &PlanNode, context: &str) -> Result<PointMatrix> {
        self.eval(node)?.into_vector(context)
    }

    fn scalar(&mut self, node: &PlanNode, context: &str) -> Result<Scalar> {
        match self.eval(node)? {
            RuntimeValue::Scalar(s) => Ok(s),
            other => other.as_scalar(context).cloned(),
        }
    }

    fn eval_node(&mut self, node: &PlanNode) -> Result<RuntimeValue> {
        let frames = self.frames;
        match node {
            PlanNode::ScalarLiteral(v) => Ok(RuntimeValue::Scalar(Scalar::Constant(*v))),
            PlanNode::TextLiteral(s) => Ok(RuntimeValue::Text(s.clone())),
            PlanNode::InstantSelector { metrics, offset, .. } => {
                Ok(RuntimeValue::Vector(self.fetcher.fetch_instant(metrics, frames, *offset)?))
            }
            PlanNode::RangeSelector {
                metrics, range, offset, ..
            } => Ok(RuntimeValue::Matrix(self.fetcher.fetch_range(metrics, frames, *range, *offset)?)),
            PlanNode::BoolConvert { expr, .. } => Ok(match self.eval(expr)? {
                RuntimeValue::Scalar(s) => RuntimeValue::Scalar(map_scalar(&s, frames, bool_convert)),
                RuntimeValue::Vector(m) => RuntimeValue::Vector(m.map_values(|v, _| bool_convert(v))),
                other => other,
            }),
            PlanNode::ScalarScalar {
                op,
                return_bool,
                lhs,
                rhs,
            } => {
                let l = self.scalar(lhs, "left operand")?;
                let r = self.scalar(rhs, "right operand")?;
                Ok(RuntimeValue::Scalar(match (l.as_constant(), r.as_constant()) {
                    (Some(l), Some(r)) => Scalar::Constant(op.apply(l, r, *return_bool)),
                    _ => Scalar::Series(
                        (0..frames.len())
                            .map(|i| op.apply(l.at(i), r.at(i), *return_bool))
                            .collect(),
                    ),
                }))
            }
            PlanNode::Broadcast {
                op,
                return_bool,
                scalar_lhs,
                scalar,
                vector,
                ..
            } => {
                let (s, v) = if *scalar_lhs {
                    let s = self.scalar(scalar, "left operand")?;
                    (s, self.vector(vector, "right operand")?)
                } else {
                    let v = self.vector(vector, "left operand")?;
                    (self.scalar(scalar, "right operand")?, v)
                };
                Ok(RuntimeValue::Vector(broadcast(*op, *return_bool, *scalar_lhs, &s, v)?))
            }
            PlanNode::BinaryFixed {
                op,
                return_bool,
                lhs,
                rhs,
                pairing,
            } => {
                let l = self.vector(lhs, "left operand")?;
                let r = self.vector(rhs, "right operand")?;
                Ok(RuntimeValue::Vector(apply_pairing(*op, *return_bool, pairing, &l, &r)?))
            }
            PlanNode::BinaryDynamic {
                op,
                return_bool,
                lhs,
                rhs,
                matching,
            } => {
                let l = self.vector(lhs, "left operand")?;
                let r = self.vector(rhs, "right operand")?;
                let pairing = compute_matching(matching, l.metrics(), r.metrics(), op.drops_name(*return_bool))?;
                Ok(RuntimeValue::Vector(apply_pairing(*op, *return_bool, &pairing, &l, &r)?))
            }
            PlanNode::SetOperation { op, lhs, rhs, matching } => {
                let l = self.vector(lhs, "left operand")?;
                let r = self.vector(rhs, "right operand")?;
                Ok(RuntimeValue::Vector(set_operation(*op, matching, &l, &r)?))
            }
            PlanNode::AggregateFixed { op, expr, groups, .. } => {
                let input = self.vector(expr, op.name())?;
                Ok(RuntimeValue::Vector(reduce(*op, groups, &input)?))
            }
            PlanNode::AggregateDynamic { op, expr, grouping } => {
                let input = self.vector(expr, op.name())?;
                let groups = compute_groups(input.metrics(), grouping.as_ref());
                Ok(RuntimeValue::Vector(reduce(*op, &groups, &input)?))
            }
            PlanNode::AggregateVariadic {
                op,
                param,
                expr,
                grouping,
            } => {
                let param = self.eval(param)?;
                let input = self.vector(expr, op.name())?;
                let context = format!("{}() parameter", op.name());
                let grouping = grouping.as_ref();
                let out = match op {
                    Aggregator::TopK => select_k(false, param.as_scalar(&context)?, grouping, &input)?,
                    Aggregator::BottomK => select_k(true, param.as_scalar(&context)?, grouping, &input)?,
                    Aggregator::Quantile => quantile_by(param.as_scalar(&context)?, grouping, &input)?,
                    Aggregator::CountValues => count_values(param.as_text(&context)?, grouping, &input)?,
                    Aggregator::Mapping(m) => {
                        return Err(InternalError::MissingRegistryEntry {
                            kind: "variadic aggregator",
                            name: m.name().to_string(),
                        }
                        .into());
                    }
                };
                Ok(RuntimeValue::Vector(out))
            }
            PlanNode::Function { name, args, hint, .. } => {
                let def = self
                    .builtins
                    .functions
                    .get(name)
                    .map_err(|_| InternalError::MissingRegistryEntry {
                        kind: "function",
                        name: name.clone(),
                    })?;
                let values = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>>>()?;
                def.call(frames, &values, hint.as_ref())
            }
        }
    }
}

fn map_scalar(s: &Scalar, frames: &Frames, f: impl Fn(f64) -> f64) -> Scalar {
    match s {
        Scalar::Constant(v) => Scalar::Constant(f(*v)),
        Scalar::Series(_) => Scalar::Series((0..frames.len()).map(|i| f(s.at(i))).collect()),
    }
}

fn broadcast(op: BinaryOp, return_bool: bool, scalar_lhs: bool, s: &Scalar, v: PointMatrix) -> Result<PointMatrix> {
    let (metrics, rows, frames) = v.into_parts();
    let rows = rows
        .iter()
        .map(|row| {
            row.map_values_indexed(|i, x| {
                if scalar_lhs {
                    op.apply_keep_rhs(s.at(i), x, return_bool)
                } else {
                    op.apply(x, s.at(i), return_bool)
                }
            })
        })
        .collect();
    let metrics = if op.drops_name(return_bool) {
        metrics.iter().map(Metric::without_name).collect()
    } else {
        metrics
    };
    PointMatrix::new(metrics, rows, frames)
}
