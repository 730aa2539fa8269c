//! Vector matching for binary operators between two instant vectors.
//!
//! # Pairing
//!
//! [`compute_matching`] pairs rows of the two operands by their match
//! signature, the filtered fingerprint over the `on(...)` labels or over
//! everything except the `ignoring(...)` labels. The metric name takes part in
//! the signature only for operators that keep it, so `a > ignoring(code) b`
//! pairs rows of the same name. For `group_right` the sides are swapped internally so that the right
//! side is always the one whose signatures must be unique; the returned pairs
//! are always `(lhs_row, rhs_row)`.
//!
//! Rows without a partner are dropped. The result metric starts from the
//! "many" side, loses the name when the operator drops it, is reduced to the
//! matching labels for one-to-one matching, and finally receives the
//! `group_left`/`group_right` include labels from the "one" side.
//!
//! The pairing depends only on metrics, so the planner computes it once when
//! both operands have a fixed metric set.
//!
//! # Set operators
//!
//! [`set_operation`] implements `and`, `or` and `unless` by row signature
//! membership. Whole rows are kept or dropped; values are never rewritten.

use std::collections::{HashMap, HashSet};

use crate::ast::{Cardinality, VectorMatching};
use crate::error::{InternalError, MatchingError, Result};
use crate::metric::{Fingerprint, Metric, NAME_LABEL};
use crate::ops::{BinaryOp, SetOp};
use crate::value::{PointMatrix, Points};

/// Row pairing of a vector/vector binary operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    /// Result metric of each pair.
    pub metrics: Vec<Metric>,
    /// `(lhs_row, rhs_row)` index pairs, parallel to `metrics`.
    pub pairs: Vec<(usize, usize)>,
}

fn signature(matching: &VectorMatching, metric: &Metric, drop_name: bool) -> Fingerprint {
    metric.filtered_fingerprint(matching.filter_mode(), &matching.labels, drop_name)
}

fn result_metric(matching: &VectorMatching, many: &Metric, one: &Metric, drops_name: bool) -> Metric {
    let mut builder = many.to_builder();
    if drops_name {
        builder.remove(NAME_LABEL);
    }
    if matching.card == Cardinality::OneToOne {
        let listed = |k: &str| matching.labels.iter().any(|l| l == k);
        if matching.on {
            builder.retain(listed);
        } else {
            builder.retain(|k| !listed(k));
        }
    }
    for label in &matching.include {
        builder.put_or_remove(label, one.get(label));
    }
    builder.build()
}

/// Pairs rows of `lhs` and `rhs`.
///
/// # Arguments
///
/// * `matching` - Cardinality and label modifiers
/// * `lhs`, `rhs` - Operand metrics in row order
/// * `drops_name` - Whether the operator removes the metric name from results
///
/// # Errors
///
/// Returns [`MatchingError`] when the "one" side repeats a signature, when a
/// one-to-one signature is matched twice, or when grouping yields the same
/// result metric twice.
pub fn compute_matching(
    matching: &VectorMatching,
    lhs: &[Metric],
    rhs: &[Metric],
    drops_name: bool,
) -> Result<Pairing> {
    let swapped = matching.card == Cardinality::OneToMany;
    let (many, one) = if swapped { (rhs, lhs) } else { (lhs, rhs) };

    let mut one_sigs: HashMap<Fingerprint, usize> = HashMap::with_capacity(one.len());
    for (i, m) in one.iter().enumerate() {
        if one_sigs.insert(signature(matching, m, drops_name), i).is_some() {
            return Err(MatchingError::NotUniqueOnOneSide.into());
        }
    }

    let mut consumed: HashMap<Fingerprint, HashSet<Fingerprint>> = HashMap::new();
    let mut pairing = Pairing {
        metrics: Vec::new(),
        pairs: Vec::new(),
    };
    for (i, m) in many.iter().enumerate() {
        let sig = signature(matching, m, drops_name);
        let Some(&j) = one_sigs.get(&sig) else {
            continue;
        };
        let metric = result_metric(matching, m, &one[j], drops_name);

        let seen = consumed.entry(sig).or_default();
        if matching.card == Cardinality::OneToOne {
            if !seen.is_empty() {
                return Err(MatchingError::ExplicitGroupingRequired.into());
            }
            seen.insert(sig);
        } else if !seen.insert(metric.fingerprint()) {
            return Err(MatchingError::AmbiguousGrouping.into());
        }

        pairing.pairs.push(if swapped { (j, i) } else { (i, j) });
        pairing.metrics.push(metric);
    }
    Ok(pairing)
}

/// Combines paired rows elementwise with `op`.
///
/// # Errors
///
/// Returns [`InternalError::ShapeMismatch`] if a pair points outside either
/// operand.
pub fn apply_pairing(
    op: BinaryOp,
    return_bool: bool,
    pairing: &Pairing,
    lhs: &PointMatrix,
    rhs: &PointMatrix,
) -> Result<PointMatrix> {
    let frames = *lhs.frames();
    let rows = pairing
        .pairs
        .iter()
        .map(|&(l, r)| {
            let (Some(lrow), Some(rrow)) = (lhs.rows().get(l), rhs.rows().get(r)) else {
                return Err(InternalError::ShapeMismatch {
                    reason: format!("pair ({l}, {r}) outside {}x{} operands", lhs.len(), rhs.len()),
                }
                .into());
            };
            Ok(Points::from_frames(&frames, |i, _| {
                op.apply(lrow.values()[i], rrow.values()[i], return_bool)
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    PointMatrix::new(pairing.metrics.clone(), rows, frames)
}

/// Applies a set operator.
///
/// Membership is decided per row by signature, ignoring the metric name:
/// `and` keeps left rows whose signature appears on the right, `unless` keeps
/// the ones whose signature does not, and `or` adds to the left rows every
/// right row whose signature is absent on the left. Values are passed through
/// untouched, stale or not.
///
/// # Errors
///
/// Returns [`InternalError::ShapeMismatch`] if the result cannot be assembled.
pub fn set_operation(op: SetOp, matching: &VectorMatching, lhs: &PointMatrix, rhs: &PointMatrix) -> Result<PointMatrix> {
    let signatures = |m: &PointMatrix| -> HashSet<Fingerprint> {
        m.metrics().iter().map(|x| signature(matching, x, true)).collect()
    };
    let frames = *lhs.frames();
    let mut metrics = Vec::new();
    let mut rows = Vec::new();

    match op {
        SetOp::And | SetOp::Unless => {
            let right = signatures(rhs);
            let keep_if_present = op == SetOp::And;
            for (m, row) in lhs.iter() {
                if right.contains(&signature(matching, m, true)) == keep_if_present {
                    metrics.push(m.clone());
                    rows.push(row.clone());
                }
            }
        }
        SetOp::Or => {
            let left = signatures(lhs);
            metrics.extend(lhs.metrics().iter().cloned());
            rows.extend(lhs.rows().iter().cloned());
            for (m, row) in rhs.iter() {
                if !left.contains(&signature(matching, m, true)) {
                    metrics.push(m.clone());
                    rows.push(row.clone());
                }
            }
        }
    }

    Ok(PointMatrix::new(metrics, rows, frames)?.sort_by_fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ArithmeticOp;
    use crate::value::{Frames, STALE, is_stale};

    fn m(labels: &[(&str, &str)]) -> Metric {
        Metric::new(labels.iter().copied())
    }

    fn matrix(metrics: Vec<Metric>, values: &[&[f64]]) -> PointMatrix {
        let frames = Frames::new(0, (values[0].len() as i64 - 1) * 1000, 1000).unwrap();
        let rows = values
            .iter()
            .map(|vs| Points::from_frames(&frames, |i, _| vs[i]))
            .collect();
        PointMatrix::new(metrics, rows, frames).unwrap()
    }

    #[test]
    fn test_one_to_one_on() {
        let lhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("i", "1")]),
            m(&[("__name__", "a"), ("job", "y"), ("i", "1")]),
        ];
        let rhs = vec![
            m(&[("__name__", "b"), ("job", "y"), ("i", "2")]),
            m(&[("__name__", "b"), ("job", "x"), ("i", "2")]),
        ];
        let p = compute_matching(&VectorMatching::on(["job"]), &lhs, &rhs, true).unwrap();
        assert_eq!(p.pairs, vec![(0, 1), (1, 0)]);
        assert_eq!(p.metrics, vec![m(&[("job", "x")]), m(&[("job", "y")])]);
    }

    #[test]
    fn test_disjoint_labels_yield_nothing() {
        let lhs = vec![m(&[("__name__", "a"), ("job", "x")])];
        let rhs = vec![m(&[("__name__", "b"), ("job", "z")])];
        let p = compute_matching(&VectorMatching::default(), &lhs, &rhs, true).unwrap();
        assert!(p.pairs.is_empty());
    }

    #[test]
    fn test_ignoring_keeps_remaining_labels() {
        let lhs = vec![m(&[("__name__", "a"), ("job", "x"), ("code", "200")])];
        let rhs = vec![m(&[("__name__", "b"), ("job", "x"), ("code", "500")])];
        let p = compute_matching(&VectorMatching::ignoring(["code"]), &lhs, &rhs, true).unwrap();
        assert_eq!(p.metrics, vec![m(&[("job", "x")])]);
    }

    #[test]
    fn test_duplicate_on_one_side_rejected() {
        let lhs = vec![m(&[("job", "x"), ("i", "1")])];
        let rhs = vec![m(&[("job", "x"), ("i", "1")]), m(&[("job", "x"), ("i", "2")])];
        let err = compute_matching(&VectorMatching::on(["job"]), &lhs, &rhs, true).unwrap_err();
        assert!(matches!(err, crate::SieveError::Matching(MatchingError::NotUniqueOnOneSide)));
    }

    #[test]
    fn test_one_to_one_requires_explicit_grouping() {
        let lhs = vec![m(&[("job", "x"), ("i", "1")]), m(&[("job", "x"), ("i", "2")])];
        let rhs = vec![m(&[("job", "x")])];
        let err = compute_matching(&VectorMatching::on(["job"]), &lhs, &rhs, true).unwrap_err();
        assert!(matches!(
            err,
            crate::SieveError::Matching(MatchingError::ExplicitGroupingRequired)
        ));
    }

    #[test]
    fn test_group_left_includes_labels() {
        let lhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("i", "1")]),
            m(&[("__name__", "a"), ("job", "x"), ("i", "2")]),
        ];
        let rhs = vec![m(&[("__name__", "info"), ("job", "x"), ("version", "v1")])];
        let matching = VectorMatching::on(["job"]).group(Cardinality::ManyToOne, ["version"]);
        let p = compute_matching(&matching, &lhs, &rhs, true).unwrap();
        assert_eq!(p.pairs, vec![(0, 0), (1, 0)]);
        assert_eq!(
            p.metrics,
            vec![
                m(&[("job", "x"), ("i", "1"), ("version", "v1")]),
                m(&[("job", "x"), ("i", "2"), ("version", "v1")]),
            ]
        );
    }

    #[test]
    fn test_group_right_swaps_sides() {
        let lhs = vec![m(&[("__name__", "info"), ("job", "x")])];
        let rhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("i", "1")]),
            m(&[("__name__", "a"), ("job", "x"), ("i", "2")]),
        ];
        let matching = VectorMatching::on(["job"]).group(Cardinality::OneToMany, Vec::<String>::new());
        let p = compute_matching(&matching, &lhs, &rhs, true).unwrap();
        assert_eq!(p.pairs, vec![(0, 0), (0, 1)]);
        assert_eq!(p.metrics[0], m(&[("job", "x"), ("i", "1")]));
    }

    #[test]
    fn test_grouping_must_be_unique() {
        let lhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("i", "1")]),
            m(&[("__name__", "b"), ("job", "x"), ("i", "1")]),
        ];
        let rhs = vec![m(&[("job", "x")])];
        let matching = VectorMatching::on(["job"]).group(Cardinality::ManyToOne, Vec::<String>::new());
        let err = compute_matching(&matching, &lhs, &rhs, true).unwrap_err();
        assert!(matches!(err, crate::SieveError::Matching(MatchingError::AmbiguousGrouping)));
    }

    #[test]
    fn test_apply_pairing() {
        let lhs = matrix(vec![m(&[("job", "x")])], &[&[1.0, 2.0]]);
        let rhs = matrix(vec![m(&[("job", "x")])], &[&[10.0, STALE]]);
        let p = compute_matching(&VectorMatching::default(), lhs.metrics(), rhs.metrics(), true).unwrap();
        let out = apply_pairing(BinaryOp::Arithmetic(ArithmeticOp::Add), false, &p, &lhs, &rhs).unwrap();
        assert_eq!(out.rows()[0].values()[0], 11.0);
        assert!(is_stale(out.rows()[0].values()[1]));
    }

    #[test]
    fn test_comparison_pairs_on_name() {
        let lhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("code", "200")]),
            m(&[("__name__", "b"), ("job", "x"), ("code", "200")]),
        ];
        let rhs = vec![
            m(&[("__name__", "a"), ("job", "x"), ("code", "500")]),
            m(&[("__name__", "b"), ("job", "x"), ("code", "500")]),
        ];
        let matching = VectorMatching::ignoring(["code"]);

        let p = compute_matching(&matching, &lhs, &rhs, false).unwrap();
        assert_eq!(p.pairs, vec![(0, 0), (1, 1)]);
        assert_eq!(p.metrics[1], m(&[("__name__", "b"), ("job", "x")]));

        // Without the name the two right rows collide.
        let err = compute_matching(&matching, &lhs, &rhs, true).unwrap_err();
        assert!(matches!(err, crate::SieveError::Matching(MatchingError::NotUniqueOnOneSide)));
    }

    #[test]
    fn test_set_and_unless() {
        let lhs = matrix(
            vec![m(&[("__name__", "a"), ("job", "x")]), m(&[("__name__", "a"), ("job", "y")])],
            &[&[1.0, 1.0], &[2.0, 2.0]],
        );
        let rhs = matrix(vec![m(&[("__name__", "b"), ("job", "x")])], &[&[5.0, STALE]]);
        let matching = VectorMatching::default();

        let and = set_operation(SetOp::And, &matching, &lhs, &rhs).unwrap();
        assert_eq!(and.len(), 1);
        assert_eq!(and.metrics()[0], m(&[("__name__", "a"), ("job", "x")]));
        assert_eq!(and.rows()[0].values(), &[1.0, 1.0]);

        let unless = set_operation(SetOp::Unless, &matching, &lhs, &rhs).unwrap();
        assert_eq!(unless.len(), 1);
        assert_eq!(unless.metrics()[0], m(&[("__name__", "a"), ("job", "y")]));
    }

    #[test]
    fn test_set_membership_ignores_stale_values() {
        let lhs = matrix(vec![m(&[("__name__", "a"), ("job", "x")])], &[&[1.0, 1.0]]);
        let rhs = matrix(vec![m(&[("__name__", "b"), ("job", "x")])], &[&[STALE, STALE]]);
        let matching = VectorMatching::default();

        let and = set_operation(SetOp::And, &matching, &lhs, &rhs).unwrap();
        assert_eq!(and.len(), 1);
        assert_eq!(and.rows()[0].values(), &[1.0, 1.0]);

        let unless = set_operation(SetOp::Unless, &matching, &lhs, &rhs).unwrap();
        assert!(unless.is_empty());

        // An all-stale left row survives `and` as is.
        let and = set_operation(SetOp::And, &matching, &rhs, &lhs).unwrap();
        assert_eq!(and.len(), 1);
        assert!(and.rows()[0].values().iter().all(|&v| is_stale(v)));
    }

    #[test]
    fn test_set_or() {
        let lhs = matrix(vec![m(&[("job", "x")])], &[&[1.0, STALE]]);
        let rhs = matrix(
            vec![m(&[("job", "x")]), m(&[("job", "z")])],
            &[&[7.0, 8.0], &[9.0, 9.0]],
        );
        let out = set_operation(SetOp::Or, &VectorMatching::default(), &lhs, &rhs).unwrap();
        assert_eq!(out.len(), 2);
        let (_, row) = out.iter().find(|(mm, _)| mm.get("job") == Some("x")).unwrap();
        assert_eq!(row.values()[0], 1.0);
        assert!(is_stale(row.values()[1]));
        let (_, row) = out.iter().find(|(mm, _)| mm.get("job") == Some("z")).unwrap();
        assert_eq!(row.values(), &[9.0, 9.0]);
    }
}
