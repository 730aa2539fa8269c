//! Binary operators and the registry that resolves operator tokens.
//!
//! Operators come in three families:
//!
//! - arithmetic (`+ - * / % ^`) combine two values and drop the metric name
//! - comparison (`== != > < >= <=`) keep the left value when the predicate
//!   holds and blank it to stale otherwise; with `bool` they yield 1 or 0
//! - set (`and or unless`) never combine values; see [`crate::matching`]
//!
//! A stale operand always yields stale.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, SymbolError};
use crate::value::{STALE, is_stale};

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `^`
    Pow,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
}

/// Set operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOp {
    /// `and`: left rows whose signature exists on the right.
    And,
    /// `or`: left rows plus right rows whose signature is absent on the left.
    Or,
    /// `unless`: left rows whose signature is absent on the right.
    Unless,
}

/// A resolved binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Arithmetic.
    Arithmetic(ArithmeticOp),
    /// Comparison.
    Comparison(ComparisonOp),
    /// Set operation.
    Set(SetOp),
}

impl BinaryOp {
    /// Whether results lose the metric name.
    pub fn drops_name(self, return_bool: bool) -> bool {
        match self {
            Self::Arithmetic(_) => true,
            Self::Comparison(_) => return_bool,
            Self::Set(_) => false,
        }
    }

    /// Whether this is a comparison.
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Comparison(_))
    }

    /// The set operation, if this is one.
    pub fn as_set(self) -> Option<SetOp> {
        match self {
            Self::Set(op) => Some(op),
            _ => None,
        }
    }

    /// Applies the operator, keeping `l` when a comparison filters.
    pub fn apply(self, l: f64, r: f64, return_bool: bool) -> f64 {
        self.compute(l, r, return_bool, l)
    }

    /// Applies the operator, keeping `r` when a comparison filters.
    ///
    /// Used for `scalar op vector`, where the vector element survives.
    pub fn apply_keep_rhs(self, l: f64, r: f64, return_bool: bool) -> f64 {
        self.compute(l, r, return_bool, r)
    }

    fn compute(self, l: f64, r: f64, return_bool: bool, kept: f64) -> f64 {
        if is_stale(l) || is_stale(r) {
            return STALE;
        }
        match self {
            Self::Arithmetic(op) => match op {
                ArithmeticOp::Add => l + r,
                ArithmeticOp::Sub => l - r,
                ArithmeticOp::Mul => l * r,
                ArithmeticOp::Div => l / r,
                ArithmeticOp::Mod => l % r,
                ArithmeticOp::Pow => l.powf(r),
            },
            Self::Comparison(op) => {
                #[allow(clippy::float_cmp)]
                let holds = match op {
                    ComparisonOp::Eq => l == r,
                    ComparisonOp::Ne => l != r,
                    ComparisonOp::Gt => l > r,
                    ComparisonOp::Lt => l < r,
                    ComparisonOp::Ge => l >= r,
                    ComparisonOp::Le => l <= r,
                };
                match (return_bool, holds) {
                    (true, true) => 1.0,
                    (true, false) => 0.0,
                    (false, true) => kept,
                    (false, false) => STALE,
                }
            }
            Self::Set(_) => l,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Arithmetic(ArithmeticOp::Add) => "+",
            Self::Arithmetic(ArithmeticOp::Sub) => "-",
            Self::Arithmetic(ArithmeticOp::Mul) => "*",
            Self::Arithmetic(ArithmeticOp::Div) => "/",
            Self::Arithmetic(ArithmeticOp::Mod) => "%",
            Self::Arithmetic(ArithmeticOp::Pow) => "^",
            Self::Comparison(ComparisonOp::Eq) => "==",
            Self::Comparison(ComparisonOp::Ne) => "!=",
            Self::Comparison(ComparisonOp::Gt) => ">",
            Self::Comparison(ComparisonOp::Lt) => "<",
            Self::Comparison(ComparisonOp::Ge) => ">=",
            Self::Comparison(ComparisonOp::Le) => "<=",
            Self::Set(SetOp::And) => "and",
            Self::Set(SetOp::Or) => "or",
            Self::Set(SetOp::Unless) => "unless",
        };
        f.write_str(token)
    }
}

/// Maps operator tokens to operators.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    ops: HashMap<String, BinaryOp>,
}

impl OperatorRegistry {
    /// The builtin operators.
    pub fn builtin() -> Self {
        let all = [
            BinaryOp::Arithmetic(ArithmeticOp::Add),
            BinaryOp::Arithmetic(ArithmeticOp::Sub),
            BinaryOp::Arithmetic(ArithmeticOp::Mul),
            BinaryOp::Arithmetic(ArithmeticOp::Div),
            BinaryOp::Arithmetic(ArithmeticOp::Mod),
            BinaryOp::Arithmetic(ArithmeticOp::Pow),
            BinaryOp::Comparison(ComparisonOp::Eq),
            BinaryOp::Comparison(ComparisonOp::Ne),
            BinaryOp::Comparison(ComparisonOp::Gt),
            BinaryOp::Comparison(ComparisonOp::Lt),
            BinaryOp::Comparison(ComparisonOp::Ge),
            BinaryOp::Comparison(ComparisonOp::Le),
            BinaryOp::Set(SetOp::And),
            BinaryOp::Set(SetOp::Or),
            BinaryOp::Set(SetOp::Unless),
        ];
        Self {
            ops: all.into_iter().map(|op| (op.to_string(), op)).collect(),
        }
    }

    /// Resolves a token.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Operator`] for unknown tokens.
    pub fn get(&self, token: &str) -> Result<BinaryOp> {
        self.ops.get(token).copied().ok_or_else(|| {
            SymbolError::Operator {
                name: token.to_string(),
            }
            .into()
        })
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Converts a value to 0 (zero or non-finite) or 1, keeping stale.
pub fn bool_convert(v: f64) -> f64 {
    if is_stale(v) {
        STALE
    } else if v == 0.0 || !v.is_finite() {
        0.0
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_tokens() {
        let reg = OperatorRegistry::builtin();
        assert_eq!(reg.get("+").unwrap(), BinaryOp::Arithmetic(ArithmeticOp::Add));
        assert_eq!(reg.get("unless").unwrap(), BinaryOp::Set(SetOp::Unless));
        assert!(matches!(
            reg.get("<>"),
            Err(crate::SieveError::Symbol(SymbolError::Operator { .. }))
        ));
    }

    #[test]
    fn test_arithmetic() {
        let reg = OperatorRegistry::builtin();
        assert_eq!(reg.get("-").unwrap().apply(5.0, 3.0, false), 2.0);
        assert_eq!(reg.get("%").unwrap().apply(7.0, 3.0, false), 1.0);
        assert_eq!(reg.get("^").unwrap().apply(2.0, 10.0, false), 1024.0);
        assert_eq!(reg.get("/").unwrap().apply(1.0, 0.0, false), f64::INFINITY);
        let nan = reg.get("/").unwrap().apply(0.0, 0.0, false);
        assert!(nan.is_nan() && !is_stale(nan));
    }

    #[test]
    fn test_stale_propagates() {
        let reg = OperatorRegistry::builtin();
        for token in ["+", "*", "==", ">"] {
            let op = reg.get(token).unwrap();
            assert!(is_stale(op.apply(STALE, 1.0, false)));
            assert!(is_stale(op.apply(1.0, STALE, true)));
        }
    }

    #[test]
    fn test_comparison_filters_or_converts() {
        let gt = BinaryOp::Comparison(ComparisonOp::Gt);
        assert_eq!(gt.apply(5.0, 3.0, false), 5.0);
        assert!(is_stale(gt.apply(1.0, 3.0, false)));
        assert_eq!(gt.apply(1.0, 3.0, true), 0.0);
        assert_eq!(gt.apply(5.0, 3.0, true), 1.0);
        assert_eq!(gt.apply_keep_rhs(5.0, 3.0, false), 3.0);
    }

    #[test]
    fn test_drops_name() {
        assert!(BinaryOp::Arithmetic(ArithmeticOp::Add).drops_name(false));
        assert!(!BinaryOp::Comparison(ComparisonOp::Eq).drops_name(false));
        assert!(BinaryOp::Comparison(ComparisonOp::Eq).drops_name(true));
        assert!(!BinaryOp::Set(SetOp::And).drops_name(false));
    }

    #[test]
    fn test_bool_convert() {
        assert_eq!(bool_convert(0.0), 0.0);
        assert_eq!(bool_convert(f64::INFINITY), 0.0);
        assert_eq!(bool_convert(f64::NAN), 0.0);
        assert_eq!(bool_convert(-2.5), 1.0);
        assert!(is_stale(bool_convert(STALE)));
    }
}
