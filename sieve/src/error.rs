//! Error types for the sieve query engine.
//!
//! Every failure is reported synchronously at the point where it is detected
//! and surfaced to the caller unchanged. Nothing inside the engine retries.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::ValueKind;

/// The main error type for all sieve operations.
///
/// Each variant wraps the error enum of one concern so callers can match on
/// the class of failure without caring which module raised it.
#[derive(Error, Debug)]
pub enum SieveError {
    /// An operand or argument had the wrong runtime kind.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// An unknown function, aggregator, or operator was referenced.
    #[error("undefined symbol: {0}")]
    Symbol(#[from] SymbolError),

    /// Vector matching or result identity rules were violated.
    #[error("matching error: {0}")]
    Matching(#[from] MatchingError),

    /// A parameter was outside its accepted domain.
    #[error("invalid parameter: {0}")]
    Parameter(#[from] ParameterError),

    /// Plan and data disagree; indicates a defect, not a user error.
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),

    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised when a value of the wrong kind reaches an operator,
/// aggregator, or function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    /// An operand had a different kind than required.
    #[error("{context} expects {expected} but got {found}")]
    UnexpectedKind {
        /// Where the value was consumed, e.g. `rate() argument 1`.
        context: String,
        /// The kind that was required.
        expected: ValueKind,
        /// The kind that was supplied.
        found: ValueKind,
    },

    /// A function or aggregator received the wrong number of arguments.
    #[error("{name} expects {expected} argument(s) but got {found}")]
    ArgumentCount {
        /// Function or aggregator name.
        name: String,
        /// Human readable description of the accepted count.
        expected: String,
        /// Number of arguments supplied.
        found: usize,
    },

    /// A binary operator cannot be applied to the given operand kinds.
    #[error("operator {op} is not defined between {lhs} and {rhs}")]
    UnsupportedOperands {
        /// The operator name.
        op: String,
        /// Kind of the left operand.
        lhs: ValueKind,
        /// Kind of the right operand.
        rhs: ValueKind,
    },
}

/// Errors for names that are not present in the builtin registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    /// Unknown function name.
    #[error("function '{name}' is not defined")]
    Function {
        /// The unknown name.
        name: String,
    },

    /// Unknown aggregator name.
    #[error("aggregator '{name}' is not defined")]
    Aggregator {
        /// The unknown name.
        name: String,
    },

    /// Unknown binary operator.
    #[error("operator '{name}' is not defined")]
    Operator {
        /// The unknown name.
        name: String,
    },
}

/// Errors raised by vector matching and result identity checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchingError {
    /// Many-to-many matching requested for a non-set operator.
    #[error("many-to-many only allowed for set operators, got '{op}'")]
    ManyToManyNotAllowed {
        /// The offending operator.
        op: String,
    },

    /// A set operator was combined with group_left/group_right.
    #[error("no grouping allowed for '{op}' operation")]
    GroupingOnSetOperator {
        /// The offending set operator.
        op: String,
    },

    /// The deduplicated side contains the same match key twice.
    #[error("many-to-many matching not allowed: matching labels must be unique on one side")]
    NotUniqueOnOneSide,

    /// A one-to-one match key was used by more than one row.
    #[error("multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)")]
    ExplicitGroupingRequired,

    /// Grouped matching produced the same output identity twice.
    #[error("multiple matches for labels: grouping labels must ensure unique matches")]
    AmbiguousGrouping,

    /// A final result contains two rows with the same labels.
    #[error("vector cannot contain metrics with the same labelset: {metric}")]
    DuplicatedLabelSet {
        /// The duplicated metric, rendered.
        metric: String,
    },

    /// A label rewriting function produced colliding metrics.
    #[error("{function} cannot create duplicated metrics: {metric}")]
    DuplicatedRewrite {
        /// The function that rewrote labels.
        function: String,
        /// The colliding metric, rendered.
        metric: String,
    },
}

/// Errors for parameters outside the accepted domain.
#[derive(Error, Debug)]
pub enum ParameterError {
    /// Holt-Winters smoothing factor not in the open interval (0, 1).
    #[error("invalid smoothing factor. Expected: 0 < sf < 1, got: {value}")]
    SmoothingFactor {
        /// The supplied factor.
        value: f64,
    },

    /// Holt-Winters trend factor not in the open interval (0, 1).
    #[error("invalid trend factor. Expected: 0 < tf < 1, got: {value}")]
    TrendFactor {
        /// The supplied factor.
        value: f64,
    },

    /// A regular expression failed to compile.
    #[error("invalid regular expression '{pattern}': {source}")]
    InvalidRegex {
        /// The pattern as written by the user.
        pattern: String,
        /// The compile error.
        #[source]
        source: regex::Error,
    },

    /// A label name does not match `[a-zA-Z_][a-zA-Z0-9_]*`.
    #[error("invalid label name '{name}'")]
    InvalidLabelName {
        /// The rejected name.
        name: String,
    },

    /// An evaluation grid could not be constructed.
    #[error("invalid frames start={start} end={end} step={step}: {reason}")]
    InvalidFrames {
        /// Grid start in milliseconds.
        start: i64,
        /// Grid end in milliseconds.
        end: i64,
        /// Grid step in milliseconds.
        step: i64,
        /// Why the grid is invalid.
        reason: String,
    },
}

/// Errors that indicate the plan and the data it was evaluated against
/// disagree. These are defects, never user errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// Row or column counts do not line up.
    #[error("shape mismatch: {reason}")]
    ShapeMismatch {
        /// Description of the mismatch.
        reason: String,
    },

    /// A plan references a registry entry the executor does not have.
    #[error("{kind} '{name}' vanished between planning and execution")]
    MissingRegistryEntry {
        /// Registry kind (function, aggregator, operator).
        kind: &'static str,
        /// The missing name.
        name: String,
    },
}

/// Errors raised by the storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A data file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Series data could not be decoded.
    #[error("failed to decode series data: {0}")]
    Decode(#[from] serde_json::Error),

    /// Decoded series data violates an invariant.
    #[error("invalid series data: {reason}")]
    InvalidData {
        /// What was wrong.
        reason: String,
    },
}

/// Errors raised while loading or validating engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::EngineConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds an unusable value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The field name.
        field: &'static str,
        /// Why the value is rejected.
        reason: String,
    },
}

/// Convenience type alias for Results in sieve operations.
pub type Result<T> = std::result::Result<T, SieveError>;
