//! The query engine facade.
//!
//! An [`Engine`] owns the builtin registries and the configuration. It plans
//! expressions against a [`MetricRegistry`] and evaluates plans with a
//! [`SampleFetcher`], either as two explicit steps (so a plan can be reused
//! across grids) or in one [`Engine::query`] call that also times both phases
//! and reports slow queries.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::ast::Expr;
use crate::config::{EngineConfig, TraceMode};
use crate::error::Result;
use crate::exec;
use crate::plan::Plan;
use crate::planner::{Builtins, Planner};
use crate::storage::{MemoryStorage, MetricRegistry, SampleFetcher};
use crate::trace::{NopTracer, RecordingTracer, SpanTracer, Tracer};
use crate::value::{Frames, RuntimeValue};

/// Plans and evaluates queries.
///
/// # Example
///
/// ```rust
/// use sieve::ast::Expr;
/// use sieve::metric::Metric;
/// use sieve::storage::MemoryStorage;
/// use sieve::value::{Frames, RuntimeValue, Scalar};
/// use sieve::Engine;
///
/// let mut storage = MemoryStorage::default();
/// storage.insert(&Metric::new([("__name__", "up"), ("job", "api")]), 0, 1.0);
///
/// let engine = Engine::default();
/// let expr = Expr::aggregate("count", None, Expr::metric("up"), None);
/// let out = engine.query(&expr, &Frames::instant(0), &storage).unwrap();
/// let vector = out.into_vector("result").unwrap();
/// assert_eq!(vector.rows()[0].values(), &[1.0]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Engine {
    builtins: Builtins,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine with the builtin registries.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::InvalidValue`] if `config` does
    /// not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            builtins: Builtins::new(),
            config,
        })
    }

    /// The registries used for planning and evaluation.
    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads a JSON data file into memory storage using the configured lookback.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StorageError`] if the file cannot be read or decoded.
    pub fn load_storage(&self, path: impl AsRef<Path>) -> Result<MemoryStorage> {
        MemoryStorage::load(path, self.config.lookback_ms())
    }

    /// Plans `expr`, resolving its selectors against `registry`.
    ///
    /// # Errors
    ///
    /// See [`Planner::plan`].
    pub fn plan<R: MetricRegistry + ?Sized>(&self, expr: &Expr, registry: &R) -> Result<Plan> {
        Planner::new(&self.builtins, registry).plan(expr)
    }

    /// Evaluates `plan` on `frames`.
    ///
    /// # Errors
    ///
    /// See [`exec::evaluate`].
    pub fn evaluate<F: SampleFetcher + ?Sized>(&self, plan: &Plan, frames: &Frames, fetcher: &F) -> Result<RuntimeValue> {
        exec::evaluate(plan, frames, fetcher, &self.builtins, &mut NopTracer)
    }

    /// Evaluates `plan` on `frames`, reporting every node to `tracer`.
    ///
    /// # Errors
    ///
    /// See [`exec::evaluate`].
    pub fn evaluate_with<F: SampleFetcher + ?Sized>(
        &self,
        plan: &Plan,
        frames: &Frames,
        fetcher: &F,
        tracer: &mut dyn Tracer,
    ) -> Result<RuntimeValue> {
        exec::evaluate(plan, frames, fetcher, &self.builtins, tracer)
    }

    /// Plans and evaluates `expr` with the tracer chosen by the configuration.
    ///
    /// # Errors
    ///
    /// Returns any planning or evaluation error.
    pub fn query<S: MetricRegistry + SampleFetcher + ?Sized>(
        &self,
        expr: &Expr,
        frames: &Frames,
        storage: &S,
    ) -> Result<RuntimeValue> {
        let mut tracer: Box<dyn Tracer> = match self.config.trace {
            TraceMode::Off => Box::new(NopTracer),
            TraceMode::Phases => Box::new(SpanTracer::new()),
            TraceMode::Nodes => Box::new(RecordingTracer::new()),
        };
        self.query_with(expr, frames, storage, tracer.as_mut())
    }

    /// Plans and evaluates `expr`, reporting phases and nodes to `tracer`.
    ///
    /// # Errors
    ///
    /// Returns any planning or evaluation error.
    pub fn query_with<S: MetricRegistry + SampleFetcher + ?Sized>(
        &self,
        expr: &Expr,
        frames: &Frames,
        storage: &S,
        tracer: &mut dyn Tracer,
    ) -> Result<RuntimeValue> {
        let started = Instant::now();
        let plan = self.plan(expr, storage)?;
        let planned = started.elapsed();
        tracer.phase("plan", planned);

        let value = self.evaluate_with(&plan, frames, storage, tracer)?;
        let total = started.elapsed();
        tracer.phase("exec", total.saturating_sub(planned));

        tracing::debug!(%expr, %frames, elapsed_us = total.as_micros(), "query finished");
        if let Some(threshold) = self.config.slow_query_threshold_ms
            && total >= Duration::from_millis(threshold)
        {
            tracing::warn!(
                %expr,
                elapsed_ms = total.as_millis(),
                threshold_ms = threshold,
                trace = %tracer.report(),
                "slow query"
            );
        }
        Ok(value)
    }
}
