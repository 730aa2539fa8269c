//! # sieve
//!
//! PromQL query planning and evaluation engine.
//!
//! sieve turns a parsed query expression into a reusable plan, resolving every
//! selector against a metric registry exactly once, and evaluates the plan
//! over an evaluation grid of `[start, end]` at a fixed step. Series data lives
//! behind two small storage traits, so the engine can sit on top of any
//! sample store.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Plans are built once and evaluated against any number of grids
//! - Row pairings and aggregation groups are precomputed when series are known at plan time
//! - A dedicated stale marker, distinct from `NaN`, flows through every operator
//! - Results are sorted by label-set fingerprint and duplicate label sets are rejected
//! - Prometheus-compatible rendering of results
//!
//! ## Quick Start
//!
//! ```rust
//! use sieve::ast::{Expr, Grouping, Selector};
//! use sieve::metric::Metric;
//! use sieve::render::QueryResponse;
//! use sieve::storage::MemoryStorage;
//! use sieve::value::Frames;
//! use sieve::Engine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut storage = MemoryStorage::default();
//! let reqs = Metric::new([("__name__", "http_requests_total"), ("job", "api")]);
//! storage.insert_series(&reqs, (0..=10).map(|i| (i * 15_000, (i * 30) as f64)));
//!
//! // sum by (job) (rate(http_requests_total[1m]))
//! let expr = Expr::aggregate(
//!     "sum",
//!     None,
//!     Expr::call("rate", vec![Expr::range(Selector::named("http_requests_total"), 60_000)]),
//!     Some(Grouping::by(["job"])),
//! );
//!
//! let engine = Engine::default();
//! let plan = engine.plan(&expr, &storage)?;
//! let frames = Frames::new(60_000, 150_000, 30_000)?;
//! let value = engine.evaluate(&plan, &frames, &storage)?;
//! println!("{}", QueryResponse::new(&value, &frames).to_json()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Engine`] — Owns the builtin registries and configuration; plans and evaluates
//! - [`Plan`] — A planned query tree, reusable across grids
//! - [`storage::MetricRegistry`] / [`storage::SampleFetcher`] — Storage contracts
//! - [`RuntimeValue`] — Scalar, string, instant vector, or range vector results
//!
//! ## Modules
//!
//! - [`ast`] — Expression tree handed to the planner
//! - [`planner`] — Expression to plan compilation
//! - [`plan`] — Plan nodes, metric plans, placement hints
//! - [`exec`] — Plan evaluation
//! - [`ops`] — Binary operators
//! - [`matching`] — Vector matching and set operators
//! - [`aggregate`] — Aggregators and grouping
//! - [`functions`] — Builtin functions
//! - [`value`] — Grids, points, matrices, the stale marker
//! - [`metric`] — Label sets and fingerprints
//! - [`matcher`] — Label matchers
//! - [`storage`] — Storage traits and an in-memory store
//! - [`render`] — Prometheus API response rendering
//! - [`trace`] — Evaluation tracing
//! - [`config`] — Engine configuration
//! - [`error`] — Error types

pub mod aggregate;
pub mod ast;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod functions;
pub mod matcher;
pub mod matching;
pub mod metric;
pub mod ops;
pub mod plan;
pub mod planner;
pub mod render;
pub mod storage;
pub mod trace;
pub mod value;

// Re-export primary API types at crate root for convenience.
pub use config::{EngineConfig, TraceMode};
pub use engine::Engine;
pub use error::{Result, SieveError};
pub use plan::Plan;
pub use planner::Builtins;
pub use value::{Frames, RuntimeValue};
