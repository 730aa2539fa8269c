//! CLI for the sieve PromQL engine.
//!
//! Evaluates JSON-encoded query expressions against JSON series data and
//! prints Prometheus-style responses or query plans.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use sieve::ast::Expr;
use sieve::render::QueryResponse;
use sieve::trace::RecordingTracer;
use sieve::{Engine, EngineConfig, Frames};
use tracing_subscriber::EnvFilter;

/// sieve — PromQL planning and evaluation engine CLI.
#[derive(Parser)]
#[command(name = "sieve", version, about)]
struct Cli {
    /// Engine configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Evaluate an expression and print the Prometheus-style JSON response.
    Eval {
        /// Series data file (JSON).
        #[arg(long)]
        data: PathBuf,

        /// Expression as JSON, or `@path` to read it from a file.
        #[arg(long)]
        expr: String,

        /// Grid start in milliseconds since the epoch.
        #[arg(long)]
        start: i64,

        /// Grid end in milliseconds since the epoch (defaults to start).
        #[arg(long)]
        end: Option<i64>,

        /// Grid step (e.g., "15s", "1m", "500ms").
        #[arg(long, default_value = "15s")]
        step: String,

        /// Print the evaluation tree with timings to stderr.
        #[arg(long)]
        trace: bool,
    },

    /// Print the plan of an expression.
    Plan {
        /// Series data file (JSON).
        #[arg(long)]
        data: PathBuf,

        /// Expression as JSON, or `@path` to read it from a file.
        #[arg(long)]
        expr: String,
    },

    /// List builtin functions.
    Functions,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = load_engine(cli.config.as_deref()).and_then(|engine| match cli.command {
        Commands::Eval {
            data,
            expr,
            start,
            end,
            step,
            trace,
        } => cmd_eval(&engine, &data, &expr, start, end.unwrap_or(start), &step, trace),
        Commands::Plan { data, expr } => cmd_plan(&engine, &data, &expr),
        Commands::Functions => {
            cmd_functions(&engine);
            Ok(())
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_engine(config: Option<&Path>) -> Result<Engine, Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    Ok(Engine::new(config)?)
}

/// Implements `sieve eval`.
fn cmd_eval(
    engine: &Engine,
    data: &Path,
    expr: &str,
    start: i64,
    end: i64,
    step: &str,
    trace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = engine.load_storage(data)?;
    let expr = read_expr(expr)?;
    let frames = Frames::new(start, end, parse_duration_ms(step)?)?;
    tracing::debug!(start = frames.start(), end = frames.end(), step = frames.step(), points = frames.len(), "Evaluating over grid");

    let value = if trace {
        let mut tracer = RecordingTracer::new();
        let value = engine.query_with(&expr, &frames, &storage, &mut tracer)?;
        eprint!("{}", sieve::trace::Tracer::report(&tracer));
        value
    } else {
        engine.query(&expr, &frames, &storage)?
    };

    println!("{}", QueryResponse::new(&value, &frames).to_json()?);
    Ok(())
}

/// Implements `sieve plan`.
fn cmd_plan(engine: &Engine, data: &Path, expr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage = engine.load_storage(data)?;
    let expr = read_expr(expr)?;
    let plan = engine.plan(&expr, &storage)?;
    tracing::debug!(expr = %expr, "Planned expression");

    println!("Expression: {expr}");
    println!("Result: {}", plan.kind());
    println!();
    print!("{}", plan.explain());
    Ok(())
}

/// Implements `sieve functions`.
fn cmd_functions(engine: &Engine) {
    let mut names = engine.builtins().functions.names();
    names.sort_unstable();
    for name in names {
        println!("{name}");
    }
}

/// Decodes an expression given inline or as `@path`.
fn read_expr(arg: &str) -> Result<Expr, Box<dyn std::error::Error>> {
    let json = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&json)?)
}

/// Parses a duration string like "500ms", "15s", "5m", "1h" or "1d" into milliseconds.
fn parse_duration_ms(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: i64 = num_str.parse()?;

    let factor = match unit {
        "ms" => 1,
        "s" | "" => 1000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use ms, s, m, h, or d.").into()),
    };

    num.checked_mul(factor)
        .ok_or_else(|| format!("Duration '{s}' is too large").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("15s").unwrap(), 15_000);
        assert_eq!(parse_duration_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("30").unwrap(), 30_000);
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("5y").is_err());
        assert!(parse_duration_ms("m").is_err());
    }

    #[test]
    fn test_read_expr_inline() {
        let expr = read_expr(r#"{"type": "number", "value": 1}"#).unwrap();
        assert_eq!(expr.to_string(), "1");
    }
}
