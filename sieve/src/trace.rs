//! Evaluation tracing.
//!
//! The executor reports every plan node it enters and leaves, and the engine
//! reports the duration of each query phase. [`NopTracer`] ignores both,
//! [`SpanTracer`] keeps phase timings, and [`RecordingTracer`] rebuilds the
//! evaluated node tree with elapsed times.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Receives evaluation events.
pub trait Tracer {
    /// A plan node started evaluating.
    fn enter(&mut self, _label: &str) {}

    /// The most recently entered node finished.
    fn exit(&mut self) {}

    /// A query phase (`plan`, `exec`) finished.
    fn phase(&mut self, _name: &str, _elapsed: Duration) {}

    /// Human readable summary of what was recorded.
    fn report(&self) -> String {
        String::new()
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopTracer;

impl Tracer for NopTracer {}

/// Records phase durations.
#[derive(Debug, Default, Clone)]
pub struct SpanTracer {
    phases: Vec<(String, Duration)>,
}

impl SpanTracer {
    /// Creates an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded phases in completion order.
    pub fn phases(&self) -> &[(String, Duration)] {
        &self.phases
    }
}

impl Tracer for SpanTracer {
    fn phase(&mut self, name: &str, elapsed: Duration) {
        tracing::debug!(phase = name, elapsed_us = elapsed.as_micros(), "query phase");
        self.phases.push((name.to_string(), elapsed));
    }

    fn report(&self) -> String {
        self.phases
            .iter()
            .map(|(name, d)| format!("{name}={d:?}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A node of the recorded evaluation tree.
#[derive(Debug, Clone)]
pub struct TraceNode {
    /// Plan node label.
    pub label: String,
    /// Wall time including children.
    pub elapsed: Duration,
    /// Child nodes in evaluation order.
    pub children: Vec<TraceNode>,
}

#[derive(Debug)]
struct OpenNode {
    node: TraceNode,
    started: Instant,
}

/// Records every evaluated node and phase.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    spans: SpanTracer,
    stack: Vec<OpenNode>,
    roots: Vec<TraceNode>,
}

impl RecordingTracer {
    /// Creates an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed top-level nodes.
    pub fn roots(&self) -> &[TraceNode] {
        &self.roots
    }

    /// Recorded phases.
    pub fn phases(&self) -> &[(String, Duration)] {
        self.spans.phases()
    }

    fn write_node(out: &mut String, node: &TraceNode, depth: usize) {
        let _ = writeln!(out, "{:indent$}{} ({:?})", "", node.label, node.elapsed, indent = depth * 2);
        for child in &node.children {
            Self::write_node(out, child, depth + 1);
        }
    }
}

impl Tracer for RecordingTracer {
    fn enter(&mut self, label: &str) {
        self.stack.push(OpenNode {
            node: TraceNode {
                label: label.to_string(),
                elapsed: Duration::ZERO,
                children: Vec::new(),
            },
            started: Instant::now(),
        });
    }

    fn exit(&mut self) {
        let Some(mut open) = self.stack.pop() else {
            return;
        };
        open.node.elapsed = open.started.elapsed();
        match self.stack.last_mut() {
            Some(parent) => parent.node.children.push(open.node),
            None => self.roots.push(open.node),
        }
    }

    fn phase(&mut self, name: &str, elapsed: Duration) {
        self.spans.phase(name, elapsed);
    }

    fn report(&self) -> String {
        let mut out = String::new();
        let phases = self.spans.report();
        if !phases.is_empty() {
            let _ = writeln!(out, "{phases}");
        }
        for root in &self.roots {
            Self::write_node(&mut out, root, 0);
        }
        out
    }
}
