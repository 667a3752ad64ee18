//! Graph lowering: ordered, idempotent rewrites that put a traced graph into
//! the canonical form converters reason about locally.

mod pipeline;
pub mod passes;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::{Graph, NodeId, OpKind, StructuralError};

pub use pipeline::{LoweringPipeline, PipelineBuilder, Step};

/// Options that change what lowering is allowed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringOptions {
    /// Rewrites exact `gelu` into its tanh approximation. Numerically
    /// approximate, so never on by default.
    pub approximate_gelu: bool,
}

/// Result returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Fixed-point iterations executed.
    pub iterations: usize,
    /// Nodes rewritten or folded.
    pub rewrites_applied: usize,
    /// Nodes removed.
    pub erased_nodes: usize,
}

impl PassResult {
    pub fn rewrites(count: usize) -> Self {
        Self {
            changed: count > 0,
            rewrites_applied: count,
            ..Self::default()
        }
    }

    pub fn erased(count: usize) -> Self {
        Self {
            changed: count > 0,
            erased_nodes: count,
            ..Self::default()
        }
    }

    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("pass `{pass}` left a malformed graph: {source}")]
    Structural {
        pass: &'static str,
        #[source]
        source: StructuralError,
    },
    #[error("pass `{pass}` cannot handle node {node} ({kind}): {message}")]
    UnexpectedNode {
        pass: &'static str,
        node: NodeId,
        kind: OpKind,
        message: String,
    },
}

/// State shared by the passes of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct LoweringContext {
    pub options: LoweringOptions,
}

impl LoweringContext {
    pub fn new(options: LoweringOptions) -> Self {
        Self { options }
    }
}

/// Canonical interface implemented by lowering passes.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut LoweringContext) -> Result<PassResult, LoweringError>;
}

/// Runs the default pipeline over `graph` in place.
pub fn lower_graph(graph: &mut Graph, options: &LoweringOptions) -> Result<PassResult, LoweringError> {
    let pipeline = LoweringPipeline::default_pipeline();
    let mut cx = LoweringContext::new(options.clone());
    pipeline.run(graph, &mut cx)
}
