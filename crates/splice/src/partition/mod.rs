//! Segmentation of a lowered graph into engine segments and fallback nodes.
//!
//! Classification asks the converter registry about every node, applies the
//! user's exclusions, then demotes nodes until every remaining run of
//! eligible nodes has tensor-only boundaries and reaches the minimum block
//! size. Given a shape table, segment inputs must also have a known dtype
//! and shape. Segments are strictly contiguous in node order.

pub mod shape_analysis;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::CompileConfig;
use crate::conversion::{ConverterRegistry, Support};
use crate::ir::{Graph, GraphIndex, Node, NodeId, OpKind, StructuralError, ValueId, ValueType};

pub use shape_analysis::{analyze_shapes, ShapeTable, ValueShape};

/// Knobs of [`partition`], usually derived from a [`CompileConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOptions {
    pub min_block_size: usize,
    pub excluded_ops: BTreeSet<OpKind>,
    pub excluded_modules: Vec<String>,
    pub require_full_compilation: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            min_block_size: crate::config::DEFAULT_MIN_BLOCK_SIZE,
            excluded_ops: BTreeSet::new(),
            excluded_modules: Vec::new(),
            require_full_compilation: false,
        }
    }
}

impl PartitionOptions {
    pub fn from_config(config: &CompileConfig) -> Self {
        Self {
            min_block_size: config.effective_min_block_size(),
            excluded_ops: config.excluded_kinds(),
            excluded_modules: config.torch_executed_modules.clone(),
            require_full_compilation: config.require_full_compilation,
        }
    }
}

/// Why a node stays under the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Unsupported(String),
    ExcludedOp(OpKind),
    ExcludedModule(String),
    /// Constant whose consumers all run under the interpreter.
    UnusedConstant,
    /// A non-tensor value would cross an engine boundary.
    NonTensorBoundary(ValueId),
    /// An engine input whose dtype or shape is neither declared nor measured.
    UnknownBoundary(ValueId),
    /// Member of a run shorter than the minimum block size.
    BelowMinBlockSize { run: usize, min: usize },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Unsupported(reason) => write!(f, "unsupported: {reason}"),
            FallbackReason::ExcludedOp(kind) => write!(f, "{kind} is in torch_executed_ops"),
            FallbackReason::ExcludedModule(module) => {
                write!(f, "inside `{module}`, which is in torch_executed_modules")
            }
            FallbackReason::UnusedConstant => f.write_str("constant without compiled consumers"),
            FallbackReason::NonTensorBoundary(value) => {
                write!(f, "non-tensor value {value} would cross an engine boundary")
            }
            FallbackReason::UnknownBoundary(value) => {
                write!(f, "engine input {value} has no known dtype or shape")
            }
            FallbackReason::BelowMinBlockSize { run, min } => {
                write!(f, "run of {run} node(s) is below min_block_size {min}")
            }
        }
    }
}

/// Eligible nodes compiled into one engine. Holds ids only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: usize,
    pub nodes: Vec<NodeId>,
    /// Values read by the segment and defined outside it, in first-use order.
    pub inputs: Vec<ValueId>,
    /// Values defined by the segment and read after it, in production order.
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Segment(Segment),
    Fallback { node: NodeId, reason: FallbackReason },
}

/// Ordered cover of a graph's nodes by segments and fallback nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionPlan {
    pub blocks: Vec<Block>,
}

impl PartitionPlan {
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.blocks.iter().filter_map(|block| match block {
            Block::Segment(segment) => Some(segment),
            Block::Fallback { .. } => None,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    pub fn fallback_nodes(&self) -> Vec<NodeId> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                Block::Fallback { node, .. } => Some(*node),
                Block::Segment(_) => None,
            })
            .collect()
    }

    /// Checks that the plan covers `graph` exactly once in order, that no
    /// segment is empty, and that segment boundaries are consistent with the
    /// graph's def-use chains.
    pub fn validate(&self, graph: &Graph) -> Result<(), PartitionError> {
        let covered: Vec<NodeId> = self
            .blocks
            .iter()
            .flat_map(|block| match block {
                Block::Segment(segment) => segment.nodes.clone(),
                Block::Fallback { node, .. } => vec![*node],
            })
            .collect();
        if covered != graph.node_ids() {
            return Err(PartitionError::InvalidPlan(
                "blocks do not cover the graph's nodes exactly once in order".to_string(),
            ));
        }
        let index = GraphIndex::build(graph)?;
        for segment in self.segments() {
            if segment.nodes.is_empty() {
                return Err(PartitionError::InvalidPlan(format!(
                    "segment {} is empty",
                    segment.id
                )));
            }
            let members: HashSet<NodeId> = segment.nodes.iter().copied().collect();
            let (inputs, outputs) = boundary(graph, &index, &segment.nodes, &members);
            if inputs != segment.inputs || outputs != segment.outputs {
                return Err(PartitionError::InvalidPlan(format!(
                    "segment {} boundary does not match its nodes",
                    segment.id
                )));
            }
        }
        Ok(())
    }
}

/// A node that would fall back although full compilation was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub node: NodeId,
    pub kind: OpKind,
    pub reason: FallbackReason,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.node, self.kind, self.reason)
    }
}

fn list_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(
        "full compilation requested but {} node(s) would run in fallback: {}",
        .violations.len(),
        list_violations(.violations)
    )]
    RequiresFallback { violations: Vec<Violation> },
    #[error("invalid partition plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// Node whose kind or attributes have no converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedNode {
    pub node: NodeId,
    pub kind: OpKind,
    pub reason: String,
}

/// Lists every node the registry cannot convert, in node order.
pub fn check_operator_support(graph: &Graph, registry: &ConverterRegistry) -> Vec<UnsupportedNode> {
    let unsupported: Vec<UnsupportedNode> = graph
        .nodes
        .iter()
        .filter_map(|node| match registry.support(graph, node) {
            Support::Supported => None,
            Support::Unsupported(reason) => Some(UnsupportedNode {
                node: node.id,
                kind: node.kind,
                reason,
            }),
        })
        .collect();
    if unsupported.is_empty() {
        debug!(graph = %graph.name, "all operators are supported");
    } else {
        let kinds: BTreeSet<OpKind> = unsupported.iter().map(|entry| entry.kind).collect();
        info!(
            graph = %graph.name,
            count = unsupported.len(),
            kinds = ?kinds,
            "unsupported operators"
        );
    }
    unsupported
}

fn classify(
    graph: &Graph,
    node: &Node,
    registry: &ConverterRegistry,
    options: &PartitionOptions,
) -> Option<FallbackReason> {
    if options.excluded_ops.contains(&node.kind) {
        return Some(FallbackReason::ExcludedOp(node.kind));
    }
    if let Some(module) = options
        .excluded_modules
        .iter()
        .find(|module| node.in_module(module))
    {
        return Some(FallbackReason::ExcludedModule(module.clone()));
    }
    match registry.support(graph, node) {
        Support::Supported => None,
        Support::Unsupported(reason) => Some(FallbackReason::Unsupported(reason)),
    }
}

/// Splits `graph` into segments and fallback nodes.
pub fn partition(
    graph: &Graph,
    registry: &ConverterRegistry,
    options: &PartitionOptions,
) -> Result<PartitionPlan, PartitionError> {
    partition_nodes(graph, registry, options, None)
}

/// Like [`partition`], but also keeps every segment input bindable: a value
/// entering a segment needs a dtype and a shape spec, either declared in
/// `graph` or measured in `shapes`. Consumers of other values fall back.
pub fn partition_with_shapes(
    graph: &Graph,
    registry: &ConverterRegistry,
    options: &PartitionOptions,
    shapes: &ShapeTable,
) -> Result<PartitionPlan, PartitionError> {
    partition_nodes(graph, registry, options, Some(shapes))
}

fn partition_nodes(
    graph: &Graph,
    registry: &ConverterRegistry,
    options: &PartitionOptions,
    shapes: Option<&ShapeTable>,
) -> Result<PartitionPlan, PartitionError> {
    let index = GraphIndex::build(graph)?;
    let mut fallback: HashMap<NodeId, FallbackReason> = HashMap::new();
    for node in &graph.nodes {
        if let Some(reason) = classify(graph, node, registry, options) {
            fallback.insert(node.id, reason);
        }
    }

    let min = options.min_block_size.max(1);
    let mut rounds = 0usize;
    loop {
        rounds += 1;
        let mut changed = demote_unused_constants(graph, &index, &mut fallback);
        let runs = eligible_runs(graph, &fallback);
        for run in &runs {
            changed |= demote_non_tensor_boundaries(graph, &index, run, &mut fallback);
            if let Some(shapes) = shapes {
                changed |= demote_unbindable_inputs(graph, &index, run, shapes, &mut fallback);
            }
        }
        if !changed {
            for run in &runs {
                if run.len() < min {
                    for node in run {
                        fallback.insert(
                            *node,
                            FallbackReason::BelowMinBlockSize {
                                run: run.len(),
                                min,
                            },
                        );
                    }
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    if options.require_full_compilation && !fallback.is_empty() {
        let violations = graph
            .nodes
            .iter()
            .filter_map(|node| {
                fallback.get(&node.id).map(|reason| Violation {
                    node: node.id,
                    kind: node.kind,
                    reason: reason.clone(),
                })
            })
            .collect();
        return Err(PartitionError::RequiresFallback { violations });
    }

    let plan = build_plan(graph, &index, &mut fallback);
    debug!(
        graph = %graph.name,
        segments = plan.segment_count(),
        fallback = plan.fallback_nodes().len(),
        rounds,
        "partitioned graph"
    );
    Ok(plan)
}

fn demote_unused_constants(
    graph: &Graph,
    index: &GraphIndex,
    fallback: &mut HashMap<NodeId, FallbackReason>,
) -> bool {
    let mut changed = false;
    for node in &graph.nodes {
        if node.kind != OpKind::Constant || fallback.contains_key(&node.id) {
            continue;
        }
        let feeds_engine = node.outputs.iter().any(|value| {
            index
                .users(*value)
                .iter()
                .any(|user| !fallback.contains_key(user))
        });
        if !feeds_engine {
            fallback.insert(node.id, FallbackReason::UnusedConstant);
            changed = true;
        }
    }
    changed
}

fn eligible_runs(graph: &Graph, fallback: &HashMap<NodeId, FallbackReason>) -> Vec<Vec<NodeId>> {
    group(graph, fallback)
        .into_iter()
        .filter_map(|grouped| match grouped {
            Grouped::Run(nodes) => Some(nodes),
            Grouped::Fallback(_) => None,
        })
        .collect()
}

fn is_tensor(graph: &Graph, value: ValueId) -> bool {
    graph.value_type(value).is_some_and(ValueType::is_tensor)
}

fn demote_non_tensor_boundaries(
    graph: &Graph,
    index: &GraphIndex,
    run: &[NodeId],
    fallback: &mut HashMap<NodeId, FallbackReason>,
) -> bool {
    let members: HashSet<NodeId> = run.iter().copied().collect();
    let (inputs, outputs) = boundary(graph, index, run, &members);
    let mut changed = false;
    for value in inputs.into_iter().filter(|value| !is_tensor(graph, *value)) {
        for user in index.users(value) {
            if members.contains(user) && !fallback.contains_key(user) {
                fallback.insert(*user, FallbackReason::NonTensorBoundary(value));
                changed = true;
            }
        }
    }
    for value in outputs.into_iter().filter(|value| !is_tensor(graph, *value)) {
        if let Some(producer) = index.producer(value) {
            if !fallback.contains_key(&producer) {
                fallback.insert(producer, FallbackReason::NonTensorBoundary(value));
                changed = true;
            }
        }
    }
    changed
}

/// Whether a segment can bind `value` as an engine input.
fn bindable(graph: &Graph, shapes: &ShapeTable, value: ValueId) -> bool {
    let declared = graph.value_type(value).and_then(ValueType::as_tensor);
    let measured = shapes.get(value).is_some();
    let dtype = measured || declared.is_some_and(|ty| ty.dtype.is_some());
    let shape = measured || declared.and_then(|ty| ty.static_dims()).is_some();
    dtype && shape
}

fn demote_unbindable_inputs(
    graph: &Graph,
    index: &GraphIndex,
    run: &[NodeId],
    shapes: &ShapeTable,
    fallback: &mut HashMap<NodeId, FallbackReason>,
) -> bool {
    let members: HashSet<NodeId> = run.iter().copied().collect();
    let (inputs, _) = boundary(graph, index, run, &members);
    let mut changed = false;
    for value in inputs
        .into_iter()
        .filter(|value| is_tensor(graph, *value) && !bindable(graph, shapes, *value))
    {
        for user in index.users(value) {
            if members.contains(user) && !fallback.contains_key(user) {
                fallback.insert(*user, FallbackReason::UnknownBoundary(value));
                changed = true;
            }
        }
    }
    changed
}

/// Inputs in first-use order and outputs in production order of a node run.
fn boundary(
    graph: &Graph,
    index: &GraphIndex,
    run: &[NodeId],
    members: &HashSet<NodeId>,
) -> (Vec<ValueId>, Vec<ValueId>) {
    let mut inputs = Vec::new();
    let mut seen = HashSet::new();
    let mut outputs = Vec::new();
    for id in run {
        let Some(node) = index.position(*id).map(|position| &graph.nodes[position]) else {
            continue;
        };
        for value in &node.inputs {
            let internal = index
                .producer(*value)
                .is_some_and(|producer| members.contains(&producer));
            if !internal && seen.insert(*value) {
                inputs.push(*value);
            }
        }
        for value in &node.outputs {
            let escapes = index.is_graph_output(*value)
                || index
                    .users(*value)
                    .iter()
                    .any(|user| !members.contains(user));
            if escapes {
                outputs.push(*value);
            }
        }
    }
    (inputs, outputs)
}

fn build_plan(
    graph: &Graph,
    index: &GraphIndex,
    fallback: &mut HashMap<NodeId, FallbackReason>,
) -> PartitionPlan {
    let mut blocks = Vec::new();
    for run_or_node in group(graph, fallback) {
        match run_or_node {
            Grouped::Fallback(node) => {
                let reason = fallback
                    .remove(&node)
                    .unwrap_or_else(|| FallbackReason::Unsupported("unclassified".to_string()));
                blocks.push(Block::Fallback { node, reason });
            }
            Grouped::Run(nodes) => {
                let members: HashSet<NodeId> = nodes.iter().copied().collect();
                let (inputs, outputs) = boundary(graph, index, &nodes, &members);
                let id = blocks
                    .iter()
                    .filter(|block| matches!(block, Block::Segment(_)))
                    .count();
                blocks.push(Block::Segment(Segment {
                    id,
                    nodes,
                    inputs,
                    outputs,
                }));
            }
        }
    }
    PartitionPlan { blocks }
}

enum Grouped {
    Run(Vec<NodeId>),
    Fallback(NodeId),
}

fn group(graph: &Graph, fallback: &HashMap<NodeId, FallbackReason>) -> Vec<Grouped> {
    let mut grouped = Vec::new();
    let mut current = Vec::new();
    for node in &graph.nodes {
        if fallback.contains_key(&node.id) {
            if !current.is_empty() {
                grouped.push(Grouped::Run(std::mem::take(&mut current)));
            }
            grouped.push(Grouped::Fallback(node.id));
        } else {
            current.push(node.id);
        }
    }
    if !current.is_empty() {
        grouped.push(Grouped::Run(current));
    }
    grouped
}
