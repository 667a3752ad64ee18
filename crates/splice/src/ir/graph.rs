use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::index::GraphIndex;
use super::op::{Attr, OpKind};
use super::types::ValueType;

/// Arena index of a value edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Stable identifier of a node, unique within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueData {
    pub ty: ValueType,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Attr>,
    /// Dotted path of the enclosing module, e.g. `encoder.block0.act`.
    #[serde(default)]
    pub scope: Option<String>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&Attr> {
        self.attrs.get(name)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Attr::as_int)
    }

    pub fn float_attr(&self, name: &str) -> Option<f64> {
        self.attr(name).and_then(Attr::as_float)
    }

    pub fn ints_attr(&self, name: &str) -> Option<&[i64]> {
        self.attr(name).and_then(Attr::as_ints)
    }

    pub fn output(&self) -> Option<ValueId> {
        match self.outputs.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// Returns `true` when the node sits inside `prefix` or one of its submodules.
    pub fn in_module(&self, prefix: &str) -> bool {
        let Some(scope) = self.scope.as_deref() else {
            return false;
        };
        scope == prefix
            || scope
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Structural invariant violated by a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("node {node} ({kind}) reads {value} before it is defined")]
    UndefinedOperand {
        node: NodeId,
        kind: OpKind,
        value: ValueId,
    },
    #[error("value {value} is defined more than once")]
    Redefined { value: ValueId },
    #[error("value {value} is not part of the graph arena")]
    UnknownValue { value: ValueId },
    #[error("graph output {value} is never defined")]
    UndefinedOutput { value: ValueId },
    #[error("node id {node} appears more than once")]
    DuplicateNode { node: NodeId },
    #[error("node {node} ({kind}) has {found} {what}, expected {expected}")]
    Arity {
        node: NodeId,
        kind: OpKind,
        what: &'static str,
        expected: String,
        found: usize,
    },
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("graph json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// Ordered DAG of nodes over arena-allocated values.
///
/// `nodes` is kept in topological order; every pass that inserts nodes does so
/// in front of the first consumer of the new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub values: Vec<ValueData>,
    pub nodes: Vec<Node>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    next_node: u32,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_node: 0,
        }
    }

    /// Allocates a value with no producer.
    pub fn new_value(&mut self, ty: ValueType, name: Option<String>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, name });
        id
    }

    pub fn add_input(&mut self, ty: ValueType, name: impl Into<String>) -> ValueId {
        let id = self.new_value(ty, Some(name.into()));
        self.inputs.push(id);
        id
    }

    /// Appends a node producing fresh values of `output_types`.
    pub fn add_node(
        &mut self,
        kind: OpKind,
        inputs: Vec<ValueId>,
        output_types: Vec<ValueType>,
        attrs: BTreeMap<String, Attr>,
    ) -> NodeId {
        let position = self.nodes.len();
        self.insert_node(position, kind, inputs, output_types, attrs, None)
    }

    /// Inserts a node at `position` in the node order.
    pub fn insert_node(
        &mut self,
        position: usize,
        kind: OpKind,
        inputs: Vec<ValueId>,
        output_types: Vec<ValueType>,
        attrs: BTreeMap<String, Attr>,
        scope: Option<String>,
    ) -> NodeId {
        let outputs = output_types
            .into_iter()
            .map(|ty| self.new_value(ty, None))
            .collect();
        let id = self.fresh_node_id();
        self.nodes.insert(
            position.min(self.nodes.len()),
            Node {
                id,
                kind,
                inputs,
                outputs,
                attrs,
                scope,
            },
        );
        id
    }

    /// Appends a node whose outputs were allocated by the caller.
    pub fn push_node(&mut self, mut node: Node) -> NodeId {
        node.id = self.fresh_node_id();
        let id = node.id;
        self.nodes.push(node);
        id
    }

    fn fresh_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueData> {
        self.values.get(id.0 as usize)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value(id).map(|value| &value.ty)
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: ValueType) {
        if let Some(value) = self.values.get_mut(id.0 as usize) {
            value.ty = ty;
        }
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    /// Returns the node producing `value`, if any.
    pub fn producer(&self, value: ValueId) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.outputs.contains(&value))
    }

    /// Rewrites every read of `old` (including graph outputs) to `new`.
    /// Returns the number of rewritten uses.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut replaced = 0usize;
        for node in &mut self.nodes {
            for input in node.inputs.iter_mut().filter(|input| **input == old) {
                *input = new;
                replaced += 1;
            }
        }
        for output in self.outputs.iter_mut().filter(|output| **output == old) {
            *output = new;
            replaced += 1;
        }
        replaced
    }

    /// Drops the listed nodes; their output values stay in the arena unproduced.
    pub fn remove_nodes(&mut self, ids: &HashSet<NodeId>) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|node| !ids.contains(&node.id));
        before - self.nodes.len()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Checks definition-before-use, single definition, defined outputs and
    /// the operand/result arity of known kinds.
    pub fn verify(&self) -> Result<(), StructuralError> {
        GraphIndex::build(self)?;
        for node in &self.nodes {
            if let Some(expected) = input_arity(node.kind) {
                check_arity(node, "inputs", node.inputs.len(), expected)?;
            }
            if let Some(expected) = output_arity(node.kind) {
                check_arity(node, "outputs", node.outputs.len(), expected)?;
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, GraphSerdeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and structurally verifies a JSON graph.
    pub fn from_json(text: &str) -> Result<Graph, GraphSerdeError> {
        let graph: Graph = serde_json::from_str(text)?;
        graph.verify()?;
        Ok(graph)
    }
}

fn check_arity(
    node: &Node,
    what: &'static str,
    found: usize,
    expected: RangeInclusive<usize>,
) -> Result<(), StructuralError> {
    if expected.contains(&found) {
        return Ok(());
    }
    let expected = if expected.start() == expected.end() {
        expected.start().to_string()
    } else {
        format!("{}..={}", expected.start(), expected.end())
    };
    Err(StructuralError::Arity {
        node: node.id,
        kind: node.kind,
        what,
        expected,
        found,
    })
}

fn input_arity(kind: OpKind) -> Option<RangeInclusive<usize>> {
    use OpKind::*;
    let range = match kind {
        Constant => 0..=0,
        Relu | Sigmoid | Tanh | Silu | Neg | Abs | Exp | Log | Sqrt | Erf => 1..=1,
        Prelu | Matmul => 2..=2,
        Linear => 2..=3,
        Mul | Div | Pow | Maximum | Minimum => 1..=2,
        Add | Sub => 1..=3,
        If | Loop | Print | EngineCall => return None,
        other => {
            let tensors = other.tensor_operand_count()?;
            tensors..=tensors + other.attribute_operands().len()
        }
    };
    Some(range)
}

fn output_arity(kind: OpKind) -> Option<RangeInclusive<usize>> {
    match kind {
        OpKind::Print => Some(0..=0),
        OpKind::If | OpKind::Loop | OpKind::EngineCall => None,
        _ => Some(1..=1),
    }
}
