use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use super::graph::{Graph, NodeId, StructuralError, ValueId};

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefSite {
    /// Graph input at the given index.
    Input { index: u32 },
    /// Node output at the given result slot.
    Node { node: NodeId, slot: u32 },
}

/// Structural indices over a graph, built after validating SSA invariants.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    pub pos_of: HashMap<NodeId, usize>,
    pub def_of: HashMap<ValueId, DefSite>,
    pub users: HashMap<ValueId, SmallVec<[NodeId; 4]>>,
    outputs: HashSet<ValueId>,
}

impl GraphIndex {
    /// Builds indices for `graph`, rejecting reads before definition,
    /// redefinitions and undefined graph outputs.
    pub fn build(graph: &Graph) -> Result<Self, StructuralError> {
        let arena = graph.values.len() as u32;
        let known = |value: ValueId| -> Result<(), StructuralError> {
            if value.0 < arena {
                Ok(())
            } else {
                Err(StructuralError::UnknownValue { value })
            }
        };

        let mut def_of: HashMap<ValueId, DefSite> = HashMap::new();
        let mut pos_of = HashMap::with_capacity(graph.nodes.len());
        let mut users: HashMap<ValueId, SmallVec<[NodeId; 4]>> = HashMap::new();

        for (index, input) in graph.inputs.iter().enumerate() {
            known(*input)?;
            let site = DefSite::Input {
                index: index as u32,
            };
            if def_of.insert(*input, site).is_some() {
                return Err(StructuralError::Redefined { value: *input });
            }
        }

        for (position, node) in graph.nodes.iter().enumerate() {
            if pos_of.insert(node.id, position).is_some() {
                return Err(StructuralError::DuplicateNode { node: node.id });
            }
            for input in &node.inputs {
                known(*input)?;
                if !def_of.contains_key(input) {
                    return Err(StructuralError::UndefinedOperand {
                        node: node.id,
                        kind: node.kind,
                        value: *input,
                    });
                }
                let entry = users.entry(*input).or_default();
                if !entry.contains(&node.id) {
                    entry.push(node.id);
                }
            }
            for (slot, output) in node.outputs.iter().enumerate() {
                known(*output)?;
                let site = DefSite::Node {
                    node: node.id,
                    slot: slot as u32,
                };
                if def_of.insert(*output, site).is_some() {
                    return Err(StructuralError::Redefined { value: *output });
                }
            }
        }

        for output in &graph.outputs {
            if !def_of.contains_key(output) {
                return Err(StructuralError::UndefinedOutput { value: *output });
            }
        }

        Ok(GraphIndex {
            pos_of,
            def_of,
            users,
            outputs: graph.outputs.iter().copied().collect(),
        })
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.pos_of.get(&node).copied()
    }

    /// Node producing `value`, `None` for graph inputs.
    pub fn producer(&self, value: ValueId) -> Option<NodeId> {
        match self.def_of.get(&value)? {
            DefSite::Node { node, .. } => Some(*node),
            DefSite::Input { .. } => None,
        }
    }

    pub fn is_graph_input(&self, value: ValueId) -> bool {
        matches!(self.def_of.get(&value), Some(DefSite::Input { .. }))
    }

    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    /// Consumers of `value` in node order.
    pub fn users(&self, value: ValueId) -> &[NodeId] {
        self.users.get(&value).map(|users| users.as_slice()).unwrap_or(&[])
    }

    /// Returns `true` when nothing reads `value`, graph outputs included.
    pub fn is_dead(&self, value: ValueId) -> bool {
        self.users(value).is_empty() && !self.is_graph_output(value)
    }
}
