mod dce;
mod decompose;
mod fold_attributes;
mod identities;
mod normalize;
mod verify;

pub use dce::DeadCodeEliminationPass;
pub use decompose::{DecomposeGeluPass, DecomposeLinearPass, DecomposeSiluPass};
pub use fold_attributes::FoldConstantAttributesPass;
pub use identities::EliminateIdentitiesPass;
pub use normalize::NormalizeDefaultsPass;
pub use verify::VerifyPass;

use std::collections::BTreeMap;

use crate::ir::{Attr, Graph, NodeId, OpKind, TensorType, ValueId, ValueType};

/// Returns the payload of a non-tensor `prim::Constant` producing `value`.
pub(crate) fn scalar_constant(graph: &Graph, value: ValueId) -> Option<&Attr> {
    let producer = graph.producer(value)?;
    if producer.kind != OpKind::Constant {
        return None;
    }
    if graph.value_type(value).is_some_and(ValueType::is_tensor) {
        return None;
    }
    producer.attr("value")
}

pub(crate) fn type_of(graph: &Graph, value: ValueId) -> ValueType {
    graph
        .value_type(value)
        .cloned()
        .unwrap_or(ValueType::Tensor(TensorType::unknown()))
}

/// Inserts nodes in front of a node being expanded, keeping its scope.
pub(crate) struct Expansion<'g> {
    graph: &'g mut Graph,
    position: usize,
    scope: Option<String>,
}

impl<'g> Expansion<'g> {
    pub(crate) fn before(graph: &'g mut Graph, node: NodeId) -> Option<Self> {
        let position = graph.position(node)?;
        let scope = graph.nodes[position].scope.clone();
        Some(Self {
            graph,
            position,
            scope,
        })
    }

    pub(crate) fn emit(
        &mut self,
        kind: OpKind,
        inputs: Vec<ValueId>,
        ty: ValueType,
        attrs: BTreeMap<String, Attr>,
    ) -> ValueId {
        let id = self.graph.insert_node(
            self.position,
            kind,
            inputs,
            vec![ty],
            attrs,
            self.scope.clone(),
        );
        self.position += 1;
        let node = self
            .graph
            .node(id)
            .unwrap_or_else(|| unreachable!("node {id} was just inserted"));
        node.outputs[0]
    }

    /// Elementwise op with a folded scalar `other`.
    pub(crate) fn scalar(&mut self, kind: OpKind, input: ValueId, other: f64, ty: ValueType) -> ValueId {
        let mut attrs = BTreeMap::from([("other".to_string(), Attr::Float(other))]);
        if matches!(kind, OpKind::Add | OpKind::Sub) {
            attrs.insert("alpha".to_string(), Attr::Int(1));
        }
        self.emit(kind, vec![input], ty, attrs)
    }
}

/// Replaces `old`'s uses with `new` and drops the node that produced `old`.
pub(crate) fn retire_node(graph: &mut Graph, node: NodeId, old: ValueId, new: ValueId) {
    graph.replace_all_uses(old, new);
    graph.nodes.retain(|candidate| candidate.id != node);
}
