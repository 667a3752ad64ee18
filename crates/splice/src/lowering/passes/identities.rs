use crate::ir::{Attr, Graph, Node, NodeId, OpKind, ValueId};
use crate::lowering::passes::retire_node;
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

/// Drops nodes that are the identity in inference mode: `dropout` with
/// `train=false`, `to` the value's own dtype, and `contiguous`.
#[derive(Default)]
pub struct EliminateIdentitiesPass;

impl EliminateIdentitiesPass {
    const NAME: &'static str = "eliminate-identities";
}

impl GraphPass for EliminateIdentitiesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let identities: Vec<NodeId> = graph
            .nodes
            .iter()
            .filter(|node| is_identity(graph, node))
            .map(|node| node.id)
            .collect();

        // Inputs are re-read per node since retiring one identity rewires the next.
        let mut erased = 0usize;
        for id in identities {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let (output, input): (ValueId, ValueId) = (node.outputs[0], node.inputs[0]);
            retire_node(graph, id, output, input);
            erased += 1;
        }
        Ok(PassResult::erased(erased))
    }
}

fn is_identity(graph: &Graph, node: &Node) -> bool {
    if node.inputs.len() != 1 || node.outputs.len() != 1 {
        return false;
    }
    match node.kind {
        OpKind::Dropout => node.attr("train").and_then(Attr::as_bool) == Some(false),
        OpKind::Contiguous => true,
        OpKind::To => {
            if node.attr("copy").and_then(Attr::as_bool) == Some(true) {
                return false;
            }
            let target = node.attr("dtype").and_then(Attr::as_dtype);
            let source = graph.value_type(node.inputs[0]).and_then(|ty| ty.dtype());
            target.is_some() && target == source
        }
        _ => false,
    }
}
