use crate::ir::{Attr, DType, Graph, NodeId};
use crate::lowering::passes::scalar_constant;
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

/// Moves constant attribute operands (`hardtanh` bounds, `reshape` shapes,
/// scalar `other` operands, ...) into node attributes.
///
/// A node is folded all or nothing: one non-constant attribute operand leaves
/// it untouched.
#[derive(Default)]
pub struct FoldConstantAttributesPass;

impl FoldConstantAttributesPass {
    const NAME: &'static str = "fold-constant-attributes";
}

impl GraphPass for FoldConstantAttributesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let ids: Vec<NodeId> = graph.node_ids();
        let mut folded = 0usize;
        for id in ids {
            if fold_attribute_operands(graph, id) {
                folded += 1;
            }
            if fold_scalar_other(graph, id) {
                folded += 1;
            }
        }
        Ok(PassResult::rewrites(folded))
    }
}

fn fold_attribute_operands(graph: &mut Graph, id: NodeId) -> bool {
    let Some(node) = graph.node(id) else {
        return false;
    };
    let Some(tensor_count) = node.kind.tensor_operand_count() else {
        return false;
    };
    if node.inputs.len() <= tensor_count {
        return false;
    }
    let names = node.kind.attribute_operands();
    let trailing = &node.inputs[tensor_count..];
    if trailing.len() > names.len() {
        return false;
    }

    let mut folded = Vec::with_capacity(trailing.len());
    for (name, value) in names.iter().zip(trailing) {
        let Some(attr) = scalar_constant(graph, *value) else {
            return false;
        };
        folded.push((*name, normalize_attr(name, attr.clone())));
    }

    let Some(node) = graph.node_mut(id) else {
        return false;
    };
    node.inputs.truncate(tensor_count);
    for (name, attr) in folded {
        // `None` for these operands means "not given".
        if attr.is_none() && matches!(name, "dtype" | "dim" | "memory_format") {
            continue;
        }
        node.attrs.insert(name.to_string(), attr);
    }
    true
}

fn fold_scalar_other(graph: &mut Graph, id: NodeId) -> bool {
    let Some(node) = graph.node(id) else {
        return false;
    };
    if !node.kind.accepts_scalar_other() || node.inputs.len() != 2 {
        return false;
    }
    let other = match scalar_constant(graph, node.inputs[1]) {
        Some(attr) => match attr.as_float() {
            Some(value) => value,
            None => return false,
        },
        None => return false,
    };
    let Some(node) = graph.node_mut(id) else {
        return false;
    };
    node.inputs.truncate(1);
    node.attrs.insert("other".to_string(), Attr::Float(other));
    true
}

/// Integer scalar-type codes become dtypes.
fn normalize_attr(name: &str, attr: Attr) -> Attr {
    match (name, attr) {
        ("dtype", Attr::Int(code)) => DType::from_scalar_type_code(code)
            .map(Attr::DType)
            .unwrap_or(Attr::Int(code)),
        (_, attr) => attr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_graph;

    #[test]
    fn non_constant_attribute_operand_blocks_folding() {
        let mut graph = parse_graph(
            r#"
graph g(%x : Float(4), %lo : float):
  %hi : float = prim::Constant[value=1.0]()
  %y : Tensor = aten::hardtanh(%x, %lo, %hi)
  return (%y)
"#,
        )
        .expect("parse");
        let mut cx = LoweringContext::default();
        let result = FoldConstantAttributesPass.run(&mut graph, &mut cx).expect("run");
        assert!(!result.changed);
        assert_eq!(graph.nodes[1].inputs.len(), 3);
    }

    #[test]
    fn dtype_codes_fold_into_dtypes() {
        let mut graph = parse_graph(
            r#"
graph g(%x : Float(4)):
  %code : int = prim::Constant[value=5]()
  %f : bool = prim::Constant[value=false]()
  %y : Tensor = aten::to(%x, %code, %f, %f)
  return (%y)
"#,
        )
        .expect("parse");
        let mut cx = LoweringContext::default();
        FoldConstantAttributesPass.run(&mut graph, &mut cx).expect("run");
        let to = &graph.nodes[2];
        assert_eq!(to.inputs.len(), 1);
        assert_eq!(to.attr("dtype"), Some(&Attr::DType(DType::F16)));
    }
}
