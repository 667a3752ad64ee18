use crate::ir::{Attr, Graph, Node, OpKind};
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

/// Materializes default attributes so converters never guess.
///
/// Nodes that still carry attribute operands are skipped; folding has to
/// happen first.
#[derive(Default)]
pub struct NormalizeDefaultsPass;

impl NormalizeDefaultsPass {
    const NAME: &'static str = "normalize-defaults";
}

impl GraphPass for NormalizeDefaultsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let ranks: Vec<Option<usize>> = graph
            .nodes
            .iter()
            .map(|node| {
                node.inputs
                    .first()
                    .and_then(|input| graph.value_type(*input))
                    .and_then(|ty| ty.as_tensor())
                    .and_then(|tensor| tensor.rank())
            })
            .collect();

        let mut rewritten = 0usize;
        for (node, rank) in graph.nodes.iter_mut().zip(ranks) {
            if !attributes_folded(node) {
                continue;
            }
            let mut changed = false;
            for (name, value) in defaults(node.kind) {
                if !node.attrs.contains_key(*name) {
                    node.attrs.insert((*name).to_string(), value.clone());
                    changed = true;
                }
            }
            if node.kind == OpKind::Gelu && !node.attrs.contains_key("approximate") {
                node.attrs
                    .insert("approximate".to_string(), Attr::Str("none".to_string()));
                changed = true;
            }
            if node.kind == OpKind::Softmax {
                changed |= normalize_axis(node, "dim", rank);
            }
            if matches!(node.kind, OpKind::Cumsum | OpKind::Transpose) {
                for name in ["dim", "dim0", "dim1"] {
                    changed |= normalize_axis(node, name, rank);
                }
            }
            if changed {
                rewritten += 1;
            }
        }
        Ok(PassResult::rewrites(rewritten))
    }
}

fn attributes_folded(node: &Node) -> bool {
    match node.kind.tensor_operand_count() {
        Some(count) => node.inputs.len() <= count,
        None => true,
    }
}

fn defaults(kind: OpKind) -> &'static [(&'static str, Attr)] {
    const LEAKY_RELU: &[(&str, Attr)] = &[("negative_slope", Attr::Float(0.01))];
    const ELU: &[(&str, Attr)] = &[
        ("alpha", Attr::Float(1.0)),
        ("scale", Attr::Float(1.0)),
        ("input_scale", Attr::Float(1.0)),
    ];
    const HARDTANH: &[(&str, Attr)] = &[("min_val", Attr::Float(-1.0)), ("max_val", Attr::Float(1.0))];
    const ALPHA: &[(&str, Attr)] = &[("alpha", Attr::Int(1))];
    const FLATTEN: &[(&str, Attr)] = &[("start_dim", Attr::Int(0)), ("end_dim", Attr::Int(-1))];
    const REDUCE: &[(&str, Attr)] = &[("keepdim", Attr::Bool(false))];
    const DROPOUT: &[(&str, Attr)] = &[("p", Attr::Float(0.5)), ("train", Attr::Bool(false))];
    const PAD: &[(&str, Attr)] = &[("value", Attr::Float(0.0))];
    const CLAMP: &[(&str, Attr)] = &[("min", Attr::None), ("max", Attr::None)];

    match kind {
        OpKind::LeakyRelu => LEAKY_RELU,
        OpKind::Elu => ELU,
        OpKind::Hardtanh => HARDTANH,
        OpKind::Add | OpKind::Sub => ALPHA,
        OpKind::Flatten => FLATTEN,
        OpKind::Sum | OpKind::Mean => REDUCE,
        OpKind::Dropout => DROPOUT,
        OpKind::ConstantPadNd => PAD,
        OpKind::Clamp => CLAMP,
        _ => &[],
    }
}

fn normalize_axis(node: &mut Node, name: &str, rank: Option<usize>) -> bool {
    let (Some(rank), Some(dim)) = (rank, node.int_attr(name)) else {
        return false;
    };
    if dim >= 0 {
        return false;
    }
    let normalized = dim + rank as i64;
    if normalized < 0 {
        return false;
    }
    node.attrs.insert(name.to_string(), Attr::Int(normalized));
    true
}
