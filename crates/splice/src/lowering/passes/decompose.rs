use std::collections::BTreeMap;
use std::f64::consts::{FRAC_1_SQRT_2, FRAC_2_PI};

use crate::ir::{Attr, Graph, Node, NodeId, OpKind, TensorType, ValueType};
use crate::lowering::passes::{retire_node, type_of, Expansion};
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

const GELU_TANH_COEFF: f64 = 0.044715;

fn nodes_of_kind(graph: &Graph, kind: OpKind) -> Vec<NodeId> {
    graph
        .nodes
        .iter()
        .filter(|node| node.kind == kind)
        .map(|node| node.id)
        .collect()
}

fn snapshot(graph: &Graph, id: NodeId) -> Option<Node> {
    graph.node(id).cloned()
}

/// `linear(x, w, b)` becomes `matmul(x, permute(w)) + b`.
#[derive(Default)]
pub struct DecomposeLinearPass;

impl DecomposeLinearPass {
    const NAME: &'static str = "decompose-linear";
}

impl GraphPass for DecomposeLinearPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let mut rewritten = 0usize;
        for id in nodes_of_kind(graph, OpKind::Linear) {
            let Some(node) = snapshot(graph, id) else {
                continue;
            };
            let operands_are_tensors = node
                .inputs
                .iter()
                .all(|input| graph.value_type(*input).is_some_and(ValueType::is_tensor));
            if !operands_are_tensors {
                continue;
            }
            let weight_rank = graph
                .value_type(node.inputs[1])
                .and_then(ValueType::as_tensor)
                .and_then(TensorType::rank);
            if weight_rank.is_some_and(|rank| rank != 2) {
                return Err(LoweringError::UnexpectedNode {
                    pass: Self::NAME,
                    node: node.id,
                    kind: node.kind,
                    message: format!("weight must be rank 2, found rank {}", weight_rank.unwrap_or(0)),
                });
            }

            let out = node.outputs[0];
            let out_ty = type_of(graph, out);
            let weight_ty = transposed_type(&type_of(graph, node.inputs[1]));
            let Some(mut expansion) = Expansion::before(graph, id) else {
                continue;
            };
            let perm = BTreeMap::from([("dims".to_string(), Attr::Ints(vec![1, 0]))]);
            let weight_t = expansion.emit(OpKind::Permute, vec![node.inputs[1]], weight_ty, perm);
            let mut result = expansion.emit(
                OpKind::Matmul,
                vec![node.inputs[0], weight_t],
                out_ty.clone(),
                BTreeMap::new(),
            );
            if let Some(bias) = node.inputs.get(2) {
                let alpha = BTreeMap::from([("alpha".to_string(), Attr::Int(1))]);
                result = expansion.emit(OpKind::Add, vec![result, *bias], out_ty, alpha);
            }
            retire_node(graph, id, out, result);
            rewritten += 1;
        }
        Ok(PassResult::rewrites(rewritten))
    }
}

fn transposed_type(ty: &ValueType) -> ValueType {
    match ty {
        ValueType::Tensor(tensor) => ValueType::Tensor(TensorType {
            dtype: tensor.dtype,
            shape: tensor
                .shape
                .as_ref()
                .map(|dims| dims.iter().rev().copied().collect()),
        }),
        other => other.clone(),
    }
}

/// `silu(x)` becomes `x * sigmoid(x)`.
#[derive(Default)]
pub struct DecomposeSiluPass;

impl DecomposeSiluPass {
    const NAME: &'static str = "decompose-silu";
}

impl GraphPass for DecomposeSiluPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let mut rewritten = 0usize;
        for id in nodes_of_kind(graph, OpKind::Silu) {
            let Some(node) = snapshot(graph, id) else {
                continue;
            };
            let x = node.inputs[0];
            let out = node.outputs[0];
            let x_ty = type_of(graph, x);
            let out_ty = type_of(graph, out);
            let Some(mut expansion) = Expansion::before(graph, id) else {
                continue;
            };
            let gate = expansion.emit(OpKind::Sigmoid, vec![x], x_ty, BTreeMap::new());
            let result = expansion.emit(OpKind::Mul, vec![x, gate], out_ty, BTreeMap::new());
            retire_node(graph, id, out, result);
            rewritten += 1;
        }
        Ok(PassResult::rewrites(rewritten))
    }
}

/// Expands `gelu` into elementwise arithmetic.
///
/// Exact gelu becomes `0.5·x·(1 + erf(x/√2))`. The tanh form
/// `0.5·x·(1 + tanh(√(2/π)·(x + 0.044715·x³)))` is used for
/// `approximate="tanh"`, and for exact gelu only when
/// [`LoweringOptions::approximate_gelu`](crate::lowering::LoweringOptions) is set.
#[derive(Default)]
pub struct DecomposeGeluPass;

impl DecomposeGeluPass {
    const NAME: &'static str = "decompose-gelu";
}

impl GraphPass for DecomposeGeluPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let mut rewritten = 0usize;
        for id in nodes_of_kind(graph, OpKind::Gelu) {
            let Some(node) = snapshot(graph, id) else {
                continue;
            };
            if node.inputs.len() != 1 {
                continue;
            }
            let use_tanh = match node.attr("approximate").and_then(Attr::as_str) {
                Some("none") => cx.options.approximate_gelu,
                Some("tanh") => true,
                None => continue,
                Some(other) => {
                    return Err(LoweringError::UnexpectedNode {
                        pass: Self::NAME,
                        node: node.id,
                        kind: node.kind,
                        message: format!("unknown gelu approximation `{other}`"),
                    })
                }
            };

            let x = node.inputs[0];
            let out = node.outputs[0];
            let ty = type_of(graph, x);
            let out_ty = type_of(graph, out);
            let Some(mut e) = Expansion::before(graph, id) else {
                continue;
            };
            let inner = if use_tanh {
                let cube = e.scalar(OpKind::Pow, x, 3.0, ty.clone());
                let scaled = e.scalar(OpKind::Mul, cube, GELU_TANH_COEFF, ty.clone());
                let alpha = BTreeMap::from([("alpha".to_string(), Attr::Int(1))]);
                let sum = e.emit(OpKind::Add, vec![x, scaled], ty.clone(), alpha);
                let arg = e.scalar(OpKind::Mul, sum, FRAC_2_PI.sqrt(), ty.clone());
                e.emit(OpKind::Tanh, vec![arg], ty.clone(), BTreeMap::new())
            } else {
                let arg = e.scalar(OpKind::Mul, x, FRAC_1_SQRT_2, ty.clone());
                e.emit(OpKind::Erf, vec![arg], ty.clone(), BTreeMap::new())
            };
            let shifted = e.scalar(OpKind::Add, inner, 1.0, ty.clone());
            let half = e.scalar(OpKind::Mul, x, 0.5, ty);
            let result = e.emit(OpKind::Mul, vec![half, shifted], out_ty, BTreeMap::new());
            retire_node(graph, id, out, result);
            rewritten += 1;
        }
        Ok(PassResult::rewrites(rewritten))
    }
}
