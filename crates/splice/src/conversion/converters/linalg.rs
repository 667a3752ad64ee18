use super::{ensure_float, float_operand, operand_type, resolve_axis, tensor_operands};
use crate::backend::{ElementWiseKind, LayerKind, ReduceKind, TensorRef};
use crate::conversion::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, Graph, Node, OpKind};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(OpKind::Matmul, support_matmul, convert_matmul);
    registry.register(OpKind::Linear, support_linear, convert_linear);
    registry.register(OpKind::Softmax, support_softmax, convert_softmax);
    registry.register(OpKind::Sum, support_reduce, convert_reduce);
    registry.register(OpKind::Mean, support_reduce, convert_reduce);
}

/// Known ranks below two use vector semantics the matrix layer lacks.
fn at_least_matrix(graph: &Graph, node: &Node, index: usize) -> Support {
    match operand_type(graph, node, index).and_then(|ty| ty.rank()) {
        Some(rank) if rank < 2 => {
            Support::unsupported(format!("operand {index} has rank {rank}, matmul needs rank >= 2"))
        }
        _ => Support::Supported,
    }
}

fn support_matmul(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 2)
        .and_then(|| float_operand(graph, node, 0))
        .and_then(|| float_operand(graph, node, 1))
        .and_then(|| at_least_matrix(graph, node, 0))
        .and_then(|| at_least_matrix(graph, node, 1))
}

fn convert_matmul(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let lhs = ctx.input(node, 0)?;
    let rhs = ctx.input(node, 1)?;
    for tensor in [lhs, rhs] {
        let desc = ctx.desc(tensor)?;
        ensure_float(ctx, desc.dtype)?;
        if desc.rank() < 2 {
            return Err(ctx.fail(format!("matmul operand of rank {}", desc.rank())));
        }
    }
    let output = ctx.add_layer(LayerKind::MatrixMultiply, &[lhs, rhs])?;
    Ok(vec![output])
}

fn support_linear(graph: &Graph, node: &Node) -> Support {
    let count = node.inputs.len();
    if !(2..=3).contains(&count) {
        return Support::unsupported(format!("linear takes 2 or 3 operands, found {count}"));
    }
    tensor_operands(graph, node, count)
        .and_then(|| float_operand(graph, node, 0))
        .and_then(|| match operand_type(graph, node, 1).and_then(|ty| ty.rank()) {
            Some(2) | None => Support::Supported,
            Some(rank) => Support::unsupported(format!("linear weight has rank {rank}")),
        })
}

/// `x @ w^T + b` for graphs where the linear decomposition did not run.
fn convert_linear(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let x = ctx.input(node, 0)?;
    let weight = ctx.input(node, 1)?;
    ensure_float(ctx, ctx.desc(x)?.dtype)?;
    if ctx.desc(weight)?.rank() != 2 {
        return Err(ctx.fail("linear weight must be a matrix"));
    }
    let transposed = ctx.add_layer(
        LayerKind::Shuffle {
            permutation: Some(vec![1, 0]),
            reshape: None,
        },
        &[weight],
    )?;
    let mut output = ctx.add_layer(LayerKind::MatrixMultiply, &[x, transposed])?;
    if node.inputs.len() == 3 {
        let bias = ctx.input(node, 2)?;
        output = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Sum), &[output, bias])?;
    }
    Ok(vec![output])
}

/// An explicit result dtype must match the operand's.
fn same_dtype_request(graph: &Graph, node: &Node) -> Support {
    match node.attr("dtype") {
        None | Some(Attr::None) => Support::Supported,
        Some(Attr::DType(requested)) => {
            match operand_type(graph, node, 0).and_then(|ty| ty.dtype) {
                Some(actual) if actual == *requested => Support::Supported,
                _ => Support::unsupported(format!("result dtype {requested} differs from operand")),
            }
        }
        Some(_) => Support::unsupported("`dtype` is not a constant dtype"),
    }
}

fn support_softmax(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
        .and_then(|| float_operand(graph, node, 0))
        .and_then(|| match node.int_attr("dim") {
            Some(_) => Support::Supported,
            None => Support::unsupported("softmax `dim` is not a constant int"),
        })
        .and_then(|| same_dtype_request(graph, node))
}

fn convert_softmax(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let desc = ctx.desc(input)?;
    ensure_float(ctx, desc.dtype)?;
    let dim = node
        .int_attr("dim")
        .ok_or_else(|| ctx.fail("missing softmax `dim`"))?;
    let axis = resolve_axis(ctx, dim, desc.rank())?;
    let output = ctx.add_layer(LayerKind::SoftMax { axis }, &[input])?;
    Ok(vec![output])
}

fn reduce_axes(node: &Node) -> Option<Option<Vec<i64>>> {
    match node.attr("dim") {
        None | Some(Attr::None) => Some(None),
        Some(Attr::Int(dim)) => Some(Some(vec![*dim])),
        Some(Attr::Ints(dims)) => Some(Some(dims.clone())),
        Some(_) => None,
    }
}

fn support_reduce(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
        .and_then(|| match node.kind {
            OpKind::Mean => float_operand(graph, node, 0),
            _ => Support::Supported,
        })
        .and_then(|| match reduce_axes(node) {
            Some(_) => Support::Supported,
            None => Support::unsupported("reduction `dim` is not a constant int list"),
        })
        .and_then(|| match node.attr("keepdim") {
            None | Some(Attr::Bool(_)) => Support::Supported,
            Some(_) => Support::unsupported("`keepdim` is not a constant bool"),
        })
        .and_then(|| same_dtype_request(graph, node))
}

fn convert_reduce(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let op = match node.kind {
        OpKind::Mean => ReduceKind::Mean,
        _ => ReduceKind::Sum,
    };
    let input = ctx.input(node, 0)?;
    let desc = ctx.desc(input)?;
    if op == ReduceKind::Mean {
        ensure_float(ctx, desc.dtype)?;
    }
    let requested = reduce_axes(node).ok_or_else(|| ctx.fail("malformed reduction `dim`"))?;
    let mut axes = match requested {
        Some(dims) => dims
            .iter()
            .map(|dim| resolve_axis(ctx, *dim, desc.rank()))
            .collect::<ConversionResult<Vec<usize>>>()?,
        None => (0..desc.rank()).collect(),
    };
    axes.sort_unstable();
    axes.dedup();
    let keep_dims = node
        .attr("keepdim")
        .and_then(Attr::as_bool)
        .unwrap_or(false);
    let output = ctx.add_layer(
        LayerKind::Reduce {
            op,
            axes,
            keep_dims,
        },
        &[input],
    )?;
    Ok(vec![output])
}
