mod activation;
mod constant;
mod elementwise;
mod linalg;
mod shape;

use super::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, DType, Graph, Node, TensorType, ValueType};

pub(super) fn register_all(registry: &mut ConverterRegistry) {
    activation::register(registry);
    elementwise::register(registry);
    linalg::register(registry);
    shape::register(registry);
    constant::register(registry);
}

fn operand_type<'g>(graph: &'g Graph, node: &Node, index: usize) -> Option<&'g TensorType> {
    node.inputs
        .get(index)
        .and_then(|value| graph.value_type(*value))
        .and_then(ValueType::as_tensor)
}

/// Exactly `count` operands, all tensors, and one tensor result.
fn tensor_operands(graph: &Graph, node: &Node, count: usize) -> Support {
    if node.inputs.len() != count {
        return Support::unsupported(format!(
            "expected {count} tensor operand(s), found {} operands; attribute operands must be constant",
            node.inputs.len()
        ));
    }
    for (index, value) in node.inputs.iter().enumerate() {
        if !graph.value_type(*value).is_some_and(ValueType::is_tensor) {
            return Support::unsupported(format!("operand {index} is not a tensor"));
        }
    }
    if !node
        .outputs
        .iter()
        .all(|value| graph.value_type(*value).is_some_and(ValueType::is_tensor))
    {
        return Support::unsupported("result is not a tensor");
    }
    Support::Supported
}

/// Operand `index` is a floating tensor; unknown dtypes are checked at build time.
fn float_operand(graph: &Graph, node: &Node, index: usize) -> Support {
    match operand_type(graph, node, index).and_then(|ty| ty.dtype) {
        Some(dtype) if !dtype.is_float() => {
            Support::unsupported(format!("operand {index} has non-floating dtype {dtype}"))
        }
        _ => Support::Supported,
    }
}

fn float_attr(node: &Node, name: &str) -> Support {
    match node.attr(name).and_then(Attr::as_float) {
        Some(_) => Support::Supported,
        None => Support::unsupported(format!("`{name}` is not a constant number")),
    }
}

fn ints_attr(node: &Node, name: &str) -> Support {
    match node.attr(name) {
        Some(Attr::Ints(_)) => Support::Supported,
        _ => Support::unsupported(format!("`{name}` is not a constant int list")),
    }
}

fn read_float(ctx: &ConversionCtx<'_>, node: &Node, name: &str) -> ConversionResult<f64> {
    node.attr(name)
        .and_then(Attr::as_float)
        .ok_or_else(|| ctx.fail(format!("missing numeric attribute `{name}`")))
}

fn read_ints<'n>(ctx: &ConversionCtx<'_>, node: &'n Node, name: &str) -> ConversionResult<&'n [i64]> {
    node.ints_attr(name)
        .ok_or_else(|| ctx.fail(format!("missing int list attribute `{name}`")))
}

/// Resolves a possibly negative axis against `rank`.
fn resolve_axis(ctx: &ConversionCtx<'_>, axis: i64, rank: usize) -> ConversionResult<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved as usize >= rank.max(1) {
        return Err(ctx.fail(format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(resolved as usize)
}

fn ensure_float(ctx: &ConversionCtx<'_>, dtype: DType) -> ConversionResult<()> {
    if dtype.is_float() {
        Ok(())
    } else {
        Err(ctx.fail(format!("expected a floating tensor, found {dtype}")))
    }
}
