use super::{float_operand, operand_type, tensor_operands};
use crate::backend::{ActivationKind, ElementWiseKind, LayerKind, TensorRef, UnaryKind};
use crate::conversion::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, Graph, Node, OpKind, ValueType};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(OpKind::Add, support_binary, convert_binary);
    registry.register(OpKind::Sub, support_binary, convert_binary);
    registry.register(OpKind::Mul, support_binary, convert_binary);
    registry.register(OpKind::Div, support_binary, convert_binary);
    registry.register(OpKind::Pow, support_binary, convert_binary);
    registry.register(OpKind::Maximum, support_binary, convert_binary);
    registry.register(OpKind::Minimum, support_binary, convert_binary);
    registry.register(OpKind::Neg, support_unary, convert_unary);
    registry.register(OpKind::Abs, support_unary, convert_unary);
    registry.register(OpKind::Exp, support_unary_float, convert_unary);
    registry.register(OpKind::Log, support_unary_float, convert_unary);
    registry.register(OpKind::Sqrt, support_unary_float, convert_unary);
    registry.register(OpKind::Erf, support_unary_float, convert_unary);
    registry.register(OpKind::Clamp, support_clamp, convert_clamp);
}

fn elementwise_kind(kind: OpKind) -> Option<ElementWiseKind> {
    let op = match kind {
        OpKind::Add => ElementWiseKind::Sum,
        OpKind::Sub => ElementWiseKind::Sub,
        OpKind::Mul => ElementWiseKind::Prod,
        OpKind::Div => ElementWiseKind::Div,
        OpKind::Pow => ElementWiseKind::Pow,
        OpKind::Maximum => ElementWiseKind::Max,
        OpKind::Minimum => ElementWiseKind::Min,
        _ => return None,
    };
    Some(op)
}

fn unary_kind(kind: OpKind) -> Option<UnaryKind> {
    let op = match kind {
        OpKind::Neg => UnaryKind::Neg,
        OpKind::Abs => UnaryKind::Abs,
        OpKind::Exp => UnaryKind::Exp,
        OpKind::Log => UnaryKind::Log,
        OpKind::Sqrt => UnaryKind::Sqrt,
        OpKind::Erf => UnaryKind::Erf,
        _ => return None,
    };
    Some(op)
}

fn support_binary(graph: &Graph, node: &Node) -> Support {
    let operands = match node.inputs.len() {
        1 if node.attr("other").and_then(Attr::as_float).is_some() => {
            tensor_operands(graph, node, 1)
        }
        1 => Support::unsupported("scalar `other` is not a constant number"),
        2 => tensor_operands(graph, node, 2),
        _ => Support::unsupported(
            "expected two tensor operands; a non-constant alpha blocks conversion",
        ),
    };
    operands
        .and_then(|| {
            if !matches!(node.kind, OpKind::Add | OpKind::Sub) {
                return Support::Supported;
            }
            match node.attr("alpha") {
                None => Support::Supported,
                Some(attr) if attr.as_float().is_some() => Support::Supported,
                Some(_) => Support::unsupported("`alpha` is not a constant number"),
            }
        })
        .and_then(|| {
            let lhs = operand_type(graph, node, 0).and_then(|ty| ty.dtype);
            let rhs = operand_type(graph, node, 1).and_then(|ty| ty.dtype);
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) if lhs != rhs => {
                    Support::unsupported(format!("mixed operand dtypes {lhs} and {rhs}"))
                }
                _ => Support::Supported,
            }
        })
        .and_then(|| integer_promotion(graph, node))
}

/// Integer arithmetic the interpreter promotes to float has no engine
/// counterpart: engine layers keep the operand dtype.
fn integer_promotion(graph: &Graph, node: &Node) -> Support {
    let Some(dtype) = operand_type(graph, node, 0).and_then(|ty| ty.dtype) else {
        return Support::Supported;
    };
    if !dtype.is_float() {
        if node.kind == OpKind::Div {
            return Support::unsupported(format!("{dtype} division produces a float result"));
        }
        for name in ["other", "alpha"] {
            if let Some(value) = node.float_attr(name).filter(|value| value.fract() != 0.0) {
                return Support::unsupported(format!("fractional `{name}` {value} on a {dtype} tensor"));
            }
        }
    }
    let result = node
        .outputs
        .first()
        .and_then(|value| graph.value_type(*value))
        .and_then(ValueType::as_tensor)
        .and_then(|ty| ty.dtype);
    match result {
        Some(result) if result != dtype => {
            Support::unsupported(format!("{dtype} operands declare a {result} result"))
        }
        _ => Support::Supported,
    }
}

fn convert_binary(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let op = elementwise_kind(node.kind)
        .ok_or_else(|| ctx.fail("not an elementwise binary op"))?;
    let lhs = ctx.input(node, 0)?;
    let lhs_desc = ctx.desc(lhs)?;
    let mut rhs = if node.inputs.len() == 2 {
        ctx.input(node, 1)?
    } else {
        let other = node
            .float_attr("other")
            .ok_or_else(|| ctx.fail("missing scalar `other`"))?;
        ctx.broadcast_scalar(other, &lhs_desc)?
    };
    let rhs_dtype = ctx.desc(rhs)?.dtype;
    if rhs_dtype != lhs_desc.dtype {
        return Err(ctx.fail(format!(
            "operand dtypes differ: {} and {rhs_dtype}",
            lhs_desc.dtype
        )));
    }
    let alpha = node.float_attr("alpha").unwrap_or(1.0);
    if alpha != 1.0 {
        let factor = ctx.broadcast_scalar(alpha, &lhs_desc)?;
        rhs = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Prod), &[rhs, factor])?;
    }
    let output = ctx.add_layer(LayerKind::ElementWise(op), &[lhs, rhs])?;
    Ok(vec![output])
}

fn support_unary(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
}

fn support_unary_float(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| float_operand(graph, node, 0))
}

fn convert_unary(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let op = unary_kind(node.kind).ok_or_else(|| ctx.fail("not a unary op"))?;
    let input = ctx.input(node, 0)?;
    let output = ctx.add_layer(LayerKind::Unary(op), &[input])?;
    Ok(vec![output])
}

fn bound(node: &Node, name: &str) -> Option<Option<f64>> {
    match node.attr(name) {
        None | Some(Attr::None) => Some(None),
        Some(attr) => attr.as_float().map(Some),
    }
}

fn support_clamp(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| match (bound(node, "min"), bound(node, "max")) {
        (Some(None), Some(None)) => Support::unsupported("clamp without bounds"),
        (Some(_), Some(_)) => Support::Supported,
        _ => Support::unsupported("clamp bounds are not constant numbers"),
    })
}

fn convert_clamp(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let desc = ctx.desc(input)?;
    let min = bound(node, "min").flatten();
    let max = bound(node, "max").flatten();
    let output = match (min, max) {
        (Some(min), Some(max)) if desc.dtype.is_float() => {
            ctx.add_layer(LayerKind::Activation(ActivationKind::Clip { min, max }), &[input])?
        }
        (min, max) => {
            let mut current = input;
            if let Some(min) = min {
                let floor = ctx.broadcast_scalar(min, &desc)?;
                current =
                    ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Max), &[current, floor])?;
            }
            if let Some(max) = max {
                let ceiling = ctx.broadcast_scalar(max, &desc)?;
                current = ctx
                    .add_layer(LayerKind::ElementWise(ElementWiseKind::Min), &[current, ceiling])?;
            }
            current
        }
    };
    Ok(vec![output])
}
