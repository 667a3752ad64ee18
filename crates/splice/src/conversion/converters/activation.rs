use std::f64::consts::{FRAC_1_SQRT_2, FRAC_2_PI};

use super::{ensure_float, float_attr, float_operand, read_float, tensor_operands};
use crate::backend::{ActivationKind, ElementWiseKind, LayerKind, TensorDesc, TensorRef, UnaryKind};
use crate::conversion::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, Graph, Node, OpKind};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(OpKind::Relu, unary_float, convert_relu);
    registry.register(OpKind::Sigmoid, unary_float, convert_sigmoid);
    registry.register(OpKind::Tanh, unary_float, convert_tanh);
    registry.register(OpKind::Hardtanh, support_hardtanh, convert_hardtanh);
    registry.register(OpKind::LeakyRelu, support_leaky_relu, convert_leaky_relu);
    registry.register(OpKind::Elu, support_elu, convert_elu);
    registry.register(OpKind::Gelu, support_gelu, convert_gelu);
    registry.register(OpKind::Silu, unary_float, convert_silu);
    registry.register(OpKind::Prelu, support_prelu, convert_prelu);
}

fn unary_float(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| float_operand(graph, node, 0))
}

fn activation(
    ctx: &mut ConversionCtx<'_>,
    node: &Node,
    kind: ActivationKind,
) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    ensure_float(ctx, ctx.desc(input)?.dtype)?;
    let output = ctx.add_layer(LayerKind::Activation(kind), &[input])?;
    Ok(vec![output])
}

fn convert_relu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    activation(ctx, node, ActivationKind::Relu)
}

fn convert_sigmoid(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    activation(ctx, node, ActivationKind::Sigmoid)
}

fn convert_tanh(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    activation(ctx, node, ActivationKind::Tanh)
}

fn support_hardtanh(graph: &Graph, node: &Node) -> Support {
    unary_float(graph, node)
        .and_then(|| float_attr(node, "min_val"))
        .and_then(|| float_attr(node, "max_val"))
}

fn convert_hardtanh(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let min = read_float(ctx, node, "min_val")?;
    let max = read_float(ctx, node, "max_val")?;
    activation(ctx, node, ActivationKind::Clip { min, max })
}

fn support_leaky_relu(graph: &Graph, node: &Node) -> Support {
    unary_float(graph, node).and_then(|| float_attr(node, "negative_slope"))
}

fn convert_leaky_relu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let alpha = read_float(ctx, node, "negative_slope")?;
    activation(ctx, node, ActivationKind::LeakyRelu { alpha })
}

fn support_elu(graph: &Graph, node: &Node) -> Support {
    unary_float(graph, node)
        .and_then(|| float_attr(node, "alpha"))
        .and_then(|| {
            let unit = |name: &str| node.float_attr(name).map_or(true, |value| value == 1.0);
            if unit("scale") && unit("input_scale") {
                Support::Supported
            } else {
                Support::unsupported("elu with non-unit scale or input_scale")
            }
        })
}

fn convert_elu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let alpha = read_float(ctx, node, "alpha")?;
    activation(ctx, node, ActivationKind::Elu { alpha })
}

fn support_gelu(graph: &Graph, node: &Node) -> Support {
    unary_float(graph, node).and_then(|| match node.attr("approximate").and_then(Attr::as_str) {
        Some("none") | Some("tanh") => Support::Supported,
        Some(other) => Support::unsupported(format!("unknown gelu approximation `{other}`")),
        None => Support::unsupported("gelu approximation is not a constant string"),
    })
}

/// Emits gelu directly for graphs that skipped lowering.
fn convert_gelu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let x = ctx.input(node, 0)?;
    let desc = ctx.desc(x)?;
    ensure_float(ctx, desc.dtype)?;
    let inner = if node.attr("approximate").and_then(Attr::as_str) == Some("tanh") {
        let three = ctx.broadcast_scalar(3.0, &desc)?;
        let cube = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Pow), &[x, three])?;
        let scaled = scale_by(ctx, &desc, cube, 0.044715)?;
        let sum = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Sum), &[x, scaled])?;
        let arg = scale_by(ctx, &desc, sum, FRAC_2_PI.sqrt())?;
        ctx.add_layer(LayerKind::Activation(ActivationKind::Tanh), &[arg])?
    } else {
        let arg = scale_by(ctx, &desc, x, FRAC_1_SQRT_2)?;
        ctx.add_layer(LayerKind::Unary(UnaryKind::Erf), &[arg])?
    };
    let one = ctx.broadcast_scalar(1.0, &desc)?;
    let shifted = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Sum), &[inner, one])?;
    let half = scale_by(ctx, &desc, x, 0.5)?;
    let output = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Prod), &[half, shifted])?;
    Ok(vec![output])
}

fn scale_by(
    ctx: &mut ConversionCtx<'_>,
    like: &TensorDesc,
    input: TensorRef,
    value: f64,
) -> ConversionResult<TensorRef> {
    let factor = ctx.broadcast_scalar(value, like)?;
    ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Prod), &[input, factor])
}

fn convert_silu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let x = ctx.input(node, 0)?;
    ensure_float(ctx, ctx.desc(x)?.dtype)?;
    let gate = ctx.add_layer(LayerKind::Activation(ActivationKind::Sigmoid), &[x])?;
    let output = ctx.add_layer(LayerKind::ElementWise(ElementWiseKind::Prod), &[x, gate])?;
    Ok(vec![output])
}

fn support_prelu(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 2)
        .and_then(|| float_operand(graph, node, 0))
        .and_then(|| float_operand(graph, node, 1))
}

fn convert_prelu(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let x = ctx.input(node, 0)?;
    let slope = ctx.input(node, 1)?;
    let x_desc = ctx.desc(x)?;
    ensure_float(ctx, x_desc.dtype)?;
    let slope_desc = ctx.desc(slope)?;
    if slope_desc.rank() > 1 {
        return Err(ctx.fail(format!(
            "prelu weight must be rank 0 or 1, found rank {}",
            slope_desc.rank()
        )));
    }
    let output = ctx.add_layer(LayerKind::ParametricRelu, &[x, slope])?;
    Ok(vec![output])
}
