use super::{ints_attr, operand_type, read_ints, resolve_axis, tensor_operands};
use crate::backend::{LayerKind, TensorRef};
use crate::conversion::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, Dimension, Graph, Node, OpKind};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(OpKind::Reshape, support_reshape, convert_reshape);
    registry.register(OpKind::Permute, support_permute, convert_permute);
    registry.register(OpKind::Transpose, support_transpose, convert_transpose);
    registry.register(OpKind::Flatten, support_flatten, convert_flatten);
    registry.register(OpKind::ConstantPadNd, support_pad, convert_pad);
    registry.register(OpKind::To, support_to, convert_to);
    registry.register(OpKind::Dropout, support_dropout, convert_identity);
    registry.register(OpKind::Contiguous, support_contiguous, convert_identity);
}

fn shuffle(
    ctx: &mut ConversionCtx<'_>,
    input: TensorRef,
    permutation: Option<Vec<usize>>,
    reshape: Option<Vec<i64>>,
) -> ConversionResult<Vec<TensorRef>> {
    let output = ctx.add_layer(
        LayerKind::Shuffle {
            permutation,
            reshape,
        },
        &[input],
    )?;
    Ok(vec![output])
}

fn support_reshape(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
        .and_then(|| ints_attr(node, "shape"))
        .and_then(|| {
            let shape = node.ints_attr("shape").unwrap_or_default();
            let inferred = shape.iter().filter(|dim| **dim == -1).count();
            if shape.iter().any(|dim| *dim == 0 || *dim < -1) {
                Support::unsupported("reshape target has zero or negative extents")
            } else if inferred > 1 {
                Support::unsupported("reshape target infers more than one extent")
            } else {
                Support::Supported
            }
        })
}

fn convert_reshape(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let shape = read_ints(ctx, node, "shape")?.to_vec();
    shuffle(ctx, input, None, Some(shape))
}

fn support_permute(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| ints_attr(node, "dims"))
}

fn convert_permute(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let rank = ctx.desc(input)?.rank();
    let dims = read_ints(ctx, node, "dims")?;
    if dims.len() != rank {
        return Err(ctx.fail(format!("permute lists {} dims for rank {rank}", dims.len())));
    }
    let permutation = dims
        .iter()
        .map(|dim| resolve_axis(ctx, *dim, rank))
        .collect::<ConversionResult<Vec<usize>>>()?;
    let mut seen = vec![false; rank];
    for axis in &permutation {
        if std::mem::replace(&mut seen[*axis], true) {
            return Err(ctx.fail(format!("permute repeats axis {axis}")));
        }
    }
    shuffle(ctx, input, Some(permutation), None)
}

fn support_transpose(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| {
        match (node.int_attr("dim0"), node.int_attr("dim1")) {
            (Some(_), Some(_)) => Support::Supported,
            _ => Support::unsupported("transpose dims are not constant ints"),
        }
    })
}

fn convert_transpose(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let rank = ctx.desc(input)?.rank();
    let (Some(dim0), Some(dim1)) = (node.int_attr("dim0"), node.int_attr("dim1")) else {
        return Err(ctx.fail("missing transpose dims"));
    };
    let dim0 = resolve_axis(ctx, dim0, rank)?;
    let dim1 = resolve_axis(ctx, dim1, rank)?;
    let mut permutation: Vec<usize> = (0..rank).collect();
    permutation.swap(dim0, dim1);
    shuffle(ctx, input, Some(permutation), None)
}

fn support_flatten(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| {
        match (node.int_attr("start_dim"), node.int_attr("end_dim")) {
            (Some(_), Some(_)) => Support::Supported,
            _ => Support::unsupported("flatten dims are not constant ints"),
        }
    })
    .and_then(|| {
        let Some(dims) = operand_type(graph, node, 0).and_then(|ty| ty.shape.as_deref()) else {
            return Support::Supported;
        };
        let rank = dims.len() as i64;
        if rank == 0 {
            return Support::Supported;
        }
        let end = node.int_attr("end_dim").unwrap_or(-1);
        let end = if end < 0 { end + rank } else { end };
        if end < 0 || end >= rank {
            return Support::unsupported(format!("flatten end_dim is out of range for rank {rank}"));
        }
        match dims
            .iter()
            .enumerate()
            .skip(end as usize + 1)
            .find(|(_, dim)| **dim == Dimension::Dynamic)
        {
            Some((axis, _)) => {
                Support::unsupported(format!("dynamic axis {axis} follows the flattened run"))
            }
            None => Support::Supported,
        }
    })
}

/// Leading axes copy through, the flattened run is inferred, trailing axes
/// must be static since `0` copies by output position.
fn convert_flatten(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let desc = ctx.desc(input)?;
    let rank = desc.rank();
    if rank == 0 {
        return shuffle(ctx, input, None, Some(vec![1]));
    }
    let start = resolve_axis(ctx, node.int_attr("start_dim").unwrap_or(0), rank)?;
    let end = resolve_axis(ctx, node.int_attr("end_dim").unwrap_or(-1), rank)?;
    if start > end {
        return Err(ctx.fail(format!("flatten start_dim {start} is after end_dim {end}")));
    }
    let mut target: Vec<i64> = vec![0; start];
    target.push(-1);
    for (axis, dim) in desc.dims.iter().enumerate().skip(end + 1) {
        match dim {
            Dimension::Static(extent) => target.push(*extent as i64),
            Dimension::Dynamic => {
                return Err(ctx.fail(format!(
                    "flatten keeps dynamic axis {axis} after the flattened run"
                )))
            }
        }
    }
    shuffle(ctx, input, None, Some(target))
}

fn support_pad(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
        .and_then(|| ints_attr(node, "pad"))
        .and_then(|| {
            let pad = node.ints_attr("pad").unwrap_or_default();
            if pad.len() % 2 != 0 {
                return Support::unsupported("pad list has odd length");
            }
            match operand_type(graph, node, 0).and_then(|ty| ty.rank()) {
                Some(rank) if pad.len() / 2 > rank => Support::unsupported(format!(
                    "pad covers {} axes of a rank-{rank} tensor",
                    pad.len() / 2
                )),
                _ => Support::Supported,
            }
        })
        .and_then(|| match node.attr("value") {
            None => Support::Supported,
            Some(attr) if attr.as_float().is_some() => Support::Supported,
            Some(_) => Support::unsupported("pad value is not a constant number"),
        })
}

/// The pad list runs from the last axis backwards as `(before, after)` pairs.
fn convert_pad(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let rank = ctx.desc(input)?.rank();
    let pad = read_ints(ctx, node, "pad")?;
    if pad.len() % 2 != 0 || pad.len() / 2 > rank {
        return Err(ctx.fail(format!("pad list of length {} for rank {rank}", pad.len())));
    }
    let mut pre = vec![0i64; rank];
    let mut post = vec![0i64; rank];
    for (pair, amounts) in pad.chunks_exact(2).enumerate() {
        let axis = rank - 1 - pair;
        pre[axis] = amounts[0];
        post[axis] = amounts[1];
    }
    let value = node.float_attr("value").unwrap_or(0.0);
    let output = ctx.add_layer(LayerKind::Pad { pre, post, value }, &[input])?;
    Ok(vec![output])
}

fn support_to(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| match node.attr("dtype") {
        None => Support::Supported,
        Some(Attr::DType(dtype)) if dtype.is_64bit() => {
            Support::unsupported(format!("cast to {dtype} stays in the interpreter"))
        }
        Some(Attr::DType(_)) => Support::Supported,
        Some(_) => Support::unsupported("`dtype` is not a constant dtype"),
    })
}

fn convert_to(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let dtype = match node.attr("dtype").and_then(Attr::as_dtype) {
        Some(dtype) => dtype,
        None => ctx.desc(input)?.dtype,
    };
    let output = ctx.add_layer(LayerKind::Identity { dtype }, &[input])?;
    Ok(vec![output])
}

fn support_dropout(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1).and_then(|| match node.attr("train").and_then(Attr::as_bool) {
        Some(false) | None => Support::Supported,
        Some(true) => Support::unsupported("dropout in training mode"),
    })
}

fn support_contiguous(graph: &Graph, node: &Node) -> Support {
    tensor_operands(graph, node, 1)
}

fn convert_identity(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let dtype = ctx.desc(input)?.dtype;
    let output = ctx.add_layer(LayerKind::Identity { dtype }, &[input])?;
    Ok(vec![output])
}
