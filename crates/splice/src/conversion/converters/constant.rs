use crate::backend::TensorRef;
use crate::conversion::{ConversionCtx, ConversionResult, ConverterRegistry, Support};
use crate::ir::{Attr, Graph, Node, OpKind, ValueType};

pub(super) fn register(registry: &mut ConverterRegistry) {
    registry.register(OpKind::Constant, support_constant, convert_constant);
}

/// Only tensor payloads become weights; scalar constants feed attributes or
/// the interpreter.
fn support_constant(graph: &Graph, node: &Node) -> Support {
    let Some(output) = node.output() else {
        return Support::unsupported("constant without a single result");
    };
    if !graph.value_type(output).is_some_and(ValueType::is_tensor) {
        return Support::unsupported("scalar constant");
    }
    match node.attr("value") {
        Some(Attr::Tensor(_)) => Support::Supported,
        _ => Support::unsupported("constant payload is not a tensor"),
    }
}

fn convert_constant(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let tensor = node
        .attr("value")
        .and_then(Attr::as_tensor)
        .cloned()
        .ok_or_else(|| ctx.fail("constant payload is not a tensor"))?;
    let output = ctx.constant(tensor)?;
    Ok(vec![output])
}
