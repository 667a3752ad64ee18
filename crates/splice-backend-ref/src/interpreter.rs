//! Reference fallback interpreter.
//!
//! Runs any node of the graph IR on host tensors, whether or not lowering has
//! folded its attribute operands into attributes.

use tracing::info;

use splice::ir::{Attr, DType, HostTensor, Node, OpKind};
use splice::runtime::{ExecError, NodeInterpreter, RuntimeValue};

use crate::kernels::{self, KernelError};

#[derive(Debug, Default, Clone, Copy)]
pub struct RefInterpreter;

impl RefInterpreter {
    pub fn new() -> Self {
        Self
    }
}

/// Read access to a node's operands and attributes.
struct Call<'a> {
    node: &'a Node,
    inputs: &'a [RuntimeValue],
}

impl<'a> Call<'a> {
    fn fail(&self, message: impl Into<String>) -> ExecError {
        ExecError::at_node(self.node, message)
    }

    fn tensor(&self, index: usize) -> Result<&'a HostTensor, ExecError> {
        match self.inputs.get(index) {
            Some(RuntimeValue::Tensor(tensor)) => Ok(tensor),
            Some(RuntimeValue::Scalar(attr)) => Err(self.fail(format!("operand {index} is {attr}, not a tensor"))),
            None => Err(self.fail(format!("missing operand {index}"))),
        }
    }

    /// Attribute `name`, either folded onto the node or still passed as the
    /// matching trailing operand.
    fn attr(&self, name: &str) -> Option<Attr> {
        if let Some(attr) = self.node.attr(name) {
            return Some(attr.clone());
        }
        let first = self.node.kind.tensor_operand_count()?;
        let position = self
            .node
            .kind
            .attribute_operands()
            .iter()
            .position(|operand| *operand == name)?;
        match self.inputs.get(first + position)? {
            RuntimeValue::Scalar(attr) => Some(attr.clone()),
            RuntimeValue::Tensor(tensor) if tensor.rank() == 0 => Some(scalar_of(tensor)),
            RuntimeValue::Tensor(_) => None,
        }
    }

    fn float(&self, name: &str, default: f64) -> Result<f64, ExecError> {
        match self.attr(name) {
            None | Some(Attr::None) => Ok(default),
            Some(attr) => attr
                .as_float()
                .ok_or_else(|| self.fail(format!("`{name}` is {attr}, not a number"))),
        }
    }

    fn optional_float(&self, name: &str) -> Result<Option<f64>, ExecError> {
        match self.attr(name) {
            None | Some(Attr::None) => Ok(None),
            Some(attr) => attr
                .as_float()
                .map(Some)
                .ok_or_else(|| self.fail(format!("`{name}` is {attr}, not a number"))),
        }
    }

    fn int(&self, name: &str) -> Result<i64, ExecError> {
        self.attr(name)
            .and_then(|attr| attr.as_int())
            .ok_or_else(|| self.fail(format!("missing integer `{name}`")))
    }

    fn flag(&self, name: &str) -> bool {
        self.attr(name).and_then(|attr| attr.as_bool()).unwrap_or(false)
    }

    fn ints(&self, name: &str) -> Result<Vec<i64>, ExecError> {
        match self.attr(name) {
            Some(Attr::Ints(values)) => Ok(values),
            Some(Attr::Int(value)) => Ok(vec![value]),
            other => Err(self.fail(format!(
                "`{name}` must be an int list, found {}",
                other.map_or_else(|| "nothing".to_string(), |attr| attr.to_string())
            ))),
        }
    }

    fn dtype(&self, name: &str) -> Result<Option<DType>, ExecError> {
        match self.attr(name) {
            None | Some(Attr::None) => Ok(None),
            Some(Attr::DType(dtype)) => Ok(Some(dtype)),
            Some(Attr::Int(code)) => DType::from_scalar_type_code(code)
                .map(Some)
                .ok_or_else(|| self.fail(format!("unknown scalar type code {code}"))),
            Some(other) => Err(self.fail(format!("`{name}` is {other}, not a dtype"))),
        }
    }

    /// Right-hand operand of a binary op: a second tensor, a scalar operand,
    /// or the folded `other` attribute.
    fn rhs(&self) -> Result<Rhs<'a>, ExecError> {
        match self.inputs.get(1) {
            Some(RuntimeValue::Tensor(tensor)) => Ok(Rhs::Tensor(tensor)),
            Some(RuntimeValue::Scalar(attr)) => attr
                .as_float()
                .map(Rhs::Scalar)
                .ok_or_else(|| self.fail(format!("scalar operand {attr} is not a number"))),
            None => self
                .node
                .float_attr("other")
                .map(Rhs::Scalar)
                .ok_or_else(|| self.fail("missing right-hand operand")),
        }
    }
}

enum Rhs<'a> {
    Tensor(&'a HostTensor),
    Scalar(f64),
}

fn scalar_of(tensor: &HostTensor) -> Attr {
    let value = tensor.to_f64_vec().first().copied().unwrap_or_default();
    match tensor.dtype() {
        dtype if dtype.is_float() => Attr::Float(value),
        DType::Bool => Attr::Bool(value != 0.0),
        _ => Attr::Int(value as i64),
    }
}

fn float_result(dtype: DType) -> DType {
    if dtype.is_float() {
        dtype
    } else {
        DType::F32
    }
}

fn one(tensor: HostTensor) -> Vec<RuntimeValue> {
    vec![RuntimeValue::Tensor(tensor)]
}

impl NodeInterpreter for RefInterpreter {
    fn execute(&self, node: &Node, inputs: &[RuntimeValue]) -> Result<Vec<RuntimeValue>, ExecError> {
        let call = Call { node, inputs };
        let kernel = |err: KernelError| call.fail(err.to_string());
        let results = match node.kind {
            OpKind::Constant => match node.attr("value") {
                Some(Attr::Tensor(tensor)) => one(tensor.clone()),
                Some(attr) => vec![RuntimeValue::Scalar(attr.clone())],
                None => vec![RuntimeValue::Scalar(Attr::None)],
            },
            OpKind::Relu => {
                let x = call.tensor(0)?;
                one(kernels::map(x, x.dtype(), kernels::relu).map_err(kernel)?)
            }
            OpKind::Sigmoid => unary(&call, kernels::sigmoid)?,
            OpKind::Tanh => unary(&call, f64::tanh)?,
            OpKind::Hardtanh => {
                let lo = call.float("min_val", -1.0)?;
                let hi = call.float("max_val", 1.0)?;
                unary(&call, |x| x.max(lo).min(hi))?
            }
            OpKind::LeakyRelu => {
                let slope = call.float("negative_slope", 0.01)?;
                unary(&call, |x| kernels::leaky_relu(x, slope))?
            }
            OpKind::Elu => {
                let alpha = call.float("alpha", 1.0)?;
                let scale = call.float("scale", 1.0)?;
                let input_scale = call.float("input_scale", 1.0)?;
                unary(&call, |x| kernels::elu(x, alpha, scale, input_scale))?
            }
            OpKind::Gelu => match call.attr("approximate").as_ref().and_then(Attr::as_str) {
                Some("tanh") => unary(&call, kernels::gelu_tanh)?,
                None | Some("none") => unary(&call, kernels::gelu_exact)?,
                Some(other) => return Err(call.fail(format!("unknown gelu approximation `{other}`"))),
            },
            OpKind::Silu => unary(&call, |x| x * kernels::sigmoid(x))?,
            OpKind::Prelu => one(kernels::prelu(call.tensor(0)?, call.tensor(1)?).map_err(kernel)?),
            OpKind::Add | OpKind::Sub => {
                let alpha = call.float("alpha", 1.0)?;
                let sign = if node.kind == OpKind::Sub { -1.0 } else { 1.0 };
                binary(&call, move |a, b| a + sign * alpha * b)?
            }
            OpKind::Mul => binary(&call, |a, b| a * b)?,
            OpKind::Div => divide(&call)?,
            OpKind::Pow => binary(&call, f64::powf)?,
            OpKind::Maximum => binary(&call, f64::max)?,
            OpKind::Minimum => binary(&call, f64::min)?,
            OpKind::Neg => {
                let x = call.tensor(0)?;
                one(kernels::map(x, x.dtype(), |v| -v).map_err(kernel)?)
            }
            OpKind::Abs => {
                let x = call.tensor(0)?;
                one(kernels::map(x, x.dtype(), f64::abs).map_err(kernel)?)
            }
            OpKind::Exp => unary(&call, f64::exp)?,
            OpKind::Log => unary(&call, f64::ln)?,
            OpKind::Sqrt => unary(&call, f64::sqrt)?,
            OpKind::Erf => unary(&call, kernels::erf_value)?,
            OpKind::Clamp => {
                let lo = call.optional_float("min")?;
                let hi = call.optional_float("max")?;
                let x = call.tensor(0)?;
                let clamped = kernels::map(x, x.dtype(), |v| {
                    let v = lo.map_or(v, |lo| v.max(lo));
                    hi.map_or(v, |hi| v.min(hi))
                });
                one(clamped.map_err(kernel)?)
            }
            OpKind::Matmul => one(kernels::matmul(call.tensor(0)?, call.tensor(1)?).map_err(kernel)?),
            OpKind::Linear => {
                let x = call.tensor(0)?;
                let weight = call.tensor(1)?;
                if weight.rank() != 2 {
                    return Err(call.fail(format!("linear weight must be rank 2, got {:?}", weight.dims())));
                }
                let transposed = kernels::permute(weight, &[1, 0]).map_err(kernel)?;
                let mut out = kernels::matmul(x, &transposed).map_err(kernel)?;
                if let Some(RuntimeValue::Tensor(bias)) = inputs.get(2) {
                    out = kernels::binary(&out, bias, out.dtype(), |a, b| a + b).map_err(kernel)?;
                }
                one(out)
            }
            OpKind::ConstantPadNd => one(constant_pad(&call)?),
            OpKind::Reshape => {
                let x = call.tensor(0)?;
                let dims = kernels::resolve_reshape(x.dims(), &call.ints("shape")?, false).map_err(kernel)?;
                one(kernels::reshape(x, dims).map_err(kernel)?)
            }
            OpKind::Permute => {
                let x = call.tensor(0)?;
                let perm = call
                    .ints("dims")?
                    .iter()
                    .map(|&axis| kernels::resolve_axis(axis, x.rank()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(kernel)?;
                one(kernels::permute(x, &perm).map_err(kernel)?)
            }
            OpKind::Transpose => {
                let x = call.tensor(0)?;
                let a = kernels::resolve_axis(call.int("dim0")?, x.rank()).map_err(kernel)?;
                let b = kernels::resolve_axis(call.int("dim1")?, x.rank()).map_err(kernel)?;
                let mut perm: Vec<usize> = (0..x.rank()).collect();
                if x.rank() > 0 {
                    perm.swap(a, b);
                }
                one(kernels::permute(x, &perm).map_err(kernel)?)
            }
            OpKind::Flatten => one(flatten(&call)?),
            OpKind::Softmax => {
                let x = call.tensor(0)?;
                let dtype = call.dtype("dtype")?.unwrap_or_else(|| float_result(x.dtype()));
                let axis = kernels::resolve_axis(call.int("dim")?, x.rank()).map_err(kernel)?;
                one(kernels::softmax(x, axis, dtype).map_err(kernel)?)
            }
            OpKind::Sum | OpKind::Mean => one(reduce(&call)?),
            OpKind::To => {
                let x = call.tensor(0)?;
                let dtype = call.dtype("dtype")?.unwrap_or(x.dtype());
                one(x.cast(dtype))
            }
            OpKind::Dropout => {
                if call.flag("train") {
                    return Err(call.fail("training-mode dropout has no deterministic reference"));
                }
                one(call.tensor(0)?.clone())
            }
            OpKind::Contiguous => one(call.tensor(0)?.clone()),
            OpKind::Cumsum => {
                let x = call.tensor(0)?;
                let default = if x.dtype().is_float() { x.dtype() } else { DType::I64 };
                let dtype = call.dtype("dtype")?.unwrap_or(default);
                let axis = kernels::resolve_axis(call.int("dim")?, x.rank()).map_err(kernel)?;
                one(kernels::cumsum(x, axis, dtype).map_err(kernel)?)
            }
            OpKind::Size => {
                let x = call.tensor(0)?;
                match call.attr("dim") {
                    None | Some(Attr::None) => {
                        let dims = x.dims().iter().map(|&d| d as i64).collect();
                        vec![RuntimeValue::Scalar(Attr::Ints(dims))]
                    }
                    Some(_) if x.rank() == 0 => return Err(call.fail("size of a rank-0 tensor has no axes")),
                    Some(attr) => {
                        let dim = attr
                            .as_int()
                            .ok_or_else(|| call.fail(format!("`dim` is {attr}, not an int")))?;
                        let axis = kernels::resolve_axis(dim, x.rank()).map_err(kernel)?;
                        vec![RuntimeValue::Scalar(Attr::Int(x.dims()[axis] as i64))]
                    }
                }
            }
            OpKind::Print => {
                let rendered: Vec<String> = inputs.iter().map(render).collect();
                info!(node = %node.id, "{}", rendered.join(" "));
                Vec::new()
            }
            OpKind::If | OpKind::Loop | OpKind::EngineCall => {
                return Err(call.fail("control flow and engine calls have no reference implementation"));
            }
        };
        Ok(results)
    }
}

fn render(value: &RuntimeValue) -> String {
    match value {
        RuntimeValue::Tensor(tensor) => format!("{}{:?} {:?}", tensor.dtype(), tensor.dims(), tensor.to_f64_vec()),
        RuntimeValue::Scalar(attr) => attr.to_string(),
    }
}

/// Elementwise map; integer inputs produce `f32`.
fn unary(call: &Call<'_>, f: impl Fn(f64) -> f64) -> Result<Vec<RuntimeValue>, ExecError> {
    let x = call.tensor(0)?;
    kernels::map(x, float_result(x.dtype()), f)
        .map(one)
        .map_err(|err| call.fail(err.to_string()))
}

fn binary(call: &Call<'_>, f: impl Fn(f64, f64) -> f64) -> Result<Vec<RuntimeValue>, ExecError> {
    let lhs = call.tensor(0)?;
    let result = match call.rhs()? {
        Rhs::Tensor(rhs) => kernels::binary(lhs, rhs, kernels::promote(lhs.dtype(), rhs.dtype()), f),
        Rhs::Scalar(value) => {
            let dtype = if value.fract() != 0.0 && !lhs.dtype().is_float() {
                DType::F32
            } else {
                lhs.dtype()
            };
            kernels::binary_scalar(lhs, value, dtype, f)
        }
    };
    result.map(one).map_err(|err| call.fail(err.to_string()))
}

/// True division; integer operands produce float results.
fn divide(call: &Call<'_>) -> Result<Vec<RuntimeValue>, ExecError> {
    let lhs = call.tensor(0)?;
    let result = match call.rhs()? {
        Rhs::Tensor(rhs) => {
            let dtype = float_result(kernels::promote(lhs.dtype(), rhs.dtype()));
            kernels::binary(lhs, rhs, dtype, |a, b| a / b)
        }
        Rhs::Scalar(value) => kernels::binary_scalar(lhs, value, float_result(lhs.dtype()), |a, b| a / b),
    };
    result.map(one).map_err(|err| call.fail(err.to_string()))
}

/// `pad` lists `(before, after)` pairs starting from the last axis.
fn constant_pad(call: &Call<'_>) -> Result<HostTensor, ExecError> {
    let x = call.tensor(0)?;
    let pad = call.ints("pad")?;
    let value = call.float("value", 0.0)?;
    if pad.len() % 2 != 0 || pad.len() / 2 > x.rank() {
        return Err(call.fail(format!("pad list {pad:?} does not fit rank {}", x.rank())));
    }
    let mut pre = vec![0; x.rank()];
    let mut post = vec![0; x.rank()];
    for (pair, amounts) in pad.chunks_exact(2).enumerate() {
        let axis = x.rank() - 1 - pair;
        pre[axis] = amounts[0];
        post[axis] = amounts[1];
    }
    kernels::pad(x, &pre, &post, value).map_err(|err| call.fail(err.to_string()))
}

fn flatten(call: &Call<'_>) -> Result<HostTensor, ExecError> {
    let x = call.tensor(0)?;
    if x.rank() == 0 {
        return x.reshape(vec![1]).map_err(|err| call.fail(err.to_string()));
    }
    let start = kernels::resolve_axis(call.int("start_dim").unwrap_or(0), x.rank());
    let end = kernels::resolve_axis(call.int("end_dim").unwrap_or(-1), x.rank());
    let (start, end) = match (start, end) {
        (Ok(start), Ok(end)) if start <= end => (start, end),
        _ => return Err(call.fail(format!("invalid flatten range for rank {}", x.rank()))),
    };
    let dims = x.dims();
    let mut out: Vec<usize> = dims[..start].to_vec();
    out.push(dims[start..=end].iter().product());
    out.extend_from_slice(&dims[end + 1..]);
    x.reshape(out).map_err(|err| call.fail(err.to_string()))
}

fn reduce(call: &Call<'_>) -> Result<HostTensor, ExecError> {
    let x = call.tensor(0)?;
    let mean = call.node.kind == OpKind::Mean;
    let axes: Vec<usize> = match call.attr("dim") {
        None | Some(Attr::None) => (0..x.rank()).collect(),
        Some(Attr::Int(axis)) => vec![kernels::resolve_axis(axis, x.rank()).map_err(|err| call.fail(err.to_string()))?],
        Some(Attr::Ints(axes)) if axes.is_empty() => (0..x.rank()).collect(),
        Some(Attr::Ints(axes)) => axes
            .iter()
            .map(|&axis| kernels::resolve_axis(axis, x.rank()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| call.fail(err.to_string()))?,
        Some(other) => return Err(call.fail(format!("`dim` is {other}, not an axis list"))),
    };
    let mut axes = axes;
    axes.sort_unstable();
    axes.dedup();
    let default = match x.dtype() {
        dtype if dtype.is_float() => dtype,
        _ if mean => return Err(call.fail(format!("mean of a {} tensor needs a float dtype", x.dtype()))),
        _ => DType::I64,
    };
    let dtype = call.dtype("dtype")?.unwrap_or(default);
    let source = x.cast(dtype);
    kernels::reduce(&source, &axes, call.flag("keepdim"), mean, dtype).map_err(|err| call.fail(err.to_string()))
}
