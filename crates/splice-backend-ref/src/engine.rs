//! Built reference engines: a frozen network plus its binding contract.

use serde::{Deserialize, Serialize};

use splice::backend::{
    ActivationKind, BackendError, BackendResult, ElementWiseKind, Engine, EngineBinding, LayerKind,
    ReduceKind, UnaryKind,
};
use splice::config::DeviceType;
use splice::ir::tensor::round_f16;
use splice::ir::{DType, HostTensor, ShapeSpec};

use crate::kernels::{self, KernelError, KernelResult};
use crate::network::RefNetwork;

const ENGINE_MAGIC: &str = "splice-ref-engine";
const ENGINE_VERSION: u32 = 1;

/// Everything needed to run or reload an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EnginePlan {
    pub network: RefNetwork,
    pub inputs: Vec<EngineBinding>,
    pub outputs: Vec<EngineBinding>,
    /// Float layer results are rounded through f16.
    pub reduced_precision: bool,
    pub device_type: DeviceType,
}

#[derive(Serialize, Deserialize)]
struct EngineFile {
    magic: String,
    version: u32,
    plan: EnginePlan,
}

#[derive(Debug, Clone)]
pub struct RefEngine {
    plan: EnginePlan,
}

impl RefEngine {
    pub(crate) fn new(plan: EnginePlan) -> Self {
        Self { plan }
    }

    pub fn network(&self) -> &RefNetwork {
        &self.plan.network
    }

    pub fn reduced_precision(&self) -> bool {
        self.plan.reduced_precision
    }

    pub fn device_type(&self) -> DeviceType {
        self.plan.device_type
    }

    pub fn from_bytes(bytes: &[u8]) -> BackendResult<Self> {
        let file: EngineFile = serde_json::from_slice(bytes)
            .map_err(|err| BackendError::new(format!("malformed engine: {err}")))?;
        if file.magic != ENGINE_MAGIC {
            return Err(BackendError::new(format!("not a reference engine (magic `{}`)", file.magic)));
        }
        if file.version != ENGINE_VERSION {
            return Err(BackendError::new(format!(
                "engine format version {} is not supported (expected {ENGINE_VERSION})",
                file.version
            )));
        }
        Ok(Self::new(file.plan))
    }

    fn check_inputs(&self, inputs: &[HostTensor]) -> BackendResult<()> {
        if inputs.len() != self.plan.inputs.len() {
            return Err(BackendError::new(format!(
                "engine takes {} inputs, {} given",
                self.plan.inputs.len(),
                inputs.len()
            )));
        }
        for (tensor, binding) in inputs.iter().zip(&self.plan.inputs) {
            if tensor.dtype() != binding.dtype {
                return Err(BackendError::new(format!(
                    "input `{}` expects {}, got {}",
                    binding.name,
                    binding.dtype,
                    tensor.dtype()
                )));
            }
            if !binding.shape.admits(tensor.dims()) {
                return Err(BackendError::new(format!(
                    "input `{}` shape {:?} is outside the profile {}",
                    binding.name,
                    tensor.dims(),
                    binding.shape
                )));
            }
        }
        Ok(())
    }
}

impl Engine for RefEngine {
    fn inputs(&self) -> &[EngineBinding] {
        &self.plan.inputs
    }

    fn outputs(&self) -> &[EngineBinding] {
        &self.plan.outputs
    }

    fn execute(&self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>> {
        self.check_inputs(inputs)?;
        let network = &self.plan.network;
        let mut slots: Vec<Option<HostTensor>> = vec![None; network.tensor_count()];
        for (input, tensor) in network.inputs().iter().zip(inputs) {
            slots[input.tensor.0 as usize] = Some(tensor.clone());
        }
        for (index, layer) in network.layers().iter().enumerate() {
            let operands = layer
                .inputs
                .iter()
                .map(|tensor| {
                    slots[tensor.0 as usize]
                        .as_ref()
                        .ok_or_else(|| BackendError::at_layer(index, format!("tensor {} is unset", tensor.0)))
                })
                .collect::<BackendResult<Vec<&HostTensor>>>()?;
            let mut result = run_layer(&layer.kind, &operands)
                .map_err(|err| BackendError::at_layer(index, format!("{} `{}`: {err}", layer.kind.label(), layer.name)))?;
            if self.plan.reduced_precision && result.dtype() == DType::F32 {
                result = kernels::map(&result, DType::F32, |x| f64::from(round_f16(x as f32)))
                    .map_err(|err| BackendError::at_layer(index, err.to_string()))?;
            }
            slots[layer.output.0 as usize] = Some(result);
        }
        network
            .outputs()
            .iter()
            .map(|output| {
                slots[output.tensor.0 as usize]
                    .clone()
                    .ok_or_else(|| BackendError::new(format!("output `{}` was never computed", output.name)))
            })
            .collect()
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        let file = EngineFile {
            magic: ENGINE_MAGIC.to_string(),
            version: ENGINE_VERSION,
            plan: self.plan.clone(),
        };
        serde_json::to_vec(&file).map_err(|err| BackendError::new(format!("serializing engine: {err}")))
    }
}

/// Output shape contract of every marked output, measured at the min, opt and
/// max input profiles.
pub(crate) fn output_bindings(network: &RefNetwork) -> BackendResult<Vec<EngineBinding>> {
    let profile = |pick: fn(&ShapeSpec) -> &[usize]| -> BackendResult<Vec<Vec<usize>>> {
        let dims: Vec<Vec<usize>> = network.inputs().iter().map(|input| pick(&input.shape).to_vec()).collect();
        let tensors = network.concrete_shapes(&dims)?;
        network
            .outputs()
            .iter()
            .map(|output| {
                let desc = &tensors[output.tensor.0 as usize];
                splice::ir::types::static_dims(&desc.dims)
                    .ok_or_else(|| BackendError::new(format!("output `{}` has no static shape", output.name)))
            })
            .collect()
    };
    let min = profile(ShapeSpec::min)?;
    let opt = profile(ShapeSpec::opt)?;
    let max = profile(ShapeSpec::max)?;
    Ok(network
        .outputs()
        .iter()
        .zip(min.into_iter().zip(opt).zip(max))
        .map(|(output, ((min, opt), max))| EngineBinding {
            name: output.name.clone(),
            dtype: network.tensors[output.tensor.0 as usize].dtype,
            shape: ShapeSpec::from_measurements(min, opt, max),
        })
        .collect())
}

fn float_result(dtype: DType) -> DType {
    if dtype.is_float() {
        dtype
    } else {
        DType::F32
    }
}

/// Executes one layer on concrete tensors.
pub(crate) fn run_layer(kind: &LayerKind, inputs: &[&HostTensor]) -> KernelResult<HostTensor> {
    let operand = |index: usize| {
        inputs
            .get(index)
            .copied()
            .ok_or_else(|| KernelError::new(format!("missing operand {index}")))
    };
    match kind {
        LayerKind::Constant(tensor) => Ok(tensor.clone()),
        LayerKind::Activation(activation) => {
            let x = operand(0)?;
            let dtype = x.dtype();
            match *activation {
                ActivationKind::Relu => kernels::map(x, dtype, kernels::relu),
                ActivationKind::Sigmoid => kernels::map(x, dtype, kernels::sigmoid),
                ActivationKind::Tanh => kernels::map(x, dtype, f64::tanh),
                ActivationKind::Clip { min, max } => kernels::map(x, dtype, |v| v.max(min).min(max)),
                ActivationKind::LeakyRelu { alpha } => kernels::map(x, dtype, |v| kernels::leaky_relu(v, alpha)),
                ActivationKind::Elu { alpha } => kernels::map(x, dtype, |v| kernels::elu(v, alpha, 1.0, 1.0)),
            }
        }
        LayerKind::Unary(unary) => {
            let x = operand(0)?;
            let dtype = x.dtype();
            match unary {
                UnaryKind::Neg => kernels::map(x, dtype, |v| -v),
                UnaryKind::Abs => kernels::map(x, dtype, f64::abs),
                UnaryKind::Exp => kernels::map(x, float_result(dtype), f64::exp),
                UnaryKind::Log => kernels::map(x, float_result(dtype), f64::ln),
                UnaryKind::Sqrt => kernels::map(x, float_result(dtype), f64::sqrt),
                UnaryKind::Erf => kernels::map(x, float_result(dtype), kernels::erf_value),
                UnaryKind::Recip => kernels::map(x, float_result(dtype), |v| 1.0 / v),
            }
        }
        LayerKind::ElementWise(op) => {
            let (lhs, rhs) = (operand(0)?, operand(1)?);
            let dtype = kernels::promote(lhs.dtype(), rhs.dtype());
            let integral = !dtype.is_float();
            match op {
                ElementWiseKind::Sum => kernels::binary(lhs, rhs, dtype, |a, b| a + b),
                ElementWiseKind::Sub => kernels::binary(lhs, rhs, dtype, |a, b| a - b),
                ElementWiseKind::Prod => kernels::binary(lhs, rhs, dtype, |a, b| a * b),
                ElementWiseKind::Div if integral => kernels::binary(lhs, rhs, dtype, |a, b| (a / b).floor()),
                ElementWiseKind::Div => kernels::binary(lhs, rhs, dtype, |a, b| a / b),
                ElementWiseKind::Max => kernels::binary(lhs, rhs, dtype, f64::max),
                ElementWiseKind::Min => kernels::binary(lhs, rhs, dtype, f64::min),
                ElementWiseKind::Pow => kernels::binary(lhs, rhs, dtype, f64::powf),
            }
        }
        LayerKind::ParametricRelu => kernels::prelu(operand(0)?, operand(1)?),
        LayerKind::MatrixMultiply => kernels::matmul(operand(0)?, operand(1)?),
        LayerKind::Pad { pre, post, value } => kernels::pad(operand(0)?, pre, post, *value),
        LayerKind::Shuffle { permutation, reshape } => {
            let x = operand(0)?;
            let permuted = match permutation {
                Some(perm) => kernels::permute(x, perm)?,
                None => x.clone(),
            };
            match reshape {
                Some(target) => {
                    let dims = kernels::resolve_reshape(permuted.dims(), target, true)?;
                    kernels::reshape(&permuted, dims)
                }
                None => Ok(permuted),
            }
        }
        LayerKind::SoftMax { axis } => {
            let x = operand(0)?;
            kernels::softmax(x, *axis, x.dtype())
        }
        LayerKind::Reduce { op, axes, keep_dims } => {
            let x = operand(0)?;
            kernels::reduce(x, axes, *keep_dims, *op == ReduceKind::Mean, x.dtype())
        }
        LayerKind::Identity { dtype } => Ok(operand(0)?.cast(*dtype)),
    }
}
