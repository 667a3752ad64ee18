//! Network definition recorded by the reference builder.

use std::any::Any;

use serde::{Deserialize, Serialize};

use splice::backend::{
    BackendError, BackendResult, ElementWiseKind, LayerKind, NetworkDefinition, ReduceKind, TensorDesc,
    TensorRef, UnaryKind,
};
use splice::ir::{DType, Dimension, ShapeSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorRef>,
    pub output: TensorRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInput {
    pub name: String,
    pub tensor: TensorRef,
    pub dtype: DType,
    pub shape: ShapeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkOutput {
    pub name: String,
    pub tensor: TensorRef,
}

/// Layers in insertion order plus the descriptor of every tensor they produce.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefNetwork {
    pub(crate) tensors: Vec<TensorDesc>,
    pub(crate) inputs: Vec<NetworkInput>,
    pub(crate) layers: Vec<Layer>,
    pub(crate) outputs: Vec<NetworkOutput>,
}

impl RefNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> &[NetworkInput] {
        &self.inputs
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn outputs(&self) -> &[NetworkOutput] {
        &self.outputs
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn push_tensor(&mut self, desc: TensorDesc) -> TensorRef {
        let tensor = TensorRef(self.tensors.len() as u32);
        self.tensors.push(desc);
        tensor
    }

    fn check_tensor(&self, tensor: TensorRef) -> BackendResult<&TensorDesc> {
        self.tensors
            .get(tensor.0 as usize)
            .ok_or_else(|| BackendError::new(format!("tensor {} is not part of this network", tensor.0)))
    }

    /// Re-infers every tensor with each input fixed to `dims`.
    pub(crate) fn concrete_shapes(&self, input_dims: &[Vec<usize>]) -> BackendResult<Vec<TensorDesc>> {
        if input_dims.len() != self.inputs.len() {
            return Err(BackendError::new(format!(
                "network takes {} inputs, {} shapes given",
                self.inputs.len(),
                input_dims.len()
            )));
        }
        let mut tensors = self.tensors.clone();
        for (input, dims) in self.inputs.iter().zip(input_dims) {
            tensors[input.tensor.0 as usize] = TensorDesc {
                dtype: input.dtype,
                dims: dims.iter().copied().map(Dimension::Static).collect(),
            };
        }
        for (index, layer) in self.layers.iter().enumerate() {
            let operands: Vec<TensorDesc> = layer
                .inputs
                .iter()
                .map(|tensor| tensors[tensor.0 as usize].clone())
                .collect();
            let desc = infer(&layer.kind, &operands).map_err(|message| BackendError::at_layer(index, message))?;
            tensors[layer.output.0 as usize] = desc;
        }
        Ok(tensors)
    }
}

impl NetworkDefinition for RefNetwork {
    fn add_input(&mut self, name: &str, dtype: DType, shape: &ShapeSpec) -> BackendResult<TensorRef> {
        if self.inputs.iter().any(|input| input.name == name) {
            return Err(BackendError::new(format!("duplicate network input `{name}`")));
        }
        shape
            .validate()
            .map_err(|err| BackendError::new(format!("input `{name}`: {err}")))?;
        let tensor = self.push_tensor(TensorDesc {
            dtype,
            dims: shape.dimensions(),
        });
        self.inputs.push(NetworkInput {
            name: name.to_string(),
            tensor,
            dtype,
            shape: shape.clone(),
        });
        Ok(tensor)
    }

    fn add_layer(&mut self, kind: LayerKind, inputs: &[TensorRef], name: &str) -> BackendResult<Vec<TensorRef>> {
        let index = self.layers.len();
        let operands = inputs
            .iter()
            .map(|tensor| self.check_tensor(*tensor).cloned())
            .collect::<BackendResult<Vec<_>>>()
            .map_err(|err| BackendError::at_layer(index, err.message))?;
        let desc = infer(&kind, &operands)
            .map_err(|message| BackendError::at_layer(index, format!("{} `{name}`: {message}", kind.label())))?;
        let output = self.push_tensor(desc);
        self.layers.push(Layer {
            name: name.to_string(),
            kind,
            inputs: inputs.to_vec(),
            output,
        });
        Ok(vec![output])
    }

    fn mark_output(&mut self, tensor: TensorRef, name: &str) -> BackendResult<()> {
        self.check_tensor(tensor)?;
        if self.outputs.iter().any(|output| output.name == name) {
            return Err(BackendError::new(format!("duplicate network output `{name}`")));
        }
        self.outputs.push(NetworkOutput {
            name: name.to_string(),
            tensor,
        });
        Ok(())
    }

    fn tensor_desc(&self, tensor: TensorRef) -> Option<TensorDesc> {
        self.tensors.get(tensor.0 as usize).cloned()
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn expect_arity(operands: &[TensorDesc], arity: usize) -> Result<(), String> {
    if operands.len() == arity {
        Ok(())
    } else {
        Err(format!("expects {arity} inputs, got {}", operands.len()))
    }
}

fn expect_float(dtype: DType) -> Result<(), String> {
    if dtype.is_float() {
        Ok(())
    } else {
        Err(format!("needs a float tensor, got {dtype}"))
    }
}

fn broadcast_dims(lhs: &[Dimension], rhs: &[Dimension]) -> Result<Vec<Dimension>, String> {
    let rank = lhs.len().max(rhs.len());
    let at = |dims: &[Dimension], from_end: usize| {
        if from_end < dims.len() {
            dims[dims.len() - 1 - from_end]
        } else {
            Dimension::Static(1)
        }
    };
    (0..rank)
        .rev()
        .map(|from_end| match (at(lhs, from_end), at(rhs, from_end)) {
            (a, b) if a == b => Ok(a),
            (Dimension::Static(1), other) | (other, Dimension::Static(1)) => Ok(other),
            (Dimension::Dynamic, Dimension::Static(n)) | (Dimension::Static(n), Dimension::Dynamic) => {
                Ok(Dimension::Static(n))
            }
            (a, b) => Err(format!("dimensions {a} and {b} do not broadcast")),
        })
        .collect()
}

/// Output descriptor of one layer.
pub(crate) fn infer(kind: &LayerKind, operands: &[TensorDesc]) -> Result<TensorDesc, String> {
    match kind {
        LayerKind::Constant(tensor) => {
            expect_arity(operands, 0)?;
            Ok(TensorDesc {
                dtype: tensor.dtype(),
                dims: tensor.dims().iter().copied().map(Dimension::Static).collect(),
            })
        }
        LayerKind::Activation(_) => {
            expect_arity(operands, 1)?;
            expect_float(operands[0].dtype)?;
            Ok(operands[0].clone())
        }
        LayerKind::Unary(op) => {
            expect_arity(operands, 1)?;
            if !matches!(op, UnaryKind::Neg | UnaryKind::Abs) {
                expect_float(operands[0].dtype)?;
            }
            Ok(operands[0].clone())
        }
        LayerKind::ElementWise(op) => {
            expect_arity(operands, 2)?;
            let (lhs, rhs) = (&operands[0], &operands[1]);
            if lhs.dtype != rhs.dtype {
                return Err(format!("operand dtypes differ: {} vs {}", lhs.dtype, rhs.dtype));
            }
            if matches!(op, ElementWiseKind::Pow) {
                expect_float(lhs.dtype)?;
            }
            Ok(TensorDesc {
                dtype: lhs.dtype,
                dims: broadcast_dims(&lhs.dims, &rhs.dims)?,
            })
        }
        LayerKind::ParametricRelu => {
            expect_arity(operands, 2)?;
            expect_float(operands[0].dtype)?;
            if operands[1].rank() > 1 {
                return Err(format!("slope must be rank 0 or 1, got rank {}", operands[1].rank()));
            }
            Ok(operands[0].clone())
        }
        LayerKind::MatrixMultiply => {
            expect_arity(operands, 2)?;
            let (lhs, rhs) = (&operands[0], &operands[1]);
            expect_float(lhs.dtype)?;
            if lhs.dtype != rhs.dtype {
                return Err(format!("operand dtypes differ: {} vs {}", lhs.dtype, rhs.dtype));
            }
            if lhs.rank() < 2 || rhs.rank() < 2 {
                return Err(format!("operands need rank >= 2, got {} and {}", lhs.rank(), rhs.rank()));
            }
            let (m, k) = (lhs.dims[lhs.rank() - 2], lhs.dims[lhs.rank() - 1]);
            let (k2, n) = (rhs.dims[rhs.rank() - 2], rhs.dims[rhs.rank() - 1]);
            if let (Dimension::Static(a), Dimension::Static(b)) = (k, k2) {
                if a != b {
                    return Err(format!("inner dimensions differ: {a} vs {b}"));
                }
            }
            let mut dims = broadcast_dims(&lhs.dims[..lhs.rank() - 2], &rhs.dims[..rhs.rank() - 2])?;
            dims.extend([m, n]);
            Ok(TensorDesc { dtype: lhs.dtype, dims })
        }
        LayerKind::Pad { pre, post, .. } => {
            expect_arity(operands, 1)?;
            let input = &operands[0];
            if pre.len() != input.rank() || post.len() != input.rank() {
                return Err(format!("padding covers {} axes of a rank-{} tensor", pre.len(), input.rank()));
            }
            let dims = input
                .dims
                .iter()
                .zip(pre.iter().zip(post))
                .map(|(dim, (before, after))| match dim {
                    Dimension::Static(extent) => {
                        let padded = *extent as i64 + before + after;
                        if padded < 0 {
                            Err(format!("padding crops extent {extent} below zero"))
                        } else {
                            Ok(Dimension::Static(padded as usize))
                        }
                    }
                    Dimension::Dynamic => Ok(Dimension::Dynamic),
                })
                .collect::<Result<Vec<_>, String>>()?;
            Ok(TensorDesc {
                dtype: input.dtype,
                dims,
            })
        }
        LayerKind::Shuffle { permutation, reshape } => {
            expect_arity(operands, 1)?;
            let input = &operands[0];
            let mut dims = input.dims.clone();
            if let Some(perm) = permutation {
                let mut sorted = perm.clone();
                sorted.sort_unstable();
                if sorted != (0..input.rank()).collect::<Vec<_>>() {
                    return Err(format!("{perm:?} is not a permutation of rank {}", input.rank()));
                }
                dims = perm.iter().map(|&axis| input.dims[axis]).collect();
            }
            if let Some(target) = reshape {
                dims = reshape_dims(&dims, target)?;
            }
            Ok(TensorDesc {
                dtype: input.dtype,
                dims,
            })
        }
        LayerKind::SoftMax { axis } => {
            expect_arity(operands, 1)?;
            expect_float(operands[0].dtype)?;
            if *axis >= operands[0].rank().max(1) {
                return Err(format!("axis {axis} out of range for rank {}", operands[0].rank()));
            }
            Ok(operands[0].clone())
        }
        LayerKind::Reduce { op, axes, keep_dims } => {
            expect_arity(operands, 1)?;
            let input = &operands[0];
            if *op == ReduceKind::Mean {
                expect_float(input.dtype)?;
            }
            if let Some(axis) = axes.iter().find(|&&axis| axis >= input.rank().max(1)) {
                return Err(format!("axis {axis} out of range for rank {}", input.rank()));
            }
            let dims = input
                .dims
                .iter()
                .enumerate()
                .filter_map(|(axis, dim)| match (axes.contains(&axis), keep_dims) {
                    (false, _) => Some(*dim),
                    (true, true) => Some(Dimension::Static(1)),
                    (true, false) => None,
                })
                .collect();
            Ok(TensorDesc {
                dtype: input.dtype,
                dims,
            })
        }
        LayerKind::Identity { dtype } => {
            expect_arity(operands, 1)?;
            Ok(TensorDesc {
                dtype: *dtype,
                dims: operands[0].dims.clone(),
            })
        }
    }
}

/// Reshape over possibly dynamic dims: `0` copies, one `-1` is inferred when
/// everything else is static.
fn reshape_dims(dims: &[Dimension], target: &[i64]) -> Result<Vec<Dimension>, String> {
    if target.iter().filter(|&&extent| extent == -1).count() > 1 {
        return Err(format!("{target:?} infers more than one axis"));
    }
    let mut out = Vec::with_capacity(target.len());
    for (axis, &extent) in target.iter().enumerate() {
        let dim = match extent {
            -1 => Dimension::Dynamic,
            0 => *dims
                .get(axis)
                .ok_or_else(|| format!("{target:?} copies axis {axis} of a rank-{} tensor", dims.len()))?,
            extent if extent > 0 => Dimension::Static(extent as usize),
            extent => return Err(format!("invalid extent {extent} in {target:?}")),
        };
        out.push(dim);
    }
    let Some(inferred) = target.iter().position(|&extent| extent == -1) else {
        return Ok(out);
    };
    let total: Option<usize> = dims.iter().map(|dim| dim.as_static()).product();
    let known: Option<usize> = out
        .iter()
        .enumerate()
        .filter(|(axis, _)| *axis != inferred)
        .map(|(_, dim)| dim.as_static())
        .product();
    if let (Some(total), Some(known)) = (total, known) {
        if known == 0 || total % known != 0 {
            return Err(format!("cannot reshape {dims:?} into {target:?}"));
        }
        out[inferred] = Dimension::Static(total / known);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(dims: &[Dimension]) -> TensorDesc {
        TensorDesc {
            dtype: DType::F32,
            dims: dims.to_vec(),
        }
    }

    #[test]
    fn dynamic_axes_survive_padding_and_broadcast() {
        let x = desc(&[Dimension::Dynamic, Dimension::Static(4)]);
        let padded = infer(
            &LayerKind::Pad {
                pre: vec![0, 1],
                post: vec![0, 2],
                value: 0.0,
            },
            &[x.clone()],
        )
        .expect("pad");
        assert_eq!(padded.dims, vec![Dimension::Dynamic, Dimension::Static(7)]);

        let bias = desc(&[Dimension::Static(1), Dimension::Static(4)]);
        let sum = infer(&LayerKind::ElementWise(ElementWiseKind::Sum), &[x, bias]).expect("sum");
        assert_eq!(sum.dims, vec![Dimension::Dynamic, Dimension::Static(4)]);
    }

    #[test]
    fn reshape_infers_only_when_static() {
        let fixed = [Dimension::Static(2), Dimension::Static(6)];
        assert_eq!(
            reshape_dims(&fixed, &[0, 3, -1]).expect("reshape"),
            vec![Dimension::Static(2), Dimension::Static(3), Dimension::Static(2)]
        );
        let ranged = [Dimension::Dynamic, Dimension::Static(6)];
        assert_eq!(
            reshape_dims(&ranged, &[0, -1]).expect("reshape"),
            vec![Dimension::Dynamic, Dimension::Dynamic]
        );
    }

    #[test]
    fn mixed_dtypes_are_rejected() {
        let lhs = desc(&[Dimension::Static(2)]);
        let rhs = TensorDesc {
            dtype: DType::I32,
            dims: vec![Dimension::Static(2)],
        };
        assert!(infer(&LayerKind::ElementWise(ElementWiseKind::Prod), &[lhs, rhs]).is_err());
    }
}
