//! Narrow contract to the accelerator's engine builder.
//!
//! A backend hands out empty [`NetworkDefinition`]s, the segment compiler fills
//! them layer by layer, and [`AcceleratorBackend::build`] turns a finished
//! network into an immutable [`Engine`].

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CalibrationRef, Device, EngineCapability, Precision};
use crate::ir::{DType, Dimension, HostTensor, ShapeSpec};

/// Handle of a tensor inside one network definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorRef(pub u32);

/// Dtype and (possibly dynamic) dims of a network tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: DType,
    pub dims: Vec<Dimension>,
}

impl TensorDesc {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Clip { min: f64, max: f64 },
    LeakyRelu { alpha: f64 },
    Elu { alpha: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryKind {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Erf,
    Recip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementWiseKind {
    Sum,
    Sub,
    Prod,
    Div,
    Max,
    Min,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Mean,
}

/// Closed set of layers a network definition accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Constant(HostTensor),
    Activation(ActivationKind),
    Unary(UnaryKind),
    /// Two inputs, numpy-style broadcast.
    ElementWise(ElementWiseKind),
    /// Inputs `(x, slope)`; slope broadcasts along the channel axis.
    ParametricRelu,
    /// Batched matmul over the two trailing axes.
    MatrixMultiply,
    /// Per-axis padding; negative amounts crop.
    Pad {
        pre: Vec<i64>,
        post: Vec<i64>,
        value: f64,
    },
    /// Optional permutation followed by an optional reshape. In `reshape`, `0`
    /// copies the input extent and one `-1` is inferred.
    Shuffle {
        permutation: Option<Vec<usize>>,
        reshape: Option<Vec<i64>>,
    },
    SoftMax {
        axis: usize,
    },
    Reduce {
        op: ReduceKind,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    /// Copy, converting to `dtype`.
    Identity {
        dtype: DType,
    },
}

impl LayerKind {
    pub fn label(&self) -> &'static str {
        match self {
            LayerKind::Constant(_) => "constant",
            LayerKind::Activation(_) => "activation",
            LayerKind::Unary(_) => "unary",
            LayerKind::ElementWise(_) => "elementwise",
            LayerKind::ParametricRelu => "parametric_relu",
            LayerKind::MatrixMultiply => "matrix_multiply",
            LayerKind::Pad { .. } => "padding",
            LayerKind::Shuffle { .. } => "shuffle",
            LayerKind::SoftMax { .. } => "softmax",
            LayerKind::Reduce { .. } => "reduce",
            LayerKind::Identity { .. } => "identity",
        }
    }
}

/// Builder rejection or engine failure reported by a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Index of the offending layer, when the failure can be pinned to one.
    pub layer: Option<usize>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            layer: None,
        }
    }

    pub fn at_layer(layer: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            layer: Some(layer),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Options forwarded to [`AcceleratorBackend::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub precisions: BTreeSet<Precision>,
    pub device: Device,
    pub capability: EngineCapability,
    pub workspace_size: Option<u64>,
    pub num_min_timing_iters: u32,
    pub num_avg_timing_iters: u32,
    pub max_batch_size: Option<u32>,
    pub debug: bool,
    pub strict_types: bool,
    pub sparse_weights: bool,
    pub disable_tf32: bool,
    pub calibrator: Option<CalibrationRef>,
}

/// Network under construction. Layers are numbered in insertion order.
pub trait NetworkDefinition: Send {
    fn add_input(&mut self, name: &str, dtype: DType, shape: &ShapeSpec) -> BackendResult<TensorRef>;

    fn add_layer(
        &mut self,
        kind: LayerKind,
        inputs: &[TensorRef],
        name: &str,
    ) -> BackendResult<Vec<TensorRef>>;

    fn mark_output(&mut self, tensor: TensorRef, name: &str) -> BackendResult<()>;

    fn tensor_desc(&self, tensor: TensorRef) -> Option<TensorDesc>;

    fn layer_count(&self) -> usize;

    /// Lets the owning backend recover its concrete network type.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// One engine input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineBinding {
    pub name: String,
    pub dtype: DType,
    pub shape: ShapeSpec,
}

/// Built engine. Immutable; concurrent calls must use distinct buffers.
pub trait Engine: Send + Sync + fmt::Debug {
    fn inputs(&self) -> &[EngineBinding];

    fn outputs(&self) -> &[EngineBinding];

    fn execute(&self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>>;

    fn serialize(&self) -> BackendResult<Vec<u8>>;
}

pub trait AcceleratorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn create_network(&self) -> Box<dyn NetworkDefinition>;

    fn build(
        &self,
        network: Box<dyn NetworkDefinition>,
        config: &BuilderConfig,
    ) -> BackendResult<Arc<dyn Engine>>;

    fn deserialize_engine(&self, bytes: &[u8], device: &Device) -> BackendResult<Arc<dyn Engine>>;
}
