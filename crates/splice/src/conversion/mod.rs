//! Node-to-layer conversion.
//!
//! Every convertible [`OpKind`] has a support predicate and a converter
//! registered in a [`ConverterRegistry`]. The partitioner asks the predicate;
//! the segment compiler runs the converter inside a [`ConversionCtx`].

mod converters;
mod registry;

use std::collections::HashMap;

use thiserror::Error;

use crate::backend::{BackendError, LayerKind, NetworkDefinition, TensorDesc, TensorRef};
use crate::ir::{Graph, HostTensor, Node, NodeId, OpKind, ValueId};

pub use registry::{default_registry, ConvertFn, ConverterEntry, ConverterRegistry, SupportFn};

/// Answer of a support predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported(String),
}

impl Support {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Support::Unsupported(reason.into())
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported)
    }

    /// First failing check wins.
    pub fn and_then(self, next: impl FnOnce() -> Support) -> Support {
        match self {
            Support::Supported => next(),
            unsupported => unsupported,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    /// A converter ran on a node its own predicate rejects.
    #[error("internal error: converter for {kind} invoked on unsupported node {node}: {reason}")]
    Internal {
        node: NodeId,
        kind: OpKind,
        reason: String,
    },
    #[error("node {node} ({kind}): {message}")]
    Failed {
        node: NodeId,
        kind: OpKind,
        message: String,
    },
    #[error("node {node} ({kind}) reads {value}, which has no network tensor")]
    MissingTensor {
        node: NodeId,
        kind: OpKind,
        value: ValueId,
    },
    #[error("node {node} ({kind}) produced {found} tensors for {expected} declared outputs")]
    OutputCount {
        node: NodeId,
        kind: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("node {node} ({kind}) output {value} is {found} but declared {expected}")]
    OutputMismatch {
        node: NodeId,
        kind: OpKind,
        value: ValueId,
        expected: String,
        found: String,
    },
    #[error("node {node} ({kind}): {source}")]
    Backend {
        node: NodeId,
        kind: OpKind,
        #[source]
        source: BackendError,
    },
}

impl ConversionError {
    /// Node the failure is attributed to.
    pub fn node(&self) -> NodeId {
        match self {
            ConversionError::Internal { node, .. }
            | ConversionError::Failed { node, .. }
            | ConversionError::MissingTensor { node, .. }
            | ConversionError::OutputCount { node, .. }
            | ConversionError::OutputMismatch { node, .. }
            | ConversionError::Backend { node, .. } => *node,
        }
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Build state threaded through the converters of one segment.
pub struct ConversionCtx<'g> {
    graph: &'g Graph,
    network: Box<dyn NetworkDefinition>,
    values: HashMap<ValueId, TensorRef>,
    /// Node that emitted each layer, indexed by layer number.
    layer_nodes: Vec<NodeId>,
    current: Option<(NodeId, OpKind)>,
    truncate_64bit: bool,
}

impl<'g> ConversionCtx<'g> {
    pub fn new(graph: &'g Graph, network: Box<dyn NetworkDefinition>, truncate_64bit: bool) -> Self {
        Self {
            graph,
            network,
            values: HashMap::new(),
            layer_nodes: Vec::new(),
            current: None,
            truncate_64bit,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn truncate_64bit(&self) -> bool {
        self.truncate_64bit
    }

    pub fn network_mut(&mut self) -> &mut dyn NetworkDefinition {
        self.network.as_mut()
    }

    /// Records the network tensor standing for `value`.
    pub fn bind(&mut self, value: ValueId, tensor: TensorRef) {
        self.values.insert(value, tensor);
    }

    pub fn lookup(&self, value: ValueId) -> Option<TensorRef> {
        self.values.get(&value).copied()
    }

    /// Node a layer was emitted for, if any.
    pub fn node_for_layer(&self, layer: usize) -> Option<NodeId> {
        self.layer_nodes.get(layer).copied()
    }

    /// Emitting node of every layer so far, indexed by layer number.
    pub fn layer_attribution(&self) -> &[NodeId] {
        &self.layer_nodes
    }

    pub fn into_network(self) -> Box<dyn NetworkDefinition> {
        self.network
    }

    pub(crate) fn begin_node(&mut self, node: &Node) {
        self.current = Some((node.id, node.kind));
    }

    fn current(&self) -> (NodeId, OpKind) {
        self.current.unwrap_or((NodeId(u32::MAX), OpKind::Constant))
    }

    pub fn fail(&self, message: impl Into<String>) -> ConversionError {
        let (node, kind) = self.current();
        ConversionError::Failed {
            node,
            kind,
            message: message.into(),
        }
    }

    /// Network tensor of operand `index` of `node`.
    pub fn input(&self, node: &Node, index: usize) -> ConversionResult<TensorRef> {
        let value = *node
            .inputs
            .get(index)
            .ok_or_else(|| self.fail(format!("missing operand {index}")))?;
        self.lookup(value).ok_or(ConversionError::MissingTensor {
            node: node.id,
            kind: node.kind,
            value,
        })
    }

    pub fn desc(&self, tensor: TensorRef) -> ConversionResult<TensorDesc> {
        self.network
            .tensor_desc(tensor)
            .ok_or_else(|| self.fail(format!("unknown network tensor {}", tensor.0)))
    }

    /// Adds a layer attributed to the current node and returns its outputs.
    pub fn add_layer_multi(
        &mut self,
        kind: LayerKind,
        inputs: &[TensorRef],
    ) -> ConversionResult<Vec<TensorRef>> {
        let (node, op) = self.current();
        let name = format!("{node}:{}", kind.label());
        let outputs = self
            .network
            .add_layer(kind, inputs, &name)
            .map_err(|source| ConversionError::Backend {
                node,
                kind: op,
                source,
            })?;
        while self.layer_nodes.len() < self.network.layer_count() {
            self.layer_nodes.push(node);
        }
        Ok(outputs)
    }

    pub fn add_layer(&mut self, kind: LayerKind, inputs: &[TensorRef]) -> ConversionResult<TensorRef> {
        let outputs = self.add_layer_multi(kind, inputs)?;
        match outputs.as_slice() {
            [single] => Ok(*single),
            _ => Err(self.fail(format!("layer produced {} outputs, expected 1", outputs.len()))),
        }
    }

    /// Embeds `tensor` as a constant layer, truncating 64-bit data when allowed.
    pub fn constant(&mut self, tensor: HostTensor) -> ConversionResult<TensorRef> {
        let tensor = if tensor.dtype().is_64bit() {
            if !self.truncate_64bit {
                return Err(self.fail(format!(
                    "{} constant needs truncate_long_and_double",
                    tensor.dtype()
                )));
            }
            tensor.cast(tensor.dtype().truncated())
        } else {
            tensor
        };
        self.add_layer(LayerKind::Constant(tensor), &[])
    }

    /// Constant of `rank` unit dims, ready to broadcast against a rank-`rank` tensor.
    pub fn broadcast_scalar(
        &mut self,
        value: f64,
        like: &TensorDesc,
    ) -> ConversionResult<TensorRef> {
        let dims = vec![1; like.rank()];
        let tensor = HostTensor::from_f64_values(like.dtype, dims, &[value])
            .map_err(|err| self.fail(err.to_string()))?;
        self.add_layer(LayerKind::Constant(tensor), &[])
    }

    /// Binds converter outputs to `node`'s declared outputs, checking count,
    /// dtype and rank against the declared value types.
    pub fn bind_outputs(&mut self, node: &Node, tensors: &[TensorRef]) -> ConversionResult<()> {
        if tensors.len() != node.outputs.len() {
            return Err(ConversionError::OutputCount {
                node: node.id,
                kind: node.kind,
                expected: node.outputs.len(),
                found: tensors.len(),
            });
        }
        for (value, tensor) in node.outputs.iter().zip(tensors) {
            let desc = self.desc(*tensor)?;
            if let Some(declared) = self.graph.value_type(*value).and_then(|ty| ty.as_tensor()) {
                let dtype_ok = match declared.dtype {
                    Some(dtype) => {
                        dtype == desc.dtype || (self.truncate_64bit && dtype.truncated() == desc.dtype)
                    }
                    None => true,
                };
                let rank_ok = declared.rank().map_or(true, |rank| rank == desc.rank());
                if !(dtype_ok && rank_ok) {
                    return Err(ConversionError::OutputMismatch {
                        node: node.id,
                        kind: node.kind,
                        value: *value,
                        expected: self.graph.value_type(*value).map(|ty| ty.to_string()).unwrap_or_default(),
                        found: format!("tensor<{}, rank {}>", desc.dtype, desc.rank()),
                    });
                }
            }
            self.values.insert(*value, *tensor);
        }
        Ok(())
    }
}
