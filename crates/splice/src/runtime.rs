//! Node-order execution of plain graphs and hybrid programs.
//!
//! Fallback nodes go to a [`NodeInterpreter`]; `splice::EngineCall` nodes go
//! to the compiled engine they name. Every call gets fresh buffers, so one
//! program may run on several threads at once.

use std::collections::HashMap;

use thiserror::Error;

use crate::assemble::HybridProgram;
use crate::backend::BackendError;
use crate::ir::{Attr, DType, Graph, HostTensor, Node, NodeId, OpKind, ValueId, ValueType};

/// A value flowing through the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Tensor(HostTensor),
    Scalar(Attr),
}

impl RuntimeValue {
    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            RuntimeValue::Tensor(tensor) => Some(tensor),
            RuntimeValue::Scalar(_) => None,
        }
    }

    pub fn into_tensor(self) -> Result<HostTensor, ExecError> {
        match self {
            RuntimeValue::Tensor(tensor) => Ok(tensor),
            RuntimeValue::Scalar(attr) => Err(ExecError::NotATensor {
                found: attr.to_string(),
            }),
        }
    }
}

impl From<HostTensor> for RuntimeValue {
    fn from(tensor: HostTensor) -> Self {
        RuntimeValue::Tensor(tensor)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("graph takes {expected} inputs, {found} given")]
    InputCount { expected: usize, found: usize },
    #[error("input {index}: {message}")]
    InputMismatch { index: usize, message: String },
    #[error("value {value} is read before it is computed")]
    Unbound { value: ValueId },
    #[error("node {node} ({kind}): {message}")]
    Node {
        node: NodeId,
        kind: OpKind,
        message: String,
    },
    #[error("node {node} ({kind}) returned {found} values for {expected} outputs")]
    OutputCount {
        node: NodeId,
        kind: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("engine {engine}: {source}")]
    Engine {
        engine: usize,
        #[source]
        source: BackendError,
    },
    #[error("expected a tensor, found {found}")]
    NotATensor { found: String },
}

impl ExecError {
    pub fn at_node(node: &Node, message: impl Into<String>) -> Self {
        ExecError::Node {
            node: node.id,
            kind: node.kind,
            message: message.into(),
        }
    }
}

/// Executes the nodes that stay under the original interpreter.
pub trait NodeInterpreter: Send + Sync {
    fn execute(&self, node: &Node, inputs: &[RuntimeValue]) -> Result<Vec<RuntimeValue>, ExecError>;
}

/// Runs `graph` entirely under `interpreter`.
pub fn run_graph(
    graph: &Graph,
    interpreter: &dyn NodeInterpreter,
    inputs: &[HostTensor],
) -> Result<Vec<HostTensor>, ExecError> {
    let outputs = execute(graph, inputs, |node, args| interpreter.execute(node, args), |_, _| {})?;
    outputs.into_iter().map(RuntimeValue::into_tensor).collect()
}

impl HybridProgram {
    /// Runs the program, sending engine calls to their engines and every
    /// other node to `interpreter`.
    pub fn run(
        &self,
        interpreter: &dyn NodeInterpreter,
        inputs: &[HostTensor],
    ) -> Result<Vec<HostTensor>, ExecError> {
        let outputs = execute(
            self.graph(),
            inputs,
            |node, args| {
                if node.kind == OpKind::EngineCall {
                    self.call_engine(node, args)
                } else {
                    interpreter.execute(node, args)
                }
            },
            |_, _| {},
        )?;
        outputs.into_iter().map(RuntimeValue::into_tensor).collect()
    }

    fn call_engine(&self, node: &Node, args: &[RuntimeValue]) -> Result<Vec<RuntimeValue>, ExecError> {
        let index = node
            .int_attr("engine")
            .and_then(|index| usize::try_from(index).ok())
            .ok_or_else(|| ExecError::at_node(node, "engine call without an engine index"))?;
        let compiled = self
            .engines()
            .get(index)
            .ok_or_else(|| ExecError::at_node(node, format!("engine {index} is not in the program")))?;
        if args.len() != compiled.inputs.len() {
            return Err(ExecError::at_node(
                node,
                format!("engine takes {} inputs, {} given", compiled.inputs.len(), args.len()),
            ));
        }
        let mut feeds = Vec::with_capacity(args.len());
        for (arg, binding) in args.iter().zip(&compiled.inputs) {
            let tensor = arg
                .as_tensor()
                .ok_or_else(|| ExecError::at_node(node, format!("{} is not a tensor", binding.value)))?;
            feeds.push(cast_if_needed(tensor, binding.engine));
        }
        let results = compiled
            .engine
            .execute(&feeds)
            .map_err(|source| ExecError::Engine {
                engine: index,
                source,
            })?;
        if results.len() != compiled.outputs.len() {
            return Err(ExecError::OutputCount {
                node: node.id,
                kind: node.kind,
                expected: compiled.outputs.len(),
                found: results.len(),
            });
        }
        Ok(results
            .into_iter()
            .zip(&compiled.outputs)
            .map(|(tensor, binding)| match binding.declared {
                Some(declared) => RuntimeValue::Tensor(cast_if_needed(&tensor, declared)),
                None => RuntimeValue::Tensor(tensor),
            })
            .collect())
    }
}

fn cast_if_needed(tensor: &HostTensor, dtype: DType) -> HostTensor {
    if tensor.dtype() == dtype {
        tensor.clone()
    } else {
        tensor.cast(dtype)
    }
}

/// Core loop shared by the executors and shape analysis. `observe` sees every
/// value as it becomes available, graph inputs included.
pub(crate) fn execute<S, O>(
    graph: &Graph,
    inputs: &[HostTensor],
    mut step: S,
    mut observe: O,
) -> Result<Vec<RuntimeValue>, ExecError>
where
    S: FnMut(&Node, &[RuntimeValue]) -> Result<Vec<RuntimeValue>, ExecError>,
    O: FnMut(ValueId, &RuntimeValue),
{
    if inputs.len() != graph.inputs.len() {
        return Err(ExecError::InputCount {
            expected: graph.inputs.len(),
            found: inputs.len(),
        });
    }
    let mut env: HashMap<ValueId, RuntimeValue> = HashMap::with_capacity(graph.values.len());
    for (index, (value, tensor)) in graph.inputs.iter().zip(inputs).enumerate() {
        check_input(graph, index, *value, tensor)?;
        let entry = RuntimeValue::Tensor(tensor.clone());
        observe(*value, &entry);
        env.insert(*value, entry);
    }

    for node in &graph.nodes {
        let args = node
            .inputs
            .iter()
            .map(|value| env.get(value).cloned().ok_or(ExecError::Unbound { value: *value }))
            .collect::<Result<Vec<_>, _>>()?;
        let results = step(node, &args)?;
        if results.len() != node.outputs.len() {
            return Err(ExecError::OutputCount {
                node: node.id,
                kind: node.kind,
                expected: node.outputs.len(),
                found: results.len(),
            });
        }
        for (value, result) in node.outputs.iter().zip(results) {
            observe(*value, &result);
            env.insert(*value, result);
        }
    }

    graph
        .outputs
        .iter()
        .map(|value| env.get(value).cloned().ok_or(ExecError::Unbound { value: *value }))
        .collect()
}

fn check_input(graph: &Graph, index: usize, value: ValueId, tensor: &HostTensor) -> Result<(), ExecError> {
    let Some(ValueType::Tensor(declared)) = graph.value_type(value) else {
        return Ok(());
    };
    if let Some(dtype) = declared.dtype {
        if dtype != tensor.dtype() {
            return Err(ExecError::InputMismatch {
                index,
                message: format!("expected {dtype}, found {}", tensor.dtype()),
            });
        }
    }
    if let Some(dims) = &declared.shape {
        let fits = dims.len() == tensor.rank()
            && dims
                .iter()
                .zip(tensor.dims())
                .all(|(dim, actual)| dim.as_static().map_or(true, |extent| extent == *actual));
        if !fits {
            return Err(ExecError::InputMismatch {
                index,
                message: format!("shape {:?} does not fit the declared type", tensor.dims()),
            });
        }
    }
    Ok(())
}
