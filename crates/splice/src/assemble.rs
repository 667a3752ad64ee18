//! Splices compiled engines back into the lowered graph.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backend::{AcceleratorBackend, BackendError};
use crate::compile::{fnv1a_hash, CompiledEngine, EngineIo, EngineKey};
use crate::config::Device;
use crate::ir::{
    Attr, Graph, Node, NodeId, OpKind, StructuralError, TensorType, ValueId,
    ValueType,
};
use crate::partition::{Block, PartitionPlan};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("segment {segment} has no compiled engine")]
    MissingEngine { segment: usize },
    #[error("node {node} is in the plan but not in the graph")]
    UnknownNode { node: NodeId },
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("engine: {0}")]
    Backend(#[from] BackendError),
    #[error("program json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("engine call {node} names engine {engine}, but the program holds {count}")]
    EngineIndex {
        node: NodeId,
        engine: i64,
        count: usize,
    },
}

/// Lowered graph whose segments are replaced by engine calls, plus the
/// engines those calls name.
#[derive(Debug, Clone)]
pub struct HybridProgram {
    graph: Graph,
    engines: Vec<CompiledEngine>,
}

impl HybridProgram {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn engines(&self) -> &[CompiledEngine] {
        &self.engines
    }

    /// Nodes still run by the interpreter.
    pub fn fallback_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.graph
            .nodes
            .iter()
            .filter(|node| node.kind != OpKind::EngineCall)
    }

    pub fn engine_calls(&self) -> impl Iterator<Item = &Node> + '_ {
        self.graph
            .nodes
            .iter()
            .filter(|node| node.kind == OpKind::EngineCall)
    }

    /// Serializes the graph and every engine's bytes.
    pub fn to_json(&self) -> Result<String, AssembleError> {
        let engines = self
            .engines
            .iter()
            .map(|compiled| -> Result<SerializedEngine, AssembleError> {
                Ok(SerializedEngine {
                    segment: compiled.segment,
                    key: compiled.key,
                    inputs: compiled.inputs.clone(),
                    outputs: compiled.outputs.clone(),
                    bytes: compiled.engine.serialize()?,
                })
            })
            .collect::<Result<Vec<_>, AssembleError>>()?;
        let program = SerializedProgram {
            graph: self.graph.clone(),
            engines,
        };
        Ok(serde_json::to_string(&program)?)
    }

    /// Restores a program, rebuilding each engine through `backend`.
    pub fn from_json(
        text: &str,
        backend: &dyn AcceleratorBackend,
        device: &Device,
    ) -> Result<Self, AssembleError> {
        let program: SerializedProgram = serde_json::from_str(text)?;
        program.graph.verify()?;
        let engines = program
            .engines
            .into_iter()
            .map(|serialized| -> Result<CompiledEngine, AssembleError> {
                Ok(CompiledEngine {
                    segment: serialized.segment,
                    key: serialized.key,
                    engine: backend.deserialize_engine(&serialized.bytes, device)?,
                    inputs: serialized.inputs,
                    outputs: serialized.outputs,
                })
            })
            .collect::<Result<Vec<_>, AssembleError>>()?;
        let program = Self {
            graph: program.graph,
            engines,
        };
        program.check_engine_indices()?;
        Ok(program)
    }

    fn check_engine_indices(&self) -> Result<(), AssembleError> {
        for node in self.engine_calls() {
            let engine = node.int_attr("engine").unwrap_or(-1);
            let valid = usize::try_from(engine).is_ok_and(|index| index < self.engines.len());
            if !valid {
                return Err(AssembleError::EngineIndex {
                    node: node.id,
                    engine,
                    count: self.engines.len(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedEngine {
    segment: usize,
    key: EngineKey,
    inputs: Vec<EngineIo>,
    outputs: Vec<EngineIo>,
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SerializedProgram {
    graph: Graph,
    engines: Vec<SerializedEngine>,
}

fn engine_call(index: usize, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> Node {
    Node {
        id: NodeId(0),
        kind: OpKind::EngineCall,
        inputs,
        outputs,
        attrs: BTreeMap::from([("engine".to_string(), Attr::Int(index as i64))]),
        scope: None,
    }
}

/// Replaces each planned segment with one engine call node.
///
/// `engines` may come in any order; each segment picks the engine compiled
/// for its id. Fallback nodes keep their ids.
pub fn assemble(
    graph: &Graph,
    plan: &PartitionPlan,
    engines: Vec<CompiledEngine>,
) -> Result<HybridProgram, AssembleError> {
    let mut by_segment: HashMap<usize, CompiledEngine> = engines
        .into_iter()
        .map(|compiled| (compiled.segment, compiled))
        .collect();
    let mut program = graph.clone();
    program.nodes.clear();
    let mut table = Vec::new();

    for block in &plan.blocks {
        match block {
            Block::Fallback { node, .. } => {
                let original = graph
                    .node(*node)
                    .ok_or(AssembleError::UnknownNode { node: *node })?;
                program.nodes.push(original.clone());
            }
            Block::Segment(segment) => {
                let compiled = by_segment
                    .remove(&segment.id)
                    .ok_or(AssembleError::MissingEngine {
                        segment: segment.id,
                    })?;
                let index = table.len();
                table.push(compiled);
                program.push_node(engine_call(
                    index,
                    segment.inputs.clone(),
                    segment.outputs.clone(),
                ));
            }
        }
    }
    program.verify()?;
    debug!(
        engines = table.len(),
        fallback = program.nodes.len() - table.len(),
        "assembled hybrid program"
    );
    Ok(HybridProgram {
        graph: program,
        engines: table,
    })
}

/// Wraps one serialized engine into a program: graph inputs feed a single
/// engine call whose results are the graph outputs.
pub fn embed_engine(
    backend: &dyn AcceleratorBackend,
    bytes: &[u8],
    device: &Device,
) -> Result<HybridProgram, AssembleError> {
    let engine = backend.deserialize_engine(bytes, device)?;
    let mut graph = Graph::new("embedded_engine");
    let mut inputs = Vec::with_capacity(engine.inputs().len());
    let mut input_io = Vec::with_capacity(engine.inputs().len());
    for binding in engine.inputs() {
        let ty = ValueType::Tensor(TensorType {
            dtype: Some(binding.dtype),
            shape: Some(binding.shape.dimensions()),
        });
        let value = graph.add_input(ty, binding.name.clone());
        inputs.push(value);
        input_io.push(EngineIo {
            value,
            declared: Some(binding.dtype),
            engine: binding.dtype,
        });
    }
    let mut outputs = Vec::with_capacity(engine.outputs().len());
    let mut output_io = Vec::with_capacity(engine.outputs().len());
    for binding in engine.outputs() {
        let ty = ValueType::Tensor(TensorType {
            dtype: Some(binding.dtype),
            shape: Some(binding.shape.dimensions()),
        });
        let value = graph.new_value(ty, Some(binding.name.clone()));
        outputs.push(value);
        output_io.push(EngineIo {
            value,
            declared: Some(binding.dtype),
            engine: binding.dtype,
        });
    }
    graph.push_node(engine_call(0, inputs, outputs.clone()));
    graph.outputs = outputs;
    graph.verify()?;

    let hash = fnv1a_hash(bytes);
    Ok(HybridProgram {
        graph,
        engines: vec![CompiledEngine {
            segment: 0,
            key: EngineKey {
                segment_hash: hash,
                config_hash: hash,
            },
            engine,
            inputs: input_io,
            outputs: output_io,
        }],
    })
}
