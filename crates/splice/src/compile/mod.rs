//! Segment compilation: one [`Segment`] in, one [`CompiledEngine`] out.

mod cache;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, debug_span};

use crate::backend::{AcceleratorBackend, BackendError, BuilderConfig, Engine, TensorRef};
use crate::config::CompileConfig;
use crate::conversion::{ConversionCtx, ConversionError, ConverterRegistry};
use crate::ir::{DType, Graph, NodeId, ShapeSpec, ValueId, ValueType};
use crate::partition::{Segment, ShapeTable};

pub use cache::{config_digest, fnv1a_hash, segment_fingerprint, EngineCache, EngineKey};

/// Failure to turn a segment into an engine. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "segment {segment}{}: {message}",
    .node.map(|node| format!(" (node {node})")).unwrap_or_default()
)]
pub struct BuildError {
    pub segment: usize,
    /// Node the failure is attributed to, when known.
    pub node: Option<NodeId>,
    pub message: String,
}

impl BuildError {
    pub fn new(segment: usize, node: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            segment,
            node,
            message: message.into(),
        }
    }

    fn conversion(segment: usize, err: ConversionError) -> Self {
        Self::new(segment, Some(err.node()), err.to_string())
    }

    fn backend(segment: usize, attribution: &[NodeId], err: BackendError) -> Self {
        let node = err.layer.and_then(|layer| attribution.get(layer).copied());
        Self::new(segment, node, err.message)
    }
}

/// One side of an engine binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineIo {
    pub value: ValueId,
    /// Dtype the surrounding program expects, when known.
    pub declared: Option<DType>,
    /// Dtype the engine reads or writes.
    pub engine: DType,
}

/// Immutable result of compiling one segment.
#[derive(Debug, Clone)]
pub struct CompiledEngine {
    pub segment: usize,
    pub key: EngineKey,
    pub engine: Arc<dyn Engine>,
    pub inputs: Vec<EngineIo>,
    pub outputs: Vec<EngineIo>,
}

/// Resolved segment input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryInput {
    pub value: ValueId,
    pub declared: Option<DType>,
    pub engine: DType,
    pub shape: ShapeSpec,
}

/// Options the builder sees, taken from a compile config.
pub fn builder_config(config: &CompileConfig) -> BuilderConfig {
    BuilderConfig {
        precisions: config.enabled_precisions.clone(),
        device: config.device.clone(),
        capability: config.capability,
        workspace_size: config.workspace_size,
        num_min_timing_iters: config.num_min_timing_iters,
        num_avg_timing_iters: config.num_avg_timing_iters,
        max_batch_size: config.max_batch_size,
        debug: config.debug,
        strict_types: config.strict_types,
        sparse_weights: config.sparse_weights,
        disable_tf32: config.disable_tf32,
        calibrator: config.calibrator.clone(),
    }
}

pub struct SegmentCompiler<'a> {
    backend: &'a dyn AcceleratorBackend,
    registry: &'a ConverterRegistry,
    config: &'a CompileConfig,
    builder: BuilderConfig,
    cache: EngineCache,
}

impl<'a> SegmentCompiler<'a> {
    pub fn new(
        backend: &'a dyn AcceleratorBackend,
        registry: &'a ConverterRegistry,
        config: &'a CompileConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
            builder: builder_config(config),
            cache: EngineCache::new(),
        }
    }

    /// Number of distinct engines built so far.
    pub fn cached_engines(&self) -> usize {
        self.cache.len()
    }

    pub fn compile(
        &self,
        graph: &Graph,
        segment: &Segment,
        shapes: &ShapeTable,
    ) -> Result<CompiledEngine, BuildError> {
        let span = debug_span!("segment", id = segment.id, nodes = segment.nodes.len());
        let _guard = span.enter();

        let inputs = segment
            .inputs
            .iter()
            .map(|value| self.boundary_input(graph, segment, *value, shapes))
            .collect::<Result<Vec<_>, _>>()?;
        let key = EngineKey {
            segment_hash: segment_fingerprint(graph, segment, &inputs)?,
            config_hash: config_digest(
                self.backend.name(),
                &self.builder,
                self.config.truncate_long_and_double,
            )
            .map_err(|err| BuildError::new(segment.id, None, format!("config digest: {err}")))?,
        };
        let engine = self
            .cache
            .get_or_build(key, segment.id, || self.build(graph, segment, &inputs))?;

        if engine.outputs().len() != segment.outputs.len() {
            return Err(BuildError::new(
                segment.id,
                None,
                format!(
                    "engine has {} outputs for {} segment outputs",
                    engine.outputs().len(),
                    segment.outputs.len()
                ),
            ));
        }
        let outputs = segment
            .outputs
            .iter()
            .zip(engine.outputs())
            .map(|(value, binding)| EngineIo {
                value: *value,
                declared: declared_dtype(graph, shapes, *value),
                engine: binding.dtype,
            })
            .collect();
        let inputs = inputs
            .iter()
            .map(|input| EngineIo {
                value: input.value,
                declared: input.declared,
                engine: input.engine,
            })
            .collect();
        debug!(segment = segment.id, key = ?key, "segment compiled");
        Ok(CompiledEngine {
            segment: segment.id,
            key,
            engine,
            inputs,
            outputs,
        })
    }

    fn boundary_input(
        &self,
        graph: &Graph,
        segment: &Segment,
        value: ValueId,
        shapes: &ShapeTable,
    ) -> Result<BoundaryInput, BuildError> {
        let declared = declared_dtype(graph, shapes, value);
        let dtype = declared.ok_or_else(|| {
            BuildError::new(segment.id, None, format!("input {value} has no known dtype"))
        })?;
        let engine = if dtype.is_64bit() {
            if !self.config.truncate_long_and_double {
                return Err(BuildError::new(
                    segment.id,
                    None,
                    format!(
                        "input {value} is {dtype}; enable truncate_long_and_double to feed it as {}",
                        dtype.truncated()
                    ),
                ));
            }
            dtype.truncated()
        } else {
            dtype
        };
        let shape = match shapes.get(value) {
            Some(measured) => measured.shape.clone(),
            None => graph
                .value_type(value)
                .and_then(ValueType::as_tensor)
                .and_then(|ty| ty.static_dims())
                .map(ShapeSpec::Static)
                .ok_or_else(|| {
                    BuildError::new(segment.id, None, format!("input {value} has no known shape"))
                })?,
        };
        Ok(BoundaryInput {
            value,
            declared,
            engine,
            shape,
        })
    }

    fn build(
        &self,
        graph: &Graph,
        segment: &Segment,
        inputs: &[BoundaryInput],
    ) -> Result<Arc<dyn Engine>, BuildError> {
        let mut ctx = ConversionCtx::new(
            graph,
            self.backend.create_network(),
            self.config.truncate_long_and_double,
        );
        for (index, input) in inputs.iter().enumerate() {
            let tensor = ctx
                .network_mut()
                .add_input(&format!("input_{index}"), input.engine, &input.shape)
                .map_err(|err| BuildError::backend(segment.id, &[], err))?;
            ctx.bind(input.value, tensor);
        }
        for id in &segment.nodes {
            let node = graph
                .node(*id)
                .ok_or_else(|| BuildError::new(segment.id, Some(*id), "node is not in the graph"))?;
            self.registry
                .convert(&mut ctx, node)
                .map_err(|err| BuildError::conversion(segment.id, err))?;
        }
        for (index, value) in segment.outputs.iter().enumerate() {
            let tensor: TensorRef = ctx.lookup(*value).ok_or_else(|| {
                BuildError::new(segment.id, None, format!("output {value} was never converted"))
            })?;
            ctx.network_mut()
                .mark_output(tensor, &format!("output_{index}"))
                .map_err(|err| BuildError::backend(segment.id, &[], err))?;
        }
        let attribution = ctx.layer_attribution().to_vec();
        let network = ctx.into_network();
        debug!(layers = attribution.len(), backend = self.backend.name(), "building engine");
        self.backend
            .build(network, &self.builder)
            .map_err(|err| BuildError::backend(segment.id, &attribution, err))
    }
}

fn declared_dtype(graph: &Graph, shapes: &ShapeTable, value: ValueId) -> Option<DType> {
    graph
        .value_type(value)
        .and_then(ValueType::dtype)
        .or_else(|| shapes.get(value).map(|measured| measured.dtype))
}
