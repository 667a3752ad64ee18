//! Compilation entry points.
//!
//! [`Compiler::compile`] runs the whole pipeline: validation, lowering, shape
//! analysis, partitioning, per-segment engine builds, assembly and the
//! fidelity check. [`Compiler::convert_to_engine`] stops after building the
//! single engine of a fully supported graph and returns its bytes.

use tracing::{debug, info, info_span};

use crate::assemble::{assemble, HybridProgram};
use crate::backend::AcceleratorBackend;
use crate::compile::SegmentCompiler;
use crate::config::{CompileConfig, ConfigError, Precision};
use crate::conversion::{default_registry, ConverterRegistry};
use crate::device::CompilationGuard;
use crate::env;
use crate::error::Result;
use crate::fidelity::{FidelityChecker, FidelityOutcome};
use crate::ir::{Graph, ValueType};
use crate::lowering::lower_graph;
use crate::partition::{
    analyze_shapes, check_operator_support, partition_with_shapes, FallbackReason, PartitionError,
    PartitionOptions, PartitionPlan, Segment, ShapeTable, UnsupportedNode, Violation,
};
use crate::runtime::NodeInterpreter;

/// Everything a successful compilation produced.
#[derive(Debug)]
pub struct Compilation {
    pub program: HybridProgram,
    pub plan: PartitionPlan,
    pub lowered: Graph,
    pub fidelity: FidelityOutcome,
}

struct Prepared {
    lowered: Graph,
    shapes: ShapeTable,
    plan: PartitionPlan,
}

pub struct Compiler<'a> {
    backend: &'a dyn AcceleratorBackend,
    interpreter: &'a dyn NodeInterpreter,
    registry: &'a ConverterRegistry,
}

impl<'a> Compiler<'a> {
    /// Compiler using the default converter registry.
    pub fn new(backend: &'a dyn AcceleratorBackend, interpreter: &'a dyn NodeInterpreter) -> Self {
        Self {
            backend,
            interpreter,
            registry: default_registry(),
        }
    }

    pub fn with_registry(mut self, registry: &'a ConverterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Compiles `graph` into a hybrid program.
    pub fn compile(&self, graph: &Graph, config: &CompileConfig) -> Result<Compilation> {
        let span = info_span!("compile", graph = %graph.name, backend = self.backend.name());
        let _enter = span.enter();

        let guard = CompilationGuard::acquire(&config.device)?;
        let prepared = self.prepare(graph, config)?;
        let builder = SegmentCompiler::new(self.backend, self.registry, config);
        let mut engines = Vec::with_capacity(prepared.plan.segment_count());
        for segment in prepared.plan.segments() {
            engines.push(builder.compile(&prepared.lowered, segment, &prepared.shapes)?);
        }
        info!(
            segments = engines.len(),
            distinct_engines = builder.cached_engines(),
            fallback = prepared.plan.fallback_nodes().len(),
            "engines built"
        );
        let program = assemble(&prepared.lowered, &prepared.plan, engines)?;
        drop(guard);

        let fidelity =
            FidelityChecker::from_config(config).check(config, graph, &program, self.interpreter);
        Ok(Compilation {
            program,
            plan: prepared.plan,
            lowered: prepared.lowered,
            fidelity,
        })
    }

    /// Builds one engine for a graph that compiles as a single segment and
    /// returns its serialized bytes. Engine inputs follow the graph's input
    /// order and engine outputs the graph's output order.
    pub fn convert_to_engine(&self, graph: &Graph, config: &CompileConfig) -> Result<Vec<u8>> {
        let span = info_span!("convert_to_engine", graph = %graph.name);
        let _enter = span.enter();

        let _guard = CompilationGuard::acquire(&config.device)?;
        let prepared = self.prepare(graph, config)?;
        let fallback_nodes = prepared.plan.fallback_nodes().len();
        let segment_count = prepared.plan.segment_count();
        let Some(planned) = prepared.plan.segments().next() else {
            return Err(ConfigError::NotSingleSegment {
                segments: segment_count,
                fallback_nodes,
            }
            .into());
        };
        if segment_count != 1 || fallback_nodes != 0 {
            return Err(ConfigError::NotSingleSegment {
                segments: segment_count,
                fallback_nodes,
            }
            .into());
        }
        let whole = Segment {
            id: planned.id,
            nodes: planned.nodes.clone(),
            inputs: prepared.lowered.inputs.clone(),
            outputs: prepared.lowered.outputs.clone(),
        };
        let compiled = SegmentCompiler::new(self.backend, self.registry, config).compile(
            &prepared.lowered,
            &whole,
            &prepared.shapes,
        )?;
        Ok(compiled.engine.serialize()?)
    }

    /// Lowers `graph` and lists the nodes the registry cannot convert.
    pub fn check_operator_support(
        &self,
        graph: &Graph,
        config: &CompileConfig,
    ) -> Result<Vec<UnsupportedNode>> {
        config.validate()?;
        let mut lowered = graph.clone();
        lower_graph(&mut lowered, &config.lowering)?;
        Ok(check_operator_support(&lowered, self.registry))
    }

    fn prepare(&self, graph: &Graph, config: &CompileConfig) -> Result<Prepared> {
        config.validate()?;
        check_input_specs(graph, config)?;
        if config.enabled_precisions.contains(&Precision::Int8) && config.calibrator.is_none() {
            info!("Int8 enabled without a calibrator; the graph is assumed to carry quantize/dequantize nodes");
        }

        let mut lowered = graph.clone();
        let lowering = lower_graph(&mut lowered, &config.lowering)?;
        debug!(
            rewrites = lowering.rewrites_applied,
            erased = lowering.erased_nodes,
            nodes = lowered.nodes.len(),
            "lowered graph"
        );
        if env::dump_graphs() {
            info!("lowered graph:\n{lowered}");
        }

        let shapes = analyze_shapes(&lowered, self.interpreter, &config.input_specs);
        let refined = shapes.refine(&mut lowered);
        debug!(refined, "value types refined from shape analysis");

        if config.require_full_compilation {
            let violations: Vec<Violation> = check_operator_support(&lowered, self.registry)
                .into_iter()
                .map(|entry| Violation {
                    node: entry.node,
                    kind: entry.kind,
                    reason: FallbackReason::Unsupported(entry.reason),
                })
                .collect();
            if !violations.is_empty() {
                return Err(PartitionError::RequiresFallback { violations }.into());
            }
        }

        let plan = partition_with_shapes(
            &lowered,
            self.registry,
            &PartitionOptions::from_config(config),
            &shapes,
        )?;
        plan.validate(&lowered)?;
        Ok(Prepared {
            lowered,
            shapes,
            plan,
        })
    }
}

/// One spec per graph input, with dtype and rank consistent with the
/// declared input types.
fn check_input_specs(graph: &Graph, config: &CompileConfig) -> Result<(), ConfigError> {
    if graph.inputs.len() != config.input_specs.len() {
        return Err(ConfigError::InputCountMismatch {
            inputs: graph.inputs.len(),
            specs: config.input_specs.len(),
        });
    }
    for (index, (value, spec)) in graph.inputs.iter().zip(&config.input_specs).enumerate() {
        let Some(ValueType::Tensor(declared)) = graph.value_type(*value) else {
            return Err(ConfigError::InputSpecMismatch {
                index,
                message: "graph input is not a tensor".to_string(),
            });
        };
        if let Some(dtype) = declared.dtype {
            if dtype != spec.dtype {
                return Err(ConfigError::InputSpecMismatch {
                    index,
                    message: format!("graph declares {dtype}, spec says {}", spec.dtype),
                });
            }
        }
        if let Some(rank) = declared.rank() {
            if rank != spec.shape.rank() {
                return Err(ConfigError::InputSpecMismatch {
                    index,
                    message: format!("graph declares rank {rank}, spec has rank {}", spec.shape.rank()),
                });
            }
        }
    }
    Ok(())
}

/// Compiles `graph` with the default converter registry.
pub fn compile_program(
    graph: &Graph,
    config: &CompileConfig,
    backend: &dyn AcceleratorBackend,
    interpreter: &dyn NodeInterpreter,
) -> Result<Compilation> {
    Compiler::new(backend, interpreter).compile(graph, config)
}

/// Serialized engine for a graph that compiles as a single segment.
pub fn convert_to_engine(
    graph: &Graph,
    config: &CompileConfig,
    backend: &dyn AcceleratorBackend,
    interpreter: &dyn NodeInterpreter,
) -> Result<Vec<u8>> {
    Compiler::new(backend, interpreter).convert_to_engine(graph, config)
}
