//! Hybrid compilation of traced tensor graphs.
//!
//! A graph is lowered into canonical form, partitioned into segments the
//! accelerator backend can build and nodes that stay under the original
//! interpreter, and reassembled into a [`HybridProgram`] whose segments run as
//! compiled engines.

pub mod assemble;
pub mod backend;
pub mod compile;
pub mod compiler;
pub mod config;
pub mod conversion;
pub mod device;
mod env;
pub mod error;
pub mod fidelity;
pub mod ir;
pub mod lowering;
pub mod partition;
pub mod runtime;

pub use assemble::{assemble, embed_engine, AssembleError, HybridProgram};
pub use compile::{BuildError, CompiledEngine, SegmentCompiler};
pub use compiler::{compile_program, convert_to_engine, Compilation, Compiler};
pub use config::{CompileConfig, ConfigError, Device, DeviceType, EngineCapability, Precision};
pub use conversion::{default_registry, ConverterRegistry, Support};
pub use error::CompileError;
pub use fidelity::{FidelityChecker, FidelityOutcome, SkipReason};
pub use ir::{DType, Graph, HostTensor, InputSpec, OpKind, ShapeSpec};
pub use lowering::{lower_graph, LoweringOptions};
pub use partition::{
    check_operator_support, partition, partition_with_shapes, PartitionOptions, PartitionPlan,
};
pub use runtime::{run_graph, ExecError, NodeInterpreter, RuntimeValue};
