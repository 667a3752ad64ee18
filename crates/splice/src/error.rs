use thiserror::Error;

use crate::assemble::AssembleError;
use crate::backend::BackendError;
use crate::compile::BuildError;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::lowering::LoweringError;
use crate::partition::PartitionError;
use crate::runtime::ExecError;

/// Any failure of a compilation entry point.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("lowering failed: {0}")]
    Lowering(#[from] LoweringError),
    #[error("partitioning failed: {0}")]
    Partition(#[from] PartitionError),
    #[error("engine build failed: {0}")]
    Build(#[from] BuildError),
    #[error("assembling the program failed: {0}")]
    Assemble(#[from] AssembleError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("execution failed: {0}")]
    Exec(#[from] ExecError),
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;
