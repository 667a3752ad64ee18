use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::{InputSpec, OpKind, SpecParseError};
use crate::lowering::LoweringOptions;

/// Minimum number of nodes a segment needs before it is worth an engine call.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 3;
/// Relative tolerance used by the fidelity check.
pub const DEFAULT_THRESHOLD: f64 = 2e-5;

/// Kernel precision the builder may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Precision {
    Float,
    Half,
    Int8,
    Bool,
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "float" | "float32" | "f32" | "fp32" => Ok(Precision::Float),
            "half" | "float16" | "f16" | "fp16" => Ok(Precision::Half),
            "char" | "int8" | "i8" => Ok(Precision::Int8),
            "bool" | "b" => Ok(Precision::Bool),
            _ => Err(ConfigError::UnknownToken {
                what: "precision",
                token: s.to_string(),
                options: "float | half | int8 | bool",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Gpu,
    Dla,
}

impl FromStr for DeviceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceType::Gpu),
            "dla" => Ok(DeviceType::Dla),
            _ => Err(ConfigError::UnknownToken {
                what: "device type",
                token: s.to_string(),
                options: "gpu | dla",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineCapability {
    #[default]
    Standard,
    Safety,
    DlaStandalone,
}

impl FromStr for EngineCapability {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "default" => Ok(EngineCapability::Standard),
            "safety" | "safe_gpu" => Ok(EngineCapability::Safety),
            "dla_standalone" | "safe_dla" => Ok(EngineCapability::DlaStandalone),
            _ => Err(ConfigError::UnknownToken {
                what: "engine capability",
                token: s.to_string(),
                options: "standard | safety | dla_standalone",
            }),
        }
    }
}

/// Target device of the built engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub device_type: DeviceType,
    pub gpu_id: u32,
    pub dla_core: u32,
    /// Lets layers the fixed-function core cannot run fall back to the GPU.
    pub allow_gpu_fallback: bool,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Gpu,
            gpu_id: 0,
            dla_core: 0,
            allow_gpu_fallback: false,
        }
    }
}

impl Device {
    pub fn gpu(gpu_id: u32) -> Self {
        Self {
            gpu_id,
            ..Self::default()
        }
    }

    pub fn dla(dla_core: u32, allow_gpu_fallback: bool) -> Self {
        Self {
            device_type: DeviceType::Dla,
            dla_core,
            allow_gpu_fallback,
            ..Self::default()
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_type {
            DeviceType::Gpu => write!(f, "gpu:{}", self.gpu_id),
            DeviceType::Dla => write!(
                f,
                "dla:{} (gpu {} fallback {})",
                self.dla_core,
                self.gpu_id,
                if self.allow_gpu_fallback { "on" } else { "off" }
            ),
        }
    }
}

/// Opaque handle to a post-training quantization calibrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalibrationRef {
    pub name: String,
    #[serde(default)]
    pub cache_file: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown {what} `{token}`, options are [ {options} ]")]
    UnknownToken {
        what: &'static str,
        token: String,
        options: &'static str,
    },
    #[error("input spec {index}: {source}")]
    InputSpec {
        index: usize,
        #[source]
        source: SpecParseError,
    },
    #[error(transparent)]
    Spec(#[from] SpecParseError),
    #[error("min_block_size must be at least 1")]
    ZeroMinBlockSize,
    #[error("max_batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("at least one precision must be enabled")]
    NoPrecision,
    #[error("fidelity threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("require_full_compilation is enabled, so {option} has no effect and is rejected")]
    FullCompilationConflict { option: &'static str },
    #[error("graph has {inputs} inputs but {specs} input specs were given")]
    InputCountMismatch { inputs: usize, specs: usize },
    #[error("graph input {index} cannot be described by an input spec: {message}")]
    InputSpecMismatch { index: usize, message: String },
    #[error("saving a single engine needs a graph that is fully supported in one segment; the partition has {segments} segment(s) and {fallback_nodes} fallback node(s)")]
    NotSingleSegment {
        segments: usize,
        fallback_nodes: usize,
    },
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// All build options of one compilation. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub enabled_precisions: BTreeSet<Precision>,
    pub device: Device,
    pub capability: EngineCapability,
    pub min_block_size: Option<usize>,
    pub torch_executed_ops: Vec<String>,
    pub torch_executed_modules: Vec<String>,
    pub calibrator: Option<CalibrationRef>,
    pub workspace_size: Option<u64>,
    pub num_min_timing_iters: u32,
    pub num_avg_timing_iters: u32,
    pub max_batch_size: Option<u32>,
    pub debug: bool,
    pub strict_types: bool,
    pub sparse_weights: bool,
    pub disable_tf32: bool,
    pub truncate_long_and_double: bool,
    pub require_full_compilation: bool,
    pub input_specs: Vec<InputSpec>,
    pub lowering: LoweringOptions,
    pub threshold: f64,
    pub skip_fidelity_check: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            enabled_precisions: BTreeSet::from([Precision::Float]),
            device: Device::default(),
            capability: EngineCapability::Standard,
            min_block_size: None,
            torch_executed_ops: Vec::new(),
            torch_executed_modules: Vec::new(),
            calibrator: None,
            workspace_size: None,
            num_min_timing_iters: 2,
            num_avg_timing_iters: 1,
            max_batch_size: None,
            debug: false,
            strict_types: false,
            sparse_weights: false,
            disable_tf32: false,
            truncate_long_and_double: false,
            require_full_compilation: false,
            input_specs: Vec::new(),
            lowering: LoweringOptions::default(),
            threshold: DEFAULT_THRESHOLD,
            skip_fidelity_check: false,
        }
    }
}

impl CompileConfig {
    pub fn new(input_specs: Vec<InputSpec>) -> Self {
        Self {
            input_specs,
            ..Self::default()
        }
    }

    pub fn with_precisions<I: IntoIterator<Item = Precision>>(mut self, precisions: I) -> Self {
        self.enabled_precisions = precisions.into_iter().collect();
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_min_block_size(mut self, size: usize) -> Self {
        self.min_block_size = Some(size);
        self
    }

    pub fn exclude_op(mut self, kind: impl Into<String>) -> Self {
        self.torch_executed_ops.push(kind.into());
        self
    }

    pub fn exclude_module(mut self, prefix: impl Into<String>) -> Self {
        self.torch_executed_modules.push(prefix.into());
        self
    }

    pub fn with_workspace_size(mut self, bytes: u64) -> Self {
        self.workspace_size = Some(bytes);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn require_full_compilation(mut self, required: bool) -> Self {
        self.require_full_compilation = required;
        self
    }

    pub fn truncate_long_and_double(mut self, truncate: bool) -> Self {
        self.truncate_long_and_double = truncate;
        self
    }

    pub fn skip_fidelity_check(mut self, skip: bool) -> Self {
        self.skip_fidelity_check = skip;
        self
    }

    pub fn with_lowering(mut self, lowering: LoweringOptions) -> Self {
        self.lowering = lowering;
        self
    }

    /// Parses a JSON config and validates it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CompileConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects inconsistent options before any lowering or build work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_precisions.is_empty() {
            return Err(ConfigError::NoPrecision);
        }
        if self.min_block_size == Some(0) {
            return Err(ConfigError::ZeroMinBlockSize);
        }
        if self.max_batch_size == Some(0) {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        for (index, spec) in self.input_specs.iter().enumerate() {
            spec.validate()
                .map_err(|source| ConfigError::InputSpec { index, source })?;
        }
        for op in &self.torch_executed_ops {
            op.parse::<OpKind>().map_err(|_| ConfigError::UnknownToken {
                what: "op kind",
                token: op.clone(),
                options: "aten::* | prim::* kinds known to the graph IR",
            })?;
        }
        if self.require_full_compilation {
            if !self.torch_executed_ops.is_empty() {
                return Err(ConfigError::FullCompilationConflict {
                    option: "torch_executed_ops",
                });
            }
            if !self.torch_executed_modules.is_empty() {
                return Err(ConfigError::FullCompilationConflict {
                    option: "torch_executed_modules",
                });
            }
            if self.min_block_size.is_some() {
                return Err(ConfigError::FullCompilationConflict {
                    option: "min_block_size",
                });
            }
        }
        Ok(())
    }

    /// Threshold handed to the partitioner; full compilation accepts any run.
    pub fn effective_min_block_size(&self) -> usize {
        if self.require_full_compilation {
            1
        } else {
            self.min_block_size.unwrap_or(DEFAULT_MIN_BLOCK_SIZE)
        }
    }

    /// Kinds forced onto the fallback path. Call after [`Self::validate`].
    pub fn excluded_kinds(&self) -> BTreeSet<OpKind> {
        self.torch_executed_ops
            .iter()
            .filter_map(|op| op.parse().ok())
            .collect()
    }

    /// Returns `true` when the only enabled precision is full float, which is
    /// the only case where hybrid outputs are expected to match the original.
    pub fn keeps_original_precision(&self) -> bool {
        self.enabled_precisions.len() == 1 && self.enabled_precisions.contains(&Precision::Float)
    }
}
