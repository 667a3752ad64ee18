use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar element types understood by graphs, engines and host tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    F64,
    I8,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I8 | DType::I32 | DType::I64)
    }

    /// Returns `true` for the 64-bit types engines refuse without truncation.
    pub fn is_64bit(self) -> bool {
        matches!(self, DType::F64 | DType::I64)
    }

    /// 32-bit counterpart used when truncating 64-bit weights and inputs.
    pub fn truncated(self) -> DType {
        match self {
            DType::F64 => DType::F32,
            DType::I64 => DType::I32,
            other => other,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I8 | DType::Bool => 1,
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Maps a traced program's integer scalar-type code onto a dtype.
    pub fn from_scalar_type_code(code: i64) -> Option<DType> {
        let dtype = match code {
            1 => DType::I8,
            3 => DType::I32,
            4 => DType::I64,
            5 => DType::F16,
            6 => DType::F32,
            7 => DType::F64,
            11 => DType::Bool,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let dtype = match normalized.as_str() {
            "float" | "float32" | "f32" | "fp32" => DType::F32,
            "half" | "float16" | "f16" | "fp16" => DType::F16,
            "double" | "float64" | "f64" | "fp64" => DType::F64,
            "char" | "int8" | "i8" => DType::I8,
            "int" | "int32" | "i32" => DType::I32,
            "long" | "int64" | "i64" => DType::I64,
            "bool" | "b" => DType::Bool,
            _ => {
                return Err(SpecParseError::UnknownDType {
                    token: s.to_string(),
                })
            }
        };
        Ok(dtype)
    }
}

/// Memory layout declared for a graph input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorFormat {
    #[default]
    Contiguous,
    ChannelsLast,
    Unknown,
}

impl FromStr for TensorFormat {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "linear" | "nchw" | "chw" | "contiguous" => Ok(TensorFormat::Contiguous),
            "nhwc" | "hwc" | "channels_last" | "channel_last" => Ok(TensorFormat::ChannelsLast),
            "unknown" => Ok(TensorFormat::Unknown),
            _ => Err(SpecParseError::UnknownFormat {
                token: s.to_string(),
            }),
        }
    }
}

/// A single axis extent of a value flowing through a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

impl Dimension {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(value),
            Dimension::Dynamic => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Dynamic => f.write_str("?"),
        }
    }
}

/// Returns static extents when every dimension is known.
pub fn static_dims(dims: &[Dimension]) -> Option<Vec<usize>> {
    dims.iter().map(|dim| dim.as_static()).collect()
}

/// Shape contract of a tensor: one fixed shape, or a `(min, opt, max)` range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeSpec {
    Static(Vec<usize>),
    Dynamic {
        min: Vec<usize>,
        opt: Vec<usize>,
        max: Vec<usize>,
    },
}

impl ShapeSpec {
    /// Builds a ranged spec, rejecting rank mismatches and inverted ranges.
    pub fn dynamic(
        min: Vec<usize>,
        opt: Vec<usize>,
        max: Vec<usize>,
    ) -> Result<ShapeSpec, SpecParseError> {
        let spec = ShapeSpec::Dynamic { min, opt, max };
        spec.validate()?;
        Ok(spec)
    }

    pub fn rank(&self) -> usize {
        self.opt().len()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ShapeSpec::Dynamic { .. })
    }

    pub fn min(&self) -> &[usize] {
        match self {
            ShapeSpec::Static(dims) => dims,
            ShapeSpec::Dynamic { min, .. } => min,
        }
    }

    pub fn opt(&self) -> &[usize] {
        match self {
            ShapeSpec::Static(dims) => dims,
            ShapeSpec::Dynamic { opt, .. } => opt,
        }
    }

    pub fn max(&self) -> &[usize] {
        match self {
            ShapeSpec::Static(dims) => dims,
            ShapeSpec::Dynamic { max, .. } => max,
        }
    }

    /// Per-axis view: fixed axes are `Static`, ranged axes are `Dynamic`.
    pub fn dimensions(&self) -> Vec<Dimension> {
        match self {
            ShapeSpec::Static(dims) => dims.iter().copied().map(Dimension::Static).collect(),
            ShapeSpec::Dynamic { min, max, .. } => min
                .iter()
                .zip(max.iter())
                .map(|(lo, hi)| {
                    if lo == hi {
                        Dimension::Static(*lo)
                    } else {
                        Dimension::Dynamic
                    }
                })
                .collect(),
        }
    }

    /// Checks the `min <= opt <= max` invariant of ranged specs.
    pub fn validate(&self) -> Result<(), SpecParseError> {
        let ShapeSpec::Dynamic { min, opt, max } = self else {
            return Ok(());
        };
        if min.len() != opt.len() || opt.len() != max.len() {
            return Err(SpecParseError::RankMismatch {
                min: min.len(),
                opt: opt.len(),
                max: max.len(),
            });
        }
        for (axis, ((lo, mid), hi)) in min.iter().zip(opt.iter()).zip(max.iter()).enumerate() {
            if !(lo <= mid && mid <= hi) {
                return Err(SpecParseError::InvertedRange {
                    axis,
                    min: *lo,
                    opt: *mid,
                    max: *hi,
                });
            }
        }
        Ok(())
    }

    /// Returns `true` when `dims` lies inside the accepted range.
    pub fn admits(&self, dims: &[usize]) -> bool {
        if dims.len() != self.rank() {
            return false;
        }
        self.min()
            .iter()
            .zip(self.max().iter())
            .zip(dims.iter())
            .all(|((lo, hi), dim)| lo <= dim && dim <= hi)
    }

    /// Collapses three measured shapes into a spec, static when they agree.
    pub fn from_measurements(min: Vec<usize>, opt: Vec<usize>, max: Vec<usize>) -> ShapeSpec {
        if min == opt && opt == max {
            ShapeSpec::Static(opt)
        } else {
            ShapeSpec::Dynamic { min, opt, max }
        }
    }
}

impl fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn tuple(dims: &[usize]) -> String {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(","))
        }
        match self {
            ShapeSpec::Static(dims) => f.write_str(&tuple(dims)),
            ShapeSpec::Dynamic { min, opt, max } => {
                write!(f, "[{};{};{}]", tuple(min), tuple(opt), tuple(max))
            }
        }
    }
}

/// Declared contract for one graph input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub shape: ShapeSpec,
    #[serde(default = "default_input_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub format: TensorFormat,
}

fn default_input_dtype() -> DType {
    DType::F32
}

impl InputSpec {
    pub fn new(shape: ShapeSpec) -> Self {
        Self {
            shape,
            dtype: DType::F32,
            format: TensorFormat::Contiguous,
        }
    }

    pub fn fixed(dims: &[usize]) -> Self {
        Self::new(ShapeSpec::Static(dims.to_vec()))
    }

    pub fn ranged(min: &[usize], opt: &[usize], max: &[usize]) -> Result<Self, SpecParseError> {
        ShapeSpec::dynamic(min.to_vec(), opt.to_vec(), max.to_vec()).map(Self::new)
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_format(mut self, format: TensorFormat) -> Self {
        self.format = format;
        self
    }

    pub fn validate(&self) -> Result<(), SpecParseError> {
        self.shape.validate()
    }
}

impl fmt::Display for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.shape, self.dtype)?;
        match self.format {
            TensorFormat::Contiguous => Ok(()),
            TensorFormat::ChannelsLast => f.write_str("%nhwc"),
            TensorFormat::Unknown => f.write_str("%unknown"),
        }
    }
}

/// Parses `"(N,C,H,W)"` or `"[(min..);(opt..);(max..)]"`, optionally followed by
/// `@dtype` and `%format`, e.g. `"(3,3,32,32)@f16%nhwc"`.
impl FromStr for InputSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (rest, format) = match text.split_once('%') {
            Some((head, format)) => (head, format.parse::<TensorFormat>()?),
            None => (text, TensorFormat::Contiguous),
        };
        let (shape_text, dtype) = match rest.split_once('@') {
            Some((head, dtype)) => (head.trim(), dtype.parse::<DType>()?),
            None => (rest.trim(), DType::F32),
        };

        let shape = if shape_text.starts_with('(') {
            ShapeSpec::Static(parse_tuple(shape_text)?)
        } else if let Some(inner) = shape_text
            .strip_prefix('[')
            .and_then(|body| body.strip_suffix(']'))
        {
            let tuples = inner
                .split(';')
                .map(parse_tuple)
                .collect::<Result<Vec<_>, _>>()?;
            let [min, opt, max]: [Vec<usize>; 3] =
                tuples
                    .try_into()
                    .map_err(|found: Vec<Vec<usize>>| SpecParseError::RangeArity {
                        found: found.len(),
                    })?;
            ShapeSpec::dynamic(min, opt, max)?
        } else {
            return Err(SpecParseError::Malformed {
                text: s.to_string(),
            });
        };

        Ok(InputSpec {
            shape,
            dtype,
            format,
        })
    }
}

fn parse_tuple(text: &str) -> Result<Vec<usize>, SpecParseError> {
    let malformed = || SpecParseError::Malformed {
        text: text.to_string(),
    };
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|body| body.strip_suffix(')'))
        .ok_or_else(malformed)?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<usize>().map_err(|_| malformed()))
        .collect()
}

/// Errors raised while parsing or validating dtype, format and shape tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("unknown dtype `{token}`, options are [ float | half | double | int8 | int | long | bool ]")]
    UnknownDType { token: String },
    #[error("unknown tensor format `{token}`, options are [ linear | nchw | contiguous | nhwc | channels_last ]")]
    UnknownFormat { token: String },
    #[error("malformed shape `{text}`, expected \"(N,..,C,H,W)\" or \"[(MIN..);(OPT..);(MAX..)]\"")]
    Malformed { text: String },
    #[error("dynamic shapes need exactly three shape tuples, found {found}")]
    RangeArity { found: usize },
    #[error("dynamic shape ranks disagree (min {min}, opt {opt}, max {max})")]
    RankMismatch { min: usize, opt: usize, max: usize },
    #[error("dynamic shape axis {axis} violates min <= opt <= max ({min}, {opt}, {max})")]
    InvertedRange {
        axis: usize,
        min: usize,
        opt: usize,
        max: usize,
    },
}

/// Kind of a non-tensor scalar flowing through a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
    Str,
}

/// Static type information known for a tensor value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: Option<DType>,
    pub shape: Option<Vec<Dimension>>,
}

impl TensorType {
    /// A tensor with nothing known about it.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn new(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype: Some(dtype),
            shape: Some(dims.iter().copied().map(Dimension::Static).collect()),
        }
    }

    pub fn of_dtype(dtype: DType) -> Self {
        Self {
            dtype: Some(dtype),
            shape: None,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(Vec::len)
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.shape.as_deref().and_then(static_dims)
    }
}

/// Type of a value edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorType),
    Scalar(ScalarKind),
    List(ScalarKind),
}

impl ValueType {
    pub fn tensor(dtype: DType, dims: &[usize]) -> Self {
        ValueType::Tensor(TensorType::new(dtype, dims))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            ValueType::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        self.as_tensor().and_then(|tensor| tensor.dtype)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(tensor) => {
                let dtype = tensor.dtype.map(DType::as_str).unwrap_or("?");
                match &tensor.shape {
                    Some(dims) => {
                        let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                        write!(f, "tensor<{dtype}, {}>", dims.join("x"))
                    }
                    None => write!(f, "tensor<{dtype}>"),
                }
            }
            ValueType::Scalar(kind) => write!(f, "{kind:?}").map(|_| ()),
            ValueType::List(kind) => write!(f, "{kind:?}[]"),
        }
    }
}
