use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::tensor::HostTensor;
use super::types::DType;

macro_rules! op_kinds {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Closed set of node kinds understood by lowering, conversion and the
        /// runtime. Names follow the traced-program spelling.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OpKind {
            $($variant,)*
        }

        impl OpKind {
            pub const ALL: &'static [OpKind] = &[$(OpKind::$variant,)*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name,)*
                }
            }
        }

        impl FromStr for OpKind {
            type Err = UnknownOpKind;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($name => Ok(OpKind::$variant),)*
                    other => Err(UnknownOpKind(other.to_string())),
                }
            }
        }
    };
}

op_kinds! {
    Constant => "prim::Constant",
    Relu => "aten::relu",
    Sigmoid => "aten::sigmoid",
    Tanh => "aten::tanh",
    Hardtanh => "aten::hardtanh",
    LeakyRelu => "aten::leaky_relu",
    Elu => "aten::elu",
    Gelu => "aten::gelu",
    Silu => "aten::silu",
    Prelu => "aten::prelu",
    Add => "aten::add",
    Sub => "aten::sub",
    Mul => "aten::mul",
    Div => "aten::div",
    Pow => "aten::pow",
    Maximum => "aten::maximum",
    Minimum => "aten::minimum",
    Neg => "aten::neg",
    Abs => "aten::abs",
    Exp => "aten::exp",
    Log => "aten::log",
    Sqrt => "aten::sqrt",
    Erf => "aten::erf",
    Clamp => "aten::clamp",
    Matmul => "aten::matmul",
    Linear => "aten::linear",
    ConstantPadNd => "aten::constant_pad_nd",
    Reshape => "aten::reshape",
    Permute => "aten::permute",
    Transpose => "aten::transpose",
    Flatten => "aten::flatten",
    Softmax => "aten::softmax",
    Sum => "aten::sum",
    Mean => "aten::mean",
    To => "aten::to",
    Dropout => "aten::dropout",
    Contiguous => "aten::contiguous",
    Cumsum => "aten::cumsum",
    Size => "aten::size",
    If => "prim::If",
    Loop => "prim::Loop",
    Print => "prim::Print",
    EngineCall => "splice::EngineCall",
}

impl OpKind {
    /// Kinds that only the fallback interpreter may run.
    pub fn is_pure_fallback(self) -> bool {
        matches!(
            self,
            OpKind::If | OpKind::Loop | OpKind::Print | OpKind::EngineCall
        )
    }

    /// Kinds kept alive regardless of whether their outputs are used.
    pub fn is_side_effecting(self) -> bool {
        matches!(self, OpKind::Print | OpKind::If | OpKind::Loop)
    }

    /// Number of leading operands that carry tensors; the rest are attribute
    /// operands that lowering folds into [`Attr`]s. `None` means all operands.
    pub fn tensor_operand_count(self) -> Option<usize> {
        let count = match self {
            OpKind::Hardtanh
            | OpKind::LeakyRelu
            | OpKind::Elu
            | OpKind::Gelu
            | OpKind::Softmax
            | OpKind::Reshape
            | OpKind::Permute
            | OpKind::Transpose
            | OpKind::Flatten
            | OpKind::ConstantPadNd
            | OpKind::Sum
            | OpKind::Mean
            | OpKind::To
            | OpKind::Dropout
            | OpKind::Clamp
            | OpKind::Cumsum
            | OpKind::Size
            | OpKind::Contiguous => 1,
            OpKind::Add | OpKind::Sub => 2,
            _ => return None,
        };
        Some(count)
    }

    /// Positional names of the attribute operands, in call order.
    pub fn attribute_operands(self) -> &'static [&'static str] {
        match self {
            OpKind::Hardtanh => &["min_val", "max_val"],
            OpKind::LeakyRelu => &["negative_slope"],
            OpKind::Elu => &["alpha", "scale", "input_scale"],
            OpKind::Gelu => &["approximate"],
            OpKind::Softmax => &["dim", "dtype"],
            OpKind::Reshape => &["shape"],
            OpKind::Permute => &["dims"],
            OpKind::Transpose => &["dim0", "dim1"],
            OpKind::Flatten => &["start_dim", "end_dim"],
            OpKind::ConstantPadNd => &["pad", "value"],
            OpKind::Sum | OpKind::Mean => &["dim", "keepdim", "dtype"],
            OpKind::To => &["dtype", "non_blocking", "copy"],
            OpKind::Dropout => &["p", "train"],
            OpKind::Clamp => &["min", "max"],
            OpKind::Cumsum => &["dim", "dtype"],
            OpKind::Size => &["dim"],
            OpKind::Contiguous => &["memory_format"],
            OpKind::Add | OpKind::Sub => &["alpha"],
            _ => &[],
        }
    }

    /// Binary kinds whose second operand may be a folded scalar `other`.
    pub fn accepts_scalar_other(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Pow
                | OpKind::Maximum
                | OpKind::Minimum
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown op kind `{0}`")]
pub struct UnknownOpKind(pub String);

/// Node attribute payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Tensor(HostTensor),
    DType(DType),
}

impl Attr {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attr::Int(value) => Some(*value),
            Attr::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    /// Numeric view; ints widen to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Attr::Float(value) => Some(*value),
            Attr::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(value) => Some(*value),
            Attr::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attr::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attr::Ints(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            Attr::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DType> {
        match self {
            Attr::DType(dtype) => Some(*dtype),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Attr::None)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(values: &[T]) -> String {
            let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("[{}]", parts.join(", "))
        }
        match self {
            Attr::None => f.write_str("None"),
            Attr::Int(value) => write!(f, "{value}"),
            Attr::Float(value) => write!(f, "{value:?}"),
            Attr::Bool(value) => write!(f, "{value}"),
            Attr::Str(value) => write!(f, "\"{value}\""),
            Attr::Ints(values) => f.write_str(&list(values)),
            Attr::Floats(values) => {
                let parts: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            // The dtype and dims travel in the value's declared type.
            Attr::Tensor(tensor) => {
                let parts: Vec<String> = tensor
                    .to_f64_vec()
                    .iter()
                    .map(|v| format!("{v:?}"))
                    .collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Attr::DType(dtype) => write!(f, "{dtype}"),
        }
    }
}
