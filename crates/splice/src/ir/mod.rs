//! Graph IR, the type/shape model and host tensors.

pub mod graph;
pub mod index;
pub mod op;
pub mod tensor;
pub mod text;
pub mod types;

pub use graph::{Graph, GraphSerdeError, Node, NodeId, StructuralError, ValueData, ValueId};
pub use index::{DefSite, GraphIndex};
pub use op::{Attr, OpKind, UnknownOpKind};
pub use tensor::{HostTensor, TensorData, TensorError};
pub use text::{parse_graph, parse_graph_with_symbols, ParsedGraph, TextIrError};
pub use types::{
    DType, Dimension, InputSpec, ScalarKind, ShapeSpec, SpecParseError, TensorFormat, TensorType,
    ValueType,
};
