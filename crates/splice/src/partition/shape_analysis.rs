//! Boundary shape derivation.
//!
//! Graph inputs take their declared [`InputSpec`]; every other tensor is
//! measured by running the whole graph under the fallback interpreter on
//! ones-filled inputs at the min, opt and max shapes.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::ir::{DType, Graph, HostTensor, InputSpec, ShapeSpec, TensorType, ValueId, ValueType};
use crate::runtime::{self, NodeInterpreter, RuntimeValue};

/// Measured shape and dtype of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueShape {
    pub dtype: DType,
    pub shape: ShapeSpec,
}

/// Shape specs for the tensors of one graph.
#[derive(Debug, Clone, Default)]
pub struct ShapeTable {
    entries: HashMap<ValueId, ValueShape>,
}

impl ShapeTable {
    pub fn get(&self, value: ValueId) -> Option<&ValueShape> {
        self.entries.get(&value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, value: ValueId, shape: ValueShape) {
        self.entries.insert(value, shape);
    }

    /// Fills in the dtype and dims of tensors whose declared type leaves
    /// them open. Declared information is never overwritten.
    pub fn refine(&self, graph: &mut Graph) -> usize {
        let mut refined = 0usize;
        for (value, measured) in &self.entries {
            let Some(ValueType::Tensor(declared)) = graph.value_type(*value) else {
                continue;
            };
            if declared.dtype.is_some() && declared.shape.is_some() {
                continue;
            }
            let ty = TensorType {
                dtype: declared.dtype.or(Some(measured.dtype)),
                shape: declared
                    .shape
                    .clone()
                    .or_else(|| Some(measured.shape.dimensions())),
            };
            graph.set_value_type(*value, ValueType::Tensor(ty));
            refined += 1;
        }
        refined
    }
}

#[derive(Clone, Copy)]
enum Profile {
    Min,
    Opt,
    Max,
}

impl Profile {
    fn dims(self, spec: &ShapeSpec) -> Vec<usize> {
        match self {
            Profile::Min => spec.min().to_vec(),
            Profile::Opt => spec.opt().to_vec(),
            Profile::Max => spec.max().to_vec(),
        }
    }
}

type Measurement = HashMap<ValueId, (DType, Vec<usize>)>;

/// Measures every tensor of `graph`.
///
/// An interpreter failure stops measurement; values computed before it are
/// kept and the rest stay out of the table, so segment compilation falls back
/// to declared static types for them.
pub fn analyze_shapes(
    graph: &Graph,
    interpreter: &dyn NodeInterpreter,
    specs: &[InputSpec],
) -> ShapeTable {
    let mut table = ShapeTable::default();
    for (value, spec) in graph.inputs.iter().zip(specs) {
        table.insert(
            *value,
            ValueShape {
                dtype: spec.dtype,
                shape: spec.shape.clone(),
            },
        );
    }

    let dynamic = specs.iter().any(|spec| spec.shape.is_dynamic());
    let opt = measure(graph, interpreter, specs, Profile::Opt);
    let (min, max) = if dynamic {
        (
            measure(graph, interpreter, specs, Profile::Min),
            measure(graph, interpreter, specs, Profile::Max),
        )
    } else {
        (opt.clone(), opt.clone())
    };

    for (value, (dtype, opt_dims)) in &opt {
        if graph.inputs.contains(value) {
            continue;
        }
        let (Some((_, min_dims)), Some((_, max_dims))) = (min.get(value), max.get(value)) else {
            continue;
        };
        if min_dims.len() != opt_dims.len() || max_dims.len() != opt_dims.len() {
            warn!(%value, "rank changes across the input range; shape left unknown");
            continue;
        }
        let shape =
            ShapeSpec::from_measurements(min_dims.clone(), opt_dims.clone(), max_dims.clone());
        table.insert(
            *value,
            ValueShape {
                dtype: *dtype,
                shape,
            },
        );
    }
    debug!(values = table.len(), dynamic, "shape analysis finished");
    table
}

fn measure(
    graph: &Graph,
    interpreter: &dyn NodeInterpreter,
    specs: &[InputSpec],
    profile: Profile,
) -> Measurement {
    let inputs: Vec<HostTensor> = specs
        .iter()
        .map(|spec| HostTensor::ones(spec.dtype, profile.dims(&spec.shape)))
        .collect();
    let mut measured = Measurement::new();
    let result = runtime::execute(
        graph,
        &inputs,
        |node, args| interpreter.execute(node, args),
        |value, result| {
            if let RuntimeValue::Tensor(tensor) = result {
                measured.insert(value, (tensor.dtype(), tensor.dims().to_vec()));
            }
        },
    );
    if let Err(err) = result {
        warn!(error = %err, "shape analysis stopped early");
    }
    measured
}
