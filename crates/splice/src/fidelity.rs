//! Numerical comparison of a hybrid program against the original graph.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::assemble::HybridProgram;
use crate::config::{CompileConfig, DEFAULT_THRESHOLD};
use crate::ir::{DType, Graph, HostTensor, InputSpec};
use crate::runtime::{run_graph, NodeInterpreter};

pub const DEFAULT_INPUT_RANGE: (f64, f64) = (-5.0, 5.0);
pub const DEFAULT_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The caller opted out.
    Disabled,
    /// Reduced precision was enabled, so outputs are not expected to match.
    PrecisionChanged,
    /// The reference graph or the hybrid program failed to run on the sampled
    /// inputs.
    ExecutionFailed,
}

/// Largest deviation observed on one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputDeviation {
    pub output: usize,
    pub max_abs_diff: f64,
    /// Allowed deviation: `threshold * max(max|reference|, max|hybrid|)`.
    pub tolerance: f64,
}

impl OutputDeviation {
    pub fn within_tolerance(&self) -> bool {
        self.max_abs_diff <= self.tolerance
    }
}

/// Result of a fidelity check. Deviations are reported, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum FidelityOutcome {
    Passed { outputs: Vec<OutputDeviation> },
    Deviated { outputs: Vec<OutputDeviation>, threshold: f64 },
    Skipped(SkipReason),
}

impl FidelityOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, FidelityOutcome::Passed { .. })
    }

    /// Human-readable note for the caller, if the outcome warrants one.
    pub fn advisory(&self) -> Option<String> {
        match self {
            FidelityOutcome::Passed { .. } => None,
            FidelityOutcome::Deviated { threshold, .. } => Some(format!(
                "Maximum numerical deviation for output exceeds set threshold ({threshold:e})"
            )),
            FidelityOutcome::Skipped(SkipReason::Disabled) => {
                Some("Threshold check skipped, numerical precision is not checked".to_string())
            }
            FidelityOutcome::Skipped(SkipReason::PrecisionChanged) => Some(
                "Due to change in operating data type, numerical precision is not checked"
                    .to_string(),
            ),
            FidelityOutcome::Skipped(SkipReason::ExecutionFailed) => Some(
                "Sample inputs could not be run through both programs, numerical precision is not checked"
                    .to_string(),
            ),
        }
    }
}

impl fmt::Display for FidelityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.advisory() {
            Some(advisory) => f.write_str(&advisory),
            None => f.write_str("outputs match within threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FidelityChecker {
    pub threshold: f64,
    pub input_range: (f64, f64),
    pub seed: u64,
}

impl Default for FidelityChecker {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            input_range: DEFAULT_INPUT_RANGE,
            seed: DEFAULT_SEED,
        }
    }
}

impl FidelityChecker {
    pub fn from_config(config: &CompileConfig) -> Self {
        Self {
            threshold: config.threshold,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_input_range(mut self, low: f64, high: f64) -> Self {
        self.input_range = (low, high);
        self
    }

    /// Random inputs at each spec's optimal shape.
    pub fn sample_inputs(&self, specs: &[InputSpec]) -> Vec<HostTensor> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (low, high) = self.input_range;
        specs
            .iter()
            .map(|spec| {
                let dims = spec.shape.opt().to_vec();
                let count: usize = dims.iter().product();
                let values: Vec<f64> = (0..count)
                    .map(|_| {
                        let value = rng.gen_range(low..=high);
                        match spec.dtype {
                            DType::Bool => f64::from(u8::from(value > 0.0)),
                            dtype if dtype.is_integer() => value.round(),
                            _ => value,
                        }
                    })
                    .collect();
                HostTensor::from_f64_values(spec.dtype, dims, &values)
                    .unwrap_or_else(|_| HostTensor::full(spec.dtype, spec.shape.opt().to_vec(), 0.0))
            })
            .collect()
    }

    /// Runs both `reference` and `program` on the same random inputs and
    /// compares every output. Failures to run either side become a skipped
    /// outcome; the program itself is still usable.
    pub fn check(
        &self,
        config: &CompileConfig,
        reference: &Graph,
        program: &HybridProgram,
        interpreter: &dyn NodeInterpreter,
    ) -> FidelityOutcome {
        if config.skip_fidelity_check {
            let outcome = FidelityOutcome::Skipped(SkipReason::Disabled);
            warn!("{outcome}");
            return outcome;
        }
        if !config.keeps_original_precision() {
            let outcome = FidelityOutcome::Skipped(SkipReason::PrecisionChanged);
            warn!("{outcome}");
            return outcome;
        }

        let inputs = self.sample_inputs(&config.input_specs);
        let runs = run_graph(reference, interpreter, &inputs).and_then(|expected| {
            program
                .run(interpreter, &inputs)
                .map(|actual| (expected, actual))
        });
        let (expected, actual) = match runs {
            Ok(runs) => runs,
            Err(err) => {
                let outcome = FidelityOutcome::Skipped(SkipReason::ExecutionFailed);
                warn!(error = %err, "{outcome}");
                return outcome;
            }
        };
        let mut outputs = Vec::with_capacity(expected.len());
        for (output, want) in expected.iter().enumerate() {
            let deviation = match actual.get(output) {
                Some(got) => compare(output, want, got, self.threshold),
                None => OutputDeviation {
                    output,
                    max_abs_diff: f64::INFINITY,
                    tolerance: 0.0,
                },
            };
            outputs.push(deviation);
        }

        if outputs.iter().all(OutputDeviation::within_tolerance) && actual.len() == expected.len() {
            return FidelityOutcome::Passed { outputs };
        }
        let outcome = FidelityOutcome::Deviated {
            outputs: outputs.clone(),
            threshold: self.threshold,
        };
        for deviation in outputs.iter().filter(|deviation| !deviation.within_tolerance()) {
            warn!(
                output = deviation.output,
                max_abs_diff = deviation.max_abs_diff,
                tolerance = deviation.tolerance,
                "{outcome}"
            );
        }
        outcome
    }
}

/// Compares the hybrid output flattened against the reference, so a layout
/// or rank difference with equal element counts still compares elementwise.
fn compare(output: usize, reference: &HostTensor, hybrid: &HostTensor, threshold: f64) -> OutputDeviation {
    let expected = reference.to_f64_vec();
    let actual = hybrid.to_f64_vec();
    if expected.len() != actual.len() {
        return OutputDeviation {
            output,
            max_abs_diff: f64::INFINITY,
            tolerance: 0.0,
        };
    }
    let max_abs_diff = expected
        .iter()
        .zip(&actual)
        .map(|(a, b)| {
            let diff = (a - b).abs();
            if diff.is_nan() {
                f64::INFINITY
            } else {
                diff
            }
        })
        .fold(0.0, f64::max);
    let scale = reference.max_abs().max(hybrid.max_abs());
    OutputDeviation {
        output,
        max_abs_diff,
        tolerance: threshold * scale,
    }
}
