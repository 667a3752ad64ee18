use std::sync::Arc;

use crate::ir::Graph;
use crate::lowering::passes::{
    DeadCodeEliminationPass, DecomposeGeluPass, DecomposeLinearPass, DecomposeSiluPass,
    EliminateIdentitiesPass, FoldConstantAttributesPass, NormalizeDefaultsPass, VerifyPass,
};
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> LoweringPipeline {
        LoweringPipeline { steps: self.steps }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoweringPipeline {
    steps: Vec<Step>,
}

impl LoweringPipeline {
    /// verify, fixed-point{fold, normalize, identities}, linear, silu, gelu,
    /// fixed-point{identities, dce}, verify.
    pub fn default_pipeline() -> Self {
        let iters = crate::env::lowering_max_iters();
        let mut builder = PipelineBuilder::new();
        builder.pass(Arc::new(VerifyPass));
        builder.fixed_point(iters, |p| {
            p.pass(Arc::new(FoldConstantAttributesPass));
            p.pass(Arc::new(NormalizeDefaultsPass));
            p.pass(Arc::new(EliminateIdentitiesPass));
        });
        builder.pass(Arc::new(DecomposeLinearPass));
        builder.pass(Arc::new(DecomposeSiluPass));
        builder.pass(Arc::new(DecomposeGeluPass));
        builder.fixed_point(iters, |p| {
            p.pass(Arc::new(EliminateIdentitiesPass));
            p.pass(Arc::new(DeadCodeEliminationPass));
        });
        builder.pass(Arc::new(VerifyPass));
        builder.finish()
    }

    pub fn run(&self, graph: &mut Graph, cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let mut totals = PassResult::default();
        run_steps(&self.steps, graph, cx, &mut totals)?;
        tracing::debug!(
            graph = %graph.name,
            changed = totals.changed,
            rewrites = totals.rewrites_applied,
            erased = totals.erased_nodes,
            nodes = graph.nodes.len(),
            "lowering finished"
        );
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    cx: &mut LoweringContext,
    totals: &mut PassResult,
) -> Result<bool, LoweringError> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let span = tracing::debug_span!("lowering_pass", pass = pass.name());
                let _enter = span.enter();
                let stats = pass.run(graph, cx)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if stats.changed {
                    tracing::trace!(
                        rewrites = stats.rewrites_applied,
                        erased = stats.erased_nodes,
                        "pass changed graph"
                    );
                    if crate::env::dump_graphs() {
                        tracing::trace!("after {}:\n{}", pass.name(), graph);
                    }
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, &mut local)?;
                    local.iterations += 1;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}
