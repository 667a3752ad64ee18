use crate::ir::Graph;
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

/// Structural check run at both ends of the pipeline.
#[derive(Default)]
pub struct VerifyPass;

impl VerifyPass {
    const NAME: &'static str = "verify";
}

impl GraphPass for VerifyPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        graph
            .verify()
            .map_err(|source| LoweringError::Structural {
                pass: Self::NAME,
                source,
            })?;
        Ok(PassResult::default())
    }
}
