use std::collections::{HashMap, HashSet};

use crate::ir::{Graph, NodeId, ValueId};
use crate::lowering::{GraphPass, LoweringContext, LoweringError, PassResult};

#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut LoweringContext) -> Result<PassResult, LoweringError> {
        let mut def_map: HashMap<ValueId, usize> = HashMap::with_capacity(graph.values.len());
        for (idx, node) in graph.nodes.iter().enumerate() {
            for output in &node.outputs {
                def_map.insert(*output, idx);
            }
        }

        let mut worklist: Vec<ValueId> = graph.outputs.clone();
        let mut live_nodes: HashSet<NodeId> = HashSet::new();
        for node in &graph.nodes {
            if node.kind.is_side_effecting() {
                live_nodes.insert(node.id);
                worklist.extend(node.inputs.iter().copied());
            }
        }

        let mut live: HashSet<ValueId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            let node = &graph.nodes[idx];
            live_nodes.insert(node.id);
            worklist.extend(node.inputs.iter().copied());
        }

        let before = graph.nodes.len();
        graph.nodes.retain(|node| live_nodes.contains(&node.id));
        let removed = before - graph.nodes.len();

        Ok(PassResult::erased(removed))
    }
}
