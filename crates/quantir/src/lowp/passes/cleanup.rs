use std::collections::HashSet;

use crate::error::CompileResult;
use crate::graph::{Graph, NodeId};
use crate::lowp::{GraphPass, PassContext, PassResult};

/// Sweeps nodes left orphaned by the rewrite passes: anything not reachable
/// from a Result. Parameters are part of the graph's interface and are never
/// removed, reachable or not.
pub struct Cleanup;

impl GraphPass for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn run(&self, graph: &mut Graph, _cx: &PassContext<'_>) -> CompileResult<PassResult> {
        let mut live: HashSet<NodeId> = HashSet::with_capacity(graph.nodes().len());
        let mut worklist: Vec<NodeId> = graph
            .result_ids()
            .iter()
            .chain(graph.parameter_ids())
            .copied()
            .collect();

        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            if let Some(node) = graph.node(id) {
                for input in &node.inputs {
                    worklist.push(input.node);
                }
            }
        }

        let before = graph.nodes().len();
        graph.nodes_mut().retain(|node| live.contains(&node.id));
        let erased = before - graph.nodes().len();

        Ok(PassResult {
            changed: erased > 0,
            rewrites_applied: 0,
            erased_nodes: erased,
        })
    }
}
