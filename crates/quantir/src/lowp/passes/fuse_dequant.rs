use crate::error::CompileResult;
use crate::graph::spec::Operation;
use crate::graph::{Graph, NodeId};
use crate::lowp::{GraphPass, PassContext, PassResult};

/// Normalizes descriptor placement after the other passes have run: adjacent
/// descriptors landing on one edge have already been composed into a single
/// affine transform when they were attached; this pass drops descriptors that
/// composed down to the identity, and bypasses reconstruct-only `Convert`
/// nodes whose work the edge descriptor already expresses.
pub struct FuseDequantization;

impl GraphPass for FuseDequantization {
    fn name(&self) -> &'static str {
        "fuse-dequant"
    }

    fn run(&self, graph: &mut Graph, cx: &PassContext<'_>) -> CompileResult<PassResult> {
        let mut result = PassResult::default();

        let identity_edges: Vec<(NodeId, usize)> = graph
            .nodes()
            .iter()
            .flat_map(|node| {
                node.inputs.iter().enumerate().filter_map(move |(idx, input)| {
                    input
                        .dequant
                        .as_ref()
                        .is_some_and(|d| d.is_identity(cx.tolerance))
                        .then_some((node.id, idx))
                })
            })
            .collect();
        for (consumer, input_idx) in identity_edges {
            let mut rw = graph.rewriter();
            rw.set_edge_dequant(consumer, input_idx, None)?;
            result.changed = true;
            result.rewrites_applied += 1;
        }

        let converts: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| matches!(node.op, Operation::Convert(_)))
            .map(|node| node.id)
            .collect();
        for id in converts {
            let Some(node) = graph.node(id).cloned() else {
                continue;
            };
            let Operation::Convert(spec) = &node.op else {
                continue;
            };
            if !spec.dtype.is_float() || node.inputs.len() != 1 {
                continue;
            }
            let Some(descriptor) = node.inputs[0].dequant.clone() else {
                continue;
            };
            let source = (node.inputs[0].node, node.inputs[0].port);

            let mut rw = graph.rewriter();
            let users = rw.users_of(id);
            if users.is_empty() {
                continue;
            }
            rw.replace_all_uses((id, 0), source);
            for (user, input_idx) in users {
                rw.push_edge_dequant(user, input_idx, &descriptor)?;
            }
            rw.erase_node(id)?;

            result.changed = true;
            result.rewrites_applied += 1;
            result.erased_nodes += 1;
        }

        Ok(result)
    }
}
