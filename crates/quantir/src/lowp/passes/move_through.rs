use crate::error::CompileResult;
use crate::graph::quant::{Dequantization, Granularity};
use crate::graph::spec::Operation;
use crate::graph::{Graph, Node, NodeId};
use crate::lowp::{GraphPass, PassContext, PassResult};

/// Moves a dequantization descriptor across operations it legally commutes
/// with (`op(a*x + b) = a*op(x) + b'`), letting the operation itself execute
/// on the narrow representation. Legality is decided by the per-kind
/// predicate in the capability table; kinds without a predicate are opaque,
/// and ambiguous subgraphs are left non-fused.
pub struct MoveDequantizationThroughLinear;

impl GraphPass for MoveDequantizationThroughLinear {
    fn name(&self) -> &'static str {
        "move-through"
    }

    fn run(&self, graph: &mut Graph, cx: &PassContext<'_>) -> CompileResult<PassResult> {
        let mut result = PassResult::default();
        let candidates: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| cx.caps.commute_predicate(node.op.kind_name()).is_some())
            .map(|node| node.id)
            .collect();

        for id in candidates {
            // Descriptors may have been composed onto this node's edges by an
            // earlier move this run; always judge the current state.
            let Some(node) = graph.node(id).cloned() else {
                continue;
            };
            let Some(predicate) = cx.caps.commute_predicate(node.op.kind_name()) else {
                continue;
            };
            let Some(moving) = moving_inputs(&node.op, node.inputs.len()) else {
                continue;
            };
            let descriptors: Option<Vec<Dequantization>> = moving
                .iter()
                .map(|&idx| node.inputs[idx].dequant.clone())
                .collect();
            let Some(descriptors) = descriptors else {
                continue;
            };
            if !predicate(&node.op, &descriptors, cx.tolerance) {
                continue;
            }
            let Some(moved) = moved_descriptor(graph, &node, &moving, &descriptors) else {
                continue;
            };

            let mut rw = graph.rewriter();
            let users = rw.users_of(id);
            for &idx in &moving {
                rw.set_edge_dequant(id, idx, None)?;
            }
            for (user, input_idx) in users {
                rw.push_edge_dequant(user, input_idx, &moved)?;
            }

            result.changed = true;
            result.rewrites_applied += 1;
        }
        Ok(result)
    }
}

/// Which inputs carry the value stream a descriptor would move along. Weights
/// and other attribute-like operands stay put.
fn moving_inputs(op: &Operation, arity: usize) -> Option<Vec<usize>> {
    match op {
        Operation::Convolution(_) | Operation::Pooling(_) | Operation::Relu => Some(vec![0]),
        Operation::Concat(_) => Some((0..arity).collect()),
        _ => None,
    }
}

/// The descriptor that lands on the operation's output edges. For
/// concatenation over the channel axis with per-channel inputs this is the
/// channelwise concatenation of the input transforms; everywhere else the
/// (single, or agreed-upon) input descriptor moves unchanged.
fn moved_descriptor(
    graph: &Graph,
    node: &Node,
    moving: &[usize],
    descriptors: &[Dequantization],
) -> Option<Dequantization> {
    let Operation::Concat(spec) = &node.op else {
        return Some(descriptors[0].clone());
    };
    if descriptors
        .iter()
        .all(|d| d.granularity() == Granularity::PerTensor)
    {
        return Some(descriptors[0].clone());
    }

    let channel_axis = node.outputs[0].layout.channel_index()?;
    if spec.axis != channel_axis {
        return None;
    }
    let mut parts = Vec::with_capacity(moving.len());
    for (descriptor, &idx) in descriptors.iter().zip(moving) {
        let input = &node.inputs[idx];
        let desc = graph.output_desc(input.node, input.port)?;
        let channels = desc.channel_count()?;
        if descriptor.channel_count() != channels {
            return None;
        }
        parts.push((descriptor, channels));
    }
    Some(Dequantization::concat(&parts))
}
