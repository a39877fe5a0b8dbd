use crate::error::CompileResult;
use crate::graph::quant::Dequantization;
use crate::graph::spec::{EltwiseOp, Operation};
use crate::graph::{Graph, Input, NodeId};
use crate::lowp::{GraphPass, PassContext, PassResult};

/// Folds constant rescaling arithmetic sitting between quantization
/// boundaries into the edge descriptor: `mul`/`add`/`sub` by a per-tensor or
/// per-channel constant becomes part of the affine reconstruction, and the
/// arithmetic node disappears from the graph.
pub struct FoldRescale;

impl GraphPass for FoldRescale {
    fn name(&self) -> &'static str {
        "fold-rescale"
    }

    fn run(&self, graph: &mut Graph, _cx: &PassContext<'_>) -> CompileResult<PassResult> {
        let mut result = PassResult::default();
        let candidates: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| matches!(node.op, Operation::Eltwise(_)))
            .map(|node| node.id)
            .collect();

        for id in candidates {
            // Re-verify against the current graph: an earlier fold this run
            // may have rewired or erased the candidate.
            let Some(node) = graph.node(id).cloned() else {
                continue;
            };
            let Operation::Eltwise(spec) = &node.op else {
                continue;
            };
            if node.inputs.len() != 2 {
                continue;
            }
            let Some((data_idx, values)) = rescale_operands(graph, &node.inputs) else {
                continue;
            };
            let Some(base) = node.inputs[data_idx].dequant.clone() else {
                continue;
            };
            if values.iter().any(|v| !v.is_finite()) {
                continue;
            }
            if values.len() > 1 {
                let Some(channels) = node.outputs[0].channel_count() else {
                    continue;
                };
                if values.len() != channels {
                    continue;
                }
            }

            let rescale = match spec.op {
                EltwiseOp::Mul => {
                    Dequantization::per_channel(values.clone(), vec![0.0; values.len()])
                }
                EltwiseOp::Add => {
                    Dequantization::per_channel(vec![1.0; values.len()], values.clone())
                }
                // Only data-minus-constant folds; constant-minus-data flips
                // the sign of the whole transform and stays in the graph.
                EltwiseOp::Sub if data_idx == 0 => Dequantization::per_channel(
                    vec![1.0; values.len()],
                    values.iter().map(|v| -v).collect(),
                ),
                _ => continue,
            };
            let folded = base.then(&rescale);

            let source = (node.inputs[data_idx].node, node.inputs[data_idx].port);
            let mut rw = graph.rewriter();
            let users = rw.users_of(id);
            rw.replace_all_uses((id, 0), source);
            for (user, input_idx) in &users {
                rw.push_edge_dequant(*user, *input_idx, &folded)?;
            }
            rw.erase_node(id)?;

            result.changed = true;
            result.rewrites_applied += 1;
            result.erased_nodes += 1;
        }
        Ok(result)
    }
}

/// When exactly one operand is a plain constant and the other carries a
/// dequantization descriptor, returns the data operand index and the decoded
/// constant values.
fn rescale_operands(graph: &Graph, inputs: &[Input]) -> Option<(usize, Vec<f32>)> {
    let const0 = constant_values(graph, &inputs[0]);
    let const1 = constant_values(graph, &inputs[1]);
    match (const0, const1) {
        (Some(values), None) if inputs[1].dequant.is_some() => Some((1, values)),
        (None, Some(values)) if inputs[0].dequant.is_some() => Some((0, values)),
        _ => None,
    }
}

fn constant_values(graph: &Graph, input: &Input) -> Option<Vec<f32>> {
    if input.dequant.is_some() {
        return None;
    }
    let node = graph.node(input.node)?;
    let Operation::Constant(literal) = &node.op else {
        return None;
    };
    literal.as_f32s()
}
