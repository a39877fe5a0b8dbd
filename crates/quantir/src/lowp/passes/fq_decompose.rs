use crate::error::{CompileError, CompileResult};
use crate::graph::quant::Dequantization;
use crate::graph::spec::{Operation, QuantizeSpec};
use crate::graph::{Graph, NodeId};
use crate::lowp::{GraphPass, PassContext, PassResult};

/// Splits each quantization boundary marker into its two halves: a `Quantize`
/// node that clamps and discretizes onto narrow storage, and a dequantization
/// descriptor on every consumer edge carrying the reconstruction transform.
///
/// Storage signedness follows the output interval (fully non-negative →
/// unsigned, straddling zero → signed); the level count picks 8-bit or 16-bit
/// storage. Boundaries whose storage dtype the target cannot hold are left
/// untouched rather than silently widened.
pub struct FakeQuantizeDecomposition;

impl GraphPass for FakeQuantizeDecomposition {
    fn name(&self) -> &'static str {
        "fq-decompose"
    }

    fn run(&self, graph: &mut Graph, cx: &PassContext<'_>) -> CompileResult<PassResult> {
        let mut result = PassResult::default();
        let matches: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| matches!(node.op, Operation::FakeQuantize(_)))
            .map(|node| node.id)
            .collect();

        for id in matches {
            let Some(node) = graph.node(id).cloned() else {
                continue;
            };
            let Operation::FakeQuantize(details) = node.op.clone() else {
                continue;
            };
            details
                .validate()
                .map_err(|reason| CompileError::invalid_graph(&node.name, reason))?;
            if node.inputs.len() != 1 || node.outputs.len() != 1 {
                return Err(CompileError::invalid_graph(
                    &node.name,
                    "quantization boundary takes one input and one output",
                ));
            }
            if let (Some(bound_channels), Some(tensor_channels)) =
                (details.channel_count(), node.outputs[0].channel_count())
            {
                if bound_channels != tensor_channels {
                    return Err(CompileError::shape_mismatch(
                        &node.name,
                        format!(
                            "per-channel bounds cover {bound_channels} channels, tensor has {tensor_channels}"
                        ),
                    ));
                }
            }

            let dtype = details.storage_dtype();
            if !cx.caps.supports_dtype(dtype) {
                continue;
            }
            let descriptor = Dequantization::from_details(&details, dtype);
            let quantized_desc = node.outputs[0].with_dtype(dtype);
            let spec = QuantizeSpec {
                dtype,
                levels: details.levels,
                low: details.input_low.clone(),
                high: details.input_high.clone(),
            };

            let mut rw = graph.rewriter();
            let quantize = rw.insert_before(
                id,
                format!("{}/quantize", node.name),
                Operation::Quantize(spec),
                vec![node.inputs[0].clone()],
                vec![quantized_desc],
            )?;
            let users = rw.users_of(id);
            rw.replace_all_uses((id, 0), (quantize, 0));
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
