use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId};
use crate::lower::{
    AttrValue, DeviceCapabilities, LoweringCtx, LoweringRegistry, Primitive, PrimitiveId,
    PrimitiveProgram,
};

/// Walks the graph in dependency order and emits one backend primitive chain
/// per node, wiring primitive inputs to the outputs of already-emitted
/// primitives.
///
/// Edge dequantization descriptors are materialised as auxiliary `scale`
/// primitives spliced between producer and consumer. Each node's construction
/// function may emit several primitives; the last one is the anchor visible
/// to downstream nodes.
pub fn build_program(
    graph: &Graph,
    caps: &DeviceCapabilities,
    registry: &LoweringRegistry,
) -> CompileResult<PrimitiveProgram> {
    graph.validate()?;
    let order = graph.topological_order()?;

    let mut anchors: HashMap<(NodeId, usize), PrimitiveId> = HashMap::new();
    let mut primitives = Vec::with_capacity(order.len());

    for id in order {
        let node = graph.node(id).expect("order covers every node");
        let kind = node.op.kind_name();

        if !caps.supports_op(kind) {
            return Err(CompileError::UnsupportedOperation {
                op: format!("{kind} ('{}')", node.name),
            });
        }
        for desc in &node.outputs {
            if !caps.supports_dtype(desc.dtype) {
                return Err(CompileError::UnsupportedOperation {
                    op: format!("{kind} ('{}') producing {}", node.name, desc.dtype),
                });
            }
        }

        let mut resolved = Vec::with_capacity(node.inputs.len());
        for (idx, input) in node.inputs.iter().enumerate() {
            let anchor = anchors
                .get(&(input.node, input.port))
                .cloned()
                .ok_or_else(|| CompileError::UnresolvedDependency {
                    node: node.name.clone(),
                    input: idx,
                })?;
            let resolved_id = match &input.dequant {
                Some(descriptor) => {
                    let scale_id = PrimitiveId(format!("scale:{}/dequant{idx}", node.name));
                    primitives.push(
                        Primitive::new(scale_id.0.clone(), "scale", vec![anchor])
                            .attr("scales", AttrValue::from_f32s(&descriptor.scale))
                            .attr("offsets", AttrValue::from_f32s(&descriptor.offset)),
                    );
                    scale_id
                }
                None => anchor,
            };
            resolved.push(resolved_id);
        }

        let construct = registry
            .get(kind)
            .ok_or_else(|| CompileError::UnsupportedOperation {
                op: kind.to_string(),
            })?;
        let ctx = LoweringCtx {
            graph,
            inputs: resolved,
        };
        let emitted = construct(&ctx, node)?;
        let anchor_id = match emitted.last() {
            Some(primitive) => primitive.id.clone(),
            None => {
                return Err(CompileError::invalid_graph(
                    &node.name,
                    "lowering emitted no primitives",
                ))
            }
        };
        primitives.extend(emitted);
        for port in 0..node.outputs.len() {
            anchors.insert((id, port), anchor_id.clone());
        }
    }

    let mut outputs = Vec::with_capacity(graph.result_ids().len());
    for &result in graph.result_ids() {
        let node = graph.node(result).expect("validated result");
        let anchor = anchors
            .get(&(result, 0))
            .cloned()
            .expect("results are lowered in order");
        outputs.push((node.name.clone(), anchor));
    }

    let program = PrimitiveProgram {
        primitives,
        outputs,
    };
    program.validate_topology()?;
    Ok(program)
}
