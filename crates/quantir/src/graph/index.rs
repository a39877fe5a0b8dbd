use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::error::{CompileError, CompileResult};
use crate::graph::spec::Operation;
use crate::graph::{Graph, NodeId};

/// Structural indices over a graph: storage positions and consumer lists.
#[derive(Debug, Clone)]
pub struct GraphIndices {
    position: HashMap<NodeId, usize>,
    users: HashMap<NodeId, SmallVec<[NodeId; 4]>>,
}

impl GraphIndices {
    /// Builds indices for the graph, validating reference invariants on the
    /// way: unique node ids, inputs referencing existing nodes at earlier
    /// positions, and in-bounds output ports.
    pub fn build(graph: &Graph) -> CompileResult<Self> {
        let mut position: HashMap<NodeId, usize> = HashMap::with_capacity(graph.nodes().len());
        let mut users: HashMap<NodeId, SmallVec<[NodeId; 4]>> = HashMap::new();

        for (idx, node) in graph.nodes().iter().enumerate() {
            for input in &node.inputs {
                let producer_pos = *position.get(&input.node).ok_or_else(|| {
                    CompileError::invalid_graph(
                        &node.name,
                        format!(
                            "input references {} which is missing or does not precede the node",
                            input.node
                        ),
                    )
                })?;
                let producer = &graph.nodes()[producer_pos];
                if input.port >= producer.outputs.len() {
                    return Err(CompileError::invalid_graph(
                        &node.name,
                        format!(
                            "input references output {} of '{}' which has {} outputs",
                            input.port,
                            producer.name,
                            producer.outputs.len()
                        ),
                    ));
                }
                users.entry(input.node).or_default().push(node.id);
            }
            if position.insert(node.id, idx).is_some() {
                return Err(CompileError::invalid_graph(
                    &node.name,
                    format!("duplicate node id {}", node.id),
                ));
            }
        }

        Ok(Self { position, users })
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.position.get(&id).copied()
    }

    pub fn users_of(&self, id: NodeId) -> &[NodeId] {
        self.users.get(&id).map(|list| list.as_slice()).unwrap_or(&[])
    }
}

/// Full invariant check: reference structure plus the Parameter/Result
/// bookkeeping and quantization interval invariants.
pub(crate) fn validate_graph(graph: &Graph) -> CompileResult<()> {
    GraphIndices::build(graph)?;

    let mut seen = HashSet::new();
    for &param in graph.parameter_ids() {
        if !seen.insert(param) {
            return Err(CompileError::invalid_graph(
                format!("{param}"),
                "duplicate parameter registration",
            ));
        }
        let node = graph.node(param).ok_or_else(|| {
            CompileError::invalid_graph(format!("{param}"), "registered parameter does not exist")
        })?;
        if !matches!(node.op, Operation::Parameter) {
            return Err(CompileError::invalid_graph(
                &node.name,
                "registered parameter is not a Parameter node",
            ));
        }
        if !node.inputs.is_empty() || node.outputs.len() != 1 {
            return Err(CompileError::invalid_graph(
                &node.name,
                "Parameter nodes take no inputs and carry exactly one output",
            ));
        }
    }

    let mut seen = HashSet::new();
    for &result in graph.result_ids() {
        if !seen.insert(result) {
            return Err(CompileError::invalid_graph(
                format!("{result}"),
                "duplicate result registration",
            ));
        }
        let node = graph.node(result).ok_or_else(|| {
            CompileError::invalid_graph(format!("{result}"), "registered result does not exist")
        })?;
        if !matches!(node.op, Operation::Result) {
            return Err(CompileError::invalid_graph(
                &node.name,
                "registered result is not a Result node",
            ));
        }
        if node.inputs.len() != 1 || node.outputs.len() != 1 {
            return Err(CompileError::invalid_graph(
                &node.name,
                "Result nodes take exactly one input and carry exactly one output",
            ));
        }
    }

    for node in graph.nodes() {
        match &node.op {
            Operation::Parameter if !graph.parameter_ids().contains(&node.id) => {
                return Err(CompileError::invalid_graph(
                    &node.name,
                    "Parameter node is not registered with the graph",
                ));
            }
            Operation::Result if !graph.result_ids().contains(&node.id) => {
                return Err(CompileError::invalid_graph(
                    &node.name,
                    "Result node is not registered with the graph",
                ));
            }
            Operation::FakeQuantize(details) => {
                details
                    .validate()
                    .map_err(|reason| CompileError::invalid_graph(&node.name, reason))?;
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::CompileError;
    use crate::graph::spec::{DType, Layout, Operation, Shape, TensorDesc};
    use crate::graph::{Graph, Input};

    fn desc() -> TensorDesc {
        TensorDesc::new(DType::F32, Shape::from_static(&[1, 4]), Layout::new("NC"))
    }

    fn small_graph() -> Graph {
        let mut graph = Graph::new();
        let param = graph.add_parameter("x", desc());
        let relu = graph
            .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![desc()])
            .unwrap();
        graph.add_result("out", Input::plain(relu, 0)).unwrap();
        graph
    }

    #[test]
    fn validate_accepts_well_formed_graphs() {
        small_graph().validate().unwrap();
    }

    #[test]
    fn validate_rejects_forward_references() {
        let mut graph = small_graph();
        graph.nodes_mut().swap(0, 1);
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut graph = small_graph();
        let copy = graph.nodes()[1].clone();
        graph.nodes_mut().push(copy);
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_ports() {
        let mut graph = small_graph();
        let pos = graph.nodes().iter().position(|n| n.name == "act").unwrap();
        graph.nodes_mut()[pos].inputs[0].port = 5;
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));
    }
}
