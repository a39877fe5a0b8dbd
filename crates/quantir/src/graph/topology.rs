use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId};

/// Kahn's algorithm over the node set. Ready nodes are drained smallest
/// storage position first, so the order is deterministic and stable under
/// ties by insertion order.
pub(crate) fn topological_order(graph: &Graph) -> CompileResult<Vec<NodeId>> {
    let nodes = graph.nodes();
    let mut position: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        position.insert(node.id, idx);
    }

    let mut indegree = vec![0usize; nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        for input in &node.inputs {
            if position.contains_key(&input.node) {
                indegree[idx] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(idx)) = ready.pop() {
        let id = nodes[idx].id;
        order.push(id);
        for (consumer_idx, consumer) in nodes.iter().enumerate() {
            let edges = consumer.inputs.iter().filter(|input| input.node == id).count();
            if edges > 0 {
                indegree[consumer_idx] -= edges;
                if indegree[consumer_idx] == 0 {
                    ready.push(Reverse(consumer_idx));
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(CompileError::CycleDetected);
    }
    Ok(order)
}
