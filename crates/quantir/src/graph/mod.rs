//! In-memory graph model: nodes, tensor descriptors, edges, and the
//! traversal/replacement/validation primitives every pass builds on.

pub mod quant;
pub mod spec;

mod index;
mod rewriter;
mod topology;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::graph::quant::Dequantization;
use crate::graph::spec::{Operation, TensorDesc};

pub use index::GraphIndices;
pub use rewriter::GraphRewriter;

/// Unique identifier for a node within its owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Reference to another node's output slot, plus optional edge metadata.
///
/// Inputs are plain identifiers resolved through the owning graph, never
/// ownership pointers. The `dequant` field carries the dequantization
/// descriptor attached to this edge, when any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub node: NodeId,
    pub port: usize,
    pub dequant: Option<Dequantization>,
}

impl Input {
    pub fn plain(node: NodeId, port: usize) -> Self {
        Self {
            node,
            port,
            dequant: None,
        }
    }
}

/// A named operation instance with ordered inputs and output slots.
///
/// Nodes are immutable after construction; rewrites build replacement nodes
/// and splice them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Operation,
    pub inputs: Vec<Input>,
    pub outputs: Vec<TensorDesc>,
}

/// Directed acyclic graph of operation nodes, reachable from designated
/// Parameter and Result nodes.
///
/// Storage order is kept topological: every node's inputs reference nodes at
/// earlier positions. `validate` checks this along with the rest of the
/// structural invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    parameter_ids: Vec<NodeId>,
    result_ids: Vec<NodeId>,
    next_id: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            parameter_ids: Vec::new(),
            result_ids: Vec::new(),
            next_id: 0,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn parameter_ids(&self) -> &[NodeId] {
        &self.parameter_ids
    }

    pub fn result_ids(&self) -> &[NodeId] {
        &self.result_ids
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Position of `id` in storage order.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    /// Descriptor of the given output slot.
    pub fn output_desc(&self, id: NodeId, port: usize) -> Option<&TensorDesc> {
        self.node(id)?.outputs.get(port)
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_inputs(&self, name: &str, inputs: &[Input]) -> CompileResult<()> {
        for input in inputs {
            let producer = self.node(input.node).ok_or_else(|| {
                CompileError::invalid_graph(
                    name,
                    format!("input references unknown node {}", input.node),
                )
            })?;
            if input.port >= producer.outputs.len() {
                return Err(CompileError::invalid_graph(
                    name,
                    format!(
                        "input references output {} of '{}' which has {} outputs",
                        input.port,
                        producer.name,
                        producer.outputs.len()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Adds a Parameter node carrying the declared descriptor.
    pub fn add_parameter(&mut self, name: impl Into<String>, desc: TensorDesc) -> NodeId {
        let id = self.allocate_id();
        self.nodes.push(Node {
            id,
            name: name.into(),
            op: Operation::Parameter,
            inputs: Vec::new(),
            outputs: vec![desc],
        });
        self.parameter_ids.push(id);
        id
    }

    /// Adds an operation node; all inputs must reference existing nodes.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<Input>,
        outputs: Vec<TensorDesc>,
    ) -> CompileResult<NodeId> {
        let name = name.into();
        self.check_inputs(&name, &inputs)?;
        let id = self.allocate_id();
        self.nodes.push(Node {
            id,
            name,
            op,
            inputs,
            outputs,
        });
        Ok(id)
    }

    /// Adds a Result node consuming the given value; its descriptor mirrors
    /// the producer's output slot.
    pub fn add_result(&mut self, name: impl Into<String>, input: Input) -> CompileResult<NodeId> {
        let name = name.into();
        self.check_inputs(&name, std::slice::from_ref(&input))?;
        let desc = self
            .output_desc(input.node, input.port)
            .expect("checked above")
            .clone();
        let id = self.allocate_id();
        self.nodes.push(Node {
            id,
            name,
            op: Operation::Result,
            inputs: vec![input],
            outputs: vec![desc],
        });
        self.result_ids.push(id);
        Ok(id)
    }

    /// Replaces `old` with a newly constructed node, rewiring all consumers
    /// of `old`'s outputs to the replacement's outputs of matching index.
    ///
    /// Fails with `ShapeMismatch` when the output arity, element types, or
    /// shapes are incompatible. The old node is left in place, orphaned, for
    /// the cleanup pass to sweep.
    pub fn replace_node(
        &mut self,
        old: NodeId,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<Input>,
        outputs: Vec<TensorDesc>,
    ) -> CompileResult<NodeId> {
        let name = name.into();
        let old_pos = self.position(old).ok_or_else(|| {
            CompileError::invalid_graph(&name, format!("replacement target {old} does not exist"))
        })?;
        self.check_inputs(&name, &inputs)?;

        let old_outputs = &self.nodes[old_pos].outputs;
        if old_outputs.len() != outputs.len() {
            return Err(CompileError::shape_mismatch(
                &name,
                format!(
                    "output arity {} does not match replaced node's {}",
                    outputs.len(),
                    old_outputs.len()
                ),
            ));
        }
        for (port, (old_desc, new_desc)) in old_outputs.iter().zip(outputs.iter()).enumerate() {
            if old_desc.dtype != new_desc.dtype {
                return Err(CompileError::shape_mismatch(
                    &name,
                    format!(
                        "output {port} changes element type {} -> {}",
                        old_desc.dtype, new_desc.dtype
                    ),
                ));
            }
            if old_desc.shape != new_desc.shape {
                return Err(CompileError::shape_mismatch(
                    &name,
                    format!(
                        "output {port} changes shape {} -> {}",
                        old_desc.shape, new_desc.shape
                    ),
                ));
            }
        }

        let id = self.allocate_id();
        self.nodes.insert(
            old_pos,
            Node {
                id,
                name,
                op,
                inputs,
                outputs,
            },
        );
        for node in &mut self.nodes {
            if node.id == id {
                continue;
            }
            for input in &mut node.inputs {
                if input.node == old {
                    input.node = id;
                }
            }
        }
        for param in &mut self.parameter_ids {
            if *param == old {
                *param = id;
            }
        }
        for result in &mut self.result_ids {
            if *result == old {
                *result = id;
            }
        }
        Ok(id)
    }

    /// Produces a deterministic topological order of all nodes, stable under
    /// ties by insertion order. Fails with `CycleDetected` when the graph is
    /// not acyclic.
    pub fn topological_order(&self) -> CompileResult<Vec<NodeId>> {
        topology::topological_order(self)
    }

    /// Checks the structural invariants, reporting the first violation found.
    pub fn validate(&self) -> CompileResult<()> {
        index::validate_graph(self)
    }

    /// Opens a rewriting session over this graph.
    pub fn rewriter(&mut self) -> GraphRewriter<'_> {
        GraphRewriter::new(self)
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    /// Swaps in a fresh descriptor on one output slot, preserving the node's
    /// identity. Used by the injector when retargeting boundary nodes.
    pub(crate) fn set_output_desc(&mut self, id: NodeId, port: usize, desc: TensorDesc) {
        if let Some(node) = self.nodes.iter_mut().find(|node| node.id == id) {
            if let Some(slot) = node.outputs.get_mut(port) {
                *slot = desc;
            }
        }
    }

    /// Restores topological storage order after out-of-order construction.
    pub(crate) fn sort_topologically(&mut self) -> CompileResult<()> {
        let order = self.topological_order()?;
        let mut by_id: std::collections::HashMap<NodeId, Node> =
            self.nodes.drain(..).map(|node| (node.id, node)).collect();
        for id in order {
            let node = by_id.remove(&id).expect("order covers every node");
            self.nodes.push(node);
        }
        Ok(())
    }

}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        for node in &self.nodes {
            write!(f, "  {} {} = {}(", node.id, node.name, node.op.kind_name())?;
            for (idx, input) in node.inputs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}.{}", input.node, input.port)?;
                if let Some(dq) = &input.dequant {
                    write!(f, " {dq}")?;
                }
            }
            f.write_str(")")?;
            for desc in &node.outputs {
                write!(f, " -> {desc}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "}}")
    }
}
