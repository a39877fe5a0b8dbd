use crate::error::{CompileError, CompileResult};
use crate::graph::quant::Dequantization;
use crate::graph::spec::{Operation, TensorDesc};
use crate::graph::{Graph, Input, Node, NodeId};

/// Mutable graph editor used by rewrite passes.
///
/// The rewriter exposes splice-level operations (use replacement, erasure,
/// positional insertion, edge metadata edits) while keeping the storage order
/// topological. Consumer lists are computed per call; graphs at this stage
/// are small enough that cached indices would not pay for their upkeep.
pub struct GraphRewriter<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphRewriter<'a> {
    pub(crate) fn new(graph: &'a mut Graph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Consumers of any output of `id`, as (consumer, input index) pairs.
    pub fn users_of(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut users = Vec::new();
        for node in self.graph.nodes() {
            for (idx, input) in node.inputs.iter().enumerate() {
                if input.node == id {
                    users.push((node.id, idx));
                }
            }
        }
        users
    }

    /// Rewires every use of `from` to `to`, preserving per-edge
    /// dequantization descriptors.
    pub fn replace_all_uses(&mut self, from: (NodeId, usize), to: (NodeId, usize)) {
        if from == to {
            return;
        }
        for node in self.graph.nodes_mut() {
            for input in &mut node.inputs {
                if input.node == from.0 && input.port == from.1 {
                    input.node = to.0;
                    input.port = to.1;
                }
            }
        }
    }

    /// Attaches, replaces, or clears the descriptor on one edge.
    pub fn set_edge_dequant(
        &mut self,
        consumer: NodeId,
        input_index: usize,
        dequant: Option<Dequantization>,
    ) -> CompileResult<()> {
        let node = self
            .graph
            .nodes_mut()
            .iter_mut()
            .find(|node| node.id == consumer)
            .ok_or_else(|| {
                CompileError::invalid_graph(format!("{consumer}"), "edge consumer does not exist")
            })?;
        let name = node.name.clone();
        let input = node.inputs.get_mut(input_index).ok_or_else(|| {
            CompileError::invalid_graph(name, format!("no input {input_index} on edge consumer"))
        })?;
        input.dequant = dequant;
        Ok(())
    }

    /// Composes `descriptor` onto the edge: the produced values pass through
    /// `descriptor` first, then through whatever the edge already carried.
    pub fn push_edge_dequant(
        &mut self,
        consumer: NodeId,
        input_index: usize,
        descriptor: &Dequantization,
    ) -> CompileResult<()> {
        let existing = self
            .graph
            .node(consumer)
            .and_then(|node| node.inputs.get(input_index))
            .ok_or_else(|| {
                CompileError::invalid_graph(
                    format!("{consumer}"),
                    format!("no input {input_index} on edge consumer"),
                )
            })?
            .dequant
            .clone();
        let combined = match existing {
            Some(next) => descriptor.then(&next),
            None => descriptor.clone(),
        };
        self.set_edge_dequant(consumer, input_index, Some(combined))
    }

    /// Removes an orphaned node. Refuses nodes with live uses or nodes
    /// registered as Parameters/Results.
    pub fn erase_node(&mut self, id: NodeId) -> CompileResult<()> {
        let users = self.users_of(id);
        let node = self
            .graph
            .node(id)
            .ok_or_else(|| CompileError::invalid_graph(format!("{id}"), "node does not exist"))?;
        if !users.is_empty() {
            return Err(CompileError::invalid_graph(
                &node.name,
                format!("cannot erase node with {} live uses", users.len()),
            ));
        }
        if self.graph.parameter_ids().contains(&id) || self.graph.result_ids().contains(&id) {
            return Err(CompileError::invalid_graph(
                &node.name,
                "cannot erase a Parameter or Result node",
            ));
        }
        let pos = self.graph.position(id).expect("node found above");
        self.graph.nodes_mut().remove(pos);
        Ok(())
    }

    /// Inserts a new node immediately before `at` in storage order.
    pub fn insert_before(
        &mut self,
        at: NodeId,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<Input>,
        outputs: Vec<TensorDesc>,
    ) -> CompileResult<NodeId> {
        let name = name.into();
        let pos = self.graph.position(at).ok_or_else(|| {
            CompileError::invalid_graph(&name, format!("insertion point {at} does not exist"))
        })?;
        // Reuse the reference checks from add_node, then move into position.
        let id = self.graph.add_node(name, op, inputs, outputs)?;
        let node = self.graph.nodes_mut().pop().expect("just added");
        self.graph.nodes_mut().insert(pos, node);
        Ok(id)
    }

    /// Delegates to [`Graph::replace_node`].
    pub fn replace_node(
        &mut self,
        old: NodeId,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<Input>,
        outputs: Vec<TensorDesc>,
    ) -> CompileResult<NodeId> {
        self.graph.replace_node(old, name, op, inputs, outputs)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node(id)
    }
}
