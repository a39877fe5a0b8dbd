//! Low-precision transformation engine: locates quantization boundary
//! markers, rewrites the surrounding subgraphs onto narrow storage types, and
//! carries the rescaling arithmetic as edge descriptors instead of live
//! nodes.
//!
//! The engine is a pipeline of independent rewrite passes run to a bounded
//! fixed point. Exhausting the iteration budget is not an error: the last
//! stable graph is returned, flagged as partially optimized.

pub mod passes;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::graph::Graph;
use crate::lower::DeviceCapabilities;

/// Result returned by a pass after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of pattern rewrites applied.
    pub rewrites_applied: usize,
    /// Nodes removed (typically by the cleanup pass).
    pub erased_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// Read-only services available to passes while they run.
pub struct PassContext<'a> {
    pub caps: &'a DeviceCapabilities,
    pub tolerance: f32,
}

/// Canonical interface implemented by graph rewrite passes.
///
/// A pass matches against the graph it receives and applies its rewrites, or
/// reports "no match" by returning an unchanged result. Passes must be
/// idempotent: re-running a converged pipeline on its own output is a no-op.
pub trait GraphPass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &PassContext<'_>) -> CompileResult<PassResult>;
}

/// Names of the built-in passes, used to configure the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassName {
    FqDecompose,
    FoldRescale,
    MoveThrough,
    FuseDequant,
    Cleanup,
}

impl PassName {
    pub fn as_str(self) -> &'static str {
        match self {
            PassName::FqDecompose => "fq-decompose",
            PassName::FoldRescale => "fold-rescale",
            PassName::MoveThrough => "move-through",
            PassName::FuseDequant => "fuse-dequant",
            PassName::Cleanup => "cleanup",
        }
    }

    fn instantiate(self) -> Box<dyn GraphPass> {
        match self {
            PassName::FqDecompose => Box::new(passes::FakeQuantizeDecomposition),
            PassName::FoldRescale => Box::new(passes::FoldRescale),
            PassName::MoveThrough => Box::new(passes::MoveDequantizationThroughLinear),
            PassName::FuseDequant => Box::new(passes::FuseDequantization),
            PassName::Cleanup => Box::new(passes::Cleanup),
        }
    }
}

impl fmt::Display for PassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline configuration: which passes run, in what order (the order also
/// breaks ties between equally-eligible rewrites), the numeric tolerance, and
/// the fixed-point iteration budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowPrecisionConfig {
    pub passes: Vec<PassName>,
    pub tolerance: f32,
    pub max_iterations: usize,
}

impl Default for LowPrecisionConfig {
    fn default() -> Self {
        Self {
            passes: vec![
                PassName::FqDecompose,
                PassName::FoldRescale,
                PassName::MoveThrough,
                PassName::FuseDequant,
                PassName::Cleanup,
            ],
            tolerance: 1e-6,
            max_iterations: 16,
        }
    }
}

/// Outcome of running the pipeline. `converged: false` means the iteration
/// budget ran out before a fixed point; the graph is the last stable state.
#[derive(Debug)]
pub struct TransformOutcome {
    pub graph: Graph,
    pub converged: bool,
    pub stats: PassResult,
}

/// The configured pass pipeline.
pub struct Pipeline {
    passes: Vec<Box<dyn GraphPass>>,
    tolerance: f32,
    max_iterations: usize,
}

impl Pipeline {
    pub fn from_config(config: &LowPrecisionConfig) -> Self {
        Self {
            passes: config.passes.iter().map(|name| name.instantiate()).collect(),
            tolerance: config.tolerance,
            max_iterations: config.max_iterations.max(1),
        }
    }

    /// Runs the configured passes to a fixed point bounded by the iteration
    /// budget. Externally visible Result descriptors are asserted unchanged.
    pub fn run(&self, graph: Graph, caps: &DeviceCapabilities) -> CompileResult<TransformOutcome> {
        let mut graph = graph;
        graph.validate()?;

        let before: Vec<_> = graph
            .result_ids()
            .iter()
            .map(|&id| {
                let node = graph.node(id).expect("validated result");
                (node.name.clone(), node.outputs[0].clone())
            })
            .collect();

        let cx = PassContext {
            caps,
            tolerance: self.tolerance,
        };

        let mut stats = PassResult::default();
        let mut converged = false;
        for _ in 0..self.max_iterations {
            let mut changed = false;
            for pass in &self.passes {
                let result = pass.run(&mut graph, &cx)?;
                changed |= result.changed;
                stats = stats.merge(result);
            }
            if !changed {
                converged = true;
                break;
            }
        }

        for (name, desc) in &before {
            let still = graph
                .result_ids()
                .iter()
                .find_map(|&id| {
                    let node = graph.node(id)?;
                    (node.name == *name).then(|| node.outputs[0].clone())
                })
                .ok_or_else(|| CompileError::invalid_graph(name, "result vanished during passes"))?;
            if still != *desc {
                return Err(CompileError::invalid_graph(
                    name,
                    "pass changed an externally visible result descriptor",
                ));
            }
        }

        graph.validate()?;
        Ok(TransformOutcome {
            graph,
            converged,
            stats,
        })
    }
}
