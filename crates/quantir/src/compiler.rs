//! End-to-end compilation driver: preprocessing injection, the low-precision
//! pipeline, and primitive lowering, in that order.

use crate::error::CompileResult;
use crate::graph::Graph;
use crate::lower::{build_program, DeviceCapabilities, LoweringRegistry, PrimitiveProgram};
use crate::lowp::{LowPrecisionConfig, PassResult, Pipeline};
use crate::preprocess::{self, PreprocessConfig};

/// Compilation result: the executable program plus pipeline diagnostics.
#[derive(Debug)]
pub struct CompiledModel {
    pub program: PrimitiveProgram,
    /// `false` when the low-precision pipeline hit its iteration budget; the
    /// program is still valid, built from the last stable graph.
    pub converged: bool,
    pub stats: PassResult,
}

/// The compiler entry point. Capability and lowering tables are owned values
/// passed in at construction, so concurrent compilations with different
/// capability sets are safe.
pub struct Compiler {
    caps: DeviceCapabilities,
    registry: LoweringRegistry,
}

impl Compiler {
    pub fn new(caps: DeviceCapabilities, registry: LoweringRegistry) -> Self {
        Self { caps, registry }
    }

    /// Compiler over the built-in operation set and lowerings.
    pub fn with_defaults() -> Self {
        Self::new(
            DeviceCapabilities::with_default_ops(),
            LoweringRegistry::with_default_lowerings(),
        )
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    pub fn registry_mut(&mut self) -> &mut LoweringRegistry {
        &mut self.registry
    }

    /// Runs the full pipeline over `graph`. The input graph is never
    /// modified; every stage hands a new graph to the next.
    pub fn compile(
        &self,
        graph: &Graph,
        preprocess_config: &PreprocessConfig,
        lowp_config: &LowPrecisionConfig,
    ) -> CompileResult<CompiledModel> {
        let staged = preprocess::apply(graph, preprocess_config)?;
        let outcome = Pipeline::from_config(lowp_config).run(staged, &self.caps)?;
        let program = build_program(&outcome.graph, &self.caps, &self.registry)?;
        Ok(CompiledModel {
            program,
            converged: outcome.converged,
            stats: outcome.stats,
        })
    }
}
