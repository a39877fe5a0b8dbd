//! quantir compiles a declarative neural-network computation graph into a
//! backend-ready primitive program, rewriting selected subgraphs to run at
//! reduced numeric precision on the way.
//!
//! The pipeline has three stages: the preprocessing injector splices the
//! caller's declared tensor conversions into the graph boundary, the
//! low-precision engine decomposes quantization boundary markers and carries
//! the rescaling arithmetic as edge descriptors, and the program builder
//! lowers each node onto backend primitives in dependency order.

pub mod compiler;
pub mod error;
pub mod graph;
pub mod lower;
pub mod lowp;
pub mod preprocess;

pub use compiler::{CompiledModel, Compiler};
pub use error::{CompileError, CompileResult};
pub use graph::{Graph, Input, Node, NodeId};
pub use lower::{DeviceCapabilities, LoweringRegistry, Primitive, PrimitiveId, PrimitiveProgram};
pub use lowp::{LowPrecisionConfig, Pipeline, TransformOutcome};
pub use preprocess::PreprocessConfig;
