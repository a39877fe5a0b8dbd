//! Built-in rewrite passes for the low-precision pipeline.

mod cleanup;
mod fold_rescale;
mod fq_decompose;
mod fuse_dequant;
mod move_through;

pub use cleanup::Cleanup;
pub use fold_rescale::FoldRescale;
pub use fq_decompose::FakeQuantizeDecomposition;
pub use fuse_dequant::FuseDequantization;
pub use move_through::MoveDequantizationThroughLinear;
