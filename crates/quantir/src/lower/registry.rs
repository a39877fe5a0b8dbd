//! Kind-keyed lowering dispatch: one construction function per operation
//! kind, registered in a table owned by the caller. This is the one true
//! extension point for teaching the compiler new operations.

use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};
use crate::graph::spec::{Dimension, Operation, PoolingKind, ResizeAlgorithm};
use crate::graph::{Graph, Node};
use crate::lower::{AttrValue, Primitive, PrimitiveId};

/// Resolution context handed to each construction function: the graph being
/// lowered and the node's inputs already resolved to primitive ids (edge
/// dequantization, when present, has been materialised upstream).
pub struct LoweringCtx<'a> {
    pub graph: &'a Graph,
    pub inputs: Vec<PrimitiveId>,
}

impl LoweringCtx<'_> {
    /// Resolved primitive id of input `index`, validating arity on the way
    /// (mirrors the per-op input count validation of classic plugin code).
    pub fn input(&self, node: &Node, index: usize) -> CompileResult<PrimitiveId> {
        self.inputs.get(index).cloned().ok_or_else(|| {
            CompileError::invalid_graph(
                &node.name,
                format!("lowering expected input {index} but node has {}", self.inputs.len()),
            )
        })
    }

    /// Conventional primitive id for the node itself.
    pub fn primitive_id(&self, node: &Node) -> PrimitiveId {
        PrimitiveId(format!("{}:{}", node.op.kind_name(), node.name))
    }

    /// Id for an auxiliary primitive emitted alongside the anchor.
    pub fn aux_id(&self, node: &Node, suffix: &str) -> PrimitiveId {
        PrimitiveId(format!("{}:{}/{suffix}", node.op.kind_name(), node.name))
    }
}

/// Construction function invoked for one node; returns the emitted
/// primitives with the anchor last.
pub type LoweringFn = fn(&LoweringCtx<'_>, &Node) -> CompileResult<Vec<Primitive>>;

/// String-keyed dispatch table from operation kind to construction function.
#[derive(Clone, Default)]
pub struct LoweringRegistry {
    entries: BTreeMap<String, LoweringFn>,
}

impl LoweringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in lowerings.
    pub fn with_default_lowerings() -> Self {
        let mut registry = Self::new();
        registry.register("parameter", lower_parameter);
        registry.register("result", lower_result);
        registry.register("constant", lower_constant);
        registry.register("convert", lower_convert);
        registry.register("convert_layout", lower_convert_layout);
        registry.register("resize", lower_resize);
        registry.register("normalize", lower_normalize);
        registry.register("convolution", lower_convolution);
        registry.register("pooling", lower_pooling);
        registry.register("eltwise", lower_eltwise);
        registry.register("concat", lower_concat);
        registry.register("relu", lower_relu);
        registry.register("reshape", lower_reshape);
        registry.register("softmax", lower_softmax);
        registry.register("fake_quantize", lower_fake_quantize);
        registry.register("quantize", lower_quantize);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, f: LoweringFn) {
        self.entries.insert(kind.into(), f);
    }

    pub fn get(&self, kind: &str) -> Option<LoweringFn> {
        self.entries.get(kind).copied()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn shape_attr(node: &Node) -> AttrValue {
    let dims: Vec<i64> = node.outputs[0]
        .shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(value) => *value as i64,
            Dimension::Dynamic(_) => -1,
        })
        .collect();
    AttrValue::I64Array(dims)
}

fn lower_parameter(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let desc = &node.outputs[0];
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "input", vec![])
        .attr("dtype", AttrValue::Str(desc.dtype.to_string()))
        .attr("layout", AttrValue::Str(desc.layout.to_string()))
        .attr("shape", shape_attr(node))])
}

fn lower_result(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "output", vec![input])
        .attr("dtype", AttrValue::Str(node.outputs[0].dtype.to_string()))])
}

fn lower_constant(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Constant(literal) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected constant payload"));
    };
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "data", vec![])
        .attr("dtype", AttrValue::Str(literal.desc.dtype.to_string()))
        .attr("shape", shape_attr(node))
        .attr("byte_len", AttrValue::I64(literal.bytes.len() as i64))])
}

fn lower_convert(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "reorder", vec![input])
        .attr("out_dtype", AttrValue::Str(node.outputs[0].dtype.to_string()))])
}

fn lower_convert_layout(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::ConvertLayout(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected layout payload"));
    };
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "reorder", vec![input])
        .attr("perm", AttrValue::from_usizes(&spec.perm))
        .attr("out_layout", AttrValue::Str(spec.target.to_string()))])
}

fn lower_resize(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Resize(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected resize payload"));
    };
    let input = ctx.input(node, 0)?;
    let algorithm = match spec.algorithm {
        ResizeAlgorithm::Nearest => "nearest",
        ResizeAlgorithm::Linear => "linear",
        ResizeAlgorithm::Cubic => "cubic",
    };
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "resample", vec![input])
        .attr("algorithm", AttrValue::Str(algorithm.to_string()))
        .attr(
            "sizes",
            AttrValue::I64Array(vec![spec.sizes.0 as i64, spec.sizes.1 as i64]),
        )])
}

/// Normalization emits an auxiliary `data` primitive holding the mean/scale
/// payload, wired in before the `scale` anchor.
fn lower_normalize(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Normalize(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected normalize payload"));
    };
    let input = ctx.input(node, 0)?;
    let data_id = ctx.aux_id(node, "coeffs");
    let data = Primitive::new(data_id.0.clone(), "data", vec![])
        .attr("mean", AttrValue::from_f32s(&spec.mean))
        .attr("scale", AttrValue::from_f32s(&spec.scale));
    let anchor = Primitive::new(ctx.primitive_id(node).0, "scale", vec![input, data_id]);
    Ok(vec![data, anchor])
}

fn lower_convolution(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Convolution(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected convolution payload"));
    };
    if node.inputs.len() < 2 {
        return Err(CompileError::invalid_graph(
            &node.name,
            "convolution expects data and weights inputs",
        ));
    }
    let inputs: Vec<PrimitiveId> = (0..node.inputs.len())
        .map(|idx| ctx.input(node, idx))
        .collect::<CompileResult<_>>()?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "convolution", inputs)
        .attr("strides", AttrValue::from_usizes(&spec.strides))
        .attr("pads_begin", AttrValue::from_usizes(&spec.pads_begin))
        .attr("pads_end", AttrValue::from_usizes(&spec.pads_end))
        .attr("dilations", AttrValue::from_usizes(&spec.dilations))
        .attr("groups", AttrValue::I64(spec.groups as i64))
        .attr("out_shape", shape_attr(node))])
}

fn lower_pooling(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Pooling(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected pooling payload"));
    };
    let input = ctx.input(node, 0)?;
    let mode = match spec.kind {
        PoolingKind::Max => "max",
        PoolingKind::Avg => "average",
    };
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "pooling", vec![input])
        .attr("mode", AttrValue::Str(mode.to_string()))
        .attr("window", AttrValue::from_usizes(&spec.window))
        .attr("strides", AttrValue::from_usizes(&spec.strides))
        .attr("pads_begin", AttrValue::from_usizes(&spec.pads_begin))
        .attr("pads_end", AttrValue::from_usizes(&spec.pads_end))])
}

fn lower_eltwise(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Eltwise(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected eltwise payload"));
    };
    let inputs: Vec<PrimitiveId> = (0..node.inputs.len())
        .map(|idx| ctx.input(node, idx))
        .collect::<CompileResult<_>>()?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "eltwise", inputs)
        .attr("mode", AttrValue::Str(format!("{:?}", spec.op).to_lowercase()))])
}

fn lower_concat(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Concat(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected concat payload"));
    };
    let inputs: Vec<PrimitiveId> = (0..node.inputs.len())
        .map(|idx| ctx.input(node, idx))
        .collect::<CompileResult<_>>()?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "concatenation", inputs)
        .attr("axis", AttrValue::I64(spec.axis as i64))])
}

fn lower_relu(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "activation", vec![input])
        .attr("function", AttrValue::Str("relu".to_string()))])
}

fn lower_reshape(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "reshape", vec![input])
        .attr("out_shape", shape_attr(node))])
}

fn lower_softmax(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Softmax(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected softmax payload"));
    };
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "softmax", vec![input])
        .attr("axis", AttrValue::I64(spec.axis as i64))])
}

fn lower_fake_quantize(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::FakeQuantize(details) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected fake_quantize payload"));
    };
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "quantize", vec![input])
        .attr("levels", AttrValue::I64(details.levels as i64))
        .attr("input_low", AttrValue::from_f32s(&details.input_low.values()))
        .attr("input_high", AttrValue::from_f32s(&details.input_high.values()))
        .attr("output_low", AttrValue::from_f32s(&details.output_low.values()))
        .attr("output_high", AttrValue::from_f32s(&details.output_high.values()))])
}

fn lower_quantize(ctx: &LoweringCtx<'_>, node: &Node) -> CompileResult<Vec<Primitive>> {
    let Operation::Quantize(spec) = &node.op else {
        return Err(CompileError::invalid_graph(&node.name, "expected quantize payload"));
    };
    let input = ctx.input(node, 0)?;
    Ok(vec![Primitive::new(ctx.primitive_id(node).0, "quantize", vec![input])
        .attr("levels", AttrValue::I64(spec.levels as i64))
        .attr("out_dtype", AttrValue::Str(spec.dtype.to_string()))
        .attr("low", AttrValue::from_f32s(&spec.low.values()))
        .attr("high", AttrValue::from_f32s(&spec.high.values()))])
}
