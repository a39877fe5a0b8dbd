//! Preprocessing injector: rewrites a graph's input/output boundary to insert
//! the type, layout, resize, and normalization steps a caller declares for
//! its runtime tensors.
//!
//! The injector never edits the caller's graph; it builds a new one and hands
//! it back, so a failed configuration leaves the original fully intact.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::graph::spec::{
    CastSpec, DType, Dimension, Layout, LayoutConvertSpec, NormalizeSpec, Operation,
    ResizeAlgorithm, ResizeSpec, TensorDesc,
};
use crate::graph::{Graph, Input, NodeId};

/// Declared properties of the runtime tensor feeding one graph input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorHint {
    pub dtype: Option<DType>,
    pub layout: Option<Layout>,
    /// Static (height, width) of the runtime tensor, overriding dynamic or
    /// mismatched spatial extents before a resize step.
    pub spatial: Option<(usize, usize)>,
}

/// One conversion step, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreprocessStep {
    ConvertType(DType),
    ConvertLayout(Layout),
    Resize(ResizeAlgorithm),
    Normalize { mean: Vec<f32>, scale: Vec<f32> },
}

/// Per-input configuration: runtime tensor hints plus the ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPreprocess {
    pub index: usize,
    pub tensor: TensorHint,
    pub steps: Vec<PreprocessStep>,
}

/// Per-output configuration: steps inserted before the Result node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPostprocess {
    pub index: usize,
    pub steps: Vec<PreprocessStep>,
}

/// Structured configuration for the whole boundary rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub inputs: Vec<InputPreprocess>,
    pub outputs: Vec<OutputPostprocess>,
}

/// Produces a new graph with the configured conversion chains spliced in
/// between each declared Parameter/Result and its original neighbours.
///
/// Parameter and Result node identities are preserved; every other node is
/// structurally untouched. Residual element-type or layout differences left
/// after the explicit steps are completed implicitly; a residual shape
/// difference is a `ShapeMismatch`.
pub fn apply(graph: &Graph, config: &PreprocessConfig) -> CompileResult<Graph> {
    graph.validate()?;
    let mut out = graph.clone();

    for input_cfg in &config.inputs {
        inject_input(&mut out, input_cfg)?;
    }
    for output_cfg in &config.outputs {
        inject_output(&mut out, output_cfg)?;
    }

    out.sort_topologically()?;
    out.validate()?;
    Ok(out)
}

fn inject_input(out: &mut Graph, cfg: &InputPreprocess) -> CompileResult<()> {
    let param_id = *out.parameter_ids().get(cfg.index).ok_or_else(|| {
        CompileError::invalid_graph(
            format!("input {}", cfg.index),
            "no parameter at this index",
        )
    })?;
    let param = out.node(param_id).expect("registered parameter");
    let param_name = param.name.clone();
    let model_desc = param.outputs[0].clone();

    // Runtime-side descriptor derived from the hints.
    let mut cur = model_desc.clone();
    if let Some(layout) = &cfg.tensor.layout {
        let perm = model_desc.layout.permutation_to(layout).ok_or_else(|| {
            CompileError::unsupported_conversion(&model_desc.layout, layout)
        })?;
        let shape = cur.shape.permute(&perm).expect("permutation_to checked rank");
        cur = TensorDesc::new(cur.dtype, shape, layout.clone());
    }
    if let Some(dtype) = cfg.tensor.dtype {
        check_type_conversion(dtype, model_desc.dtype)?;
        cur = cur.with_dtype(dtype);
    }
    if let Some((height, width)) = cfg.tensor.spatial {
        let (h_axis, w_axis) = cur.layout.spatial_indices().ok_or_else(|| {
            CompileError::invalid_graph(&param_name, "layout has no spatial axes to pin")
        })?;
        let mut dims = cur.shape.dims().to_vec();
        dims[h_axis] = Dimension::Static(height);
        dims[w_axis] = Dimension::Static(width);
        cur = TensorDesc::new(cur.dtype, crate::graph::spec::Shape::new(dims), cur.layout.clone());
    }

    let original_users = users_of(out, param_id);
    out.set_output_desc(param_id, 0, cur.clone());

    let mut producer = (param_id, 0usize);
    for step in &cfg.steps {
        (producer, cur) = insert_step(out, &param_name, producer, cur, step, Some(&model_desc))?;
    }

    // Implicit completion back to the model-side descriptor.
    if cur.dtype != model_desc.dtype {
        let step = PreprocessStep::ConvertType(model_desc.dtype);
        (producer, cur) = insert_step(out, &param_name, producer, cur, &step, Some(&model_desc))?;
    }
    if cur.layout != model_desc.layout {
        let step = PreprocessStep::ConvertLayout(model_desc.layout.clone());
        (producer, cur) = insert_step(out, &param_name, producer, cur, &step, Some(&model_desc))?;
    }
    if cur.shape != model_desc.shape {
        return Err(CompileError::shape_mismatch(
            &param_name,
            format!(
                "preprocessing ends at {} but the graph expects {}",
                cur.shape, model_desc.shape
            ),
        ));
    }

    if producer != (param_id, 0) {
        rewire(out, &original_users, producer);
    }
    Ok(())
}

fn inject_output(out: &mut Graph, cfg: &OutputPostprocess) -> CompileResult<()> {
    let result_id = *out.result_ids().get(cfg.index).ok_or_else(|| {
        CompileError::invalid_graph(format!("output {}", cfg.index), "no result at this index")
    })?;
    let result = out.node(result_id).expect("registered result");
    let result_name = result.name.clone();
    let source = &result.inputs[0];
    let mut producer = (source.node, source.port);
    let mut cur = out
        .output_desc(producer.0, producer.1)
        .expect("validated graph")
        .clone();

    for step in &cfg.steps {
        (producer, cur) = insert_step(out, &result_name, producer, cur, step, None)?;
    }

    for node in out.nodes_mut() {
        if node.id == result_id {
            node.inputs[0].node = producer.0;
            node.inputs[0].port = producer.1;
        }
    }
    out.set_output_desc(result_id, 0, cur);
    Ok(())
}

/// Inserts the node implementing one step, returning the new chain head.
fn insert_step(
    out: &mut Graph,
    boundary: &str,
    producer: (NodeId, usize),
    cur: TensorDesc,
    step: &PreprocessStep,
    model_desc: Option<&TensorDesc>,
) -> CompileResult<((NodeId, usize), TensorDesc)> {
    let input = Input::plain(producer.0, producer.1);
    match step {
        PreprocessStep::ConvertType(dtype) => {
            check_type_conversion(cur.dtype, *dtype)?;
            let desc = cur.with_dtype(*dtype);
            let id = out.add_node(
                format!("{boundary}/convert_{dtype}"),
                Operation::Convert(CastSpec { dtype: *dtype }),
                vec![input],
                vec![desc.clone()],
            )?;
            Ok(((id, 0), desc))
        }
        PreprocessStep::ConvertLayout(target) => {
            let perm = cur
                .layout
                .permutation_to(target)
                .ok_or_else(|| CompileError::unsupported_conversion(&cur.layout, target))?;
            let shape = cur.shape.permute(&perm).expect("permutation_to checked rank");
            let desc = TensorDesc::new(cur.dtype, shape, target.clone());
            let id = out.add_node(
                format!("{boundary}/layout_{target}"),
                Operation::ConvertLayout(LayoutConvertSpec {
                    perm,
                    target: target.clone(),
                }),
                vec![input],
                vec![desc.clone()],
            )?;
            Ok(((id, 0), desc))
        }
        PreprocessStep::Resize(algorithm) => {
            let model_desc = model_desc.ok_or_else(|| {
                CompileError::unsupported_conversion("resize", "output boundary")
            })?;
            let (mh, mw) = model_desc.layout.spatial_indices().ok_or_else(|| {
                CompileError::invalid_graph(boundary, "model layout has no spatial axes")
            })?;
            let target_h = model_desc
                .shape
                .dim(mh)
                .and_then(Dimension::as_static)
                .ok_or_else(|| CompileError::StaticShapeRequired {
                    node: boundary.to_string(),
                })?;
            let target_w = model_desc
                .shape
                .dim(mw)
                .and_then(Dimension::as_static)
                .ok_or_else(|| CompileError::StaticShapeRequired {
                    node: boundary.to_string(),
                })?;
            let (h_axis, w_axis) = cur.layout.spatial_indices().ok_or_else(|| {
                CompileError::invalid_graph(boundary, "layout has no spatial axes")
            })?;
            let spatial_known = cur.shape.dim(h_axis).and_then(Dimension::as_static).is_some()
                && cur.shape.dim(w_axis).and_then(Dimension::as_static).is_some();
            if !spatial_known {
                return Err(CompileError::StaticShapeRequired {
                    node: boundary.to_string(),
                });
            }
            let mut dims = cur.shape.dims().to_vec();
            dims[h_axis] = Dimension::Static(target_h);
            dims[w_axis] = Dimension::Static(target_w);
            let desc = TensorDesc::new(
                cur.dtype,
                crate::graph::spec::Shape::new(dims),
                cur.layout.clone(),
            );
            let id = out.add_node(
                format!("{boundary}/resize_{algorithm}"),
                Operation::Resize(ResizeSpec {
                    algorithm: *algorithm,
                    sizes: (target_h, target_w),
                }),
                vec![input],
                vec![desc.clone()],
            )?;
            Ok(((id, 0), desc))
        }
        PreprocessStep::Normalize { mean, scale } => {
            let channels = match cur.layout.channel_index() {
                Some(axis) => match cur.shape.dim(axis).and_then(Dimension::as_static) {
                    Some(count) => count,
                    None => {
                        return Err(CompileError::StaticShapeRequired {
                            node: boundary.to_string(),
                        })
                    }
                },
                None => {
                    return Err(CompileError::invalid_graph(
                        boundary,
                        "layout has no channel axis to normalize over",
                    ))
                }
            };
            for (what, values) in [("mean", mean), ("scale", scale)] {
                if values.len() != 1 && values.len() != channels {
                    return Err(CompileError::shape_mismatch(
                        boundary,
                        format!(
                            "{what} has {} entries for {channels} channels",
                            values.len()
                        ),
                    ));
                }
            }
            let id = out.add_node(
                format!("{boundary}/normalize"),
                Operation::Normalize(NormalizeSpec {
                    mean: mean.clone(),
                    scale: scale.clone(),
                }),
                vec![input],
                vec![cur.clone()],
            )?;
            Ok(((id, 0), cur))
        }
    }
}

fn users_of(graph: &Graph, id: NodeId) -> Vec<(NodeId, usize)> {
    let mut users = Vec::new();
    for node in graph.nodes() {
        for (idx, input) in node.inputs.iter().enumerate() {
            if input.node == id {
                users.push((node.id, idx));
            }
        }
    }
    users
}

fn rewire(graph: &mut Graph, users: &[(NodeId, usize)], to: (NodeId, usize)) {
    for &(user, input_idx) in users {
        for node in graph.nodes_mut() {
            if node.id == user {
                node.inputs[input_idx].node = to.0;
                node.inputs[input_idx].port = to.1;
            }
        }
    }
}

fn check_type_conversion(from: DType, to: DType) -> CompileResult<()> {
    if from == DType::I1 || to == DType::I1 {
        return Err(CompileError::unsupported_conversion(from, to));
    }
    Ok(())
}

/// Numeric effect of a `Convert` node on one element: saturate-and-round for
/// integer targets, precision truncation for narrow floats.
pub fn convert_scalar(value: f32, dtype: DType) -> f32 {
    match dtype {
        DType::F32 => value,
        DType::F16 => f16::from_f32(value).to_f32(),
        DType::Bf16 => bf16::from_f32(value).to_f32(),
        DType::I1 => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        _ => {
            let (min, max) = dtype.integer_range().expect("integer dtype");
            (value.round() as i64).clamp(min, max) as f32
        }
    }
}
