use quantir::error::CompileError;
use quantir::graph::spec::{
    DType, DimSymbol, Dimension, Layout, Operation, ResizeAlgorithm, Shape, TensorDesc,
};
use quantir::graph::{Graph, Input};
use quantir::preprocess::{
    self, InputPreprocess, OutputPostprocess, PreprocessConfig, PreprocessStep, TensorHint,
};

fn model_graph() -> Graph {
    let mut graph = Graph::new();
    let desc = TensorDesc::new(
        DType::F32,
        Shape::from_static(&[1, 3, 32, 32]),
        Layout::nchw(),
    );
    let param = graph.add_parameter("data", desc.clone());
    let relu = graph
        .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![desc])
        .unwrap();
    graph.add_result("prob", Input::plain(relu, 0)).unwrap();
    graph
}

fn classification_config() -> PreprocessConfig {
    PreprocessConfig {
        inputs: vec![InputPreprocess {
            index: 0,
            tensor: TensorHint {
                dtype: Some(DType::Ui8),
                layout: Some(Layout::nhwc()),
                spatial: Some((64, 48)),
            },
            steps: vec![
                PreprocessStep::ConvertType(DType::F32),
                PreprocessStep::Resize(ResizeAlgorithm::Linear),
            ],
        }],
        outputs: vec![],
    }
}

#[test]
fn injects_classification_style_chain() {
    let graph = model_graph();
    let staged = preprocess::apply(&graph, &classification_config()).unwrap();
    staged.validate().unwrap();

    // The parameter keeps its identity but now describes the runtime tensor.
    let param = *staged.parameter_ids().first().unwrap();
    assert_eq!(param, *graph.parameter_ids().first().unwrap());
    let param_desc = staged.output_desc(param, 0).unwrap();
    assert_eq!(param_desc.dtype, DType::Ui8);
    assert_eq!(param_desc.layout, Layout::nhwc());
    assert_eq!(param_desc.shape, Shape::from_static(&[1, 64, 48, 3]));

    // Chain: convert -> resize -> implicit layout conversion -> original relu.
    let kinds: Vec<&str> = staged.nodes().iter().map(|n| n.op.kind_name()).collect();
    assert!(kinds.contains(&"convert"));
    assert!(kinds.contains(&"resize"));
    assert!(kinds.contains(&"convert_layout"));

    let relu = staged.nodes().iter().find(|n| n.name == "act").unwrap();
    let feeder = staged.node(relu.inputs[0].node).unwrap();
    assert_eq!(feeder.op.kind_name(), "convert_layout");
    assert_eq!(
        staged.output_desc(feeder.id, 0).unwrap().shape,
        Shape::from_static(&[1, 3, 32, 32])
    );

    let resize = staged
        .nodes()
        .iter()
        .find(|n| n.op.kind_name() == "resize")
        .unwrap();
    match &resize.op {
        Operation::Resize(spec) => assert_eq!(spec.sizes, (32, 32)),
        other => panic!("unexpected op {other:?}"),
    }
}

#[test]
fn output_steps_are_inserted_before_the_result() {
    let graph = model_graph();
    let config = PreprocessConfig {
        inputs: vec![],
        outputs: vec![OutputPostprocess {
            index: 0,
            steps: vec![PreprocessStep::ConvertType(DType::F16)],
        }],
    };
    let staged = preprocess::apply(&graph, &config).unwrap();
    staged.validate().unwrap();

    let result = *staged.result_ids().first().unwrap();
    assert_eq!(result, *graph.result_ids().first().unwrap());
    let result_node = staged.node(result).unwrap();
    assert_eq!(result_node.outputs[0].dtype, DType::F16);
    let feeder = staged.node(result_node.inputs[0].node).unwrap();
    assert_eq!(feeder.op.kind_name(), "convert");
}

#[test]
fn unsupported_layout_conversion_leaves_graph_untouched() {
    let graph = model_graph();
    let config = PreprocessConfig {
        inputs: vec![InputPreprocess {
            index: 0,
            tensor: TensorHint::default(),
            steps: vec![PreprocessStep::ConvertLayout(Layout::new("NCDHW"))],
        }],
        outputs: vec![],
    };
    let err = preprocess::apply(&graph, &config).unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedConversion { .. }));
    graph.validate().unwrap();
    assert_eq!(graph.nodes().len(), 3);
}

#[test]
fn unsupported_type_conversion_is_rejected() {
    let graph = model_graph();
    let config = PreprocessConfig {
        inputs: vec![InputPreprocess {
            index: 0,
            tensor: TensorHint::default(),
            steps: vec![PreprocessStep::ConvertType(DType::I1)],
        }],
        outputs: vec![],
    };
    let err = preprocess::apply(&graph, &config).unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedConversion { .. }));
}

#[test]
fn resize_against_dynamic_model_shape_requires_static_dims() {
    let mut graph = Graph::new();
    let desc = TensorDesc::new(
        DType::F32,
        Shape::new(vec![
            Dimension::Static(1),
            Dimension::Static(3),
            Dimension::Dynamic(DimSymbol::new("H")),
            Dimension::Dynamic(DimSymbol::new("W")),
        ]),
        Layout::nchw(),
    );
    let param = graph.add_parameter("data", desc.clone());
    let relu = graph
        .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![desc])
        .unwrap();
    graph.add_result("prob", Input::plain(relu, 0)).unwrap();

    let config = PreprocessConfig {
        inputs: vec![InputPreprocess {
            index: 0,
            tensor: TensorHint {
                dtype: None,
                layout: None,
                spatial: Some((64, 64)),
            },
            steps: vec![PreprocessStep::Resize(ResizeAlgorithm::Nearest)],
        }],
        outputs: vec![],
    };
    let err = preprocess::apply(&graph, &config).unwrap_err();
    assert!(matches!(err, CompileError::StaticShapeRequired { .. }));
}

#[test]
fn normalize_rejects_mismatched_channel_coefficients() {
    let graph = model_graph();
    let config = PreprocessConfig {
        inputs: vec![InputPreprocess {
            index: 0,
            tensor: TensorHint::default(),
            steps: vec![PreprocessStep::Normalize {
                mean: vec![127.5, 127.5],
                scale: vec![1.0, 1.0, 1.0],
            }],
        }],
        outputs: vec![],
    };
    let err = preprocess::apply(&graph, &config).unwrap_err();
    assert!(matches!(err, CompileError::ShapeMismatch { .. }));
}

#[test]
fn type_conversion_round_trip_is_exact_for_u8() {
    for value in 0..=255u32 {
        let as_f32 = preprocess::convert_scalar(value as f32, DType::F32);
        let back = preprocess::convert_scalar(as_f32, DType::Ui8);
        assert_eq!(back, value as f32);
    }
    // Saturation at the storage bounds.
    assert_eq!(preprocess::convert_scalar(300.0, DType::Ui8), 255.0);
    assert_eq!(preprocess::convert_scalar(-7.0, DType::Ui8), 0.0);
    assert_eq!(preprocess::convert_scalar(200.0, DType::Si8), 127.0);
}
