use quantir::graph::quant::{Dequantization, QuantBounds, QuantizationDetails};
use quantir::graph::spec::{
    DType, EltwiseOp, EltwiseSpec, Layout, Operation, PoolingKind, PoolingSpec, Shape, TensorDesc,
    TensorLiteral,
};
use quantir::graph::{Graph, Input};
use quantir::lower::DeviceCapabilities;
use quantir::lowp::{LowPrecisionConfig, PassName, Pipeline};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn feature(channels: usize) -> TensorDesc {
    TensorDesc::new(
        DType::F32,
        Shape::from_static(&[1, channels, 16, 16]),
        Layout::nchw(),
    )
}

fn identity_details() -> QuantizationDetails {
    QuantizationDetails::symmetric(256, 0.0, 2.55)
}

fn avg_pool() -> Operation {
    Operation::Pooling(PoolingSpec {
        kind: PoolingKind::Avg,
        window: vec![1, 1],
        strides: vec![1, 1],
        pads_begin: vec![0, 0],
        pads_end: vec![0, 0],
    })
}

/// Parameter -> identity boundary -> linear op -> Result, the literal
/// scenario from the compiler contract.
fn scenario_graph() -> Graph {
    let mut graph = Graph::new();
    let param = graph.add_parameter("data", feature(3));
    let fq = graph
        .add_node(
            "fq",
            Operation::FakeQuantize(identity_details()),
            vec![Input::plain(param, 0)],
            vec![feature(3)],
        )
        .unwrap();
    let pool = graph
        .add_node("pool", avg_pool(), vec![Input::plain(fq, 0)], vec![feature(3)])
        .unwrap();
    graph.add_result("out", Input::plain(pool, 0)).unwrap();
    graph
}

fn config_with(passes: Vec<PassName>) -> LowPrecisionConfig {
    LowPrecisionConfig {
        passes,
        ..LowPrecisionConfig::default()
    }
}

#[test]
fn identity_boundary_becomes_a_single_edge_descriptor() {
    let caps = DeviceCapabilities::with_default_ops();
    let config = config_with(vec![
        PassName::FqDecompose,
        PassName::FuseDequant,
        PassName::Cleanup,
    ]);
    let outcome = Pipeline::from_config(&config)
        .run(scenario_graph(), &caps)
        .unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;
    graph.validate().unwrap();

    assert!(!graph
        .nodes()
        .iter()
        .any(|n| matches!(n.op, Operation::FakeQuantize(_))));
    let quantize = graph
        .nodes()
        .iter()
        .find(|n| n.op.kind_name() == "quantize")
        .expect("boundary lowered to quantize");
    assert_eq!(quantize.outputs[0].dtype, DType::Ui8);

    // The rescale lives on the edge between the boundary and the linear op.
    let pool = graph.nodes().iter().find(|n| n.name == "pool").unwrap();
    let descriptor = pool.inputs[0].dequant.as_ref().expect("edge descriptor");
    assert_eq!(descriptor.scale.len(), 1);
    assert!((descriptor.scale[0] - 0.01).abs() < 1e-6);
    assert_eq!(descriptor.offset[0], 0.0);

    // Externally visible result is untouched.
    let result = graph.node(graph.result_ids()[0]).unwrap();
    assert_eq!(result.outputs[0].dtype, DType::F32);
    assert_eq!(result.outputs[0].shape, Shape::from_static(&[1, 3, 16, 16]));
}

#[test]
fn default_pipeline_moves_the_descriptor_past_linear_ops() {
    let caps = DeviceCapabilities::with_default_ops();
    let outcome = Pipeline::from_config(&LowPrecisionConfig::default())
        .run(scenario_graph(), &caps)
        .unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;

    let pool = graph.nodes().iter().find(|n| n.name == "pool").unwrap();
    assert!(pool.inputs[0].dequant.is_none(), "descriptor should have moved");
    let result = graph.node(graph.result_ids()[0]).unwrap();
    let descriptor = result.inputs[0].dequant.as_ref().expect("descriptor on result edge");
    assert!((descriptor.scale[0] - 0.01).abs() < 1e-6);
}

#[test]
fn pipeline_is_idempotent_at_its_fixed_point() {
    let caps = DeviceCapabilities::with_default_ops();
    let pipeline = Pipeline::from_config(&LowPrecisionConfig::default());

    let once = pipeline.run(scenario_graph(), &caps).unwrap();
    assert!(once.converged);
    let twice = pipeline.run(once.graph.clone(), &caps).unwrap();
    assert!(twice.converged);
    assert!(!twice.stats.changed, "second run must be a no-op");
    assert_eq!(once.graph, twice.graph);
}

#[test]
fn composition_matches_sequential_application_on_samples() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let first = Dequantization::per_tensor(rng.gen_range(0.01..2.0), rng.gen_range(-1.0..1.0));
        let second = Dequantization::per_tensor(rng.gen_range(0.01..2.0), rng.gen_range(-1.0..1.0));
        let composed = first.then(&second);
        let x: f32 = rng.gen_range(-10.0..10.0);
        let sequential = second.apply(first.apply(x, 0), 0);
        assert!((composed.apply(x, 0) - sequential).abs() < 1e-4);
    }
}

#[test]
fn constant_rescale_folds_into_the_descriptor() {
    let mut graph = Graph::new();
    let param = graph.add_parameter("data", feature(3));
    let fq = graph
        .add_node(
            "fq",
            Operation::FakeQuantize(identity_details()),
            vec![Input::plain(param, 0)],
            vec![feature(3)],
        )
        .unwrap();
    let factor = graph
        .add_node(
            "factor",
            Operation::Constant(TensorLiteral::from_f32s(
                Shape::from_static(&[1]),
                Layout::new("C"),
                &[2.0],
            )),
            vec![],
            vec![TensorDesc::new(DType::F32, Shape::from_static(&[1]), Layout::new("C"))],
        )
        .unwrap();
    let mul = graph
        .add_node(
            "rescale",
            Operation::Eltwise(EltwiseSpec { op: EltwiseOp::Mul }),
            vec![Input::plain(fq, 0), Input::plain(factor, 0)],
            vec![feature(3)],
        )
        .unwrap();
    graph.add_result("out", Input::plain(mul, 0)).unwrap();

    let caps = DeviceCapabilities::with_default_ops();
    let config = config_with(vec![
        PassName::FqDecompose,
        PassName::FoldRescale,
        PassName::FuseDequant,
        PassName::Cleanup,
    ]);
    let outcome = Pipeline::from_config(&config).run(graph, &caps).unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;

    assert!(!graph.nodes().iter().any(|n| n.name == "rescale"));
    assert!(!graph.nodes().iter().any(|n| n.name == "factor"));
    let result = graph.node(graph.result_ids()[0]).unwrap();
    let descriptor = result.inputs[0].dequant.as_ref().unwrap();
    assert!((descriptor.scale[0] - 0.02).abs() < 1e-6);
    assert_eq!(result.outputs[0].dtype, DType::F32);
}

#[test]
fn exhausted_iteration_budget_reports_partial_optimization() {
    let caps = DeviceCapabilities::with_default_ops();
    let mut config = LowPrecisionConfig::default();
    config.max_iterations = 1;
    let outcome = Pipeline::from_config(&config)
        .run(scenario_graph(), &caps)
        .unwrap();
    // The first iteration still rewrites, so the budget runs out before a
    // fixed point; the graph must nevertheless be stable and valid.
    assert!(!outcome.converged);
    outcome.graph.validate().unwrap();

    let rest = Pipeline::from_config(&LowPrecisionConfig::default())
        .run(outcome.graph, &caps)
        .unwrap();
    assert!(rest.converged);
}

#[test]
fn capability_table_gates_descriptor_movement() {
    let caps = DeviceCapabilities::with_default_ops().clear_commute("pooling");
    let outcome = Pipeline::from_config(&LowPrecisionConfig::default())
        .run(scenario_graph(), &caps)
        .unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;
    let pool = graph.nodes().iter().find(|n| n.name == "pool").unwrap();
    assert!(pool.inputs[0].dequant.is_some(), "pooling is opaque for this target");
    let result = graph.node(graph.result_ids()[0]).unwrap();
    assert!(result.inputs[0].dequant.is_none());
}

fn per_channel_details(highs: &[f32]) -> QuantizationDetails {
    QuantizationDetails {
        levels: 256,
        input_low: QuantBounds::PerChannel(vec![0.0; highs.len()]),
        input_high: QuantBounds::PerChannel(highs.to_vec()),
        output_low: QuantBounds::PerChannel(vec![0.0; highs.len()]),
        output_high: QuantBounds::PerChannel(highs.to_vec()),
    }
}

fn concat_graph(lhs: QuantizationDetails, rhs: QuantizationDetails) -> Graph {
    let mut graph = Graph::new();
    let p0 = graph.add_parameter("a", feature(2));
    let p1 = graph.add_parameter("b", feature(3));
    let fq0 = graph
        .add_node(
            "fq_a",
            Operation::FakeQuantize(lhs),
            vec![Input::plain(p0, 0)],
            vec![feature(2)],
        )
        .unwrap();
    let fq1 = graph
        .add_node(
            "fq_b",
            Operation::FakeQuantize(rhs),
            vec![Input::plain(p1, 0)],
            vec![feature(3)],
        )
        .unwrap();
    let join = graph
        .add_node(
            "join",
            Operation::Concat(quantir::graph::spec::ConcatSpec { axis: 1 }),
            vec![Input::plain(fq0, 0), Input::plain(fq1, 0)],
            vec![feature(5)],
        )
        .unwrap();
    graph.add_result("out", Input::plain(join, 0)).unwrap();
    graph
}

#[test]
fn concat_merges_per_channel_descriptors_over_the_channel_axis() {
    let graph = concat_graph(
        per_channel_details(&[2.55, 5.1]),
        per_channel_details(&[2.55, 2.55, 5.1]),
    );
    let caps = DeviceCapabilities::with_default_ops();
    let outcome = Pipeline::from_config(&LowPrecisionConfig::default())
        .run(graph, &caps)
        .unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;

    let result = graph.node(graph.result_ids()[0]).unwrap();
    let descriptor = result.inputs[0].dequant.as_ref().expect("merged descriptor");
    let expected = [0.01f32, 0.02, 0.01, 0.01, 0.02];
    assert_eq!(descriptor.scale.len(), expected.len());
    for (got, want) in descriptor.scale.iter().zip(expected) {
        assert!((got - want).abs() < 1e-6, "{got} != {want}");
    }
}

#[test]
fn mixed_granularity_concat_stays_non_fused() {
    let graph = concat_graph(
        QuantizationDetails::symmetric(256, 0.0, 2.55),
        per_channel_details(&[2.55, 2.55, 5.1]),
    );
    let caps = DeviceCapabilities::with_default_ops();
    let outcome = Pipeline::from_config(&LowPrecisionConfig::default())
        .run(graph, &caps)
        .unwrap();
    assert!(outcome.converged);
    let graph = &outcome.graph;

    let join = graph.nodes().iter().find(|n| n.name == "join").unwrap();
    assert!(join.inputs.iter().all(|input| input.dequant.is_some()));
    let result = graph.node(graph.result_ids()[0]).unwrap();
    assert!(result.inputs[0].dequant.is_none());
}
