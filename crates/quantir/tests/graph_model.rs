use quantir::error::CompileError;
use quantir::graph::spec::{
    ConcatSpec, DType, Layout, Operation, Shape, SoftmaxSpec, TensorDesc,
};
use quantir::graph::{Graph, Input};

fn feature(channels: usize) -> TensorDesc {
    TensorDesc::new(
        DType::F32,
        Shape::from_static(&[1, channels, 16, 16]),
        Layout::nchw(),
    )
}

fn diamond() -> Graph {
    let mut graph = Graph::new();
    let param = graph.add_parameter("x", feature(3));
    let stem = graph
        .add_node("stem", Operation::Relu, vec![Input::plain(param, 0)], vec![feature(3)])
        .unwrap();
    let left = graph
        .add_node("left", Operation::Relu, vec![Input::plain(stem, 0)], vec![feature(3)])
        .unwrap();
    let right = graph
        .add_node("right", Operation::Relu, vec![Input::plain(stem, 0)], vec![feature(3)])
        .unwrap();
    let join = graph
        .add_node(
            "join",
            Operation::Concat(ConcatSpec { axis: 1 }),
            vec![Input::plain(left, 0), Input::plain(right, 0)],
            vec![feature(6)],
        )
        .unwrap();
    graph.add_result("out", Input::plain(join, 0)).unwrap();
    graph
}

#[test]
fn topological_order_then_validate_is_clean() {
    let graph = diamond();
    let order = graph.topological_order().unwrap();
    assert_eq!(order.len(), graph.nodes().len());
    for node in graph.nodes() {
        let pos = order.iter().position(|id| *id == node.id).unwrap();
        for input in &node.inputs {
            let producer_pos = order.iter().position(|id| *id == input.node).unwrap();
            assert!(producer_pos < pos, "{} must precede {}", input.node, node.id);
        }
    }
    graph.validate().unwrap();
}

#[test]
fn topological_order_is_stable_under_ties() {
    let graph = diamond();
    let order = graph.topological_order().unwrap();
    // left and right are both ready after stem; insertion order decides.
    let left_pos = order.iter().position(|id| graph.node(*id).unwrap().name == "left");
    let right_pos = order.iter().position(|id| graph.node(*id).unwrap().name == "right");
    assert!(left_pos.unwrap() < right_pos.unwrap());
    assert_eq!(order, graph.topological_order().unwrap());
}

#[test]
fn replace_node_rewires_consumers() {
    let mut graph = Graph::new();
    let param = graph.add_parameter("x", feature(3));
    let relu = graph
        .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![feature(3)])
        .unwrap();
    let result = graph.add_result("out", Input::plain(relu, 0)).unwrap();

    let softmax = graph
        .replace_node(
            relu,
            "prob",
            Operation::Softmax(SoftmaxSpec { axis: 1 }),
            vec![Input::plain(param, 0)],
            vec![feature(3)],
        )
        .unwrap();

    let result_node = graph.node(result).unwrap();
    assert_eq!(result_node.inputs[0].node, softmax);
    // The old node is orphaned but still present until cleanup runs.
    assert!(graph.node(relu).is_some());
    graph.validate().unwrap();
}

#[test]
fn replace_node_rejects_element_type_change() {
    let mut graph = Graph::new();
    let param = graph.add_parameter("x", feature(3));
    let relu = graph
        .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![feature(3)])
        .unwrap();
    graph.add_result("out", Input::plain(relu, 0)).unwrap();

    let narrowed = feature(3).with_dtype(DType::Ui8);
    let err = graph
        .replace_node(relu, "act2", Operation::Relu, vec![Input::plain(param, 0)], vec![narrowed])
        .unwrap_err();
    assert!(matches!(err, CompileError::ShapeMismatch { .. }));
}

#[test]
fn replace_node_rejects_arity_change() {
    let mut graph = Graph::new();
    let param = graph.add_parameter("x", feature(3));
    let relu = graph
        .add_node("act", Operation::Relu, vec![Input::plain(param, 0)], vec![feature(3)])
        .unwrap();
    graph.add_result("out", Input::plain(relu, 0)).unwrap();

    let err = graph
        .replace_node(
            relu,
            "act2",
            Operation::Relu,
            vec![Input::plain(param, 0)],
            vec![feature(3), feature(3)],
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::ShapeMismatch { .. }));
}

#[test]
fn add_node_rejects_unknown_references() {
    let mut graph = Graph::new();
    let param = graph.add_parameter("x", feature(3));
    let err = graph
        .add_node(
            "bad",
            Operation::Relu,
            vec![Input::plain(quantir::NodeId(999), 0)],
            vec![feature(3)],
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::InvalidGraph { .. }));

    let err = graph
        .add_node("bad_port", Operation::Relu, vec![Input::plain(param, 3)], vec![feature(3)])
        .unwrap_err();
    assert!(matches!(err, CompileError::InvalidGraph { .. }));
}

#[test]
fn display_renders_every_node() {
    let graph = diamond();
    let text = graph.to_string();
    for node in graph.nodes() {
        assert!(text.contains(&node.name), "missing {} in:\n{text}", node.name);
    }
}

#[test]
fn graph_serde_round_trips() {
    let graph = diamond();
    let json = serde_json::to_string(&graph).unwrap();
    let back: Graph = serde_json::from_str(&json).unwrap();
    assert_eq!(graph, back);
    back.validate().unwrap();
}
