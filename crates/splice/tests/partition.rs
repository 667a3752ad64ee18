use std::collections::HashSet;
use std::fmt::Write as _;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splice::ir::{parse_graph, Graph, NodeId};
use splice::partition::{Block, FallbackReason, PartitionError};
use splice::{check_operator_support, default_registry, partition, OpKind, PartitionOptions};

const OPS: &[&str] = &[
    "aten::relu",
    "aten::sigmoid",
    "aten::tanh",
    "aten::neg",
    "aten::exp",
    "aten::cumsum[dim=1]",
    "aten::add[alpha=1]",
    "aten::mul",
    "aten::size[dim=0]",
    "prim::Print",
    "prim::Constant",
];

/// Random straight-line graph over `Float(2, 3)` values. Mixes converted ops,
/// interpreter-only ops, scalar results and tensor constants.
fn random_graph(rng: &mut StdRng, len: usize) -> Graph {
    let mut text = String::from("graph random(%x : Float(2, 3)):\n");
    let mut tensors = vec!["x".to_string()];
    let mut last = "x".to_string();
    for index in 0..len {
        let op = OPS[rng.gen_range(0..OPS.len())];
        let a = tensors[rng.gen_range(0..tensors.len())].clone();
        let name = format!("v{index}");
        match op {
            "prim::Print" => {
                writeln!(text, "  prim::Print(%{a})").expect("write");
                continue;
            }
            "prim::Constant" => {
                writeln!(
                    text,
                    "  %{name} : Float(2, 3) = prim::Constant[value=[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]()"
                )
                .expect("write");
            }
            "aten::size[dim=0]" => {
                writeln!(text, "  %{name} : int = aten::size[dim=0](%{a})").expect("write");
                continue;
            }
            "aten::add[alpha=1]" | "aten::mul" => {
                let b = tensors[rng.gen_range(0..tensors.len())].clone();
                writeln!(text, "  %{name} : Tensor = {op}(%{a}, %{b})").expect("write");
            }
            _ => {
                writeln!(text, "  %{name} : Tensor = {op}(%{a})").expect("write");
            }
        }
        tensors.push(name.clone());
        last = name;
    }
    writeln!(text, "  return (%{last})").expect("write");
    parse_graph(&text).unwrap_or_else(|e| panic!("generated graph does not parse: {e}\n{text}"))
}

fn segment_nodes(plan: &splice::PartitionPlan) -> HashSet<NodeId> {
    plan.segments()
        .flat_map(|segment| segment.nodes.iter().copied())
        .collect()
}

#[test]
fn random_graphs_are_covered_exactly_once() {
    let mut rng = StdRng::seed_from_u64(0x5011ce);
    for round in 0..64 {
        let len = rng.gen_range(1..40);
        let graph = random_graph(&mut rng, len);
        let min_block_size = rng.gen_range(1..5);
        let options = PartitionOptions {
            min_block_size,
            ..PartitionOptions::default()
        };
        let plan = partition(&graph, default_registry(), &options)
            .unwrap_or_else(|e| panic!("round {round}: partition failed: {e}"));
        plan.validate(&graph)
            .unwrap_or_else(|e| panic!("round {round}: invalid plan: {e}\n{graph}"));

        for (expected_id, segment) in plan.segments().enumerate() {
            assert_eq!(segment.id, expected_id, "round {round}: segment ids must count up");
            assert!(
                segment.nodes.len() >= min_block_size,
                "round {round}: segment {} has {} node(s), min is {min_block_size}",
                segment.id,
                segment.nodes.len()
            );
            for node in &segment.nodes {
                let kind = graph.node(*node).expect("node").kind;
                assert!(
                    !matches!(kind, OpKind::Cumsum | OpKind::Size | OpKind::Print),
                    "round {round}: unsupported {kind} landed in segment {}",
                    segment.id
                );
            }
        }
        let in_segments = segment_nodes(&plan);
        let fallback: HashSet<NodeId> = plan.fallback_nodes().into_iter().collect();
        assert!(in_segments.is_disjoint(&fallback), "round {round}: node in both sets");
        assert_eq!(in_segments.len() + fallback.len(), graph.nodes.len());
    }
}

#[test]
fn short_runs_fall_back() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::cumsum[dim=1](%a)
  %c : Tensor = aten::sigmoid(%b)
  %d : Tensor = aten::tanh(%c)
  %e : Tensor = aten::neg(%d)
  return (%e)
"#,
    )
    .expect("parse");

    let plan = partition(&graph, default_registry(), &PartitionOptions::default()).expect("partition");
    plan.validate(&graph).expect("valid plan");
    assert_eq!(plan.segment_count(), 1);
    let segment = plan.segments().next().expect("segment");
    assert_eq!(segment.nodes, graph.node_ids()[2..].to_vec());
    assert_eq!(segment.inputs, vec![graph.nodes[1].outputs[0]]);
    assert_eq!(segment.outputs, graph.outputs);
    match &plan.blocks[0] {
        Block::Fallback { reason, .. } => assert_eq!(
            *reason,
            FallbackReason::BelowMinBlockSize { run: 1, min: 3 }
        ),
        other => panic!("relu should fall back, got {other:?}"),
    }

    let options = PartitionOptions {
        min_block_size: 1,
        ..PartitionOptions::default()
    };
    let plan = partition(&graph, default_registry(), &options).expect("partition");
    assert_eq!(plan.segment_count(), 2);
    assert_eq!(plan.fallback_nodes(), vec![graph.nodes[1].id]);
}

#[test]
fn excluded_kinds_never_reach_segments() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::relu(%b)
  %d : Tensor = aten::tanh(%c)
  %e : Tensor = aten::relu(%d)
  return (%e)
"#,
    )
    .expect("parse");
    let options = PartitionOptions {
        min_block_size: 1,
        excluded_ops: [OpKind::Relu].into_iter().collect(),
        ..PartitionOptions::default()
    };
    let plan = partition(&graph, default_registry(), &options).expect("partition");
    plan.validate(&graph).expect("valid plan");
    for segment in plan.segments() {
        for node in &segment.nodes {
            assert_ne!(graph.node(*node).expect("node").kind, OpKind::Relu);
        }
    }
    assert_eq!(plan.segment_count(), 2);
    assert_eq!(plan.fallback_nodes().len(), 3);
}

#[test]
fn excluded_modules_fall_back_by_scope() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x) # backbone.stem
  %b : Tensor = aten::sigmoid(%a) # backbone.stem
  %c : Tensor = aten::tanh(%b) # head.proj
  %d : Tensor = aten::neg(%c) # head.proj
  return (%d)
"#,
    )
    .expect("parse");
    let options = PartitionOptions {
        min_block_size: 1,
        excluded_modules: vec!["head".to_string()],
        ..PartitionOptions::default()
    };
    let plan = partition(&graph, default_registry(), &options).expect("partition");
    assert_eq!(plan.segment_count(), 1);
    assert_eq!(
        plan.fallback_nodes(),
        vec![graph.nodes[2].id, graph.nodes[3].id]
    );
    assert!(plan.blocks.iter().any(|block| matches!(
        block,
        Block::Fallback {
            reason: FallbackReason::ExcludedModule(module),
            ..
        } if module == "head"
    )));
}

#[test]
fn constants_feeding_only_fallback_nodes_are_demoted() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %k : Float(2, 3) = prim::Constant[value=[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]()
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::tanh(%b)
  %d : Tensor = aten::cumsum[dim=1](%k)
  %e : Tensor = aten::add[alpha=1](%c, %d)
  return (%e)
"#,
    )
    .expect("parse");
    let plan = partition(&graph, default_registry(), &PartitionOptions::default()).expect("partition");
    plan.validate(&graph).expect("valid plan");
    let constant = graph.nodes[0].id;
    assert!(plan.blocks.iter().any(|block| matches!(
        block,
        Block::Fallback { node, reason: FallbackReason::UnusedConstant } if *node == constant
    )));
    assert!(!segment_nodes(&plan).contains(&constant));
}

#[test]
fn scalar_values_never_cross_segment_boundaries() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %n : int = aten::size[dim=0](%a)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::tanh(%b)
  %d : Tensor = aten::neg(%c)
  return (%d)
"#,
    )
    .expect("parse");
    let options = PartitionOptions {
        min_block_size: 1,
        ..PartitionOptions::default()
    };
    let plan = partition(&graph, default_registry(), &options).expect("partition");
    plan.validate(&graph).expect("valid plan");
    for segment in plan.segments() {
        for value in segment.inputs.iter().chain(&segment.outputs) {
            assert!(
                graph.value_type(*value).is_some_and(|ty| ty.is_tensor()),
                "segment {} exposes non-tensor value {value}",
                segment.id
            );
        }
    }
}

#[test]
fn full_compilation_reports_every_violation() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::cumsum[dim=1](%a)
  %c : Tensor = aten::sigmoid(%b)
  prim::Print(%c)
  return (%c)
"#,
    )
    .expect("parse");
    let options = PartitionOptions {
        min_block_size: 1,
        require_full_compilation: true,
        ..PartitionOptions::default()
    };
    let err = partition(&graph, default_registry(), &options).expect_err("fallback required");
    let PartitionError::RequiresFallback { violations } = err else {
        panic!("expected RequiresFallback, got {err}");
    };
    let kinds: Vec<OpKind> = violations.iter().map(|violation| violation.kind).collect();
    assert_eq!(kinds, vec![OpKind::Cumsum, OpKind::Print]);

    let unsupported = check_operator_support(&graph, default_registry());
    assert_eq!(unsupported.len(), 2);
    assert_eq!(unsupported[0].node, graph.nodes[1].id);
}

#[test]
fn fully_supported_graph_is_one_segment() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  return (%b)
"#,
    )
    .expect("parse");
    let options = PartitionOptions {
        min_block_size: 1,
        require_full_compilation: true,
        ..PartitionOptions::default()
    };
    let plan = partition(&graph, default_registry(), &options).expect("partition");
    assert_eq!(plan.segment_count(), 1);
    assert!(plan.fallback_nodes().is_empty());
    let segment = plan.segments().next().expect("segment");
    assert_eq!(segment.inputs, graph.inputs);
    assert_eq!(segment.outputs, graph.outputs);
}

#[test]
fn integer_arithmetic_promoted_to_float_stays_in_the_interpreter() {
    let graph = parse_graph(
        r#"
graph ints(%x : Int(4), %z : Int(4)):
  %a : Tensor = aten::mul[other=0.5](%x)
  %b : Tensor = aten::div(%x, %z)
  %c : Tensor = aten::mul[other=2](%x)
  %d : Tensor = aten::add(%x, %z)
  return (%a, %b, %c, %d)
"#,
    )
    .expect("parse");
    let unsupported = check_operator_support(&graph, default_registry());
    let nodes: Vec<NodeId> = unsupported.iter().map(|entry| entry.node).collect();
    assert_eq!(nodes, vec![graph.nodes[0].id, graph.nodes[1].id]);
    assert!(unsupported[0].reason.contains("fractional `other`"), "{}", unsupported[0].reason);
    assert!(unsupported[1].reason.contains("division"), "{}", unsupported[1].reason);
}

#[test]
fn flatten_needs_static_trailing_axes() {
    let graph = parse_graph(
        r#"
graph flat(%x : Float(2, 3, ?), %y : Float(?, 3, 4)):
  %a : Tensor = aten::flatten[start_dim=0, end_dim=1](%x)
  %b : Tensor = aten::flatten[start_dim=0, end_dim=1](%y)
  return (%a, %b)
"#,
    )
    .expect("parse");
    let unsupported = check_operator_support(&graph, default_registry());
    assert_eq!(unsupported.len(), 1);
    assert_eq!(unsupported[0].node, graph.nodes[0].id);
    assert!(unsupported[0].reason.contains("dynamic axis 2"), "{}", unsupported[0].reason);
}
