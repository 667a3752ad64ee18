mod lit_support;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splice::ir::{parse_graph, Attr, Graph, ValueType};
use splice::lowering::LoweringError;
use splice::{lower_graph, run_graph, DType, HostTensor, LoweringOptions, OpKind};
use splice_backend_ref::RefInterpreter;

use lit_support::{load_cases, run_lowering_case};

fn kinds(graph: &Graph) -> Vec<OpKind> {
    graph.nodes.iter().map(|node| node.kind).collect()
}

fn random_input(rng: &mut StdRng, dims: &[usize]) -> HostTensor {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    HostTensor::from_f32(dims.to_vec(), values).expect("tensor")
}

fn max_abs_diff(lhs: &HostTensor, rhs: &HostTensor) -> f64 {
    assert_eq!(lhs.dims(), rhs.dims(), "output shapes differ");
    lhs.to_f64_vec()
        .iter()
        .zip(rhs.to_f64_vec())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}

#[test]
fn lowering_cases() {
    let options = LoweringOptions::default();
    for case in load_cases("lowering.lit") {
        run_lowering_case(&case, &options);
    }
}

#[test]
fn lowering_is_idempotent() {
    let sources = [
        r#"
graph block(%x : Float(2, 4), %w : Float(3, 4), %b : Float(3)):
  %p : float = prim::Constant[value=0.2]()
  %train : bool = prim::Constant[value=false]()
  %d : Tensor = aten::dropout(%x, %p, %train)
  %l : Tensor = aten::linear(%d, %w, %b)
  %s : Tensor = aten::silu(%l)
  %approx : str = prim::Constant[value="none"]()
  %g : Tensor = aten::gelu(%s, %approx)
  %dim : int = prim::Constant[value=-1]()
  %none : int = prim::Constant[value=None]()
  %y : Tensor = aten::softmax(%g, %dim, %none)
  return (%y)
"#,
        r#"
graph pad(%x : Float(1, 2, 3)):
  %pads : int[] = prim::Constant[value=[1, 1]]()
  %v : float = prim::Constant[value=0.5]()
  %p : Tensor = aten::constant_pad_nd(%x, %pads, %v)
  %c : Tensor = aten::contiguous(%p)
  %y : Tensor = aten::elu(%c)
  return (%y)
"#,
    ];
    for source in sources {
        let mut graph = parse_graph(source).expect("parse");
        let options = LoweringOptions::default();
        let first = lower_graph(&mut graph, &options).expect("first lowering");
        assert!(first.changed, "graph `{}` should change on first lowering", graph.name);

        let once = graph.clone();
        let second = lower_graph(&mut graph, &options).expect("second lowering");
        assert!(!second.changed, "second lowering of `{}` changed the graph", graph.name);
        assert_eq!(second.rewrites_applied, 0);
        assert_eq!(second.erased_nodes, 0);
        assert_eq!(graph, once, "second lowering of `{}` is not a no-op", graph.name);
    }
}

#[test]
fn linear_becomes_permute_matmul_add() {
    let mut graph = parse_graph(
        r#"
graph lin(%x : Float(2, 4), %w : Float(3, 4), %b : Float(3)):
  %y : Tensor = aten::linear(%x, %w, %b) # fc
  return (%y)
"#,
    )
    .expect("parse");
    let traced_output = graph.outputs[0];
    lower_graph(&mut graph, &LoweringOptions::default()).expect("lowering");

    assert_eq!(kinds(&graph), vec![OpKind::Permute, OpKind::Matmul, OpKind::Add]);
    let permute = &graph.nodes[0];
    assert_eq!(permute.ints_attr("dims"), Some(&[1, 0][..]));
    assert_eq!(
        graph.value_type(permute.outputs[0]),
        Some(&ValueType::tensor(DType::F32, &[4, 3]))
    );
    assert!(graph.nodes.iter().all(|node| node.scope.as_deref() == Some("fc")));
    assert_eq!(graph.nodes[2].attr("alpha"), Some(&Attr::Int(1)));
    assert_ne!(graph.outputs[0], traced_output, "output should be rewired to the add");
    assert_eq!(graph.outputs[0], graph.nodes[2].outputs[0]);
}

#[test]
fn linear_without_bias_skips_the_add() {
    let mut graph = parse_graph(
        r#"
graph lin(%x : Float(5, 4), %w : Float(2, 4)):
  %y : Tensor = aten::linear(%x, %w)
  return (%y)
"#,
    )
    .expect("parse");
    lower_graph(&mut graph, &LoweringOptions::default()).expect("lowering");
    assert_eq!(kinds(&graph), vec![OpKind::Permute, OpKind::Matmul]);
}

#[test]
fn linear_with_rank_three_weight_is_rejected() {
    let mut graph = parse_graph(
        r#"
graph lin(%x : Float(2, 4), %w : Float(1, 3, 4)):
  %y : Tensor = aten::linear(%x, %w)
  return (%y)
"#,
    )
    .expect("parse");
    let err = lower_graph(&mut graph, &LoweringOptions::default()).expect_err("rank 3 weight");
    match err {
        LoweringError::UnexpectedNode { kind, message, .. } => {
            assert_eq!(kind, OpKind::Linear);
            assert!(message.contains("rank 2"), "unexpected message: {message}");
        }
        other => panic!("expected UnexpectedNode, got {other}"),
    }
}

#[test]
fn silu_and_gelu_decompose() {
    let source = r#"
graph act(%x : Float(2, 8)):
  %s : Tensor = aten::silu(%x)
  %g : Tensor = aten::gelu(%s)
  return (%g)
"#;
    let mut exact = parse_graph(source).expect("parse");
    lower_graph(&mut exact, &LoweringOptions::default()).expect("lowering");
    let exact_kinds = kinds(&exact);
    assert_eq!(&exact_kinds[..2], &[OpKind::Sigmoid, OpKind::Mul]);
    assert!(exact_kinds.contains(&OpKind::Erf));
    assert!(!exact_kinds.contains(&OpKind::Tanh));
    assert!(!exact_kinds.contains(&OpKind::Gelu));
    assert!(!exact_kinds.contains(&OpKind::Silu));

    let mut approximate = parse_graph(source).expect("parse");
    let options = LoweringOptions {
        approximate_gelu: true,
    };
    lower_graph(&mut approximate, &options).expect("lowering");
    let approx_kinds = kinds(&approximate);
    assert!(approx_kinds.contains(&OpKind::Tanh));
    assert!(approx_kinds.contains(&OpKind::Pow));
    assert!(!approx_kinds.contains(&OpKind::Erf));
}

#[test]
fn decompositions_preserve_results() {
    let source = r#"
graph block(%x : Float(3, 4), %w : Float(5, 4), %b : Float(5)):
  %l : Tensor = aten::linear(%x, %w, %b)
  %s : Tensor = aten::silu(%l)
  %tanh : str = prim::Constant[value="tanh"]()
  %g : Tensor = aten::gelu(%s, %tanh)
  %e : Tensor = aten::gelu(%g)
  return (%e)
"#;
    let original = parse_graph(source).expect("parse");
    let mut lowered = original.clone();
    lower_graph(&mut lowered, &LoweringOptions::default()).expect("lowering");

    let mut rng = StdRng::seed_from_u64(7);
    let inputs = vec![
        random_input(&mut rng, &[3, 4]),
        random_input(&mut rng, &[5, 4]),
        random_input(&mut rng, &[5]),
    ];
    let interpreter = RefInterpreter::new();
    let want = run_graph(&original, &interpreter, &inputs).expect("original runs");
    let got = run_graph(&lowered, &interpreter, &inputs).expect("lowered runs");
    assert_eq!(want.len(), got.len());
    let diff = max_abs_diff(&want[0], &got[0]);
    assert!(diff < 1e-4, "lowered graph deviates by {diff}");
}

#[test]
fn malformed_graph_fails_verification() {
    let mut graph = Graph::new("broken");
    let x = graph.add_input(ValueType::tensor(DType::F32, &[2]), "x");
    let dangling = graph.new_value(ValueType::tensor(DType::F32, &[2]), Some("dangling".into()));
    let node = graph.add_node(
        OpKind::Add,
        vec![x, dangling],
        vec![ValueType::tensor(DType::F32, &[2])],
        BTreeMap::new(),
    );
    let out = graph.node(node).expect("node").outputs[0];
    graph.outputs.push(out);

    let err = lower_graph(&mut graph, &LoweringOptions::default()).expect_err("dangling operand");
    assert!(
        matches!(err, LoweringError::Structural { pass: "verify", .. }),
        "unexpected error: {err}"
    );
}
