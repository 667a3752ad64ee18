//! Engines built by the reference backend agree with the fallback interpreter.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splice::ir::parse_graph;
use splice::{compile_program, run_graph, CompileConfig, HostTensor, InputSpec, OpKind};
use splice_backend_ref::{RefBackend, RefInterpreter};

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> HostTensor {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-5.0f32..5.0)).collect();
    HostTensor::from_f32(dims.to_vec(), values).expect("tensor")
}

/// Compiles `source` with every supported node in an engine, then compares the
/// program against the interpreter on inputs of each shape in `shapes`.
fn check_parity(source: &str, specs: Vec<InputSpec>, shapes: &[&[usize]], tolerance: f64) -> Result<()> {
    let graph = parse_graph(source)?;
    let config = CompileConfig::new(specs).with_min_block_size(1);
    let interpreter = RefInterpreter::new();
    let compilation = compile_program(&graph, &config, &RefBackend::new(), &interpreter)?;
    assert_eq!(
        compilation.program.fallback_nodes().count(),
        0,
        "`{}` left nodes in the interpreter",
        graph.name
    );

    let mut rng = StdRng::seed_from_u64(0x9a7);
    for dims in shapes {
        let inputs = vec![random_tensor(&mut rng, dims)];
        let want = run_graph(&graph, &interpreter, &inputs)?;
        let got = compilation.program.run(&interpreter, &inputs)?;
        assert_eq!(want.len(), got.len());
        for (want, got) in want.iter().zip(&got) {
            assert_eq!(want.dims(), got.dims(), "`{}` output shape differs", graph.name);
            for (a, b) in want.to_f64_vec().iter().zip(got.to_f64_vec()) {
                assert!((a - b).abs() <= tolerance, "`{}`: {a} vs {b}", graph.name);
            }
        }
    }
    Ok(())
}

#[test]
fn activations_match_the_interpreter() -> Result<()> {
    let cases = [
        "graph relu(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::relu(%x)\n  return (%y)\n",
        "graph sigmoid(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::sigmoid(%x)\n  return (%y)\n",
        "graph tanh(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::tanh(%x)\n  return (%y)\n",
        "graph hardtanh(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::hardtanh[max_val=0.5, min_val=-0.5](%x)\n  return (%y)\n",
        "graph leaky(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::leaky_relu(%x)\n  return (%y)\n",
        "graph elu(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::elu(%x)\n  return (%y)\n",
        "graph gelu(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::gelu(%x)\n  return (%y)\n",
        "graph silu(%x : Float(2, 3, 4)):\n  %y : Tensor = aten::silu(%x)\n  return (%y)\n",
    ];
    for source in cases {
        check_parity(source, vec![InputSpec::fixed(&[2, 3, 4])], &[&[2, 3, 4]], 1e-4)?;
    }
    Ok(())
}

#[test]
fn prelu_uses_one_slope_per_channel() -> Result<()> {
    let source = r#"
graph prelu(%x : Float(2, 3, 4)):
  %w : Float(3) = prim::Constant[value=[0.25, 0.5, 0.1]]()
  %y : Tensor = aten::prelu(%x, %w)
  return (%y)
"#;
    check_parity(source, vec![InputSpec::fixed(&[2, 3, 4])], &[&[2, 3, 4]], 1e-6)
}

#[test]
fn constant_pad_matches_the_interpreter() -> Result<()> {
    let source = r#"
graph pad(%x : Float(2, 3)):
  %pads : int[] = prim::Constant[value=[1, 2, 0, 1]]()
  %v : float = prim::Constant[value=0.5]()
  %y : Tensor = aten::constant_pad_nd(%x, %pads, %v)
  return (%y)
"#;
    check_parity(source, vec![InputSpec::fixed(&[2, 3])], &[&[2, 3]], 0.0)?;

    let graph = parse_graph(source)?;
    let out = run_graph(&graph, &RefInterpreter::new(), &[HostTensor::ones(splice::DType::F32, vec![2, 3])])?;
    assert_eq!(out[0].dims(), &[3, 6]);
    Ok(())
}

#[test]
fn dynamic_pad_covers_the_whole_profile() -> Result<()> {
    let source = r#"
graph pad(%x : Float(?, 3)):
  %pads : int[] = prim::Constant[value=[1, 1]]()
  %v : float = prim::Constant[value=-2.0]()
  %y : Tensor = aten::constant_pad_nd(%x, %pads, %v)
  %z : Tensor = aten::relu(%y)
  return (%z)
"#;
    let spec = InputSpec::ranged(&[1, 3], &[2, 3], &[6, 3])?;
    check_parity(source, vec![spec], &[&[1, 3], &[4, 3], &[6, 3]], 0.0)
}

#[test]
fn unsupported_nodes_stay_in_the_interpreter() -> Result<()> {
    let graph = parse_graph(
        r#"
graph mixed(%x : Float(3, 4)):
  %a : Tensor = aten::elu(%x)
  %b : Tensor = aten::cumsum[dim=0](%a)
  %c : Tensor = aten::leaky_relu(%b)
  return (%c)
"#,
    )?;
    let config = CompileConfig::new(vec![InputSpec::fixed(&[3, 4])]).with_min_block_size(1);
    let interpreter = RefInterpreter::new();
    let compilation = compile_program(&graph, &config, &RefBackend::new(), &interpreter)?;
    let fallback: Vec<OpKind> = compilation.program.fallback_nodes().map(|node| node.kind).collect();
    assert_eq!(fallback, vec![OpKind::Cumsum]);
    assert_eq!(compilation.program.engine_calls().count(), 2);
    assert!(compilation.fidelity.passed(), "{}", compilation.fidelity);
    Ok(())
}
