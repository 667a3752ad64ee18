use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splice::backend::{ActivationKind, LayerKind, TensorRef};
use splice::conversion::{ConversionCtx, ConversionResult};
use splice::ir::{parse_graph, Graph, Node};
use splice::partition::{Block, FallbackReason, PartitionError};
use splice::{
    compile_program, convert_to_engine, embed_engine, run_graph, CompileConfig, CompileError,
    Compiler, ConfigError, ConverterRegistry, DType, Device, FidelityOutcome, HostTensor,
    HybridProgram, InputSpec, OpKind, Precision, SkipReason, Support,
};
use splice_backend_ref::{RefBackend, RefInterpreter};

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> HostTensor {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-5.0f32..5.0)).collect();
    HostTensor::from_f32(dims.to_vec(), values).expect("tensor")
}

fn assert_close(want: &[HostTensor], got: &[HostTensor], tolerance: f64) {
    assert_eq!(want.len(), got.len(), "output count differs");
    for (index, (want, got)) in want.iter().zip(got).enumerate() {
        assert_eq!(want.dims(), got.dims(), "output {index} shape differs");
        for (a, b) in want.to_f64_vec().iter().zip(got.to_f64_vec()) {
            assert!((a - b).abs() <= tolerance, "output {index}: {a} vs {b}");
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mixed_graph() -> Graph {
    parse_graph(
        r#"
graph mixed(%x : Float(2, 6)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::tanh(%b)
  %d : Tensor = aten::cumsum[dim=1](%c)
  %e : Tensor = aten::neg(%d)
  %f : Tensor = aten::exp(%e)
  %g : Tensor = aten::abs(%f)
  return (%g)
"#,
    )
    .expect("parse")
}

#[test]
fn single_activation_passes_fidelity() {
    let graph = parse_graph(
        r#"
graph act(%x : Float(1, 3, 8, 8)):
  %y : Tensor = aten::relu(%x)
  return (%y)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[1, 3, 8, 8])]).with_min_block_size(1);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");

    assert!(compilation.fidelity.passed(), "{}", compilation.fidelity);
    assert!(compilation.fidelity.advisory().is_none());
    match &compilation.fidelity {
        FidelityOutcome::Passed { outputs } => {
            assert_eq!(outputs.len(), 1);
            assert!(outputs[0].max_abs_diff <= outputs[0].tolerance);
        }
        other => panic!("expected a pass, got {other:?}"),
    }
    assert_eq!(compilation.program.engine_calls().count(), 1);
    assert_eq!(compilation.program.fallback_nodes().count(), 0);
}

#[test]
fn reduced_precision_skips_the_numeric_check() {
    let graph = parse_graph(
        r#"
graph act(%x : Float(4, 4)):
  %a : Tensor = aten::sigmoid(%x)
  %b : Tensor = aten::tanh(%a)
  %c : Tensor = aten::relu(%b)
  return (%c)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[4, 4])])
        .with_precisions([Precision::Float, Precision::Half]);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");
    assert_eq!(
        compilation.fidelity,
        FidelityOutcome::Skipped(SkipReason::PrecisionChanged)
    );
    let advisory = compilation.fidelity.advisory().expect("advisory");
    assert!(advisory.contains("operating data type"), "{advisory}");

    let disabled = CompileConfig::new(vec![InputSpec::fixed(&[4, 4])]).skip_fidelity_check(true);
    let compilation =
        compile_program(&graph, &disabled, &RefBackend::new(), &RefInterpreter::new()).expect("compile");
    assert_eq!(compilation.fidelity, FidelityOutcome::Skipped(SkipReason::Disabled));
    assert!(!compilation.fidelity.passed());
}

#[test]
fn hybrid_program_matches_the_interpreter() {
    init_tracing();
    let graph = mixed_graph();
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 6])]);
    let interpreter = RefInterpreter::new();
    let compilation = compile_program(&graph, &config, &RefBackend::new(), &interpreter).expect("compile");

    assert_eq!(compilation.plan.segment_count(), 2);
    assert_eq!(compilation.program.engines().len(), 2);
    let fallback: Vec<OpKind> = compilation.program.fallback_nodes().map(|node| node.kind).collect();
    assert_eq!(fallback, vec![OpKind::Cumsum]);
    assert!(compilation.fidelity.passed(), "{}", compilation.fidelity);

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..4 {
        let inputs = vec![random_tensor(&mut rng, &[2, 6])];
        let want = run_graph(&graph, &interpreter, &inputs).expect("interpreter");
        let got = compilation.program.run(&interpreter, &inputs).expect("hybrid");
        assert_close(&want, &got, 1e-5);
    }
}

#[test]
fn identical_segments_share_one_engine() {
    let graph = parse_graph(
        r#"
graph twice(%x : Float(2, 3)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::tanh(%b)
  %d : Tensor = aten::cumsum[dim=1](%c)
  %e : Tensor = aten::relu(%d)
  %f : Tensor = aten::sigmoid(%e)
  %g : Tensor = aten::tanh(%f)
  return (%g)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 3])]).skip_fidelity_check(true);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");
    let engines = compilation.program.engines();
    assert_eq!(engines.len(), 2);
    assert_eq!(engines[0].key, engines[1].key);
    assert!(Arc::ptr_eq(&engines[0].engine, &engines[1].engine));
}

#[test]
fn dynamic_inputs_run_across_the_range() {
    let graph = parse_graph(
        r#"
graph dyn(%x : Float(?, 4)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::neg(%b)
  return (%c)
"#,
    )
    .expect("parse");
    let spec = InputSpec::ranged(&[1, 4], &[4, 4], &[8, 4]).expect("range");
    let config = CompileConfig::new(vec![spec]);
    let interpreter = RefInterpreter::new();
    let compilation = compile_program(&graph, &config, &RefBackend::new(), &interpreter).expect("compile");
    assert!(compilation.fidelity.passed(), "{}", compilation.fidelity);

    let mut rng = StdRng::seed_from_u64(3);
    for rows in [1, 5, 8] {
        let inputs = vec![random_tensor(&mut rng, &[rows, 4])];
        let want = run_graph(&graph, &interpreter, &inputs).expect("interpreter");
        let got = compilation.program.run(&interpreter, &inputs).expect("hybrid");
        assert_close(&want, &got, 1e-6);
    }

    let outside = vec![random_tensor(&mut rng, &[9, 4])];
    let err = compilation
        .program
        .run(&interpreter, &outside)
        .expect_err("shape outside the profile");
    assert!(err.to_string().contains("profile"), "{err}");
}

#[test]
fn saving_a_partitioned_graph_is_a_config_error() {
    let graph = mixed_graph();
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 6])]);
    let err = convert_to_engine(&graph, &config, &RefBackend::new(), &RefInterpreter::new())
        .expect_err("two segments");
    match err {
        CompileError::Config(ConfigError::NotSingleSegment {
            segments,
            fallback_nodes,
        }) => {
            assert_eq!(segments, 2);
            assert_eq!(fallback_nodes, 1);
        }
        other => panic!("expected NotSingleSegment, got {other}"),
    }
}

#[test]
fn saved_engine_embeds_into_a_program() {
    let graph = parse_graph(
        r#"
graph head(%x : Float(2, 4), %w : Float(3, 4), %b : Float(3)):
  %l : Tensor = aten::linear(%x, %w, %b)
  %dim : int = prim::Constant[value=-1]()
  %none : int = prim::Constant[value=None]()
  %y : Tensor = aten::softmax(%l, %dim, %none)
  return (%y)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![
        InputSpec::fixed(&[2, 4]),
        InputSpec::fixed(&[3, 4]),
        InputSpec::fixed(&[3]),
    ]);
    let backend = RefBackend::new();
    let interpreter = RefInterpreter::new();
    let bytes = convert_to_engine(&graph, &config, &backend, &interpreter).expect("engine bytes");
    assert!(!bytes.is_empty());

    let program = embed_engine(&backend, &bytes, &Device::default()).expect("embed");
    assert_eq!(program.graph().inputs.len(), 3);
    assert_eq!(program.graph().outputs.len(), 1);
    assert_eq!(program.engine_calls().count(), 1);

    let mut rng = StdRng::seed_from_u64(5);
    let inputs = vec![
        random_tensor(&mut rng, &[2, 4]),
        random_tensor(&mut rng, &[3, 4]),
        random_tensor(&mut rng, &[3]),
    ];
    let want = run_graph(&graph, &interpreter, &inputs).expect("interpreter");
    let got = program.run(&interpreter, &inputs).expect("embedded engine");
    assert_close(&want, &got, 1e-4);

    let err = embed_engine(&backend, &bytes, &Device::dla(0, true)).expect_err("wrong device");
    assert!(err.to_string().contains("cannot load"), "{err}");
}

#[test]
fn programs_round_trip_through_json() -> anyhow::Result<()> {
    init_tracing();
    let graph = mixed_graph();
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 6])]);
    let backend = RefBackend::new();
    let interpreter = RefInterpreter::new();
    let compilation = compile_program(&graph, &config, &backend, &interpreter)?;

    let text = compilation.program.to_json()?;
    let restored = HybridProgram::from_json(&text, &backend, &config.device)?;
    assert_eq!(restored.graph(), compilation.program.graph());
    assert_eq!(restored.engines().len(), compilation.program.engines().len());

    let mut rng = StdRng::seed_from_u64(9);
    let inputs = vec![random_tensor(&mut rng, &[2, 6])];
    let want = compilation.program.run(&interpreter, &inputs)?;
    let got = restored.run(&interpreter, &inputs)?;
    assert_close(&want, &got, 0.0);
    Ok(())
}

#[test]
fn full_compilation_fails_on_unsupported_nodes() {
    let graph = mixed_graph();
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 6])]).require_full_compilation(true);
    let err = compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new())
        .expect_err("cumsum cannot be converted");
    match err {
        CompileError::Partition(PartitionError::RequiresFallback { violations }) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].kind, OpKind::Cumsum);
        }
        other => panic!("expected RequiresFallback, got {other}"),
    }
}

#[test]
fn input_specs_must_match_the_graph() {
    let graph = mixed_graph();
    let interpreter = RefInterpreter::new();
    let backend = RefBackend::new();

    let too_many = CompileConfig::new(vec![InputSpec::fixed(&[2, 6]), InputSpec::fixed(&[2, 6])]);
    let err = compile_program(&graph, &too_many, &backend, &interpreter).expect_err("two specs");
    assert!(matches!(
        err,
        CompileError::Config(ConfigError::InputCountMismatch { inputs: 1, specs: 2 })
    ));

    let wrong_rank = CompileConfig::new(vec![InputSpec::fixed(&[2, 6, 1])]);
    let err = compile_program(&graph, &wrong_rank, &backend, &interpreter).expect_err("rank 3 spec");
    assert!(matches!(
        err,
        CompileError::Config(ConfigError::InputSpecMismatch { index: 0, .. })
    ));
}

#[test]
fn operator_support_is_reported_after_lowering() {
    let graph = parse_graph(
        r#"
graph g(%x : Float(2, 6)):
  %a : Tensor = aten::silu(%x)
  %d : Tensor = aten::cumsum[dim=1](%a)
  %n : int = aten::size[dim=0](%d)
  prim::Print(%n)
  return (%d)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 6])]);
    let backend = RefBackend::new();
    let interpreter = RefInterpreter::new();
    let unsupported = splice::Compiler::new(&backend, &interpreter)
        .check_operator_support(&graph, &config)
        .expect("support check");
    let kinds: Vec<OpKind> = unsupported.iter().map(|entry| entry.kind).collect();
    assert_eq!(kinds, vec![OpKind::Cumsum, OpKind::Size, OpKind::Print]);
}

#[test]
fn fractional_scale_of_an_int_tensor_runs_in_the_interpreter() {
    let graph = parse_graph(
        r#"
graph scale(%x : Int(4)):
  %y : Tensor = aten::mul[other=0.5](%x)
  %z : Tensor = aten::relu(%y)
  %w : Tensor = aten::sigmoid(%z)
  return (%w)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[4]).with_dtype(DType::I32)]).with_min_block_size(1);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");
    let fallback: Vec<OpKind> = compilation.program.fallback_nodes().map(|node| node.kind).collect();
    assert_eq!(fallback, vec![OpKind::Mul]);
    assert_eq!(compilation.program.engine_calls().count(), 1);
}

/// relu, then a control-flow node the interpreter cannot run, then sigmoid.
fn opaque_branch_graph(branch_type: &str) -> Graph {
    parse_graph(&format!(
        r#"
graph branch(%x : Float(4)):
  %a : Tensor = aten::relu(%x)
  %b : {branch_type} = prim::If(%a)
  %c : Tensor = aten::sigmoid(%b)
  return (%c)
"#
    ))
    .expect("parse")
}

#[test]
fn failed_sample_run_still_returns_the_program() {
    init_tracing();
    let graph = opaque_branch_graph("Float(4)");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[4])]).with_min_block_size(1);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");

    assert_eq!(
        compilation.fidelity,
        FidelityOutcome::Skipped(SkipReason::ExecutionFailed)
    );
    let advisory = compilation.fidelity.advisory().expect("advisory");
    assert!(advisory.contains("could not be run"), "{advisory}");
    assert_eq!(compilation.program.engine_calls().count(), 2);
}

#[test]
fn unmeasured_values_do_not_enter_segments() {
    let graph = opaque_branch_graph("Tensor");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[4])]).with_min_block_size(1);
    let compilation =
        compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new()).expect("compile");

    let fallback: Vec<OpKind> = compilation.program.fallback_nodes().map(|node| node.kind).collect();
    assert_eq!(fallback, vec![OpKind::If, OpKind::Sigmoid]);
    assert_eq!(compilation.program.engine_calls().count(), 1);
    let branch = compilation
        .lowered
        .nodes
        .iter()
        .find(|node| node.kind == OpKind::If)
        .map(|node| node.outputs[0])
        .expect("branch node");
    assert!(compilation.plan.blocks.iter().any(|block| matches!(
        block,
        Block::Fallback { reason: FallbackReason::UnknownBoundary(value), .. } if *value == branch
    )));
}

fn relu_as_sigmoid(ctx: &mut ConversionCtx<'_>, node: &Node) -> ConversionResult<Vec<TensorRef>> {
    let input = ctx.input(node, 0)?;
    let output = ctx.add_layer(LayerKind::Activation(ActivationKind::Sigmoid), &[input])?;
    Ok(vec![output])
}

#[test]
fn wrong_converter_is_reported_as_a_deviation() {
    let mut registry = ConverterRegistry::with_defaults();
    registry.register(OpKind::Relu, |_, _| Support::Supported, relu_as_sigmoid);
    let graph = parse_graph(
        r#"
graph act(%x : Float(2, 8)):
  %y : Tensor = aten::relu(%x)
  return (%y)
"#,
    )
    .expect("parse");
    let config = CompileConfig::new(vec![InputSpec::fixed(&[2, 8])]).with_min_block_size(1);
    let backend = RefBackend::new();
    let interpreter = RefInterpreter::new();
    let compilation = Compiler::new(&backend, &interpreter)
        .with_registry(&registry)
        .compile(&graph, &config)
        .expect("compile");

    match &compilation.fidelity {
        FidelityOutcome::Deviated { outputs, threshold } => {
            assert_eq!(*threshold, config.threshold);
            assert!(outputs[0].max_abs_diff > outputs[0].tolerance);
        }
        other => panic!("expected a deviation, got {other:?}"),
    }
    let advisory = compilation.fidelity.advisory().expect("advisory");
    assert!(advisory.contains("exceeds set threshold"), "{advisory}");

    let x = HostTensor::from_f32(vec![2, 8], vec![0.0; 16]).expect("tensor");
    let y = compilation.program.run(&interpreter, &[x]).expect("program still runs");
    assert!(y[0].to_f32_vec().iter().all(|value| (value - 0.5).abs() < 1e-6));
}
