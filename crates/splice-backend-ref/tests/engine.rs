use anyhow::Result;
use splice::backend::{
    AcceleratorBackend, ActivationKind, BuilderConfig, ElementWiseKind, Engine, LayerKind, NetworkDefinition,
};
use splice::compile::builder_config;
use splice::ir::parse_graph;
use splice::{
    compile_program, CompileConfig, CompileError, DType, Device, HostTensor, InputSpec, Precision, ShapeSpec,
};
use splice_backend_ref::{RefBackend, RefEngine, RefInterpreter};

fn relu_network(backend: &RefBackend, dims: &[usize]) -> Result<Box<dyn NetworkDefinition>> {
    let mut network = backend.create_network();
    let x = network.add_input("x", DType::F32, &ShapeSpec::Static(dims.to_vec()))?;
    let relu = network.add_layer(LayerKind::Activation(ActivationKind::Relu), &[x], "relu")?;
    let doubled = network.add_layer(LayerKind::ElementWise(ElementWiseKind::Sum), &[relu[0], relu[0]], "double")?;
    network.mark_output(doubled[0], "y")?;
    Ok(network)
}

fn config_for(config: CompileConfig) -> BuilderConfig {
    builder_config(&config)
}

#[test]
fn built_engine_runs_and_reports_bindings() -> Result<()> {
    let backend = RefBackend::new();
    let network = relu_network(&backend, &[2, 2])?;
    let engine = backend.build(network, &config_for(CompileConfig::default()))?;
    assert_eq!(engine.inputs().len(), 1);
    assert_eq!(engine.outputs()[0].shape, ShapeSpec::Static(vec![2, 2]));

    let x = HostTensor::from_f32(vec![2, 2], vec![-1.0, 2.0, -3.0, 4.0])?;
    let y = engine.execute(&[x])?;
    assert_eq!(y[0].to_f32_vec(), vec![0.0, 4.0, 0.0, 8.0]);

    let wrong = HostTensor::from_f32(vec![4], vec![1.0; 4])?;
    let err = engine.execute(&[wrong]).expect_err("shape outside the profile");
    assert!(err.message.contains("profile"), "{err}");
    Ok(())
}

#[test]
fn dla_needs_reduced_precision_or_gpu_fallback() -> Result<()> {
    let backend = RefBackend::new();
    let strict = config_for(CompileConfig::default().with_device(Device::dla(0, false)));
    let err = backend
        .build(relu_network(&backend, &[4])?, &strict)
        .expect_err("float-only DLA build");
    assert!(err.message.contains("only runs half or int8"), "{err}");

    let half = config_for(
        CompileConfig::default()
            .with_device(Device::dla(0, false))
            .with_precisions([Precision::Float, Precision::Half]),
    );
    backend.build(relu_network(&backend, &[4])?, &half)?;

    let fallback = config_for(CompileConfig::default().with_device(Device::dla(1, true)));
    backend.build(relu_network(&backend, &[4])?, &fallback)?;
    Ok(())
}

#[test]
fn workspace_limit_names_the_layer() -> Result<()> {
    let backend = RefBackend::new();
    let config = config_for(CompileConfig::default().with_workspace_size(100));
    // 16 f32 elements per layer: relu fits in 64 bytes, the sum pushes it to 128.
    let err = backend
        .build(relu_network(&backend, &[16])?, &config)
        .expect_err("workspace exceeded");
    assert_eq!(err.layer, Some(1));
    assert!(err.message.contains("workspace"), "{err}");
    assert!(err.message.contains("`double`"), "{err}");
    Ok(())
}

#[test]
fn workspace_failure_is_attributed_to_a_graph_node() -> Result<()> {
    let graph = parse_graph(
        r#"
graph g(%x : Float(64, 64)):
  %a : Tensor = aten::relu(%x)
  %b : Tensor = aten::sigmoid(%a)
  %c : Tensor = aten::tanh(%b)
  return (%c)
"#,
    )?;
    let config = CompileConfig::new(vec![InputSpec::fixed(&[64, 64])]).with_workspace_size(20_000);
    let err = compile_program(&graph, &config, &RefBackend::new(), &RefInterpreter::new())
        .expect_err("workspace too small");
    match err {
        CompileError::Build(build) => {
            assert_eq!(build.segment, 0);
            assert_eq!(build.node, Some(graph.nodes[1].id));
            assert!(build.message.contains("workspace"), "{build}");
        }
        other => panic!("expected a build error, got {other}"),
    }
    Ok(())
}

#[test]
fn engines_survive_serialization() -> Result<()> {
    let backend = RefBackend::new();
    let engine = backend.build(relu_network(&backend, &[3])?, &config_for(CompileConfig::default()))?;
    let bytes = engine.serialize()?;

    let restored = backend.deserialize_engine(&bytes, &Device::default())?;
    let x = HostTensor::from_f32(vec![3], vec![-0.5, 0.25, 1.5])?;
    assert_eq!(engine.execute(&[x.clone()])?, restored.execute(&[x])?);
    assert_eq!(engine.outputs(), restored.outputs());

    let direct = RefEngine::from_bytes(&bytes)?;
    assert!(!direct.reduced_precision());
    assert_eq!(direct.network().layers().len(), 2);
    Ok(())
}

#[test]
fn foreign_bytes_are_rejected() -> Result<()> {
    let backend = RefBackend::new();
    let engine = backend.build(relu_network(&backend, &[3])?, &config_for(CompileConfig::default()))?;
    let mut file: serde_json::Value = serde_json::from_slice(&engine.serialize()?)?;

    file["magic"] = serde_json::Value::from("something-else");
    let err = RefEngine::from_bytes(&serde_json::to_vec(&file)?).expect_err("wrong magic");
    assert!(err.message.contains("not a reference engine"), "{err}");

    file["magic"] = serde_json::Value::from("splice-ref-engine");
    file["version"] = serde_json::Value::from(99);
    let err = RefEngine::from_bytes(&serde_json::to_vec(&file)?).expect_err("future version");
    assert!(err.message.contains("version 99"), "{err}");

    let err = RefEngine::from_bytes(b"\x00\x01garbage").expect_err("not json");
    assert!(err.message.contains("malformed engine"), "{err}");
    Ok(())
}

#[test]
fn half_precision_engines_round_through_f16() -> Result<()> {
    let backend = RefBackend::new();
    let config = config_for(CompileConfig::default().with_precisions([Precision::Float, Precision::Half]));
    let engine = backend.build(relu_network(&backend, &[1])?, &config)?;
    let y = engine.execute(&[HostTensor::from_f32(vec![1], vec![0.1])?])?;
    let rounded = f32::from(half::f16::from_f32(0.1));
    assert_eq!(y[0].to_f32_vec(), vec![f32::from(half::f16::from_f32(rounded * 2.0))]);
    Ok(())
}

