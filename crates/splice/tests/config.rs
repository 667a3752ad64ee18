use splice::config::DEFAULT_MIN_BLOCK_SIZE;
use splice::ir::{SpecParseError, TensorFormat};
use splice::{
    CompileConfig, ConfigError, DType, Device, DeviceType, EngineCapability, InputSpec, Precision,
    ShapeSpec,
};

#[test]
fn input_specs_parse_from_tokens() {
    let fixed: InputSpec = "(3,3,32,32)@f16%nhwc".parse().expect("fixed spec");
    assert_eq!(fixed.shape, ShapeSpec::Static(vec![3, 3, 32, 32]));
    assert_eq!(fixed.dtype, DType::F16);
    assert_eq!(fixed.format, TensorFormat::ChannelsLast);
    assert_eq!(fixed.to_string(), "(3,3,32,32)@f16%nhwc");

    let ranged: InputSpec = "[(1,2);(2,2);(4,2)]".parse().expect("ranged spec");
    assert_eq!(ranged.dtype, DType::F32);
    assert_eq!(ranged.format, TensorFormat::Contiguous);
    assert!(ranged.shape.is_dynamic());
    assert_eq!(ranged.shape.min(), &[1, 2]);
    assert_eq!(ranged.shape.opt(), &[2, 2]);
    assert_eq!(ranged.shape.max(), &[4, 2]);
    assert!(ranged.shape.admits(&[3, 2]));
    assert!(!ranged.shape.admits(&[5, 2]));
    assert!(!ranged.shape.admits(&[2, 2, 1]));

    let reparsed: InputSpec = ranged.to_string().parse().expect("display round-trips");
    assert_eq!(reparsed, ranged);
}

#[test]
fn unknown_format_is_a_valid_input_spec() {
    let spec: InputSpec = "(2,3)%unknown".parse().expect("unknown format");
    assert_eq!(spec.format, TensorFormat::Unknown);
    assert_eq!(spec.validate(), Ok(()));
    assert_eq!(spec.to_string(), "(2,3)@f32%unknown");

    let config = CompileConfig::new(vec![InputSpec::fixed(&[4]).with_format(TensorFormat::Unknown)]);
    assert!(config.validate().is_ok());
}

#[test]
fn malformed_input_specs_are_rejected() {
    assert!(matches!(
        "(1,2)@float128".parse::<InputSpec>(),
        Err(SpecParseError::UnknownDType { .. })
    ));
    assert!(matches!(
        "(1,2)%planar".parse::<InputSpec>(),
        Err(SpecParseError::UnknownFormat { .. })
    ));
    assert!(matches!(
        "1,2".parse::<InputSpec>(),
        Err(SpecParseError::Malformed { .. })
    ));
    assert_eq!(
        "[(1,2);(2,2)]".parse::<InputSpec>(),
        Err(SpecParseError::RangeArity { found: 2 })
    );
    assert_eq!(
        "[(1,2);(2,2,2);(3,2)]".parse::<InputSpec>(),
        Err(SpecParseError::RankMismatch {
            min: 2,
            opt: 3,
            max: 2
        })
    );
    assert_eq!(
        InputSpec::ranged(&[1, 4], &[2, 3], &[4, 4]),
        Err(SpecParseError::InvertedRange {
            axis: 1,
            min: 4,
            opt: 3,
            max: 4
        })
    );
}

#[test]
fn tokens_parse_case_insensitively() {
    assert_eq!("FP16".parse::<Precision>().expect("precision"), Precision::Half);
    assert_eq!("int8".parse::<Precision>().expect("precision"), Precision::Int8);
    assert_eq!("DLA".parse::<DeviceType>().expect("device"), DeviceType::Dla);
    assert_eq!(
        "safe_dla".parse::<EngineCapability>().expect("capability"),
        EngineCapability::DlaStandalone
    );
    let err = "tf32".parse::<Precision>().expect_err("unknown precision");
    assert!(err.to_string().contains("float | half | int8 | bool"), "{err}");
}

#[test]
fn defaults_match_documented_values() {
    let config = CompileConfig::default();
    assert_eq!(config.enabled_precisions.len(), 1);
    assert!(config.enabled_precisions.contains(&Precision::Float));
    assert_eq!(config.device, Device::default());
    assert_eq!(config.device.device_type, DeviceType::Gpu);
    assert_eq!(config.effective_min_block_size(), DEFAULT_MIN_BLOCK_SIZE);
    assert_eq!(config.threshold, 2e-5);
    assert!(config.keeps_original_precision());
    config.validate().expect("defaults are valid");
}

#[test]
fn inconsistent_options_are_rejected() {
    let specs = vec![InputSpec::fixed(&[1, 3])];

    let zero_block = CompileConfig::new(specs.clone()).with_min_block_size(0);
    assert!(matches!(zero_block.validate(), Err(ConfigError::ZeroMinBlockSize)));

    let mut zero_batch = CompileConfig::new(specs.clone());
    zero_batch.max_batch_size = Some(0);
    assert!(matches!(zero_batch.validate(), Err(ConfigError::ZeroBatchSize)));

    let no_precision = CompileConfig::new(specs.clone()).with_precisions([]);
    assert!(matches!(no_precision.validate(), Err(ConfigError::NoPrecision)));

    let bad_threshold = CompileConfig::new(specs.clone()).with_threshold(f64::NAN);
    assert!(matches!(
        bad_threshold.validate(),
        Err(ConfigError::InvalidThreshold(_))
    ));

    let unknown_op = CompileConfig::new(specs.clone()).exclude_op("aten::conv_everything");
    assert!(matches!(
        unknown_op.validate(),
        Err(ConfigError::UnknownToken { what: "op kind", .. })
    ));

    let mut inverted = CompileConfig::new(specs.clone());
    inverted.input_specs.push(InputSpec::new(ShapeSpec::Dynamic {
        min: vec![4],
        opt: vec![2],
        max: vec![8],
    }));
    assert!(matches!(
        inverted.validate(),
        Err(ConfigError::InputSpec { index: 1, .. })
    ));
}

#[test]
fn full_compilation_conflicts_with_partition_knobs() {
    let specs = vec![InputSpec::fixed(&[1, 3])];
    let cases = [
        (
            CompileConfig::new(specs.clone())
                .require_full_compilation(true)
                .exclude_op("aten::relu"),
            "torch_executed_ops",
        ),
        (
            CompileConfig::new(specs.clone())
                .require_full_compilation(true)
                .exclude_module("head"),
            "torch_executed_modules",
        ),
        (
            CompileConfig::new(specs.clone())
                .require_full_compilation(true)
                .with_min_block_size(2),
            "min_block_size",
        ),
    ];
    for (config, expected) in cases {
        match config.validate() {
            Err(ConfigError::FullCompilationConflict { option }) => assert_eq!(option, expected),
            other => panic!("expected a conflict on {expected}, got {other:?}"),
        }
    }

    let full = CompileConfig::new(specs).require_full_compilation(true);
    full.validate().expect("plain full compilation is valid");
    assert_eq!(full.effective_min_block_size(), 1);
}

#[test]
fn config_round_trips_through_json() {
    let config = CompileConfig::new(vec![
        InputSpec::fixed(&[1, 3, 8, 8]),
        InputSpec::ranged(&[1, 16], &[4, 16], &[8, 16])
            .expect("range")
            .with_dtype(DType::F16),
    ])
    .with_precisions([Precision::Float, Precision::Half])
    .with_device(Device::dla(1, true))
    .with_min_block_size(2)
    .exclude_op("aten::softmax")
    .exclude_module("decoder.attn")
    .with_workspace_size(1 << 20)
    .truncate_long_and_double(true);

    let text = config.to_json().expect("serialize");
    let restored = CompileConfig::from_json(&text).expect("deserialize");
    assert_eq!(restored, config);
    assert!(!restored.keeps_original_precision());

    let partial = CompileConfig::from_json(r#"{ "min_block_size": 5 }"#).expect("partial json");
    assert_eq!(partial.effective_min_block_size(), 5);
    assert_eq!(partial.threshold, CompileConfig::default().threshold);
}
