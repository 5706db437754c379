mod common;

use qforge_ir::{Graph, Scope, Tensor};
use qforge_opt::calibrate::{calibrate_kl, calibrate_minmax};
use qforge_opt::{
    CalibrationError, CpuQuantizePass, FeedTensor, FnExecutor, QuantizeError, Quantizer,
    QuantizerConfig, SignClass, WarmupBatch,
};

type Run = fn(&Graph, &mut Scope, &[FeedTensor], &mut Vec<Tensor>, usize) -> bool;

/// Stand-in for a real executor: `output = 2 * input`.
fn doubling(
    _: &Graph,
    scope: &mut Scope,
    inputs: &[FeedTensor],
    outputs: &mut Vec<Tensor>,
    _: usize,
) -> bool {
    let Some(values) = inputs[0].tensor.as_f32() else {
        return false;
    };
    let output = Tensor::vector(values.iter().map(|v| v * 2.0).collect());
    scope.insert("output", output.clone());
    outputs.push(output);
    true
}

#[test]
fn quantizer_calibrates_from_sample_files() {
    let dir = common::sample_dir(
        "qforge_e2e_calibrate",
        &[&[0.5, 1.0, 2.0], &[1.5, 0.0, 4.0]],
    );
    let batch = WarmupBatch::load_from_dir(&dir, "input", &[3]).unwrap();
    assert_eq!(batch.batch_size, 2);
    assert_eq!(batch.inputs[0].tensor.dims, vec![2, 3]);

    let (graph, mut scope) = common::conv_model(&[0.2, -0.6, 2.0]);
    let config = QuantizerConfig::new().with_warmup(batch);
    let mut quantizer = Quantizer::new(config, FnExecutor(doubling as Run));
    let outcome = quantizer.quantize(&graph, &mut scope).unwrap();

    let input = outcome.scales.get("input").unwrap();
    assert_eq!(input.sign, SignClass::Unsigned);
    assert_eq!(input.scale, 63.75);
    let filter = outcome.scales.get("filter").unwrap();
    assert_eq!(filter.sign, SignClass::Signed);
    // KL never picks a threshold beyond the observed range
    assert!(filter.scale.is_finite() && filter.scale >= 63.5);
    let output = outcome.scales.get("output").unwrap();
    assert_eq!(output.scale, 127.0 / 8.0);

    let graph = &outcome.graph;
    assert_eq!(common::op_types(graph), ["quantize", "conv2d", "dequantize"]);
    let dequant = graph.op(graph.find_ops("dequantize")[0]).unwrap();
    assert_eq!(dequant.attr_float("Scale"), Some(input.scale * filter.scale));
    assert_eq!(
        outcome.report.stats(CpuQuantizePass::NAME).unwrap().rewritten,
        1
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn wrong_sample_length_is_reported() {
    let dir = common::sample_dir("qforge_e2e_bad_sample", &[&[1.0, 2.0]]);
    let err = WarmupBatch::load_from_dir(&dir, "input", &[3]).unwrap_err();
    assert!(matches!(
        err,
        CalibrationError::SampleLength {
            expected: 3,
            found: 2,
            ..
        }
    ));
    let wrapped = QuantizeError::from(err);
    assert!(wrapped.to_string().contains("expected 3"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn failed_warmup_leaves_model_alone() {
    let (graph, mut scope) = common::conv_model(&[1.0]);
    let before = scope.clone();
    let graph_before = qforge_ir::dump_graph(&graph);
    let config = QuantizerConfig::new()
        .with_warmup(WarmupBatch::new(1).with_input("input", Tensor::vector(vec![1.0])));
    let failing: Run = |_, _, _, _, _| false;
    let mut quantizer = Quantizer::new(config, FnExecutor(failing));
    assert!(matches!(
        quantizer.quantize(&graph, &mut scope),
        Err(QuantizeError::ExecutionFailed)
    ));
    assert_eq!(scope, before);
    assert_eq!(qforge_ir::dump_graph(&graph), graph_before);
}

#[test]
fn minmax_on_mixed_signs() {
    let scale = calibrate_minmax(&[-3.0, 2.0, -1.0, 0.5], SignClass::Signed).unwrap();
    assert_eq!(scale, 127.0 / 3.0);
    for x in [-3.0f32, 2.0, -1.0, 0.5] {
        let q = qforge_opt::scale::quantize_value(x, scale, SignClass::Signed);
        let back = qforge_opt::scale::dequantize_value(q, scale);
        assert!((back - x).abs() <= 1.0 / scale);
    }
}

#[test]
fn kl_is_deterministic_on_skewed_data() {
    // roughly exponential magnitudes with alternating sign
    let values: Vec<f32> = (0..4096)
        .map(|i| {
            let magnitude = (-(i as f32) / 512.0).exp() * 3.0;
            if i % 2 == 0 { magnitude } else { -magnitude }
        })
        .collect();
    let first = calibrate_kl(&values, SignClass::Signed, 2048).unwrap();
    let second = calibrate_kl(&values, SignClass::Signed, 2048).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    assert!(first >= 127.0 / 3.0);
}
