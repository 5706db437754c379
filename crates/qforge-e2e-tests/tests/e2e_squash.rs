mod common;

use qforge_ir::Graph;
use qforge_opt::{CpuQuantizePass, CpuQuantizeSquashPass, GraphPass, ScaleEntry};

fn quantize_chain(y_scale: f32) -> Graph {
    let (graph, mut scope) = common::conv_chain();
    let scales = common::scales(&[
        ("x", ScaleEntry::unsigned(10.0)),
        ("f1", ScaleEntry::signed(5.0)),
        ("f2", ScaleEntry::signed(5.0)),
        ("y", ScaleEntry::unsigned(y_scale)),
    ]);
    let (graph, report) = common::run_passes(
        &graph,
        &mut scope,
        vec![
            Box::new(CpuQuantizePass::new(scales)) as Box<dyn GraphPass>,
            Box::new(CpuQuantizeSquashPass),
        ],
    );
    assert_eq!(report.stats(CpuQuantizePass::NAME).unwrap().rewritten, 2);
    assert_eq!(report.stats(CpuQuantizeSquashPass::NAME).unwrap().rewritten, 1);
    graph
}

#[test]
fn matching_scales_splice_producer_to_consumer() {
    let graph = quantize_chain(50.0);
    assert_eq!(
        common::op_types(&graph),
        ["quantize", "conv2d", "conv2d", "dequantize"]
    );
    assert!(graph.find_var("y").is_none());

    let convs = graph.find_ops("conv2d");
    let first_out = &graph.op(convs[0]).unwrap().output("Output")[0];
    assert_eq!(graph.op(convs[1]).unwrap().input("Input"), [first_out.clone()]);
    let link = graph.find_var(first_out).unwrap();
    assert_eq!(graph.consumers(link), [convs[1]]);
}

#[test]
fn equal_scale_squash_removes_exactly_the_pair() {
    let (graph, mut scope) = common::conv_chain();
    let scales = common::scales(&[
        ("x", ScaleEntry::unsigned(10.0)),
        ("f1", ScaleEntry::signed(5.0)),
        ("f2", ScaleEntry::signed(5.0)),
        ("y", ScaleEntry::unsigned(50.0)),
    ]);
    let quantize: Box<dyn GraphPass> = Box::new(CpuQuantizePass::new(scales));
    let (quantized, _) = common::run_passes(&graph, &mut scope, vec![quantize]);

    // the dequantize after the first conv reads its int32 accumulator
    let convs = quantized.find_ops("conv2d");
    let between = quantized
        .find_ops("dequantize")
        .into_iter()
        .find(|&id| quantized.op(id).unwrap().output("Output") == ["y".to_string()])
        .unwrap();
    let acc = quantized.op(between).unwrap().input("Input")[0].clone();

    let squash: Box<dyn GraphPass> = Box::new(CpuQuantizeSquashPass);
    let (squashed, report) = common::run_passes(&quantized, &mut scope, vec![squash]);
    assert_eq!(report.stats(CpuQuantizeSquashPass::NAME).unwrap().rewritten, 1);

    // dequantize, y, quantize and its output are removed with nothing added
    assert_eq!(squashed.node_count(), quantized.node_count() - 4);
    assert!(squashed.find_ops("requantize").is_empty());
    assert_eq!(squashed.op(convs[1]).unwrap().input("Input"), [acc.clone()]);
    let acc_id = squashed.find_var(&acc).unwrap();
    assert_eq!(squashed.consumers(acc_id), [convs[1]]);
    assert_eq!(squashed.producer(acc_id), Some(convs[0]));
}

#[test]
fn different_scales_requantize() {
    let graph = quantize_chain(20.0);
    assert_eq!(
        common::op_types(&graph),
        ["quantize", "conv2d", "requantize", "conv2d", "dequantize"]
    );

    let requant = graph.op(graph.find_ops("requantize")[0]).unwrap();
    assert_eq!(requant.attr_float("Scale_dequant"), Some(50.0));
    assert_eq!(requant.attr_float("Scale_quant"), Some(20.0));
    assert_eq!(requant.attr_bool("is_negative_input"), Some(false));

    let last = graph.op(graph.find_ops("dequantize")[0]).unwrap();
    assert_eq!(last.attr_float("Scale"), Some(100.0));
}

#[test]
fn squash_without_pairs_is_a_no_op() {
    let (graph, mut scope) = common::conv_chain();
    let before = qforge_ir::dump_graph(&graph);
    let squash: Box<dyn GraphPass> = Box::new(CpuQuantizeSquashPass);
    let (graph, report) = common::run_passes(&graph, &mut scope, vec![squash]);
    assert_eq!(qforge_ir::dump_graph(&graph), before);
    assert_eq!(report.stats(CpuQuantizeSquashPass::NAME).unwrap().matched, 0);
}
