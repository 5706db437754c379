#![no_main]

use libfuzzer_sys::fuzz_target;
use qforge_analysis::PatternMatcher;
use qforge_analysis::patterns::{
    CONV2D, FC, conv_batch_norm, dequantize_quantize, quantizable_op,
};
use qforge_ir::{Graph, OpDesc, VarDesc};

const OP_TYPES: [&str; 4] = ["conv2d", "fc", "dequantize", "quantize"];
const SLOTS: [&str; 4] = ["Input", "Filter", "W", "Bias"];

// Every byte triple adds one operator reading and writing existing
// variables, so the graph stays acyclic by construction.
fuzz_target!(|data: &[u8]| {
    let mut graph = Graph::new();
    let mut vars = vec!["v0".to_string()];
    graph.add_var(VarDesc::new("v0").persistable(true));

    for chunk in data.chunks_exact(3).take(64) {
        let op_type = OP_TYPES[chunk[0] as usize % OP_TYPES.len()];
        let slot = SLOTS[chunk[1] as usize % SLOTS.len()];
        let input = vars[chunk[2] as usize % vars.len()].clone();
        let output = format!("v{}", vars.len());
        graph.add_var(VarDesc::new(&output).persistable(chunk[1] & 0x80 != 0));
        let out_slot = if op_type == "fc" { "Out" } else { "Output" };
        graph.add_op_linked(
            OpDesc::new(op_type)
                .with_input(slot, [input])
                .with_output(out_slot, [output.clone()])
                .with_attr("use_quantizer", chunk[2] & 1 == 1),
        );
        vars.push(output);
    }
    if graph.validate().is_err() {
        return;
    }

    let patterns = [
        (quantizable_op(&CONV2D), vec!["bias"]),
        (quantizable_op(&FC), vec![]),
        (dequantize_quantize(), vec![]),
        (conv_batch_norm(), vec![]),
    ];
    for (pattern, groups) in &patterns {
        let Ok(matcher) = PatternMatcher::new(pattern, groups) else {
            continue;
        };
        let matches = matcher.find_all(&graph);
        for m in &matches {
            // bindings are injective and point at live nodes
            let mut nodes: Vec<_> = m.nodes().collect();
            assert!(nodes.iter().all(|&id| graph.contains(id)));
            nodes.sort();
            nodes.dedup();
            assert_eq!(nodes.len(), m.len());
        }
        // one match per target
        let mut targets: Vec<_> = matches.iter().map(|m| m.target()).collect();
        targets.dedup();
        assert_eq!(targets.len(), matches.len());
    }
});
