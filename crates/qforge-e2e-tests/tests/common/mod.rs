use std::sync::Arc;

use qforge_ir::{Graph, OpDesc, Scope, Tensor, VarDesc};
use qforge_opt::{GraphPass, PassPipeline, PipelineReport, ScaleEntry, ScaleTable};

/// `input -> conv2d(Filter = filter) -> output` with `use_quantizer` set.
#[allow(dead_code)]
pub fn conv_model(filter: &[f32]) -> (Graph, Scope) {
    let mut graph = Graph::new();
    graph.add_var(VarDesc::new("input").with_shape(&[1, 3]));
    graph.add_var(VarDesc::new("output"));
    graph.add_var(
        VarDesc::new("filter")
            .persistable(true)
            .with_shape(&[filter.len() as i64]),
    );
    graph.add_op_linked(
        OpDesc::new("conv2d")
            .with_input("Input", ["input"])
            .with_input("Filter", ["filter"])
            .with_output("Output", ["output"])
            .with_attr("use_quantizer", true),
    );
    let mut scope = Scope::new();
    scope.insert("filter", Tensor::vector(filter.to_vec()));
    (graph, scope)
}

/// `x -> conv2d(f1) -> y -> conv2d(f2) -> z`, both marked for quantization.
#[allow(dead_code)]
pub fn conv_chain() -> (Graph, Scope) {
    let mut graph = Graph::new();
    for name in ["x", "y", "z"] {
        graph.add_var(VarDesc::new(name));
    }
    let mut scope = Scope::new();
    for (filter, input, output) in [("f1", "x", "y"), ("f2", "y", "z")] {
        graph.add_var(VarDesc::new(filter).persistable(true).with_shape(&[2]));
        scope.insert(filter, Tensor::vector(vec![0.4, -1.0]));
        graph.add_op_linked(
            OpDesc::new("conv2d")
                .with_input("Input", [input])
                .with_input("Filter", [filter])
                .with_output("Output", [output])
                .with_attr("use_quantizer", true),
        );
    }
    (graph, scope)
}

#[allow(dead_code)]
pub fn scales(entries: &[(&str, ScaleEntry)]) -> Arc<ScaleTable> {
    Arc::new(entries.iter().map(|&(name, entry)| (name, entry)).collect())
}

/// Run `passes` in order and return the validated rewritten copy.
#[allow(dead_code)]
pub fn run_passes(
    graph: &Graph,
    scope: &mut Scope,
    passes: Vec<Box<dyn GraphPass>>,
) -> (Graph, PipelineReport) {
    let pipeline = passes
        .into_iter()
        .fold(PassPipeline::builder(), |builder, pass| builder.boxed_pass(pass))
        .build();
    let (graph, report) = pipeline.run(graph, scope).expect("pipeline failed");
    graph.validate().expect("pipeline returned an invalid graph");
    (graph, report)
}

/// Operator types in topological order.
#[allow(dead_code)]
pub fn op_types(graph: &Graph) -> Vec<String> {
    graph
        .topological_ops()
        .expect("graph has a cycle")
        .into_iter()
        .map(|id| graph.op(id).expect("not an op").op_type.clone())
        .collect()
}

/// Write raw little-endian f32 samples into a fresh temp directory.
#[allow(dead_code)]
pub fn sample_dir(name: &str, samples: &[&[f32]]) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("failed to create sample dir");
    for (i, sample) in samples.iter().enumerate() {
        let bytes: Vec<u8> = sample.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(dir.join(format!("sample_{i:03}.bin")), bytes)
            .expect("failed to write sample");
    }
    dir
}
