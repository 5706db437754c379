//! End-to-end driver: warmup, scale gathering, rewrite, squash.

use std::sync::Arc;

use qforge_analysis::patterns::{OpSlots, USE_QUANTIZER};
use qforge_ir::{Graph, Scope, Tensor};

use crate::calibrate::{DegenerateData, calibrate_kl, calibrate_minmax};
use crate::config::{QuantizerConfig, ScaleAlgo, declared_sign};
use crate::error::QuantizeError;
use crate::quantize::CpuQuantizePass;
use crate::scale::{ScaleEntry, ScaleTable, SignClass};
use crate::squash::CpuQuantizeSquashPass;
use crate::warmup::Executor;
use crate::{PassPipeline, PipelineReport};

/// Result of a successful [`Quantizer::quantize`].
#[derive(Debug)]
pub struct QuantizeOutcome {
    pub graph: Graph,
    pub scales: Arc<ScaleTable>,
    pub report: PipelineReport,
}

/// Turns a float graph into an int8 one.
///
/// The executor runs the float graph once on the configured warmup batch;
/// the activations it leaves behind are calibrated into a [`ScaleTable`],
/// which then drives [`CpuQuantizePass`] and [`CpuQuantizeSquashPass`].
pub struct Quantizer<E: Executor> {
    config: QuantizerConfig,
    executor: E,
}

impl<E: Executor> Quantizer<E> {
    pub fn new(config: QuantizerConfig, executor: E) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    /// Quantize a copy of `graph`, writing integer weights into `scope`.
    ///
    /// Activations from the warmup run go to a scratch copy of `scope`;
    /// `scope` itself only changes if every pass succeeds. `graph` is never
    /// modified, so the float model is still available after an error.
    pub fn quantize(
        &mut self,
        graph: &Graph,
        scope: &mut Scope,
    ) -> Result<QuantizeOutcome, QuantizeError> {
        self.config.validate()?;

        let mut warm = scope.clone();
        self.run_warmup(graph, &mut warm)?;
        let scales = Arc::new(self.gather_scales(graph, &warm)?);
        scales.log_summary();

        let op_types: Vec<OpSlots> = self
            .config
            .enabled_op_types()
            .filter_map(|op_type| {
                let slots = OpSlots::for_op_type(op_type);
                if slots.is_none() {
                    log::warn!("no quantized kernel layout for '{op_type}', leaving it in f32");
                }
                slots
            })
            .collect();
        let pipeline = PassPipeline::builder()
            .pass(CpuQuantizePass::with_op_types(Arc::clone(&scales), op_types))
            .pass(CpuQuantizeSquashPass)
            .build();
        let (graph, report) = pipeline.run(graph, scope)?;

        Ok(QuantizeOutcome {
            graph,
            scales,
            report,
        })
    }

    /// Feed the warmup batch and run the float graph once.
    pub fn run_warmup(
        &mut self,
        graph: &Graph,
        scope: &mut Scope,
    ) -> Result<Vec<Tensor>, QuantizeError> {
        let batch = self
            .config
            .warmup()
            .ok_or_else(|| QuantizeError::Configuration("no warmup batch provided".into()))?;
        for feed in &batch.inputs {
            scope.insert(feed.name.clone(), feed.tensor.clone());
        }
        log::info!(
            "warmup: {} input(s), batch size {}",
            batch.inputs.len(),
            batch.batch_size
        );

        let mut outputs = Vec::new();
        if !self
            .executor
            .run(graph, scope, &batch.inputs, &mut outputs, batch.batch_size)
        {
            return Err(QuantizeError::ExecutionFailed);
        }
        Ok(outputs)
    }

    /// Compute a scale for every connection of every enabled
    /// `use_quantizer` operator, visiting operators in topological order.
    ///
    /// A tensor reached from several connections keeps its first scale
    /// unless a later connection needs the signed grid.
    pub fn gather_scales(
        &self,
        graph: &Graph,
        scope: &Scope,
    ) -> Result<ScaleTable, QuantizeError> {
        let mut table = ScaleTable::new();
        let order = graph
            .topological_ops()
            .map_err(|e| QuantizeError::structural("gather_scales", e))?;

        for id in order {
            let op = graph
                .op(id)
                .map_err(|e| QuantizeError::structural("gather_scales", e))?;
            if op.attr_bool(USE_QUANTIZER) != Some(true) || !self.config.is_enabled(&op.op_type) {
                continue;
            }

            for (slot, names) in op.inputs.iter().chain(op.outputs.iter()) {
                let algo = self.config.scale_algo(&op.op_type, slot);
                match algo {
                    ScaleAlgo::None => continue,
                    ScaleAlgo::MaxChannel => {
                        return Err(QuantizeError::UnimplementedAlgorithm {
                            op_type: op.op_type.clone(),
                            connection: slot.clone(),
                            algo,
                        });
                    }
                    ScaleAlgo::Max | ScaleAlgo::Kl => {}
                }

                for name in names {
                    let values = scope
                        .get(name)
                        .ok_or_else(|| QuantizeError::degenerate(name, DegenerateData::Missing))?
                        .as_f32()
                        .ok_or_else(|| QuantizeError::degenerate(name, DegenerateData::NotFloat))?;
                    let mut sign = declared_sign(op, slot).for_data(values);
                    if let Some(existing) = table.get(name) {
                        if existing.sign.widen(sign) == existing.sign {
                            continue;
                        }
                        sign = SignClass::Signed;
                    }

                    let scale = match algo {
                        ScaleAlgo::Kl => calibrate_kl(values, sign, self.config.num_bins()),
                        _ => calibrate_minmax(values, sign),
                    }
                    .map_err(|reason| QuantizeError::degenerate(name, reason))?;
                    log::debug!(
                        "{}.{slot} '{name}': {algo} on the {sign} grid, scale {scale}",
                        op.op_type
                    );
                    table.insert(name.as_str(), ScaleEntry::new(sign, scale));
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warmup::{FeedTensor, FnExecutor, WarmupBatch};
    use qforge_ir::{OpDesc, VarDesc};

    type Run = fn(&Graph, &mut Scope, &[FeedTensor], &mut Vec<Tensor>, usize) -> bool;

    /// `x -> fc(W = w) -> y`; the executor writes `y = x * 2`.
    fn fc_model() -> (Graph, Scope) {
        let mut graph = Graph::new();
        graph.add_var(VarDesc::new("x"));
        graph.add_var(VarDesc::new("y"));
        graph.add_var(VarDesc::new("w").persistable(true));
        graph.add_op_linked(
            OpDesc::new("fc")
                .with_input("Input", ["x"])
                .with_input("W", ["w"])
                .with_output("Out", ["y"])
                .with_attr(USE_QUANTIZER, true),
        );
        let mut scope = Scope::new();
        scope.insert("w", Tensor::vector(vec![0.5, -1.0]));
        (graph, scope)
    }

    fn doubling(
        _: &Graph,
        scope: &mut Scope,
        inputs: &[FeedTensor],
        _: &mut Vec<Tensor>,
        _: usize,
    ) -> bool {
        let Some(x) = inputs[0].tensor.as_f32() else {
            return false;
        };
        let y = x.iter().map(|v| v * 2.0).collect();
        scope.insert("y", Tensor::vector(y));
        true
    }

    fn config(x: Vec<f32>) -> QuantizerConfig {
        QuantizerConfig::new().with_warmup(WarmupBatch::new(1).with_input("x", Tensor::vector(x)))
    }

    #[test]
    fn fc_is_quantized_with_gathered_scales() {
        let (graph, mut scope) = fc_model();
        let mut quantizer = Quantizer::new(config(vec![0.0, 1.0, 5.0]), FnExecutor(doubling as Run));
        let outcome = quantizer.quantize(&graph, &mut scope).unwrap();

        assert_eq!(outcome.scales.get("x"), Some(ScaleEntry::unsigned(51.0)));
        assert_eq!(outcome.scales.get("w"), Some(ScaleEntry::signed(127.0)));
        // fc output is signed without a fused relu
        assert_eq!(outcome.scales.get("y"), Some(ScaleEntry::signed(12.7)));

        let graph = &outcome.graph;
        assert_eq!(graph.find_ops("quantize").len(), 1);
        assert_eq!(graph.find_ops("dequantize").len(), 1);
        assert_eq!(outcome.report.stats(CpuQuantizePass::NAME).unwrap().rewritten, 1);
        assert!(!scope.contains("w"));
        // warmup activations stay out of the caller's scope
        assert!(!scope.contains("y"));
    }

    #[test]
    fn negative_input_widens_to_signed() {
        let (graph, scope) = fc_model();
        let mut quantizer = Quantizer::new(config(vec![-2.0, 1.0]), FnExecutor(doubling as Run));
        let mut warm = scope.clone();
        quantizer.run_warmup(&graph, &mut warm).unwrap();
        let table = quantizer.gather_scales(&graph, &warm).unwrap();
        assert_eq!(table.get("x"), Some(ScaleEntry::signed(63.5)));
    }

    #[test]
    fn missing_warmup_is_a_configuration_error() {
        let (graph, mut scope) = fc_model();
        let mut quantizer = Quantizer::new(QuantizerConfig::new(), FnExecutor(doubling as Run));
        let err = quantizer.quantize(&graph, &mut scope).unwrap_err();
        assert!(matches!(err, QuantizeError::Configuration(_)));
        assert!(scope.contains("w"));
    }

    #[test]
    fn executor_failure_aborts() {
        let (graph, mut scope) = fc_model();
        let failing: Run = |_, _, _, _, _| false;
        let mut quantizer = Quantizer::new(config(vec![1.0]), FnExecutor(failing));
        let err = quantizer.quantize(&graph, &mut scope).unwrap_err();
        assert!(matches!(err, QuantizeError::ExecutionFailed));
        assert!(!scope.contains("x"));
    }

    #[test]
    fn float_graph_survives_a_failed_run() {
        let (graph, mut scope) = fc_model();
        let before = qforge_ir::dump_graph(&graph);
        let silent: Run = |_, _, _, _, _| true;
        let mut quantizer = Quantizer::new(config(vec![1.0]), FnExecutor(silent));
        assert!(quantizer.quantize(&graph, &mut scope).is_err());
        assert_eq!(qforge_ir::dump_graph(&graph), before);

        // the same float graph can be retried with a working executor
        let mut quantizer = Quantizer::new(config(vec![0.0, 1.0, 5.0]), FnExecutor(doubling as Run));
        let outcome = quantizer.quantize(&graph, &mut scope).unwrap();
        assert_eq!(outcome.graph.find_ops("quantize").len(), 1);
        assert!(graph.find_ops("quantize").is_empty());
    }

    #[test]
    fn per_channel_max_is_unimplemented() {
        let (graph, mut scope) = fc_model();
        let mut config = config(vec![1.0]);
        config.set_rule("fc", "W", ScaleAlgo::MaxChannel);
        let mut quantizer = Quantizer::new(config, FnExecutor(doubling as Run));
        let err = quantizer.quantize(&graph, &mut scope).unwrap_err();
        match err {
            QuantizeError::UnimplementedAlgorithm {
                op_type,
                connection,
                algo,
            } => {
                assert_eq!(op_type, "fc");
                assert_eq!(connection, "W");
                assert_eq!(algo, ScaleAlgo::MaxChannel);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_activation_is_degenerate() {
        let (graph, mut scope) = fc_model();
        let silent: Run = |_, _, _, _, _| true;
        let mut quantizer = Quantizer::new(config(vec![1.0]), FnExecutor(silent));
        let err = quantizer.quantize(&graph, &mut scope).unwrap_err();
        match err {
            QuantizeError::DegenerateInput { tensor, reason } => {
                assert_eq!(tensor, "y");
                assert_eq!(reason, DegenerateData::Missing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn all_zero_activation_is_degenerate() {
        let (graph, mut scope) = fc_model();
        let mut quantizer = Quantizer::new(config(vec![0.0, 0.0]), FnExecutor(doubling as Run));
        let err = quantizer.quantize(&graph, &mut scope).unwrap_err();
        assert!(matches!(
            err,
            QuantizeError::DegenerateInput {
                reason: DegenerateData::AllZero,
                ..
            }
        ));
    }

    #[test]
    fn disabled_op_types_are_not_calibrated() {
        let (graph, scope) = fc_model();
        let mut config = config(vec![1.0]);
        config.disable_op_type("fc");
        let quantizer = Quantizer::new(config, FnExecutor(doubling as Run));
        assert!(quantizer.gather_scales(&graph, &scope).unwrap().is_empty());
    }
}
