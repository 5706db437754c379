//! int8 quantization passes for qforge graphs.
//!
//! Provides a [`GraphPass`] trait, a [`PassPipeline`] that runs passes in
//! order and re-validates the graph after each one, scale calibration, and
//! the built-in passes (quantization rewrite, dequantize/quantize squash,
//! batch_norm folding, residual fusion). [`Quantizer`] drives the whole flow from a float graph
//! and a warmup batch.

mod batch_norm;
pub mod calibrate;
pub mod config;
mod error;
mod quantize;
mod quantizer;
mod residual;
pub mod scale;
mod squash;
pub mod warmup;

pub use batch_norm::ConvBnFusePass;
pub use calibrate::{CalibrationError, DegenerateData, Histogram};
pub use config::{QuantizerConfig, ScaleAlgo};
pub use error::QuantizeError;
pub use quantize::{CpuQuantizePass, QuantizeVariant, SkipReason, VisitedSet};
pub use quantizer::{QuantizeOutcome, Quantizer};
pub use residual::ResidualFusePass;
pub use scale::{ScaleEntry, ScaleTable, SignClass};
pub use squash::CpuQuantizeSquashPass;
pub use warmup::{Executor, FeedTensor, FnExecutor, WarmupBatch};

use std::fmt::Debug;
use std::ops::AddAssign;

use qforge_ir::{Graph, Scope, dump_graph};

/// A transformation of a graph and the persistable tensors it refers to.
pub trait GraphPass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass once over the whole graph.
    fn run(&self, graph: &mut Graph, scope: &mut Scope) -> Result<PassStats, QuantizeError>;
}

/// Per-pass instance counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Pattern instances found.
    pub matched: usize,
    /// Instances rewritten.
    pub rewritten: usize,
    /// Instances skipped by a late precondition check.
    pub skipped: usize,
}

impl PassStats {
    pub fn changed(&self) -> bool {
        self.rewritten > 0
    }
}

impl AddAssign for PassStats {
    fn add_assign(&mut self, other: Self) {
        self.matched += other.matched;
        self.rewritten += other.rewritten;
        self.skipped += other.skipped;
    }
}

/// Stats of every pass of one pipeline run, in execution order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineReport {
    pub passes: Vec<(String, PassStats)>,
}

impl PipelineReport {
    pub fn stats(&self, pass: &str) -> Option<PassStats> {
        self.passes
            .iter()
            .find(|(name, _)| name == pass)
            .map(|(_, stats)| *stats)
    }
}

/// An ordered list of passes, each run exactly once.
#[derive(Debug)]
pub struct PassPipeline {
    passes: Vec<Box<dyn GraphPass>>,
}

impl PassPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass in order on a copy of `graph` and return the copy.
    ///
    /// The copy is validated after each pass. On any error it is dropped
    /// and `scope` is left as it was, so callers keep their float model and
    /// never observe a partially rewritten one.
    pub fn run(
        &self,
        graph: &Graph,
        scope: &mut Scope,
    ) -> Result<(Graph, PipelineReport), QuantizeError> {
        let mut graph = graph.clone();
        let mut working = scope.clone();
        let mut report = PipelineReport::default();

        for pass in &self.passes {
            let stats = pass.run(&mut graph, &mut working)?;
            graph
                .validate()
                .map_err(|e| QuantizeError::structural(pass.name(), e))?;
            log::info!(
                "{}: matched {}, rewritten {}, skipped {}",
                pass.name(),
                stats.matched,
                stats.rewritten,
                stats.skipped
            );
            log::debug!("after {}:\n{}", pass.name(), dump_graph(&graph));
            report.passes.push((pass.name().to_string(), stats));
        }

        *scope = working;
        Ok((graph, report))
    }
}

/// Builds a [`PassPipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    passes: Vec<Box<dyn GraphPass>>,
}

impl PipelineBuilder {
    /// Append a pass.
    pub fn pass(mut self, pass: impl GraphPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Append an already boxed pass.
    pub fn boxed_pass(mut self, pass: Box<dyn GraphPass>) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn build(self) -> PassPipeline {
        PassPipeline {
            passes: self.passes,
        }
    }
}

/// Float-graph fusions to run before calibration: batch_norm folding, then
/// the conv2d and fc residual fusions.
pub fn fuse_pipeline() -> PassPipeline {
    PassPipeline::builder()
        .pass(ConvBnFusePass)
        .pass(ResidualFusePass::conv2d())
        .pass(ResidualFusePass::fc())
        .build()
}
