//! Cancels `dequantize -> quantize` pairs left between two quantized
//! operators.

use qforge_analysis::patterns::{self, roles};
use qforge_analysis::{Match, PatternMatcher};
use qforge_ir::{Graph, IrError, NodeId, OpDesc, Scope};

use crate::error::QuantizeError;
use crate::quantize::SkipReason;
use crate::{GraphPass, PassStats};

/// Removes a dequantize/quantize round trip on an int8 flow.
///
/// With equal scales the int8 producer is spliced straight into the matched
/// consumer. With different scales the pair becomes one `requantize`
/// carrying both scales. Other consumers of the quantize output are left
/// alone in the equal-scale case.
#[derive(Debug, Default)]
pub struct CpuQuantizeSquashPass;

struct Pair {
    dequant_in: NodeId,
    dequant: NodeId,
    dequant_out: NodeId,
    quant: NodeId,
    quant_out: NodeId,
    next_op: NodeId,
    scale_dequant: f32,
    scale_quant: f32,
    negative: bool,
}

impl CpuQuantizeSquashPass {
    pub const NAME: &'static str = "cpu_quantize_squash";

    fn check(graph: &Graph, m: &Match) -> Result<Pair, SkipReason> {
        if m.nodes().any(|id| !graph.contains(id)) {
            return Err(SkipReason::NodeRemoved);
        }
        let role = |r: &str| {
            m.get(r)
                .ok_or_else(|| SkipReason::PatternMismatch(format!("role '{r}' is not bound")))
        };
        let pair = Pair {
            dequant_in: role(roles::DEQUANT_IN)?,
            dequant: role(roles::DEQUANT)?,
            dequant_out: role(roles::DEQUANT_OUT)?,
            quant: role(roles::QUANT)?,
            quant_out: role(roles::QUANT_OUT)?,
            next_op: role(roles::NEXT_OP)?,
            scale_dequant: 0.0,
            scale_quant: 0.0,
            negative: false,
        };
        if graph.consumers(pair.dequant_out) != [pair.quant] {
            return Err(SkipReason::PatternMismatch(
                "dequantize output has other readers".into(),
            ));
        }
        if !graph.has_edge(pair.quant_out, pair.next_op) {
            return Err(SkipReason::PatternMismatch(
                "consumer no longer reads the quantize output".into(),
            ));
        }

        let scale = |id: NodeId| -> Result<f32, SkipReason> {
            graph
                .op(id)
                .ok()
                .and_then(|op| op.attr_float("Scale"))
                .ok_or_else(|| SkipReason::PatternMismatch(format!("{id} has no Scale")))
        };
        let negative = graph
            .op(pair.quant)
            .ok()
            .and_then(|op| op.attr_bool("is_negative_input"))
            .unwrap_or(false);
        Ok(Pair {
            scale_dequant: scale(pair.dequant)?,
            scale_quant: scale(pair.quant)?,
            negative,
            ..pair
        })
    }

    fn splice(graph: &mut Graph, pair: &Pair) -> Result<(), IrError> {
        let from = graph.var(pair.quant_out)?.name.clone();
        let to = graph.var(pair.dequant_in)?.name.clone();
        graph.unlink(pair.quant_out, pair.next_op)?;
        graph.link(pair.dequant_in, pair.next_op)?;
        graph.rename_op_input(pair.next_op, &from, &to)?;

        if graph.consumers(pair.quant_out).is_empty() {
            graph.remove_nodes(&[pair.dequant, pair.dequant_out, pair.quant, pair.quant_out])?;
        }
        Ok(())
    }

    fn requantize(graph: &mut Graph, pair: &Pair) -> Result<(), IrError> {
        let input = graph.var(pair.dequant_in)?.name.clone();
        let output = graph.var(pair.quant_out)?.name.clone();
        graph.remove_nodes(&[pair.dequant, pair.dequant_out, pair.quant])?;

        let requant = graph.add_op(
            OpDesc::new("requantize")
                .with_input("Input", [input])
                .with_output("Output", [output])
                .with_attr("Scale_dequant", pair.scale_dequant)
                .with_attr("Scale_quant", pair.scale_quant)
                .with_attr("is_negative_input", pair.negative),
        );
        graph.link(pair.dequant_in, requant)?;
        graph.link(requant, pair.quant_out)?;
        Ok(())
    }
}

impl GraphPass for CpuQuantizeSquashPass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _scope: &mut Scope) -> Result<PassStats, QuantizeError> {
        let pattern = patterns::dequantize_quantize();
        let matches = PatternMatcher::new(&pattern, &[])?.find_all(graph);

        let mut stats = PassStats {
            matched: matches.len(),
            ..PassStats::default()
        };
        for m in &matches {
            let pair = match Self::check(graph, m) {
                Ok(pair) => pair,
                Err(reason) => {
                    log::warn!("{}: skipping {}: {reason}", Self::NAME, m.target());
                    stats.skipped += 1;
                    continue;
                }
            };
            let result = if pair.scale_dequant == pair.scale_quant {
                Self::splice(graph, &pair)
            } else {
                Self::requantize(graph, &pair)
            };
            result.map_err(|e| QuantizeError::structural(Self::NAME, e))?;
            stats.rewritten += 1;
        }

        if stats.matched > 0 {
            log::info!(
                "squashed {} of {} dequantize/quantize pair(s)",
                stats.rewritten,
                stats.matched
            );
        }
        Ok(stats)
    }
}
