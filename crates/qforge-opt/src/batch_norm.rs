//! Folds an inference-mode `batch_norm` that follows a conv2d into the
//! convolution's filter and bias.
//!
//! With `alpha = scale / sqrt(variance + epsilon)` per output channel, the
//! filter rows are multiplied by `alpha` and the bias becomes
//! `(bias - mean) * alpha + bn_bias`, where a conv2d without a bias counts
//! as a zero bias and gets a fresh persistable one.

use qforge_analysis::patterns::{self, CONV2D, roles};
use qforge_analysis::{Match, PatternMatcher};
use qforge_ir::{Graph, IrError, NodeId, Scope, Tensor, VarDesc};

use crate::error::QuantizeError;
use crate::quantize::SkipReason;
use crate::{GraphPass, PassStats};

/// Used when the batch_norm carries no `epsilon` attribute.
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// `conv2d -> conv_out -> batch_norm -> bn_out` becomes `conv2d -> bn_out`.
#[derive(Debug, Default)]
pub struct ConvBnFusePass;

/// Where the folded bias goes.
enum BiasTarget {
    /// Overwrite the tensor of the conv2d's own bias.
    Existing(String),
    /// Bind a new persistable variable to the conv2d's bias slot.
    Fresh,
}

struct Fold {
    conv: NodeId,
    conv_out: NodeId,
    bn: NodeId,
    bn_out: NodeId,
    filter_name: String,
    filter: Tensor,
    bias_target: BiasTarget,
    bias: Tensor,
    /// Statistics outputs and parameters only the batch_norm used.
    doomed: Vec<NodeId>,
}

impl ConvBnFusePass {
    pub const NAME: &'static str = "conv_bn_fuse";

    fn check(graph: &Graph, scope: &Scope, m: &Match) -> Result<Fold, SkipReason> {
        if m.nodes().any(|id| !graph.contains(id)) {
            return Err(SkipReason::NodeRemoved);
        }
        let role = |r: &str| {
            m.get(r)
                .ok_or_else(|| SkipReason::PatternMismatch(format!("role '{r}' is not bound")))
        };
        let describe = |e: IrError| SkipReason::PatternMismatch(e.to_string());
        let conv = role(roles::OP)?;
        let weights = role(roles::WEIGHTS)?;
        let conv_out = role(roles::CONV_OUT)?;
        let bn = role(roles::BATCH_NORM)?;
        let bn_out = role(roles::BN_OUT)?;

        let conv_desc = graph.op(conv).map_err(describe)?;
        if let Some(slot) = CONV2D.residual
            && !conv_desc.input(slot).is_empty()
        {
            return Err(SkipReason::PatternMismatch(
                "conv2d already adds residual data".into(),
            ));
        }
        if conv_desc.input("Filter").len() != 1 || conv_desc.output(CONV2D.output).len() != 1 {
            return Err(SkipReason::PatternMismatch(
                "conv2d must bind exactly one filter and one output".into(),
            ));
        }
        let bn_desc = graph.op(bn).map_err(describe)?;
        if bn_desc.attr_bool("is_test") == Some(false) {
            return Err(SkipReason::PatternMismatch(
                "training-mode batch_norm uses batch statistics".into(),
            ));
        }
        if bn_desc.input("X").len() != 1 || bn_desc.output("Y").len() != 1 {
            return Err(SkipReason::PatternMismatch(
                "batch_norm must read one input and write one output".into(),
            ));
        }
        let epsilon = bn_desc.attr_float("epsilon").unwrap_or(DEFAULT_EPSILON);

        if graph.consumers(weights) != [conv] {
            return Err(SkipReason::PatternMismatch(
                "filter is shared with another operator".into(),
            ));
        }
        let filter_name = graph.var(weights).map_err(describe)?.name.clone();
        let filter = f32_tensor(scope, &filter_name)?;
        let channels = filter.dims.first().copied().unwrap_or(0);
        if channels == 0 || filter.numel() % channels != 0 {
            return Err(SkipReason::PatternMismatch(format!(
                "filter '{filter_name}' has no output channel dimension"
            )));
        }

        let scale = channel_values(graph, scope, role(roles::BN_SCALE)?, channels)?;
        let shift = channel_values(graph, scope, role(roles::BN_BIAS)?, channels)?;
        let mean = channel_values(graph, scope, role(roles::BN_MEAN)?, channels)?;
        let variance = channel_values(graph, scope, role(roles::BN_VARIANCE)?, channels)?;

        let mut alpha = Vec::with_capacity(channels);
        for c in 0..channels {
            let a = scale[c] / (variance[c] + epsilon).sqrt();
            if !a.is_finite() {
                return Err(SkipReason::PatternMismatch(format!(
                    "channel {c} has no finite normalization factor"
                )));
            }
            alpha.push(a);
        }

        let (bias_target, old_bias) = match conv_desc.input("Bias") {
            [] => (BiasTarget::Fresh, vec![0.0; channels]),
            [name] => {
                let id = graph.find_var(name).ok_or_else(|| {
                    SkipReason::PatternMismatch(format!("bias '{name}' is not declared"))
                })?;
                if !graph.var(id).map_err(describe)?.persistable || graph.consumers(id) != [conv] {
                    return Err(SkipReason::PatternMismatch(format!(
                        "bias '{name}' is not a private persistable tensor"
                    )));
                }
                let values = channel_values(graph, scope, id, channels)?;
                (BiasTarget::Existing(name.clone()), values.to_vec())
            }
            _ => {
                return Err(SkipReason::PatternMismatch(
                    "conv2d binds more than one bias".into(),
                ));
            }
        };

        let per_channel = filter.numel() / channels;
        let folded_filter: Vec<f32> = float_values(filter)
            .chunks(per_channel)
            .zip(&alpha)
            .flat_map(|(row, &a)| row.iter().map(move |w| w * a))
            .collect();
        let folded_bias: Vec<f32> = (0..channels)
            .map(|c| (old_bias[c] - mean[c]) * alpha[c] + shift[c])
            .collect();

        let y = bn_desc.output("Y")[0].as_str();
        let mut doomed = Vec::new();
        for name in bn_desc.output_names().filter(|n| *n != y) {
            let id = graph.find_var(name).ok_or_else(|| {
                SkipReason::PatternMismatch(format!("'{name}' is not declared"))
            })?;
            if !graph.consumers(id).is_empty() {
                return Err(SkipReason::PatternMismatch(format!(
                    "batch_norm output '{name}' is read elsewhere"
                )));
            }
            doomed.push(id);
        }
        for r in [roles::BN_SCALE, roles::BN_BIAS, roles::BN_MEAN, roles::BN_VARIANCE] {
            let id = role(r)?;
            if graph.consumers(id) == [bn] {
                doomed.push(id);
            }
        }

        Ok(Fold {
            conv,
            conv_out,
            bn,
            bn_out,
            filter: Tensor::from_f32(filter.dims.clone(), folded_filter),
            filter_name,
            bias_target,
            bias: Tensor::from_f32(vec![channels], folded_bias),
            doomed,
        })
    }

    fn fold(graph: &mut Graph, scope: &mut Scope, f: Fold) -> Result<(), IrError> {
        scope.insert(f.filter_name, f.filter);
        match f.bias_target {
            BiasTarget::Existing(name) => {
                scope.insert(name, f.bias);
            }
            BiasTarget::Fresh => {
                let name = fresh_name(graph, f.conv);
                let var = graph.add_var(
                    VarDesc::new(&name)
                        .persistable(true)
                        .with_shape(&[f.bias.numel() as i64]),
                );
                scope.insert(name.clone(), f.bias);
                graph.link(var, f.conv)?;
                graph.op_mut(f.conv)?.set_input("Bias", [name]);
            }
        }

        let conv_out = graph.var(f.conv_out)?.name.clone();
        let bn_out = graph.var(f.bn_out)?.name.clone();
        let dropped: Vec<String> = f
            .doomed
            .iter()
            .map(|&id| graph.var(id).map(|v| v.name.clone()))
            .collect::<Result<_, _>>()?;

        let mut remove = vec![f.bn, f.conv_out];
        remove.extend(&f.doomed);
        graph.remove_nodes(&remove)?;
        for name in &dropped {
            scope.remove(name);
        }

        graph.replace_op_output(f.conv, CONV2D.output, &conv_out, &bn_out)?;
        graph.link(f.conv, f.bn_out)?;
        Ok(())
    }
}

impl GraphPass for ConvBnFusePass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, scope: &mut Scope) -> Result<PassStats, QuantizeError> {
        let pattern = patterns::conv_batch_norm();
        let matches = PatternMatcher::new(&pattern, &[])?.find_all(graph);

        let mut stats = PassStats {
            matched: matches.len(),
            ..PassStats::default()
        };
        for m in &matches {
            match Self::check(graph, scope, m) {
                Ok(fold) => {
                    Self::fold(graph, scope, fold)
                        .map_err(|e| QuantizeError::structural(Self::NAME, e))?;
                    stats.rewritten += 1;
                }
                Err(reason) => {
                    log::warn!("{}: skipping {}: {reason}", Self::NAME, m.target());
                    stats.skipped += 1;
                }
            }
        }
        if stats.rewritten > 0 {
            log::info!("folded {} batch_norm(s) into conv2d", stats.rewritten);
        }
        Ok(stats)
    }
}

fn f32_tensor<'s>(scope: &'s Scope, name: &str) -> Result<&'s Tensor, SkipReason> {
    scope
        .get(name)
        .filter(|t| t.as_f32().is_some())
        .ok_or_else(|| SkipReason::PatternMismatch(format!("'{name}' holds no f32 tensor")))
}

fn float_values(tensor: &Tensor) -> &[f32] {
    tensor.as_f32().unwrap_or_default()
}

/// The f32 data of variable `id`, which must hold one value per channel.
fn channel_values<'s>(
    graph: &Graph,
    scope: &'s Scope,
    id: NodeId,
    channels: usize,
) -> Result<&'s [f32], SkipReason> {
    let name = &graph
        .var(id)
        .map_err(|e| SkipReason::PatternMismatch(e.to_string()))?
        .name;
    let values = float_values(f32_tensor(scope, name)?);
    if values.len() != channels {
        return Err(SkipReason::PatternMismatch(format!(
            "'{name}' has {} values for {channels} output channels",
            values.len()
        )));
    }
    Ok(values)
}

fn fresh_name(graph: &Graph, conv: NodeId) -> String {
    let base = format!("{}_bias_{}", ConvBnFusePass::NAME, conv.0);
    let mut name = base.clone();
    let mut n = 1;
    while graph.find_var(&name).is_some() {
        name = format!("{base}.{n}");
        n += 1;
    }
    name
}
