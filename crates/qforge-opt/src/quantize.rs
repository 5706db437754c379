//! Quantization rewriter.
//!
//! For every `use_quantizer` operator the rewriter inserts a `quantize`
//! in front of its input, a `dequantize` after its output, replaces float
//! weights and bias with integer tensors and marks the operator
//! `quantized`. Pattern variants run most specific first (bias and
//! residual, bias, residual, neither). The first variant that matches an
//! operator claims it, whether or not the rewrite goes ahead, so every
//! operator is counted once per run.
//!
//! Every precondition of a match, including all required scales, is
//! checked before the first mutation, so a skipped match leaves the graph
//! untouched.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use qforge_analysis::patterns::{self, CONV2D, FC, OpSlots, POOL2D, WITH_BIAS, WITH_RESIDUAL, roles};
use qforge_analysis::{Match, PatternMatcher};
use qforge_ir::{DataType, Graph, IrError, NodeId, OpDesc, Scope, Tensor, VarDesc};

use crate::error::QuantizeError;
use crate::scale::{ScaleEntry, ScaleTable, quantize_bias, quantize_weights};
use crate::{GraphPass, PassStats};

/// Attribute marking an operator the rewriter already processed.
pub const QUANTIZED: &str = "quantized";

/// Which optional sub-structures a rewrite handles.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct QuantizeVariant {
    pub with_bias: bool,
    pub with_residual: bool,
}

impl QuantizeVariant {
    pub const BIAS_RESIDUAL: Self = Self {
        with_bias: true,
        with_residual: true,
    };
    pub const BIAS: Self = Self {
        with_bias: true,
        with_residual: false,
    };
    pub const RESIDUAL: Self = Self {
        with_bias: false,
        with_residual: true,
    };
    pub const PLAIN: Self = Self {
        with_bias: false,
        with_residual: false,
    };

    /// Most specific first.
    pub const ALL: [Self; 4] = [Self::BIAS_RESIDUAL, Self::BIAS, Self::RESIDUAL, Self::PLAIN];

    /// Prefix of the variable names this variant synthesizes.
    pub fn prefix(self) -> &'static str {
        match (self.with_bias, self.with_residual) {
            (true, true) => "b_r_",
            (true, false) => "b_",
            (false, true) => "r_",
            (false, false) => "",
        }
    }

    fn groups(self) -> Vec<&'static str> {
        let mut groups = Vec::new();
        if self.with_bias {
            groups.push(WITH_BIAS);
        }
        if self.with_residual {
            groups.push(WITH_RESIDUAL);
        }
        groups
    }

    /// Whether operators with this slot layout can have the variant's
    /// optional inputs at all.
    pub fn applies_to(self, slots: &OpSlots) -> bool {
        (!self.with_bias || slots.bias.is_some()) && (!self.with_residual || slots.residual.is_some())
    }
}

impl fmt::Display for QuantizeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match (self.with_bias, self.with_residual) {
            (true, true) => "bias+residual",
            (true, false) => "bias",
            (false, true) => "residual",
            (false, false) => "plain",
        })
    }
}

/// Operators already claimed by a variant during one pass run.
#[derive(Debug, Default)]
pub struct VisitedSet(HashSet<NodeId>);

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `id` was already present.
    pub fn insert(&mut self, id: NodeId) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a match was left alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// A node bound by the match was removed by an earlier rewrite.
    NodeRemoved,
    /// The operator carries the `quantized` marker.
    AlreadyQuantized,
    /// The named tensor has no entry in the scale table.
    MissingScale(String),
    /// A late structural or data precondition failed.
    PatternMismatch(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeRemoved => f.write_str("matched node no longer exists"),
            Self::AlreadyQuantized => f.write_str("already quantized"),
            Self::MissingScale(tensor) => write!(f, "no scale for tensor '{tensor}'"),
            Self::PatternMismatch(why) => f.write_str(why),
        }
    }
}

/// A persistable input that will be replaced by an integer tensor.
struct Replacement {
    var: NodeId,
    name: String,
    slot: &'static str,
    tensor: Tensor,
}

/// Everything a rewrite needs, gathered before the first mutation.
struct Plan {
    op: NodeId,
    input: NodeId,
    output: NodeId,
    input_scale: ScaleEntry,
    weights_scale: Option<f32>,
    accumulator_scale: f32,
    weights: Option<Replacement>,
    bias: Option<Replacement>,
    residual: Option<(NodeId, ScaleEntry)>,
}

/// Rewrites conv2d, fc and pool2d operators to int8.
#[derive(Debug)]
pub struct CpuQuantizePass {
    scales: Arc<ScaleTable>,
    op_types: Vec<OpSlots>,
}

impl CpuQuantizePass {
    pub const NAME: &'static str = "cpu_quantize";

    pub fn new(scales: Arc<ScaleTable>) -> Self {
        Self::with_op_types(scales, vec![CONV2D, FC, POOL2D])
    }

    pub fn with_op_types(scales: Arc<ScaleTable>, op_types: Vec<OpSlots>) -> Self {
        Self { scales, op_types }
    }

    pub fn scales(&self) -> &ScaleTable {
        &self.scales
    }

    /// Rewrite every instance of one variant of one operator type.
    ///
    /// Operators already in `visited` were claimed by a more specific
    /// variant and are not counted again. Every remaining match is claimed
    /// here, rewritten or skipped.
    pub fn quantize_variant(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        slots: &OpSlots,
        variant: QuantizeVariant,
        visited: &mut VisitedSet,
    ) -> Result<PassStats, QuantizeError> {
        let pattern = patterns::quantizable_op(slots);
        let matcher = PatternMatcher::new(&pattern, &variant.groups())?;
        let matches: Vec<Match> = matcher
            .find_all(graph)
            .into_iter()
            .filter(|m| !visited.contains(m.target()))
            .collect();

        let mut stats = PassStats {
            matched: matches.len(),
            ..PassStats::default()
        };
        for m in &matches {
            visited.insert(m.target());
            match self.check(graph, scope, m, slots, variant) {
                Ok(plan) => {
                    apply(graph, scope, &plan, slots, variant)
                        .map_err(|e| QuantizeError::structural(Self::NAME, e))?;
                    stats.rewritten += 1;
                }
                Err(reason) => {
                    stats.skipped += 1;
                    match reason {
                        SkipReason::AlreadyQuantized | SkipReason::NodeRemoved => log::debug!(
                            "{} {}: skipping {}: {reason}",
                            slots.op_type,
                            variant,
                            m.target()
                        ),
                        _ => log::warn!(
                            "{} {}: skipping {}: {reason}",
                            slots.op_type,
                            variant,
                            m.target()
                        ),
                    }
                }
            }
        }

        if stats.matched > 0 {
            log::info!(
                "quantized {} of {} {} pattern(s) ({variant})",
                stats.rewritten,
                stats.matched,
                slots.op_type
            );
        }
        Ok(stats)
    }

    /// Late precondition checks. Nothing is mutated here.
    fn check(
        &self,
        graph: &Graph,
        scope: &Scope,
        m: &Match,
        slots: &OpSlots,
        variant: QuantizeVariant,
    ) -> Result<Plan, SkipReason> {
        if m.nodes().any(|id| !graph.contains(id)) {
            return Err(SkipReason::NodeRemoved);
        }
        let op_id = m.target();
        let op = graph.op(op_id).map_err(mismatch)?;
        if op.attr_bool(QUANTIZED) == Some(true) {
            return Err(SkipReason::AlreadyQuantized);
        }
        if !variant.with_bias && slots.bias.is_some_and(|s| !op.input(s).is_empty()) {
            return Err(SkipReason::PatternMismatch(
                "operator has a bias this variant does not quantize".into(),
            ));
        }
        if !variant.with_residual && slots.residual.is_some_and(|s| !op.input(s).is_empty()) {
            return Err(SkipReason::PatternMismatch(
                "operator has residual data this variant does not quantize".into(),
            ));
        }

        let (input, input_name) = bound_var(graph, op, m, roles::INPUT)?;
        let (output, _) = bound_var(graph, op, m, roles::OUTPUT)?;
        if op.output(slots.output).len() != 1 {
            return Err(SkipReason::PatternMismatch(format!(
                "output slot {} must bind exactly one variable",
                slots.output
            )));
        }
        let input_scale = self.scale(&input_name)?;

        let mut weights_scale = None;
        let weights = match slots.weights {
            Some(slot) => {
                let (var, name) = bound_var(graph, op, m, roles::WEIGHTS)?;
                let scale = self.scale(&name)?.scale;
                let values = float_data(scope, &name)?;
                weights_scale = Some(scale);
                Some(Replacement {
                    var,
                    slot,
                    tensor: Tensor::from_i8(
                        values.dims.clone(),
                        quantize_weights(float_values(values), scale),
                    ),
                    name,
                })
            }
            None => None,
        };
        let accumulator_scale = input_scale.scale * weights_scale.unwrap_or(1.0);

        let bias = match (variant.with_bias, slots.bias) {
            (true, Some(slot)) => {
                let (var, name) = bound_var(graph, op, m, roles::BIAS)?;
                let values = float_data(scope, &name)?;
                Some(Replacement {
                    var,
                    slot,
                    tensor: Tensor::from_i32(
                        values.dims.clone(),
                        quantize_bias(float_values(values), accumulator_scale),
                    ),
                    name,
                })
            }
            _ => None,
        };

        let residual = if variant.with_residual {
            let (var, name) = bound_var(graph, op, m, roles::RESIDUAL)?;
            Some((var, self.scale(&name)?))
        } else {
            None
        };

        Ok(Plan {
            op: op_id,
            input,
            output,
            input_scale,
            weights_scale,
            accumulator_scale,
            weights,
            bias,
            residual,
        })
    }

    fn scale(&self, tensor: &str) -> Result<ScaleEntry, SkipReason> {
        self.scales
            .get(tensor)
            .ok_or_else(|| SkipReason::MissingScale(tensor.to_string()))
    }
}

impl GraphPass for CpuQuantizePass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, scope: &mut Scope) -> Result<PassStats, QuantizeError> {
        let mut visited = VisitedSet::new();
        let mut total = PassStats::default();
        for slots in &self.op_types {
            for variant in QuantizeVariant::ALL {
                if variant.applies_to(slots) {
                    total += self.quantize_variant(graph, scope, slots, variant, &mut visited)?;
                }
            }
        }
        Ok(total)
    }
}

fn mismatch(e: IrError) -> SkipReason {
    SkipReason::PatternMismatch(e.to_string())
}

/// The variable bound to `role`, which the operator must read or write
/// through exactly one slot position.
fn bound_var(
    graph: &Graph,
    op: &OpDesc,
    m: &Match,
    role: &str,
) -> Result<(NodeId, String), SkipReason> {
    let id = m
        .get(role)
        .ok_or_else(|| SkipReason::PatternMismatch(format!("role '{role}' is not bound")))?;
    let name = graph.var(id).map_err(mismatch)?.name.clone();
    let uses = op
        .input_names()
        .chain(op.output_names())
        .filter(|n| *n == name)
        .count();
    if uses != 1 {
        return Err(SkipReason::PatternMismatch(format!(
            "variable '{name}' is bound to {uses} slot positions"
        )));
    }
    Ok((id, name))
}

fn float_data<'s>(scope: &'s Scope, name: &str) -> Result<&'s Tensor, SkipReason> {
    scope
        .get(name)
        .filter(|t| t.as_f32().is_some())
        .ok_or_else(|| SkipReason::PatternMismatch(format!("'{name}' holds no f32 tensor")))
}

fn float_values(tensor: &Tensor) -> &[f32] {
    tensor.as_f32().unwrap_or_default()
}

/// `<prefix><pass>_<role>_<op id>`, suffixed if already taken.
fn synth_name(graph: &Graph, prefix: &str, role: &str, op: NodeId) -> String {
    let base = format!("{prefix}{}_{role}_{}", CpuQuantizePass::NAME, op.0);
    let mut name = base.clone();
    let mut n = 1;
    while graph.find_var(&name).is_some() {
        name = format!("{base}.{n}");
        n += 1;
    }
    name
}

fn apply(
    graph: &mut Graph,
    scope: &mut Scope,
    plan: &Plan,
    slots: &OpSlots,
    variant: QuantizeVariant,
) -> Result<(), IrError> {
    let prefix = variant.prefix();

    let name = synth_name(graph, prefix, "input_q", plan.op);
    insert_quantize(graph, plan.input, plan.op, slots.input, plan.input_scale, name)?;

    let name = synth_name(graph, prefix, "output_acc", plan.op);
    let acc_dtype = if plan.weights.is_some() {
        DataType::I32
    } else if plan.input_scale.sign.is_signed() {
        DataType::I8
    } else {
        DataType::U8
    };
    insert_dequantize(
        graph,
        plan.op,
        plan.output,
        slots.output,
        plan.accumulator_scale,
        name,
        acc_dtype,
    )?;

    if let Some(weights) = &plan.weights {
        let name = synth_name(graph, prefix, "weights", plan.op);
        replace_persistable(graph, scope, plan.op, weights, name)?;
    }
    if let Some(bias) = &plan.bias {
        let name = synth_name(graph, prefix, "bias", plan.op);
        replace_persistable(graph, scope, plan.op, bias, name)?;
    }
    if let (Some((residual, entry)), Some(slot)) = (plan.residual, slots.residual) {
        let name = synth_name(graph, prefix, "residual_q", plan.op);
        insert_quantize(graph, residual, plan.op, slot, entry, name)?;
    }

    let op = graph.op_mut(plan.op)?;
    op.set_attr(QUANTIZED, true);
    op.set_attr("Scale_in", plan.input_scale.scale);
    if let Some(scale) = plan.weights_scale {
        op.set_attr("Scale_weights", scale);
    }
    if let Some((_, entry)) = plan.residual {
        op.set_attr("Scale_in_eltwise", entry.scale);
    }
    Ok(())
}

/// `src -> op` becomes `src -> quantize -> out -> op`.
fn insert_quantize(
    graph: &mut Graph,
    src: NodeId,
    op: NodeId,
    slot: &str,
    entry: ScaleEntry,
    out_name: String,
) -> Result<NodeId, IrError> {
    let src_name = graph.var(src)?.name.clone();
    graph.unlink(src, op)?;

    let dtype = if entry.sign.is_signed() {
        DataType::I8
    } else {
        DataType::U8
    };
    let out = graph.add_var(VarDesc::new(&out_name).with_dtype(dtype));
    let quant = graph.add_op(
        OpDesc::new("quantize")
            .with_input("Input", [&src_name])
            .with_output("Output", [&out_name])
            .with_attr("Scale", entry.scale)
            .with_attr("is_negative_input", entry.sign.is_signed()),
    );
    graph.link(src, quant)?;
    graph.link(quant, out)?;
    graph.link(out, op)?;
    graph.replace_op_input(op, slot, &src_name, &out_name)?;
    Ok(quant)
}

/// `op -> dst` becomes `op -> acc -> dequantize -> dst`.
fn insert_dequantize(
    graph: &mut Graph,
    op: NodeId,
    dst: NodeId,
    slot: &str,
    scale: f32,
    acc_name: String,
    acc_dtype: DataType,
) -> Result<NodeId, IrError> {
    let dst_name = graph.var(dst)?.name.clone();
    graph.unlink(op, dst)?;

    let acc = graph.add_var(VarDesc::new(&acc_name).with_dtype(acc_dtype));
    let dequant = graph.add_op(
        OpDesc::new("dequantize")
            .with_input("Input", [&acc_name])
            .with_output("Output", [&dst_name])
            .with_attr("Scale", scale),
    );
    graph.link(op, acc)?;
    graph.link(acc, dequant)?;
    graph.link(dequant, dst)?;
    graph.replace_op_output(op, slot, &dst_name, &acc_name)?;
    Ok(dequant)
}

/// Bind a new persistable variable holding `replacement.tensor` in place of
/// the float one; the float variable is dropped once nothing reads it.
fn replace_persistable(
    graph: &mut Graph,
    scope: &mut Scope,
    op: NodeId,
    replacement: &Replacement,
    new_name: String,
) -> Result<(), IrError> {
    let old = graph.var(replacement.var)?.clone();
    graph.unlink(replacement.var, op)?;

    let new = graph.add_var(VarDesc {
        name: new_name.clone(),
        persistable: true,
        shape: old.shape,
        dtype: replacement.tensor.dtype(),
    });
    scope.insert(new_name.clone(), replacement.tensor.clone());
    graph.link(new, op)?;
    graph.replace_op_input(op, replacement.slot, &replacement.name, &new_name)?;

    if graph.consumers(replacement.var).is_empty() && graph.producer(replacement.var).is_none() {
        graph.remove_nodes(&[replacement.var])?;
        scope.remove(&old.name);
    }
    Ok(())
}
