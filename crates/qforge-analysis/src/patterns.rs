//! Built-in patterns used by the quantization passes.

use crate::pattern::Pattern;
use crate::predicate::Predicate;

/// Role names shared by the built-in patterns.
pub mod roles {
    pub const OP: &str = "op";
    pub const INPUT: &str = "input";
    pub const WEIGHTS: &str = "weights";
    pub const BIAS: &str = "bias";
    pub const RESIDUAL: &str = "residual";
    pub const OUTPUT: &str = "output";

    pub const DEQUANT_IN: &str = "dequant_in";
    pub const DEQUANT: &str = "dequant";
    pub const DEQUANT_OUT: &str = "dequant_out";
    pub const QUANT: &str = "quant";
    pub const QUANT_OUT: &str = "quant_out";
    pub const NEXT_OP: &str = "next_op";

    pub const ADD: &str = "elementwise_add";
    pub const ADD_OTHER: &str = "add_other";
    pub const ADD_OUT: &str = "add_out";

    pub const CONV_OUT: &str = "conv_out";
    pub const BATCH_NORM: &str = "batch_norm";
    pub const BN_SCALE: &str = "bn_scale";
    pub const BN_BIAS: &str = "bn_bias";
    pub const BN_MEAN: &str = "bn_mean";
    pub const BN_VARIANCE: &str = "bn_variance";
    pub const BN_OUT: &str = "bn_out";
}

/// Optional group holding the bias role.
pub const WITH_BIAS: &str = "bias";
/// Optional group holding the residual role.
pub const WITH_RESIDUAL: &str = "residual";

/// Attribute marking operators the host selected for quantization.
pub const USE_QUANTIZER: &str = "use_quantizer";

/// Slot layout of an operator type the quantizer understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpSlots {
    pub op_type: &'static str,
    pub input: &'static str,
    pub weights: Option<&'static str>,
    pub bias: Option<&'static str>,
    pub residual: Option<&'static str>,
    pub output: &'static str,
}

pub const CONV2D: OpSlots = OpSlots {
    op_type: "conv2d",
    input: "Input",
    weights: Some("Filter"),
    bias: Some("Bias"),
    residual: Some("ResidualData"),
    output: "Output",
};

pub const FC: OpSlots = OpSlots {
    op_type: "fc",
    input: "Input",
    weights: Some("W"),
    bias: Some("Bias"),
    residual: Some("ResidualData"),
    output: "Out",
};

pub const POOL2D: OpSlots = OpSlots {
    op_type: "pool2d",
    input: "X",
    weights: None,
    bias: None,
    residual: None,
    output: "Out",
};

impl OpSlots {
    pub fn for_op_type(op_type: &str) -> Option<Self> {
        [CONV2D, FC, POOL2D]
            .into_iter()
            .find(|s| s.op_type == op_type)
    }
}

/// An operator marked `use_quantizer`, its input, weights (if the operator
/// type has any) and output, with optional `"bias"` and `"residual"`
/// groups. The target role is the operator.
pub fn quantizable_op(slots: &OpSlots) -> Pattern {
    let mut builder = Pattern::builder(format!("{}_quantize", slots.op_type), roles::OP)
        .node(
            roles::OP,
            Predicate::op_type(slots.op_type).and(Predicate::attr_eq(USE_QUANTIZER, true)),
        )
        .node(roles::INPUT, Predicate::IsVar)
        .node(roles::OUTPUT, Predicate::IsVar)
        .slot_edge(roles::INPUT, roles::OP, slots.input)
        .slot_edge(roles::OP, roles::OUTPUT, slots.output);

    if let Some(slot) = slots.weights {
        builder = builder
            .node(roles::WEIGHTS, Predicate::Persistable(true))
            .slot_edge(roles::WEIGHTS, roles::OP, slot);
    }
    if let Some(slot) = slots.bias {
        builder = builder
            .optional(WITH_BIAS, roles::BIAS, Predicate::Persistable(true))
            .slot_edge(roles::BIAS, roles::OP, slot);
    }
    if let Some(slot) = slots.residual {
        builder = builder
            .optional(WITH_RESIDUAL, roles::RESIDUAL, Predicate::IsVar)
            .slot_edge(roles::RESIDUAL, roles::OP, slot);
    }
    builder.build()
}

/// `dequant_in -> dequantize -> dequant_out -> quantize -> quant_out -> next_op`
/// where `dequant_out` feeds nothing but the quantize. Target: the quantize.
pub fn dequantize_quantize() -> Pattern {
    Pattern::builder("dequantize_quantize", roles::QUANT)
        .node(roles::DEQUANT_IN, Predicate::IsVar)
        .node(roles::DEQUANT, Predicate::op_type("dequantize"))
        .node(
            roles::DEQUANT_OUT,
            Predicate::IsVar.and(Predicate::OutDegree(1)),
        )
        .node(roles::QUANT, Predicate::op_type("quantize"))
        .node(roles::QUANT_OUT, Predicate::IsVar)
        .node(roles::NEXT_OP, Predicate::IsOp)
        .slot_edge(roles::DEQUANT_IN, roles::DEQUANT, "Input")
        .slot_edge(roles::DEQUANT, roles::DEQUANT_OUT, "Output")
        .slot_edge(roles::DEQUANT_OUT, roles::QUANT, "Input")
        .slot_edge(roles::QUANT, roles::QUANT_OUT, "Output")
        .edge(roles::QUANT_OUT, roles::NEXT_OP)
        .build()
}

/// An operator whose only consumer is an `elementwise_add`, which can take
/// the add's other operand as residual data. Target: the operator.
pub fn op_elementwise_add(slots: &OpSlots) -> Pattern {
    Pattern::builder(format!("{}_elementwise_add", slots.op_type), roles::OP)
        .node(
            roles::OP,
            Predicate::op_type(slots.op_type)
                .and(Predicate::attr_eq("fuse_residual_connection", true).negate()),
        )
        .node(roles::OUTPUT, Predicate::IsVar.and(Predicate::OutDegree(1)))
        .node(roles::ADD, Predicate::op_type("elementwise_add"))
        .node(roles::ADD_OTHER, Predicate::IsVar)
        .node(roles::ADD_OUT, Predicate::IsVar)
        .slot_edge(roles::OP, roles::OUTPUT, slots.output)
        .edge(roles::OUTPUT, roles::ADD)
        .edge(roles::ADD_OTHER, roles::ADD)
        .slot_edge(roles::ADD, roles::ADD_OUT, "Out")
        .build()
}

/// `conv2d -> conv_out -> batch_norm -> bn_out` where `conv_out` feeds
/// nothing but the batch_norm and every normalization parameter is
/// persistable. Target: the conv2d.
pub fn conv_batch_norm() -> Pattern {
    let mut builder = Pattern::builder("conv2d_batch_norm", roles::OP)
        .node(roles::OP, Predicate::op_type(CONV2D.op_type))
        .node(roles::WEIGHTS, Predicate::Persistable(true))
        .node(roles::CONV_OUT, Predicate::IsVar.and(Predicate::OutDegree(1)))
        .node(roles::BATCH_NORM, Predicate::op_type("batch_norm"))
        .node(roles::BN_OUT, Predicate::IsVar)
        .slot_edge(roles::WEIGHTS, roles::OP, "Filter")
        .slot_edge(roles::OP, roles::CONV_OUT, CONV2D.output)
        .slot_edge(roles::CONV_OUT, roles::BATCH_NORM, "X")
        .slot_edge(roles::BATCH_NORM, roles::BN_OUT, "Y");
    for (role, slot) in [
        (roles::BN_SCALE, "Scale"),
        (roles::BN_BIAS, "Bias"),
        (roles::BN_MEAN, "Mean"),
        (roles::BN_VARIANCE, "Variance"),
    ] {
        builder = builder
            .node(role, Predicate::Persistable(true))
            .slot_edge(role, roles::BATCH_NORM, slot);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternMatcher;
    use qforge_ir::{Graph, OpDesc, VarDesc};

    #[test]
    fn builtin_patterns_validate() {
        for slots in [CONV2D, FC, POOL2D] {
            quantizable_op(&slots).validate().unwrap();
        }
        dequantize_quantize().validate().unwrap();
        op_elementwise_add(&CONV2D).validate().unwrap();
        conv_batch_norm().validate().unwrap();
    }

    #[test]
    fn pool_pattern_has_no_groups() {
        assert!(quantizable_op(&POOL2D).groups().is_empty());
        assert_eq!(
            quantizable_op(&CONV2D).groups().into_iter().collect::<Vec<_>>(),
            [WITH_BIAS, WITH_RESIDUAL]
        );
    }

    #[test]
    fn slots_lookup() {
        assert_eq!(OpSlots::for_op_type("fc"), Some(FC));
        assert_eq!(OpSlots::for_op_type("relu"), None);
    }

    #[test]
    fn conv_requires_use_quantizer() {
        let mut graph = Graph::new();
        for name in ["x", "y", "y2"] {
            graph.add_var(VarDesc::new(name));
        }
        graph.add_var(VarDesc::new("w").persistable(true));
        graph.add_op_linked(
            OpDesc::new("conv2d")
                .with_input("Input", ["x"])
                .with_input("Filter", ["w"])
                .with_output("Output", ["y"]),
        );
        let marked = graph.add_op_linked(
            OpDesc::new("conv2d")
                .with_input("Input", ["y"])
                .with_input("Filter", ["w"])
                .with_output("Output", ["y2"])
                .with_attr(USE_QUANTIZER, true),
        );

        let pattern = quantizable_op(&CONV2D);
        let matches = PatternMatcher::new(&pattern, &[]).unwrap().find_all(&graph);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target(), marked);
        // weights are shared between both convolutions
        assert_eq!(matches[0].get(roles::WEIGHTS), graph.find_var("w"));
    }

    #[test]
    fn dequantize_quantize_matches_chain() {
        let mut graph = Graph::new();
        for name in ["a", "b", "c", "d"] {
            graph.add_var(VarDesc::new(name));
        }
        graph.add_op_linked(
            OpDesc::new("dequantize")
                .with_input("Input", ["a"])
                .with_output("Output", ["b"]),
        );
        let quant = graph.add_op_linked(
            OpDesc::new("quantize")
                .with_input("Input", ["b"])
                .with_output("Output", ["c"]),
        );
        let next = graph.add_op_linked(
            OpDesc::new("relu")
                .with_input("X", ["c"])
                .with_output("Out", ["d"]),
        );

        let pattern = dequantize_quantize();
        let matches = PatternMatcher::new(&pattern, &[]).unwrap().find_all(&graph);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target(), quant);
        assert_eq!(matches[0].get(roles::NEXT_OP), Some(next));
        assert_eq!(matches[0].get(roles::DEQUANT_IN), graph.find_var("a"));
    }
}
