//! Folds an `elementwise_add` that follows a conv2d or fc into the
//! operator's `ResidualData` input.

use qforge_analysis::patterns::{self, CONV2D, FC, OpSlots, roles};
use qforge_analysis::{Match, PatternMatcher};
use qforge_ir::{Graph, IrError, NodeId, Scope};

use crate::error::QuantizeError;
use crate::quantize::SkipReason;
use crate::{GraphPass, PassStats};

const FUSED: &str = "fuse_residual_connection";

/// `op -> out -> elementwise_add(out, other) -> sum` becomes
/// `op(residual = other) -> sum`.
#[derive(Debug)]
pub struct ResidualFusePass {
    name: String,
    slots: OpSlots,
}

struct Fusion {
    op: NodeId,
    op_out: NodeId,
    add: NodeId,
    other: NodeId,
    add_out: NodeId,
    residual_slot: &'static str,
}

impl ResidualFusePass {
    pub fn new(slots: OpSlots) -> Self {
        Self {
            name: format!("{}_elementwise_add_fuse", slots.op_type),
            slots,
        }
    }

    pub fn conv2d() -> Self {
        Self::new(CONV2D)
    }

    pub fn fc() -> Self {
        Self::new(FC)
    }

    fn check(&self, graph: &Graph, m: &Match) -> Result<Fusion, SkipReason> {
        if m.nodes().any(|id| !graph.contains(id)) {
            return Err(SkipReason::NodeRemoved);
        }
        let role = |r: &str| {
            m.get(r)
                .ok_or_else(|| SkipReason::PatternMismatch(format!("role '{r}' is not bound")))
        };
        let Some(residual_slot) = self.slots.residual else {
            return Err(SkipReason::PatternMismatch(format!(
                "{} has no residual input",
                self.slots.op_type
            )));
        };
        let fusion = Fusion {
            op: role(roles::OP)?,
            op_out: role(roles::OUTPUT)?,
            add: role(roles::ADD)?,
            other: role(roles::ADD_OTHER)?,
            add_out: role(roles::ADD_OUT)?,
            residual_slot,
        };

        let describe = |e: IrError| SkipReason::PatternMismatch(e.to_string());
        let op = graph.op(fusion.op).map_err(describe)?;
        if !op.input(residual_slot).is_empty() {
            return Err(SkipReason::PatternMismatch(
                "residual input already bound".into(),
            ));
        }
        if op.output(self.slots.output).len() != 1 {
            return Err(SkipReason::PatternMismatch(format!(
                "output slot {} must bind exactly one variable",
                self.slots.output
            )));
        }
        let add = graph.op(fusion.add).map_err(describe)?;
        if add.attr_int("axis").is_some_and(|axis| axis != -1) {
            return Err(SkipReason::PatternMismatch(
                "broadcasting add cannot become a residual".into(),
            ));
        }
        if add.input_names().count() != 2 || add.output_names().count() != 1 {
            return Err(SkipReason::PatternMismatch(
                "add must have two inputs and one output".into(),
            ));
        }
        Ok(fusion)
    }

    fn fuse(&self, graph: &mut Graph, f: &Fusion) -> Result<(), IrError> {
        let other = graph.var(f.other)?.name.clone();
        let op_out = graph.var(f.op_out)?.name.clone();
        let add_out = graph.var(f.add_out)?.name.clone();

        graph.unlink(f.other, f.add)?;
        graph.unlink(f.add, f.add_out)?;
        graph.remove_nodes(&[f.add, f.op_out])?;

        let op = graph.op_mut(f.op)?;
        op.set_input(f.residual_slot, [other]);
        op.set_attr(FUSED, true);
        graph.replace_op_output(f.op, self.slots.output, &op_out, &add_out)?;
        graph.link(f.other, f.op)?;
        graph.link(f.op, f.add_out)?;
        Ok(())
    }
}

impl GraphPass for ResidualFusePass {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph, _scope: &mut Scope) -> Result<PassStats, QuantizeError> {
        let pattern = patterns::op_elementwise_add(&self.slots);
        let matches = PatternMatcher::new(&pattern, &[])?.find_all(graph);

        let mut stats = PassStats {
            matched: matches.len(),
            ..PassStats::default()
        };
        for m in &matches {
            match self.check(graph, m) {
                Ok(fusion) => {
                    self.fuse(graph, &fusion)
                        .map_err(|e| QuantizeError::structural(&self.name, e))?;
                    stats.rewritten += 1;
                }
                Err(reason) => {
                    log::warn!("{}: skipping {}: {reason}", self.name, m.target());
                    stats.skipped += 1;
                }
            }
        }
        if stats.rewritten > 0 {
            log::info!(
                "fused {} {} + elementwise_add pair(s)",
                stats.rewritten,
                self.slots.op_type
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qforge_ir::{OpDesc, VarDesc};

    fn fc_add(axis: Option<i64>) -> Graph {
        let mut graph = Graph::new();
        for name in ["x", "y", "r", "z"] {
            graph.add_var(VarDesc::new(name));
        }
        graph.add_var(VarDesc::new("w").persistable(true));
        graph.add_op_linked(
            OpDesc::new("fc")
                .with_input("Input", ["x"])
                .with_input("W", ["w"])
                .with_output("Out", ["y"]),
        );
        let mut add = OpDesc::new("elementwise_add")
            .with_input("X", ["y"])
            .with_input("Y", ["r"])
            .with_output("Out", ["z"]);
        if let Some(axis) = axis {
            add = add.with_attr("axis", axis);
        }
        graph.add_op_linked(add);
        graph
    }

    #[test]
    fn add_becomes_residual() {
        let mut graph = fc_add(None);
        let stats = ResidualFusePass::fc()
            .run(&mut graph, &mut Scope::new())
            .unwrap();
        graph.validate().unwrap();
        assert_eq!(stats.rewritten, 1);

        assert!(graph.find_ops("elementwise_add").is_empty());
        assert!(graph.find_var("y").is_none());
        let fc = graph.op(graph.find_ops("fc")[0]).unwrap();
        assert_eq!(fc.input("ResidualData"), ["r".to_string()]);
        assert_eq!(fc.output("Out"), ["z".to_string()]);
        assert_eq!(fc.attr_bool(FUSED), Some(true));
    }

    #[test]
    fn broadcasting_add_is_kept() {
        let mut graph = fc_add(Some(1));
        let stats = ResidualFusePass::fc()
            .run(&mut graph, &mut Scope::new())
            .unwrap();
        assert_eq!(stats.rewritten, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(graph.find_ops("elementwise_add").len(), 1);
    }

    #[test]
    fn explicit_last_axis_is_fused() {
        let mut graph = fc_add(Some(-1));
        let stats = ResidualFusePass::fc()
            .run(&mut graph, &mut Scope::new())
            .unwrap();
        assert_eq!(stats.rewritten, 1);
    }

    #[test]
    fn shared_output_is_not_fused() {
        let mut graph = fc_add(None);
        graph.add_var(VarDesc::new("s"));
        graph.add_op_linked(
            OpDesc::new("softmax")
                .with_input("X", ["y"])
                .with_output("Out", ["s"]),
        );
        let stats = ResidualFusePass::fc()
            .run(&mut graph, &mut Scope::new())
            .unwrap();
        assert_eq!(stats.matched, 0);
    }

    #[test]
    fn conv_pass_ignores_fc() {
        let mut graph = fc_add(None);
        let pass = ResidualFusePass::conv2d();
        assert_eq!(pass.name(), "conv2d_elementwise_add_fuse");
        assert_eq!(pass.run(&mut graph, &mut Scope::new()).unwrap().matched, 0);
    }
}
