//! Human-readable dump of a graph, used in debug logs and test failures.

use std::fmt::Write;

use crate::desc::OpDesc;
use crate::graph::{Graph, NodeId};

/// Render `graph` as text: variables first, then operators in execution
/// order (id order if the graph is not acyclic).
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::from("graph {\n");

    for (id, var) in graph.vars() {
        let _ = write!(out, "  var {id} {}: {}", var.name, var.dtype);
        if !var.shape.is_empty() {
            let _ = write!(out, " {:?}", var.shape);
        }
        if var.persistable {
            out.push_str(" persistable");
        }
        out.push('\n');
    }

    let order: Vec<NodeId> = graph
        .topological_ops()
        .unwrap_or_else(|_| graph.ops().map(|(id, _)| id).collect());
    for id in order {
        if let Ok(op) = graph.op(id) {
            let _ = writeln!(out, "  op {id} {}", format_op(op));
        }
    }

    out.push('}');
    out
}

/// `type(Slot=[a, b], ...) -> (Slot=[c]) {attr=value, ...}`
pub fn format_op(op: &OpDesc) -> String {
    let slots = |slots: &std::collections::BTreeMap<String, Vec<String>>| {
        slots
            .iter()
            .map(|(slot, vars)| format!("{slot}=[{}]", vars.join(", ")))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut s = format!(
        "{}({}) -> ({})",
        op.op_type,
        slots(&op.inputs),
        slots(&op.outputs)
    );
    if !op.attrs.is_empty() {
        let attrs: Vec<String> = op
            .attrs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        let _ = write!(s, " {{{}}}", attrs.join(", "));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::VarDesc;

    #[test]
    fn dump_lists_vars_and_ops() {
        let mut graph = Graph::new();
        graph.add_var(VarDesc::new("x").with_shape(&[1, 8]));
        graph.add_var(VarDesc::new("w").persistable(true));
        graph.add_var(VarDesc::new("y"));
        graph.add_op_linked(
            OpDesc::new("fc")
                .with_input("Input", ["x"])
                .with_input("W", ["w"])
                .with_output("Out", ["y"])
                .with_attr("use_quantizer", true),
        );

        let text = dump_graph(&graph);
        assert!(text.contains("var #0 x: f32 [1, 8]"));
        assert!(text.contains("var #1 w: f32 persistable"));
        assert!(text.contains("op #3 fc(Input=[x], W=[w]) -> (Out=[y]) {use_quantizer=true}"));
    }
}
