//! Integration test: lift a linear program into a graph, dump it, and lower
//! it back.

use qforge_ir::*;

/// `x -> fc(W = w) -> h -> relu -> y`, with `h` and `y` left implicit.
fn fc_relu_program() -> ProgramDesc {
    ProgramDesc {
        vars: vec![
            VarDesc::new("x").with_shape(&[1, 4]),
            VarDesc::new("w").persistable(true),
        ],
        ops: vec![
            OpDesc::new("fc")
                .with_input("Input", ["x"])
                .with_input("W", ["w"])
                .with_output("Out", ["h"]),
            OpDesc::new("relu")
                .with_input("X", ["h"])
                .with_output("Out", ["y"]),
        ],
    }
}

#[test]
fn program_to_graph_dump() {
    let graph = Graph::from_program(&fc_relu_program()).unwrap();
    assert_eq!(graph.var_count(), 4);
    assert_eq!(graph.op_count(), 2);

    let expected = "\
graph {
  var #0 x: f32 [1, 4]
  var #1 w: f32 persistable
  var #3 h: f32
  var #5 y: f32
  op #2 fc(Input=[x], W=[w]) -> (Out=[h])
  op #4 relu(X=[h]) -> (Out=[y])
}";
    assert_eq!(dump_graph(&graph), expected);
}

#[test]
fn lowering_is_stable() {
    let graph = Graph::from_program(&fc_relu_program()).unwrap();
    let program = graph.to_program().unwrap();
    let names: Vec<&str> = program.vars.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["x", "w", "h", "y"]);
    assert_eq!(program.ops[0].op_type, "fc");

    let rebuilt = Graph::from_program(&program).unwrap();
    assert_eq!(rebuilt.to_program().unwrap(), program);
}

#[test]
fn duplicate_declaration_is_rejected() {
    let mut program = fc_relu_program();
    program.vars.push(VarDesc::new("x"));
    assert!(matches!(
        Graph::from_program(&program),
        Err(IrError::DuplicateVar(name)) if name == "x"
    ));
}

#[test]
fn second_writer_is_rejected() {
    let mut program = fc_relu_program();
    program.ops.push(
        OpDesc::new("scale")
            .with_input("X", ["x"])
            .with_output("Out", ["y"]),
    );
    assert!(matches!(
        Graph::from_program(&program),
        Err(IrError::MultipleProducers { count: 2, .. })
    ));
}

#[test]
fn cyclic_program_is_rejected() {
    let program = ProgramDesc {
        vars: Vec::new(),
        ops: vec![
            OpDesc::new("a").with_input("X", ["p"]).with_output("Out", ["q"]),
            OpDesc::new("b").with_input("X", ["q"]).with_output("Out", ["p"]),
        ],
    };
    assert!(matches!(
        Graph::from_program(&program),
        Err(IrError::Cycle { .. })
    ));
}
