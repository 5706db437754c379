//! Node predicates: a small combinator language evaluated against a single
//! node in the context of its graph.

use std::fmt;

use qforge_ir::{Attribute, Graph, Node};

/// A boolean test on one graph node.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Always true.
    Any,
    /// Node is an operator.
    IsOp,
    /// Node is a variable.
    IsVar,
    /// Node is an operator of this type.
    OpType(String),
    /// Node is an operator whose attribute equals the value.
    AttrEq { name: String, value: Attribute },
    /// Node is an operator that carries the attribute.
    HasAttr(String),
    /// Node is a variable with this persistability.
    Persistable(bool),
    /// Node is a variable read by some `op_type` operator through `slot`.
    InputOf { op_type: String, slot: String },
    /// Node is a variable written by some `op_type` operator through `slot`.
    OutputOf { op_type: String, slot: String },
    /// Node has exactly this many outgoing edges.
    OutDegree(usize),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn op_type(op_type: impl Into<String>) -> Self {
        Self::OpType(op_type.into())
    }

    pub fn attr_eq(name: impl Into<String>, value: impl Into<Attribute>) -> Self {
        Self::AttrEq {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn has_attr(name: impl Into<String>) -> Self {
        Self::HasAttr(name.into())
    }

    pub fn input_of(op_type: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::InputOf {
            op_type: op_type.into(),
            slot: slot.into(),
        }
    }

    pub fn output_of(op_type: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::OutputOf {
            op_type: op_type.into(),
            slot: slot.into(),
        }
    }

    /// Conjunction; nested `And`s are flattened.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), p) => {
                a.push(p);
                Self::And(a)
            }
            (p, Self::And(mut b)) => {
                b.insert(0, p);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Disjunction; nested `Or`s are flattened.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::Or(mut a), Self::Or(b)) => {
                a.extend(b);
                Self::Or(a)
            }
            (Self::Or(mut a), p) => {
                a.push(p);
                Self::Or(a)
            }
            (p, Self::Or(mut b)) => {
                b.insert(0, p);
                Self::Or(b)
            }
            (a, b) => Self::Or(vec![a, b]),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            p => Self::Not(Box::new(p)),
        }
    }

    /// Evaluate against `node`, which must belong to `graph`.
    pub fn eval(&self, graph: &Graph, node: &Node) -> bool {
        match self {
            Self::Any => true,
            Self::IsOp => node.is_op(),
            Self::IsVar => node.is_var(),
            Self::OpType(t) => node.op().is_some_and(|op| op.op_type == *t),
            Self::AttrEq { name, value } => node
                .op()
                .and_then(|op| op.attr(name))
                .is_some_and(|a| a == value),
            Self::HasAttr(name) => node.op().is_some_and(|op| op.has_attr(name)),
            Self::Persistable(p) => node.var().is_some_and(|v| v.persistable == *p),
            Self::InputOf { op_type, slot } => node.var().is_some_and(|var| {
                graph.consumers(node.id).iter().any(|&c| {
                    graph.op(c).is_ok_and(|op| {
                        op.op_type == *op_type && op.input(slot).contains(&var.name)
                    })
                })
            }),
            Self::OutputOf { op_type, slot } => node.var().is_some_and(|var| {
                graph.producers(node.id).iter().any(|&p| {
                    graph.op(p).is_ok_and(|op| {
                        op.op_type == *op_type && op.output(slot).contains(&var.name)
                    })
                })
            }),
            Self::OutDegree(n) => node.outputs.len() == *n,
            Self::And(ps) => ps.iter().all(|p| p.eval(graph, node)),
            Self::Or(ps) => ps.iter().any(|p| p.eval(graph, node)),
            Self::Not(p) => !p.eval(graph, node),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::IsOp => f.write_str("op"),
            Self::IsVar => f.write_str("var"),
            Self::OpType(t) => write!(f, "op_type == {t:?}"),
            Self::AttrEq { name, value } => write!(f, "{name} == {value}"),
            Self::HasAttr(name) => write!(f, "has({name})"),
            Self::Persistable(p) => write!(f, "persistable == {p}"),
            Self::InputOf { op_type, slot } => write!(f, "input_of({op_type}.{slot})"),
            Self::OutputOf { op_type, slot } => write!(f, "output_of({op_type}.{slot})"),
            Self::OutDegree(n) => write!(f, "out_degree == {n}"),
            Self::And(ps) => write_joined(f, ps, " && "),
            Self::Or(ps) => write_joined(f, ps, " || "),
            Self::Not(p) => write!(f, "!{p}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, ps: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, p) in ps.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{p}")?;
    }
    f.write_str(")")
}
