//! Error types for the qforge graph IR.

use crate::graph::NodeId;

/// Errors raised while mutating or validating a [`Graph`](crate::Graph).
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A node id does not refer to a live node.
    #[error("node {0} does not exist in the graph")]
    NodeNotFound(NodeId),

    /// An operator node was expected.
    #[error("node {0} is not an operator")]
    NotAnOp(NodeId),

    /// A variable node was expected.
    #[error("node {0} is not a variable")]
    NotAVar(NodeId),

    /// An edge that should exist does not.
    #[error("edge {from} -> {to} does not exist")]
    EdgeNotFound { from: NodeId, to: NodeId },

    /// An edge would connect two operators or two variables.
    #[error("edge {from} -> {to} must connect an operator and a variable")]
    NotBipartite { from: NodeId, to: NodeId },

    /// A node's adjacency list points at a node that has been removed.
    #[error("node {from} references missing node {to}")]
    DanglingEdge { from: NodeId, to: NodeId },

    /// An edge is recorded on only one of its endpoints.
    #[error("edge {from} -> {to} is only recorded on one side")]
    AsymmetricEdge { from: NodeId, to: NodeId },

    /// An operator description and its graph edges disagree about a variable.
    #[error("operator {op} ({op_type}) and its edges disagree about variable '{var}'")]
    DescMismatch {
        op: NodeId,
        op_type: String,
        var: String,
    },

    /// An operator slot does not hold the variable a rewrite expected to
    /// rebind. `slot` is `*` when every input slot was searched.
    #[error("operator {op} ({op_type}) does not bind '{var}' in slot {slot}")]
    SlotNotBound {
        op: NodeId,
        op_type: String,
        slot: String,
        var: String,
    },

    /// Two variable declarations share a name.
    #[error("variable '{0}' is declared more than once")]
    DuplicateVar(String),

    /// A variable is written by more than one operator.
    #[error("variable '{name}' has {count} producers")]
    MultipleProducers { name: String, count: usize },

    /// The graph is not acyclic.
    #[error("graph contains a cycle ({visited} of {total} nodes visited)")]
    Cycle { visited: usize, total: usize },
}
